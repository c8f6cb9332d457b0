//! Bearer token middleware backed by an external [`Authority`].
//!
//! Loopback callers are served directly: the collector and an agent on the
//! same host are trusted without a token. Everybody else must present
//! `Authorization: Bearer <token>`; the token is reviewed by the authority,
//! then the identity it maps to must be allowed the debug verb on node
//! resource topologies. Any authority failure fails the request; nothing is
//! retried.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::authority::{AccessReviewSpec, Authority, ResourceAttributes};
use crate::http::{Handler, Middleware, Request, Response};

/// API group of the resource guarding the debug endpoints.
pub const DEBUG_RESOURCE_GROUP: &str = "topology.node.k8s.io";
/// Resource guarding the debug endpoints.
pub const DEBUG_RESOURCE: &str = "noderesourcetopologies";
/// Verb a caller must be allowed to read fingerprint status.
pub const DEBUG_VERB: &str = "sched.openshift-kni.io/debug";

/// Name under which the middleware is registered.
pub const MIDDLEWARE_NAME: &str = "token-bearer-auth";

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No usable credentials, or credentials the authority rejected.
    Unauthorized(&'static str),
    /// Authenticated, but not allowed.
    Forbidden,
    /// The authority could not be asked.
    InternalError,
}

impl AuthFailure {
    /// Returns the HTTP status code for this failure.
    pub fn status(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::Forbidden => 403,
            Self::InternalError => 500,
        }
    }

    /// Returns the plain-text response for this failure.
    pub fn response(&self) -> Response {
        match self {
            Self::Unauthorized(reason) => {
                Response::text(self.status(), &format!("Unauthorized: {reason}"))
            }
            Self::Forbidden => Response::text(self.status(), "Forbidden"),
            Self::InternalError => Response::text(self.status(), "Internal Server Error"),
        }
    }
}

/// Authenticates and authorizes non-loopback callers.
#[derive(Clone)]
pub struct TokenBearerAuth {
    authority: Arc<dyn Authority>,
}

impl fmt::Debug for TokenBearerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBearerAuth").finish_non_exhaustive()
    }
}

impl TokenBearerAuth {
    /// Creates the middleware logic around `authority`.
    pub fn new(authority: Arc<dyn Authority>) -> Self {
        Self { authority }
    }

    /// Wraps `next` so it only runs for trusted callers.
    pub fn link(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(Authenticated {
            auth: self.clone(),
            next,
        })
    }

    /// Packages this middleware for [`crate::config::HttpParams::middlewares`].
    pub fn middleware(self) -> Middleware {
        Middleware::new(MIDDLEWARE_NAME, move |next| self.link(next))
    }

    /// Checks the `Authorization` header value of a remote request.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthFailure`] the request must be answered with.
    pub fn check(&self, authorization: Option<&str>) -> Result<(), AuthFailure> {
        let token = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .filter(|token| !token.is_empty())
            .ok_or(AuthFailure::Unauthorized("Missing Authorization Header"))?;

        let review = self.authority.review_token(token).map_err(|e| {
            tracing::debug!(error = %e, "performing token review");
            AuthFailure::InternalError
        })?;
        if !review.authenticated {
            tracing::debug!("token authentication failed");
            return Err(AuthFailure::Unauthorized("Invalid token"));
        }
        let user = review.user;
        tracing::debug!(user = %user.username, "token authenticated");

        let spec = AccessReviewSpec::new(
            &user,
            ResourceAttributes {
                group: DEBUG_RESOURCE_GROUP.to_string(),
                resource: DEBUG_RESOURCE.to_string(),
                verb: DEBUG_VERB.to_string(),
            },
        );
        let access = self.authority.review_access(&spec).map_err(|e| {
            tracing::debug!(error = %e, "checking access review");
            AuthFailure::InternalError
        })?;
        if !access.allowed {
            tracing::debug!(user = %user.username, reason = %access.reason, "request denied");
            return Err(AuthFailure::Forbidden);
        }

        tracing::debug!(user = %user.username, "request allowed");
        Ok(())
    }
}

/// A handler guarded by [`TokenBearerAuth`].
struct Authenticated {
    auth: TokenBearerAuth,
    next: Arc<dyn Handler>,
}

impl Handler for Authenticated {
    fn handle(&self, request: &Request) -> Response {
        if is_loopback(&request.remote_addr) {
            tracing::debug!(remote_addr = %request.remote_addr, "auth bypass for loopback request");
            return self.next.handle(request);
        }
        match self.auth.check(request.header("Authorization")) {
            Ok(()) => self.next.handle(request),
            Err(failure) => failure.response(),
        }
    }
}

/// Returns true if `addr` is a loopback address, IPv4-mapped ones included.
pub fn is_loopback(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_loopback(),
        IpAddr::V6(ip) => ip.is_loopback() || ip.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{AccessReviewStatus, TokenReviewStatus, UserInfo};
    use crate::error::{AuthorityError, Result};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Authority answering from fixed outcomes and counting calls.
    struct FakeAuthority {
        token: Option<TokenReviewStatus>,
        access: Option<AccessReviewStatus>,
        token_calls: AtomicUsize,
        last_access: Mutex<Option<AccessReviewSpec>>,
    }

    impl FakeAuthority {
        fn new(token: Option<TokenReviewStatus>, access: Option<AccessReviewStatus>) -> Arc<Self> {
            Arc::new(Self {
                token,
                access,
                token_calls: AtomicUsize::new(0),
                last_access: Mutex::new(None),
            })
        }
    }

    fn unreachable() -> crate::error::PfpStatusError {
        AuthorityError::HttpStatus {
            status: 503,
            body: "unavailable".to_string(),
        }
        .into()
    }

    impl Authority for FakeAuthority {
        fn review_token(&self, _token: &str) -> Result<TokenReviewStatus> {
            self.token_calls.fetch_add(1, Ordering::SeqCst);
            self.token.clone().ok_or_else(unreachable)
        }

        fn review_access(&self, spec: &AccessReviewSpec) -> Result<AccessReviewStatus> {
            *self.last_access.lock().unwrap() = Some(spec.clone());
            self.access.clone().ok_or_else(unreachable)
        }
    }

    fn alice() -> TokenReviewStatus {
        TokenReviewStatus {
            authenticated: true,
            user: UserInfo {
                username: "alice".to_string(),
                groups: vec!["sre".to_string()],
                ..UserInfo::default()
            },
            error: String::new(),
        }
    }

    fn allowed(allowed: bool) -> AccessReviewStatus {
        AccessReviewStatus {
            allowed,
            reason: "rbac".to_string(),
            ..AccessReviewStatus::default()
        }
    }

    fn guarded(authority: Arc<FakeAuthority>) -> Arc<dyn Handler> {
        let base: Arc<dyn Handler> = Arc::new(|_: &Request| Response::text(200, "ok"));
        TokenBearerAuth::new(authority).middleware().link(base)
    }

    fn remote_request() -> Request {
        Request::get("/pfpstatus", "192.168.1.20:51000".parse().unwrap())
    }

    #[test]
    fn test_loopback_bypasses_authority() {
        let authority = FakeAuthority::new(None, None);
        let handler = guarded(Arc::clone(&authority));

        for addr in ["127.0.0.1:1234", "[::1]:1234", "[::ffff:127.0.0.1]:1234"] {
            let resp = handler.handle(&Request::get("/pfpstatus", addr.parse().unwrap()));
            assert_eq!(resp.status, 200, "{addr}");
        }
        assert_eq!(authority.token_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_or_malformed_header_is_unauthorized() {
        let authority = FakeAuthority::new(Some(alice()), Some(allowed(true)));
        let handler = guarded(Arc::clone(&authority));

        assert_eq!(handler.handle(&remote_request()).status, 401);
        for value in ["Basic abc", "Bearer ", "bearer abc"] {
            let resp = handler.handle(&remote_request().with_header("Authorization", value));
            assert_eq!(resp.status, 401, "{value}");
            assert_eq!(resp.body_text(), "Unauthorized: Missing Authorization Header\n");
        }
        assert_eq!(authority.token_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_token_is_unauthorized() {
        let rejected = TokenReviewStatus::default();
        let handler = guarded(FakeAuthority::new(Some(rejected), Some(allowed(true))));
        let resp = handler.handle(&remote_request().with_header("Authorization", "Bearer nope"));
        assert_eq!(resp.status, 401);
        assert_eq!(resp.body_text(), "Unauthorized: Invalid token\n");
    }

    #[test]
    fn test_token_review_failure_is_internal_error() {
        let handler = guarded(FakeAuthority::new(None, Some(allowed(true))));
        let resp = handler.handle(&remote_request().with_header("Authorization", "Bearer t"));
        assert_eq!(resp.status, 500);
        assert_eq!(resp.body_text(), "Internal Server Error\n");
    }

    #[test]
    fn test_access_review_failure_is_internal_error() {
        let handler = guarded(FakeAuthority::new(Some(alice()), None));
        let resp = handler.handle(&remote_request().with_header("Authorization", "Bearer t"));
        assert_eq!(resp.status, 500);
    }

    #[test]
    fn test_denied_access_is_forbidden() {
        let handler = guarded(FakeAuthority::new(Some(alice()), Some(allowed(false))));
        let resp = handler.handle(&remote_request().with_header("Authorization", "Bearer t"));
        assert_eq!(resp.status, 403);
    }

    #[test]
    fn test_allowed_access_reaches_handler() {
        let authority = FakeAuthority::new(Some(alice()), Some(allowed(true)));
        let handler = guarded(Arc::clone(&authority));
        let resp = handler.handle(&remote_request().with_header("Authorization", "Bearer t"));
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_text(), "ok\n");

        let spec = authority.last_access.lock().unwrap().clone().unwrap();
        assert_eq!(spec.user, "alice");
        assert_eq!(spec.groups, ["sre"]);
        assert_eq!(spec.resource_attributes.group, DEBUG_RESOURCE_GROUP);
        assert_eq!(spec.resource_attributes.resource, DEBUG_RESOURCE);
        assert_eq!(spec.resource_attributes.verb, DEBUG_VERB);
    }

    #[test]
    fn test_is_loopback() {
        assert!(is_loopback(&"127.0.0.2:80".parse().unwrap()));
        assert!(!is_loopback(&"10.1.2.3:80".parse().unwrap()));
        assert!(!is_loopback(&"[2001:db8::1]:80".parse().unwrap()));
        assert!(!is_loopback(&"[::ffff:10.0.0.1]:80".parse().unwrap()));
    }
}
