//! External authentication and authorization authority.
//!
//! pfpstatus holds no user database. Remote callers present a bearer token
//! which is reviewed by an [`Authority`]: first "who is this"
//! ([`Authority::review_token`]), then "may they do this"
//! ([`Authority::review_access`]).
//!
//! [`KubeAuthority`] implements the trait against a Kubernetes API server
//! using `TokenReview` and `SubjectAccessReview` objects.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AuthorityError, ConfigError, Result};

/// Default timeout for one authority request.
pub const DEFAULT_AUTHORITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Mount point of the in-cluster service account credentials.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const TOKEN_REVIEW_PATH: &str = "/apis/authentication.k8s.io/v1/tokenreviews";
const ACCESS_REVIEW_PATH: &str = "/apis/authorization.k8s.io/v1/subjectaccessreviews";

/// Identity attached to a reviewed token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// User name.
    #[serde(default)]
    pub username: String,
    /// Unique user id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Groups the user belongs to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Additional claims.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Outcome of a token review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenReviewStatus {
    /// Whether the token identifies a known user.
    #[serde(default)]
    pub authenticated: bool,
    /// The identified user, meaningful only when authenticated.
    #[serde(default)]
    pub user: UserInfo,
    /// Error reported by the authority, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// The resource/verb pair an access review asks about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAttributes {
    /// API group of the resource.
    pub group: String,
    /// Resource name.
    pub resource: String,
    /// Verb being checked.
    pub verb: String,
}

/// An access review question: may `user` perform `resource_attributes`?
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessReviewSpec {
    /// What is being accessed.
    pub resource_attributes: ResourceAttributes,
    /// User name.
    pub user: String,
    /// Unique user id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Groups of the user.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Additional claims of the user.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl AccessReviewSpec {
    /// Asks whether `user` may perform `resource_attributes`.
    pub fn new(user: &UserInfo, resource_attributes: ResourceAttributes) -> Self {
        Self {
            resource_attributes,
            user: user.username.clone(),
            uid: user.uid.clone(),
            groups: user.groups.clone(),
            extra: user.extra.clone(),
        }
    }
}

/// Outcome of an access review.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessReviewStatus {
    /// Whether the access is allowed.
    #[serde(default)]
    pub allowed: bool,
    /// Whether the access is explicitly denied.
    #[serde(default)]
    pub denied: bool,
    /// Human readable reason for the decision.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Error met while evaluating, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub evaluation_error: String,
}

/// Answers identity and permission questions on behalf of pfpstatus.
///
/// Errors mean the authority could not be asked; a negative answer is a
/// successful review with `authenticated` or `allowed` set to false.
pub trait Authority: Send + Sync {
    /// Reviews a bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if the authority cannot be reached or answers badly.
    fn review_token(&self, token: &str) -> Result<TokenReviewStatus>;

    /// Reviews an access request.
    ///
    /// # Errors
    ///
    /// Returns an error if the authority cannot be reached or answers badly.
    fn review_access(&self, spec: &AccessReviewSpec) -> Result<AccessReviewStatus>;
}

/// Connection settings for a Kubernetes API server.
#[derive(Clone)]
pub struct KubeAuthorityConfig {
    /// Base URL, e.g. `https://10.0.0.1:443`.
    pub api_server: String,
    /// Bearer token pfpstatus authenticates itself with.
    pub token: Option<String>,
    /// PEM bundle used to verify the API server certificate.
    pub ca_pem: Option<Vec<u8>>,
    /// Timeout for each review request.
    pub timeout: Duration,
}

impl std::fmt::Debug for KubeAuthorityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeAuthorityConfig")
            .field("api_server", &self.api_server)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("ca_pem", &self.ca_pem.as_ref().map(Vec::len))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl KubeAuthorityConfig {
    /// Creates a config for `api_server` with no credentials and the default timeout.
    pub fn new(api_server: impl Into<String>) -> Self {
        Self {
            api_server: api_server.into(),
            token: None,
            ca_pem: None,
            timeout: DEFAULT_AUTHORITY_TIMEOUT,
        }
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the CA bundle.
    #[must_use]
    pub fn with_ca_pem(mut self, pem: Vec<u8>) -> Self {
        self.ca_pem = Some(pem);
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reads the bearer token from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ReadFile`] if the file cannot be read.
    pub fn with_token_file(self, path: &Path) -> Result<Self> {
        let token = read_file(path)?;
        Ok(self.with_token(String::from_utf8_lossy(&token).trim().to_string()))
    }

    /// Reads the CA bundle from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ReadFile`] if the file cannot be read.
    pub fn with_ca_file(self, path: &Path) -> Result<Self> {
        let pem = read_file(path)?;
        Ok(self.with_ca_pem(pem))
    }

    /// Builds the config a pod uses to reach its own cluster.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnv`] outside a cluster, or
    /// [`ConfigError::ReadFile`] if the service account files are missing.
    pub fn in_cluster() -> Result<Self> {
        let host = required_env("KUBERNETES_SERVICE_HOST")?;
        let port = required_env("KUBERNETES_SERVICE_PORT")?;
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };
        let dir = PathBuf::from(SERVICE_ACCOUNT_DIR);
        Self::new(format!("https://{host}:{port}"))
            .with_token_file(&dir.join("token"))?
            .with_ca_file(&dir.join("ca.crt"))
    }
}

fn required_env(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnv {
            name: name.to_string(),
        }
        .into()),
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| {
        ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        }
        .into()
    })
}

/// Envelope of a review object as sent to the API server.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewRequest<'a, S> {
    api_version: &'static str,
    kind: &'static str,
    spec: &'a S,
}

/// Envelope of a review object as returned by the API server.
#[derive(Deserialize)]
struct ReviewResponse<S> {
    #[serde(default)]
    status: S,
}

#[derive(Serialize)]
struct TokenReviewSpec<'a> {
    token: &'a str,
}

/// [`Authority`] backed by a Kubernetes API server.
#[derive(Debug)]
pub struct KubeAuthority {
    config: KubeAuthorityConfig,
    client: reqwest::blocking::Client,
}

impl KubeAuthority {
    /// Creates the HTTP client for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorityError::InvalidCertificate`] if the CA bundle is not
    /// valid PEM and [`AuthorityError::ClientCreate`] if the client cannot be
    /// built.
    pub fn new(config: KubeAuthorityConfig) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder().timeout(config.timeout);
        if let Some(pem) = &config.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|source| AuthorityError::InvalidCertificate { source })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|source| AuthorityError::ClientCreate { source })?;
        Ok(Self { config, client })
    }

    /// Returns the configuration in use.
    pub fn config(&self) -> &KubeAuthorityConfig {
        &self.config
    }

    /// POSTs a review object and decodes the status of the answer.
    fn post<S: Serialize, R: DeserializeOwned + Default>(
        &self,
        path: &str,
        api_version: &'static str,
        kind: &'static str,
        spec: &S,
    ) -> Result<R> {
        let url = format!("{}{}", self.config.api_server.trim_end_matches('/'), path);
        let mut request = self.client.post(&url).json(&ReviewRequest {
            api_version,
            kind,
            spec,
        });
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let resp = request
            .send()
            .map_err(|source| AuthorityError::RequestFailed { source })?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().unwrap_or_default();
            return Err(AuthorityError::HttpStatus { status, body }.into());
        }
        let review: ReviewResponse<R> = resp
            .json()
            .map_err(|source| AuthorityError::Decode { source })?;
        Ok(review.status)
    }
}

impl Authority for KubeAuthority {
    fn review_token(&self, token: &str) -> Result<TokenReviewStatus> {
        self.post(
            TOKEN_REVIEW_PATH,
            "authentication.k8s.io/v1",
            "TokenReview",
            &TokenReviewSpec { token },
        )
    }

    fn review_access(&self, spec: &AccessReviewSpec) -> Result<AccessReviewStatus> {
        self.post(
            ACCESS_REVIEW_PATH,
            "authorization.k8s.io/v1",
            "SubjectAccessReview",
            spec,
        )
    }
}
