//! Integration tests for the HTTP exposure layer.
//!
//! A full [`setup`] is served on an ephemeral loopback port and queried with
//! a real HTTP client. Remote callers are simulated by feeding requests with
//! a non-loopback peer address straight into the pipeline.

use pfpstatus::authority::{AccessReviewSpec, AccessReviewStatus, TokenReviewStatus, UserInfo};
use pfpstatus::{
    Authority, Collector, Params, RecordedStatus, Request, Status, TokenBearerAuth, setup,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Authority that trusts one token and counts how often it is asked.
#[derive(Default)]
struct SingleTokenAuthority {
    calls: AtomicUsize,
}

impl Authority for SingleTokenAuthority {
    fn review_token(&self, token: &str) -> pfpstatus::Result<TokenReviewStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TokenReviewStatus {
            authenticated: token == "sesame",
            user: UserInfo {
                username: "debugger".to_string(),
                ..UserInfo::default()
            },
            error: String::new(),
        })
    }

    fn review_access(&self, _spec: &AccessReviewSpec) -> pfpstatus::Result<AccessReviewStatus> {
        Ok(AccessReviewStatus {
            allowed: true,
            ..AccessReviewStatus::default()
        })
    }
}

fn start(authority: Option<Arc<SingleTokenAuthority>>) -> Collector {
    let mut params = Params::default();
    params.storage.enabled = false;
    params.http.enabled = true;
    params.http.host = "127.0.0.1".to_string();
    params.http.port = 0;
    if let Some(authority) = authority {
        params
            .http
            .middlewares
            .push(TokenBearerAuth::new(authority).middleware());
    }
    setup(params).unwrap().unwrap()
}

fn feed(collector: &Collector, statuses: Vec<Status>) {
    let expected = statuses.len();
    let sender = collector.sender();
    for status in statuses {
        sender.send(status).unwrap();
    }
    let env = Arc::clone(collector.env());
    while env.lock().unwrap().len() < expected {
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn url(collector: &Collector, path: &str) -> String {
    format!("http://{}{path}", collector.http_addr().unwrap())
}

#[test]
fn test_summary_and_node_endpoints() {
    let collector = start(None);
    feed(
        &collector,
        vec![
            Status::new("nodeA").with_expected("e1").with_computed("e1"),
            Status::new("nodeA").with_expected("e2").with_computed("c2"),
            Status::new("nodeB").with_expected("e1"),
        ],
    );

    let resp = reqwest::blocking::get(url(&collector, "/pfpstatus")).unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("application/json"));
    let summary: serde_json::Value = resp.json().unwrap();
    assert_eq!(summary, serde_json::json!({ "nodes": 2 }));

    let resp = reqwest::blocking::get(url(&collector, "/pfpstatus/nodeA")).unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let entries: Vec<RecordedStatus> = resp.json().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].status.fingerprint_computed, "c2");
    assert!(entries[0].record_time <= entries[1].record_time);

    collector.shutdown();
}

#[test]
fn test_unknown_and_empty_nodes_are_unprocessable() {
    let collector = start(None);

    let resp = reqwest::blocking::get(url(&collector, "/pfpstatus/ghost")).unwrap();
    assert_eq!(resp.status().as_u16(), 422);
    assert_eq!(resp.text().unwrap(), "unknown node name\n");

    let resp = reqwest::blocking::get(url(&collector, "/pfpstatus/")).unwrap();
    assert_eq!(resp.status().as_u16(), 422);
    assert_eq!(resp.text().unwrap(), "missing node name\n");

    let resp = reqwest::blocking::get(url(&collector, "/metrics")).unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    collector.shutdown();
}

#[test]
fn test_loopback_callers_skip_authentication() {
    let authority = Arc::new(SingleTokenAuthority::default());
    let collector = start(Some(Arc::clone(&authority)));
    feed(&collector, vec![Status::new("nodeA").with_expected("e1")]);

    let resp = reqwest::blocking::get(url(&collector, "/pfpstatus/nodeA")).unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(authority.calls.load(Ordering::SeqCst), 0);

    collector.shutdown();
}

#[test]
fn test_remote_callers_need_a_token() {
    let authority = Arc::new(SingleTokenAuthority::default());
    let collector = start(Some(Arc::clone(&authority)));
    feed(&collector, vec![Status::new("nodeA").with_expected("e1")]);

    // same pipeline as the server, fed with a remote peer address
    let middlewares = [TokenBearerAuth::new(Arc::clone(&authority) as Arc<dyn Authority>).middleware()];
    let handler = pfpstatus::http::pipeline(Arc::clone(collector.env()), &middlewares);
    let remote = "10.0.0.7:40000".parse().unwrap();

    let resp = handler.handle(&Request::get("/pfpstatus/nodeA", remote));
    assert_eq!(resp.status, 401);
    assert_eq!(authority.calls.load(Ordering::SeqCst), 0);

    let resp = handler
        .handle(&Request::get("/pfpstatus/nodeA", remote).with_header("Authorization", "Bearer wrong"));
    assert_eq!(resp.status, 401);

    let resp = handler
        .handle(&Request::get("/pfpstatus/nodeA", remote).with_header("authorization", "Bearer sesame"));
    assert_eq!(resp.status, 200);
    let entries: Vec<RecordedStatus> = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(authority.calls.load(Ordering::SeqCst), 2);

    collector.shutdown();
}

/// Sends `raw` as-is and returns the status line of the reply.
fn raw_exchange(collector: &Collector, raw: &[u8]) -> String {
    use std::io::{Read, Write};

    let mut stream = std::net::TcpStream::connect(collector.http_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(raw).unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    String::from_utf8_lossy(&reply)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}

#[test]
fn test_non_utf8_request_gets_bad_request() {
    let collector = start(None);

    let status = raw_exchange(
        &collector,
        b"GET /pfpstatus/\xff\xfe HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert_eq!(status, "HTTP/1.1 400 Bad Request");

    let status = raw_exchange(
        &collector,
        b"GET /pfpstatus HTTP/1.1\r\nX-Name: \xc3\x28\r\n\r\n",
    );
    assert_eq!(status, "HTTP/1.1 400 Bad Request");

    collector.shutdown();
}

#[test]
fn test_oversized_head_is_not_dispatched() {
    let authority = Arc::new(SingleTokenAuthority::default());
    let collector = start(Some(Arc::clone(&authority)));

    let mut raw = b"GET /pfpstatus HTTP/1.1\r\nX-Pad: ".to_vec();
    raw.extend(std::iter::repeat_n(b'a', 20 * 1024));
    raw.extend_from_slice(b"\r\nAuthorization: Bearer sesame\r\n\r\n");

    let status = raw_exchange(&collector, &raw);
    assert_eq!(status, "HTTP/1.1 431 Request Header Fields Too Large");
    assert_eq!(authority.calls.load(Ordering::SeqCst), 0);

    collector.shutdown();
}
