//! Local HTTP service stand-in
//!
//! Records every request it receives and answers with a configurable
//! status, headers and body. It can also echo the request target back or
//! stall before answering, which is how local timeouts are provoked.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;

/// A request as the local service saw it
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    /// Path and query
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct Behavior {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    delay: Duration,
    echo_uri: bool,
}

#[derive(Default)]
struct MockState {
    requests: RwLock<Vec<RecordedRequest>>,
    behavior: RwLock<Option<Behavior>>,
}

pub struct MockHttpService {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockHttpService {
    /// Start on an ephemeral port, answering `200 OK` by default
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(MockState::default());
        *state.behavior.write() = Some(Behavior {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: b"OK".to_vec(),
            delay: Duration::ZERO,
            echo_uri: false,
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(respond(&state, req).await) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Base URL, e.g. `http://127.0.0.1:12345`
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.read().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.state.requests.read().last().cloned()
    }

    pub fn set_response_status(&self, status: StatusCode) {
        self.update(|b| b.status = status);
    }

    pub fn set_response_body(&self, body: impl Into<Vec<u8>>) {
        let body = body.into();
        self.update(move |b| b.body = body);
    }

    pub fn add_response_header(&self, name: impl Into<String>, value: impl Into<String>) {
        let header = (name.into(), value.into());
        self.update(move |b| b.headers.push(header));
    }

    /// Wait this long before answering
    pub fn set_delay(&self, delay: Duration) {
        self.update(|b| b.delay = delay);
    }

    /// Answer with the request's path and query as the body
    pub fn set_echo_uri(&self, echo: bool) {
        self.update(|b| b.echo_uri = echo);
    }

    fn update(&self, f: impl FnOnce(&mut Behavior)) {
        if let Some(behavior) = self.state.behavior.write().as_mut() {
            f(behavior);
        }
    }
}

async fn respond(state: &MockState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().to_string();
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes().to_vec())
        .unwrap_or_default();

    state.requests.write().push(RecordedRequest {
        method,
        uri: uri.clone(),
        headers,
        body,
    });

    let (status, headers, body, delay, echo_uri) = match state.behavior.read().as_ref() {
        Some(b) => (b.status, b.headers.clone(), b.body.clone(), b.delay, b.echo_uri),
        None => (StatusCode::OK, Vec::new(), Vec::new(), Duration::ZERO, false),
    };

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let body = if echo_uri { uri.into_bytes() } else { body };
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder.body(Full::new(Bytes::from(body))).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_and_answers() {
        let service = MockHttpService::start().await;
        service.set_response_status(StatusCode::CREATED);
        service.set_response_body("created");

        let resp = reqwest::Client::new()
            .post(format!("{}/items?x=1", service.url()))
            .header("X-Test", "1")
            .body("payload")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 201);
        assert_eq!(resp.text().await.unwrap(), "created");

        let recorded = service.last_request().unwrap();
        assert_eq!(recorded.method, "POST");
        assert_eq!(recorded.uri, "/items?x=1");
        assert_eq!(recorded.header("x-test"), Some("1"));
        assert_eq!(recorded.body, b"payload");
    }

    #[tokio::test]
    async fn test_mock_echo() {
        let service = MockHttpService::start().await;
        service.set_echo_uri(true);

        let body = reqwest::get(format!("{}/a/b?c=d", service.url()))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "/a/b?c=d");
    }
}
