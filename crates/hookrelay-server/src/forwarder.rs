use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use tokio::time::Instant;

use hookrelay_common::{is_hop_by_hop, TunnelError};
use hookrelay_protocol::{CorrelationId, ForwardRequest, ForwardResponse, Headers};

use crate::registry::ConnectionRegistry;

/// How long a caller waits for the tunnel client by default
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// An inbound webhook call, read in full
#[derive(Debug, Clone, Default)]
pub struct ParsedRequest {
    pub method: String,
    /// Path and query
    pub uri: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Sends webhook calls through the active tunnel connection and waits for
/// the matching response
pub struct Forwarder {
    registry: Arc<ConnectionRegistry>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(registry: Arc<ConnectionRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward one request and wait for its response
    ///
    /// Fails immediately with `NoClientConnected` when no tunnel client is
    /// attached. Cancelling the returned future releases the pending slot.
    pub async fn forward(&self, request: ParsedRequest) -> Result<ForwardResponse, TunnelError> {
        let conn = self
            .registry
            .current()
            .ok_or(TunnelError::NoClientConnected)?;

        let id = CorrelationId::generate();
        let mut pending = conn.register_waiter(id.clone())?;

        tracing::debug!(
            "Forwarding {} {} as {} over connection {}",
            request.method,
            request.uri,
            id,
            conn.id()
        );

        let frame = ForwardRequest {
            id: id.clone(),
            method: request.method,
            uri: request.uri,
            headers: request.headers,
            body: request.body,
        };

        // One deadline covers queueing behind a busy writer and the reply
        let sent_at = Instant::now();
        let exchange = async {
            if let Err(e) = conn.send(frame.into()).await {
                tracing::warn!("Failed to send {} to tunnel client: {}", id, e);
                return Err(e);
            }
            pending.recv().await
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                if e.is_fatal_to_connection() {
                    self.registry.invalidate(&conn, &e.to_string());
                }
                Err(e)
            }
            Err(_) => {
                // Nothing at all came back since we sent: treat the link as dead
                if conn.last_inbound() <= sent_at {
                    tracing::warn!(
                        "Connection {} silent for {:?}, dropping it",
                        conn.id(),
                        self.timeout
                    );
                    self.registry.invalidate(&conn, "no frames received before timeout");
                } else {
                    tracing::warn!("Timed out waiting for {} after {:?}", id, self.timeout);
                }
                Err(TunnelError::ForwardTimeout(self.timeout))
            }
        }
    }
}

/// Plain-text response with the given status
pub(crate) fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Map a forwarding failure onto the caller's response
pub fn error_response(err: &TunnelError) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    text_response(status, err.to_string())
}

/// Replay the client's response to the original caller
///
/// Status, headers and body are copied verbatim apart from hop-by-hop
/// headers. A response that cannot be expressed as HTTP becomes a 502.
pub fn render(response: ForwardResponse) -> Response<Full<Bytes>> {
    let status = match StatusCode::from_u16(response.status) {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!("Tunnel client sent invalid status {}", response.status);
            return text_response(StatusCode::BAD_GATEWAY, "Invalid response from tunnel client");
        }
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in response.headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name, value);
    }

    match builder.body(Full::new(Bytes::from(response.body))) {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::warn!("Tunnel client sent an invalid header: {}", e);
            text_response(StatusCode::BAD_GATEWAY, "Invalid response from tunnel client")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::establish;
    use futures_util::{SinkExt, StreamExt};
    use hookrelay_protocol::{Frame, FrameCodec};
    use http_body_util::BodyExt;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    fn attach_client(
        registry: &Arc<ConnectionRegistry>,
    ) -> Framed<DuplexStream, FrameCodec> {
        let (relay_side, client_side) = tokio::io::duplex(64 * 1024);
        establish(relay_side, "127.0.0.1:4".parse().unwrap(), registry.clone());
        Framed::new(client_side, FrameCodec::new())
    }

    fn request(uri: &str) -> ParsedRequest {
        ParsedRequest {
            method: "POST".to_string(),
            uri: uri.to_string(),
            headers: vec![("X-Test", "1")].into_iter().collect(),
            body: b"payload".to_vec(),
        }
    }

    fn reply_to(req: &ForwardRequest, status: u16, body: &str) -> Frame {
        ForwardResponse {
            id: req.id.clone(),
            status,
            headers: vec![("X-Echo-Uri", req.uri.as_str())].into_iter().collect(),
            body: body.as_bytes().to_vec(),
        }
        .into()
    }

    async fn next_request(client: &mut Framed<DuplexStream, FrameCodec>) -> ForwardRequest {
        match client.next().await {
            Some(Ok(Frame::ForwardRequest(req))) => req,
            other => panic!("Expected a forward request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_client_fails_immediately() {
        let forwarder = Forwarder::new(ConnectionRegistry::new(), Duration::from_secs(30));

        let result = tokio::time::timeout(Duration::from_millis(100), forwarder.forward(request("/")))
            .await
            .expect("must not wait for a client");
        assert!(matches!(result, Err(TunnelError::NoClientConnected)));
    }

    #[tokio::test]
    async fn test_forward_roundtrip() {
        let registry = ConnectionRegistry::new();
        let mut client = attach_client(&registry);
        let forwarder = Forwarder::new(registry.clone(), Duration::from_secs(5));

        let call = tokio::spawn(async move { forwarder.forward(request("/hook?a=1")).await });

        let req = next_request(&mut client).await;
        assert_eq!(req.method, "POST");
        assert_eq!(req.uri, "/hook?a=1");
        assert_eq!(req.headers.get("x-test"), Some("1"));
        assert_eq!(req.body, b"payload");
        client.send(reply_to(&req, 202, "accepted")).await.unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(response.body, b"accepted");
        assert_eq!(registry.current().unwrap().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_callers() {
        let registry = ConnectionRegistry::new();
        let mut client = attach_client(&registry);
        let forwarder = Arc::new(Forwarder::new(registry.clone(), Duration::from_secs(5)));

        let mut calls = Vec::new();
        for i in 0..3 {
            let forwarder = forwarder.clone();
            calls.push(tokio::spawn(async move {
                forwarder.forward(request(&format!("/call/{}", i))).await
            }));
        }

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(next_request(&mut client).await);
        }
        // Answer newest first
        for req in received.iter().rev() {
            client.send(reply_to(req, 200, &req.uri)).await.unwrap();
        }

        for (i, call) in calls.into_iter().enumerate() {
            let response = call.await.unwrap().unwrap();
            assert_eq!(response.body, format!("/call/{}", i).as_bytes());
        }
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_waiter_behind() {
        let registry = ConnectionRegistry::new();
        let mut client = attach_client(&registry);
        let forwarder = Forwarder::new(registry.clone(), Duration::from_millis(200));

        let result = forwarder.forward(request("/slow")).await;
        assert!(matches!(result, Err(TunnelError::ForwardTimeout(_))));

        // The client never answered anything, so the connection is considered stalled
        assert!(!registry.is_connected());

        // A response arriving now is simply dropped
        let req = next_request(&mut client).await;
        let _ = client.send(reply_to(&req, 200, "late")).await;
    }

    #[tokio::test]
    async fn test_full_outbound_queue_is_bounded_by_timeout() {
        use crate::connection::TunnelConnection;
        use tokio::sync::mpsc;

        let registry = ConnectionRegistry::new();
        // Nobody drains this queue, and it is already full
        let (tx, _rx) = mpsc::channel(1);
        let conn = TunnelConnection::new("127.0.0.1:5".parse().unwrap(), tx.clone());
        tx.try_send(
            ForwardResponse {
                id: CorrelationId::from("filler"),
                status: 200,
                headers: Headers::new(),
                body: Vec::new(),
            }
            .into(),
        )
        .unwrap();
        registry.register(conn.clone());

        let forwarder = Forwarder::new(registry.clone(), Duration::from_millis(200));
        let result = tokio::time::timeout(Duration::from_secs(2), forwarder.forward(request("/stuck")))
            .await
            .expect("forward must give up at its own deadline");

        assert!(matches!(result, Err(TunnelError::ForwardTimeout(_))));
        assert_eq!(conn.pending_count(), 0);
        assert!(!registry.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_on_live_connection_keeps_it() {
        let registry = ConnectionRegistry::new();
        let mut client = attach_client(&registry);
        let forwarder = Arc::new(Forwarder::new(registry.clone(), Duration::from_millis(300)));

        let slow = {
            let forwarder = forwarder.clone();
            tokio::spawn(async move { forwarder.forward(request("/slow")).await })
        };
        let fast = {
            let forwarder = forwarder.clone();
            tokio::spawn(async move { forwarder.forward(request("/fast")).await })
        };

        let first = next_request(&mut client).await;
        let second = next_request(&mut client).await;
        let fast_req = if first.uri == "/fast" { &first } else { &second };
        client.send(reply_to(fast_req, 200, "fast")).await.unwrap();

        assert_eq!(fast.await.unwrap().unwrap().status, 200);
        assert!(matches!(
            slow.await.unwrap(),
            Err(TunnelError::ForwardTimeout(_))
        ));
        assert!(registry.is_connected());
        assert_eq!(registry.current().unwrap().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_forward_releases_its_slot() {
        let registry = ConnectionRegistry::new();
        let mut client = attach_client(&registry);
        let forwarder = Arc::new(Forwarder::new(registry.clone(), Duration::from_secs(30)));

        let call = {
            let forwarder = forwarder.clone();
            tokio::spawn(async move { forwarder.forward(request("/abandoned")).await })
        };
        let _req = next_request(&mut client).await;
        assert_eq!(registry.current().unwrap().pending_count(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(registry.current().unwrap().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_client_disconnect_fails_pending_forward() {
        let registry = ConnectionRegistry::new();
        let mut client = attach_client(&registry);
        let forwarder = Forwarder::new(registry.clone(), Duration::from_secs(30));

        let call = tokio::spawn(async move { forwarder.forward(request("/x")).await });
        let _req = next_request(&mut client).await;
        drop(client);

        assert!(matches!(
            call.await.unwrap(),
            Err(TunnelError::Transport(_))
        ));
        assert!(!registry.is_connected());
    }

    #[tokio::test]
    async fn test_render_copies_response() {
        let headers: Headers = vec![
            ("Set-Cookie", "a=1"),
            ("Set-Cookie", "b=2"),
            ("Connection", "close"),
            ("Content-Type", "application/json"),
        ]
        .into_iter()
        .collect();
        let rendered = render(ForwardResponse {
            id: CorrelationId::from("r"),
            status: 418,
            headers,
            body: b"{}".to_vec(),
        });

        assert_eq!(rendered.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(rendered.headers().get_all("set-cookie").iter().count(), 2);
        assert!(rendered.headers().get("connection").is_none());
        let body = rendered.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"{}");
    }

    #[test]
    fn test_render_rejects_invalid_header() {
        let rendered = render(ForwardResponse {
            id: CorrelationId::from("r"),
            status: 200,
            headers: vec![("Bad Header", "x")].into_iter().collect(),
            body: Vec::new(),
        });
        assert_eq!(rendered.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_status() {
        assert_eq!(
            error_response(&TunnelError::NoClientConnected).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_response(&TunnelError::ForwardTimeout(DEFAULT_FORWARD_TIMEOUT)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
