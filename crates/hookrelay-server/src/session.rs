//! Tunnel handshake and connection lifecycle
//!
//! A tunnel client opens an HTTP/1.1 request to the tunnel path carrying
//! `Authorization: Bearer <token>` and `Upgrade: hookrelay/1`. Once the
//! relay answers `101 Switching Protocols`, the raw stream carries
//! length-prefixed frames in both directions until either side hangs up.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, AUTHORIZATION, CONNECTION, UPGRADE, WWW_AUTHENTICATE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use hookrelay_common::TunnelError;
use hookrelay_protocol::{FrameCodec, UPGRADE_PROTOCOL};

use crate::connection::{run_writer, TunnelConnection, OUTBOUND_CAPACITY};
use crate::forwarder::text_response;
use crate::registry::ConnectionRegistry;

/// Check a presented `Authorization` header value against the shared token
pub fn authorize(authorization: Option<&str>, expected_token: &str) -> Result<(), TunnelError> {
    let presented = authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or_else(|| TunnelError::Auth("missing bearer token".to_string()))?;

    if presented.is_empty() || expected_token.is_empty() {
        return Err(TunnelError::Auth("empty token".to_string()));
    }

    if bool::from(presented.as_bytes().ct_eq(expected_token.as_bytes())) {
        Ok(())
    } else {
        Err(TunnelError::Auth("token mismatch".to_string()))
    }
}

fn requests_tunnel_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(UPGRADE_PROTOCOL))
}

/// Answer a handshake request on the tunnel path
///
/// Authentication happens before anything else; a rejected client never
/// touches the registry. On success the upgraded stream is handed to
/// [`establish`] in the background once hyper has sent the 101.
pub fn handshake<B>(
    mut req: Request<B>,
    remote_addr: SocketAddr,
    expected_token: &str,
    registry: Arc<ConnectionRegistry>,
) -> Response<Full<Bytes>> {
    let authorization = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if let Err(e) = authorize(authorization, expected_token) {
        tracing::warn!("Rejected tunnel handshake from {}: {}", remote_addr, e);
        let mut response = text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        return response;
    }

    if !requests_tunnel_upgrade(&req) {
        tracing::warn!("Handshake from {} did not request an upgrade", remote_addr);
        let mut response = text_response(
            StatusCode::UPGRADE_REQUIRED,
            "Tunnel handshake requires an upgrade",
        );
        response
            .headers_mut()
            .insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
        return response;
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                establish(TokioIo::new(upgraded), remote_addr, registry);
            }
            Err(e) => {
                tracing::warn!("Tunnel upgrade from {} failed: {}", remote_addr, e);
            }
        }
    });

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
    response
}

/// Turn an authenticated stream into the active tunnel connection
///
/// Spawns the task that reads and writes frames. When either direction
/// fails, the connection is invalidated so outstanding forwards fail and
/// the registry slot is freed (unless a newer client already took it).
pub fn establish<S>(
    io: S,
    remote_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
) -> Arc<TunnelConnection>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(io);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

    let conn = TunnelConnection::new(remote_addr, outbound_tx);
    registry.register(conn.clone());

    let task_conn = conn.clone();
    tokio::spawn(async move {
        let frames = FramedRead::new(read_half, FrameCodec::new());
        let sink = FramedWrite::new(write_half, FrameCodec::new());

        let reason = tokio::select! {
            reason = task_conn.run_reader(frames) => reason,
            reason = run_writer(outbound_rx, sink, task_conn.shutdown_token()) => reason,
        };

        if reason.is_fatal_to_connection() && !task_conn.is_closed() {
            tracing::warn!("Tunnel connection {} failed: {}", task_conn.id(), reason);
        }
        registry.invalidate(&task_conn, &reason.to_string());
    });

    conn
}
