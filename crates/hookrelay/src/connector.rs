use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Empty;
use hyper::client::conn::http1;
use hyper::header::{AUTHORIZATION, CONNECTION, HOST, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};

use hookrelay_common::{tls, TunnelError};
use hookrelay_protocol::{
    CodecError, CorrelationId, DecodeError, ForwardRequest, ForwardResponse, Frame, FrameCodec,
    UPGRADE_PROTOCOL,
};

use crate::config::ClientSettings;
use crate::forwarder::LocalForwarder;

/// Grace period for flushing responses after a shutdown request
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Open the tunnel: connect, authenticate and upgrade
///
/// Uses TLS when the relay URL is `https://`. A 401 from the relay is
/// reported as [`TunnelError::Auth`] so callers can stop retrying.
pub async fn dial(settings: &ClientSettings) -> Result<Upgraded, TunnelError> {
    let url = settings.tunnel_url();
    let uri: Uri = url
        .parse()
        .map_err(|e| TunnelError::Config(format!("Invalid relay URL '{}': {}", url, e)))?;

    let secure = uri.scheme_str() == Some("https");
    let host = uri
        .host()
        .ok_or_else(|| TunnelError::Config(format!("Relay URL '{}' has no host", url)))?
        .to_string();
    let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

    tracing::debug!("Connecting to {}:{}", host, port);
    let tcp = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| TunnelError::transport(format!("connect to {}:{}: {}", host, port, e)))?;
    let _ = tcp.set_nodelay(true);

    if secure {
        let tls_config = tls::client_config(settings.ca_cert_pem.as_deref())?;
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| TunnelError::Tls(format!("Invalid server hostname: {}", host)))?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TunnelError::Tls(format!("TLS handshake with {} failed: {}", host, e)))?;
        upgrade(stream, &uri, &settings.token).await
    } else {
        upgrade(tcp, &uri, &settings.token).await
    }
}

/// Send the handshake request over `stream` and take over the connection
async fn upgrade<S>(stream: S, uri: &Uri, token: &str) -> Result<Upgraded, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(TunnelError::transport)?;

    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!("Handshake connection ended: {}", e);
        }
    });

    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_default();
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, authority)
        .header(AUTHORIZATION, format!("Bearer {}", token))
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, UPGRADE_PROTOCOL)
        .body(Empty::<Bytes>::new())
        .map_err(|e| TunnelError::Config(format!("Invalid handshake request: {}", e)))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(TunnelError::transport)?;

    match response.status() {
        StatusCode::SWITCHING_PROTOCOLS => {}
        StatusCode::UNAUTHORIZED => {
            return Err(TunnelError::Auth("relay rejected the token".to_string()));
        }
        other => {
            return Err(TunnelError::transport(format!(
                "unexpected handshake response: {}",
                other
            )));
        }
    }

    hyper::upgrade::on(response)
        .await
        .map_err(TunnelError::transport)
}

/// The client's side of an established tunnel
pub struct TunnelConnection {
    io: Upgraded,
    forwarder: LocalForwarder,
}

impl TunnelConnection {
    pub fn new(io: Upgraded, forwarder: LocalForwarder) -> Self {
        Self { io, forwarder }
    }

    /// Serve forwarded requests until the relay hangs up or `shutdown` fires
    ///
    /// Each request runs in its own task; responses go back in completion
    /// order through a single writer. Returns `Ok(())` only on shutdown.
    pub async fn run<F>(self, shutdown: F) -> Result<(), TunnelError>
    where
        F: Future<Output = ()>,
    {
        let (read_half, write_half) = tokio::io::split(TokioIo::new(self.io));
        let mut frames = FramedRead::new(read_half, FrameCodec::new());
        let sink = FramedWrite::new(write_half, FrameCodec::new());

        let (response_tx, response_rx) = mpsc::channel::<Frame>(32);
        let writer = write_frames(response_rx, sink);
        tokio::pin!(writer);
        tokio::pin!(shutdown);

        tracing::info!("Tunnel established, forwarding to {}", self.forwarder.base_url());

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break Ok(());
                }
                result = &mut writer => {
                    break Err(match result {
                        Ok(()) => TunnelError::transport("response writer stopped"),
                        Err(e) => e.into(),
                    });
                }
                next = frames.next() => match next {
                    Some(Ok(Frame::ForwardRequest(request))) => {
                        tokio::spawn(handle_request(
                            request,
                            self.forwarder.clone(),
                            response_tx.clone(),
                        ));
                    }
                    Some(Ok(other)) => {
                        break Err(DecodeError::new(format!(
                            "unexpected {} frame from relay",
                            other.kind()
                        ))
                        .into());
                    }
                    Some(Err(e)) => break Err(e.into()),
                    None => break Err(TunnelError::transport("relay closed the connection")),
                }
            }
        };

        if outcome.is_ok() {
            // Let responses already queued reach the relay
            drop(response_tx);
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await;
        }

        outcome
    }
}

async fn handle_request(request: ForwardRequest, forwarder: LocalForwarder, tx: mpsc::Sender<Frame>) {
    let id = request.id.clone();
    tracing::debug!("Request {}: {} {}", id, request.method, request.uri);

    let response = forwarder.execute(request).await;
    if tx.send(response.into()).await.is_err() {
        tracing::debug!("Tunnel gone, dropping response for {}", id);
    }
}

async fn write_frames<W>(
    mut outbound: mpsc::Receiver<Frame>,
    mut sink: FramedWrite<W, FrameCodec>,
) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        let id = frame.correlation_id().clone();
        match sink.send(frame).await {
            Ok(()) => {}
            // Encoding failed before anything was buffered; the stream is intact
            Err(CodecError::FrameTooLarge(size)) => {
                tracing::warn!("Response for {} encodes to {} bytes, sending 500 instead", id, size);
                sink.send(unsendable(id, size).into()).await?;
            }
            Err(e) => return Err(e),
        }
    }
    sink.close().await
}

fn unsendable(id: CorrelationId, encoded_size: usize) -> ForwardResponse {
    let reason = TunnelError::LocalCall(format!(
        "response body too large to forward ({} bytes encoded)",
        encoded_size
    ));
    ForwardResponse {
        id,
        status: 500,
        headers: vec![("Content-Type", "text/plain; charset=utf-8")]
            .into_iter()
            .collect(),
        body: reason.to_string().into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookrelay_protocol::{Headers, MAX_FRAME_SIZE};

    fn response(id: &str, body: Vec<u8>) -> Frame {
        ForwardResponse {
            id: CorrelationId::from(id),
            status: 200,
            headers: Headers::new(),
            body,
        }
        .into()
    }

    #[tokio::test]
    async fn test_oversized_response_is_replaced_not_fatal() {
        let (client_side, relay_side) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(write_frames(rx, FramedWrite::new(client_side, FrameCodec::new())));

        tx.send(response("huge", vec![0; MAX_FRAME_SIZE])).await.unwrap();
        tx.send(response("next", b"fine".to_vec())).await.unwrap();
        drop(tx);

        let mut frames = FramedRead::new(relay_side, FrameCodec::new());
        match frames.next().await {
            Some(Ok(Frame::ForwardResponse(resp))) => {
                assert_eq!(resp.id.as_str(), "huge");
                assert_eq!(resp.status, 500);
                assert!(String::from_utf8_lossy(&resp.body).starts_with("Local call failed"));
            }
            other => panic!("Expected a replacement response, got {:?}", other),
        }
        match frames.next().await {
            Some(Ok(Frame::ForwardResponse(resp))) => assert_eq!(resp.body, b"fine"),
            other => panic!("Expected the following response, got {:?}", other),
        }

        assert!(writer.await.unwrap().is_ok());
    }
}
