use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use hookrelay_protocol::{Headers, MAX_BODY_SIZE};

use crate::forwarder::{error_response, render, text_response, Forwarder, ParsedRequest};
use crate::registry::ConnectionRegistry;
use crate::session;

/// Route and auth settings for a running relay
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub webhook_path: String,
    pub tunnel_path: String,
    pub token: String,
    pub forward_timeout: Duration,
}

/// Public HTTP surface of the relay
///
/// Serves the webhook endpoint, the tunnel handshake and a health check on
/// a single listener.
pub struct RelayServer {
    settings: RelaySettings,
    registry: Arc<ConnectionRegistry>,
    forwarder: Forwarder,
    tls_acceptor: Option<TlsAcceptor>,
}

impl RelayServer {
    pub fn new(
        settings: RelaySettings,
        registry: Arc<ConnectionRegistry>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Arc<Self> {
        let forwarder = Forwarder::new(registry.clone(), settings.forward_timeout);
        Arc::new(Self {
            settings,
            registry,
            forwarder,
            tls_acceptor,
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already-bound listener
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        let scheme = if self.tls_acceptor.is_some() { "https" } else { "http" };
        tracing::info!(
            "Relay listening on {}://{} (webhook: {}, tunnel: {})",
            scheme,
            addr,
            self.settings.webhook_path,
            self.settings.tunnel_path
        );

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            tracing::debug!("Connection from {}", peer_addr);
            let _ = stream.set_nodelay(true);
            let this = self.clone();

            tokio::spawn(async move {
                if let Some(ref acceptor) = this.tls_acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => this.serve_connection(tls_stream, peer_addr).await,
                        Err(e) => {
                            tracing::warn!("TLS handshake failed from {}: {}", peer_addr, e);
                        }
                    }
                } else {
                    this.serve_connection(stream, peer_addr).await;
                }
            });
        }
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req| {
            let this = self.clone();
            async move { this.handle_request(req, peer_addr).await }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        tracing::debug!("{} {} from {}", req.method(), req.uri(), peer_addr);

        let path = req.uri().path().to_string();
        let response = if path == self.settings.tunnel_path {
            if req.method() == Method::GET {
                session::handshake(
                    req,
                    peer_addr,
                    &self.settings.token,
                    self.registry.clone(),
                )
            } else {
                text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
            }
        } else if path == self.settings.webhook_path {
            self.handle_webhook(req).await
        } else if path == "/health" {
            self.health()
        } else {
            text_response(StatusCode::NOT_FOUND, "Not found")
        };

        Ok(response)
    }

    async fn handle_webhook(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().to_string();
        let uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let headers: Headers = req
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let body = match Limited::new(req.into_body(), MAX_BODY_SIZE).collect().await {
            Ok(collected) => collected.to_bytes().to_vec(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                tracing::warn!("Rejected {} {}: body over {} bytes", method, uri, MAX_BODY_SIZE);
                return text_response(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
            }
            Err(e) => {
                tracing::warn!("Failed to read request body: {}", e);
                return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let request = ParsedRequest {
            method,
            uri,
            headers,
            body,
        };

        match self.forwarder.forward(request).await {
            Ok(response) => render(response),
            Err(e) => {
                tracing::warn!("Webhook forward failed: {}", e);
                error_response(&e)
            }
        }
    }

    fn health(&self) -> Response<Full<Bytes>> {
        let body = if self.registry.is_connected() {
            "ok: client connected"
        } else {
            "ok: no client connected"
        };
        text_response(StatusCode::OK, body)
    }
}
