//! A tunnel client driven by hand
//!
//! Performs the real handshake, then hands the frame stream to the test so
//! it can choose when (and whether) to answer each request.

use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio_util::codec::Framed;

use hookrelay::{dial, ClientSettings};
use hookrelay_common::TunnelError;
use hookrelay_protocol::{ForwardRequest, ForwardResponse, Frame, FrameCodec, Headers};

pub struct RawTunnelClient {
    frames: Framed<TokioIo<Upgraded>, FrameCodec>,
}

impl RawTunnelClient {
    pub async fn connect(settings: &ClientSettings) -> Result<Self, TunnelError> {
        let io = dial(settings).await?;
        Ok(Self {
            frames: Framed::new(TokioIo::new(io), FrameCodec::new()),
        })
    }

    /// Next request pushed by the relay, `None` once the relay hangs up
    pub async fn recv_request(&mut self) -> Option<ForwardRequest> {
        match self.frames.next().await {
            Some(Ok(Frame::ForwardRequest(request))) => Some(request),
            _ => None,
        }
    }

    pub async fn send_response(&mut self, response: ForwardResponse) -> Result<(), TunnelError> {
        self.frames.send(response.into()).await?;
        Ok(())
    }

    /// Answer `request` with a plain-text body
    pub async fn reply(
        &mut self,
        request: &ForwardRequest,
        status: u16,
        body: &str,
    ) -> Result<(), TunnelError> {
        self.send_response(ForwardResponse {
            id: request.id.clone(),
            status,
            headers: vec![("Content-Type", "text/plain")].into_iter().collect::<Headers>(),
            body: body.as_bytes().to_vec(),
        })
        .await
    }
}
