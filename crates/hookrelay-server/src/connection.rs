use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use hookrelay_common::TunnelError;
use hookrelay_protocol::{CorrelationId, DecodeError, ForwardResponse, Frame, FrameCodec};

/// Outbound queue depth per connection
pub(crate) const OUTBOUND_CAPACITY: usize = 32;

type Waiter = oneshot::Sender<Result<ForwardResponse, TunnelError>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The relay's side of one tunnel client connection
///
/// Frames go out through a single writer task fed by `outbound`, so
/// concurrent forwards never interleave partial frames. Responses are
/// matched to their callers through `pending`.
pub struct TunnelConnection {
    id: u64,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    pending: DashMap<CorrelationId, Waiter>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    last_inbound: Mutex<Instant>,
}

impl TunnelConnection {
    pub(crate) fn new(remote_addr: SocketAddr, outbound: mpsc::Sender<Frame>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            outbound,
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            last_inbound: Mutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of forwards still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// When the last frame arrived from the client
    pub(crate) fn last_inbound(&self) -> Instant {
        *self.last_inbound.lock()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Reserve a slot for the response to `id`
    ///
    /// The slot is released when the returned handle is dropped, whether or
    /// not a response arrived.
    pub(crate) fn register_waiter(
        self: &Arc<Self>,
        id: CorrelationId,
    ) -> Result<PendingResponse, TunnelError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        // close() may have drained the table before our insert landed
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(TunnelError::transport("tunnel connection is closed"));
        }

        Ok(PendingResponse {
            conn: self.clone(),
            id,
            rx,
        })
    }

    /// Queue a frame for the writer task
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::transport("tunnel connection is closed"));
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::transport("tunnel writer has shut down"))
    }

    /// Hand a response to whoever is waiting for it
    pub(crate) fn dispatch(&self, response: ForwardResponse) {
        *self.last_inbound.lock() = Instant::now();

        match self.pending.remove(&response.id) {
            Some((id, waiter)) => {
                if waiter.send(Ok(response)).is_err() {
                    tracing::debug!("Caller for {} went away before its response", id);
                }
            }
            None => {
                tracing::debug!("Discarding late response for {}", response.id);
            }
        }
    }

    /// Close the connection and fail every outstanding forward
    ///
    /// Idempotent. Each waiter is failed exactly once.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let ids: Vec<CorrelationId> = self.pending.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            tracing::debug!(
                "Failing {} pending forwards on connection {}",
                ids.len(),
                self.id
            );
        }
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(TunnelError::Transport(reason.to_string())));
            }
        }
    }

    /// Read frames until the stream ends or turns bad
    ///
    /// Returns the reason the connection can no longer be read.
    pub(crate) async fn run_reader<R>(&self, mut frames: FramedRead<R, FrameCodec>) -> TunnelError
    where
        R: AsyncRead + Unpin,
    {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return TunnelError::transport("connection closed");
                }
                next = frames.next() => match next {
                    Some(Ok(Frame::ForwardResponse(response))) => self.dispatch(response),
                    Some(Ok(other)) => {
                        return DecodeError::new(format!(
                            "unexpected {} frame from tunnel client",
                            other.kind()
                        ))
                        .into();
                    }
                    Some(Err(e)) => return e.into(),
                    None => return TunnelError::transport("tunnel client disconnected"),
                }
            }
        }
    }
}

/// Drain the outbound queue onto the wire
///
/// Returns the reason writing stopped.
pub(crate) async fn run_writer<W>(
    mut outbound: mpsc::Receiver<Frame>,
    mut sink: FramedWrite<W, FrameCodec>,
    shutdown: CancellationToken,
) -> TunnelError
where
    W: AsyncWrite + Unpin,
{
    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break TunnelError::transport("connection closed"),
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        return e.into();
                    }
                }
                None => break TunnelError::transport("outbound queue closed"),
            }
        }
    };

    let _ = sink.close().await;
    reason
}

/// A reserved response slot for one forward
pub(crate) struct PendingResponse {
    conn: Arc<TunnelConnection>,
    id: CorrelationId,
    rx: oneshot::Receiver<Result<ForwardResponse, TunnelError>>,
}

impl PendingResponse {
    pub(crate) async fn recv(&mut self) -> Result<ForwardResponse, TunnelError> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::transport(
                "connection dropped before a response arrived",
            )),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.conn.pending.remove(&self.id);
    }
}
