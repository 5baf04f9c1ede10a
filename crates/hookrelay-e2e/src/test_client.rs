//! The real tunnel client, run in the background for a test

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use hookrelay::{run_tunnel, ClientSettings};
use hookrelay_common::TunnelError;

use crate::harness::TestRelay;

pub struct TestTunnelClient {
    handle: JoinHandle<Result<(), TunnelError>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Relay-side id of the connection this client owns
    pub connection_id: u64,
}

impl TestTunnelClient {
    /// Connect to `relay` and wait until it has registered this client
    pub async fn connect(relay: &TestRelay, settings: ClientSettings) -> Result<Self, TunnelError> {
        let previous = relay.active_connection_id();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let mut handle = tokio::spawn(async move {
            run_tunnel(&settings, async move {
                let _ = shutdown_rx.await;
            })
            .await
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(id) = relay.active_connection_id() {
                if Some(id) != previous {
                    return Ok(Self {
                        handle,
                        shutdown_tx: Some(shutdown_tx),
                        connection_id: id,
                    });
                }
            }

            if handle.is_finished() {
                return match (&mut handle).await {
                    Ok(Ok(())) => Err(TunnelError::transport("client exited before registering")),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(TunnelError::transport(e)),
                };
            }

            if tokio::time::Instant::now() > deadline {
                handle.abort();
                return Err(TunnelError::transport("timed out waiting for registration"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Ask the client to stop and wait for it to exit
    pub async fn shutdown(mut self) -> Result<(), TunnelError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(e) => Err(TunnelError::transport(e)),
        }
    }

    /// Kill the client without a clean shutdown
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for TestTunnelClient {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
