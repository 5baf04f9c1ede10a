use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::TunnelConnection;

/// Holds the single active tunnel connection
///
/// At most one connection is active. Registering a new one closes the
/// previous connection, failing its in-flight forwards.
#[derive(Default)]
pub struct ConnectionRegistry {
    active: Mutex<Option<Arc<TunnelConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `conn` the active connection, closing any predecessor
    pub fn register(&self, conn: Arc<TunnelConnection>) {
        let previous = self.active.lock().replace(conn.clone());

        match previous {
            Some(old) if !Arc::ptr_eq(&old, &conn) => {
                tracing::info!(
                    "Tunnel client {} (connection {}) replaces connection {} from {}",
                    conn.remote_addr(),
                    conn.id(),
                    old.id(),
                    old.remote_addr()
                );
                old.close("replaced by a newer tunnel client");
            }
            _ => {
                tracing::info!(
                    "Tunnel client {} registered (connection {})",
                    conn.remote_addr(),
                    conn.id()
                );
            }
        }
    }

    /// The active connection, if any
    pub fn current(&self) -> Option<Arc<TunnelConnection>> {
        self.active.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Close `conn` and clear the slot if it still holds that same connection
    ///
    /// Returns whether the slot was cleared. A stale connection that was
    /// already replaced never evicts its successor.
    pub fn invalidate(&self, conn: &Arc<TunnelConnection>, reason: &str) -> bool {
        let cleared = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    *active = None;
                    true
                }
                _ => false,
            }
        };

        if cleared {
            tracing::info!(
                "Tunnel connection {} from {} invalidated: {}",
                conn.id(),
                conn.remote_addr(),
                reason
            );
        } else {
            tracing::debug!("Stale connection {} closed: {}", conn.id(), reason);
        }

        conn.close(reason);
        cleared
    }

    /// Close and forget the active connection
    pub fn shutdown(&self) {
        let active = self.active.lock().take();
        if let Some(conn) = active {
            conn.close("relay shutting down");
        }
    }
}
