use std::ops::{Deref, DerefMut};

use tokio::sync::{mpsc, Mutex};

use super::Connection;
use crate::{
    cmap::manager::PoolManager,
    error::{Error, Result},
    event::cmap::{CmapEvent, ConnectionClosedReason},
};

/// A connection checked out of a pool. Dropping it returns the connection: to the pinning
/// holder when pinned, otherwise to the pool it came from.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    connection: Option<Connection>,
    pool: PoolManager,
}

impl PooledConnection {
    pub(crate) fn new(connection: Connection, pool: PoolManager) -> Self {
        Self {
            connection: Some(connection),
            pool,
        }
    }

    /// The pool manager this connection returns to on drop.
    pub(crate) fn pool(&self) -> &PoolManager {
        &self.pool
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // The option is only vacated in drop.
        self.connection.as_ref().unwrap()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection.as_mut().unwrap()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => return,
        };

        // A pinned connection goes back to its holder rather than the pool, unless the holder
        // has gone away.
        if let Some(sender) = connection.pinned_sender().cloned() {
            let mut connection = connection;
            match sender.try_send(connection) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Closed(conn))
                | Err(mpsc::error::TrySendError::Full(conn)) => {
                    connection = conn;
                    connection.take_pinned_sender();
                    // If the pool is gone too, the socket just closes on drop.
                    let _ = self.pool.check_in(connection);
                    return;
                }
            }
        }

        if let Err(connection) = self.pool.check_in(connection) {
            // The pool worker has shut down; close the connection directly.
            let emitter = connection.event_emitter.clone();
            let address = connection.address.clone();
            let id = connection.id;
            drop(connection);
            emitter.emit(|| CmapEvent::ConnectionClosed {
                address,
                connection_id: id,
                reason: ConnectionClosedReason::PoolClosed,
            });
        }
    }
}

/// A handle to a pinned connection, allowing its holder to take the connection back out
/// repeatedly (e.g. for successive getMore commands) without going through the pool.
#[derive(Debug)]
pub(crate) struct PinnedConnectionHandle {
    id: u32,
    receiver: Mutex<mpsc::Receiver<Connection>>,
}

impl PinnedConnectionHandle {
    pub(super) fn new(id: u32, receiver: mpsc::Receiver<Connection>) -> Self {
        Self {
            id,
            receiver: Mutex::new(receiver),
        }
    }

    /// Retrieve the pinned connection. Errors if the connection is still in use.
    pub(crate) async fn take_connection(&self, pool: PoolManager) -> Result<PooledConnection> {
        let mut receiver = self.receiver.lock().await;
        let connection = receiver.try_recv().map_err(|_| {
            Error::internal(format!(
                "cannot take pinned connection {} while it is in use",
                self.id
            ))
        })?;
        Ok(PooledConnection::new(connection, pool))
    }
}
