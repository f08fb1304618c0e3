use tokio::sync::mpsc;

use super::conn::Connection;
use crate::{
    error::Error,
    runtime::{AcknowledgedMessage, AcknowledgmentReceiver},
};

/// Returns a new manager/receiver pair.
pub(super) fn channel() -> (PoolManager, ManagementRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        PoolManager { sender },
        ManagementRequestReceiver { receiver },
    )
}

/// A handle for sending management requests to the pool worker. Unlike a
/// `ConnectionRequester`, this does not keep the worker alive.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    /// Clear the pool: increment the generation, pause the pool, and fail queued checkouts.
    pub(crate) fn clear(&self, cause: Error) {
        let _ = self.sender.send(PoolManagementRequest::Clear { cause });
    }

    /// Transition the pool to ready, allowing checkouts to proceed. The returned receiver
    /// resolves when the worker has processed the transition.
    pub(crate) fn mark_as_ready(&self) -> AcknowledgmentReceiver<()> {
        let (message, ack) = AcknowledgedMessage::package(());
        let _ = self
            .sender
            .send(PoolManagementRequest::MarkAsReady { completion_handler: message });
        ack
    }

    /// Return a connection to the pool. On failure the connection is handed back to the caller.
    pub(crate) fn check_in(&self, connection: Connection) -> std::result::Result<(), Connection> {
        if let Err(request) = self
            .sender
            .send(PoolManagementRequest::CheckIn(Box::new(connection)))
        {
            if let PoolManagementRequest::CheckIn(conn) = request.0 {
                return Err(*conn);
            }
        }
        Ok(())
    }

    /// Run an immediate maintenance pass: prune perished connections, then top up to the
    /// minimum pool size. The returned receiver resolves when the pass completes.
    pub(crate) fn perform_maintenance(&self) -> AcknowledgmentReceiver<()> {
        let (message, ack) = AcknowledgedMessage::package(());
        let _ = self
            .sender
            .send(PoolManagementRequest::PerformMaintenance { completion_handler: message });
        ack
    }

    /// Close the pool: reject queued checkouts and close idle connections. The returned
    /// receiver resolves once the worker has exited.
    pub(crate) fn shutdown(&self) -> AcknowledgmentReceiver<()> {
        let (message, ack) = AcknowledgedMessage::package(());
        let _ = self
            .sender
            .send(PoolManagementRequest::Shutdown { completion_handler: message });
        ack
    }

    /// Insert an already-established connection, bypassing establishment entirely.
    #[cfg(test)]
    pub(crate) fn populate_connection(&self, connection: Connection) {
        let _ = self
            .sender
            .send(PoolManagementRequest::Populate(Box::new(connection)));
    }

    /// Record that a connection finished establishing.
    pub(super) fn handle_connection_succeeded(&self, result: ConnectionSucceeded) {
        let _ = self
            .sender
            .send(PoolManagementRequest::HandleConnectionSucceeded(result));
    }

    /// Record that an establishment attempt failed.
    pub(super) fn handle_connection_failed(&self) {
        let _ = self.sender.send(PoolManagementRequest::HandleConnectionFailed);
    }
}

#[derive(Debug)]
pub(super) struct ManagementRequestReceiver {
    receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}

#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    /// Clear the pool, transitioning it to Paused.
    Clear { cause: Error },

    /// Mark the pool as Ready, allowing connections to be created and checked out.
    MarkAsReady {
        completion_handler: AcknowledgedMessage<()>,
    },

    /// Check in the given connection.
    CheckIn(Box<Connection>),

    /// Insert an already-established connection into the idle set.
    #[cfg(test)]
    Populate(Box<Connection>),

    /// Update the pool based on the given establishment result.
    HandleConnectionSucceeded(ConnectionSucceeded),

    /// Update the pool after an establishment failure.
    HandleConnectionFailed,

    /// Run a maintenance pass now.
    PerformMaintenance {
        completion_handler: AcknowledgedMessage<()>,
    },

    /// Stop the worker, closing idle connections and rejecting queued checkouts.
    Shutdown {
        completion_handler: AcknowledgedMessage<()>,
    },
}

/// The result of a successful connection establishment.
#[derive(Debug)]
pub(super) enum ConnectionSucceeded {
    /// The connection was handed to a waiting checkout.
    Used,

    /// The connection was established by maintenance and should enter the idle set.
    ForPool(Box<Connection>),
}
