//! The per-server connection pool, implementing the CMAP specification: bounded size, bounded
//! concurrent opens, FIFO checkout, direct hand-over on check-in, and generation-based
//! invalidation.

#[cfg(test)]
mod test;

mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;
mod status;
mod worker;

use std::time::Duration;

use derive_where::derive_where;

use crate::{
    client::options::ServerAddress,
    error::{Error, ErrorKind, Result},
    event::{
        cmap::{CheckoutFailedReason, CmapEvent},
        EventEmitter,
    },
    runtime,
    sdam::TopologyUpdater,
};

pub use conn::ConnectionInfo;
pub(crate) use conn::{
    Command,
    Connection,
    PinnedConnectionHandle,
    PooledConnection,
    RawCommandResponse,
    StreamDescription,
};
pub(crate) use establish::{ConnectionEstablisher, EstablisherOptions};
pub(crate) use manager::PoolManager;
pub(crate) use options::ConnectionPoolOptions;
pub(crate) use status::PoolGenerationSubscriber;
pub(crate) use worker::MAX_CONCURRENT_OPENS;

const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A pool of connections to one server. This handle is cheap to clone; all state lives in a
/// worker task that closes the pool once every handle (and every checked-out connection) is
/// gone.
#[derive(Clone)]
#[derive_where(Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    #[derive_where(skip)]
    connection_requester: connection_requester::ConnectionRequester,
    generation_subscriber: PoolGenerationSubscriber,
    #[derive_where(skip)]
    event_emitter: EventEmitter<CmapEvent>,
    wait_queue_timeout: Option<Duration>,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let event_emitter = EventEmitter::new(
            options
                .as_ref()
                .and_then(|opts| opts.cmap_event_handler.clone()),
        );
        let wait_queue_timeout = options.as_ref().and_then(|opts| opts.wait_queue_timeout);

        let (manager, connection_requester, generation_subscriber) = worker::ConnectionPoolWorker::start(
            address.clone(),
            establisher,
            server_updater,
            options,
        );

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            event_emitter,
            wait_queue_timeout,
        }
    }

    /// Check out a connection, waiting up to the configured wait queue timeout (a zero timeout
    /// polls the pool without parking the caller; no timeout waits indefinitely).
    pub(crate) async fn check_out(&self) -> Result<PooledConnection> {
        self.check_out_with_timeout(self.wait_queue_timeout).await
    }

    /// Check out a connection with an explicit timeout, overriding the configured one.
    pub(crate) async fn check_out_with_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<PooledConnection> {
        self.event_emitter
            .emit(|| CmapEvent::ConnectionCheckoutStarted {
                address: self.address.clone(),
            });

        let result = match timeout {
            Some(timeout) if timeout.is_zero() => {
                let mut request = Box::pin(self.acquire_connection());
                tokio::select! {
                    biased;
                    result = &mut request => result,
                    _ = async {
                        for _ in 0..8 {
                            tokio::task::yield_now().await;
                        }
                    } => Err(ErrorKind::WaitQueueTimeout {
                        address: self.address.clone(),
                    }
                    .into()),
                }
            }
            Some(timeout) => match tokio::time::timeout(timeout, self.acquire_connection()).await
            {
                Ok(result) => result,
                Err(_) => Err(ErrorKind::WaitQueueTimeout {
                    address: self.address.clone(),
                }
                .into()),
            },
            None => self.acquire_connection().await,
        };

        match result {
            Ok(connection) => {
                self.event_emitter.emit(|| CmapEvent::ConnectionCheckedOut {
                    address: self.address.clone(),
                    connection_id: connection.id,
                });
                Ok(connection)
            }
            Err(error) => {
                let reason = match error.kind.as_ref() {
                    ErrorKind::WaitQueueTimeout { .. } => CheckoutFailedReason::Timeout,
                    _ => CheckoutFailedReason::ConnectionError,
                };
                self.event_emitter
                    .emit(|| CmapEvent::ConnectionCheckoutFailed {
                        address: self.address.clone(),
                        reason,
                    });
                Err(error)
            }
        }
    }

    /// Check out a connection, delivering the result to `callback` exactly once.
    pub(crate) fn check_out_with_callback(
        &self,
        callback: impl FnOnce(Result<PooledConnection>) + Send + 'static,
    ) {
        let pool = self.clone();
        runtime::spawn(async move {
            callback(pool.check_out().await);
        });
    }

    async fn acquire_connection(&self) -> Result<PooledConnection> {
        use connection_requester::ConnectionRequestResult;

        let connection = match self.connection_requester.request().await? {
            ConnectionRequestResult::Pooled(connection) => *connection,
            ConnectionRequestResult::Establishing(receiver) => receiver
                .await
                .map_err(|_| Error::internal("connection establishment task dropped"))??,
            ConnectionRequestResult::PoolCleared(cause) => {
                return Err(Error::pool_cleared_error(&self.address, &cause))
            }
            ConnectionRequestResult::PoolClosed => {
                return Err(ErrorKind::ConnectionPoolClosed {
                    message: format!("connection pool for {} was closed", self.address),
                }
                .into())
            }
        };
        Ok(PooledConnection::new(connection, self.manager.clone()))
    }

    /// Increment the pool's generation, pause it, and fail fast any queued checkouts. Idle
    /// stale connections are reaped lazily and by maintenance.
    pub(crate) fn clear(&self, cause: Error) {
        self.manager.clear(cause);
    }

    /// Mark the pool as ready, allowing checkouts to proceed; idempotent when already ready.
    pub(crate) async fn ready(&self) {
        self.manager
            .mark_as_ready()
            .wait_for_acknowledgment()
            .await;
    }

    /// Run a maintenance pass now: prune perished connections and top up to the minimum size.
    pub(crate) async fn do_maintenance(&self) {
        self.manager
            .perform_maintenance()
            .wait_for_acknowledgment()
            .await;
    }

    /// Close the pool: close idle connections and reject queued and future checkouts.
    pub(crate) async fn close(&self) {
        self.manager.shutdown().wait_for_acknowledgment().await;
    }

    /// The pool's current generation.
    pub(crate) fn generation(&self) -> u32 {
        self.generation_subscriber.generation()
    }

    #[cfg(test)]
    pub(crate) fn generation_subscriber(&self) -> PoolGenerationSubscriber {
        self.generation_subscriber.clone()
    }

    /// Insert an already-established connection into the pool, for tests that need a populated
    /// pool without running establishment.
    #[cfg(test)]
    pub(crate) fn populate_connection(&self, connection: Connection) {
        self.manager.populate_connection(connection);
    }
}
