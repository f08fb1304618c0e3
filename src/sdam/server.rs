use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;

use crate::{client::options::ServerAddress, cmap::ConnectionPool};

/// The client's view of one server: its connection pool, its in-flight operation count, and the
/// signalling channels into its monitor.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    /// The pool of application connections to this server.
    pub(crate) pool: ConnectionPool,

    /// The number of operations currently using this server.
    operation_count: AtomicU32,

    /// Wakes the monitor to check this server immediately.
    check_requester: watch::Sender<()>,

    /// Tells the monitor to abandon its in-flight check and reconnect.
    cancellation_requester: watch::Sender<()>,
}

impl Server {
    pub(crate) fn new(address: ServerAddress, pool: ConnectionPool) -> Self {
        let (check_requester, _) = watch::channel(());
        let (cancellation_requester, _) = watch::channel(());
        Self {
            address,
            pool,
            operation_count: AtomicU32::new(0),
            check_requester,
            cancellation_requester,
        }
    }

    /// A receiver for immediate-check requests, for this server's monitor.
    pub(crate) fn subscribe_to_check_requests(&self) -> watch::Receiver<()> {
        self.check_requester.subscribe()
    }

    /// A receiver for check cancellations, for this server's monitor.
    pub(crate) fn subscribe_to_cancellations(&self) -> watch::Receiver<()> {
        self.cancellation_requester.subscribe()
    }

    /// Ask the monitor to check this server now (e.g. because server selection found no
    /// suitable server). Fire-and-forget.
    pub(crate) fn request_immediate_check(&self) {
        let _: std::result::Result<_, _> = self.check_requester.send(());
    }

    /// Ask the monitor to fail its in-flight check and reconnect (e.g. because application
    /// traffic observed a network error). Fire-and-forget and idempotent.
    pub(crate) fn cancel_current_check(&self) {
        let _: std::result::Result<_, _> = self.cancellation_requester.send(());
    }

    pub(crate) fn increment_operation_count(&self) {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_operation_count(&self) {
        self.operation_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::SeqCst)
    }
}
