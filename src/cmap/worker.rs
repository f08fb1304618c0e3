use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tokio::sync::oneshot;

use super::{
    conn::{Connection, PendingConnection},
    connection_requester,
    connection_requester::{
        ConnectionRequest,
        ConnectionRequestReceiver,
        ConnectionRequestResult,
        ConnectionRequester,
    },
    establish::ConnectionEstablisher,
    manager,
    manager::{ConnectionSucceeded, ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    options::ConnectionPoolOptions,
    status,
    status::{PoolGenerationPublisher, PoolGenerationSubscriber},
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    client::options::{Credential, ServerAddress},
    error::{Error, ErrorKind, Result},
    event::{
        cmap::{CmapEvent, ConnectionClosedReason},
        EventEmitter,
    },
    runtime::{self, WorkerHandleListener},
    sdam::TopologyUpdater,
};

/// The maximum number of connections that may be establishing concurrently per pool.
pub(crate) const MAX_CONCURRENT_OPENS: u32 = 2;

const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// A worker task that owns all of a pool's mutable state. The public pool handle communicates
/// with it over channels, so no lock is ever held across a callback or a suspension point.
pub(crate) struct ConnectionPoolWorker {
    /// The address the pool's connections will connect to.
    address: ServerAddress,

    /// Current state of the pool. Determines if connections may be checked out
    /// and if min_pool_size connection creation should continue.
    state: PoolState,

    /// The total number of connections managed by the pool, including connections which are
    /// currently checked out of the pool or have yet to be established.
    total_connection_count: u32,

    /// The number of connections currently being established by this pool.
    pending_connection_count: u32,

    /// The ID of the next connection created by the pool.
    next_connection_id: u32,

    /// The current generation of the pool. The generation is incremented whenever the pool is
    /// cleared. Connections belonging to a previous generation are considered stale and will be
    /// closed when checked back in or when popped off of the set of available connections.
    generation: u32,

    /// The established connections that are currently checked into the pool and awaiting usage
    /// in future operations.
    available_connections: VecDeque<Connection>,

    /// Contains the logic for "establishing" a connection, including opening the socket and
    /// running the handshake.
    establisher: ConnectionEstablisher,

    /// The credential to use for new connections, if any.
    credential: Option<Credential>,

    /// The event handler registration for pool events.
    event_emitter: EventEmitter<CmapEvent>,

    /// The time between maintenance passes.
    maintenance_frequency: Duration,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time`
    /// will be closed either by maintenance or when popped off of the set of available
    /// connections.
    max_idle_time: Option<Duration>,

    /// Connections older than this are closed regardless of how recently they were used.
    max_connection_life_time: Option<Duration>,

    /// The minimum number of connections the pool keeps established; maintenance tops the pool
    /// up to this size.
    min_pool_size: Option<u32>,

    /// The maximum number of connections that the pool can manage, including connections
    /// checked out of the pool.
    max_pool_size: u32,

    /// The maximum number of connections that may be establishing concurrently.
    max_connecting: u32,

    /// Receiver used to determine if any threads hold references to this pool. If all the
    /// sender ends of this receiver drop, this worker will be notified and drop too.
    handle_listener: WorkerHandleListener,

    /// Receiver for incoming connection check out requests.
    request_receiver: ConnectionRequestReceiver,

    /// Ordered queue of incoming requests waiting for connections.
    wait_queue: VecDeque<ConnectionRequest>,

    /// Receiver for incoming pool management requests (e.g. checking in a connection).
    management_receiver: ManagementRequestReceiver,

    /// Sender used to publish the latest generation.
    generation_publisher: PoolGenerationPublisher,

    /// A pool manager that can be cloned and handed to tasks spawned by this worker.
    manager: PoolManager,

    /// A handle used to notify SDAM that a connection establishment error happened, allowing
    /// the server to transition to Unknown and the pool to pause.
    server_updater: TopologyUpdater,
}

impl ConnectionPoolWorker {
    /// Starts a worker and returns a manager, a connection requester, and a generation
    /// subscriber. Once all connection requesters are dropped, the worker will stop executing
    /// and close the pool.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        options: Option<ConnectionPoolOptions>,
    ) -> (PoolManager, ConnectionRequester, PoolGenerationSubscriber) {
        // A max idle time of zero means connections are never closed due to idleness.
        let mut max_idle_time = options.as_ref().and_then(|opts| opts.max_idle_time);
        if max_idle_time == Some(Duration::from_millis(0)) {
            max_idle_time = None;
        }

        let max_pool_size = options
            .as_ref()
            .and_then(|opts| opts.max_pool_size)
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let max_connecting = options
            .as_ref()
            .and_then(|opts| opts.max_connecting)
            .unwrap_or(MAX_CONCURRENT_OPENS);
        let min_pool_size = options.as_ref().and_then(|opts| opts.min_pool_size);
        let max_connection_life_time = options
            .as_ref()
            .and_then(|opts| opts.max_connection_life_time);

        let event_emitter = EventEmitter::new(
            options
                .as_ref()
                .and_then(|opts| opts.cmap_event_handler.clone()),
        );

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (connection_requester, request_receiver) = connection_requester::channel(handle);
        let (manager, management_receiver) = manager::channel();
        let (generation_publisher, generation_subscriber) = status::channel();

        let state = if options
            .as_ref()
            .and_then(|opts| opts.ready)
            .unwrap_or(false)
        {
            PoolState::Ready
        } else {
            PoolState::New
        };

        #[cfg(test)]
        let maintenance_frequency = options
            .as_ref()
            .and_then(|opts| opts.maintenance_frequency)
            .unwrap_or(MAINTENANCE_FREQUENCY);
        #[cfg(not(test))]
        let maintenance_frequency = MAINTENANCE_FREQUENCY;

        let credential = options.and_then(|opts| opts.credential);

        let worker = ConnectionPoolWorker {
            address: address.clone(),
            event_emitter: event_emitter.clone(),
            max_idle_time,
            max_connection_life_time,
            min_pool_size,
            credential,
            establisher,
            next_connection_id: 1,
            total_connection_count: 0,
            pending_connection_count: 0,
            generation: 0,
            available_connections: VecDeque::new(),
            max_pool_size,
            max_connecting,
            request_receiver,
            wait_queue: Default::default(),
            management_receiver,
            manager: manager.clone(),
            handle_listener,
            state,
            generation_publisher,
            maintenance_frequency,
            server_updater,
        };

        event_emitter.emit(|| CmapEvent::PoolCreated { address });

        runtime::spawn(async move {
            worker.execute().await;
        });

        (manager, connection_requester, generation_subscriber)
    }

    /// Run the worker, listening on the various receivers until all handles have been dropped
    /// or an explicit shutdown arrives. On exit the pool closes any available connections and
    /// emits a pool closed event.
    async fn execute(mut self) {
        let mut maintenance_interval = runtime::interval(self.maintenance_frequency);
        let mut shutdown_ack = None;

        loop {
            let task = tokio::select! {
                // Poll in order: check-in, clear, and ready always take priority over checkout
                // requests, and the pool exiting takes priority over everything.
                biased;

                Some(request) = self.management_receiver.recv() => PoolTask::Management(request),
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    // All worker handles have been dropped, meaning this pool has no more
                    // references and can close.
                    break;
                },
                Some(request) = self.request_receiver.recv() => PoolTask::CheckOut(request),
                _ = maintenance_interval.tick() => PoolTask::Maintenance,
                else => break,
            };

            match task {
                PoolTask::CheckOut(request) => match self.state {
                    PoolState::Ready => {
                        self.wait_queue.push_back(request);
                    }
                    PoolState::Paused(ref e) => {
                        // If the receiver no longer listens, that's fine.
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(e.clone()));
                    }
                    PoolState::New => {
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(
                            ErrorKind::Internal {
                                message: "check out attempted from new pool".to_string(),
                            }
                            .into(),
                        ));
                    }
                },
                PoolTask::Management(request) => match request {
                    PoolManagementRequest::CheckIn(connection) => {
                        self.check_in(*connection);
                    }
                    #[cfg(test)]
                    PoolManagementRequest::Populate(connection) => {
                        let mut connection = *connection;
                        connection.mark_as_available();
                        self.total_connection_count += 1;
                        self.available_connections.push_back(connection);
                    }
                    PoolManagementRequest::Clear { cause } => {
                        self.clear(cause);
                    }
                    PoolManagementRequest::MarkAsReady { completion_handler } => {
                        self.mark_as_ready();
                        completion_handler.acknowledge(());
                    }
                    PoolManagementRequest::HandleConnectionSucceeded(result) => {
                        self.handle_connection_succeeded(result);
                    }
                    PoolManagementRequest::HandleConnectionFailed => {
                        self.handle_connection_failed();
                    }
                    PoolManagementRequest::PerformMaintenance { completion_handler } => {
                        self.perform_maintenance();
                        completion_handler.acknowledge(());
                    }
                    PoolManagementRequest::Shutdown { completion_handler } => {
                        shutdown_ack = Some(completion_handler);
                        break;
                    }
                },
                PoolTask::Maintenance => {
                    self.perform_maintenance();
                }
            }

            while self.can_service_connection_request() {
                match self.wait_queue.pop_front() {
                    Some(request) => self.check_out(request),
                    None => break,
                }
            }
        }

        while let Some(connection) = self.available_connections.pop_front() {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }
        for request in self.wait_queue.drain(..) {
            let _ = request.fulfill(ConnectionRequestResult::PoolClosed);
        }

        self.event_emitter.emit(|| CmapEvent::PoolClosed {
            address: self.address.clone(),
        });
        if let Some(ack) = shutdown_ack {
            ack.acknowledge(());
        }
    }

    fn below_max_connections(&self) -> bool {
        self.total_connection_count < self.max_pool_size
    }

    fn can_service_connection_request(&self) -> bool {
        if !matches!(self.state, PoolState::Ready) {
            return false;
        }
        if self.wait_queue.is_empty() {
            return false;
        }
        if !self.available_connections.is_empty() {
            return true;
        }
        self.below_max_connections() && self.pending_connection_count < self.max_connecting
    }

    fn check_out(&mut self, request: ConnectionRequest) {
        // First attempt to hand out an available connection.
        while let Some(mut conn) = self.available_connections.pop_back() {
            if conn.is_stale(self.generation) {
                self.close_connection(conn, ConnectionClosedReason::Stale);
                continue;
            }
            if conn.is_idle(self.max_idle_time) {
                self.close_connection(conn, ConnectionClosedReason::Idle);
                continue;
            }
            if conn.is_expired(self.max_connection_life_time) {
                self.close_connection(conn, ConnectionClosedReason::Expired);
                continue;
            }

            conn.mark_as_in_use();
            if let Err(request) = request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn))) {
                // The checking-out task stopped listening, e.g. due to hitting its wait queue
                // timeout, so the connection goes back into the pool.
                let mut connection = request.unwrap_pooled_connection();
                connection.mark_as_available();
                self.available_connections.push_back(connection);
            }
            return;
        }

        // Otherwise, attempt to create a new connection under the open-permit limit.
        if self.below_max_connections() && self.pending_connection_count < self.max_connecting {
            let event_emitter = self.event_emitter.clone();
            let establisher = self.establisher.clone();
            let pending_connection = self.create_pending_connection();
            let manager = self.manager.clone();
            let server_updater = self.server_updater.clone();
            let credential = self.credential.clone();

            let (sender, receiver) = oneshot::channel();
            runtime::spawn(async move {
                let mut establish_result = establish_connection(
                    establisher,
                    pending_connection,
                    server_updater,
                    &manager,
                    credential,
                    event_emitter,
                )
                .await;

                if let Ok(ref mut connection) = establish_result {
                    connection.mark_as_in_use();
                    manager.handle_connection_succeeded(ConnectionSucceeded::Used);
                }

                if let Err(unclaimed) = sender.send(establish_result) {
                    // The requester stopped listening; a successfully established connection
                    // still belongs in the pool.
                    if let Ok(connection) = unclaimed {
                        let _ = manager.check_in(connection);
                    }
                }
            });

            let _ = request.fulfill(ConnectionRequestResult::Establishing(receiver));
        } else {
            // Put the request at the front of the wait queue so it is processed next time a
            // request can be processed.
            self.wait_queue.push_front(request);
        }
    }

    fn create_pending_connection(&mut self) -> PendingConnection {
        self.total_connection_count += 1;
        self.pending_connection_count += 1;

        let pending_connection = PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.generation,
            event_emitter: self.event_emitter.clone(),
            time_created: Instant::now(),
        };
        self.next_connection_id += 1;
        self.event_emitter.emit(|| CmapEvent::ConnectionCreated {
            address: pending_connection.address.clone(),
            connection_id: pending_connection.id,
        });

        pending_connection
    }

    /// Process a connection establishment failure.
    fn handle_connection_failed(&mut self) {
        // Establishing a pending connection failed, so that must be reflected in the total
        // connection count.
        self.total_connection_count -= 1;
        self.pending_connection_count -= 1;
    }

    /// Process a successful connection establishment, optionally populating the pool with the
    /// resulting connection.
    fn handle_connection_succeeded(&mut self, result: ConnectionSucceeded) {
        self.pending_connection_count -= 1;
        if let ConnectionSucceeded::ForPool(connection) = result {
            let mut connection = *connection;
            connection.mark_as_available();
            self.available_connections.push_back(connection);
        }
    }

    fn check_in(&mut self, mut conn: Connection) {
        self.event_emitter.emit(|| CmapEvent::ConnectionCheckedIn {
            address: conn.address.clone(),
            connection_id: conn.id,
        });

        conn.mark_as_available();

        if conn.has_errored() {
            self.close_connection(conn, ConnectionClosedReason::Error);
        } else if conn.is_stale(self.generation) {
            self.close_connection(conn, ConnectionClosedReason::Stale);
        } else if conn.is_streaming() {
            // A connection mid-exhaust cannot be reused for another operation.
            self.close_connection(conn, ConnectionClosedReason::Dropped);
        } else if conn.is_expired(self.max_connection_life_time) {
            self.close_connection(conn, ConnectionClosedReason::Expired);
        } else {
            // Hand the connection to the oldest waiter instead of pooling it. This is the only
            // path that can satisfy waiters while all open permits are held by stalled
            // establish attempts.
            while let Some(request) = self.wait_queue.pop_front() {
                conn.mark_as_in_use();
                match request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn))) {
                    Ok(()) => return,
                    Err(result) => {
                        conn = result.unwrap_pooled_connection();
                        conn.mark_as_available();
                    }
                }
            }
            self.available_connections.push_back(conn);
        }
    }

    fn clear(&mut self, cause: Error) {
        self.generation = self.generation.wrapping_add(1);
        let was_ready = matches!(
            std::mem::replace(&mut self.state, PoolState::Paused(cause.clone())),
            PoolState::Ready
        );
        self.generation_publisher.publish(self.generation);

        if was_ready {
            self.event_emitter.emit(|| CmapEvent::PoolCleared {
                address: self.address.clone(),
            });

            for request in self.wait_queue.drain(..) {
                // An error here means the other end hung up already, which is okay because we
                // were returning an error anyways.
                let _ = request.fulfill(ConnectionRequestResult::PoolCleared(cause.clone()));
            }
        }
    }

    fn mark_as_ready(&mut self) {
        if matches!(self.state, PoolState::Ready) {
            return;
        }

        self.state = PoolState::Ready;
        self.event_emitter.emit(|| CmapEvent::PoolReady {
            address: self.address.clone(),
        });
    }

    /// Close a connection, emit the event for it being closed, and decrement the
    /// total connection count.
    fn close_connection(&mut self, connection: Connection, reason: ConnectionClosedReason) {
        connection.close_and_drop(reason);
        self.total_connection_count -= 1;
    }

    /// Ensure all connections in the pool are valid and that the pool is managing at least
    /// min_pool_size connections.
    fn perform_maintenance(&mut self) {
        self.remove_perished_connections();
        if matches!(self.state, PoolState::Ready) {
            self.ensure_min_connections();
        }
    }

    /// Remove stale, idle, and expired connections from the available set. Unlike idleness,
    /// expiration is not ordered by check-in time, so the whole set is scanned.
    fn remove_perished_connections(&mut self) {
        let mut retained = VecDeque::with_capacity(self.available_connections.len());
        while let Some(connection) = self.available_connections.pop_front() {
            if connection.is_stale(self.generation) {
                self.close_connection(connection, ConnectionClosedReason::Stale);
            } else if connection.is_idle(self.max_idle_time) {
                self.close_connection(connection, ConnectionClosedReason::Idle);
            } else if connection.is_expired(self.max_connection_life_time) {
                self.close_connection(connection, ConnectionClosedReason::Expired);
            } else {
                retained.push_back(connection);
            }
        }
        self.available_connections = retained;
    }

    /// Populate the pool with enough connections to meet the min_pool_size requirement, staying
    /// under the concurrent-open limit.
    fn ensure_min_connections(&mut self) {
        if let Some(min_pool_size) = self.min_pool_size {
            while self.total_connection_count < min_pool_size
                && self.pending_connection_count < self.max_connecting
            {
                let pending_connection = self.create_pending_connection();
                let event_emitter = self.event_emitter.clone();
                let manager = self.manager.clone();
                let establisher = self.establisher.clone();
                let updater = self.server_updater.clone();
                let credential = self.credential.clone();

                runtime::spawn(async move {
                    let connection = establish_connection(
                        establisher,
                        pending_connection,
                        updater,
                        &manager,
                        credential,
                        event_emitter,
                    )
                    .await;

                    if let Ok(connection) = connection {
                        manager.handle_connection_succeeded(ConnectionSucceeded::ForPool(
                            Box::new(connection),
                        ));
                    }
                });
            }
        }
    }
}

/// Helper covering the common connection establishment behavior between connections established
/// in check_out and those established to satisfy min_pool_size.
async fn establish_connection(
    establisher: ConnectionEstablisher,
    pending_connection: PendingConnection,
    server_updater: TopologyUpdater,
    manager: &PoolManager,
    credential: Option<Credential>,
    event_emitter: EventEmitter<CmapEvent>,
) -> Result<Connection> {
    let connection_id = pending_connection.id;
    let address = pending_connection.address.clone();

    let mut establish_result = establisher
        .establish_connection(pending_connection, credential.as_ref())
        .await;

    match establish_result {
        Err(ref e) => {
            server_updater
                .handle_application_error(
                    address.clone(),
                    e.cause.clone(),
                    e.handshake_phase.clone(),
                )
                .await;
            event_emitter.emit(|| CmapEvent::ConnectionClosed {
                address,
                connection_id,
                reason: ConnectionClosedReason::Error,
            });
            manager.handle_connection_failed();
        }
        Ok(ref mut connection) => {
            event_emitter.emit(|| CmapEvent::ConnectionReady {
                address,
                connection_id: connection.id,
            });
        }
    }

    establish_result.map_err(|e| e.cause)
}

/// Enum modeling the possible pool states as described in the CMAP specification.
#[derive(Debug)]
enum PoolState {
    /// Same as Paused, but for a new pool rather than one that has been cleared due to an
    /// error.
    New,

    /// Connections may not be checked out nor created in the background to satisfy
    /// minPoolSize.
    Paused(Error),

    /// Pool is operational.
    Ready,
}

/// Task for the worker to process.
#[derive(Debug)]
enum PoolTask {
    /// Handle a management request from a `PoolManager`.
    Management(PoolManagementRequest),

    /// Fulfill the given connection request.
    CheckOut(ConnectionRequest),

    /// Perform pool maintenance (ensure min connections, remove perished connections).
    Maintenance,
}
