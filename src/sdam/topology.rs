use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::{mpsc, watch};

use super::{
    description::{
        server::ServerDescription,
        topology::{server_selection, TopologyDescription},
    },
    monitor::Monitor,
    server::Server,
    HandshakePhase,
};
use crate::{
    client::options::{ClientOptions, ServerAddress},
    cmap::{ConnectionEstablisher, ConnectionPool, ConnectionPoolOptions, EstablisherOptions},
    error::{Error, ErrorKind, Result},
    event::{sdam::SdamEvent, EventEmitter},
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
    selection_criteria::SelectionCriteria,
};

pub(crate) use super::description::topology::server_selection::SelectedServer;

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The set of servers the client currently knows, along with the description that produced it.
/// Snapshots are immutable; the topology worker publishes a fresh one after every change.
#[derive(Clone, Debug)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// The driver's view of the deployment: a worker task owns the state and applies all updates;
/// readers observe immutable snapshots through a watch channel.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    selection_timeout: Duration,
    _worker_handle: WorkerHandle,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Topology> {
        let description = TopologyDescription::new(&options)?;
        let establisher = ConnectionEstablisher::new(EstablisherOptions::from_client_options(
            &options,
        ));
        let event_emitter = EventEmitter::new(options.sdam_event_handler.clone());
        let selection_timeout = options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);

        let (updater, update_receiver) = TopologyUpdater::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();

        let (publisher, receiver) = watch::channel(TopologyState {
            description: description.clone(),
            servers: HashMap::new(),
        });
        let watcher = TopologyWatcher { receiver };

        let mut worker = TopologyWorker {
            state: TopologyState {
                description,
                servers: HashMap::new(),
            },
            publisher,
            update_receiver,
            handle_listener,
            options,
            establisher,
            event_emitter,
            updater: updater.clone(),
            watcher: watcher.clone(),
        };

        let addresses: Vec<_> = worker.state.description.server_addresses().cloned().collect();
        for address in addresses.iter() {
            worker.add_server(address.clone());
        }
        // Monitors only start once the published snapshot contains their server, since they
        // stop when it no longer does.
        worker.publish();
        for address in addresses {
            worker.start_monitor(address);
        }

        runtime::spawn(worker.execute());

        Ok(Topology {
            watcher,
            updater,
            selection_timeout,
            _worker_handle: worker_handle,
        })
    }

    pub(crate) fn watcher(&self) -> TopologyWatcher {
        self.watcher.clone()
    }

    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    /// Select a server matching `criteria`, waiting for topology updates (and signalling the
    /// monitors to check immediately) until one is eligible or the selection timeout elapses.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<SelectedServer> {
        let start = Instant::now();
        let mut watcher = self.watcher.clone();

        loop {
            let state = watcher.observe_latest();

            if let Some(server) = server_selection::attempt_to_select_server(
                criteria,
                &state.description,
                &state.servers,
                deprioritized,
            )? {
                return Ok(server);
            }

            // While waiting, ask every monitor to probe now rather than on its next heartbeat.
            for server in state.servers.values() {
                server.request_immediate_check();
            }

            let remaining = match self.selection_timeout.checked_sub(start.elapsed()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    return Err(ErrorKind::ServerSelection {
                        message: state
                            .description
                            .server_selection_timeout_error_message(criteria),
                    }
                    .into())
                }
            };
            if !watcher.wait_for_update(remaining).await {
                let state = watcher.observe_latest();
                return Err(ErrorKind::ServerSelection {
                    message: state
                        .description
                        .server_selection_timeout_error_message(criteria),
                }
                .into());
            }
        }
    }

    /// Stop all monitors and close all pools.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }
}

/// A read handle onto the topology: cheap snapshot access plus change notifications.
#[derive(Clone, Debug)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    /// Whether the topology worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    /// Whether the topology still contains the given address.
    pub(crate) fn knows_address(&self, address: &ServerAddress) -> bool {
        self.receiver.borrow().servers.contains_key(address)
    }

    /// Clone the latest snapshot, marking it seen so that `wait_for_update` only wakes for
    /// subsequent changes.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    pub(crate) fn server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<ServerDescription> {
        self.receiver
            .borrow()
            .description
            .get_server_description(address)
            .cloned()
    }

    /// Wait up to `timeout` for the topology to change; true if it did.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        runtime::timeout(timeout, self.receiver.changed())
            .await
            .map(|changed| changed.is_ok())
            .unwrap_or(false)
    }
}

/// A write handle onto the topology: all mutations are serialized through the worker.
#[derive(Clone, Debug)]
pub(crate) struct TopologyUpdater {
    sender: mpsc::UnboundedSender<UpdateMessage>,
}

impl TopologyUpdater {
    /// Create an updater and the receiving end a worker consumes. Pool unit tests use a
    /// free-standing updater whose receiver is simply dropped.
    pub(crate) fn channel() -> (TopologyUpdater, UpdateReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (TopologyUpdater { sender }, UpdateReceiver { receiver })
    }

    /// Feed a new server description into the reducer, returning whether the topology changed.
    pub(crate) async fn update(&self, description: ServerDescription) -> bool {
        let (message, ack) = AcknowledgedMessage::package(Box::new(description));
        if self.sender.send(UpdateMessage::ServerUpdate(message)).is_err() {
            return false;
        }
        ack.wait_for_acknowledgment().await.unwrap_or(false)
    }

    /// Record a monitor-observed failure: the server is marked Unknown and its pool cleared.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        let (message, ack) = AcknowledgedMessage::package((address, error));
        if self
            .sender
            .send(UpdateMessage::MonitorError(message))
            .is_err()
        {
            return false;
        }
        ack.wait_for_acknowledgment().await.unwrap_or(false)
    }

    /// Record a failure observed by application traffic (including during connection
    /// establishment), applying the SDAM state-change rules.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let (message, ack) = AcknowledgedMessage::package((address, error, phase));
        if self
            .sender
            .send(UpdateMessage::ApplicationError(message))
            .is_err()
        {
            return false;
        }
        ack.wait_for_acknowledgment().await.unwrap_or(false)
    }

    pub(crate) async fn shutdown(&self) {
        let (message, ack) = AcknowledgedMessage::package(());
        if self.sender.send(UpdateMessage::Shutdown(message)).is_ok() {
            ack.wait_for_acknowledgment().await;
        }
    }
}

/// The receiving end of a [`TopologyUpdater`].
#[derive(Debug)]
pub(crate) struct UpdateReceiver {
    receiver: mpsc::UnboundedReceiver<UpdateMessage>,
}

impl UpdateReceiver {
    async fn recv(&mut self) -> Option<UpdateMessage> {
        self.receiver.recv().await
    }
}

#[derive(Debug)]
enum UpdateMessage {
    ServerUpdate(AcknowledgedMessage<Box<ServerDescription>, bool>),
    MonitorError(AcknowledgedMessage<(ServerAddress, Error), bool>),
    ApplicationError(AcknowledgedMessage<(ServerAddress, Error, HandshakePhase), bool>),
    Shutdown(AcknowledgedMessage<(), ()>),
}

/// The task that owns the topology state. All reducer applications, server additions/removals,
/// and pool pause/ready transitions happen here, in message order.
struct TopologyWorker {
    state: TopologyState,
    publisher: watch::Sender<TopologyState>,
    update_receiver: UpdateReceiver,
    handle_listener: WorkerHandleListener,
    options: ClientOptions,
    establisher: ConnectionEstablisher,
    event_emitter: EventEmitter<SdamEvent>,
    updater: TopologyUpdater,
    watcher: TopologyWatcher,
}

impl TopologyWorker {
    async fn execute(mut self) {
        loop {
            tokio::select! {
                biased;

                Some(message) = self.update_receiver.recv() => {
                    match message {
                        UpdateMessage::ServerUpdate(message) => {
                            let (description, ack) = message.into_parts();
                            let changed = self.apply_update(*description).await;
                            ack.acknowledge(changed);
                        }
                        UpdateMessage::MonitorError(message) => {
                            let ((address, error), ack) = message.into_parts();
                            let changed = self.handle_monitor_error(address, error).await;
                            ack.acknowledge(changed);
                        }
                        UpdateMessage::ApplicationError(message) => {
                            let ((address, error, phase), ack) = message.into_parts();
                            let changed = self.handle_application_error(address, error, phase).await;
                            ack.acknowledge(changed);
                        }
                        UpdateMessage::Shutdown(message) => {
                            let (_, ack) = message.into_parts();
                            self.shutdown().await;
                            ack.acknowledge(());
                            return;
                        }
                    }
                }
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
                else => break,
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        let servers: Vec<_> = self.state.servers.drain().map(|(_, server)| server).collect();
        for server in servers.iter() {
            self.event_emitter.emit(|| SdamEvent::ServerClosed {
                address: server.address.clone(),
            });
        }
        futures_util::future::join_all(servers.iter().map(|server| server.pool.close())).await;
        self.publish();
    }

    /// Run the reducer over a published server description, reconcile monitors and pools with
    /// the resulting host list, and publish the new state.
    async fn apply_update(&mut self, description: ServerDescription) -> bool {
        let server_available = description.is_available();
        let address = description.address.clone();

        let old_description = self.state.description.clone();
        let mut new_description = old_description.clone();
        if let Err(e) = new_description.update(description) {
            tracing::warn!(error = %e, "dropping invalid server description");
            return false;
        }

        let diff = new_description.diff_addresses(&old_description);
        for removed in diff.removed {
            if let Some(server) = self.state.servers.remove(&removed) {
                self.event_emitter.emit(|| SdamEvent::ServerClosed {
                    address: server.address.clone(),
                });
                server.pool.close().await;
            }
        }
        self.state.description = new_description.clone();
        for added in diff.added.iter() {
            self.add_server(added.clone());
        }

        let changed = new_description != old_description;
        if changed {
            self.event_emitter
                .emit(|| SdamEvent::TopologyDescriptionChanged {
                    new_description: new_description.to_string(),
                });
        }
        self.publish();
        for added in diff.added {
            self.start_monitor(added);
        }

        // A server that just completed a successful check can begin serving checkouts.
        if server_available {
            if let Some(server) = self.state.servers.get(&address) {
                server.pool.ready().await;
            }
        }

        changed
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        match self.state.servers.get(&address) {
            Some(server) => {
                // Monitor errors always pause the pool in addition to resetting the server.
                server.pool.clear(error.clone());
                self.apply_update(ServerDescription::new_from_error(address, error))
                    .await
            }
            None => false,
        }
    }

    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let server = match self.state.servers.get(&address) {
            Some(server) => server.clone(),
            None => return false,
        };

        // An error observed against an older pool generation describes a server instance that
        // has already been dealt with.
        if phase.generation() != server.pool.generation() {
            return false;
        }

        if error.is_state_change_error() {
            let updated = self
                .mark_server_unknown(address, error.clone())
                .await;
            if updated && error.clears_pool_on_state_change() {
                server.pool.clear(error);
            }
            server.request_immediate_check();
            updated
        } else if error.is_network_error() {
            let during_handshake = !matches!(phase, HandshakePhase::AfterCompletion { .. });
            if during_handshake || !error.is_network_timeout() {
                let updated = self.mark_server_unknown(address, error.clone()).await;
                if updated {
                    server.pool.clear(error);
                    server.cancel_current_check();
                }
                updated
            } else {
                // A timeout on an established connection says nothing about the server.
                false
            }
        } else if error.is_auth_error() {
            server.pool.clear(error);
            true
        } else {
            false
        }
    }

    async fn mark_server_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        self.apply_update(ServerDescription::new_from_error(address, error))
            .await
    }

    fn add_server(&mut self, address: ServerAddress) {
        let pool_options = ConnectionPoolOptions::from_client_options(&self.options);
        let pool = ConnectionPool::new(
            address.clone(),
            self.establisher.clone(),
            self.updater.clone(),
            Some(pool_options),
        );
        let server = Arc::new(Server::new(address.clone(), pool));

        self.event_emitter.emit(|| SdamEvent::ServerOpening {
            address: address.clone(),
        });
        self.state.servers.insert(address, server);
    }

    fn start_monitor(&self, address: ServerAddress) {
        let monitoring_disabled = self
            .options
            .test_options
            .as_ref()
            .map(|options| options.disable_monitoring_threads)
            .unwrap_or(false);
        if monitoring_disabled {
            return;
        }
        let server = match self.state.servers.get(&address) {
            Some(server) => server,
            None => return,
        };
        Monitor::start(
            address,
            self.updater.clone(),
            self.watcher.clone(),
            self.event_emitter.clone(),
            server.subscribe_to_check_requests(),
            server.subscribe_to_cancellations(),
            self.establisher.clone(),
            self.options.clone(),
        );
    }

    fn publish(&self) {
        let _: std::result::Result<_, _> = self.publisher.send(self.state.clone());
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{
        client::options::TestOptions,
        doc,
        sdam::description::topology::test::hello_description,
        selection_criteria::ReadPreference,
        ClientOptions,
    };

    fn test_topology(selection_timeout: Duration) -> Topology {
        let mut options = ClientOptions::builder()
            .hosts(vec![ServerAddress::parse("a:27017").unwrap()])
            .repl_set_name("rs0")
            .server_selection_timeout(selection_timeout)
            .build();
        options.test_options = Some(TestOptions {
            disable_monitoring_threads: true,
            ..Default::default()
        });
        Topology::new(options).unwrap()
    }

    fn primary_description() -> ServerDescription {
        let address = ServerAddress::parse("a:27017").unwrap();
        hello_description(
            &address,
            doc! {
                "isWritablePrimary": true,
                "setName": "rs0",
                "hosts": vec![crate::bson::Bson::String("a:27017".to_string())],
                "me": "a:27017",
                "minWireVersion": 6,
                "maxWireVersion": 17,
                "ok": 1.0,
            },
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn selection_times_out_with_no_eligible_server() {
        let topology = test_topology(Duration::from_millis(100));
        let err = topology
            .select_server(
                &SelectionCriteria::ReadPreference(ReadPreference::Primary),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::ServerSelection { .. }
        ));
    }

    #[tokio::test]
    async fn selection_wakes_on_topology_updates() {
        let topology = test_topology(Duration::from_secs(5));
        let updater = topology.updater();

        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(updater.update(primary_description()).await);
        });

        let selected = topology
            .select_server(
                &SelectionCriteria::ReadPreference(ReadPreference::Primary),
                None,
            )
            .await
            .unwrap();
        assert_eq!(selected.address.to_string(), "a:27017");
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn monitor_errors_mark_the_server_unknown_and_pause_its_pool() {
        let topology = test_topology(Duration::from_millis(100));
        let updater = topology.updater();
        let address = ServerAddress::parse("a:27017").unwrap();

        assert!(updater.update(primary_description()).await);
        assert!(
            updater
                .handle_monitor_error(address.clone(), crate::error::Error::network_timeout())
                .await
        );

        let state = topology.watcher().observe_latest();
        let description = state.description.get_server_description(&address).unwrap();
        assert!(!description.is_available());

        // The pool was cleared along with the reset, so checkouts fail fast.
        let server = state.servers.get(&address).unwrap();
        let err = server.pool.check_out().await.unwrap_err();
        assert!(err.is_pool_cleared());
    }
}
