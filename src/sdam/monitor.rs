use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::watch;

use super::{
    description::server::{ServerDescription, TopologyVersion},
    topology::{TopologyUpdater, TopologyWatcher},
};
use crate::{
    client::options::{ClientOptions, MonitoringMode, ServerAddress},
    cmap::{establish::ConnectionEstablisher, Connection, RawCommandResponse},
    error::Result,
    event::{sdam::SdamEvent, EventEmitter},
    hello::{hello_command, run_hello, AwaitableHelloOptions, HelloReply},
    runtime,
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// The weight of each new round-trip-time sample in the exponentially weighted moving average.
const RTT_SAMPLE_WEIGHT: f64 = 0.2;

/// A moving estimate of a server's round trip time, shared between a monitor and its RTT task.
#[derive(Clone, Debug, Default)]
pub(crate) struct RttInfo {
    inner: Arc<Mutex<Option<Duration>>>,
}

impl RttInfo {
    /// Fold a new sample into the average.
    pub(crate) fn add_sample(&self, sample: Duration) {
        let mut average = self.inner.lock().unwrap();
        *average = Some(match *average {
            Some(old) => old.mul_f64(1.0 - RTT_SAMPLE_WEIGHT) + sample.mul_f64(RTT_SAMPLE_WEIGHT),
            None => sample,
        });
    }

    pub(crate) fn average(&self) -> Option<Duration> {
        *self.inner.lock().unwrap()
    }

    pub(crate) fn reset(&self) {
        *self.inner.lock().unwrap() = None;
    }
}

/// Monitor that performs regular heartbeats to determine server status, feeding the topology's
/// reducer.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    event_emitter: EventEmitter<SdamEvent>,
    client_options: ClientOptions,

    /// Receives requests for an immediate check, sent by server selection when it comes up
    /// empty and by the error-handling paths.
    check_request_receiver: watch::Receiver<()>,

    /// Receives requests to abandon the in-flight check and reconnect.
    cancellation_receiver: watch::Receiver<()>,

    /// The moving round-trip-time estimate. While streaming, a dedicated RTT task keeps this
    /// fresh, since the streamed replies' timing reflects server-side waits rather than network
    /// latency.
    rtt: RttInfo,

    /// Whether the RTT task has been spawned.
    rtt_monitor_started: bool,

    /// Whether the monitor is in streaming mode: the server holds the previous awaitable hello
    /// open and sends replies as exhaust messages.
    streaming: bool,

    /// The server's last reported topology version; its presence enables streaming.
    topology_version: Option<TopologyVersion>,

    /// Whether the server understands the `hello` command name.
    hello_ok: Option<bool>,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        event_emitter: EventEmitter<SdamEvent>,
        check_request_receiver: watch::Receiver<()>,
        cancellation_receiver: watch::Receiver<()>,
        establisher: ConnectionEstablisher,
        client_options: ClientOptions,
    ) {
        let monitor = Self {
            address,
            connection: None,
            establisher,
            topology_updater,
            topology_watcher,
            event_emitter,
            client_options,
            check_request_receiver,
            cancellation_receiver,
            rtt: RttInfo::default(),
            rtt_monitor_started: false,
            streaming: false,
            topology_version: None,
            hello_ok: None,
        };
        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self.heartbeat_frequency();

        while self.topology_watcher.is_alive() && self.topology_watcher.knows_address(&self.address)
        {
            self.check_server().await;

            if self.streaming {
                // The next iteration reads the next streamed reply directly.
                continue;
            }

            let min_frequency = self.min_frequency();
            runtime::delay_for(min_frequency).await;
            self.wait_for_check_request(heartbeat_frequency.saturating_sub(min_frequency))
                .await;
        }
    }

    /// Check the server with one hello round trip (or one streamed reply), publishing the
    /// outcome. A network error against a previously-available server is retried once.
    async fn check_server(&mut self) {
        let check_result = match self.perform_check().await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.reset_connection();
                let previously_available = self
                    .topology_watcher
                    .server_description(&self.address)
                    .map(|description| description.is_available())
                    .unwrap_or(false);
                if e.is_network_error() && previously_available {
                    self.topology_updater
                        .handle_monitor_error(self.address.clone(), e)
                        .await;
                    self.perform_check().await
                } else {
                    Err(e)
                }
            }
        };

        match check_result {
            Ok(reply) => {
                if let Some(new_version) = reply.command_response.topology_version {
                    let supersedes = self
                        .topology_version
                        .map(|old| new_version.supersedes(old))
                        .unwrap_or(true);
                    if supersedes {
                        self.topology_version = Some(new_version);
                    }
                }
                self.hello_ok = Some(
                    reply
                        .command_response
                        .hello_ok
                        .unwrap_or(self.hello_ok.unwrap_or(false)),
                );
                let description = ServerDescription::new_from_hello_reply(
                    self.address.clone(),
                    reply,
                    self.rtt.average().unwrap_or(Duration::ZERO),
                );
                self.topology_updater.update(description).await;
            }
            Err(e) => {
                self.reset_connection();
                self.topology_updater
                    .handle_monitor_error(self.address.clone(), e)
                    .await;
            }
        }
    }

    async fn perform_check(&mut self) -> Result<HelloReply> {
        self.event_emitter.emit(|| SdamEvent::ServerHeartbeatStarted {
            address: self.address.clone(),
            awaited: self.streaming,
        });

        let mut cancellation = self.cancellation_receiver.clone();
        // Only cancellations requested after this point apply to this check.
        cancellation.borrow_and_update();

        let start = Instant::now();
        let result = tokio::select! {
            biased;

            _ = cancellation.changed() => {
                Err(crate::error::ErrorKind::from(std::io::ErrorKind::Interrupted).into())
            }
            result = self.one_hello_roundtrip() => result,
        };
        let duration = start.elapsed();

        match result {
            Ok((reply, timed)) => {
                if timed {
                    self.rtt.add_sample(duration);
                }
                self.event_emitter
                    .emit(|| SdamEvent::ServerHeartbeatSucceeded {
                        address: self.address.clone(),
                        duration,
                        reply: reply.raw_command_response.clone(),
                    });
                Ok(reply)
            }
            Err(e) => {
                self.event_emitter.emit(|| SdamEvent::ServerHeartbeatFailed {
                    address: self.address.clone(),
                    duration,
                    failure: e.clone(),
                });
                Err(e)
            }
        }
    }

    /// Perform one hello exchange: a fresh handshake when there is no connection, a streamed
    /// read when streaming, or a plain (possibly awaitable) hello otherwise. Returns the reply
    /// and whether its timing is a valid RTT sample.
    async fn one_hello_roundtrip(&mut self) -> Result<(HelloReply, bool)> {
        let connection = match self.connection.take() {
            None => {
                let (connection, reply) = self
                    .establisher
                    .establish_monitoring_connection(self.address.clone())
                    .await?;
                self.connection = Some(connection);
                self.streaming = false;
                return Ok((reply, true));
            }
            Some(connection) => connection,
        };

        let result = if self.streaming {
            let exchange = async {
                let message = connection.receive_exhaust_message().await?;
                RawCommandResponse::new(self.address.clone(), message.into_body())
                    .into_hello_reply(self.address.clone())
            };
            match exchange.await {
                Ok(reply) => {
                    if !connection.is_streaming() {
                        self.streaming = false;
                    }
                    // Streamed replies wait on the server for up to the heartbeat period, so
                    // their timing says nothing about the network.
                    Ok((reply, false))
                }
                Err(e) => Err(e),
            }
        } else {
            let awaitable_options =
                self.streamable_topology_version()
                    .map(|topology_version| AwaitableHelloOptions {
                        topology_version,
                        max_await_time: self.heartbeat_frequency(),
                    });
            let starting_stream = awaitable_options.is_some();
            let command = hello_command(
                self.hello_ok,
                self.client_options.app_name.as_deref(),
                awaitable_options,
            );
            match run_hello(&connection, command).await {
                Ok(reply) => {
                    if starting_stream && connection.is_streaming() {
                        self.streaming = true;
                        self.start_rtt_monitor();
                    }
                    Ok((reply, !starting_stream))
                }
                Err(e) => Err(e),
            }
        };

        self.connection = Some(connection);
        result
    }

    /// The topology version to stream against, when streaming is permitted.
    fn streamable_topology_version(&self) -> Option<TopologyVersion> {
        let mode = self
            .client_options
            .monitoring_mode
            .unwrap_or_default();
        let streaming_allowed = match mode {
            MonitoringMode::Poll => false,
            MonitoringMode::Stream => true,
            MonitoringMode::Auto => !runtime::is_faas(),
        };
        if streaming_allowed {
            self.topology_version
        } else {
            None
        }
    }

    fn reset_connection(&mut self) {
        self.connection = None;
        self.streaming = false;
        self.rtt.reset();
    }

    fn start_rtt_monitor(&mut self) {
        if self.rtt_monitor_started {
            return;
        }
        self.rtt_monitor_started = true;
        let rtt_monitor = RttMonitor {
            address: self.address.clone(),
            connection: None,
            establisher: self.establisher.clone(),
            topology_watcher: self.topology_watcher.clone(),
            rtt: self.rtt.clone(),
            frequency: self.heartbeat_frequency().max(MIN_HEARTBEAT_FREQUENCY),
        };
        runtime::spawn(rtt_monitor.execute());
    }

    async fn wait_for_check_request(&mut self, timeout: Duration) {
        let _ = runtime::timeout(timeout, self.check_request_receiver.changed()).await;
    }

    fn heartbeat_frequency(&self) -> Duration {
        self.client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    fn min_frequency(&self) -> Duration {
        let test_override = self
            .client_options
            .test_options
            .as_ref()
            .and_then(|options| options.min_heartbeat_freq);
        test_override.unwrap_or(MIN_HEARTBEAT_FREQUENCY)
    }
}

/// A dedicated task that keeps a server's round-trip-time estimate current while its monitor is
/// in streaming mode, using plain hellos on its own connection.
struct RttMonitor {
    address: ServerAddress,
    connection: Option<Connection>,
    establisher: ConnectionEstablisher,
    topology_watcher: TopologyWatcher,
    rtt: RttInfo,
    frequency: Duration,
}

impl RttMonitor {
    async fn execute(mut self) {
        while self.topology_watcher.is_alive() {
            let start = Instant::now();
            let result = self.ping().await;
            match result {
                Ok(()) => self.rtt.add_sample(start.elapsed()),
                Err(_) => {
                    self.connection = None;
                }
            }
            runtime::delay_for(self.frequency).await;
        }
    }

    async fn ping(&mut self) -> Result<()> {
        match self.connection {
            None => {
                let (connection, _) = self
                    .establisher
                    .establish_monitoring_connection(self.address.clone())
                    .await?;
                self.connection = Some(connection);
                Ok(())
            }
            Some(ref conn) => {
                let hello_ok = conn
                    .stream_description()
                    .map(|sd| sd.hello_ok)
                    .unwrap_or(false);
                let command = hello_command(Some(hello_ok), None, None);
                run_hello(conn, command).await.map(drop)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn rtt_average_is_exponentially_weighted() {
        let rtt = RttInfo::default();
        assert_eq!(rtt.average(), None);

        rtt.add_sample(Duration::from_millis(100));
        assert_eq!(rtt.average(), Some(Duration::from_millis(100)));

        // new = 0.2 * sample + 0.8 * old
        rtt.add_sample(Duration::from_millis(200));
        assert_relative_eq!(
            rtt.average().unwrap().as_secs_f64(),
            0.120,
            epsilon = 1e-9
        );

        rtt.add_sample(Duration::from_millis(50));
        assert_relative_eq!(
            rtt.average().unwrap().as_secs_f64(),
            0.8 * 0.120 + 0.2 * 0.050,
            epsilon = 1e-9
        );

        rtt.reset();
        assert_eq!(rtt.average(), None);
    }
}
