//! Server discovery and monitoring: per-server heartbeat monitors feed an immutable
//! cluster-description snapshot through a single-threaded reducer, and server selection waits
//! on snapshot changes.

pub(crate) mod description;
mod monitor;
pub mod public;
mod server;
mod topology;

pub(crate) use self::{
    description::{
        server::{ServerDescription, TopologyVersion},
        topology::TopologyDescription,
    },
    monitor::{DEFAULT_HEARTBEAT_FREQUENCY, MIN_HEARTBEAT_FREQUENCY},
    server::Server,
    topology::{SelectedServer, Topology, TopologyUpdater, TopologyWatcher},
};

use crate::cmap::Connection;

/// How far a connection had gotten through establishment when an error occurred. SDAM reacts
/// differently to failures during the handshake than to failures on established connections,
/// and uses the recorded generation to discard reports about already-replaced server
/// incarnations.
#[derive(Clone, Debug)]
pub(crate) enum HandshakePhase {
    /// The error occurred before the initial hello was sent.
    PreHello { generation: u32 },

    /// The error occurred after the initial hello was sent but before the handshake completed.
    PostHello { generation: u32 },

    /// The error occurred on an established connection.
    AfterCompletion {
        generation: u32,
        max_wire_version: Option<i32>,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(connection: &Connection) -> Self {
        Self::AfterCompletion {
            generation: connection.generation,
            max_wire_version: connection
                .stream_description()
                .ok()
                .and_then(|sd| sd.max_wire_version),
        }
    }

    pub(crate) fn generation(&self) -> u32 {
        match self {
            Self::PreHello { generation }
            | Self::PostHello { generation }
            | Self::AfterCompletion { generation, .. } => *generation,
        }
    }
}
