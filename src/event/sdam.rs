//! Events emitted by the cluster monitor.

use std::time::Duration;

use crate::{bson::Document, client::options::ServerAddress, error::Error};

/// An event emitted by server discovery and monitoring.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum SdamEvent {
    /// A monitor was started for a newly discovered server.
    ServerOpening {
        /// The server's address.
        address: ServerAddress,
    },

    /// A server was removed from the topology and its monitor stopped.
    ServerClosed {
        /// The server's address.
        address: ServerAddress,
    },

    /// The topology changed shape or a member changed state.
    TopologyDescriptionChanged {
        /// A rendering of the new topology.
        new_description: String,
    },

    /// A heartbeat was sent to a server.
    ServerHeartbeatStarted {
        /// The server's address.
        address: ServerAddress,
        /// Whether the heartbeat used the streaming protocol.
        awaited: bool,
    },

    /// A heartbeat reply was received.
    ServerHeartbeatSucceeded {
        /// The server's address.
        address: ServerAddress,
        /// The heartbeat round trip time.
        duration: Duration,
        /// The server's `hello` reply.
        reply: Document,
    },

    /// A heartbeat failed.
    ServerHeartbeatFailed {
        /// The server's address.
        address: ServerAddress,
        /// The heartbeat round trip time.
        duration: Duration,
        /// The failure.
        failure: Error,
    },
}
