//! Publicly visible views of the driver's cluster state.

use std::time::Duration;

use crate::{client::options::ServerAddress, selection_criteria::TagSet};

use super::description::server::ServerDescription;

pub use super::description::{
    server::{ServerDescriptionState, ServerType},
    topology::{ConnectionMode, TopologyType},
};

/// A view of the most recently observed state of one server, as passed to server-selection
/// predicates.
pub struct ServerInfo<'a> {
    description: &'a ServerDescription,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self { description }
    }

    /// The server's address.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// The server's type, as reported by its last heartbeat.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// The moving average of the server's heartbeat round trip time.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// The replica set tags the server advertises.
    pub fn tags(&self) -> Option<&TagSet> {
        self.description.tags()
    }

    /// The name of the replica set the server belongs to.
    pub fn set_name(&self) -> Option<String> {
        self.description.set_name()
    }

    /// Whether the server has been successfully contacted since monitoring began or was last
    /// reset.
    pub fn state(&self) -> ServerDescriptionState {
        self.description.state()
    }
}

impl std::fmt::Debug for ServerInfo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInfo")
            .field("address", self.address())
            .field("server_type", &self.server_type())
            .finish()
    }
}
