use std::{collections::HashSet, time::Duration};

use serde::Deserialize;

use crate::{
    bson::{oid::ObjectId, DateTime, Document},
    client::options::ServerAddress,
    doc,
    error::{Error, Result},
    hello::HelloReply,
    selection_criteria::TagSet,
};

/// The possible types for a server.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica-set mongod.
    Standalone,

    /// A router to a sharded cluster.
    Mongos,

    /// A replica set primary.
    RsPrimary,

    /// A replica set secondary.
    RsSecondary,

    /// A replica set arbiter.
    RsArbiter,

    /// A replica set member that is none of the other types (a passive, for example).
    RsOther,

    /// A replica set member that does not report a set name or a hosts list.
    RsGhost,

    /// A load balancer in front of a cluster.
    LoadBalancer,

    /// A server whose type is not yet known.
    #[default]
    Unknown,
}

impl ServerType {
    /// Whether this server can hold data.
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
                | ServerType::LoadBalancer
        )
    }

    /// Whether the server is in a state where it can accept application traffic.
    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown | ServerType::RsGhost)
    }
}

/// The monitoring connection state of a server, per the SDAM data model: `Connected` once a
/// successful `hello` reply has been observed, `Connecting` otherwise.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServerDescriptionState {
    /// No successful reply has been observed since the last reset.
    Connecting,
    /// The last observation was a successful reply.
    Connected,
}

/// An identifier for a server process incarnation. A description whose `process_id` differs
/// from the previous one is a fresh server identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TopologyVersion {
    pub(crate) process_id: ObjectId,
    pub(crate) counter: i64,
}

impl TopologyVersion {
    pub(crate) fn to_document(self) -> Document {
        doc! {
            "processId": self.process_id,
            "counter": self.counter,
        }
    }

    /// Whether a description carrying `self` supersedes one carrying `previous`.
    pub(crate) fn supersedes(self, previous: TopologyVersion) -> bool {
        self.process_id != previous.process_id || self.counter >= previous.counter
    }
}

/// A description of the most up-to-date information known about a server.
#[derive(Debug, Clone)]
pub(crate) struct ServerDescription {
    /// The address of this server.
    pub(crate) address: ServerAddress,

    /// The type of this server.
    pub(crate) server_type: ServerType,

    /// The last time this server was updated.
    pub(crate) last_update_time: Option<DateTime>,

    /// The average duration of this server's hello calls.
    pub(crate) average_round_trip_time: Option<Duration>,

    /// The last successful hello reply, the error that last failed, or `Ok(None)` for a server
    /// that has not been contacted yet.
    pub(crate) reply: std::result::Result<Option<HelloReply>, Error>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }
        match (&self.reply, &other.reply) {
            (Ok(a), Ok(b)) => {
                a.as_ref().map(|r| &r.raw_command_response)
                    == b.as_ref().map(|r| &r.raw_command_response)
            }
            (Err(a), Err(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

impl ServerDescription {
    /// A description for a server that has not been contacted yet.
    pub(crate) fn new(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            last_update_time: None,
            average_round_trip_time: None,
            reply: Ok(None),
        }
    }

    /// A description derived from a successful hello reply.
    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        // Normalize all addresses to lowercase per the SDAM spec.
        reply.command_response.me = reply.command_response.me.map(|me| me.to_lowercase());
        let server_type = reply.command_response.server_type();
        Self {
            address,
            server_type,
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: Some(average_rtt),
            reply: Ok(Some(reply)),
        }
    }

    /// A description for a server that failed a check.
    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: None,
            reply: Err(error),
        }
    }

    /// The monitoring state implied by the last observation.
    pub(crate) fn state(&self) -> ServerDescriptionState {
        match self.reply {
            Ok(Some(_)) => ServerDescriptionState::Connected,
            _ => ServerDescriptionState::Connecting,
        }
    }

    /// Whether the last check of this server succeeded.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    /// The `ok` field of the last reply: true iff the server answered successfully.
    pub(crate) fn ok(&self) -> bool {
        matches!(self.reply, Ok(Some(_)))
    }

    /// The error observed during the last failed check, if any.
    pub(crate) fn error(&self) -> Option<&Error> {
        self.reply.as_ref().err()
    }

    pub(crate) fn hello_response(&self) -> Option<&crate::hello::HelloCommandResponse> {
        match self.reply {
            Ok(Some(ref reply)) => Some(&reply.command_response),
            _ => None,
        }
    }

    /// All addresses this server claims are part of its replica set
    /// (`hosts ∪ passives ∪ arbiters`).
    pub(crate) fn known_hosts(&self) -> Result<HashSet<ServerAddress>> {
        let mut known_hosts = HashSet::new();
        if let Some(response) = self.hello_response() {
            for list in [&response.hosts, &response.passives, &response.arbiters] {
                for host in list.iter().flatten() {
                    known_hosts.insert(ServerAddress::parse(host.to_lowercase())?);
                }
            }
        }
        Ok(known_hosts)
    }

    /// Whether the server's reported "me" address mismatches the address it was contacted at.
    pub(crate) fn invalid_me(&self) -> Result<bool> {
        if let Some(me) = self.hello_response().and_then(|r| r.me.as_ref()) {
            return Ok(&ServerAddress::parse(me)? != &self.address);
        }
        Ok(false)
    }

    pub(crate) fn set_name(&self) -> Option<String> {
        self.hello_response().and_then(|r| r.set_name.clone())
    }

    pub(crate) fn set_version(&self) -> Option<i32> {
        self.hello_response().and_then(|r| r.set_version)
    }

    pub(crate) fn election_id(&self) -> Option<ObjectId> {
        self.hello_response().and_then(|r| r.election_id)
    }

    pub(crate) fn tags(&self) -> Option<&TagSet> {
        self.hello_response().and_then(|r| r.tags.as_ref())
    }

    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(Some(ref reply)) => reply.command_response.topology_version,
            _ => None,
        }
    }

    pub(crate) fn min_wire_version(&self) -> Option<i32> {
        self.hello_response().and_then(|r| r.min_wire_version)
    }

    pub(crate) fn max_wire_version(&self) -> Option<i32> {
        self.hello_response().and_then(|r| r.max_wire_version)
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.hello_response()
            .and_then(|r| r.logical_session_timeout_minutes)
            .map(|timeout| Duration::from_secs(timeout.max(0) as u64 * 60))
    }

    pub(crate) fn last_write_date(&self) -> Option<DateTime> {
        self.hello_response()
            .and_then(|r| r.last_write.as_ref())
            .map(|lw| lw.last_write_date)
    }

    /// Whether this server's tags contain every tag in `tag_set`. An empty set matches any
    /// server.
    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.tags() {
            Some(tags) => tags,
            None => return tag_set.is_empty(),
        };
        tag_set
            .iter()
            .all(|(key, value)| server_tags.get(key) == Some(value))
    }

    /// An error message if this server's advertised wire version range does not overlap the
    /// driver's.
    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if !self.ok() {
            return None;
        }
        let server_min = self.min_wire_version().unwrap_or(0);
        let server_max = self.max_wire_version().unwrap_or(0);
        if server_min > super::topology::MAX_DRIVER_WIRE_VERSION {
            return Some(format!(
                "Server at {} requires wire version {}, but this version of the driver only \
                 supports up to {}",
                self.address,
                server_min,
                super::topology::MAX_DRIVER_WIRE_VERSION
            ));
        }
        if server_max < super::topology::MIN_DRIVER_WIRE_VERSION {
            return Some(format!(
                "Server at {} reports wire version {}, but this version of the driver requires \
                 at least {}",
                self.address,
                server_max,
                super::topology::MIN_DRIVER_WIRE_VERSION
            ));
        }
        None
    }
}
