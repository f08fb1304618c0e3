pub(crate) mod server_selection;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use crate::{
    bson::oid::ObjectId,
    client::options::{ClientOptions, ServerAddress},
    error::Result,
    sdam::description::server::{ServerDescription, ServerType},
};

/// The lowest server wire version this driver speaks (MongoDB 3.6).
pub(crate) const MIN_DRIVER_WIRE_VERSION: i32 = 6;

/// The highest server wire version this driver speaks.
pub(crate) const MAX_DRIVER_WIRE_VERSION: i32 = 21;

/// The possible types for a topology.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A topology fronted by a load balancer.
    LoadBalanced,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

/// How the client routes connections to the deployment.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConnectionMode {
    /// Connect only to the configured host.
    Single,

    /// Discover and connect to the whole deployment.
    Multiple,

    /// Delegate routing to a load balancer.
    LoadBalanced,
}

/// A description of the most up-to-date information known about a topology.
#[derive(Debug, Clone)]
pub(crate) struct TopologyDescription {
    /// Whether or not the topology was initialized with a single seed.
    pub(crate) single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// How the client routes connections.
    pub(crate) connection_mode: ConnectionMode,

    /// The replica set name of the topology.
    pub(crate) set_name: Option<String>,

    /// The highest replica set version the driver has seen by a member of the topology.
    pub(crate) max_set_version: Option<i32>,

    /// The highest replica set election id the driver has seen by a member of the topology.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between the driver and server with regards to the
    /// respective supported wire versions.
    pub(crate) compatibility_error: Option<String>,

    /// The time a logical session remains active after its most recent use; the minimum over
    /// the data-bearing servers, or `None` if any of them does not support sessions.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The width of the latency window applied during server selection.
    pub(crate) local_threshold: Option<Duration>,

    /// The heartbeat frequency, used by max-staleness calculations.
    pub(crate) heartbeat_freq: Option<Duration>,

    /// The server descriptions of each member of the topology.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        self.topology_type == other.topology_type
            && self.set_name == other.set_name
            && self.servers == other.servers
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ Type: {:?}, Mode: {:?}",
            self.topology_type, self.connection_mode
        )?;
        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {}", set_name)?;
        }
        for server in self.servers.values() {
            write!(f, ", Server {}: {:?}", server.address, server.server_type)?;
            if let Some(error) = server.error() {
                write!(f, " ({})", error)?;
            }
        }
        f.write_str(" }")
    }
}

impl TopologyDescription {
    pub(crate) fn new(options: &ClientOptions) -> Result<Self> {
        options.validate()?;

        let topology_type = if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else if options.direct_connection == Some(true) {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        };

        let connection_mode = if options.direct_connection == Some(true)
            || (options.hosts.len() == 1 && options.repl_set_name.is_none())
        {
            ConnectionMode::Single
        } else {
            ConnectionMode::Multiple
        };

        let servers: HashMap<_, _> = options
            .hosts
            .iter()
            .map(|address| (address.clone(), ServerDescription::new(address.clone())))
            .collect();

        Ok(Self {
            single_seed: servers.len() == 1,
            topology_type,
            connection_mode,
            set_name: options.repl_set_name.clone(),
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            logical_session_timeout: None,
            local_threshold: options.local_threshold,
            heartbeat_freq: options.heartbeat_freq,
            servers,
        })
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    /// The cluster is compatible iff every contacted server's wire version range overlaps the
    /// driver's.
    fn check_compatibility(&mut self) {
        self.compatibility_error = None;
        for server in self.servers.values() {
            if let Some(message) = server.compatibility_error_message() {
                self.compatibility_error = Some(message);
                return;
            }
        }
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    /// Recompute the logical session timeout as the minimum over data-bearing servers.
    fn update_logical_session_timeout(&mut self) {
        self.logical_session_timeout = self
            .servers
            .values()
            .filter(|server| server.server_type.is_data_bearing())
            .try_fold(None::<Duration>, |min, server| {
                let timeout = server.logical_session_timeout()?;
                Some(Some(min.map_or(timeout, |min| min.min(timeout))))
            })
            .flatten();
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|server| server.is_available())
    }

    /// Update the topology based on the new information contained by the ServerDescription.
    ///
    /// This is the single-threaded SDAM reducer: all monitor publications are serialized
    /// through it.
    pub(crate) fn update(&mut self, server_description: ServerDescription) -> Result<()> {
        // Ignore updates from servers not currently in the cluster.
        if !self.servers.contains_key(&server_description.address) {
            return Ok(());
        }

        // A description from a different server process incarnation is a fresh identity and is
        // always applied.
        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        match self.topology_type {
            TopologyType::Single | TopologyType::LoadBalanced => {}
            TopologyType::Unknown => self.update_unknown_topology(server_description)?,
            TopologyType::Sharded => self.update_sharded_topology(server_description),
            TopologyType::ReplicaSetNoPrimary => {
                self.update_replica_set_no_primary_topology(server_description)?
            }
            TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_with_primary_topology(server_description)?;
            }
        }

        self.check_compatibility();
        self.update_logical_session_timeout();

        Ok(())
    }

    /// Update the Unknown topology description based on the server description.
    fn update_unknown_topology(&mut self, server_description: ServerDescription) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {}
            ServerType::Standalone => {
                self.update_unknown_with_standalone_server(server_description)
            }
            ServerType::Mongos => self.topology_type = TopologyType::Sharded,
            ServerType::RsPrimary => {
                self.update_rs_from_primary_server(server_description)?;
            }
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_without_primary_server(server_description)?;
            }
            ServerType::LoadBalancer => self.topology_type = TopologyType::LoadBalanced,
        }

        Ok(())
    }

    /// Update the Sharded topology description based on the server description.
    fn update_sharded_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::Mongos => {}
            _ => {
                self.servers.remove(&server_description.address);
            }
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the server description.
    fn update_replica_set_no_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {}
            ServerType::Standalone | ServerType::Mongos | ServerType::LoadBalancer => {
                self.servers.remove(&server_description.address);
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_without_primary_server(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the server description.
    fn update_replica_set_with_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {
                self.record_primary_state();
            }
            ServerType::Standalone | ServerType::Mongos | ServerType::LoadBalancer => {
                self.servers.remove(&server_description.address);
                self.record_primary_state();
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_with_primary_from_member(server_description)?;
            }
        }

        Ok(())
    }

    /// Update the Unknown topology description based on the Standalone server description.
    fn update_unknown_with_standalone_server(&mut self, server_description: ServerDescription) {
        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(&server_description.address);
        }
    }

    /// Update the ReplicaSetNoPrimary topology description based on the non-primary server
    /// description.
    fn update_rs_without_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name();
        } else if self.set_name != server_description.set_name() {
            self.servers.remove(&server_description.address);
            return Ok(());
        }

        self.add_new_servers(server_description.known_hosts()?);

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }

        Ok(())
    }

    /// Update the ReplicaSetWithPrimary topology description based on the non-primary server
    /// description.
    fn update_rs_with_primary_from_member(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name != server_description.set_name() {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return Ok(());
        }

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return Ok(());
        }

        Ok(())
    }

    /// Update the replica set topology description based on an RSPrimary server description.
    fn update_rs_from_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name();
        } else if self.set_name != server_description.set_name() {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return Ok(());
        }

        if let Some(server_set_version) = server_description.set_version() {
            if let Some(server_election_id) = server_description.election_id() {
                if let (Some(max_set_version), Some(max_election_id)) =
                    (self.max_set_version, self.max_election_id)
                {
                    // A stale primary claim: its (setVersion, electionId) pair is older than
                    // the maximum the driver has observed, so the server is demoted to Unknown.
                    if max_set_version > server_set_version
                        || (max_set_version == server_set_version
                            && max_election_id > server_election_id)
                    {
                        self.servers.insert(
                            server_description.address.clone(),
                            ServerDescription::new(server_description.address),
                        );
                        self.record_primary_state();
                        return Ok(());
                    }
                }

                self.max_election_id = Some(server_election_id);
            }
        }

        if let Some(server_set_version) = server_description.set_version() {
            if self
                .max_set_version
                .map(|max_set_version| server_set_version > max_set_version)
                .unwrap_or(true)
            {
                self.max_set_version = Some(server_set_version);
            }
        }

        // Any other server claiming to be primary is replaced with an unknown description,
        // which will cause it to be re-checked.
        let addresses: Vec<_> = self.servers.keys().cloned().collect();
        for address in addresses.iter() {
            if address == &server_description.address {
                continue;
            }
            if self
                .servers
                .get(address)
                .map(|server| server.server_type == ServerType::RsPrimary)
                .unwrap_or(false)
            {
                self.servers
                    .insert(address.clone(), ServerDescription::new(address.clone()));
            }
        }

        let known_hosts = server_description.known_hosts()?;
        self.add_new_servers(known_hosts.clone());
        for address in addresses {
            if !known_hosts.contains(&address) {
                self.servers.remove(&address);
            }
        }

        self.record_primary_state();

        Ok(())
    }

    /// Inspect the topology for a primary server, and update the topology type to
    /// ReplicaSetNoPrimary if none is found.
    ///
    /// This should only be called on a replica set topology.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Create a new ServerDescription for each address and add it to the topology.
    fn add_new_servers(&mut self, addresses: impl IntoIterator<Item = ServerAddress>) {
        for address in addresses {
            if !self.servers.contains_key(&address) {
                self.servers
                    .insert(address.clone(), ServerDescription::new(address));
            }
        }
    }

    /// The addresses added and removed relative to `previous`; the topology worker uses this to
    /// start and stop monitors.
    pub(crate) fn diff_addresses(&self, previous: &TopologyDescription) -> TopologyDescriptionDiff {
        let current: HashSet<&ServerAddress> = self.servers.keys().collect();
        let old: HashSet<&ServerAddress> = previous.servers.keys().collect();
        TopologyDescriptionDiff {
            added: current.difference(&old).map(|a| (*a).clone()).collect(),
            removed: old.difference(&current).map(|a| (*a).clone()).collect(),
        }
    }
}

/// The servers added and removed between two topology descriptions.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff {
    pub(crate) added: Vec<ServerAddress>,
    pub(crate) removed: Vec<ServerAddress>,
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        bson::{de::from_document, oid::ObjectId, Document},
        doc,
        hello::{HelloCommandResponse, HelloReply},
        ClientOptions,
    };
    use std::time::Duration;

    pub(crate) fn hello_description(
        address: &ServerAddress,
        hello: Document,
        rtt: Duration,
    ) -> ServerDescription {
        let command_response: HelloCommandResponse = from_document(hello.clone()).unwrap();
        ServerDescription::new_from_hello_reply(
            address.clone(),
            HelloReply {
                server_address: address.clone(),
                command_response,
                raw_command_response: hello,
            },
            rtt,
        )
    }

    fn rs_options() -> ClientOptions {
        ClientOptions::builder()
            .hosts(vec![
                ServerAddress::parse("a:27017").unwrap(),
                ServerAddress::parse("b:27017").unwrap(),
            ])
            .repl_set_name("rs0")
            .build()
    }

    fn primary_hello(me: &str, set_version: i32, election_id: ObjectId) -> Document {
        doc! {
            "isWritablePrimary": true,
            "setName": "rs0",
            "setVersion": set_version,
            "electionId": election_id,
            "hosts": vec![
                crate::bson::Bson::String("a:27017".to_string()),
                crate::bson::Bson::String("b:27017".to_string()),
            ],
            "me": me,
            "minWireVersion": 6,
            "maxWireVersion": 17,
            "ok": 1.0,
        }
    }

    #[test]
    fn stale_primary_is_demoted_to_unknown() {
        let options = rs_options();
        let mut description = TopologyDescription::new(&options).unwrap();
        let a = ServerAddress::parse("a:27017").unwrap();
        let b = ServerAddress::parse("b:27017").unwrap();

        let election_id = ObjectId::parse_str("aaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        description
            .update(hello_description(
                &a,
                primary_hello("a:27017", 2, election_id),
                Duration::from_millis(10),
            ))
            .unwrap();
        assert_eq!(
            description.topology_type,
            TopologyType::ReplicaSetWithPrimary
        );
        assert_eq!(description.max_set_version, Some(2));

        // An older claim from a different address must not unseat the first primary.
        description
            .update(hello_description(
                &b,
                primary_hello("b:27017", 1, election_id),
                Duration::from_millis(10),
            ))
            .unwrap();

        assert_eq!(
            description.servers.get(&b).unwrap().server_type,
            ServerType::Unknown
        );
        assert_eq!(
            description.servers.get(&a).unwrap().server_type,
            ServerType::RsPrimary
        );
        assert_eq!(
            description.topology_type,
            TopologyType::ReplicaSetWithPrimary
        );
    }

    #[test]
    fn newer_primary_replaces_older_one() {
        let options = rs_options();
        let mut description = TopologyDescription::new(&options).unwrap();
        let a = ServerAddress::parse("a:27017").unwrap();
        let b = ServerAddress::parse("b:27017").unwrap();

        let election_id = ObjectId::parse_str("aaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        description
            .update(hello_description(
                &a,
                primary_hello("a:27017", 1, election_id),
                Duration::from_millis(10),
            ))
            .unwrap();
        description
            .update(hello_description(
                &b,
                primary_hello("b:27017", 2, election_id),
                Duration::from_millis(10),
            ))
            .unwrap();

        // The old primary is reset to Unknown pending a re-check; the new one stands.
        assert_eq!(
            description.servers.get(&a).unwrap().server_type,
            ServerType::Unknown
        );
        assert_eq!(
            description.servers.get(&b).unwrap().server_type,
            ServerType::RsPrimary
        );
        assert_eq!(description.max_set_version, Some(2));
    }

    #[test]
    fn primary_hello_reconciles_host_list() {
        let options = ClientOptions::builder()
            .hosts(vec![ServerAddress::parse("a:27017").unwrap()])
            .repl_set_name("rs0")
            .build();
        let mut description = TopologyDescription::new(&options).unwrap();
        let a = ServerAddress::parse("a:27017").unwrap();

        description
            .update(hello_description(
                &a,
                primary_hello("a:27017", 1, ObjectId::new()),
                Duration::from_millis(10),
            ))
            .unwrap();

        // "b" was discovered through the primary's host list.
        assert!(description
            .servers
            .contains_key(&ServerAddress::parse("b:27017").unwrap()));
    }

    #[test]
    fn incompatible_server_sets_compatibility_error() {
        let options = ClientOptions::builder()
            .hosts(vec![ServerAddress::parse("a:27017").unwrap()])
            .build();
        let mut description = TopologyDescription::new(&options).unwrap();
        let a = ServerAddress::parse("a:27017").unwrap();

        description
            .update(hello_description(
                &a,
                doc! { "isWritablePrimary": true, "minWireVersion": 0, "maxWireVersion": 2, "ok": 1.0 },
                Duration::from_millis(1),
            ))
            .unwrap();
        assert!(description.compatibility_error().is_some());
    }

    #[test]
    fn session_timeout_is_minimum_across_data_bearing_servers() {
        let options = rs_options();
        let mut description = TopologyDescription::new(&options).unwrap();
        let a = ServerAddress::parse("a:27017").unwrap();
        let b = ServerAddress::parse("b:27017").unwrap();

        let mut hello_a = primary_hello("a:27017", 1, ObjectId::new());
        hello_a.insert("logicalSessionTimeoutMinutes", 30);
        description
            .update(hello_description(&a, hello_a, Duration::from_millis(1)))
            .unwrap();
        assert_eq!(
            description.logical_session_timeout,
            Some(Duration::from_secs(30 * 60))
        );

        let mut hello_b = primary_hello("b:27017", 1, ObjectId::new());
        hello_b.remove("isWritablePrimary");
        hello_b.insert("secondary", true);
        hello_b.insert("logicalSessionTimeoutMinutes", 10);
        description
            .update(hello_description(&b, hello_b, Duration::from_millis(1)))
            .unwrap();
        assert_eq!(
            description.logical_session_timeout,
            Some(Duration::from_secs(10 * 60))
        );
    }
}
