use std::{collections::HashMap, ops::Deref, sync::Arc, time::Duration};

use rand::seq::IteratorRandom;

use super::{TopologyDescription, TopologyType};
use crate::{
    client::options::ServerAddress,
    error::{ErrorKind, Result},
    sdam::{
        description::server::{ServerDescription, ServerType},
        public::ServerInfo,
        server::Server,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// A server selected for an operation. Holding it keeps the server's in-flight operation count
/// incremented, which biases future selections away from busy servers.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    fn new(server: Arc<Server>) -> Self {
        server.increment_operation_count();
        Self { server }
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        self.server.deref()
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.server.decrement_operation_count();
    }
}

/// Attempt to select a server, returning `None` if no server matched the provided criteria.
pub(crate) fn attempt_to_select_server(
    criteria: &SelectionCriteria,
    topology_description: &TopologyDescription,
    servers: &HashMap<ServerAddress, Arc<Server>>,
    deprioritized: Option<&ServerAddress>,
) -> Result<Option<SelectedServer>> {
    let mut in_window = topology_description.suitable_servers_in_latency_window(criteria)?;
    if let Some(addr) = deprioritized {
        if in_window.len() > 1 {
            in_window.retain(|description| &description.address != addr);
        }
    }
    let in_window_servers: Vec<_> = in_window
        .into_iter()
        .flat_map(|description| servers.get(&description.address))
        .collect();
    let selected = select_server_in_latency_window(in_window_servers);
    Ok(selected.map(SelectedServer::new))
}

/// Choose a server from the suitable choices within the latency window: two candidates are
/// picked at random and the one with fewer in-flight operations wins.
fn select_server_in_latency_window(in_window: Vec<&Arc<Server>>) -> Option<Arc<Server>> {
    if in_window.is_empty() {
        return None;
    } else if in_window.len() == 1 {
        return Some(in_window[0].clone());
    }

    let mut rng = rand::thread_rng();
    in_window
        .into_iter()
        .choose_multiple(&mut rng, 2)
        .into_iter()
        .min_by_key(|server| server.operation_count())
        .cloned()
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        if self.has_available_servers() {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {:?}. Topology: {}",
                criteria, self
            )
        } else {
            format!(
                "Server selection timeout: No available servers. Topology: {}",
                self
            )
        }
    }

    /// The servers eligible under `criteria`, narrowed to those within the latency window.
    pub(crate) fn suitable_servers_in_latency_window(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::IncompatibleServer {
                message: message.to_string(),
            }
            .into());
        }

        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => self.suitable_servers(read_pref),
            SelectionCriteria::Predicate(ref filter) => self
                .servers
                .values()
                .filter(|server| {
                    // If we're direct-connected, ignore whether the single server in the
                    // topology is data-bearing.
                    (self.topology_type == TopologyType::Single
                        || server.server_type.is_data_bearing())
                        && filter(&ServerInfo::new_borrowed(server))
                })
                .collect(),
        };

        self.retain_servers_within_latency_window(&mut suitable_servers);

        Ok(suitable_servers)
    }

    fn suitable_servers(&self, read_preference: &ReadPreference) -> Vec<&ServerDescription> {
        match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single | TopologyType::LoadBalanced => self.servers.values().collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)
            }
        }
    }

    fn retain_servers_within_latency_window(
        &self,
        suitable_servers: &mut Vec<&ServerDescription>,
    ) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|description| description.average_round_trip_time)
            .min();

        let local_threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);

        let max_rtt_within_window =
            shortest_average_rtt.map(|rtt| rtt.checked_add(local_threshold).unwrap_or(Duration::MAX));

        suitable_servers.retain(move |description| {
            if let Some(server_rtt) = description.average_round_trip_time {
                // The unwrap is safe: this server having an average RTT implies a minimum
                // exists.
                server_rtt <= max_rtt_within_window.unwrap()
            } else {
                // Load balancers are not monitored and have no RTT; they are always selectable.
                matches!(description.server_type, ServerType::LoadBalancer)
            }
        });
    }

    pub(crate) fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    pub(crate) fn primary(&self) -> Option<&ServerDescription> {
        self.servers_with_type(&[ServerType::RsPrimary]).next()
    }

    fn suitable_servers_in_replica_set(
        &self,
        read_preference: &ReadPreference,
    ) -> Vec<&ServerDescription> {
        match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary { options } => {
                self.eligible_secondaries(options.tag_sets.as_deref(), options.max_staleness)
            }
            ReadPreference::PrimaryPreferred { options } => match self.primary() {
                Some(primary) => vec![primary],
                None => {
                    self.eligible_secondaries(options.tag_sets.as_deref(), options.max_staleness)
                }
            },
            ReadPreference::SecondaryPreferred { options } => {
                let suitable =
                    self.eligible_secondaries(options.tag_sets.as_deref(), options.max_staleness);
                if suitable.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable
                }
            }
            ReadPreference::Nearest { options } => self.eligible_members(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                options.tag_sets.as_deref(),
                options.max_staleness,
            ),
        }
    }

    fn eligible_secondaries(
        &self,
        tag_sets: Option<&[TagSet]>,
        max_staleness: Option<Duration>,
    ) -> Vec<&ServerDescription> {
        self.eligible_members(&[ServerType::RsSecondary], tag_sets, max_staleness)
    }

    fn eligible_members<'a>(
        &'a self,
        types: &'a [ServerType],
        tag_sets: Option<&[TagSet]>,
        max_staleness: Option<Duration>,
    ) -> Vec<&'a ServerDescription> {
        let mut members: Vec<_> = self.servers_with_type(types).collect();
        if let Some(max_staleness) = max_staleness {
            self.filter_by_max_staleness(&mut members, max_staleness);
        }
        match tag_sets {
            Some(tag_sets) => filter_by_tag_sets(members, tag_sets),
            None => members,
        }
    }

    /// Drop members whose estimated replication lag exceeds `max_staleness`. Members for which
    /// staleness cannot be estimated (no write date observed yet) are retained.
    fn filter_by_max_staleness(
        &self,
        members: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let heartbeat_frequency = self
            .heartbeat_freq
            .unwrap_or(crate::sdam::DEFAULT_HEARTBEAT_FREQUENCY);

        let staleness_of = |member: &ServerDescription| -> Option<Duration> {
            let member_write_millis = member.last_write_date()?.timestamp_millis();
            let lag_millis = match self.primary() {
                Some(primary) => {
                    let primary_write_millis = primary.last_write_date()?.timestamp_millis();
                    let member_update = member.last_update_time?.timestamp_millis();
                    let primary_update = primary.last_update_time?.timestamp_millis();
                    (member_update - member_write_millis)
                        - (primary_update - primary_write_millis)
                }
                None => {
                    let max_write_millis = self
                        .servers_with_type(&[ServerType::RsSecondary])
                        .filter_map(|s| s.last_write_date())
                        .map(|d| d.timestamp_millis())
                        .max()?;
                    max_write_millis - member_write_millis
                }
            };
            u64::try_from(lag_millis)
                .ok()
                .map(|lag| Duration::from_millis(lag) + heartbeat_frequency)
        };

        members.retain(|member| match member.server_type {
            ServerType::RsSecondary => staleness_of(*member)
                .map(|staleness| staleness <= max_staleness)
                .unwrap_or(true),
            _ => true,
        });
    }
}

/// Apply the tag set list: sets are tried in order, and the first set matched by at least one
/// server determines the eligible servers. An empty set matches every server.
fn filter_by_tag_sets<'a>(
    members: Vec<&'a ServerDescription>,
    tag_sets: &[TagSet],
) -> Vec<&'a ServerDescription> {
    for tag_set in tag_sets {
        let matching: Vec<_> = members
            .iter()
            .copied()
            .filter(|member| member.matches_tag_set(tag_set))
            .collect();
        if !matching.is_empty() {
            return matching;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bson::Bson,
        doc,
        selection_criteria::ReadPreferenceOptions,
        ClientOptions,
    };

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// One primary and two secondaries: S1 has tags {dc: ny, rack: 1} and a 50ms RTT, S2 has
    /// tags {dc: ny} and a 71ms RTT, outside the default 15ms latency window off the 50ms
    /// minimum.
    fn test_topology() -> TopologyDescription {
        let hosts = ["p:27017", "s1:27017", "s2:27017"];
        let options = ClientOptions::builder()
            .hosts(
                hosts
                    .iter()
                    .map(|h| ServerAddress::parse(h).unwrap())
                    .collect::<Vec<_>>(),
            )
            .repl_set_name("rs0")
            .build();
        let mut description = TopologyDescription::new(&options).unwrap();

        let host_list: Vec<Bson> = hosts
            .iter()
            .map(|h| Bson::String(h.to_string()))
            .collect();
        let member = |address: &str, primary: bool, member_tags: Option<TagSet>, rtt_ms: u64| {
            let mut hello = doc! {
                "setName": "rs0",
                "hosts": host_list.clone(),
                "me": address,
                "minWireVersion": 6,
                "maxWireVersion": 17,
                "ok": 1.0,
            };
            if primary {
                hello.insert("isWritablePrimary", true);
            } else {
                hello.insert("secondary", true);
            }
            if let Some(member_tags) = member_tags {
                let tag_doc: crate::bson::Document = member_tags
                    .into_iter()
                    .map(|(k, v)| (k, Bson::String(v)))
                    .collect();
                hello.insert("tags", tag_doc);
            }
            crate::sdam::description::topology::test::hello_description(
                &ServerAddress::parse(address).unwrap(),
                hello,
                Duration::from_millis(rtt_ms),
            )
        };

        description.update(member("p:27017", true, None, 50)).unwrap();
        description
            .update(member(
                "s1:27017",
                false,
                Some(tags(&[("dc", "ny"), ("rack", "1")])),
                50,
            ))
            .unwrap();
        description
            .update(member("s2:27017", false, Some(tags(&[("dc", "ny")])), 71))
            .unwrap();
        description
    }

    fn selected_addresses(
        description: &TopologyDescription,
        read_preference: ReadPreference,
    ) -> Vec<String> {
        let mut addresses: Vec<String> = description
            .suitable_servers_in_latency_window(&SelectionCriteria::ReadPreference(
                read_preference,
            ))
            .unwrap()
            .into_iter()
            .map(|s| s.address.to_string())
            .collect();
        addresses.sort();
        addresses
    }

    #[test]
    fn primary_mode_selects_the_primary() {
        let description = test_topology();
        assert_eq!(
            selected_addresses(&description, ReadPreference::Primary),
            vec!["p:27017".to_string()]
        );
    }

    #[test]
    fn secondary_mode_applies_the_latency_window() {
        let description = test_topology();
        // S2's 71ms RTT falls outside the 50ms + 15ms window.
        assert_eq!(
            selected_addresses(
                &description,
                ReadPreference::Secondary {
                    options: ReadPreferenceOptions::default()
                }
            ),
            vec!["s1:27017".to_string()]
        );
    }

    #[test]
    fn tag_sets_narrow_eligibility() {
        let description = test_topology();
        assert_eq!(
            selected_addresses(
                &description,
                ReadPreference::SecondaryPreferred {
                    options: ReadPreferenceOptions {
                        tag_sets: Some(vec![tags(&[("rack", "1")])]),
                        ..Default::default()
                    }
                }
            ),
            vec!["s1:27017".to_string()]
        );
    }

    #[test]
    fn unmatched_tag_sets_select_nothing() {
        let description = test_topology();
        assert!(selected_addresses(
            &description,
            ReadPreference::Nearest {
                options: ReadPreferenceOptions {
                    tag_sets: Some(vec![tags(&[("rack", "2")])]),
                    ..Default::default()
                }
            }
        )
        .is_empty());
    }

    #[test]
    fn empty_tag_set_matches_everything() {
        let description = test_topology();
        assert_eq!(
            selected_addresses(
                &description,
                ReadPreference::Secondary {
                    options: ReadPreferenceOptions {
                        tag_sets: Some(vec![tags(&[("rack", "9")]), TagSet::new()]),
                        ..Default::default()
                    }
                }
            ),
            vec!["s1:27017".to_string()]
        );
    }

    #[test]
    fn primary_preferred_falls_back_to_secondaries() {
        let mut description = test_topology();
        // Lose the primary.
        description
            .update(ServerDescription::new_from_error(
                ServerAddress::parse("p:27017").unwrap(),
                crate::error::Error::network_timeout(),
            ))
            .unwrap();
        assert_eq!(
            selected_addresses(
                &description,
                ReadPreference::PrimaryPreferred {
                    options: ReadPreferenceOptions::default()
                }
            ),
            vec!["s1:27017".to_string()]
        );
    }
}
