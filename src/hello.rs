use std::time::Duration;

use serde::Deserialize;

use crate::{
    bson::Document,
    client::options::ServerAddress,
    cmap::{Command, Connection},
    doc,
    error::Result,
    operation::command_failure_error,
    sdam::{public::ServerType, TopologyVersion},
    selection_criteria::TagSet,
};

/// The legacy version of the `hello` command which was deprecated in 5.0.
/// To limit usages of the legacy name in the codebase, this constant should be used
/// wherever possible.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

#[derive(Debug, Clone, Copy)]
pub(crate) struct AwaitableHelloOptions {
    pub(crate) topology_version: TopologyVersion,
    pub(crate) max_await_time: Duration,
}

/// Construct a hello or legacy hello command, depending on the circumstances.
///
/// If the server has indicated `helloOk: true`, then `hello` will be used. Otherwise legacy
/// hello will be used, and if it's unknown whether the server supports hello, the command will
/// also contain `helloOk: true`.
pub(crate) fn hello_command(
    hello_ok: Option<bool>,
    app_name: Option<&str>,
    awaitable_options: Option<AwaitableHelloOptions>,
) -> Command {
    let (mut body, command_name) = if matches!(hello_ok, Some(true)) {
        (doc! { "hello": 1 }, "hello")
    } else {
        let mut body = doc! { LEGACY_HELLO_COMMAND_NAME: 1 };
        if hello_ok.is_none() {
            body.insert("helloOk", true);
        }
        (body, LEGACY_HELLO_COMMAND_NAME)
    };

    if let Some(app_name) = app_name {
        body.insert(
            "client",
            doc! { "application": { "name": app_name } },
        );
    }

    if let Some(options) = awaitable_options {
        body.insert("topologyVersion", options.topology_version.to_document());
        body.insert(
            "maxAwaitTimeMS",
            i64::try_from(options.max_await_time.as_millis()).unwrap_or(i64::MAX),
        );
    }

    let mut command = Command::new(command_name, "admin", body);
    command.exhaust_allowed = awaitable_options.is_some();
    command
}

/// Execute a hello or legacy hello command over OP_MSG.
pub(crate) async fn run_hello(conn: &Connection, command: Command) -> Result<HelloReply> {
    let response = conn.send_command(command).await?;
    response.into_hello_reply(conn.address().clone())
}

impl crate::cmap::RawCommandResponse {
    pub(crate) fn into_hello_reply(self, server_address: ServerAddress) -> Result<HelloReply> {
        if !self.is_success() {
            return Err(command_failure_error(&self));
        }
        let command_response: HelloCommandResponse = self.body()?;
        Ok(HelloReply {
            server_address,
            command_response,
            raw_command_response: self.into_raw_body(),
        })
    }
}

/// A `hello` reply along with where it came from.
#[derive(Debug, Clone)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
}

/// The response to a `hello` command.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/command/hello/) for more details.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    /// Whether the server is writable. If true, this instance is a primary in a replica set, a
    /// mongos instance, or a standalone mongod.
    pub is_writable_primary: Option<bool>,

    #[serde(rename = "ismaster")]
    /// Legacy name for `is_writable_primary` field.
    pub is_master: Option<bool>,

    /// Whether or not the server supports using the `hello` command for monitoring instead
    /// of the legacy hello command.
    pub hello_ok: Option<bool>,

    /// The list of all hosts.
    pub hosts: Option<Vec<String>>,

    /// The list of all passives in a replica set.
    pub passives: Option<Vec<String>>,

    /// The list of all arbiters in a replica set.
    pub arbiters: Option<Vec<String>>,

    /// An optional message. This contains the value "isdbgrid" when returned from a mongos.
    pub msg: Option<String>,

    /// The address of the server that returned this `HelloCommandResponse`.
    pub me: Option<String>,

    /// The current replica set config version.
    pub set_version: Option<i32>,

    /// The name of the current replica set.
    pub set_name: Option<String>,

    /// Whether the server is hidden.
    pub hidden: Option<bool>,

    /// Whether the server is a secondary.
    pub secondary: Option<bool>,

    /// Whether the server is an arbiter.
    pub arbiter_only: Option<bool>,

    #[serde(rename = "isreplicaset")]
    /// Whether the server is a replica set.
    pub is_replica_set: Option<bool>,

    /// The time in minutes that a session remains active after its most recent use.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Optime and date information for the server's most recent write operation.
    pub last_write: Option<LastWrite>,

    /// The minimum wire version that the server supports.
    pub min_wire_version: Option<i32>,

    /// The maximum wire version that the server supports.
    pub max_wire_version: Option<i32>,

    /// User-defined tags for a replica set member.
    pub tags: Option<TagSet>,

    /// A unique identifier for each election.
    pub election_id: Option<crate::bson::oid::ObjectId>,

    /// The address of current primary member of the replica set.
    pub primary: Option<String>,

    /// The maximum permitted size of a BSON object in bytes.
    #[serde(default = "default_max_bson_object_size")]
    pub max_bson_object_size: i64,

    /// The maximum number of write operations permitted in a write batch.
    pub max_write_batch_size: Option<i64>,

    /// An identifier for the server process incarnation; present on servers that support the
    /// streaming heartbeat protocol.
    pub topology_version: Option<TopologyVersion>,

    /// The maximum permitted size of a BSON wire protocol message.
    #[serde(default = "default_max_message_size_bytes")]
    pub max_message_size_bytes: i32,

    /// The server-generated ID for the connection the "hello" command was run on.
    /// Present on server versions 4.2+.
    pub connection_id: Option<i64>,
}

fn default_max_bson_object_size() -> i64 {
    16 * 1024 * 1024
}

fn default_max_message_size_bytes() -> i32 {
    48_000_000
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self) -> ServerType {
        if self.msg.as_deref() == Some("isdbgrid") {
            ServerType::Mongos
        } else if self.set_name.is_some() {
            if self.hidden == Some(true) {
                ServerType::RsOther
            } else if self.is_writable_primary == Some(true) || self.is_master == Some(true) {
                ServerType::RsPrimary
            } else if self.secondary == Some(true) {
                ServerType::RsSecondary
            } else if self.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            }
        } else if self.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    pub last_write_date: crate::bson::DateTime,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn server_type_classification() {
        let mut response = HelloCommandResponse::default();
        assert_eq!(response.server_type(), ServerType::Standalone);

        response.msg = Some("isdbgrid".to_string());
        assert_eq!(response.server_type(), ServerType::Mongos);

        response.msg = None;
        response.set_name = Some("rs0".to_string());
        response.is_writable_primary = Some(true);
        assert_eq!(response.server_type(), ServerType::RsPrimary);

        response.is_writable_primary = None;
        response.secondary = Some(true);
        assert_eq!(response.server_type(), ServerType::RsSecondary);

        response.secondary = None;
        response.arbiter_only = Some(true);
        assert_eq!(response.server_type(), ServerType::RsArbiter);

        response.hidden = Some(true);
        assert_eq!(response.server_type(), ServerType::RsOther);

        response = HelloCommandResponse {
            is_replica_set: Some(true),
            ..Default::default()
        };
        assert_eq!(response.server_type(), ServerType::RsGhost);
    }

    #[test]
    fn awaitable_hello_sets_exhaust() {
        let command = hello_command(
            Some(true),
            None,
            Some(AwaitableHelloOptions {
                topology_version: TopologyVersion {
                    process_id: crate::bson::oid::ObjectId::new(),
                    counter: 3,
                },
                max_await_time: Duration::from_secs(10),
            }),
        );
        assert!(command.exhaust_allowed);
        assert_eq!(command.name, "hello");
        assert_eq!(command.body.get_i64("maxAwaitTimeMS"), Some(10_000));
        assert!(command.body.contains_key("topologyVersion"));
    }

    #[test]
    fn hello_ok_negotiation() {
        let command = hello_command(None, None, None);
        assert_eq!(command.name, LEGACY_HELLO_COMMAND_NAME);
        assert_eq!(command.body.get_bool("helloOk"), Some(true));

        let command = hello_command(Some(false), None, None);
        assert_eq!(command.name, LEGACY_HELLO_COMMAND_NAME);
        assert!(!command.body.contains_key("helloOk"));
    }
}
