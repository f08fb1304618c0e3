use std::time::Duration;

use crate::{client::options::ServerAddress, hello::HelloReply, sdam::public::ServerType};

/// Information about the server on the other end of a connection, derived from its handshake.
#[derive(Clone, Debug)]
pub(crate) struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type the server reported itself as during the handshake.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// The maximum size of a BSON document the server accepts.
    pub(crate) max_bson_object_size: i64,

    /// The maximum number of writes the server accepts in one batch.
    pub(crate) max_write_batch_size: i64,

    /// The maximum size of a wire message the server accepts.
    pub(crate) max_message_size_bytes: i32,

    /// How long the server keeps a logical session alive after its last use.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// Whether the server understands the `hello` command name.
    pub(crate) hello_ok: bool,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a hello reply.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            min_wire_version: response.min_wire_version,
            max_bson_object_size: response.max_bson_object_size,
            max_write_batch_size: response.max_write_batch_size.unwrap_or(100_000),
            max_message_size_bytes: response.max_message_size_bytes,
            logical_session_timeout: response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(60 * mins.max(0) as u64)),
            hello_ok: response.hello_ok.unwrap_or(false),
        }
    }

    /// Gets a description of a stream for a 4.2 connection, for test purposes.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self {
            server_address: ServerAddress::default(),
            initial_server_type: ServerType::Standalone,
            max_wire_version: Some(8),
            min_wire_version: Some(0),
            max_bson_object_size: 16 * 1024 * 1024,
            max_write_batch_size: 100_000,
            max_message_size_bytes: 48_000_000,
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
            hello_ok: false,
        }
    }
}
