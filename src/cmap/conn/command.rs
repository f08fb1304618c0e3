use serde::de::DeserializeOwned;

use crate::{
    bson::{de::from_document, Bson, Document},
    client::options::ServerAddress,
    concern::WriteConcern,
    error::Result,
    selection_criteria::ReadPreference,
    wire::{Message, MessageFlags},
};

/// A database command about to be sent on a connection.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) exhaust_allowed: bool,
}

impl Command {
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            exhaust_allowed: false,
        }
    }

    /// Attach a `$readPreference` to the command, as sent to mongos.
    pub(crate) fn set_read_preference(&mut self, read_preference: &ReadPreference) {
        self.body
            .insert("$readPreference", read_preference.to_document());
    }

    /// Attach a write concern to the command.
    #[allow(dead_code)]
    pub(crate) fn set_write_concern(&mut self, write_concern: &WriteConcern) {
        if !write_concern.is_empty() {
            self.body.insert("writeConcern", write_concern.to_document());
        }
    }

    /// Frame the command as an OP_MSG.
    pub(crate) fn into_message(mut self) -> Message {
        self.body.insert("$db", self.target_db);
        let mut flags = MessageFlags::empty();
        if self.exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }
        Message::new(self.body, flags)
    }
}

/// A reply document received for a command, along with the address it came from.
#[derive(Clone, Debug)]
pub(crate) struct RawCommandResponse {
    source: ServerAddress,
    body: Document,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, body: Document) -> Self {
        Self { source, body }
    }

    /// Whether the server reported the command as successful. This says nothing about the
    /// semantic outcome of the operation.
    pub(crate) fn is_success(&self) -> bool {
        match self.body.get("ok") {
            Some(Bson::Int32(1)) | Some(Bson::Int64(1)) | Some(Bson::Boolean(true)) => true,
            Some(Bson::Double(f)) => *f == 1.0,
            _ => false,
        }
    }

    /// Deserialize the reply body into a typed response.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        from_document(self.body.clone())
    }

    /// The raw reply document.
    pub(crate) fn into_raw_body(self) -> Document {
        self.body
    }

    /// The address of the server that produced this response.
    pub(crate) fn source_address(&self) -> &ServerAddress {
        &self.source
    }
}
