//! The operation abstraction: how a command is built for a particular server and how its reply
//! is interpreted.

use crate::{
    bson::Document,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{CommandError, Error, ErrorKind, Result, WriteConcernError},
    selection_criteria::SelectionCriteria,
};

use serde::Deserialize;

/// Whether an operation may be retried, and under which rule set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Retryability {
    /// Retried under the retryable-writes rules.
    Write,
    /// Retried under the retryable-reads rules.
    Read,
    /// Never retried.
    None,
}

/// A single database command: how to build it against a concrete server and how to interpret
/// the reply.
pub(crate) trait Operation {
    /// The output type of this operation.
    type O;

    /// The name of the server-side command this operation sends.
    const NAME: &'static str;

    /// Build the command for the given server.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interpret the server's reply to the command.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// The selection criteria this operation requires, if any.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// How this operation participates in retries.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Adjust state before a retry attempt (e.g. regenerating idempotency markers).
    fn update_for_retry(&mut self) {}
}

/// A generic run-command operation: sends a caller-provided command document verbatim and
/// returns the reply document.
#[derive(Debug)]
pub(crate) struct RunCommand {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
    write_concern: Option<crate::concern::WriteConcern>,
}

impl RunCommand {
    pub(crate) fn new(
        db: impl Into<String>,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::invalid_argument("an empty document is not a valid command"));
        }
        Ok(Self {
            db: db.into(),
            command,
            selection_criteria,
            write_concern: None,
        })
    }

    /// Attach a write concern to be appended to the command.
    #[allow(dead_code)]
    pub(crate) fn with_write_concern(mut self, write_concern: crate::concern::WriteConcern) -> Self {
        self.write_concern = Some(write_concern);
        self
    }

    fn command_name(&self) -> &str {
        self.command.keys().next().unwrap_or(Self::NAME)
    }
}

impl Operation for RunCommand {
    type O = Document;

    const NAME: &'static str = "runCommand";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut command = Command::new(
            self.command_name().to_string(),
            self.db.clone(),
            self.command.clone(),
        );
        if let Some(ref write_concern) = self.write_concern {
            write_concern.validate()?;
            command.set_write_concern(write_concern);
        }
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        if !response.is_success() {
            return Err(command_failure_error(&response));
        }
        Ok(response.into_raw_body())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }
}

/// The write-concern-error portion of a reply, reported separately from command failure.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteConcernErrorBody {
    write_concern_error: Option<WriteConcernError>,
}

/// Convert a non-`ok` command reply into the error it describes, preserving any error labels
/// the server attached.
pub(crate) fn command_failure_error(response: &RawCommandResponse) -> Error {
    let mut error = match response.body::<CommandError>() {
        Ok(command_error) => {
            let labels = command_error.error_labels.clone();
            Error::new(ErrorKind::Command(command_error), Some(labels))
        }
        Err(decode_error) => decode_error,
    };
    error.set_server_address(response.source_address().clone());
    error
}

/// Extract a write concern error from an otherwise-successful reply, if present.
pub(crate) fn write_concern_error(response: &RawCommandResponse) -> Option<Error> {
    let body: WriteConcernErrorBody = response.body().ok()?;
    let wc_error = body.write_concern_error?;
    let mut error = Error::new(ErrorKind::WriteConcern(wc_error), None::<Vec<String>>);
    error.set_server_address(response.source_address().clone());
    Some(error)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{bson::Bson, client::options::ServerAddress, doc};

    fn response(body: Document) -> RawCommandResponse {
        RawCommandResponse::new(ServerAddress::default(), body)
    }

    #[test]
    fn command_errors_preserve_code_and_labels() {
        let err = command_failure_error(&response(doc! {
            "ok": 0.0,
            "code": 11600,
            "codeName": "InterruptedAtShutdown",
            "errmsg": "interrupted at shutdown",
            "errorLabels": vec![Bson::String("RetryableWriteError".to_string())],
        }));
        assert_eq!(err.sdam_code(), Some(11600));
        assert!(err.contains_label("RetryableWriteError"));
        assert!(err.server_address().is_some());
    }

    #[test]
    fn write_concern_errors_are_extracted() {
        let err = write_concern_error(&response(doc! {
            "ok": 1.0,
            "writeConcernError": {
                "code": 64,
                "codeName": "WriteConcernTimeout",
                "errmsg": "waiting for replication timed out",
            },
        }))
        .unwrap();
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::WriteConcern(ref wc) if wc.code == 64
        ));
    }

    #[test]
    fn run_command_rejects_empty_documents() {
        assert!(RunCommand::new("admin", doc! {}, None).is_err());
    }
}
