//! Contains the `Error` and `Result` types that `mongodb-core` uses.

use std::{collections::HashSet, fmt, sync::Arc};

use serde::Deserialize;
use thiserror::Error;

use crate::{bson::Document, client::options::ServerAddress};

const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const NOTWRITABLEPRIMARY_CODES: [i32; 3] = [10107, 13435, 10058];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];
const RETRYABLE_READ_CODES: [i32; 13] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 134, 262,
];
const RETRYABLE_WRITE_CODES: [i32; 12] = [
    11600, 11602, 10107, 13435, 13436, 189, 91, 7, 6, 89, 9001, 262,
];

/// Retryable write error label. This label will be added to an error when the error is
/// write-retryable.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Transient transaction error label. This label will be added to a network error or server
/// selection error that occurs during a transaction.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// The label attached by the server to an error reply when a retryable write failed before any
/// writes were performed; a prior error should be preferred over an error carrying it.
pub const NO_WRITES_PERFORMED: &str = "NoWritesPerformed";

/// The result type for all methods that can return an error in the `mongodb-core` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb-core` crate. The inner [`ErrorKind`] is wrapped in a
/// `Box` to allow the errors to be cloned and passed between tasks cheaply.
#[derive(Clone, Debug, Error)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    pub(crate) wire_version: Option<i32>,
    #[source]
    pub(crate) source: Option<Box<Error>>,
    /// The address of the server the failed operation was targeting, if any.
    pub(crate) server_address: Option<ServerAddress>,
    /// The 0-based attempt during which this error was observed, when the error came out of the
    /// retry machinery.
    pub(crate) attempt: Option<u32>,
    /// Errors superseded by this one during retry-exception selection.
    pub(crate) suppressed: Vec<Error>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        if let Some(wc) = kind.get_write_concern_error() {
            labels.extend(wc.labels.clone());
        }
        Self {
            kind: Box::new(kind),
            labels,
            wire_version: None,
            source: None,
            server_address: None,
            attempt: None,
            suppressed: Vec::new(),
        }
    }

    pub(crate) fn pool_cleared_error(address: &ServerAddress, cause: &Error) -> Self {
        Error::new(
            ErrorKind::ConnectionPoolCleared {
                message: format!(
                    "Connection pool for {} cleared because another operation failed with: {}",
                    address, cause
                ),
            },
            Some(cause.labels.iter().cloned()),
        )
        .with_source(cause.clone())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    /// Construct a generic network timeout error.
    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    pub(crate) fn with_source(mut self, source: impl Into<Option<Error>>) -> Self {
        self.source = source.into().map(Box::new);
        self
    }

    /// Attach the address of the server an operation was targeting.
    pub(crate) fn set_server_address(&mut self, address: ServerAddress) {
        self.server_address.get_or_insert(address);
    }

    /// Record the 0-based attempt on which this error was observed.
    pub(crate) fn set_attempt(&mut self, attempt: u32) {
        self.attempt.get_or_insert(attempt);
    }

    /// Record an error superseded by this one.
    pub(crate) fn add_suppressed(&mut self, error: Error) {
        self.suppressed.push(error);
    }

    /// Errors superseded by this one during retry-exception selection.
    pub fn suppressed(&self) -> &[Error] {
        &self.suppressed
    }

    /// The address of the server this error originated from, if known.
    pub fn server_address(&self) -> Option<&ServerAddress> {
        self.server_address.as_ref()
    }

    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_recovering() || self.is_notwritableprimary()
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_pool_cleared(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    pub(crate) fn is_auth_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Authentication { .. })
    }

    pub(crate) fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    /// Whether an error originated from the server.
    pub(crate) fn is_server_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Authentication { .. }
                | ErrorKind::Command(_)
                | ErrorKind::Write(_)
                | ErrorKind::WriteConcern(_)
        )
    }

    /// Whether a read operation should be retried if this error occurs.
    pub(crate) fn is_read_retryable(&self) -> bool {
        if self.is_network_error() || self.is_pool_cleared() {
            return true;
        }
        match self.sdam_code() {
            Some(code) => RETRYABLE_READ_CODES.contains(&code),
            None => false,
        }
    }

    pub(crate) fn is_write_retryable(&self) -> bool {
        self.is_pool_cleared() || self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether a "RetryableWriteError" label should be added to this error. If max_wire_version
    /// indicates a 4.4+ server, a label should only be added if the error is a network error.
    /// Otherwise, a label should be added if the error is a network error or the error code
    /// matches one of the retryable write codes.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if max_wire_version > 8 {
            return self.is_network_error();
        }
        if self.is_network_error() {
            return true;
        }
        match &self.sdam_code() {
            Some(code) => RETRYABLE_WRITE_CODES.contains(code),
            None => false,
        }
    }

    /// The error code, if any, to be used when making SDAM state-change decisions.
    /// Top-level command error codes take precedence over write concern error codes.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        let code = match self.kind.as_ref() {
            ErrorKind::Command(command_error) => Some(command_error.code),
            ErrorKind::WriteConcern(wc_error) => Some(wc_error.code),
            ErrorKind::Write(write_error) => Some(write_error.code),
            _ => None,
        };
        code.or_else(|| {
            self.source
                .as_ref()
                .and_then(|source| source.sdam_code())
        })
    }

    pub(crate) fn is_recovering(&self) -> bool {
        match self.sdam_code() {
            Some(code) => {
                RECOVERING_CODES.contains(&code)
                    || self.message_matches(&["not master or secondary", "node is recovering"])
            }
            None => false,
        }
    }

    pub(crate) fn is_notwritableprimary(&self) -> bool {
        match self.sdam_code() {
            Some(code) => {
                NOTWRITABLEPRIMARY_CODES.contains(&code)
                    || self.message_matches(&["not master"]) && !self.is_recovering()
            }
            None => false,
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        match self.sdam_code() {
            Some(code) => SHUTTING_DOWN_CODES.contains(&code),
            None => false,
        }
    }

    fn message_matches(&self, needles: &[&str]) -> bool {
        let message = match self.kind.as_ref() {
            ErrorKind::Command(ref err) => Some(err.message.as_str()),
            ErrorKind::WriteConcern(ref err) => Some(err.message.as_str()),
            _ => None,
        };
        message
            .map(|m| needles.iter().any(|needle| m.contains(needle)))
            .unwrap_or(false)
    }

    /// Whether a state-change error should clear the server's connection pool in addition to
    /// marking the server Unknown: pre-4.2 servers close connections on step-down, as do
    /// shutdowns on any version.
    pub(crate) fn clears_pool_on_state_change(&self) -> bool {
        self.is_shutting_down() || self.wire_version.unwrap_or(0) < 8
    }

    /// Returns the labels for this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error contains the specified label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels().contains(label.as_ref())
    }

    /// Adds the given label to this error.
    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        let label = label.as_ref().to_string();
        self.labels.insert(label);
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self::new(err.into(), None::<Option<String>>)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

impl serde::de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        DeserializationError {
            kind: DeserializationErrorKind::Malformed,
            message: msg.to_string(),
            offset: None,
        }
        .into()
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// An error occurred while the connection handshake was being performed.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },

    /// The server returned an error to an attempted operation.
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// The server returned an error for an attempted write operation.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    Write(WriteError),

    /// The write concern for an operation could not be satisfied.
    #[error("The write concern could not be satisfied: {0:?}")]
    WriteConcern(WriteConcernError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The connection pool for a server was cleared while the checkout was in progress or
    /// enqueued.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    /// The connection pool was closed while a checkout was in progress.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolClosed { message: String },

    /// A checkout did not obtain a connection within the wait queue timeout.
    #[error("Timed out while checking out a connection from connection pool for {address}")]
    #[non_exhaustive]
    WaitQueueTimeout { address: ServerAddress },

    /// No server was available matching the selection criteria within the timeout.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// A server's advertised wire version range is incompatible with this driver.
    #[error("The server is incompatible with this version of the driver: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// The server returned a malformed reply to an operation.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// A BSON document could not be serialized.
    #[error("{0}")]
    Serialization(SerializationError),

    /// Received BSON bytes could not be deserialized.
    #[error("{0}")]
    Deserialization(DeserializationError),

    /// An internal error occurred; these represent driver bugs.
    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    /// The client has been shut down.
    #[error("Client has been shut down")]
    Shutdown,
}

impl ErrorKind {
    pub(crate) fn get_write_concern_error(&self) -> Option<&WriteConcernError> {
        match self {
            ErrorKind::WriteConcern(wc_error) => Some(wc_error),
            _ => None,
        }
    }
}

/// An error that occurred while serializing BSON.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("BSON serialization error: {kind}")]
#[non_exhaustive]
pub struct SerializationError {
    /// The specific kind of failure.
    pub kind: SerializationErrorKind,
}

impl From<SerializationErrorKind> for Error {
    fn from(kind: SerializationErrorKind) -> Self {
        ErrorKind::Serialization(SerializationError { kind }).into()
    }
}

/// The ways serializing BSON can fail.
#[derive(Clone, Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum SerializationErrorKind {
    /// A completed document exceeded the active maximum document size.
    #[error("document of {size} bytes exceeds the maximum of {max} bytes")]
    #[non_exhaustive]
    DocumentTooLarge { size: usize, max: usize },

    /// A message exceeded the maximum message size.
    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    #[non_exhaustive]
    MessageTooLarge { size: usize, max: usize },

    /// A writer operation was invoked in a state that does not admit it, e.g. writing a value
    /// in a document context with no name pending.
    #[error("invalid writer state: {message}")]
    #[non_exhaustive]
    InvalidState { message: String },

    /// A field name contained an interior NUL byte.
    #[error("field name contains an interior NUL byte: {name:?}")]
    #[non_exhaustive]
    InvalidCString { name: String },
}

/// An error that occurred while deserializing BSON, along with the byte offset at which it was
/// detected when reading from a raw stream.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct DeserializationError {
    /// The specific kind of failure.
    pub kind: DeserializationErrorKind,
    /// A human-readable description of the failure.
    pub message: String,
    /// Byte offset into the source document, when decoding raw bytes.
    pub offset: Option<usize>,
}

impl fmt::Display for DeserializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BSON deserialization error: {}", self.message)?;
        if let Some(offset) = self.offset {
            write!(f, " (at byte offset {})", offset)?;
        }
        Ok(())
    }
}

impl From<DeserializationError> for Error {
    fn from(err: DeserializationError) -> Self {
        ErrorKind::Deserialization(err).into()
    }
}

/// The ways deserializing BSON can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeserializationErrorKind {
    /// A numeric value did not round-trip into the requested narrower type.
    NumericOverflow,
    /// A `null` value was read for a target type that cannot represent it.
    NullForPrimitive,
    /// A value of one BSON type was requested but another was present.
    UnexpectedType,
    /// The document bytes are structurally invalid.
    Malformed,
    /// The source ended before a complete value was read.
    UnexpectedEof,
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Deserialize, Error)]
#[error("Error code {code} ({code_name}): {message}")]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    #[serde(default)]
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// The error labels that the server returned.
    #[serde(rename = "errorLabels", default)]
    pub error_labels: Vec<String>,
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    #[serde(default)]
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// A document identifying the write concern setting related to the error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,

    /// Labels categorizing the error.
    #[serde(rename = "errorLabels", default)]
    pub(crate) labels: Vec<String>,
}

/// An error that occurred during a write operation that wasn't due to being unable to satisfy a
/// write concern.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    #[serde(default)]
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default)]
    pub message: String,

    /// The index of the request that this error corresponds to in a batch.
    #[serde(default)]
    pub index: usize,

    /// A document providing more information about the write error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn command_error(code: i32, message: &str) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: String::new(),
            message: message.to_string(),
            error_labels: Vec::new(),
        })
        .into()
    }

    #[test]
    fn network_errors_are_read_retryable() {
        let err: Error = ErrorKind::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(err.is_read_retryable());
    }

    #[test]
    fn retryable_read_codes_include_exceeded_time_limit() {
        assert!(command_error(262, "operation exceeded time limit").is_read_retryable());
        assert!(command_error(11600, "interrupted at shutdown").is_read_retryable());
        assert!(!command_error(26, "ns not found").is_read_retryable());
    }

    #[test]
    fn pool_cleared_is_retryable_for_reads_and_writes() {
        let cause = Error::network_timeout();
        let err = Error::pool_cleared_error(
            &ServerAddress::Tcp {
                host: "localhost".to_string(),
                port: Some(27017),
            },
            &cause,
        );
        assert!(err.is_read_retryable());
        assert!(err.is_write_retryable());
    }

    #[test]
    fn retryable_write_label_depends_on_wire_version() {
        // Modern servers attach the label themselves, so only network errors qualify.
        assert!(!command_error(11600, "shutdown").should_add_retryable_write_label(9));
        assert!(command_error(11600, "shutdown").should_add_retryable_write_label(8));
        let net: Error = ErrorKind::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(net.should_add_retryable_write_label(9));
    }

    #[test]
    fn state_change_classification() {
        assert!(command_error(11600, "interrupted at shutdown").is_recovering());
        assert!(command_error(10107, "not master").is_notwritableprimary());
        assert!(command_error(91, "shutdown in progress").is_shutting_down());
        assert!(!command_error(8000, "other").is_state_change_error());
    }
}
