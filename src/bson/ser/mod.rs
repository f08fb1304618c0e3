//! BSON serialization: a streaming document writer.

mod writer;

pub use writer::{DocumentWriter, DEFAULT_MAX_DOCUMENT_SIZE, DEFAULT_MAX_MESSAGE_SIZE};
