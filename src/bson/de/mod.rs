//! BSON deserialization: a streaming document reader and a `serde` deserializer over decoded
//! values.

mod reader;
mod serde;

pub use self::serde::{from_bson, from_document};
pub use reader::{DocumentReader, TypeMap};
