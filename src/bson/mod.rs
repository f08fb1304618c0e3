//! BSON support: the value model, a streaming raw writer/reader pair, a `serde` deserializer
//! over decoded values, and a composable codec registry.
//!
//! Documents are encoded and decoded bit-exactly per the
//! [BSON specification](https://bsonspec.org/spec.html), little-endian throughout.

pub mod datetime;
pub mod de;
pub mod decimal128;
mod document;
mod macros;
pub mod oid;
pub mod registry;
pub mod ser;
pub mod spec;

use std::fmt;

pub use self::{
    datetime::DateTime,
    de::{DocumentReader, TypeMap},
    decimal128::Decimal128,
    document::Document,
    oid::ObjectId,
    ser::DocumentWriter,
    spec::{BinarySubtype, ElementType},
};

/// A BSON value: a tagged variant over the 19 types a document element can take.
#[derive(Clone, Debug, PartialEq)]
pub enum Bson {
    /// 64-bit binary floating point.
    Double(f64),
    /// UTF-8 string.
    String(String),
    /// Embedded document.
    Document(Document),
    /// Array.
    Array(Vec<Bson>),
    /// Binary data with a subtype.
    Binary(Binary),
    /// Deprecated undefined value.
    Undefined,
    /// 12-byte ObjectId.
    ObjectId(ObjectId),
    /// Boolean.
    Boolean(bool),
    /// UTC datetime.
    DateTime(DateTime),
    /// Null.
    Null,
    /// Regular expression.
    RegularExpression(Regex),
    /// Deprecated DBPointer.
    DbPointer(DbPointer),
    /// JavaScript code.
    JavaScriptCode(String),
    /// Deprecated symbol.
    Symbol(String),
    /// JavaScript code with a scope document.
    JavaScriptCodeWithScope(JavaScriptCodeWithScope),
    /// 32-bit integer.
    Int32(i32),
    /// Internal MongoDB timestamp.
    Timestamp(Timestamp),
    /// 64-bit integer.
    Int64(i64),
    /// 128-bit decimal floating point.
    Decimal128(Decimal128),
    /// Less than all other values.
    MinKey,
    /// Greater than all other values.
    MaxKey,
}

impl Bson {
    /// The element type tag this value is encoded with.
    pub fn element_type(&self) -> ElementType {
        match self {
            Bson::Double(..) => ElementType::Double,
            Bson::String(..) => ElementType::String,
            Bson::Document(..) => ElementType::EmbeddedDocument,
            Bson::Array(..) => ElementType::Array,
            Bson::Binary(..) => ElementType::Binary,
            Bson::Undefined => ElementType::Undefined,
            Bson::ObjectId(..) => ElementType::ObjectId,
            Bson::Boolean(..) => ElementType::Boolean,
            Bson::DateTime(..) => ElementType::DateTime,
            Bson::Null => ElementType::Null,
            Bson::RegularExpression(..) => ElementType::RegularExpression,
            Bson::DbPointer(..) => ElementType::DbPointer,
            Bson::JavaScriptCode(..) => ElementType::JavaScriptCode,
            Bson::Symbol(..) => ElementType::Symbol,
            Bson::JavaScriptCodeWithScope(..) => ElementType::JavaScriptCodeWithScope,
            Bson::Int32(..) => ElementType::Int32,
            Bson::Timestamp(..) => ElementType::Timestamp,
            Bson::Int64(..) => ElementType::Int64,
            Bson::Decimal128(..) => ElementType::Decimal128,
            Bson::MinKey => ElementType::MinKey,
            Bson::MaxKey => ElementType::MaxKey,
        }
    }

    /// If this value is a string, return it.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Bson::String(s) => Some(s),
            _ => None,
        }
    }

    /// If this value is a boolean, return it.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Bson::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// If this value is an Int32, return it.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Bson::Int32(i) => Some(*i),
            _ => None,
        }
    }

    /// If this value is an Int64, return it.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Bson::Int64(i) => Some(*i),
            _ => None,
        }
    }

    /// If this value is a double, return it.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Bson::Double(f) => Some(*f),
            _ => None,
        }
    }

    /// If this value is a document, return it.
    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Bson::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// If this value is an array, return it.
    pub fn as_array(&self) -> Option<&[Bson]> {
        match self {
            Bson::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// If this value is an ObjectId, return it.
    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Bson::ObjectId(oid) => Some(*oid),
            _ => None,
        }
    }

    /// Coerce any numeric value into an `i64` if doing so is lossless.
    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            Bson::Int32(i) => Some(i64::from(i)),
            Bson::Int64(i) => Some(i),
            Bson::Double(f) if f == f as i64 as f64 => Some(f as i64),
            _ => None,
        }
    }
}

impl fmt::Display for Bson {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bson::Double(v) => write!(f, "{}", v),
            Bson::String(v) => write!(f, "\"{}\"", v),
            Bson::Document(v) => write!(f, "{}", v),
            Bson::Array(v) => {
                f.write_str("[")?;
                for (i, item) in v.iter().enumerate() {
                    if i != 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Bson::Binary(v) => write!(
                f,
                "Binary(0x{:02x}, {})",
                u8::from(v.subtype),
                hex::encode(&v.bytes)
            ),
            Bson::Undefined => f.write_str("undefined"),
            Bson::ObjectId(v) => write!(f, "ObjectId(\"{}\")", v),
            Bson::Boolean(v) => write!(f, "{}", v),
            Bson::DateTime(v) => write!(f, "{}", v),
            Bson::Null => f.write_str("null"),
            Bson::RegularExpression(v) => write!(f, "/{}/{}", v.pattern, v.options),
            Bson::DbPointer(v) => write!(f, "DbPointer({}, {})", v.namespace, v.id),
            Bson::JavaScriptCode(v) => f.write_str(v),
            Bson::Symbol(v) => write!(f, "Symbol(\"{}\")", v),
            Bson::JavaScriptCodeWithScope(v) => write!(f, "{} (scope: {})", v.code, v.scope),
            Bson::Int32(v) => write!(f, "{}", v),
            Bson::Timestamp(v) => write!(f, "{}", v),
            Bson::Int64(v) => write!(f, "{}", v),
            Bson::Decimal128(v) => write!(f, "{}", v),
            Bson::MinKey => f.write_str("MinKey"),
            Bson::MaxKey => f.write_str("MaxKey"),
        }
    }
}

/// Binary data with a subtype byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binary {
    /// The subtype tag.
    pub subtype: BinarySubtype,
    /// The payload.
    pub bytes: Vec<u8>,
}

/// A regular expression with options. Options are alphabetized when encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Regex {
    /// The pattern.
    pub pattern: String,
    /// The option flags (e.g. `i`, `m`).
    pub options: String,
}

/// A deprecated DBPointer value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbPointer {
    /// The namespace the pointer refers into.
    pub namespace: String,
    /// The id of the pointee.
    pub id: ObjectId,
}

/// JavaScript code bundled with a scope document.
#[derive(Clone, Debug, PartialEq)]
pub struct JavaScriptCodeWithScope {
    /// The code.
    pub code: String,
    /// The scope bindings.
    pub scope: Document,
}

/// An internal MongoDB timestamp: a seconds-since-epoch value and an ordinal distinguishing
/// operations within the same second. Encoded on the wire as `increment` then `time`, each a
/// little-endian u32.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// The seconds component.
    pub time: u32,
    /// The ordinal component.
    pub increment: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.time, self.increment)
    }
}

impl<'de> serde::Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct TimestampVisitor;

        impl serde::de::Visitor<'_> for TimestampVisitor {
            type Value = Timestamp;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a BSON timestamp")
            }

            fn visit_u64<E: serde::de::Error>(
                self,
                packed: u64,
            ) -> std::result::Result<Timestamp, E> {
                Ok(Timestamp {
                    time: (packed >> 32) as u32,
                    increment: (packed & 0xFFFF_FFFF) as u32,
                })
            }
        }

        deserializer.deserialize_u64(TimestampVisitor)
    }
}

impl From<f64> for Bson {
    fn from(v: f64) -> Self {
        Bson::Double(v)
    }
}

impl From<&str> for Bson {
    fn from(v: &str) -> Self {
        Bson::String(v.to_string())
    }
}

impl From<String> for Bson {
    fn from(v: String) -> Self {
        Bson::String(v)
    }
}

impl From<bool> for Bson {
    fn from(v: bool) -> Self {
        Bson::Boolean(v)
    }
}

impl From<i32> for Bson {
    fn from(v: i32) -> Self {
        Bson::Int32(v)
    }
}

impl From<i64> for Bson {
    fn from(v: i64) -> Self {
        Bson::Int64(v)
    }
}

impl From<u32> for Bson {
    fn from(v: u32) -> Self {
        Bson::Int64(i64::from(v))
    }
}

impl From<Document> for Bson {
    fn from(v: Document) -> Self {
        Bson::Document(v)
    }
}

impl From<Vec<Bson>> for Bson {
    fn from(v: Vec<Bson>) -> Self {
        Bson::Array(v)
    }
}

impl From<ObjectId> for Bson {
    fn from(v: ObjectId) -> Self {
        Bson::ObjectId(v)
    }
}

impl From<DateTime> for Bson {
    fn from(v: DateTime) -> Self {
        Bson::DateTime(v)
    }
}

impl From<Timestamp> for Bson {
    fn from(v: Timestamp) -> Self {
        Bson::Timestamp(v)
    }
}

impl From<Binary> for Bson {
    fn from(v: Binary) -> Self {
        Bson::Binary(v)
    }
}

impl From<Regex> for Bson {
    fn from(v: Regex) -> Self {
        Bson::RegularExpression(v)
    }
}

impl From<Decimal128> for Bson {
    fn from(v: Decimal128) -> Self {
        Bson::Decimal128(v)
    }
}

impl<T: Into<Bson>> From<Option<T>> for Bson {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Bson::Null,
        }
    }
}
