//! Constants derived from the BSON specification.

/// All of the types of values that can appear in a BSON document, tagged with the byte that
/// introduces an element of that type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
#[non_exhaustive]
pub enum ElementType {
    /// The `0x00` terminator of a document; not a value type.
    EndOfDocument = 0x00,
    /// 64-bit binary floating point.
    Double = 0x01,
    /// UTF-8 string.
    String = 0x02,
    /// Embedded document.
    EmbeddedDocument = 0x03,
    /// Array, encoded as a document with decimal-index keys.
    Array = 0x04,
    /// Binary data with a subtype byte.
    Binary = 0x05,
    /// Deprecated undefined value.
    Undefined = 0x06,
    /// 12-byte ObjectId.
    ObjectId = 0x07,
    /// Boolean.
    Boolean = 0x08,
    /// UTC datetime, int64 milliseconds since the epoch.
    DateTime = 0x09,
    /// Null.
    Null = 0x0A,
    /// Regular expression with options.
    RegularExpression = 0x0B,
    /// Deprecated DBPointer.
    DbPointer = 0x0C,
    /// JavaScript code.
    JavaScriptCode = 0x0D,
    /// Deprecated symbol.
    Symbol = 0x0E,
    /// JavaScript code with a scope document.
    JavaScriptCodeWithScope = 0x0F,
    /// 32-bit integer.
    Int32 = 0x10,
    /// Internal MongoDB timestamp.
    Timestamp = 0x11,
    /// 64-bit integer.
    Int64 = 0x12,
    /// 128-bit decimal floating point.
    Decimal128 = 0x13,
    /// Greater than all other values.
    MaxKey = 0x7F,
    /// Less than all other values.
    MinKey = 0xFF,
}

impl ElementType {
    /// Attempt to convert a raw type byte into an `ElementType`.
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0x00 => ElementType::EndOfDocument,
            0x01 => ElementType::Double,
            0x02 => ElementType::String,
            0x03 => ElementType::EmbeddedDocument,
            0x04 => ElementType::Array,
            0x05 => ElementType::Binary,
            0x06 => ElementType::Undefined,
            0x07 => ElementType::ObjectId,
            0x08 => ElementType::Boolean,
            0x09 => ElementType::DateTime,
            0x0A => ElementType::Null,
            0x0B => ElementType::RegularExpression,
            0x0C => ElementType::DbPointer,
            0x0D => ElementType::JavaScriptCode,
            0x0E => ElementType::Symbol,
            0x0F => ElementType::JavaScriptCodeWithScope,
            0x10 => ElementType::Int32,
            0x11 => ElementType::Timestamp,
            0x12 => ElementType::Int64,
            0x13 => ElementType::Decimal128,
            0x7F => ElementType::MaxKey,
            0xFF => ElementType::MinKey,
            _ => return None,
        })
    }
}

/// The subtype byte carried by BSON binary values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum BinarySubtype {
    /// Generic binary.
    Generic,
    /// A function.
    Function,
    /// Deprecated generic binary encoding.
    BinaryOld,
    /// Deprecated UUID encoding.
    UuidOld,
    /// A UUID.
    Uuid,
    /// An MD5 hash.
    Md5,
    /// An encrypted value (client-side field-level encryption).
    Encrypted,
    /// A compressed BSON column.
    Column,
    /// Sensitive data that should be redacted from logs.
    Sensitive,
    /// A user-defined subtype (`0x80` and above).
    UserDefined(u8),
    /// A reserved, currently-unassigned subtype.
    Reserved(u8),
}

impl From<u8> for BinarySubtype {
    fn from(byte: u8) -> Self {
        match byte {
            0x00 => BinarySubtype::Generic,
            0x01 => BinarySubtype::Function,
            0x02 => BinarySubtype::BinaryOld,
            0x03 => BinarySubtype::UuidOld,
            0x04 => BinarySubtype::Uuid,
            0x05 => BinarySubtype::Md5,
            0x06 => BinarySubtype::Encrypted,
            0x07 => BinarySubtype::Column,
            0x08 => BinarySubtype::Sensitive,
            b if b >= 0x80 => BinarySubtype::UserDefined(b),
            b => BinarySubtype::Reserved(b),
        }
    }
}

impl From<BinarySubtype> for u8 {
    fn from(subtype: BinarySubtype) -> Self {
        match subtype {
            BinarySubtype::Generic => 0x00,
            BinarySubtype::Function => 0x01,
            BinarySubtype::BinaryOld => 0x02,
            BinarySubtype::UuidOld => 0x03,
            BinarySubtype::Uuid => 0x04,
            BinarySubtype::Md5 => 0x05,
            BinarySubtype::Encrypted => 0x06,
            BinarySubtype::Column => 0x07,
            BinarySubtype::Sensitive => 0x08,
            BinarySubtype::UserDefined(b) => b,
            BinarySubtype::Reserved(b) => b,
        }
    }
}
