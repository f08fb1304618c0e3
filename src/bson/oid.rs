//! ObjectId support.

use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::{random, Rng};
use serde::de::{Deserialize, Deserializer, Error as _, Visitor};

use crate::error::{Error, ErrorKind, Result};

const TIMESTAMP_SIZE: usize = 4;
const PROCESS_ID_SIZE: usize = 5;
const COUNTER_SIZE: usize = 3;

static OID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// A 12-byte BSON ObjectId: a 4-byte big-endian timestamp, a 5-byte process-unique random value,
/// and a 3-byte big-endian counter seeded with a random value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId {
    id: [u8; 12],
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectId {
    /// Generate a new ObjectId.
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let process_id = process_unique();
        let counter = OID_COUNTER.fetch_add(1, Ordering::SeqCst);

        let mut id = [0u8; 12];
        id[..TIMESTAMP_SIZE].copy_from_slice(&timestamp.to_be_bytes());
        id[TIMESTAMP_SIZE..TIMESTAMP_SIZE + PROCESS_ID_SIZE].copy_from_slice(&process_id);
        id[TIMESTAMP_SIZE + PROCESS_ID_SIZE..]
            .copy_from_slice(&counter.to_be_bytes()[4 - COUNTER_SIZE..]);
        Self { id }
    }

    /// Construct an ObjectId from its raw byte representation.
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self { id: bytes }
    }

    /// The raw byte representation of this ObjectId.
    pub const fn bytes(&self) -> [u8; 12] {
        self.id
    }

    /// Parse a 24-character hexadecimal string into an ObjectId.
    pub fn parse_str(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        let bytes = hex::decode(s).map_err(|_| invalid_hex(s))?;
        let id: [u8; 12] = bytes.try_into().map_err(|_| invalid_hex(s))?;
        Ok(Self { id })
    }

    /// The hexadecimal representation of this ObjectId.
    pub fn to_hex(self) -> String {
        hex::encode(self.id)
    }

    /// The timestamp portion of this ObjectId, in seconds since the epoch.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes(self.id[..TIMESTAMP_SIZE].try_into().unwrap())
    }
}

fn invalid_hex(s: &str) -> Error {
    ErrorKind::InvalidArgument {
        message: format!("invalid ObjectId hex string: {:?}", s),
    }
    .into()
}

/// The 5 process-unique random bytes, generated once per process.
fn process_unique() -> [u8; PROCESS_ID_SIZE] {
    use std::sync::OnceLock;
    static PROCESS_UNIQUE: OnceLock<[u8; PROCESS_ID_SIZE]> = OnceLock::new();
    *PROCESS_UNIQUE.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; PROCESS_ID_SIZE];
        rng.fill(&mut bytes[..]);
        // Seed the counter randomly the first time the process unique bytes are requested.
        let _ = OID_COUNTER.compare_exchange(0, random::<u32>() & 0xFF_FFFF, Ordering::SeqCst, Ordering::SeqCst);
        bytes
    })
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectId").field(&self.to_hex()).finish()
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ObjectIdVisitor;

        impl Visitor<'_> for ObjectIdVisitor {
            type Value = ObjectId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a BSON ObjectId")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<ObjectId, E> {
                let id: [u8; 12] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &"12 bytes"))?;
                Ok(ObjectId::from_bytes(id))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<ObjectId, E> {
                ObjectId::parse_str(v).map_err(|e| E::custom(e.to_string()))
            }
        }

        deserializer.deserialize_any(ObjectIdVisitor)
    }
}

#[cfg(test)]
mod test {
    use super::ObjectId;

    #[test]
    fn hex_round_trip() {
        let oid = ObjectId::new();
        let parsed = ObjectId::parse_str(oid.to_hex()).unwrap();
        assert_eq!(oid, parsed);
    }

    #[test]
    fn ids_are_unique_and_increasing_within_a_second() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(ObjectId::parse_str("not hex").is_err());
        assert!(ObjectId::parse_str("abcd").is_err());
    }
}
