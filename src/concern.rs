//! Read and write concerns: the durability and consistency requirements attached to commands.

use std::time::Duration;

use crate::{
    bson::{Bson, Document},
    doc,
    error::{Error, Result},
};

/// The level of acknowledgment requested from the server for write operations.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// Requires acknowledgment that the write has propagated to the specified number of nodes.
    /// A value of 0 requests no acknowledgment.
    Nodes(u32),

    /// Requires acknowledgment from a majority of the data-bearing voting members.
    Majority,

    /// Requires acknowledgment per a custom write concern defined in the replica set
    /// configuration.
    Custom(String),
}

impl From<u32> for Acknowledgment {
    fn from(i: u32) -> Self {
        Acknowledgment::Nodes(i)
    }
}

impl From<&str> for Acknowledgment {
    fn from(s: &str) -> Self {
        if s == "majority" {
            Acknowledgment::Majority
        } else {
            Acknowledgment::Custom(s.to_string())
        }
    }
}

/// The durability guarantee requested of the server for a write operation.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/write-concern/)
/// for more details.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub struct WriteConcern {
    /// The requested acknowledgment.
    pub w: Option<Acknowledgment>,

    /// How long the server should wait for the requested acknowledgment before responding with
    /// a write concern error.
    pub w_timeout: Option<Duration>,

    /// Whether the server should wait for the on-disk journal to be written to before
    /// responding.
    pub journal: Option<bool>,
}

impl WriteConcern {
    /// A write concern requiring acknowledgment from a majority of nodes.
    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::Majority),
            ..Default::default()
        }
    }

    /// Whether the server will acknowledge the write at all.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// Whether any field is set.
    pub fn is_empty(&self) -> bool {
        self == &Default::default()
    }

    /// Validate that the combination of fields is permitted by the server.
    pub fn validate(&self) -> Result<()> {
        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(Error::invalid_argument(
                "write concern cannot have w=0 and j=true",
            ));
        }
        Ok(())
    }

    /// The `writeConcern` document appended to commands.
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = doc! {};
        match self.w {
            Some(Acknowledgment::Nodes(n)) => {
                doc.insert("w", n as i32);
            }
            Some(Acknowledgment::Majority) => {
                doc.insert("w", "majority");
            }
            Some(Acknowledgment::Custom(ref name)) => {
                doc.insert("w", name.as_str());
            }
            None => {}
        }
        if let Some(w_timeout) = self.w_timeout {
            doc.insert("wtimeout", w_timeout.as_millis() as i64);
        }
        if let Some(journal) = self.journal {
            doc.insert("j", journal);
        }
        doc
    }
}

/// The consistency and isolation level requested of the server for a read operation.
///
/// See the documentation [here](https://www.mongodb.com/docs/manual/reference/read-concern/)
/// for more details.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct ReadConcern {
    /// The requested level.
    pub level: ReadConcernLevel,
}

/// The levels of read concern the server supports.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadConcernLevel {
    /// The query returns the instance's most recent data, with no durability guarantee.
    Local,

    /// The query returns the instance's most recent data acknowledged by a majority of the
    /// replica set.
    Majority,

    /// The query returns data that reflects all prior writes with `majority` acknowledgment.
    Linearizable,

    /// The query returns the instance's most recent data available for the shard, for use in
    /// multi-shard aggregations.
    Available,

    /// The query returns majority-committed data observable at a requested cluster time.
    Snapshot,

    /// A level newer than this crate's knowledge of the server.
    Custom(String),
}

impl ReadConcernLevel {
    pub(crate) fn from_str(s: &str) -> Self {
        match s {
            "local" => ReadConcernLevel::Local,
            "majority" => ReadConcernLevel::Majority,
            "linearizable" => ReadConcernLevel::Linearizable,
            "available" => ReadConcernLevel::Available,
            "snapshot" => ReadConcernLevel::Snapshot,
            other => ReadConcernLevel::Custom(other.to_string()),
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        match self {
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Linearizable => "linearizable",
            ReadConcernLevel::Available => "available",
            ReadConcernLevel::Snapshot => "snapshot",
            ReadConcernLevel::Custom(s) => s.as_str(),
        }
    }
}

impl ReadConcern {
    /// The `readConcern` document appended to commands.
    #[allow(dead_code)]
    pub(crate) fn to_document(&self) -> Document {
        doc! { "level": self.level.as_str() }
    }
}

impl From<ReadConcernLevel> for ReadConcern {
    fn from(level: ReadConcernLevel) -> Self {
        Self { level }
    }
}

impl From<Bson> for Acknowledgment {
    fn from(value: Bson) -> Self {
        match value {
            Bson::String(s) => Acknowledgment::from(s.as_str()),
            Bson::Int32(n) => Acknowledgment::Nodes(n.max(0) as u32),
            Bson::Int64(n) => Acknowledgment::Nodes(n.max(0) as u32),
            _ => Acknowledgment::Nodes(1),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn w_zero_with_journal_is_invalid() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Nodes(0)),
            journal: Some(true),
            ..Default::default()
        };
        assert!(wc.validate().is_err());
    }

    #[test]
    fn observable_fields_serialize() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Majority),
            w_timeout: Some(Duration::from_millis(250)),
            journal: Some(true),
        };
        let doc = wc.to_document();
        assert_eq!(doc.get_str("w"), Some("majority"));
        assert_eq!(doc.get_i64("wtimeout"), Some(250));
        assert_eq!(doc.get_bool("j"), Some(true));
    }

    #[test]
    fn unacknowledged_detection() {
        let wc = WriteConcern {
            w: Some(Acknowledgment::Nodes(0)),
            ..Default::default()
        };
        assert!(!wc.is_acknowledged());
        assert!(WriteConcern::default().is_acknowledged());
    }
}
