//! Read preferences and server selection criteria.

use std::{collections::HashMap, sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::Deserialize;

use crate::{
    bson::{Bson, Document},
    doc,
    error::{Error, Result},
    sdam::public::ServerInfo,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[derive_where(Debug)]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ///
    /// See the documentation [here](https://www.mongodb.com/docs/manual/core/read-preference/) for more details.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            (Self::Predicate(p1), Self::Predicate(p2)) => Arc::ptr_eq(p1, p2),
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    /// Criteria matching only the server at the given address.
    pub fn from_address(address: crate::client::options::ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the driver should route a read operation to members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a replica set, and
/// `max_staleness` specifies the maximum lag behind the primary that a secondary can be to
/// remain eligible for the operation.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more details.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        /// Options for the read preference.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries
    /// if not.
    PrimaryPreferred {
        /// Options for the read preference.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        /// Options for the read preference.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the node with the least network latency regardless of whether
    /// it's the primary or a secondary.
    Nearest {
        /// Options for the read preference.
        options: ReadPreferenceOptions,
    },
}

/// Options shared by the non-primary read preference modes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Tag sets to order eligibility by data locality. Tried in order: the first set that
    /// matches at least one server is used; an empty set matches any server.
    pub tag_sets: Option<Vec<TagSet>>,

    /// The maximum replication lag a secondary may have to remain eligible.
    pub max_staleness: Option<Duration>,
}

impl ReadPreference {
    /// Parse a read preference mode name as it appears in connection strings.
    pub(crate) fn from_mode(mode: &str, options: ReadPreferenceOptions) -> Result<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "primary" => {
                if options != ReadPreferenceOptions::default() {
                    return Err(Error::invalid_argument(
                        "primary read preference cannot carry tag sets or max staleness",
                    ));
                }
                Ok(ReadPreference::Primary)
            }
            "secondary" => Ok(ReadPreference::Secondary { options }),
            "primarypreferred" => Ok(ReadPreference::PrimaryPreferred { options }),
            "secondarypreferred" => Ok(ReadPreference::SecondaryPreferred { options }),
            "nearest" => Ok(ReadPreference::Nearest { options }),
            other => Err(Error::invalid_argument(format!(
                "invalid read preference mode {:?}",
                other
            ))),
        }
    }

    pub(crate) fn mode_name(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::Secondary { .. } => "secondary",
            ReadPreference::PrimaryPreferred { .. } => "primaryPreferred",
            ReadPreference::SecondaryPreferred { .. } => "secondaryPreferred",
            ReadPreference::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { options }
            | ReadPreference::PrimaryPreferred { options }
            | ReadPreference::SecondaryPreferred { options }
            | ReadPreference::Nearest { options } => Some(options),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    /// Replace this read preference's tag sets. Errors for the primary mode, which cannot carry
    /// tags.
    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        match self {
            ReadPreference::Primary => {
                return Err(Error::invalid_argument(
                    "read preference tags can only be specified when a non-primary mode is \
                     specified",
                ));
            }
            ReadPreference::Secondary { ref mut options }
            | ReadPreference::PrimaryPreferred { ref mut options }
            | ReadPreference::SecondaryPreferred { ref mut options }
            | ReadPreference::Nearest { ref mut options } => {
                options.tag_sets = Some(tag_sets);
            }
        }
        Ok(self)
    }

    /// Replace this read preference's max staleness. Errors for the primary mode.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        match self {
            ReadPreference::Primary => {
                return Err(Error::invalid_argument(
                    "max staleness can only be specified when a non-primary mode is specified",
                ));
            }
            ReadPreference::Secondary { ref mut options }
            | ReadPreference::PrimaryPreferred { ref mut options }
            | ReadPreference::SecondaryPreferred { ref mut options }
            | ReadPreference::Nearest { ref mut options } => {
                options.max_staleness = Some(max_staleness);
            }
        }
        Ok(self)
    }

    /// The `$readPreference` document sent to mongos.
    pub(crate) fn to_document(&self) -> Document {
        let mut doc = doc! { "mode": self.mode_name() };

        if let Some(max_staleness) = self.max_staleness() {
            doc.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
        }
        if let Some(tag_sets) = self.tag_sets() {
            let tags: Vec<Bson> = tag_sets
                .iter()
                .map(|tag_set| {
                    Bson::Document(
                        tag_set
                            .iter()
                            .map(|(k, v)| (k.clone(), Bson::String(v.clone())))
                            .collect(),
                    )
                })
                .collect();
            doc.insert("tags", tags);
        }
        doc
    }
}

/// A read preference tag set. See the documentation
/// [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/) for more details.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn primary_rejects_tags() {
        assert!(ReadPreference::Primary
            .with_tags(vec![TagSet::new()])
            .is_err());
        assert!(ReadPreference::from_mode(
            "primary",
            ReadPreferenceOptions {
                max_staleness: Some(Duration::from_secs(90)),
                ..Default::default()
            },
        )
        .is_err());
    }

    #[test]
    fn to_document_includes_tags_and_staleness() {
        let mut tags = TagSet::new();
        tags.insert("dc".to_string(), "ny".to_string());
        let pref = ReadPreference::Secondary {
            options: ReadPreferenceOptions {
                tag_sets: Some(vec![tags]),
                max_staleness: Some(Duration::from_secs(120)),
            },
        };
        let doc = pref.to_document();
        assert_eq!(doc.get_str("mode"), Some("secondary"));
        assert_eq!(doc.get_i64("maxStalenessSeconds"), Some(120));
        assert_eq!(doc.get_array("tags").unwrap().len(), 1);
    }
}
