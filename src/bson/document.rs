//! An ordered BSON document.

use std::fmt;

use super::{de::DocumentReader, ser::DocumentWriter, Bson};
use crate::error::Result;

/// An ordered mapping of UTF-8 field names to BSON values. Field order is preserved on both
/// encode and decode; re-inserting an existing key replaces the value in place.
#[derive(Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, Bson)>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of fields in the document.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the document contains no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a field, replacing (in place) any existing field of the same name. Returns the
    /// replaced value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bson>) -> Option<Bson> {
        let key = key.into();
        let value = value.into();
        for (existing, slot) in self.entries.iter_mut() {
            if *existing == key {
                return Some(std::mem::replace(slot, value));
            }
        }
        self.entries.push((key, value));
        None
    }

    /// Remove a field, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<Bson> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Get a field's value.
    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.entries
            .iter()
            .find_map(|(k, v)| if k == key { Some(v) } else { None })
    }

    /// Whether the document contains the given field.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Get a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Bson::as_str)
    }

    /// Get a boolean field.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Bson::as_bool)
    }

    /// Get an i32 field.
    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(Bson::as_i32)
    }

    /// Get an i64 field.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Bson::as_i64)
    }

    /// Get a double field.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Bson::as_f64)
    }

    /// Get an embedded document field.
    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(Bson::as_document)
    }

    /// Get an array field.
    pub fn get_array(&self, key: &str) -> Option<&[Bson]> {
        self.get(key).and_then(Bson::as_array)
    }

    /// Iterate over the fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bson)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate over the field names in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Encode this document to its BSON byte representation.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut writer = DocumentWriter::new();
        self.encode(&mut writer)?;
        writer.into_vec()
    }

    /// Encode this document into an open writer as the next document value.
    pub fn encode(&self, writer: &mut DocumentWriter) -> Result<()> {
        writer.write_start_document()?;
        for (key, value) in self.iter() {
            writer.append(key, value)?;
        }
        writer.write_end_document()
    }

    /// Decode a document from its BSON byte representation. Trailing bytes are rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut reader = DocumentReader::new(bytes)?;
        let doc = reader.read_document()?;
        reader.expect_exhausted()?;
        Ok(doc)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        let mut first = true;
        for (key, value) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "\"{}\": {}", key, value)?;
        }
        f.write_str(" }")
    }
}

impl IntoIterator for Document {
    type Item = (String, Bson);
    type IntoIter = std::vec::IntoIter<(String, Bson)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<(String, Bson)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Bson)>>(iter: T) -> Self {
        let mut doc = Document::new();
        for (key, value) in iter {
            doc.insert(key, value);
        }
        doc
    }
}

impl Extend<(String, Bson)> for Document {
    fn extend<T: IntoIterator<Item = (String, Bson)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.insert(key, value);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{bson::Bson, doc};

    #[test]
    fn insertion_order_is_preserved() {
        let doc = doc! { "z": 1, "a": 2, "m": 3 };
        let keys: Vec<_> = doc.keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn reinsert_replaces_in_place() {
        let mut doc = doc! { "a": 1, "b": 2 };
        doc.insert("a", 42);
        let entries: Vec<_> = doc.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), Bson::Int32(42)),
                ("b".to_string(), Bson::Int32(2))
            ]
        );
    }
}
