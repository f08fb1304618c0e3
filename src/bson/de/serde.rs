//! A `serde` deserializer over the decoded BSON value model, used to map server replies onto
//! typed response structs.

use serde::de::{
    self,
    DeserializeOwned,
    DeserializeSeed,
    IntoDeserializer,
    MapAccess,
    SeqAccess,
    Visitor,
};

use crate::{
    bson::{Bson, Document},
    error::{DeserializationError, DeserializationErrorKind, Error, Result},
};

/// Deserialize a `T` from a BSON value. Unknown document fields are skipped silently by derived
/// implementations.
pub fn from_bson<T: DeserializeOwned>(bson: Bson) -> Result<T> {
    T::deserialize(Deserializer { value: bson })
}

/// Deserialize a `T` from a document.
pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T> {
    from_bson(Bson::Document(doc))
}

fn overflow(message: impl Into<String>) -> Error {
    DeserializationError {
        kind: DeserializationErrorKind::NumericOverflow,
        message: message.into(),
        offset: None,
    }
    .into()
}

fn unexpected(expected: &str, value: &Bson) -> Error {
    DeserializationError {
        kind: DeserializationErrorKind::UnexpectedType,
        message: format!("expected {}, found {}", expected, value),
        offset: None,
    }
    .into()
}

impl<'de> serde::Deserialize<'de> for Bson {
    fn deserialize<D: de::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct BsonVisitor;

        impl<'de> Visitor<'de> for BsonVisitor {
            type Value = Bson;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("any BSON value")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Bson, E> {
                Ok(Bson::Boolean(v))
            }

            fn visit_i32<E: de::Error>(self, v: i32) -> std::result::Result<Bson, E> {
                Ok(Bson::Int32(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Bson, E> {
                Ok(Bson::Int64(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Bson, E> {
                i64::try_from(v)
                    .map(Bson::Int64)
                    .map_err(|_| E::custom("integer out of range for BSON"))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Bson, E> {
                Ok(Bson::Double(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Bson, E> {
                Ok(Bson::String(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Bson, E> {
                Ok(Bson::String(v))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Bson, E> {
                Ok(Bson::Binary(crate::bson::Binary {
                    subtype: crate::bson::BinarySubtype::Generic,
                    bytes: v.to_vec(),
                }))
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> std::result::Result<Bson, E> {
                Ok(Bson::Binary(crate::bson::Binary {
                    subtype: crate::bson::BinarySubtype::Generic,
                    bytes: v,
                }))
            }

            fn visit_none<E: de::Error>(self) -> std::result::Result<Bson, E> {
                Ok(Bson::Null)
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Bson, E> {
                Ok(Bson::Null)
            }

            fn visit_some<D: de::Deserializer<'de>>(
                self,
                deserializer: D,
            ) -> std::result::Result<Bson, D::Error> {
                deserializer.deserialize_any(BsonVisitor)
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Bson, A::Error> {
                let mut values = Vec::new();
                while let Some(value) = seq.next_element::<Bson>()? {
                    values.push(value);
                }
                Ok(Bson::Array(values))
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Bson, A::Error> {
                let mut doc = Document::new();
                while let Some((key, value)) = map.next_entry::<String, Bson>()? {
                    doc.insert(key, value);
                }
                Ok(Bson::Document(doc))
            }
        }

        deserializer.deserialize_any(BsonVisitor)
    }
}

impl<'de> serde::Deserialize<'de> for Document {
    fn deserialize<D: de::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        match Bson::deserialize(deserializer)? {
            Bson::Document(doc) => Ok(doc),
            other => Err(de::Error::custom(format!(
                "expected a document, found {}",
                other
            ))),
        }
    }
}

struct Deserializer {
    value: Bson,
}

impl<'de> IntoDeserializer<'de, Error> for Deserializer {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self {
        self
    }
}

macro_rules! deserialize_signed {
    ($name:ident, $visit:ident, $ty:ty) => {
        fn $name<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
            match self.value.as_integer() {
                Some(i) => {
                    let narrowed = <$ty>::try_from(i)
                        .map_err(|_| overflow(format!("{} does not fit the target type", i)))?;
                    visitor.$visit(narrowed)
                }
                None => self.deserialize_any(visitor),
            }
        }
    };
}

impl<'de> de::Deserializer<'de> for Deserializer {
    type Error = Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Bson::Double(v) => visitor.visit_f64(v),
            Bson::String(v) => visitor.visit_string(v),
            Bson::Document(v) => visitor.visit_map(DocumentAccess::new(v)),
            Bson::Array(v) => visitor.visit_seq(ArrayAccess::new(v)),
            Bson::Binary(v) => visitor.visit_byte_buf(v.bytes),
            Bson::Undefined | Bson::Null => visitor.visit_unit(),
            Bson::ObjectId(v) => visitor.visit_bytes(&v.bytes()),
            Bson::Boolean(v) => visitor.visit_bool(v),
            Bson::DateTime(v) => visitor.visit_i64(v.timestamp_millis()),
            Bson::JavaScriptCode(v) | Bson::Symbol(v) => visitor.visit_string(v),
            Bson::Int32(v) => visitor.visit_i32(v),
            Bson::Timestamp(v) => {
                visitor.visit_u64((u64::from(v.time) << 32) | u64::from(v.increment))
            }
            Bson::Int64(v) => visitor.visit_i64(v),
            Bson::Decimal128(v) => visitor.visit_bytes(&v.bytes()),
            ref other => Err(unexpected("a deserializable value", other)),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Bson::Boolean(v) => visitor.visit_bool(v),
            ref other => Err(unexpected("a boolean", other)),
        }
    }

    deserialize_signed!(deserialize_i8, visit_i8, i8);
    deserialize_signed!(deserialize_i16, visit_i16, i16);
    deserialize_signed!(deserialize_i32, visit_i32, i32);
    deserialize_signed!(deserialize_u8, visit_u8, u8);
    deserialize_signed!(deserialize_u16, visit_u16, u16);
    deserialize_signed!(deserialize_u32, visit_u32, u32);

    fn deserialize_i64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value.as_integer() {
            Some(i) => visitor.visit_i64(i),
            None => self.deserialize_any(visitor),
        }
    }

    fn deserialize_u64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Bson::Timestamp(v) => {
                visitor.visit_u64((u64::from(v.time) << 32) | u64::from(v.increment))
            }
            ref value => match value.as_integer() {
                Some(i) => {
                    let v = u64::try_from(i)
                        .map_err(|_| overflow(format!("{} does not fit in a u64", i)))?;
                    visitor.visit_u64(v)
                }
                None => Err(unexpected("an unsigned integer", value)),
            },
        }
    }

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_f64(visitor)
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Bson::Double(v) => visitor.visit_f64(v),
            Bson::Int32(v) => visitor.visit_f64(f64::from(v)),
            Bson::Int64(v) => {
                let f = v as f64;
                if f as i64 != v {
                    return Err(overflow(format!("{} does not round-trip through f64", v)));
                }
                visitor.visit_f64(f)
            }
            ref other => Err(unexpected("a numeric value", other)),
        }
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_str(visitor)
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Bson::String(v) | Bson::JavaScriptCode(v) | Bson::Symbol(v) => visitor.visit_string(v),
            ref other => Err(unexpected("a string", other)),
        }
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_any(visitor)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_any(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Bson::Null | Bson::Undefined => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Bson::Null | Bson::Undefined => visitor.visit_unit(),
            ref other => Err(unexpected("null", other)),
        }
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Bson::Array(v) => visitor.visit_seq(ArrayAccess::new(v)),
            ref other => Err(unexpected("an array", other)),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        match self.value {
            Bson::Document(v) => visitor.visit_map(DocumentAccess::new(v)),
            ref other => Err(unexpected("a document", other)),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        self.deserialize_map(visitor)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        match self.value {
            Bson::String(v) => visitor.visit_enum(v.into_deserializer()),
            Bson::Document(doc) => {
                let mut iter = doc.into_iter();
                let (variant, value) = match (iter.next(), iter.next()) {
                    (Some(entry), None) => entry,
                    _ => {
                        return Err(unexpected(
                            "a document with a single variant field",
                            &Bson::Null,
                        ))
                    }
                };
                visitor.visit_enum(EnumAccess { variant, value })
            }
            ref other => Err(unexpected("an enum representation", other)),
        }
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_unit()
    }
}

struct DocumentAccess {
    iter: std::vec::IntoIter<(String, Bson)>,
    value: Option<Bson>,
}

impl DocumentAccess {
    fn new(doc: Document) -> Self {
        Self {
            iter: doc.into_iter().collect::<Vec<_>>().into_iter(),
            value: None,
        }
    }
}

impl<'de> MapAccess<'de> for DocumentAccess {
    type Error = Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
        match self.iter.next() {
            Some((key, value)) => {
                self.value = Some(value);
                seed.deserialize(Deserializer {
                    value: Bson::String(key),
                })
                .map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
        let value = self
            .value
            .take()
            .ok_or_else(|| Error::internal("value requested before key"))?;
        seed.deserialize(Deserializer { value })
    }
}

struct ArrayAccess {
    iter: std::vec::IntoIter<Bson>,
}

impl ArrayAccess {
    fn new(values: Vec<Bson>) -> Self {
        Self {
            iter: values.into_iter(),
        }
    }
}

impl<'de> SeqAccess<'de> for ArrayAccess {
    type Error = Error;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>> {
        match self.iter.next() {
            Some(value) => seed.deserialize(Deserializer { value }).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct EnumAccess {
    variant: String,
    value: Bson,
}

impl<'de> de::EnumAccess<'de> for EnumAccess {
    type Error = Error;
    type Variant = VariantAccess;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, VariantAccess)> {
        let variant = seed.deserialize(Deserializer {
            value: Bson::String(self.variant),
        })?;
        Ok((variant, VariantAccess { value: self.value }))
    }
}

struct VariantAccess {
    value: Bson,
}

impl<'de> de::VariantAccess<'de> for VariantAccess {
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value> {
        seed.deserialize(Deserializer { value: self.value })
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
        de::Deserializer::deserialize_seq(Deserializer { value: self.value }, visitor)
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        de::Deserializer::deserialize_map(Deserializer { value: self.value }, visitor)
    }
}

#[cfg(test)]
mod test {
    use serde::Deserialize;

    use super::*;
    use crate::{
        bson::{oid::ObjectId, DateTime, Timestamp},
        doc,
    };

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Reply {
        is_writable_primary: Option<bool>,
        max_wire_version: Option<i32>,
        hosts: Option<Vec<String>>,
        election_id: Option<ObjectId>,
        op_time: Option<Timestamp>,
        local_time: Option<DateTime>,
    }

    #[test]
    fn typed_structs_deserialize_and_skip_unknown_fields() {
        let oid = ObjectId::new();
        let doc = doc! {
            "isWritablePrimary": true,
            "maxWireVersion": 17,
            "hosts": vec![crate::bson::Bson::String("a:27017".to_string())],
            "electionId": oid,
            "opTime": Timestamp { time: 10, increment: 2 },
            "localTime": DateTime::from_millis(1_000),
            "somethingNewFromTheServer": { "nested": 1 },
        };
        let reply: Reply = from_document(doc).unwrap();
        assert_eq!(
            reply,
            Reply {
                is_writable_primary: Some(true),
                max_wire_version: Some(17),
                hosts: Some(vec!["a:27017".to_string()]),
                election_id: Some(oid),
                op_time: Some(Timestamp {
                    time: 10,
                    increment: 2
                }),
                local_time: Some(DateTime::from_millis(1_000)),
            }
        );
    }

    #[test]
    fn numeric_narrowing_checks_round_trips() {
        #[derive(Debug, Deserialize)]
        struct Narrow {
            #[allow(dead_code)]
            n: i32,
        }
        assert!(from_document::<Narrow>(doc! { "n": 42i64 }).is_ok());
        assert!(from_document::<Narrow>(doc! { "n": i64::MAX }).is_err());
    }

    #[test]
    fn missing_fields_are_none() {
        let reply: Reply = from_document(doc! {}).unwrap();
        assert_eq!(reply.max_wire_version, None);
    }
}
