//! A composable codec registry: an ordered list of providers consulted per target type, with
//! per-type memoization of lookup results.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, RwLock},
};

use super::{Bson, Document, DocumentReader, DocumentWriter};
use crate::error::{Error, Result};

/// The default name of the discriminator field written by polymorphic codecs.
pub const DEFAULT_DISCRIMINATOR_FIELD: &str = "_t";

/// Encodes and decodes values of a single target type through the streaming writer/reader pair.
pub trait Codec<T>: Send + Sync {
    /// Encode `value` as the next document value.
    fn encode(&self, writer: &mut DocumentWriter, value: &T) -> Result<()>;

    /// Decode a value positioned at a document.
    fn decode(&self, reader: &mut DocumentReader<'_>) -> Result<T>;
}

/// A source of codecs. Providers are registered in order and consulted in that order; the first
/// provider to return a codec for a type wins.
pub trait CodecProvider: Send + Sync {
    /// Return a type-erased `Arc<dyn Codec<T>>` (wrapped in `Arc<dyn Any>`) for the given type,
    /// if this provider supplies one. Implementations may recursively look up codecs for
    /// constituent types through `registry`.
    fn codec_for(
        &self,
        type_id: TypeId,
        registry: &CodecRegistry,
    ) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Type-erase a codec for storage in the registry cache.
pub fn erase<T: 'static>(codec: Arc<dyn Codec<T>>) -> Arc<dyn Any + Send + Sync> {
    Arc::new(codec)
}

/// An ordered, memoizing lookup from target type to codec.
#[derive(Clone)]
pub struct CodecRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    providers: Vec<Arc<dyn CodecProvider>>,
    cache: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("providers", &self.inner.providers.len())
            .finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::builder().provider(ValueCodecProvider).build()
    }
}

impl CodecRegistry {
    /// Start building a registry.
    pub fn builder() -> CodecRegistryBuilder {
        CodecRegistryBuilder {
            providers: Vec::new(),
        }
    }

    /// Look up the codec for `T`, consulting providers in registration order and memoizing the
    /// result.
    pub fn get<T: 'static>(&self) -> Result<Arc<dyn Codec<T>>> {
        let type_id = TypeId::of::<T>();
        if let Some(erased) = self.inner.cache.read().unwrap().get(&type_id) {
            return downcast::<T>(erased);
        }
        for provider in &self.inner.providers {
            if let Some(erased) = provider.codec_for(type_id, self) {
                let codec = downcast::<T>(&erased)?;
                self.inner
                    .cache
                    .write()
                    .unwrap()
                    .insert(type_id, erased);
                return Ok(codec);
            }
        }
        Err(Error::invalid_argument(format!(
            "no codec registered for {}",
            std::any::type_name::<T>()
        )))
    }
}

fn downcast<T: 'static>(erased: &Arc<dyn Any + Send + Sync>) -> Result<Arc<dyn Codec<T>>> {
    erased
        .downcast_ref::<Arc<dyn Codec<T>>>()
        .cloned()
        .ok_or_else(|| {
            Error::internal(format!(
                "provider returned a mistyped codec for {}",
                std::any::type_name::<T>()
            ))
        })
}

/// Builder for a [`CodecRegistry`].
pub struct CodecRegistryBuilder {
    providers: Vec<Arc<dyn CodecProvider>>,
}

impl CodecRegistryBuilder {
    /// Append a provider; earlier providers take precedence.
    pub fn provider(mut self, provider: impl CodecProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Finish building.
    pub fn build(self) -> CodecRegistry {
        CodecRegistry {
            inner: Arc::new(RegistryInner {
                providers: self.providers,
                cache: RwLock::new(HashMap::new()),
            }),
        }
    }
}

/// Provides codecs for the value model itself (`Document` and `Bson`).
pub struct ValueCodecProvider;

impl CodecProvider for ValueCodecProvider {
    fn codec_for(
        &self,
        type_id: TypeId,
        _registry: &CodecRegistry,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        if type_id == TypeId::of::<Document>() {
            Some(erase::<Document>(Arc::new(DocumentCodec)))
        } else if type_id == TypeId::of::<Bson>() {
            Some(erase::<Bson>(Arc::new(BsonCodec)))
        } else {
            None
        }
    }
}

struct DocumentCodec;

impl Codec<Document> for DocumentCodec {
    fn encode(&self, writer: &mut DocumentWriter, value: &Document) -> Result<()> {
        value.encode(writer)
    }

    fn decode(&self, reader: &mut DocumentReader<'_>) -> Result<Document> {
        reader.read_document()
    }
}

struct BsonCodec;

impl Codec<Bson> for BsonCodec {
    fn encode(&self, writer: &mut DocumentWriter, value: &Bson) -> Result<()> {
        writer.write_bson(value)
    }

    fn decode(&self, reader: &mut DocumentReader<'_>) -> Result<Bson> {
        reader.read_value()
    }
}

/// A polymorphic family encodable behind a discriminator field.
pub trait Discriminated: Sized {
    /// The short name identifying this value's variant.
    fn variant_name(&self) -> &'static str;

    /// Encode this variant's fields into the open document.
    fn encode_fields(&self, writer: &mut DocumentWriter) -> Result<()>;

    /// Reconstruct a variant from its short name and decoded fields.
    fn decode_variant(name: &str, fields: &Document) -> Result<Self>;
}

/// A codec for a [`Discriminated`] family. Encodes the discriminator field first, then the
/// variant's own fields.
pub struct DiscriminatedCodec<T> {
    field: String,
    _target: PhantomData<fn() -> T>,
}

impl<T> DiscriminatedCodec<T> {
    /// A codec using the default discriminator field name.
    pub fn new() -> Self {
        Self::with_field(DEFAULT_DISCRIMINATOR_FIELD)
    }

    /// A codec using a custom discriminator field name.
    pub fn with_field(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            _target: PhantomData,
        }
    }
}

impl<T> Default for DiscriminatedCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Discriminated + Send + Sync> Codec<T> for DiscriminatedCodec<T> {
    fn encode(&self, writer: &mut DocumentWriter, value: &T) -> Result<()> {
        writer.write_start_document()?;
        writer.write_name(self.field.as_str())?;
        writer.write_string(value.variant_name())?;
        value.encode_fields(writer)?;
        writer.write_end_document()
    }

    fn decode(&self, reader: &mut DocumentReader<'_>) -> Result<T> {
        let fields = reader.read_document()?;
        let name = fields.get_str(&self.field).ok_or_else(|| {
            Error::invalid_response(format!("missing discriminator field {:?}", self.field))
        })?;
        T::decode_variant(name, &fields)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::doc;

    #[derive(Debug, PartialEq)]
    enum WriteRequest {
        Insert { document: Document },
        Delete { filter: Document },
    }

    impl Discriminated for WriteRequest {
        fn variant_name(&self) -> &'static str {
            match self {
                WriteRequest::Insert { .. } => "insert",
                WriteRequest::Delete { .. } => "delete",
            }
        }

        fn encode_fields(&self, writer: &mut DocumentWriter) -> Result<()> {
            match self {
                WriteRequest::Insert { document } => {
                    writer.write_name("document")?;
                    document.encode(writer)
                }
                WriteRequest::Delete { filter } => {
                    writer.write_name("filter")?;
                    filter.encode(writer)
                }
            }
        }

        fn decode_variant(name: &str, fields: &Document) -> Result<Self> {
            match name {
                "insert" => Ok(WriteRequest::Insert {
                    document: fields
                        .get_document("document")
                        .cloned()
                        .unwrap_or_default(),
                }),
                "delete" => Ok(WriteRequest::Delete {
                    filter: fields.get_document("filter").cloned().unwrap_or_default(),
                }),
                other => Err(Error::invalid_response(format!(
                    "unknown write request variant {:?}",
                    other
                ))),
            }
        }
    }

    struct WriteRequestProvider;

    impl CodecProvider for WriteRequestProvider {
        fn codec_for(
            &self,
            type_id: TypeId,
            _registry: &CodecRegistry,
        ) -> Option<Arc<dyn Any + Send + Sync>> {
            (type_id == TypeId::of::<WriteRequest>())
                .then(|| erase::<WriteRequest>(Arc::new(DiscriminatedCodec::new())))
        }
    }

    #[test]
    fn discriminator_round_trip() {
        let registry = CodecRegistry::builder()
            .provider(WriteRequestProvider)
            .provider(ValueCodecProvider)
            .build();
        let codec = registry.get::<WriteRequest>().unwrap();

        let request = WriteRequest::Insert {
            document: doc! { "x": 1 },
        };
        let mut writer = DocumentWriter::new();
        codec.encode(&mut writer, &request).unwrap();
        let bytes = writer.into_vec().unwrap();

        let decoded = Document::from_slice(&bytes).unwrap();
        assert_eq!(decoded.get_str("_t"), Some("insert"));

        let mut reader = DocumentReader::new(&bytes).unwrap();
        assert_eq!(codec.decode(&mut reader).unwrap(), request);
    }

    #[test]
    fn providers_are_consulted_in_order_and_memoized() {
        struct CountingProvider(Arc<AtomicUsize>);

        impl CodecProvider for CountingProvider {
            fn codec_for(
                &self,
                type_id: TypeId,
                _registry: &CodecRegistry,
            ) -> Option<Arc<dyn Any + Send + Sync>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                (type_id == TypeId::of::<Document>())
                    .then(|| erase::<Document>(Arc::new(DocumentCodec)))
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let registry = CodecRegistry::builder()
            .provider(CountingProvider(calls.clone()))
            .provider(ValueCodecProvider)
            .build();

        registry.get::<Document>().unwrap();
        registry.get::<Document>().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The second provider serves types the first declines.
        registry.get::<Bson>().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_types_are_an_error() {
        let registry = CodecRegistry::default();
        assert!(registry.get::<u128>().is_err());
    }
}
