use crate::{
    bson::{
        spec::ElementType,
        Binary,
        Bson,
        DateTime,
        DbPointer,
        Decimal128,
        Document,
        ObjectId,
        Regex,
        Timestamp,
    },
    error::{Result, SerializationErrorKind},
};

/// The default maximum size of a single serialized document, shared with the server default.
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// The default maximum size of a wire message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48 * 1000 * 1000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ContextKind {
    Document,
    Array,
    JavaScriptWithScope,
}

#[derive(Debug)]
struct Context {
    kind: ContextKind,
    /// Offset of the i32 length prefix backpatched when the context closes.
    start: usize,
    /// Index of the next array element; unused for other kinds.
    index: usize,
}

#[derive(Debug)]
struct ArrayMark {
    depth: usize,
    position: usize,
    index: usize,
}

/// A streaming BSON writer.
///
/// The writer maintains a stack of open document/array contexts and validates that each
/// operation is admissible in the current context: named writes require an open document with a
/// pending name (see [`write_name`](Self::write_name)), unnamed writes require an open array
/// (element names are synthesized as ascending decimal strings). Nested lengths are backpatched
/// when a context closes, at which point the completed size is checked against the active
/// maximum document size.
#[derive(Debug)]
pub struct DocumentWriter {
    buf: Vec<u8>,
    stack: Vec<Context>,
    pending_name: Option<String>,
    max_document_size: Vec<usize>,
    max_message_size: usize,
    mark: Option<ArrayMark>,
}

impl Default for DocumentWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentWriter {
    /// Create a writer with the default size limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_DOCUMENT_SIZE, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a writer with explicit document and message size limits.
    pub fn with_limits(max_document_size: usize, max_message_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            stack: Vec::new(),
            pending_name: None,
            max_document_size: vec![max_document_size],
            max_message_size,
            mark: None,
        }
    }

    /// Push a temporary, typically smaller, maximum document size. Used when embedding documents
    /// that must fit within a command's per-batch budget.
    pub fn push_max_document_size(&mut self, size: usize) {
        self.max_document_size.push(size);
    }

    /// Pop the most recently pushed maximum document size.
    pub fn pop_max_document_size(&mut self) -> Result<()> {
        if self.max_document_size.len() == 1 {
            return Err(self.invalid_state("no pushed max document size to pop"));
        }
        self.max_document_size.pop();
        Ok(())
    }

    /// The bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer, returning the serialized bytes. All opened contexts must be closed.
    pub fn into_vec(self) -> Result<Vec<u8>> {
        if !self.stack.is_empty() {
            return Err(self.invalid_state("writer still has open documents"));
        }
        Ok(self.buf)
    }

    /// Set the name of the next value written into the open document.
    pub fn write_name(&mut self, name: impl Into<String>) -> Result<()> {
        match self.stack.last() {
            Some(ctx) if ctx.kind == ContextKind::Document => {}
            _ => return Err(self.invalid_state("write_name requires an open document context")),
        }
        if self.pending_name.is_some() {
            return Err(self.invalid_state("a name is already pending"));
        }
        self.pending_name = Some(name.into());
        Ok(())
    }

    /// Open a document: at the top level, as the pending-named element of an open document, as
    /// the next element of an open array, or as the scope of an open code-with-scope value.
    pub fn write_start_document(&mut self) -> Result<()> {
        match self.stack.last() {
            None => {}
            Some(ctx) if ctx.kind == ContextKind::JavaScriptWithScope => {}
            Some(_) => self.start_element(ElementType::EmbeddedDocument)?,
        }
        let start = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        self.stack.push(Context {
            kind: ContextKind::Document,
            start,
            index: 0,
        });
        Ok(())
    }

    /// Close the innermost open document, backpatching its length prefix and validating the
    /// completed size against the active maximum.
    pub fn write_end_document(&mut self) -> Result<()> {
        if self.pending_name.is_some() {
            return Err(self.invalid_state("cannot end a document with a name pending"));
        }
        if !matches!(self.stack.last(), Some(ctx) if ctx.kind == ContextKind::Document) {
            return Err(self.invalid_state("no open document to end"));
        }
        let ctx = self.stack.pop().unwrap();
        self.buf.push(0);
        self.backpatch_and_check(ctx.start)?;

        // A document closed directly inside a code-with-scope value completes that value too.
        if matches!(self.stack.last(), Some(parent) if parent.kind == ContextKind::JavaScriptWithScope)
        {
            let parent = self.stack.pop().unwrap();
            let total = self.buf.len() - parent.start;
            self.patch_length(parent.start, total);
        }

        if self.stack.is_empty() {
            self.mark = None;
            if self.buf.len() > self.max_message_size {
                return Err(SerializationErrorKind::MessageTooLarge {
                    size: self.buf.len(),
                    max: self.max_message_size,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Open an array as the next value.
    pub fn write_start_array(&mut self) -> Result<()> {
        if self.stack.is_empty() {
            return Err(self.invalid_state("an array cannot be a top-level value"));
        }
        self.start_element(ElementType::Array)?;
        let start = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        self.stack.push(Context {
            kind: ContextKind::Array,
            start,
            index: 0,
        });
        Ok(())
    }

    /// Close the innermost open array.
    pub fn write_end_array(&mut self) -> Result<()> {
        if !matches!(self.stack.last(), Some(ctx) if ctx.kind == ContextKind::Array) {
            return Err(self.invalid_state("no open array to end"));
        }
        let ctx = self.stack.pop().unwrap();
        if let Some(ref mark) = self.mark {
            if mark.depth == self.stack.len() + 1 {
                self.mark = None;
            }
        }
        self.buf.push(0);
        self.backpatch_and_check(ctx.start)
    }

    /// Checkpoint the current write position within the innermost open array. A subsequent
    /// [`reset`](Self::reset) rewinds to this point, discarding any elements written since.
    pub fn mark(&mut self) -> Result<()> {
        let ctx = match self.stack.last() {
            Some(ctx) if ctx.kind == ContextKind::Array => ctx,
            _ => return Err(self.invalid_state("mark requires an open array context")),
        };
        self.mark = Some(ArrayMark {
            depth: self.stack.len(),
            position: self.buf.len(),
            index: ctx.index,
        });
        Ok(())
    }

    /// Rewind to the most recent [`mark`](Self::mark). The innermost open context must be the
    /// same array that was open when the mark was taken.
    pub fn reset(&mut self) -> Result<()> {
        let mark = match self.mark.take() {
            Some(mark) => mark,
            None => return Err(self.invalid_state("no mark to reset to")),
        };
        let in_marked_array = self.stack.len() == mark.depth
            && matches!(self.stack.last(), Some(ctx) if ctx.kind == ContextKind::Array);
        if !in_marked_array {
            return Err(self.invalid_state("reset outside the marked array"));
        }
        self.buf.truncate(mark.position);
        self.pending_name = None;
        self.stack.last_mut().unwrap().index = mark.index;
        Ok(())
    }

    /// Copy one complete document from raw bytes into the writer as the next document value,
    /// rewriting the leading length prefix but otherwise byte-copying.
    pub fn pipe_document(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < 5
            || bytes[bytes.len() - 1] != 0
            || i32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize != bytes.len()
        {
            return Err(self.invalid_state("pipe source is not a complete document"));
        }
        if !self.stack.is_empty() {
            self.start_element(ElementType::EmbeddedDocument)?;
        }
        let start = self.buf.len();
        self.buf.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
        self.buf.extend_from_slice(&bytes[4..]);
        self.check_size(start)
    }

    /// Write a named value into the open document.
    pub fn append(&mut self, name: impl Into<String>, value: &Bson) -> Result<()> {
        self.write_name(name)?;
        self.write_bson(value)
    }

    /// Write any BSON value in value position.
    pub fn write_bson(&mut self, value: &Bson) -> Result<()> {
        match value {
            Bson::Double(v) => self.write_double(*v),
            Bson::String(v) => self.write_string(v),
            Bson::Document(v) => {
                self.write_start_document()?;
                for (key, value) in v.iter() {
                    self.append(key, value)?;
                }
                self.write_end_document()
            }
            Bson::Array(v) => {
                self.write_start_array()?;
                for value in v {
                    self.write_bson(value)?;
                }
                self.write_end_array()
            }
            Bson::Binary(v) => self.write_binary(v),
            Bson::Undefined => self.write_undefined(),
            Bson::ObjectId(v) => self.write_object_id(v),
            Bson::Boolean(v) => self.write_boolean(*v),
            Bson::DateTime(v) => self.write_date_time(*v),
            Bson::Null => self.write_null(),
            Bson::RegularExpression(v) => self.write_regular_expression(v),
            Bson::DbPointer(v) => self.write_db_pointer(v),
            Bson::JavaScriptCode(v) => self.write_javascript(v),
            Bson::Symbol(v) => self.write_symbol(v),
            Bson::JavaScriptCodeWithScope(v) => {
                self.write_javascript_with_scope_start(&v.code)?;
                v.scope.encode(self)
            }
            Bson::Int32(v) => self.write_int32(*v),
            Bson::Timestamp(v) => self.write_timestamp(*v),
            Bson::Int64(v) => self.write_int64(*v),
            Bson::Decimal128(v) => self.write_decimal128(v),
            Bson::MinKey => self.write_min_key(),
            Bson::MaxKey => self.write_max_key(),
        }
    }

    /// Write a 64-bit floating point value.
    pub fn write_double(&mut self, value: f64) -> Result<()> {
        self.start_element(ElementType::Double)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a UTF-8 string value.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.start_element(ElementType::String)?;
        self.put_string(value);
        Ok(())
    }

    /// Write a binary value.
    pub fn write_binary(&mut self, value: &Binary) -> Result<()> {
        self.start_element(ElementType::Binary)?;
        self.buf
            .extend_from_slice(&(value.bytes.len() as i32).to_le_bytes());
        self.buf.push(u8::from(value.subtype));
        self.buf.extend_from_slice(&value.bytes);
        Ok(())
    }

    /// Write an undefined value.
    pub fn write_undefined(&mut self) -> Result<()> {
        self.start_element(ElementType::Undefined)
    }

    /// Write an ObjectId value.
    pub fn write_object_id(&mut self, value: &ObjectId) -> Result<()> {
        self.start_element(ElementType::ObjectId)?;
        self.buf.extend_from_slice(&value.bytes());
        Ok(())
    }

    /// Write a boolean value.
    pub fn write_boolean(&mut self, value: bool) -> Result<()> {
        self.start_element(ElementType::Boolean)?;
        self.buf.push(u8::from(value));
        Ok(())
    }

    /// Write a UTC datetime value.
    pub fn write_date_time(&mut self, value: DateTime) -> Result<()> {
        self.start_element(ElementType::DateTime)?;
        self.buf
            .extend_from_slice(&value.timestamp_millis().to_le_bytes());
        Ok(())
    }

    /// Write a null value.
    pub fn write_null(&mut self) -> Result<()> {
        self.start_element(ElementType::Null)
    }

    /// Write a regular expression value. Option characters are alphabetized.
    pub fn write_regular_expression(&mut self, value: &Regex) -> Result<()> {
        self.start_element(ElementType::RegularExpression)?;
        let mut options: Vec<char> = value.options.chars().collect();
        options.sort_unstable();
        let options: String = options.into_iter().collect();
        self.put_cstring(&value.pattern)?;
        self.put_cstring(&options)
    }

    /// Write a DBPointer value.
    pub fn write_db_pointer(&mut self, value: &DbPointer) -> Result<()> {
        self.start_element(ElementType::DbPointer)?;
        self.put_string(&value.namespace);
        self.buf.extend_from_slice(&value.id.bytes());
        Ok(())
    }

    /// Write a JavaScript code value.
    pub fn write_javascript(&mut self, code: &str) -> Result<()> {
        self.start_element(ElementType::JavaScriptCode)?;
        self.put_string(code);
        Ok(())
    }

    /// Write a symbol value.
    pub fn write_symbol(&mut self, value: &str) -> Result<()> {
        self.start_element(ElementType::Symbol)?;
        self.put_string(value);
        Ok(())
    }

    /// Begin a code-with-scope value. The caller must follow with exactly one document (the
    /// scope), whose completion also completes this value.
    pub fn write_javascript_with_scope_start(&mut self, code: &str) -> Result<()> {
        self.start_element(ElementType::JavaScriptCodeWithScope)?;
        let start = self.buf.len();
        self.buf.extend_from_slice(&[0; 4]);
        self.put_string(code);
        self.stack.push(Context {
            kind: ContextKind::JavaScriptWithScope,
            start,
            index: 0,
        });
        Ok(())
    }

    /// Write a 32-bit integer value.
    pub fn write_int32(&mut self, value: i32) -> Result<()> {
        self.start_element(ElementType::Int32)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a timestamp value: increment then time, each a little-endian u32.
    pub fn write_timestamp(&mut self, value: Timestamp) -> Result<()> {
        self.start_element(ElementType::Timestamp)?;
        self.buf.extend_from_slice(&value.increment.to_le_bytes());
        self.buf.extend_from_slice(&value.time.to_le_bytes());
        Ok(())
    }

    /// Write a 64-bit integer value.
    pub fn write_int64(&mut self, value: i64) -> Result<()> {
        self.start_element(ElementType::Int64)?;
        self.buf.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a 128-bit decimal value.
    pub fn write_decimal128(&mut self, value: &Decimal128) -> Result<()> {
        self.start_element(ElementType::Decimal128)?;
        self.buf.extend_from_slice(&value.bytes());
        Ok(())
    }

    /// Write a MinKey value.
    pub fn write_min_key(&mut self) -> Result<()> {
        self.start_element(ElementType::MinKey)
    }

    /// Write a MaxKey value.
    pub fn write_max_key(&mut self) -> Result<()> {
        self.start_element(ElementType::MaxKey)
    }

    /// Write the element prefix (type tag and name) for the next value, resolving the name from
    /// the pending name in a document context or the element index in an array context.
    fn start_element(&mut self, ty: ElementType) -> Result<()> {
        enum Prefix {
            Pending,
            Index(String),
        }
        let prefix = match self.stack.last_mut() {
            Some(ctx) if ctx.kind == ContextKind::Array => {
                let name = ctx.index.to_string();
                ctx.index += 1;
                Prefix::Index(name)
            }
            Some(ctx) if ctx.kind == ContextKind::Document => {
                if self.pending_name.is_none() {
                    return Err(
                        self.invalid_state("value write requires a name in a document context")
                    );
                }
                Prefix::Pending
            }
            _ => return Err(self.invalid_state("no open document or array to write a value into")),
        };
        self.buf.push(ty as u8);
        match prefix {
            Prefix::Pending => {
                let name = self.pending_name.take().unwrap();
                self.put_cstring(&name)
            }
            Prefix::Index(name) => self.put_cstring(&name),
        }
    }

    fn put_cstring(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(SerializationErrorKind::InvalidCString {
                name: s.to_string(),
            }
            .into());
        }
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    fn put_string(&mut self, s: &str) {
        self.buf
            .extend_from_slice(&(s.len() as i32 + 1).to_le_bytes());
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn patch_length(&mut self, start: usize, length: usize) {
        self.buf[start..start + 4].copy_from_slice(&(length as i32).to_le_bytes());
    }

    fn backpatch_and_check(&mut self, start: usize) -> Result<()> {
        let length = self.buf.len() - start;
        self.patch_length(start, length);
        self.check_size(start)
    }

    fn check_size(&self, start: usize) -> Result<()> {
        let size = self.buf.len() - start;
        let max = *self.max_document_size.last().unwrap();
        if size > max {
            return Err(SerializationErrorKind::DocumentTooLarge { size, max }.into());
        }
        Ok(())
    }

    fn invalid_state(&self, message: &str) -> crate::error::Error {
        SerializationErrorKind::InvalidState {
            message: message.to_string(),
        }
        .into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{bson::BinarySubtype, doc};

    #[test]
    fn boolean_document_bytes_are_exact() {
        let bytes = doc! { "b1": true, "b2": false }.to_vec().unwrap();
        #[rustfmt::skip]
        let expected: Vec<u8> = vec![
            15, 0, 0, 0,
            0x08, b'b', b'1', 0, 1,
            0x08, b'b', b'2', 0, 0,
            0,
        ];
        assert_eq!(bytes, expected);
    }

    #[test]
    fn integer_document_length_is_exact() {
        let bytes = doc! {
            "i1": -12i32,
            "i2": i32::MIN,
            "i3": i64::MAX,
            "i4": 0i64,
        }
        .to_vec()
        .unwrap();
        assert_eq!(bytes.len(), 45);
        assert_eq!(&bytes[..4], &[45, 0, 0, 0]);
        assert_eq!(bytes[4], 0x10);
        assert_eq!(&bytes[8..12], &(-12i32).to_le_bytes());
    }

    #[test]
    fn timestamp_encodes_increment_then_time() {
        let bytes = doc! {
            "t1": Timestamp { time: 123999401, increment: 44332 },
        }
        .to_vec()
        .unwrap();
        assert_eq!(bytes.len(), 17);
        assert_eq!(&bytes[8..12], &44332u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &123999401u32.to_le_bytes());
    }

    #[test]
    fn document_too_large_is_detected_on_completion() {
        let mut writer = DocumentWriter::with_limits(1024, DEFAULT_MAX_MESSAGE_SIZE);
        writer.write_start_document().unwrap();
        writer.write_name("data").unwrap();
        writer
            .write_binary(&Binary {
                subtype: BinarySubtype::Generic,
                bytes: vec![0; 1024],
            })
            .unwrap();
        let err = writer.write_end_document().unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            crate::error::ErrorKind::Serialization(ref e)
                if matches!(e.kind, SerializationErrorKind::DocumentTooLarge { .. })
        ));
    }

    #[test]
    fn pushed_limits_stack() {
        let mut writer = DocumentWriter::new();
        writer.write_start_document().unwrap();

        writer.push_max_document_size(10);
        writer.write_name("nested").unwrap();
        writer.write_start_document().unwrap();
        writer.write_name("s").unwrap();
        writer.write_string("ninebytes").unwrap();
        assert!(writer.write_end_document().is_err());

        // After popping, a larger nested value fits again.
        let mut writer = DocumentWriter::new();
        writer.write_start_document().unwrap();
        writer.push_max_document_size(10);
        writer.pop_max_document_size().unwrap();
        writer.write_name("data").unwrap();
        writer
            .write_binary(&Binary {
                subtype: BinarySubtype::Generic,
                bytes: vec![0; 256],
            })
            .unwrap();
        writer.write_end_document().unwrap();
    }

    #[test]
    fn mark_and_reset_rewinds_provisional_elements() {
        let d1 = doc! { "n": 1 };
        let d2 = doc! { "n": 2 };
        let d3 = doc! { "n": 3 };

        let mut writer = DocumentWriter::new();
        writer.write_start_document().unwrap();
        writer.write_name("batch").unwrap();
        writer.write_start_array().unwrap();
        d1.encode(&mut writer).unwrap();
        writer.mark().unwrap();
        d2.encode(&mut writer).unwrap();
        writer.reset().unwrap();
        d3.encode(&mut writer).unwrap();
        writer.write_end_array().unwrap();
        writer.write_end_document().unwrap();

        let decoded = Document::from_slice(&writer.into_vec().unwrap()).unwrap();
        let batch = decoded.get_array("batch").unwrap();
        assert_eq!(batch, &[Bson::Document(d1), Bson::Document(d3)]);
    }

    #[test]
    fn array_names_are_decimal_indices() {
        let bytes = doc! { "a": vec![Bson::Int32(7), Bson::Int32(8)] }
            .to_vec()
            .unwrap();
        let decoded = Document::from_slice(&bytes).unwrap();
        assert_eq!(
            decoded.get_array("a").unwrap(),
            &[Bson::Int32(7), Bson::Int32(8)]
        );
        // The raw array body uses "0" and "1" as element names.
        let inner = &bytes[4 + 1 + 2..];
        assert_eq!(inner[4 + 1], b'0');
    }

    #[test]
    fn pipe_copies_documents_without_reparsing() {
        let src = doc! { "x": 1, "y": "z" }.to_vec().unwrap();
        let mut writer = DocumentWriter::new();
        writer.write_start_document().unwrap();
        writer.write_name("piped").unwrap();
        writer.pipe_document(&src).unwrap();
        writer.write_end_document().unwrap();

        let decoded = Document::from_slice(&writer.into_vec().unwrap()).unwrap();
        assert_eq!(decoded.get_document("piped").unwrap().get_i32("x"), Some(1));
    }

    #[test]
    fn writes_outside_any_context_are_rejected() {
        let mut writer = DocumentWriter::new();
        assert!(writer.write_int32(1).is_err());
        writer.write_start_document().unwrap();
        // A value write without a pending name is invalid in a document context.
        assert!(writer.write_int32(1).is_err());
    }

    #[test]
    fn code_with_scope_round_trips() {
        let mut writer = DocumentWriter::new();
        writer.write_start_document().unwrap();
        writer.write_name("js").unwrap();
        writer.write_javascript_with_scope_start("function() {}").unwrap();
        doc! { "x": 1 }.encode(&mut writer).unwrap();
        writer.write_end_document().unwrap();

        let decoded = Document::from_slice(&writer.into_vec().unwrap()).unwrap();
        match decoded.get("js") {
            Some(Bson::JavaScriptCodeWithScope(v)) => {
                assert_eq!(v.code, "function() {}");
                assert_eq!(v.scope, doc! { "x": 1 });
            }
            other => panic!("expected code with scope, got {:?}", other),
        }
    }
}
