use crate::{
    bson::{
        spec::{BinarySubtype, ElementType},
        Binary,
        Bson,
        DateTime,
        DbPointer,
        Decimal128,
        Document,
        JavaScriptCodeWithScope,
        ObjectId,
        Regex,
        Timestamp,
    },
    error::{DeserializationError, DeserializationErrorKind, Error, Result},
};

/// How decoded values of certain BSON types surface in the value model. The default mapping is
/// the identity per the BSON specification; deprecated types can be mapped forward to their
/// modern equivalents.
#[derive(Clone, Copy, Debug)]
#[non_exhaustive]
pub struct TypeMap {
    /// Surface UTC datetimes as raw `Int64` millisecond counts instead of [`DateTime`].
    pub datetime_as_int64: bool,
    /// Surface deprecated symbols as plain strings.
    pub symbol_as_string: bool,
    /// Surface deprecated undefined values as null.
    pub undefined_as_null: bool,
    /// Re-tag deprecated `0x02` binaries as generic, stripping the redundant inner length.
    pub binary_old_as_generic: bool,
}

impl Default for TypeMap {
    fn default() -> Self {
        Self {
            datetime_as_int64: false,
            symbol_as_string: false,
            undefined_as_null: false,
            binary_old_as_generic: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// Before the top-level document has been opened.
    Initial,
    /// Positioned before an element type tag (or the document terminator).
    Type,
    /// A type tag has been consumed; positioned before the element name.
    Name,
    /// A name has been consumed; positioned before the value payload.
    Value,
    /// The document terminator has been consumed; only `read_end_document`/`read_end_array` are
    /// admissible.
    End,
    /// The top-level document has been fully read.
    Done,
}

#[derive(Clone, Debug)]
struct Context {
    is_array: bool,
    end: usize,
}

#[derive(Clone, Debug)]
struct Mark {
    pos: usize,
    stack: Vec<Context>,
    state: State,
    current_type: Option<ElementType>,
}

/// A streaming BSON reader over a byte slice.
///
/// The reader yields, in order: `read_start_document`, then per element `read_bson_type` (which
/// returns [`ElementType::EndOfDocument`] at the terminator), `read_name` (or `skip_name`), and
/// a typed accessor (or `skip_value`), then `read_end_document`. All failures are deterministic
/// and carry the byte offset at which they were detected.
#[derive(Clone, Debug)]
pub struct DocumentReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    stack: Vec<Context>,
    state: State,
    current_type: Option<ElementType>,
    mark: Option<Mark>,
    type_map: TypeMap,
}

impl<'a> DocumentReader<'a> {
    /// Create a reader over the bytes of a document.
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        Self::with_type_map(bytes, TypeMap::default())
    }

    /// Create a reader with a non-default type mapping.
    pub fn with_type_map(bytes: &'a [u8], type_map: TypeMap) -> Result<Self> {
        Ok(Self {
            bytes,
            pos: 0,
            stack: Vec::new(),
            state: State::Initial,
            current_type: None,
            mark: None,
            type_map,
        })
    }

    /// The current byte offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Checkpoint the reader. A later [`reset`](Self::reset) rewinds to this point, permitting
    /// the most recent document to be re-read.
    pub fn mark(&mut self) {
        self.mark = Some(Mark {
            pos: self.pos,
            stack: self.stack.clone(),
            state: self.state,
            current_type: self.current_type,
        });
    }

    /// Rewind to the most recent [`mark`](Self::mark).
    pub fn reset(&mut self) -> Result<()> {
        match self.mark.take() {
            Some(mark) => {
                self.pos = mark.pos;
                self.stack = mark.stack;
                self.state = mark.state;
                self.current_type = mark.current_type;
                Ok(())
            }
            None => Err(self.error(DeserializationErrorKind::Malformed, "no mark to reset to")),
        }
    }

    /// Open the top-level document or an embedded document value.
    pub fn read_start_document(&mut self) -> Result<()> {
        match self.state {
            State::Initial => {}
            State::Value if self.current_type == Some(ElementType::EmbeddedDocument) => {}
            _ => {
                return Err(self.error(
                    DeserializationErrorKind::UnexpectedType,
                    "reader is not positioned at a document",
                ))
            }
        }
        self.open(false)
    }

    /// Close the innermost open document.
    pub fn read_end_document(&mut self) -> Result<()> {
        self.close(false)
    }

    /// Open an array value.
    pub fn read_start_array(&mut self) -> Result<()> {
        self.expect_value(ElementType::Array)?;
        self.open(true)
    }

    /// Close the innermost open array.
    pub fn read_end_array(&mut self) -> Result<()> {
        self.close(true)
    }

    /// Read the type tag of the next element. Returns [`ElementType::EndOfDocument`] when the
    /// document terminator is reached.
    pub fn read_bson_type(&mut self) -> Result<ElementType> {
        if self.state != State::Type {
            return Err(self.error(
                DeserializationErrorKind::Malformed,
                "reader is not positioned at an element type",
            ));
        }
        let tag = self.read_u8()?;
        if tag == 0 {
            self.state = State::End;
            self.current_type = None;
            return Ok(ElementType::EndOfDocument);
        }
        let ty = ElementType::from_u8(tag).ok_or_else(|| {
            self.error(
                DeserializationErrorKind::Malformed,
                format!("invalid element type tag 0x{:02x}", tag),
            )
        })?;
        self.current_type = Some(ty);
        self.state = State::Name;
        Ok(ty)
    }

    /// Read the current element's name.
    pub fn read_name(&mut self) -> Result<&'a str> {
        if self.state != State::Name {
            return Err(self.error(
                DeserializationErrorKind::Malformed,
                "reader is not positioned at an element name",
            ));
        }
        let name = self.read_cstring()?;
        self.state = State::Value;
        Ok(name)
    }

    /// Skip the current element's name.
    pub fn skip_name(&mut self) -> Result<()> {
        self.read_name().map(drop)
    }

    /// Skip the current element's value.
    pub fn skip_value(&mut self) -> Result<()> {
        let ty = self.value_type()?;
        match ty {
            ElementType::Double | ElementType::DateTime | ElementType::Int64 => {
                self.advance(8)?;
            }
            ElementType::Timestamp => {
                self.advance(8)?;
            }
            ElementType::String | ElementType::JavaScriptCode | ElementType::Symbol => {
                let len = self.peek_i32()?;
                self.advance(4 + usize_len(len, self)?)?;
            }
            ElementType::EmbeddedDocument
            | ElementType::Array
            | ElementType::JavaScriptCodeWithScope => {
                let len = self.peek_i32()?;
                self.advance(usize_len(len, self)?)?;
            }
            ElementType::Binary => {
                let len = self.peek_i32()?;
                self.advance(4 + 1 + usize_len(len, self)?)?;
            }
            ElementType::Undefined
            | ElementType::Null
            | ElementType::MinKey
            | ElementType::MaxKey => {}
            ElementType::ObjectId => self.advance(12)?,
            ElementType::Boolean => self.advance(1)?,
            ElementType::RegularExpression => {
                self.read_cstring()?;
                self.read_cstring()?;
            }
            ElementType::DbPointer => {
                let len = self.peek_i32()?;
                self.advance(4 + usize_len(len, self)? + 12)?;
            }
            ElementType::Int32 => self.advance(4)?,
            ElementType::Decimal128 => self.advance(16)?,
            ElementType::EndOfDocument => {
                return Err(self.error(
                    DeserializationErrorKind::Malformed,
                    "cannot skip the document terminator",
                ))
            }
        }
        self.state = State::Type;
        Ok(())
    }

    /// Read a double, coercing losslessly from integer types.
    pub fn read_double(&mut self) -> Result<f64> {
        let ty = self.value_type()?;
        let value = match ty {
            ElementType::Double => f64::from_le_bytes(self.take(8)?.try_into().unwrap()),
            ElementType::Int32 => {
                f64::from(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
            }
            ElementType::Int64 => {
                let i = i64::from_le_bytes(self.take(8)?.try_into().unwrap());
                let f = i as f64;
                if f as i64 != i {
                    return Err(self.error(
                        DeserializationErrorKind::NumericOverflow,
                        format!("int64 value {} does not round-trip through f64", i),
                    ));
                }
                f
            }
            ElementType::Null => return Err(self.null_for_primitive()),
            _ => return Err(self.unexpected_type("a numeric value", ty)),
        };
        self.state = State::Type;
        Ok(value)
    }

    /// Read a 32-bit integer, coercing losslessly from wider numeric types.
    pub fn read_int32(&mut self) -> Result<i32> {
        let ty = self.value_type()?;
        let value = match ty {
            ElementType::Int32 => i32::from_le_bytes(self.take(4)?.try_into().unwrap()),
            ElementType::Int64 => {
                let i = i64::from_le_bytes(self.take(8)?.try_into().unwrap());
                i32::try_from(i).map_err(|_| {
                    self.error(
                        DeserializationErrorKind::NumericOverflow,
                        format!("int64 value {} does not fit in an i32", i),
                    )
                })?
            }
            ElementType::Double => {
                let f = f64::from_le_bytes(self.take(8)?.try_into().unwrap());
                let i = f as i32;
                if f64::from(i) != f {
                    return Err(self.error(
                        DeserializationErrorKind::NumericOverflow,
                        format!("double value {} does not round-trip through i32", f),
                    ));
                }
                i
            }
            ElementType::Null => return Err(self.null_for_primitive()),
            _ => return Err(self.unexpected_type("a numeric value", ty)),
        };
        self.state = State::Type;
        Ok(value)
    }

    /// Read a 64-bit integer, coercing losslessly from other numeric types.
    pub fn read_int64(&mut self) -> Result<i64> {
        let ty = self.value_type()?;
        let value = match ty {
            ElementType::Int64 => i64::from_le_bytes(self.take(8)?.try_into().unwrap()),
            ElementType::Int32 => {
                i64::from(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
            }
            ElementType::Double => {
                let f = f64::from_le_bytes(self.take(8)?.try_into().unwrap());
                let i = f as i64;
                if i as f64 != f {
                    return Err(self.error(
                        DeserializationErrorKind::NumericOverflow,
                        format!("double value {} does not round-trip through i64", f),
                    ));
                }
                i
            }
            ElementType::Null => return Err(self.null_for_primitive()),
            _ => return Err(self.unexpected_type("a numeric value", ty)),
        };
        self.state = State::Type;
        Ok(value)
    }

    /// Read a string value.
    pub fn read_string(&mut self) -> Result<&'a str> {
        self.expect_value(ElementType::String)?;
        let s = self.read_length_prefixed_string()?;
        self.state = State::Type;
        Ok(s)
    }

    /// Read a boolean value.
    pub fn read_boolean(&mut self) -> Result<bool> {
        let ty = self.value_type()?;
        let value = match ty {
            ElementType::Boolean => match self.read_u8()? {
                0 => false,
                1 => true,
                other => {
                    return Err(self.error(
                        DeserializationErrorKind::Malformed,
                        format!("invalid boolean byte 0x{:02x}", other),
                    ))
                }
            },
            ElementType::Null => return Err(self.null_for_primitive()),
            _ => return Err(self.unexpected_type("a boolean", ty)),
        };
        self.state = State::Type;
        Ok(value)
    }

    /// Read a binary value.
    pub fn read_binary(&mut self) -> Result<Binary> {
        self.expect_value(ElementType::Binary)?;
        let len = usize_len(self.read_i32()?, self)?;
        let subtype = BinarySubtype::from(self.read_u8()?);
        let bytes = self.take(len)?.to_vec();
        self.state = State::Type;

        if subtype == BinarySubtype::BinaryOld && self.type_map.binary_old_as_generic {
            if bytes.len() >= 4
                && i32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize == bytes.len() - 4
            {
                return Ok(Binary {
                    subtype: BinarySubtype::Generic,
                    bytes: bytes[4..].to_vec(),
                });
            }
        }
        Ok(Binary { subtype, bytes })
    }

    /// Read an ObjectId value.
    pub fn read_object_id(&mut self) -> Result<ObjectId> {
        self.expect_value(ElementType::ObjectId)?;
        let bytes: [u8; 12] = self.take(12)?.try_into().unwrap();
        self.state = State::Type;
        Ok(ObjectId::from_bytes(bytes))
    }

    /// Read a UTC datetime value.
    pub fn read_date_time(&mut self) -> Result<DateTime> {
        self.expect_value(ElementType::DateTime)?;
        let millis = i64::from_le_bytes(self.take(8)?.try_into().unwrap());
        self.state = State::Type;
        Ok(DateTime::from_millis(millis))
    }

    /// Read a null value.
    pub fn read_null(&mut self) -> Result<()> {
        self.expect_value(ElementType::Null)?;
        self.state = State::Type;
        Ok(())
    }

    /// Read an undefined value.
    pub fn read_undefined(&mut self) -> Result<()> {
        self.expect_value(ElementType::Undefined)?;
        self.state = State::Type;
        Ok(())
    }

    /// Read a regular expression value.
    pub fn read_regular_expression(&mut self) -> Result<Regex> {
        self.expect_value(ElementType::RegularExpression)?;
        let pattern = self.read_cstring()?.to_string();
        let options = self.read_cstring()?.to_string();
        self.state = State::Type;
        Ok(Regex { pattern, options })
    }

    /// Read a DBPointer value.
    pub fn read_db_pointer(&mut self) -> Result<DbPointer> {
        self.expect_value(ElementType::DbPointer)?;
        let namespace = self.read_length_prefixed_string()?.to_string();
        let bytes: [u8; 12] = self.take(12)?.try_into().unwrap();
        self.state = State::Type;
        Ok(DbPointer {
            namespace,
            id: ObjectId::from_bytes(bytes),
        })
    }

    /// Read a JavaScript code value.
    pub fn read_javascript(&mut self) -> Result<&'a str> {
        self.expect_value(ElementType::JavaScriptCode)?;
        let code = self.read_length_prefixed_string()?;
        self.state = State::Type;
        Ok(code)
    }

    /// Read a symbol value.
    pub fn read_symbol(&mut self) -> Result<&'a str> {
        self.expect_value(ElementType::Symbol)?;
        let s = self.read_length_prefixed_string()?;
        self.state = State::Type;
        Ok(s)
    }

    /// Read a complete code-with-scope value.
    pub fn read_javascript_with_scope(&mut self) -> Result<JavaScriptCodeWithScope> {
        self.expect_value(ElementType::JavaScriptCodeWithScope)?;
        let total_start = self.pos;
        let total = usize_len(self.read_i32()?, self)?;
        let code = self.read_length_prefixed_string()?.to_string();

        self.stack.push(Context {
            is_array: false,
            end: self.pos + usize_len(self.peek_i32()?, self)?,
        });
        self.pos += 4;
        self.state = State::Type;
        let scope = self.read_fields()?;
        self.read_end_scope_document()?;

        if self.pos - total_start != total {
            return Err(self.error(
                DeserializationErrorKind::Malformed,
                "code-with-scope length does not match its contents",
            ));
        }
        self.state = State::Type;
        Ok(JavaScriptCodeWithScope { code, scope })
    }

    /// Read a timestamp value.
    pub fn read_timestamp(&mut self) -> Result<Timestamp> {
        self.expect_value(ElementType::Timestamp)?;
        let increment = u32::from_le_bytes(self.take(4)?.try_into().unwrap());
        let time = u32::from_le_bytes(self.take(4)?.try_into().unwrap());
        self.state = State::Type;
        Ok(Timestamp { time, increment })
    }

    /// Read a 128-bit decimal value.
    pub fn read_decimal128(&mut self) -> Result<Decimal128> {
        self.expect_value(ElementType::Decimal128)?;
        let bytes: [u8; 16] = self.take(16)?.try_into().unwrap();
        self.state = State::Type;
        Ok(Decimal128::from_bytes(bytes))
    }

    /// Read a MinKey value.
    pub fn read_min_key(&mut self) -> Result<()> {
        self.expect_value(ElementType::MinKey)?;
        self.state = State::Type;
        Ok(())
    }

    /// Read a MaxKey value.
    pub fn read_max_key(&mut self) -> Result<()> {
        self.expect_value(ElementType::MaxKey)?;
        self.state = State::Type;
        Ok(())
    }

    /// Decode the current value into the value model, applying the reader's type map.
    pub fn read_value(&mut self) -> Result<Bson> {
        let ty = self.value_type()?;
        Ok(match ty {
            ElementType::Double => Bson::Double(self.read_double()?),
            ElementType::String => Bson::String(self.read_string()?.to_string()),
            ElementType::EmbeddedDocument => {
                self.read_start_document()?;
                let doc = self.read_fields()?;
                self.read_end_document()?;
                Bson::Document(doc)
            }
            ElementType::Array => {
                self.read_start_array()?;
                let mut items = Vec::new();
                loop {
                    if self.read_bson_type()? == ElementType::EndOfDocument {
                        break;
                    }
                    self.skip_name()?;
                    items.push(self.read_value()?);
                }
                self.read_end_array()?;
                Bson::Array(items)
            }
            ElementType::Binary => Bson::Binary(self.read_binary()?),
            ElementType::Undefined => {
                self.read_undefined()?;
                if self.type_map.undefined_as_null {
                    Bson::Null
                } else {
                    Bson::Undefined
                }
            }
            ElementType::ObjectId => Bson::ObjectId(self.read_object_id()?),
            ElementType::Boolean => Bson::Boolean(self.read_boolean()?),
            ElementType::DateTime => {
                let dt = self.read_date_time()?;
                if self.type_map.datetime_as_int64 {
                    Bson::Int64(dt.timestamp_millis())
                } else {
                    Bson::DateTime(dt)
                }
            }
            ElementType::Null => {
                self.read_null()?;
                Bson::Null
            }
            ElementType::RegularExpression => {
                Bson::RegularExpression(self.read_regular_expression()?)
            }
            ElementType::DbPointer => Bson::DbPointer(self.read_db_pointer()?),
            ElementType::JavaScriptCode => {
                Bson::JavaScriptCode(self.read_javascript()?.to_string())
            }
            ElementType::Symbol => {
                let s = self.read_symbol()?.to_string();
                if self.type_map.symbol_as_string {
                    Bson::String(s)
                } else {
                    Bson::Symbol(s)
                }
            }
            ElementType::JavaScriptCodeWithScope => {
                Bson::JavaScriptCodeWithScope(self.read_javascript_with_scope()?)
            }
            ElementType::Int32 => Bson::Int32(self.read_int32()?),
            ElementType::Timestamp => Bson::Timestamp(self.read_timestamp()?),
            ElementType::Int64 => Bson::Int64(self.read_int64()?),
            ElementType::Decimal128 => Bson::Decimal128(self.read_decimal128()?),
            ElementType::MinKey => {
                self.read_min_key()?;
                Bson::MinKey
            }
            ElementType::MaxKey => {
                self.read_max_key()?;
                Bson::MaxKey
            }
            ElementType::EndOfDocument => {
                return Err(self.error(
                    DeserializationErrorKind::Malformed,
                    "no value to read at the document terminator",
                ))
            }
        })
    }

    /// Decode a whole document, either the top-level one or the current document value.
    pub fn read_document(&mut self) -> Result<Document> {
        self.read_start_document()?;
        let doc = self.read_fields()?;
        self.read_end_document()?;
        Ok(doc)
    }

    /// Fail unless the reader has consumed its input exactly.
    pub fn expect_exhausted(&self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(self.error(
                DeserializationErrorKind::Malformed,
                format!("{} trailing bytes after document", self.bytes.len() - self.pos),
            ));
        }
        Ok(())
    }

    fn read_fields(&mut self) -> Result<Document> {
        let mut doc = Document::new();
        loop {
            if self.read_bson_type()? == ElementType::EndOfDocument {
                return Ok(doc);
            }
            let name = self.read_name()?.to_string();
            let value = self.read_value()?;
            doc.insert(name, value);
        }
    }

    fn open(&mut self, is_array: bool) -> Result<()> {
        let start = self.pos;
        let len = usize_len(self.read_i32()?, self)?;
        let end = start + len;
        if len < 5 || end > self.bytes.len() || !self.within_parent(end) {
            return Err(self.error(
                DeserializationErrorKind::Malformed,
                format!("invalid document length {}", len),
            ));
        }
        self.stack.push(Context { is_array, end });
        self.state = State::Type;
        Ok(())
    }

    fn close(&mut self, is_array: bool) -> Result<()> {
        if self.state != State::End {
            return Err(self.error(
                DeserializationErrorKind::Malformed,
                "document terminator has not been read",
            ));
        }
        if !matches!(self.stack.last(), Some(ctx) if ctx.is_array == is_array) {
            return Err(self.error(
                DeserializationErrorKind::Malformed,
                "mismatched document/array end",
            ));
        }
        let ctx = self.stack.pop().unwrap();
        if self.pos != ctx.end {
            return Err(self.error(
                DeserializationErrorKind::Malformed,
                "document length does not match its contents",
            ));
        }
        self.state = if self.stack.is_empty() {
            State::Done
        } else {
            State::Type
        };
        Ok(())
    }

    fn read_end_scope_document(&mut self) -> Result<()> {
        // The scope context was pushed manually by read_javascript_with_scope.
        self.close(false)
    }

    fn value_type(&self) -> Result<ElementType> {
        if self.state != State::Value {
            return Err(self.error(
                DeserializationErrorKind::Malformed,
                "reader is not positioned at a value",
            ));
        }
        Ok(self.current_type.unwrap())
    }

    fn expect_value(&self, expected: ElementType) -> Result<()> {
        let actual = self.value_type()?;
        if actual != expected {
            return Err(self.unexpected_type(
                match expected {
                    ElementType::String => "a string",
                    ElementType::Binary => "a binary value",
                    ElementType::ObjectId => "an ObjectId",
                    ElementType::DateTime => "a datetime",
                    ElementType::Array => "an array",
                    ElementType::EmbeddedDocument => "a document",
                    _ => "a value of the requested type",
                },
                actual,
            ));
        }
        Ok(())
    }

    fn within_parent(&self, end: usize) -> bool {
        match self.stack.last() {
            Some(parent) => end <= parent.end,
            None => true,
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn peek_i32(&self) -> Result<i32> {
        if self.pos + 4 > self.bytes.len() {
            return Err(self.eof());
        }
        Ok(i32::from_le_bytes(
            self.bytes[self.pos..self.pos + 4].try_into().unwrap(),
        ))
    }

    fn read_cstring(&mut self) -> Result<&'a str> {
        let start = self.pos;
        let nul = self.bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.eof())?;
        let raw = &self.bytes[start..start + nul];
        self.pos = start + nul + 1;
        std::str::from_utf8(raw).map_err(|_| {
            self.error(
                DeserializationErrorKind::Malformed,
                "cstring is not valid UTF-8",
            )
        })
    }

    fn read_length_prefixed_string(&mut self) -> Result<&'a str> {
        let len = usize_len(self.read_i32()?, self)?;
        if len == 0 {
            return Err(self.error(
                DeserializationErrorKind::Malformed,
                "string length must include the NUL terminator",
            ));
        }
        let raw = self.take(len)?;
        if raw[len - 1] != 0 {
            return Err(self.error(
                DeserializationErrorKind::Malformed,
                "string is missing its NUL terminator",
            ));
        }
        std::str::from_utf8(&raw[..len - 1]).map_err(|_| {
            self.error(
                DeserializationErrorKind::Malformed,
                "string is not valid UTF-8",
            )
        })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(self.eof());
        }
        if let Some(ctx) = self.stack.last() {
            if self.pos + n > ctx.end {
                return Err(self.error(
                    DeserializationErrorKind::Malformed,
                    "value extends past its enclosing document",
                ));
            }
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn advance(&mut self, n: usize) -> Result<()> {
        self.take(n).map(drop)
    }

    fn eof(&self) -> Error {
        self.error(
            DeserializationErrorKind::UnexpectedEof,
            "unexpected end of input",
        )
    }

    fn null_for_primitive(&self) -> Error {
        self.error(
            DeserializationErrorKind::NullForPrimitive,
            "null value read for a non-nullable target",
        )
    }

    fn unexpected_type(&self, expected: &str, actual: ElementType) -> Error {
        self.error(
            DeserializationErrorKind::UnexpectedType,
            format!("expected {}, found {:?}", expected, actual),
        )
    }

    fn error(&self, kind: DeserializationErrorKind, message: impl Into<String>) -> Error {
        DeserializationError {
            kind,
            message: message.into(),
            offset: Some(self.pos),
        }
        .into()
    }
}

fn usize_len(len: i32, reader: &DocumentReader<'_>) -> Result<usize> {
    usize::try_from(len).map_err(|_| {
        reader.error(
            DeserializationErrorKind::Malformed,
            format!("negative length {}", len),
        )
    })
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{bson::DocumentWriter, doc};

    fn round_trip(doc: Document) {
        let bytes = doc.to_vec().unwrap();
        assert_eq!(Document::from_slice(&bytes).unwrap(), doc);
    }

    #[test]
    fn every_type_round_trips() {
        round_trip(doc! {
            "double": 1.5f64,
            "string": "s",
            "doc": { "inner": 1 },
            "array": vec![Bson::Int32(1), Bson::String("two".to_string())],
            "binary": Binary { subtype: BinarySubtype::Generic, bytes: vec![1, 2, 3] },
            "undefined": Bson::Undefined,
            "oid": ObjectId::new(),
            "bool": true,
            "datetime": DateTime::from_millis(1_600_000_000_000),
            "null": null,
            "regex": Regex { pattern: "^a.*b$".to_string(), options: "i".to_string() },
            "dbpointer": Bson::DbPointer(DbPointer {
                namespace: "db.coll".to_string(),
                id: ObjectId::new(),
            }),
            "code": Bson::JavaScriptCode("function() {}".to_string()),
            "symbol": Bson::Symbol("sym".to_string()),
            "code_w_scope": Bson::JavaScriptCodeWithScope(JavaScriptCodeWithScope {
                code: "f()".to_string(),
                scope: doc! { "x": 1 },
            }),
            "int32": i32::MIN,
            "timestamp": Timestamp { time: 1, increment: 2 },
            "int64": i64::MAX,
            "decimal128": Decimal128::from_bytes([7; 16]),
            "minkey": Bson::MinKey,
            "maxkey": Bson::MaxKey,
        });
    }

    #[test]
    fn errors_carry_byte_offsets() {
        let mut bytes = doc! { "a": 1 }.to_vec().unwrap();
        // Corrupt the element type tag.
        bytes[4] = 0x55;
        let err = Document::from_slice(&bytes).unwrap_err();
        match err.kind.as_ref() {
            crate::error::ErrorKind::Deserialization(e) => {
                assert_eq!(e.offset, Some(5));
                assert_eq!(e.kind, DeserializationErrorKind::Malformed);
            }
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[test]
    fn truncated_documents_are_rejected() {
        let bytes = doc! { "a": "long enough" }.to_vec().unwrap();
        assert!(Document::from_slice(&bytes[..bytes.len() - 3]).is_err());
        assert!(Document::from_slice(&[4, 0, 0, 0]).is_err());
    }

    #[test]
    fn numeric_coercion_round_trips_only() {
        let bytes = doc! { "small": 42i64, "big": i64::MAX, "frac": 1.5f64 }
            .to_vec()
            .unwrap();
        let mut reader = DocumentReader::new(&bytes).unwrap();
        reader.read_start_document().unwrap();

        assert_eq!(reader.read_bson_type().unwrap(), ElementType::Int64);
        reader.skip_name().unwrap();
        assert_eq!(reader.read_int32().unwrap(), 42);

        assert_eq!(reader.read_bson_type().unwrap(), ElementType::Int64);
        reader.skip_name().unwrap();
        let err = reader.read_int32().unwrap_err();
        match err.kind.as_ref() {
            crate::error::ErrorKind::Deserialization(e) => {
                assert_eq!(e.kind, DeserializationErrorKind::NumericOverflow)
            }
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[test]
    fn null_for_primitive_is_reported() {
        let bytes = doc! { "n": null }.to_vec().unwrap();
        let mut reader = DocumentReader::new(&bytes).unwrap();
        reader.read_start_document().unwrap();
        reader.read_bson_type().unwrap();
        reader.skip_name().unwrap();
        let err = reader.read_int64().unwrap_err();
        match err.kind.as_ref() {
            crate::error::ErrorKind::Deserialization(e) => {
                assert_eq!(e.kind, DeserializationErrorKind::NullForPrimitive)
            }
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[test]
    fn skip_value_passes_over_unknown_fields() {
        let bytes = doc! {
            "skip1": { "deeply": { "nested": vec![Bson::Int32(1)] } },
            "keep": 7,
            "skip2": Binary { subtype: BinarySubtype::Uuid, bytes: vec![0; 16] },
        }
        .to_vec()
        .unwrap();
        let mut reader = DocumentReader::new(&bytes).unwrap();
        reader.read_start_document().unwrap();
        let mut kept = None;
        loop {
            if reader.read_bson_type().unwrap() == ElementType::EndOfDocument {
                break;
            }
            let name = reader.read_name().unwrap();
            if name == "keep" {
                kept = Some(reader.read_int32().unwrap());
            } else {
                reader.skip_value().unwrap();
            }
        }
        reader.read_end_document().unwrap();
        assert_eq!(kept, Some(7));
    }

    #[test]
    fn mark_and_reset_reread_a_document() {
        let bytes = doc! { "a": 1, "b": 2 }.to_vec().unwrap();
        let mut reader = DocumentReader::new(&bytes).unwrap();
        reader.mark();
        let first = reader.read_document().unwrap();
        reader.reset().unwrap();
        let second = reader.read_document().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn type_map_forwards_deprecated_types() {
        let mut writer = DocumentWriter::new();
        writer.write_start_document().unwrap();
        writer.write_name("sym").unwrap();
        writer.write_symbol("legacy").unwrap();
        writer.write_name("undef").unwrap();
        writer.write_undefined().unwrap();
        writer.write_end_document().unwrap();
        let bytes = writer.into_vec().unwrap();

        let map = TypeMap {
            symbol_as_string: true,
            undefined_as_null: true,
            ..TypeMap::default()
        };
        let mut reader = DocumentReader::with_type_map(&bytes, map).unwrap();
        let doc = reader.read_document().unwrap();
        assert_eq!(doc.get("sym"), Some(&Bson::String("legacy".to_string())));
        assert_eq!(doc.get("undef"), Some(&Bson::Null));
    }
}
