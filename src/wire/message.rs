use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util,
};
use crate::{
    bson::Document,
    error::{Error, Result, SerializationErrorKind},
};

bitflags! {
    /// The flag bits of an OP_MSG.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// A kind-1 section: a size-prefixed, identified sequence of documents used to stream write
/// batches (`documents`, `updates`, `deletes`) outside the command body.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Document>,
}

/// An OP_MSG wire protocol message: one kind-0 body section plus any number of kind-1 document
/// sequences.
#[derive(Clone, Debug)]
pub(crate) struct Message {
    /// Set for outbound messages; inbound messages carry the id in their header.
    pub(crate) request_id: Option<i32>,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) document_payload: Document,
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) checksum: Option<u32>,
}

impl Message {
    /// Create an outbound message carrying a single command body.
    pub(crate) fn new(body: Document, flags: MessageFlags) -> Self {
        Self {
            request_id: None,
            response_to: 0,
            flags,
            document_payload: body,
            document_sequences: Vec::new(),
            checksum: None,
        }
    }

    /// The command body (or reply body) of this message.
    pub(crate) fn into_body(self) -> Document {
        self.document_payload
    }

    /// Read and parse one OP_MSG off the stream. The header must already have been consumed.
    /// Reading fewer body bytes than the header advertises is an I/O error that is fatal for
    /// the connection.
    pub(crate) async fn read_body_from<R: AsyncRead + Unpin + Send>(
        header: Header,
        reader: &mut R,
    ) -> Result<Self> {
        let body_len = usize::try_from(header.length)
            .ok()
            .and_then(|length| length.checked_sub(Header::LENGTH))
            .ok_or_else(|| {
                Error::invalid_response(format!("impossible message length {}", header.length))
            })?;
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body).await?;
        Self::parse(header, &body)
    }

    /// Parse an OP_MSG body.
    pub(crate) fn parse(header: Header, body: &[u8]) -> Result<Self> {
        if header.op_code != OpCode::Message {
            return Err(Error::invalid_response(format!(
                "expected OP_MSG, got {:?}",
                header.op_code
            )));
        }
        if body.len() < 4 {
            return Err(truncated(header));
        }
        let flags = MessageFlags::from_bits_truncate(u32::from_le_bytes(
            body[..4].try_into().unwrap(),
        ));
        let mut offset = 4;

        let checksum_len = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            4
        } else {
            0
        };
        let sections_end = body.len() - checksum_len;

        let mut document_payload = None;
        let mut document_sequences = Vec::new();
        while offset < sections_end {
            match body.get(offset) {
                Some(0) => {
                    offset += 1;
                    let doc = take_document(body, &mut offset, header)?;
                    if document_payload.replace(doc).is_some() {
                        return Err(Error::invalid_response(
                            "OP_MSG contained multiple body sections",
                        ));
                    }
                }
                Some(1) => {
                    offset += 1;
                    document_sequences.push(take_sequence(body, &mut offset, header)?);
                }
                Some(other) => {
                    return Err(Error::invalid_response(format!(
                        "invalid OP_MSG section kind {}",
                        other
                    )))
                }
                None => return Err(truncated(header)),
            }
        }
        if offset != sections_end {
            return Err(truncated(header));
        }

        let checksum = if checksum_len == 4 {
            Some(u32::from_le_bytes(
                body[sections_end..].try_into().unwrap(),
            ))
        } else {
            None
        };

        Ok(Self {
            request_id: None,
            response_to: header.response_to,
            flags,
            document_payload: document_payload
                .ok_or_else(|| Error::invalid_response("OP_MSG contained no body section"))?,
            document_sequences,
            checksum,
        })
    }

    /// Serialize the message and write it to `writer`, enforcing `max_message_size` when given.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        max_message_size: Option<usize>,
    ) -> Result<i32> {
        let mut sections = Vec::new();

        sections.push(0u8);
        sections.extend_from_slice(&self.document_payload.to_vec()?);

        for sequence in &self.document_sequences {
            sections.push(1u8);
            let mut section = Vec::new();
            util::put_cstring(&mut section, &sequence.identifier);
            for doc in &sequence.documents {
                section.extend_from_slice(&doc.to_vec()?);
            }
            sections.extend_from_slice(&(section.len() as i32 + 4).to_le_bytes());
            sections.extend_from_slice(&section);
        }

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections.len()
            + self.checksum.map(|_| 4).unwrap_or(0);
        if let Some(max) = max_message_size {
            if total_length > max {
                return Err(SerializationErrorKind::MessageTooLarge {
                    size: total_length,
                    max,
                }
                .into());
            }
        }

        let request_id = self.request_id.unwrap_or_else(util::next_request_id);
        let header = Header {
            length: total_length as i32,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_all(&self.flags.bits().to_le_bytes()).await?;
        writer.write_all(&sections).await?;
        if let Some(checksum) = self.checksum {
            writer.write_all(&checksum.to_le_bytes()).await?;
        }
        writer.flush().await?;

        Ok(request_id)
    }
}

fn take_document(body: &[u8], offset: &mut usize, header: Header) -> Result<Document> {
    let len_bytes = body
        .get(*offset..*offset + 4)
        .ok_or_else(|| truncated(header))?;
    let len = i32::from_le_bytes(len_bytes.try_into().unwrap());
    let len = usize::try_from(len).map_err(|_| truncated(header))?;
    let bytes = body
        .get(*offset..*offset + len)
        .ok_or_else(|| truncated(header))?;
    *offset += len;
    Document::from_slice(bytes)
}

fn take_sequence(body: &[u8], offset: &mut usize, header: Header) -> Result<DocumentSequence> {
    let start = *offset;
    let len_bytes = body
        .get(*offset..*offset + 4)
        .ok_or_else(|| truncated(header))?;
    let size = i32::from_le_bytes(len_bytes.try_into().unwrap());
    let size = usize::try_from(size).map_err(|_| truncated(header))?;
    let end = start + size;
    if end > body.len() || size < 4 {
        return Err(truncated(header));
    }
    *offset += 4;

    let identifier = util::get_cstring(&body[..end], offset)
        .ok_or_else(|| Error::invalid_response("invalid document sequence identifier"))?;

    let mut documents = Vec::new();
    while *offset < end {
        documents.push(take_document(&body[..end], offset, header)?);
    }
    if *offset != end {
        return Err(truncated(header));
    }
    Ok(DocumentSequence {
        identifier,
        documents,
    })
}

fn truncated(header: Header) -> Error {
    Error::invalid_response(format!(
        "the server indicated a reply of {} bytes but its sections do not fit it",
        header.length
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::doc;

    async fn round_trip(message: Message) -> Message {
        let mut framed = Vec::new();
        message.write_to(&mut framed, None).await.unwrap();

        let mut reader = &framed[..];
        let header = Header::read_from(&mut reader).await.unwrap();
        assert_eq!(header.length as usize, framed.len());
        assert_eq!(header.op_code, OpCode::Message);
        Message::read_body_from(header, &mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn body_section_round_trips() {
        let body = doc! { "ping": 1, "$db": "admin" };
        let parsed = round_trip(Message::new(body.clone(), MessageFlags::empty())).await;
        assert_eq!(parsed.document_payload, body);
        assert!(parsed.document_sequences.is_empty());
    }

    #[tokio::test]
    async fn document_sequences_round_trip() {
        let mut message = Message::new(doc! { "insert": "coll" }, MessageFlags::empty());
        message.document_sequences.push(DocumentSequence {
            identifier: "documents".to_string(),
            documents: vec![doc! { "n": 1 }, doc! { "n": 2 }],
        });
        let parsed = round_trip(message).await;
        assert_eq!(parsed.document_sequences.len(), 1);
        assert_eq!(parsed.document_sequences[0].identifier, "documents");
        assert_eq!(parsed.document_sequences[0].documents.len(), 2);
    }

    #[tokio::test]
    async fn flag_bits_are_preserved() {
        let mut message = Message::new(doc! { "hello": 1 }, MessageFlags::EXHAUST_ALLOWED);
        message.flags |= MessageFlags::MORE_TO_COME;
        let parsed = round_trip(message).await;
        assert!(parsed.flags.contains(MessageFlags::EXHAUST_ALLOWED));
        assert!(parsed.flags.contains(MessageFlags::MORE_TO_COME));
        assert!(!parsed.flags.contains(MessageFlags::CHECKSUM_PRESENT));
    }

    #[tokio::test]
    async fn short_bodies_are_io_errors() {
        let message = Message::new(doc! { "ping": 1 }, MessageFlags::empty());
        let mut framed = Vec::new();
        message.write_to(&mut framed, None).await.unwrap();
        framed.truncate(framed.len() - 5);

        let mut reader = &framed[..];
        let header = Header::read_from(&mut reader).await.unwrap();
        let err = Message::read_body_from(header, &mut reader)
            .await
            .unwrap_err();
        assert!(err.is_network_error());
    }

    #[tokio::test]
    async fn unknown_section_kinds_are_rejected() {
        let message = Message::new(doc! { "ping": 1 }, MessageFlags::empty());
        let mut framed = Vec::new();
        message.write_to(&mut framed, None).await.unwrap();
        // Corrupt the section kind byte.
        framed[Header::LENGTH + 4] = 9;

        let mut reader = &framed[..];
        let header = Header::read_from(&mut reader).await.unwrap();
        assert!(Message::read_body_from(header, &mut reader).await.is_err());
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected_before_sending() {
        let message = Message::new(doc! { "a": "0123456789" }, MessageFlags::empty());
        let mut sink = Vec::new();
        let err = message.write_to(&mut sink, Some(24)).await.unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            crate::error::ErrorKind::Serialization(ref e)
                if matches!(e.kind, SerializationErrorKind::MessageTooLarge { .. })
        ));
        assert!(sink.is_empty());
    }
}
