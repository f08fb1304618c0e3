use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util,
};
use crate::{
    bson::Document,
    error::{Error, Result},
};

/// A legacy OP_QUERY message, still used for the initial handshake against servers whose wire
/// version has not yet been negotiated.
#[derive(Clone, Debug)]
pub(crate) struct OpQuery {
    pub(crate) flags: i32,
    pub(crate) full_collection_name: String,
    pub(crate) number_to_skip: i32,
    pub(crate) number_to_return: i32,
    pub(crate) query: Document,
    pub(crate) return_fields_selector: Option<Document>,
}

impl OpQuery {
    /// An OP_QUERY running `command` against the `$cmd` collection of `db`.
    pub(crate) fn command(db: &str, command: Document) -> Self {
        Self {
            flags: 0,
            full_collection_name: format!("{}.$cmd", db),
            number_to_skip: 0,
            number_to_return: -1,
            query: command,
            return_fields_selector: None,
        }
    }

    /// Serialize and write the message under the given request id.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        request_id: i32,
    ) -> Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.flags.to_le_bytes());
        util::put_cstring(&mut body, &self.full_collection_name);
        body.extend_from_slice(&self.number_to_skip.to_le_bytes());
        body.extend_from_slice(&self.number_to_return.to_le_bytes());
        body.extend_from_slice(&self.query.to_vec()?);
        if let Some(ref selector) = self.return_fields_selector {
            body.extend_from_slice(&selector.to_vec()?);
        }

        let header = Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id,
            response_to: 0,
            op_code: OpCode::Query,
        };
        header.write_to(writer).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// A legacy OP_REPLY message. The cursor fields are part of the frame but are not consumed by
/// the command path, which uses only single-document replies.
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub(crate) struct OpReply {
    pub(crate) response_to: i32,
    pub(crate) response_flags: i32,
    pub(crate) cursor_id: i64,
    pub(crate) starting_from: i32,
    pub(crate) number_returned: i32,
    pub(crate) documents: Vec<Document>,
}

impl OpReply {
    /// Read and parse one OP_REPLY body off the stream; the header must already have been
    /// consumed.
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

    /// Parse an OP_REPLY body.
    pub(crate) fn parse(header: Header, body: &[u8]) -> Result<Self> {
        if header.op_code != OpCode::Reply {
            return Err(Error::invalid_response(format!(
                "expected OP_REPLY, got {:?}",
                header.op_code
            )));
        }
        if body.len() < 20 {
            return Err(Error::invalid_response("OP_REPLY body is too short"));
        }
        let response_flags = i32::from_le_bytes(body[0..4].try_into().unwrap());
        let cursor_id = i64::from_le_bytes(body[4..12].try_into().unwrap());
        let starting_from = i32::from_le_bytes(body[12..16].try_into().unwrap());
        let number_returned = i32::from_le_bytes(body[16..20].try_into().unwrap());

        let mut documents = Vec::new();
        let mut offset = 20;
        while offset < body.len() {
            let len_bytes = body
                .get(offset..offset + 4)
                .ok_or_else(|| Error::invalid_response("truncated OP_REPLY document"))?;
            let len = usize::try_from(i32::from_le_bytes(len_bytes.try_into().unwrap()))
                .map_err(|_| Error::invalid_response("negative OP_REPLY document length"))?;
            let bytes = body
                .get(offset..offset + len)
                .ok_or_else(|| Error::invalid_response("truncated OP_REPLY document"))?;
            documents.push(Document::from_slice(bytes)?);
            offset += len;
        }
        if documents.len() != number_returned as usize {
            return Err(Error::invalid_response(format!(
                "OP_REPLY advertised {} documents but carried {}",
                number_returned,
                documents.len()
            )));
        }

        Ok(Self {
            response_to: header.response_to,
            response_flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    /// The single command reply document.
    pub(crate) fn into_command_response(mut self) -> Result<Document> {
        match self.documents.pop() {
            Some(doc) if self.documents.is_empty() => Ok(doc),
            _ => Err(Error::invalid_response(
                "expected exactly one document in command reply",
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::doc;

    #[tokio::test]
    async fn op_query_frames_correctly() {
        let query = OpQuery::command("admin", doc! { "isMaster": 1, "helloOk": true });
        let mut framed = Vec::new();
        let request_id = crate::wire::next_request_id();
        query.write_to(&mut framed, request_id).await.unwrap();

        let mut reader = &framed[..];
        let header = Header::read_from(&mut reader).await.unwrap();
        assert_eq!(header.length as usize, framed.len());
        assert_eq!(header.op_code, OpCode::Query);
        assert_eq!(header.request_id, request_id);

        // flags, then the cstring collection name.
        let body = &framed[Header::LENGTH..];
        assert_eq!(&body[..4], &0i32.to_le_bytes());
        assert_eq!(&body[4..15], b"admin.$cmd\0");
    }

    #[tokio::test]
    async fn op_reply_parses() {
        let doc_bytes = doc! { "ok": 1.0, "maxWireVersion": 8 }.to_vec().unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&0i64.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&doc_bytes);

        let header = Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id: 2,
            response_to: 1,
            op_code: OpCode::Reply,
        };
        let mut framed = Vec::new();
        header.write_to(&mut framed).await.unwrap();
        framed.extend_from_slice(&body);

        let mut reader = &framed[..];
        let header = Header::read_from(&mut reader).await.unwrap();
        let reply = OpReply::read_body_from(header, &mut reader).await.unwrap();
        assert_eq!(reply.number_returned, 1);
        assert_eq!(reply.response_to, 1);
        let response = reply.into_command_response().unwrap();
        assert_eq!(response.get_f64("ok"), Some(1.0));
    }

    #[tokio::test]
    async fn document_count_mismatch_is_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&0i64.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&2i32.to_le_bytes());
        body.extend_from_slice(&doc! { "ok": 1.0 }.to_vec().unwrap());

        let header = Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id: 2,
            response_to: 1,
            op_code: OpCode::Reply,
        };
        assert!(OpReply::parse(header, &body).is_err());
    }
}
