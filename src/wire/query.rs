use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util::{self, FrameReader},
};
use crate::{bson::Document, error::Result};

/// A legacy OP_QUERY request. Only the `<db>.$cmd` command form is served; the body document is
/// the command itself.
#[derive(Debug)]
pub(crate) struct OpQuery {
    pub(crate) request_id: i32,
    #[allow(dead_code)]
    pub(crate) flags: i32,
    pub(crate) namespace: String,
    #[allow(dead_code)]
    pub(crate) number_to_skip: i32,
    #[allow(dead_code)]
    pub(crate) number_to_return: i32,
    pub(crate) body: Document,
}

impl OpQuery {
    /// Parses the post-header payload of an OP_QUERY frame.
    pub(crate) fn read_from_slice(header: &Header, body: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(body);
        let flags = reader.read_i32()?;
        let namespace = reader.read_cstring()?;
        let number_to_skip = reader.read_i32()?;
        let number_to_return = reader.read_i32()?;
        let query = reader.read_document()?;

        Ok(Self {
            request_id: header.request_id,
            flags,
            namespace,
            number_to_skip,
            number_to_return,
            body: query,
        })
    }

    /// The database named by the query namespace (`db.$cmd` for commands).
    pub(crate) fn namespace_db(&self) -> Option<&str> {
        self.namespace.split('.').next().filter(|db| !db.is_empty())
    }
}

/// A legacy OP_REPLY response. Command responses over the legacy envelope always carry a single
/// command-response document and a zero cursor id.
#[derive(Debug)]
pub(crate) struct OpReply {
    pub(crate) response_to: i32,
    pub(crate) documents: Vec<Document>,
}

impl OpReply {
    pub(crate) fn with_response(body: Document, response_to: i32) -> Self {
        Self {
            response_to,
            documents: vec![body],
        }
    }

    /// Serializes the reply to bytes and writes them to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0i32.to_le_bytes()); // responseFlags
        payload.extend_from_slice(&0i64.to_le_bytes()); // cursorID
        payload.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
        payload.extend_from_slice(&(self.documents.len() as i32).to_le_bytes());
        for doc in &self.documents {
            util::write_document(&mut payload, doc)?;
        }

        let header = Header {
            length: (Header::LENGTH + payload.len()) as i32,
            request_id: util::next_request_id(),
            response_to: self.response_to,
            op_code: OpCode::Reply,
        };

        header.write_to(writer).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;

        Ok(())
    }
}
