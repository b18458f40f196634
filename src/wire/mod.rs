//! The wire-level codec: length-prefixed message framing for OP_MSG and the legacy OP_QUERY /
//! OP_REPLY envelopes, plus request/response correlation.

mod header;
mod message;
mod query;
pub(crate) mod util;


use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub(crate) use self::{
    header::{Header, OpCode},
    message::{Message, MessageFlags, MessageSection},
    query::{OpQuery, OpReply},
};

/// The maximum permitted size of a wire protocol message, matching the limit advertised by
/// `hello`.
pub(crate) const MAX_MESSAGE_SIZE_BYTES: i32 = 48_000_000;

/// A single decoded request envelope.
#[derive(Debug)]
pub(crate) enum Request {
    Message(Message),
    Query(OpQuery),
}

impl Request {
    /// Reads one request frame. Returns `Ok(None)` when the peer closed the connection before
    /// sending another header.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Option<Self>> {
        let header = match Header::read_from(reader).await {
            Ok(header) => header,
            Err(e) if e.is_connection_fatal() => return Ok(None),
            Err(e) => return Err(e),
        };

        if header.length < Header::LENGTH as i32 || header.length > MAX_MESSAGE_SIZE_BYTES {
            return Err(Error::invalid_message(format!(
                "invalid message length {}",
                header.length
            )));
        }

        let mut body = vec![0u8; (header.length - Header::LENGTH as i32) as usize];
        reader.read_exact(&mut body).await?;

        match header.op_code {
            OpCode::Message => Ok(Some(Request::Message(Message::read_from_slice(
                &header, &body,
            )?))),
            OpCode::Query => Ok(Some(Request::Query(OpQuery::read_from_slice(
                &header, &body,
            )?))),
            OpCode::Reply => Err(Error::invalid_message(
                "OP_REPLY is not valid as a request opcode",
            )),
        }
    }

    /// The request id assigned by the client, echoed back as `responseTo`.
    pub(crate) fn request_id(&self) -> i32 {
        match self {
            Request::Message(message) => message.request_id,
            Request::Query(query) => query.request_id,
        }
    }
}
