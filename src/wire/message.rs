use bitflags::bitflags;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util::{self, FrameReader},
};
use crate::{
    bson::{Bson, Document},
    error::{Error, Result},
};

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) sections: Vec<MessageSection>,
    pub(crate) checksum: Option<u32>,
}

impl Message {
    /// Creates a response `Message` carrying a single body document, correlated to the request it
    /// answers via `response_to`.
    pub(crate) fn with_response(body: Document, response_to: i32) -> Self {
        Self {
            request_id: util::next_request_id(),
            response_to,
            flags: MessageFlags::empty(),
            sections: vec![MessageSection::Document(body)],
            checksum: None,
        }
    }

    /// Parses the post-header payload of an OP_MSG frame.
    pub(crate) fn read_from_slice(header: &Header, body: &[u8]) -> Result<Self> {
        let mut reader = FrameReader::new(body);
        let flags = MessageFlags::from_bits_truncate(reader.read_u32()?);

        let mut sections = Vec::new();
        let mut checksum = None;
        while reader.remaining() > 0 {
            if reader.remaining() == 4 && flags.contains(MessageFlags::CHECKSUM_PRESENT) {
                checksum = Some(reader.read_u32()?);
                break;
            }
            sections.push(MessageSection::read(&mut reader)?);
        }

        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            sections,
            checksum,
        })
    }

    /// Collapses this message's sections into the single command document: exactly one kind-0
    /// body section, with every kind-1 document sequence folded in as an array under its
    /// identifier (replacing any same-named field already in the body).
    pub(crate) fn command_body(self) -> Result<Document> {
        let mut body: Option<Document> = None;
        let mut sequences = Vec::new();

        for section in self.sections {
            match section {
                MessageSection::Document(doc) => {
                    if body.is_some() {
                        return Err(Error::invalid_message(
                            "message contains more than one body section",
                        ));
                    }
                    body = Some(doc);
                }
                MessageSection::Sequence {
                    identifier,
                    documents,
                } => sequences.push((identifier, documents)),
            }
        }

        let mut body =
            body.ok_or_else(|| Error::invalid_message("message contains no body section"))?;
        for (identifier, documents) in sequences {
            body.insert(
                identifier,
                Bson::Array(documents.into_iter().map(Bson::Document).collect()),
            );
        }
        Ok(body)
    }

    /// Serializes the Message to bytes and writes them to `writer`.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut sections_bytes = Vec::new();
        for section in &self.sections {
            section.write(&mut sections_bytes)?;
        }

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections_bytes.len()
            + self.checksum.map(|_| std::mem::size_of::<u32>()).unwrap_or(0);

        let header = Header {
            length: total_length as i32,
            request_id: self.request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_all(&self.flags.bits().to_le_bytes()).await?;
        writer.write_all(&sections_bytes).await?;
        if let Some(checksum) = self.checksum {
            writer.write_all(&checksum.to_le_bytes()).await?;
        }
        writer.flush().await?;

        Ok(())
    }
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG as defined in the spec.
    #[derive(Clone, Copy, Debug, PartialEq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// Represents a section as defined by the OP_MSG spec. Kind 0 carries a single body document;
/// kind 1 carries a size-prefixed, identifier-tagged sequence of packed documents.
#[derive(Debug)]
pub(crate) enum MessageSection {
    Document(Document),
    Sequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

impl MessageSection {
    fn read(reader: &mut FrameReader<'_>) -> Result<Self> {
        let payload_type = reader.read_u8()?;

        match payload_type {
            0 => Ok(MessageSection::Document(reader.read_document()?)),
            1 => {
                let start = reader.bytes_read();
                let size = reader.read_i32()?;
                if size < 4 || (size as usize) > reader.remaining() + 4 {
                    return Err(Error::invalid_message(format!(
                        "invalid document sequence size {}",
                        size
                    )));
                }
                let identifier = reader.read_cstring()?;

                let end = start + size as usize;
                let mut documents = Vec::new();
                while reader.bytes_read() < end {
                    documents.push(reader.read_document()?);
                }
                if reader.bytes_read() != end {
                    return Err(Error::invalid_message(
                        "document sequence length does not match its contents",
                    ));
                }

                Ok(MessageSection::Sequence {
                    identifier,
                    documents,
                })
            }
            other => Err(Error::invalid_message(format!(
                "invalid message section type {}",
                other
            ))),
        }
    }

    /// Serializes the MessageSection and appends its bytes to `out`.
    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Document(doc) => {
                out.push(0);
                util::write_document(out, doc)?;
            }
            Self::Sequence {
                identifier,
                documents,
            } => {
                out.push(1);

                let mut payload = Vec::new();
                util::write_cstring(&mut payload, identifier);
                for doc in documents {
                    util::write_document(&mut payload, doc)?;
                }

                let size = (payload.len() + std::mem::size_of::<i32>()) as i32;
                out.extend_from_slice(&size.to_le_bytes());
                out.extend_from_slice(&payload);
            }
        }

        Ok(())
    }
}
