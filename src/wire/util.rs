use std::sync::atomic::{AtomicI32, Ordering};

use crate::{
    bson::Document,
    error::{Error, Result},
};

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Obtains a new, unique request id for an outgoing message from a process-wide monotonically
/// increasing counter.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// A cursor over a received frame body. All multi-byte integers on the wire are little-endian.
pub(crate) struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn bytes_read(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::invalid_message(format!(
                "message truncated: wanted {} bytes, {} remain",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads a null-terminated UTF-8 string.
    pub(crate) fn read_cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::invalid_message("unterminated cstring in message"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|_| Error::invalid_message("cstring in message is not valid UTF-8"))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    /// Reads one length-prefixed document. The length prefix is part of the document encoding
    /// and is validated against the frame boundary before decoding.
    pub(crate) fn read_document(&mut self) -> Result<Document> {
        if self.remaining() < 4 {
            return Err(Error::invalid_message("message truncated inside a document"));
        }
        let len = i32::from_le_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        if len < 5 || len as usize > self.remaining() {
            return Err(Error::invalid_message(format!(
                "invalid document length {} in message",
                len
            )));
        }
        let bytes = self.take(len as usize)?;
        Ok(Document::from_reader(bytes)?)
    }
}

/// Serializes `string` to bytes and appends them to `out` with a null terminator.
pub(crate) fn write_cstring(out: &mut Vec<u8>, string: &str) {
    out.extend_from_slice(string.as_bytes());
    out.push(0);
}

/// Serializes a document and appends its bytes to `out`.
pub(crate) fn write_document(out: &mut Vec<u8>, doc: &Document) -> Result<()> {
    doc.to_writer(out)?;
    Ok(())
}
