//! Chunk framing: fixed-width text header + raw payload, and a stream decoder that separates
//! chunk frames from control messages on one connection.
//!
//! Header layout (63 bytes):
//! `%12s\r\n%10d\t%5d\t%10d\t%10d\t%8s\r\n` = tag, file id, payload length, total chunks,
//! chunk index, checksum. The payload follows immediately; its length comes from the header.

use crate::integrity;

/// Command tag of a chunk frame.
pub const TRANSFER_TAG: &str = "fileTransfer";

/// Width of the encoded header in bytes.
pub const HEADER_SIZE: usize = 63;

const TAG_LINE: &[u8] = b"fileTransfer\r\n";
const FIELD_COUNT: usize = 5;
const MAX_PAYLOAD_LEN: usize = 99_999;

/// Decoded header fields, whitespace trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub file_id: u32,
    pub payload_len: usize,
    pub total_chunks: u32,
    pub index: u32,
    pub checksum: String,
}

/// One chunk frame: header plus the payload it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub header: ChunkHeader,
    pub payload: Vec<u8>,
}

impl ChunkFrame {
    /// Recompute the payload checksum and compare it with the header's.
    pub fn verify(&self) -> Result<(), ChecksumMismatch> {
        let computed = integrity::checksum_hex(&self.payload);
        if computed == self.header.checksum {
            Ok(())
        } else {
            Err(ChecksumMismatch {
                expected: self.header.checksum.clone(),
                computed,
            })
        }
    }
}

/// Encode a chunk frame. `payload` must not exceed 99999 bytes or the header would widen.
pub fn encode_chunk_frame(file_id: u32, index: u32, total_chunks: u32, payload: &[u8]) -> Vec<u8> {
    let header = format!(
        "{:>12}\r\n{:>10}\t{:>5}\t{:>10}\t{:>10}\t{:>8}\r\n",
        TRANSFER_TAG,
        file_id,
        payload.len(),
        total_chunks,
        index,
        integrity::checksum_hex(payload)
    );
    let mut out = Vec::with_capacity(header.len() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Parse the fixed-width header at the front of `bytes`.
pub fn decode_header(bytes: &[u8]) -> Result<ChunkHeader, FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let (tag_line, rest) = bytes[..HEADER_SIZE].split_at(TAG_LINE.len());
    if tag_line != TAG_LINE {
        return Err(FrameDecodeError::MalformedHeader("missing fileTransfer tag line"));
    }
    let Some(fields) = rest.strip_suffix(b"\r\n") else {
        return Err(FrameDecodeError::MalformedHeader("missing header terminator"));
    };
    let fields = std::str::from_utf8(fields)
        .map_err(|_| FrameDecodeError::MalformedHeader("header is not text"))?;
    let fields: Vec<&str> = fields.split('\t').map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return Err(FrameDecodeError::MalformedHeader("expected five tab-separated fields"));
    }
    let number = |s: &str, what: &'static str| {
        s.parse::<u64>()
            .map_err(|_| FrameDecodeError::MalformedHeader(what))
    };
    let payload_len = number(fields[1], "payload length is not a number")? as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let narrow = |v: u64, what: &'static str| {
        u32::try_from(v).map_err(|_| FrameDecodeError::MalformedHeader(what))
    };
    Ok(ChunkHeader {
        file_id: narrow(number(fields[0], "file id is not a number")?, "file id out of range")?,
        payload_len,
        total_chunks: narrow(
            number(fields[2], "chunk count is not a number")?,
            "chunk count out of range",
        )?,
        index: narrow(number(fields[3], "chunk index is not a number")?, "chunk index out of range")?,
        checksum: fields[4].to_string(),
    })
}

/// Decode one frame from the front of `bytes`. Returns the frame and the bytes consumed.
/// The checksum is not checked here; see [`ChunkFrame::verify`].
pub fn decode_chunk_frame(bytes: &[u8]) -> Result<(ChunkFrame, usize), FrameDecodeError> {
    let header = decode_header(bytes)?;
    let end = HEADER_SIZE + header.payload_len;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    let payload = bytes[HEADER_SIZE..end].to_vec();
    Ok((ChunkFrame { header, payload }, end))
}

/// True if `bytes` starts with a chunk frame tag line.
pub fn is_chunk_frame(bytes: &[u8]) -> bool {
    bytes.starts_with(TAG_LINE)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("malformed chunk header: {0}")]
    MalformedHeader(&'static str),
    #[error("chunk payload too large")]
    TooLarge,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("checksum mismatch: header {expected}, computed {computed}")]
pub struct ChecksumMismatch {
    pub expected: String,
    pub computed: String,
}

/// One unit of inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Complete chunk frame bytes (header + payload), not yet verified.
    Frame(Vec<u8>),
    /// Control message text as read from the socket.
    Control(String),
    /// A frame whose header could not be parsed; the buffered bytes were dropped.
    Malformed(&'static str),
}

/// Splits a connection's byte stream into chunk frames and control messages.
///
/// Frames are cut by their header's length field, so several frames arriving in one read, or a
/// frame split across reads, decode correctly. Control messages carry no terminator: whatever
/// non-frame bytes arrive together, up to the next frame tag, form one message.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly read bytes and return every item that is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Inbound> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while !self.buf.is_empty() {
            if is_chunk_frame(&self.buf) {
                match decode_header(&self.buf) {
                    Ok(header) => {
                        let end = HEADER_SIZE + header.payload_len;
                        if self.buf.len() < end {
                            break;
                        }
                        out.push(Inbound::Frame(self.buf.drain(..end).collect()));
                    }
                    Err(FrameDecodeError::NeedMore) => break,
                    Err(FrameDecodeError::MalformedHeader(reason)) => {
                        self.buf.clear();
                        out.push(Inbound::Malformed(reason));
                    }
                    Err(FrameDecodeError::TooLarge) => {
                        self.buf.clear();
                        out.push(Inbound::Malformed("chunk payload too large"));
                    }
                }
            } else if self.buf.len() < TAG_LINE.len() && TAG_LINE.starts_with(&self.buf) {
                // Could still become a frame tag.
                break;
            } else {
                let end = find(&self.buf[1..], TAG_LINE)
                    .map(|i| i + 1)
                    .unwrap_or(self.buf.len());
                let text: Vec<u8> = self.buf.drain(..end).collect();
                out.push(Inbound::Control(String::from_utf8_lossy(&text).into_owned()));
            }
        }
        out
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
