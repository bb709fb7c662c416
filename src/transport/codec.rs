//! Framing of [`Message`]s on a byte stream.
//!
//! Frame layout: `[version: u8][JSON-encoded message][\r\n]`. JSON escapes
//! control characters inside strings, so the terminator cannot occur within
//! a payload.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::message::Message;

/// Version byte written at the start of every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame terminator.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Default upper bound for a single frame, terminator excluded.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Errors raised while encoding or decoding frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty frame")]
    EmptyFrame,

    #[error("unsupported protocol version {found}, expected {PROTOCOL_VERSION}")]
    VersionMismatch { found: u8 },

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message tag {0:?}")]
    UnknownTag(String),

    #[error("frame exceeds {max} bytes")]
    FrameTooLong { max: usize },
}

impl ProtocolError {
    /// Short label for metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::EmptyFrame => "empty_frame",
            Self::VersionMismatch { .. } => "version_mismatch",
            Self::Malformed(_) => "malformed",
            Self::UnknownTag(_) => "unknown_tag",
            Self::FrameTooLong { .. } => "frame_too_long",
        }
    }
}

/// Symmetric codec for agent and server.
///
/// Decoding yields `Result<Message, ProtocolError>` items so that a single
/// bad frame does not terminate the stream. Only I/O failures end it.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_length: usize,
    /// Bytes already scanned for a terminator.
    next_index: usize,
    /// Skipping the remainder of an oversized frame.
    discarding: bool,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    fn find_terminator(&self, buf: &[u8]) -> Option<usize> {
        // Step back one byte so a terminator split across reads is found.
        let start = self.next_index.saturating_sub(TERMINATOR.len() - 1);
        buf.get(start..)?
            .windows(TERMINATOR.len())
            .position(|w| w == TERMINATOR)
            .map(|pos| start + pos)
    }
}

/// Decodes one frame body (terminator stripped).
pub fn decode_frame(frame: &[u8]) -> Result<Message, ProtocolError> {
    let (&version, body) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch { found: version });
    }

    let value: serde_json::Value = serde_json::from_slice(body)?;
    let tag = value.get("tag").and_then(serde_json::Value::as_str);
    match tag {
        Some(t) if Message::TAGS.contains(&t) => {}
        Some(t) => return Err(ProtocolError::UnknownTag(t.to_string())),
        None => return Err(ProtocolError::UnknownTag(String::new())),
    }

    Ok(serde_json::from_value(value)?)
}

impl Decoder for MessageCodec {
    type Item = Result<Message, ProtocolError>;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.find_terminator(src) {
                Some(pos) => {
                    let frame = src.split_to(pos + TERMINATOR.len());
                    self.next_index = 0;

                    if self.discarding {
                        self.discarding = false;
                        return Ok(Some(Err(ProtocolError::FrameTooLong {
                            max: self.max_frame_length,
                        })));
                    }

                    let body = &frame[..pos];
                    if body.len() > self.max_frame_length {
                        return Ok(Some(Err(ProtocolError::FrameTooLong {
                            max: self.max_frame_length,
                        })));
                    }
                    return Ok(Some(decode_frame(body)));
                }
                None if src.len() > self.max_frame_length => {
                    // Keep the last byte: it may be the first half of the
                    // terminator.
                    let keep = src.len().min(TERMINATOR.len() - 1);
                    src.advance(src.len() - keep);
                    self.next_index = 0;
                    self.discarding = true;
                    continue;
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None if buf.is_empty() || self.discarding => {
                buf.clear();
                self.discarding = false;
                Ok(None)
            }
            None => {
                // Unterminated trailing frame.
                let frame = buf.split_to(buf.len());
                self.next_index = 0;
                Ok(Some(decode_frame(&frame)))
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(&msg, self.max_frame_length, dst)
    }
}

/// Appends one complete frame for `msg` to `dst`.
pub fn encode_frame(
    msg: &Message,
    max_frame_length: usize,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() + 1 > max_frame_length {
        return Err(ProtocolError::FrameTooLong {
            max: max_frame_length,
        });
    }

    dst.reserve(1 + body.len() + TERMINATOR.len());
    dst.put_u8(PROTOCOL_VERSION);
    dst.put_slice(&body);
    dst.put_slice(TERMINATOR);
    Ok(())
}
