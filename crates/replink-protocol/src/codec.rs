//! Streaming frame codec for `tokio_util::codec`.

use std::io;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::bencode::{encode, resume_frame, FrameStatus, PartialFrame};
use crate::message::Message;

/// Upper bound on buffered bytes for a single frame (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Transport-level protocol failures.
///
/// Application errors (`err` / `ex` fields) are never represented here; they
/// travel inside a decoded [`Message`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A frame grew past the buffer limit without completing.
    #[error("frame exceeds {max} bytes (buffered {len})")]
    FrameTooLarge { len: usize, max: usize },
}

/// Bencode dictionary codec.
///
/// Decoding yields one [`Message`] per top-level dictionary. Bytes that cannot
/// start a dictionary are discarded. A stream that ends mid-frame yields no
/// message rather than an error.
///
/// A frame that arrives over many reads is not re-parsed from its start on
/// every read: the codec keeps the decoded entries and resumes at the first
/// unfinished one, once enough bytes are buffered for it to progress.
#[derive(Debug, Clone)]
pub struct BencodeCodec {
    max_frame_size: usize,
    partial: PartialFrame,
}

impl BencodeCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            partial: PartialFrame::default(),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for BencodeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BencodeCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        loop {
            match resume_frame(src, std::mem::take(&mut self.partial)) {
                FrameStatus::Complete { message, len } => {
                    src.advance(len);
                    return Ok(Some(message));
                }
                FrameStatus::Garbage { len } => src.advance(len),
                FrameStatus::Incomplete(partial) => {
                    self.partial = partial;
                    if src.len() > self.max_frame_size {
                        return Err(ProtocolError::FrameTooLarge {
                            len: src.len(),
                            max: self.max_frame_size,
                        });
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None => {
                // truncated trailing frame
                src.clear();
                self.partial = PartialFrame::default();
                Ok(None)
            }
        }
    }
}

impl Encoder<Message> for BencodeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&encode(&item));
        Ok(())
    }
}

impl Encoder<&Message> for BencodeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&encode(item));
        Ok(())
    }
}
