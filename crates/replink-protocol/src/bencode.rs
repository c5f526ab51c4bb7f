//! Bencode encoding and frame parsing.
//!
//! # Grammar
//!
//! ```text
//! frame   := dict
//! dict    := 'd' (string value)* 'e'
//! list    := 'l' value* 'e'
//! value   := string | integer | list | dict
//! string  := [0-9]+ ':' <len bytes>
//! integer := 'i' '-'? [0-9]+ 'e'
//! ```
//!
//! Only the top-level dictionary is represented. Its string values are stored
//! verbatim and integer values as their decimal text; list and dict values are
//! consumed and dropped, so the key is absent from the decoded [`Message`].
//!
//! A malformed entry (a key that does not start with a digit, an unknown value
//! lead byte) stops decoding of the dictionary: the parser skips forward to the
//! next unmatched `e` and returns the entries read so far.

use crate::message::Message;

const DICT: u8 = b'd';
const LIST: u8 = b'l';
const INT: u8 = b'i';
const END: u8 = b'e';
const COLON: u8 = b':';

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a message as one canonical bencode dictionary.
///
/// Keys are written in ascending order; lengths are byte lengths.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len_hint(message));
    out.push(DICT);
    for (key, value) in message {
        write_string(&mut out, key.as_bytes());
        write_string(&mut out, value.as_bytes());
    }
    out.push(END);
    out
}

fn write_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(COLON);
    out.extend_from_slice(bytes);
}

fn encoded_len_hint(message: &Message) -> usize {
    message
        .iter()
        .map(|(k, v)| k.len() + v.len() + 8)
        .sum::<usize>()
        + 2
}

// ============================================================================
// Decoding
// ============================================================================

/// Result of inspecting the head of a byte buffer for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// A complete top-level dictionary occupying the first `len` bytes.
    Complete { message: Message, len: usize },
    /// The first `len` bytes cannot start a frame and should be discarded.
    Garbage { len: usize },
    /// The buffer ends before the frame does. Pass the state back to
    /// [`resume_frame`] once more bytes have arrived.
    Incomplete(PartialFrame),
}

/// Progress through a frame whose tail has not arrived yet.
///
/// Entries before `resume_at` are already decoded into `message`, so a
/// resumed parse starts at the first unfinished entry instead of the frame
/// start. `needed` is the buffer length below which no progress is possible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialFrame {
    message: Message,
    resume_at: usize,
    needed: usize,
}

impl PartialFrame {
    /// Offset of the first entry not yet decoded; 0 before the opening `d`.
    pub fn resume_at(&self) -> usize {
        self.resume_at
    }

    /// Buffer length required before parsing can advance.
    pub fn needed(&self) -> usize {
        self.needed
    }

    /// Entries decoded so far.
    pub fn message(&self) -> &Message {
        &self.message
    }
}

/// Inspects the start of `buf` for one frame.
pub fn parse_frame(buf: &[u8]) -> FrameStatus {
    resume_frame(buf, PartialFrame::default())
}

/// Continues a parse of the frame at the start of `buf`.
///
/// `buf` must hold the same leading bytes it held when `partial` was
/// produced, plus whatever has arrived since.
pub fn resume_frame(buf: &[u8], partial: PartialFrame) -> FrameStatus {
    if buf.len() < partial.needed {
        return FrameStatus::Incomplete(partial);
    }

    let (message, pos) = if partial.resume_at == 0 {
        match buf.first() {
            None => {
                return FrameStatus::Incomplete(PartialFrame {
                    needed: 1,
                    ..PartialFrame::default()
                })
            }
            Some(&DICT) => (Message::new(), 1),
            Some(_) => {
                let len = buf.iter().position(|&b| b == DICT).unwrap_or(buf.len());
                return FrameStatus::Garbage { len };
            }
        }
    } else {
        (partial.message, partial.resume_at)
    };

    let mut cursor = Cursor { buf, pos };
    match cursor.read_dict_body(message) {
        Ok(message) => FrameStatus::Complete {
            message,
            len: cursor.pos,
        },
        Err(partial) => FrameStatus::Incomplete(partial),
    }
}

/// Decodes the first complete frame in `input`.
///
/// Returns `None` when the input ends before a frame is complete.
pub fn decode(input: &[u8]) -> Option<Message> {
    let mut rest = input;
    loop {
        match parse_frame(rest) {
            FrameStatus::Complete { message, .. } => return Some(message),
            FrameStatus::Garbage { len } => rest = rest.get(len..)?,
            FrameStatus::Incomplete(_) => return None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// The buffer must grow to `needed` bytes before this can succeed.
    Incomplete { needed: usize },
    Malformed,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Result<u8, Fault> {
        self.buf.get(self.pos).copied().ok_or(Fault::Incomplete {
            needed: self.pos + 1,
        })
    }

    fn bump(&mut self) -> Result<u8, Fault> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    /// Reads dictionary entries up to and including the closing `e`.
    fn read_dict_body(&mut self, mut message: Message) -> Result<Message, PartialFrame> {
        loop {
            let start = self.pos;
            let entry = match self.peek() {
                Ok(END) => {
                    self.pos += 1;
                    return Ok(message);
                }
                Ok(_) => self.read_entry(),
                Err(fault) => Err(fault),
            };

            match entry {
                Ok((key, Some(value))) => {
                    message.insert(key, value);
                }
                Ok((_, None)) => {}
                Err(Fault::Incomplete { needed }) => {
                    return Err(PartialFrame {
                        message,
                        resume_at: start,
                        needed,
                    })
                }
                Err(Fault::Malformed) => {
                    self.pos = start;
                    return match self.skip_to_unmatched_end() {
                        Ok(()) => Ok(message),
                        Err(needed) => Err(PartialFrame {
                            message,
                            resume_at: start,
                            needed,
                        }),
                    };
                }
            }
        }
    }

    fn read_entry(&mut self) -> Result<(String, Option<String>), Fault> {
        let key = self.read_string()?;
        let value = match self.peek()? {
            b'0'..=b'9' => Some(self.read_string()?),
            INT => Some(self.read_integer()?),
            LIST | DICT => {
                self.skip_value()?;
                None
            }
            _ => return Err(Fault::Malformed),
        };
        Ok((key, value))
    }

    fn read_length(&mut self) -> Result<usize, Fault> {
        let mut len: usize = 0;
        let mut digits = 0usize;
        loop {
            match self.bump()? {
                b @ b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add(usize::from(b - b'0')))
                        .ok_or(Fault::Malformed)?;
                    digits += 1;
                }
                COLON if digits > 0 => return Ok(len),
                _ => return Err(Fault::Malformed),
            }
        }
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], Fault> {
        let len = self.read_length()?;
        let end = self.pos.checked_add(len).ok_or(Fault::Malformed)?;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(Fault::Incomplete { needed: end })?;
        self.pos = end;
        Ok(bytes)
    }

    fn read_string(&mut self) -> Result<String, Fault> {
        Ok(String::from_utf8_lossy(self.read_bytes()?).into_owned())
    }

    /// Reads `i<digits>e` as decimal text.
    ///
    /// A body that is not a valid `i64` reads as `"0"`, so the key is kept
    /// and the rest of the frame decodes normally.
    fn read_integer(&mut self) -> Result<String, Fault> {
        self.pos += 1;
        let rest = self.buf.get(self.pos..).unwrap_or_default();
        let end = rest.iter().position(|&b| b == END).ok_or(Fault::Incomplete {
            needed: self.buf.len() + 1,
        })?;
        let body = rest.get(..end).unwrap_or_default();
        self.pos += end + 1;

        let value = std::str::from_utf8(body)
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(value.to_string())
    }

    /// Consumes one value of any shape without recursion.
    fn skip_value(&mut self) -> Result<(), Fault> {
        let mut depth = 0usize;
        loop {
            match self.peek()? {
                LIST | DICT => {
                    self.pos += 1;
                    depth += 1;
                }
                END if depth > 0 => {
                    self.pos += 1;
                    depth -= 1;
                }
                INT => {
                    self.read_integer()?;
                }
                b'0'..=b'9' => {
                    self.read_bytes()?;
                }
                _ => return Err(Fault::Malformed),
            }
            if depth == 0 {
                return Ok(());
            }
        }
    }

    /// Skips well-formed values and stray bytes up to and including the next
    /// `e` that is not closing a nested value. Errs with the buffer length
    /// needed when the input runs out first.
    fn skip_to_unmatched_end(&mut self) -> Result<(), usize> {
        loop {
            let byte = match self.peek() {
                Ok(byte) => byte,
                Err(_) => return Err(self.pos + 1),
            };
            match byte {
                END => {
                    self.pos += 1;
                    return Ok(());
                }
                b'0'..=b'9' | INT | LIST | DICT => {
                    let mark = self.pos;
                    match self.skip_value() {
                        Ok(()) => {}
                        Err(Fault::Incomplete { needed }) => return Err(needed),
                        Err(Fault::Malformed) => self.pos = mark + 1,
                    }
                }
                _ => self.pos += 1,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
