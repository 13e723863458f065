//! Framing for the control protocol.
//!
//! Clients send us single lines, terminated by LF or CRLF.  The control port
//! sends us replies, each of which may span several lines:
//!
//! ```text
//! 250-first line        (mid-reply line)
//! 250+data follows      (data line; followed by a block ending in ".")
//! 250 OK                (end line)
//! ```
//!
//! We keep every reply's bytes exactly as they arrived, so that we can pass
//! them on unchanged.

use std::io;

use asynchronous_codec::Decoder;
use bytes::{Bytes, BytesMut};

/// The longest command line we accept from a client, not counting the line
/// terminator.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// The status code of an asynchronous event.
pub(crate) const ASYNC_EVENT_STATUS: u16 = 650;

/// An error from one of our decoders.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub(crate) enum CodecError {
    /// The underlying stream failed.
    #[error("I/O error")]
    Io(#[from] io::Error),
    /// A client sent a line that was too long.
    #[error("Line was longer than {0} bytes")]
    LineTooLong(usize),
    /// The control port sent a line that doesn't start with a status code.
    #[error("Malformed reply line {0:?}")]
    BadReplyLine(String),
}

/// Decoder for client command lines.
///
/// Each item is one line, without its terminator.  A partial line at the
/// end of the stream is discarded.
#[derive(Clone, Debug)]
pub(crate) struct LineCodec {
    /// The longest line we accept.
    max_len: usize,
    /// How much of the buffer we have already searched for a newline.
    scanned: usize,
}

impl LineCodec {
    /// Return a new `LineCodec` that rejects lines longer than `max_len`.
    pub(crate) fn new(max_len: usize) -> Self {
        LineCodec {
            max_len,
            scanned: 0,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_LEN)
    }
}

impl Decoder for LineCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(pos) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
            self.scanned = src.len();
            if self.scanned > self.max_len {
                return Err(CodecError::LineTooLong(self.max_len));
            }
            return Ok(None);
        };
        let end = self.scanned + pos;
        self.scanned = 0;

        let mut line = src.split_to(end + 1);
        line.truncate(end);
        if line.last() == Some(&b'\r') {
            line.truncate(end - 1);
        }
        if line.len() > self.max_len {
            return Err(CodecError::LineTooLong(self.max_len));
        }
        Ok(Some(line))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None => {
                // Tor ignores an unterminated final line, and so do we.
                src.clear();
                self.scanned = 0;
                Ok(None)
            }
        }
    }
}

/// A complete reply from the control port.
#[derive(Clone, Debug)]
pub struct Reply {
    /// The status code on the reply's final line.
    status: u16,
    /// The reply exactly as received, line terminators included.
    raw: Bytes,
}

impl Reply {
    /// Return the status code of this reply.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Return true if this reply reports success.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Return true if this is an asynchronous event rather than an answer
    /// to a command.
    pub fn is_async_event(&self) -> bool {
        self.status == ASYNC_EVENT_STATUS
    }

    /// Return the bytes of this reply, as received.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Return the text of every status line in this reply, without the
    /// status codes and separators.
    ///
    /// The contents of data blocks are skipped.
    pub fn lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut in_data = false;
        for line in self.raw.split(|b| *b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if in_data {
                in_data = line != b".";
                continue;
            }
            if line.len() < 3 {
                continue;
            }
            in_data = line.get(3) == Some(&b'+');
            let text = line.get(4..).unwrap_or_default();
            out.push(String::from_utf8_lossy(text).into_owned());
        }
        out
    }

    /// Return a one-line summary of this reply, for error messages.
    pub(crate) fn summary(&self) -> String {
        let first = self.raw.split(|b| *b == b'\n').next().unwrap_or_default();
        let first = first.strip_suffix(b"\r").unwrap_or(first);
        String::from_utf8_lossy(first).into_owned()
    }
}

/// Parse the status code and separator at the start of a reply line.
///
/// A bare three-digit line is treated as an end line.
fn parse_status(line: &[u8]) -> Option<(u16, u8)> {
    let code = line.get(..3)?;
    if !code.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let status = code
        .iter()
        .fold(0_u16, |acc, d| acc * 10 + u16::from(d - b'0'));
    match line.get(3) {
        None => Some((status, b' ')),
        Some(sep @ (b' ' | b'-' | b'+')) => Some((status, *sep)),
        Some(_) => None,
    }
}

/// Decoder for replies from the control port.
#[derive(Clone, Debug, Default)]
pub(crate) struct ReplyCodec {
    /// How many bytes of the current reply we've already parsed.
    scanned: usize,
    /// True if we are inside a data block.
    in_data: bool,
}

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let start = self.scanned;
            let end = start + pos;
            self.scanned = end + 1;

            let line = &src[start..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if self.in_data {
                if line == b"." {
                    self.in_data = false;
                }
                continue;
            }

            let (status, sep) = parse_status(line).ok_or_else(|| {
                CodecError::BadReplyLine(String::from_utf8_lossy(line).into_owned())
            })?;
            match sep {
                b'-' => {}
                b'+' => self.in_data = true,
                _ => {
                    let raw = src.split_to(self.scanned).freeze();
                    self.scanned = 0;
                    return Ok(Some(Reply { status, raw }));
                }
            }
        }
    }
}
