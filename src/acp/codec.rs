//! NDJSON codec for ACP agent streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length to prevent memory exhaustion caused by unterminated or maliciously
//! large messages from a misbehaving agent process.
//!
//! # Framing
//!
//! Lines are fed into a JSON accumulator. After every line the accumulator
//! is scanned with a streaming deserializer:
//!
//! - every complete document is yielded, so several messages concatenated on
//!   one line come out one by one, in order;
//! - an incomplete trailing document is kept until more lines arrive, so a
//!   message pretty-printed over several lines is reassembled;
//! - a syntax error discards the accumulator and yields
//!   [`Frame::Malformed`]; the stream itself keeps going. An unfinished
//!   fragment followed by a fresh document loses only the fragment;
//! - the accumulator is capped at [`MAX_LINE_BYTES`] like a single line.
//!
//! Only I/O failures surface as decoder errors, because
//! [`FramedRead`](tokio_util::codec::FramedRead) stops after the first error.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_relay::acp::codec::AcpCodec;
//!
//! let reader = FramedRead::new(child_stdout, AcpCodec::new());
//! ```

use std::collections::VecDeque;

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::acp::message::Message;
use crate::{AppError, Result};

/// Maximum line length accepted by the ACP codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded inbound item.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A complete JSON document.
    Json(Value),
    /// Bytes that could not be decoded; the reason is suitable for logging.
    Malformed(String),
}

/// NDJSON codec for bidirectional ACP agent streams.
///
/// # Decoder
///
/// Yields [`Frame`]s. Lines longer than [`MAX_LINE_BYTES`] yield
/// `Frame::Malformed("line too long: …")` and are skipped by the underlying
/// [`LinesCodec`]. I/O errors are mapped to [`AppError::Io`].
///
/// # Encoder
///
/// Outbound [`Message`]s are encoded as one compact JSON document followed
/// by `\n`.
#[derive(Debug)]
pub struct AcpCodec {
    lines: LinesCodec,
    pending: String,
    ready: VecDeque<Frame>,
}

impl AcpCodec {
    /// Create a new `AcpCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
            pending: String::new(),
            ready: VecDeque::new(),
        }
    }

    /// Bytes held back waiting for the rest of a document.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Append `line` to the accumulator and queue every complete document.
    ///
    /// A syntax error discards the accumulator and queues a
    /// [`Frame::Malformed`] behind the documents parsed before it. When the
    /// error comes from an unfinished fragment held over from earlier lines,
    /// only the fragment is dropped and `line` is parsed again on its own.
    fn accumulate(&mut self, line: &str) {
        if self.pending.is_empty() && line.trim().is_empty() {
            return;
        }
        let had_fragment = !self.pending.is_empty();
        if had_fragment {
            self.pending.push('\n');
        }
        self.pending.push_str(line);

        let Scan {
            values,
            consumed,
            error,
        } = scan(&self.pending);

        match error {
            Some(err) if had_fragment && values.is_empty() => {
                self.ready.push_back(Frame::Malformed(format!(
                    "malformed json: unfinished message dropped: {err}"
                )));
                self.pending.clear();
                self.accumulate(line);
            }
            Some(err) => {
                self.ready.extend(values.into_iter().map(Frame::Json));
                self.ready
                    .push_back(Frame::Malformed(format!("malformed json: {err}")));
                self.pending.clear();
            }
            None => {
                self.ready.extend(values.into_iter().map(Frame::Json));
                self.pending.drain(..consumed);
                if self.pending.trim().is_empty() {
                    self.pending.clear();
                } else if self.pending.len() > MAX_LINE_BYTES {
                    self.pending.clear();
                    self.ready.push_back(Frame::Malformed(format!(
                        "message too long: exceeded {MAX_LINE_BYTES} bytes"
                    )));
                }
            }
        }
    }
}

/// Outcome of scanning the accumulator once.
struct Scan {
    /// Complete documents, in order.
    values: Vec<Value>,
    /// Bytes taken up by `values`.
    consumed: usize,
    /// Syntax error that stopped the scan.
    error: Option<serde_json::Error>,
}

fn scan(input: &str) -> Scan {
    let mut stream = serde_json::Deserializer::from_str(input).into_iter::<Value>();
    let mut values = Vec::new();
    let mut consumed = 0;
    loop {
        match stream.next() {
            Some(Ok(value)) => {
                values.push(value);
                consumed = stream.byte_offset();
            }
            Some(Err(e)) if e.is_eof() => {
                return Scan {
                    values,
                    consumed,
                    error: None,
                };
            }
            Some(Err(e)) => {
                return Scan {
                    values,
                    consumed,
                    error: Some(e),
                };
            }
            None => {
                return Scan {
                    values,
                    consumed: input.len(),
                    error: None,
                };
            }
        }
    }
}

impl Default for AcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AcpCodec {
    type Item = Frame;
    type Error = AppError;

    /// Decode the next complete JSON document from `src`.
    ///
    /// Returns `Ok(None)` while only part of a document has arrived.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }

            match self.lines.decode(src) {
                Ok(Some(line)) => self.accumulate(&line),
                Ok(None) => return Ok(None),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    self.pending.clear();
                    return Ok(Some(line_too_long()));
                }
                Err(LinesCodecError::Io(err)) => return Err(AppError::Io(err.to_string())),
            }
        }
    }

    /// Decode whatever remains when the stream reaches EOF.
    ///
    /// A final line without a trailing newline is still parsed; a document
    /// that never completed yields `Frame::Malformed`.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        match self.lines.decode_eof(src) {
            Ok(Some(line)) => self.accumulate(&line),
            Ok(None) => {}
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                self.pending.clear();
                return Ok(Some(line_too_long()));
            }
            Err(LinesCodecError::Io(err)) => return Err(AppError::Io(err.to_string())),
        }

        if let Some(frame) = self.ready.pop_front() {
            return Ok(Some(frame));
        }

        if self.pending.is_empty() {
            Ok(None)
        } else {
            self.pending.clear();
            Ok(Some(Frame::Malformed(
                "stream ended in the middle of a message".into(),
            )))
        }
    }
}

impl Encoder<Message> for AcpCodec {
    type Error = AppError;

    /// Encode `item` as a `\n`-terminated NDJSON line into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if serialisation fails and
    /// [`AppError::Io`] on underlying I/O failures.
    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(&item.to_value())
            .map_err(|e| AppError::Protocol(format!("failed to serialise message: {e}")))?;
        // LinesCodec::encode does not enforce a max line length;
        // the limit applies only to decoding.
        self.lines.encode(line, dst).map_err(|e| match e {
            LinesCodecError::MaxLineLengthExceeded => {
                AppError::Protocol(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
            }
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        })
    }
}

// ── Private helper ────────────────────────────────────────────────────────────

fn line_too_long() -> Frame {
    Frame::Malformed(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
}
