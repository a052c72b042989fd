//! Line protocol spoken with the client.
//!
//! ```text
//! client -> server   GET
//! client -> server   SET|<target_rate>#<batch_size>
//! server -> client   DST|{"active":true,"fs":48000,"format":"paInt16","device_idx":null}
//! server -> client   DAT|<f1>|<f2>|...|<fn>
//! ```
//!
//! Lines end with `\r\n` on the way out; `\n` alone is accepted on the way in.

use crate::audio::StreamState;
use anyhow::{Context, Result};
use std::fmt::{self, Write as _};
use std::io::{self, BufRead, Read};

/// Longest incoming line (excluding its terminator) before the connection is dropped.
pub const MAX_LINE_BYTES: usize = 16_384;
pub const FIELD_DELIMITER: char = '|';
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

const STATUS_PREFIX: &str = "DST";
const DATA_PREFIX: &str = "DAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Get,
    /// Raw `<target_rate>#<batch_size>` token, validated by the controller.
    Set(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Empty,
    MissingArgument(&'static str),
    Unknown(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Empty => write!(f, "empty line"),
            ProtocolError::MissingArgument(command) => {
                write!(f, "{command} requires an argument")
            }
            ProtocolError::Unknown(command) => write!(f, "unknown command {command:?}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Split a line into command and argument. Fields past the second are ignored.
pub fn parse_command(line: &str) -> Result<Command<'_>, ProtocolError> {
    let mut fields = line.split(FIELD_DELIMITER);
    let command = fields.next().unwrap_or_default();
    match command {
        "" if line.is_empty() => Err(ProtocolError::Empty),
        "GET" => Ok(Command::Get),
        "SET" => fields
            .next()
            .map(Command::Set)
            .ok_or(ProtocolError::MissingArgument("SET")),
        other => Err(ProtocolError::Unknown(other.to_string())),
    }
}

pub fn format_status(state: &StreamState) -> Result<String> {
    let json = serde_json::to_string(state).context("failed to serialise stream state")?;
    Ok(format!("{STATUS_PREFIX}{FIELD_DELIMITER}{json}"))
}

/// Render one decimated batch. Samples use the shortest decimal text that
/// reads back to the same `f32`.
pub fn format_samples(samples: &[f32]) -> String {
    let mut line = String::with_capacity(DATA_PREFIX.len() + samples.len() * 12);
    line.push_str(DATA_PREFIX);
    for sample in samples {
        line.push(FIELD_DELIMITER);
        let _ = write!(line, "{sample}");
    }
    line
}

/// Outcome of reading one incoming line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// A complete line is in the buffer, terminator stripped.
    Line,
    Closed,
    Oversized,
}

/// Read the next line into `buf` without buffering more than
/// [`MAX_LINE_BYTES`] plus a terminator. A trailing partial line at EOF
/// counts as a close.
pub fn read_frame<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Frame> {
    buf.clear();
    let limit = (MAX_LINE_BYTES + LINE_TERMINATOR.len()) as u64;
    let read = reader.by_ref().take(limit).read_until(b'\n', buf)?;
    if read == 0 {
        return Ok(Frame::Closed);
    }
    if buf.last() != Some(&b'\n') {
        if read as u64 >= limit {
            return Ok(Frame::Oversized);
        }
        return Ok(Frame::Closed);
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    if buf.len() > MAX_LINE_BYTES {
        return Ok(Frame::Oversized);
    }
    Ok(Frame::Line)
}
