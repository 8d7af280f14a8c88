//! Canonical text codec for CEC frames (spec §4.1 / §6).
//!
//! The same grammar is used on the bus (as rendered by the native
//! adapter's log lines) and on the TCP line protocol:
//! `SD[:OP[:O1[:O2..]]]`, where `S`/`D` are single hex nibbles and every
//! later field is two hex nibbles.

use std::fmt;

/// A decoded CEC frame: header (`src`/`dst`), an optional opcode and its
/// operands. A frame with no opcode is a polling frame (spec §3).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CecFrame {
    pub src: u8,
    pub dst: u8,
    pub opcode: Option<u8>,
    pub operands: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedFrame(pub String);

impl fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed CEC frame: {}", self.0)
    }
}

impl std::error::Error for MalformedFrame {}

impl CecFrame {
    pub fn poll(src: u8, dst: u8) -> CecFrame {
        CecFrame {
            src,
            dst,
            opcode: None,
            operands: Vec::new(),
        }
    }

    pub fn new(src: u8, dst: u8, opcode: u8, operands: Vec<u8>) -> CecFrame {
        CecFrame {
            src,
            dst,
            opcode: Some(opcode),
            operands,
        }
    }

    /// Strips the `">> "`/`"<< "` echo markers the adapters prefix inbound
    /// lines with before logging/forwarding them (spec §4.1, §4.5, §4.7).
    pub fn strip_echo_marker(line: &str) -> &str {
        if line.len() >= 3 && (line.starts_with(">> ") || line.starts_with("<< ")) {
            &line[3..]
        } else {
            line
        }
    }
}

/// Parses the canonical text form of a frame. Case-insensitive on hex.
pub fn parse(text: &str) -> Result<CecFrame, MalformedFrame> {
    let text = CecFrame::strip_echo_marker(text.trim());
    let mut segments = text.split(':');

    let header = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| MalformedFrame(format!("empty frame: {:?}", text)))?;
    // walk by `char`, not by byte index: a non-ASCII "header" (e.g. a single
    // two-byte UTF-8 scalar) can have `.len() == 2` without byte index 1
    // falling on a char boundary, which would panic on a byte slice.
    let mut header_chars = header.chars();
    let (Some(src_char), Some(dst_char), None) =
        (header_chars.next(), header_chars.next(), header_chars.next())
    else {
        return Err(MalformedFrame(format!(
            "header must be exactly two hex nibbles, got {:?}",
            header
        )));
    };
    let src = parse_nibble(src_char)?;
    let dst = parse_nibble(dst_char)?;

    let opcode = match segments.next() {
        Some(s) => Some(parse_byte(s)?),
        None => None,
    };

    let mut operands = Vec::new();
    for segment in segments {
        operands.push(parse_byte(segment)?);
    }

    Ok(CecFrame {
        src,
        dst,
        opcode,
        operands,
    })
}

/// Renders a frame back to its canonical lowercase text form.
pub fn render(frame: &CecFrame) -> String {
    let mut out = format!("{:01x}{:01x}", frame.src, frame.dst);
    if let Some(opcode) = frame.opcode {
        out.push_str(&format!(":{:02x}", opcode));
        for operand in &frame.operands {
            out.push_str(&format!(":{:02x}", operand));
        }
    }
    out
}

fn parse_nibble(c: char) -> Result<u8, MalformedFrame> {
    c.to_digit(16)
        .map(|d| d as u8)
        .ok_or_else(|| MalformedFrame(format!("invalid hex nibble: {:?}", c)))
}

fn parse_byte(s: &str) -> Result<u8, MalformedFrame> {
    if s.len() != 2 {
        return Err(MalformedFrame(format!(
            "expected two hex nibbles, got {:?}",
            s
        )));
    }
    u8::from_str_radix(s, 16).map_err(|_| MalformedFrame(format!("invalid hex byte: {:?}", s)))
}
