//! SLIP framing
//!
//! Frames are delimited by [END] bytes. Inside a frame [END] and [ESC] are
//! replaced by two-byte escape sequences.

use thiserror::Error;

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape byte.
pub const ESC: u8 = 0xDB;
/// Escaped [END].
pub const ESC_END: u8 = 0xDC;
/// Escaped [ESC].
pub const ESC_ESC: u8 = 0xDD;

/// Errors raised while unescaping a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SlipError {
    /// [ESC] followed by something other than [ESC_END] or [ESC_ESC].
    #[error("invalid escape sequence 0xdb {0:#04x}")]
    InvalidEscape(u8),
    /// The frame closes right after an [ESC].
    #[error("frame ends inside an escape sequence")]
    TruncatedEscape,
}

/// Wrap `payload` in frame delimiters, escaping it as needed.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(END);
    for &byte in payload {
        match byte {
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            _ => frame.push(byte),
        }
    }
    frame.push(END);

    frame
}

/// Extract the first complete frame from `buffer`.
///
/// Returns the unescaped frame, if any, together with the bytes following it.
/// When no complete frame is buffered yet, the whole buffer is handed back so
/// the caller can append to it and try again.
pub fn decode(buffer: &[u8]) -> Result<(Option<Vec<u8>>, &[u8]), SlipError> {
    let Some(mut start) = buffer.iter().position(|&b| b == END) else {
        return Ok((None, buffer));
    };

    loop {
        let body = &buffer[start + 1..];
        let Some(len) = body.iter().position(|&b| b == END) else {
            return Ok((None, buffer));
        };

        if len == 0 {
            // An empty frame: the second delimiter opens the next one
            start += 1;
            continue;
        }

        let frame = unescape(&body[..len])?;
        return Ok((Some(frame), &body[len + 1..]));
    }
}

fn unescape(escaped: &[u8]) -> Result<Vec<u8>, SlipError> {
    let mut frame = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter();

    while let Some(&byte) = bytes.next() {
        if byte != ESC {
            frame.push(byte);
            continue;
        }

        match bytes.next() {
            Some(&ESC_END) => frame.push(END),
            Some(&ESC_ESC) => frame.push(ESC),
            Some(&other) => return Err(SlipError::InvalidEscape(other)),
            None => return Err(SlipError::TruncatedEscape),
        }
    }

    Ok(frame)
}
