//! NDJSON Frame Protocol
//!
//! Wire format for token streams: one JSON object per line.
//!
//! # Frame Format
//!
//! ```text
//! {"token":"Hel","lsn":1}\n
//! {"token":"lo","lsn":2}\n
//! ```
//!
//! Each line is a serialized [`StreamFrame`] followed by a single `\n`.
//! Serialized JSON never contains a raw newline, so the newline is an
//! unambiguous frame boundary.
//!
//! # Security
//!
//! - Maximum line size is enforced on both encode and decode
//! - The decoder refuses to buffer an unterminated line past the limit

use serde::{de::DeserializeOwned, Serialize};

use crate::error::RelayError;
use crate::streaming::StreamFrame;

/// Maximum frame size (10 MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Encode any serializable value as a single NDJSON line
///
/// # Errors
///
/// Returns [`RelayError::Transport`] if serialization fails or the line
/// would exceed [`MAX_FRAME_SIZE`].
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, RelayError> {
    let mut json = serde_json::to_vec(value)?;

    if json.len() >= MAX_FRAME_SIZE {
        return Err(RelayError::Transport(format!(
            "Frame too large: {} bytes (max: {})",
            json.len(),
            MAX_FRAME_SIZE
        )));
    }

    json.push(b'\n');
    Ok(json)
}

/// Encode one `{token, lsn}` frame
///
/// # Errors
///
/// See [`encode_line`].
pub fn encode_frame<T: Serialize>(frame: &StreamFrame<T>) -> Result<Vec<u8>, RelayError> {
    encode_line(frame)
}

/// Decoder state machine for streaming NDJSON parsing
///
/// Buffers incoming bytes and yields one value per complete line. Chunk
/// boundaries may fall anywhere, including inside a multi-byte character.
#[derive(Debug)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
}

impl Default for NdjsonDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl NdjsonDecoder {
    /// Create a new decoder with default buffer capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next line
    ///
    /// Returns:
    /// - `Ok(Some(value))` if a complete line was decoded
    /// - `Ok(None)` if more data is needed
    /// - `Err(RelayError::Transport)` if the line is invalid or too long
    ///
    /// Blank lines are skipped.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, RelayError> {
        loop {
            let pending = &self.buffer[self.read_pos..];
            let Some(newline) = pending.iter().position(|&b| b == b'\n') else {
                if pending.len() > MAX_FRAME_SIZE {
                    return Err(RelayError::Transport(format!(
                        "Frame size {} exceeds maximum {MAX_FRAME_SIZE}",
                        pending.len()
                    )));
                }
                return Ok(None);
            };

            let line_start = self.read_pos;
            self.read_pos += newline + 1;

            let line = trim_line(&self.buffer[line_start..line_start + newline]);
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_FRAME_SIZE {
                return Err(RelayError::Transport(format!(
                    "Frame size {} exceeds maximum {MAX_FRAME_SIZE}",
                    line.len()
                )));
            }

            return Ok(Some(serde_json::from_slice(line)?));
        }
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

/// Strip surrounding whitespace, including a `\r` from CRLF senders
fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_is_one_line() {
        let frame = StreamFrame {
            token: "Hel\nlo".to_string(),
            lsn: 1,
        };
        let encoded = encode_frame(&frame).unwrap();

        assert_eq!(encoded.last(), Some(&b'\n'));
        assert_eq!(encoded.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(
            String::from_utf8(encoded).unwrap(),
            "{\"token\":\"Hel\\nlo\",\"lsn\":1}\n"
        );
    }

    #[test]
    fn test_decode_partial_line() {
        let encoded = encode_frame(&StreamFrame {
            token: "test".to_string(),
            lsn: 7,
        })
        .unwrap();

        let mut decoder = NdjsonDecoder::new();
        decoder.push(&encoded[..encoded.len() / 2]);
        let result: Result<Option<StreamFrame<String>>, _> = decoder.decode();
        assert!(matches!(result, Ok(None)));

        decoder.push(&encoded[encoded.len() / 2..]);
        let decoded: StreamFrame<String> = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded.token, "test");
        assert_eq!(decoded.lsn, 7);
        assert_eq!(decoder.available(), 0);
    }

    #[test]
    fn test_decode_split_multibyte_character() {
        let encoded = encode_frame(&StreamFrame {
            token: "héllo".to_string(),
            lsn: 1,
        })
        .unwrap();
        // Split inside the two-byte 'é'
        let split = encoded.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut decoder = NdjsonDecoder::new();
        decoder.push(&encoded[..split]);
        assert!(decoder.decode::<StreamFrame<String>>().unwrap().is_none());
        decoder.push(&encoded[split..]);
        let decoded: StreamFrame<String> = decoder.decode().unwrap().unwrap();
        assert_eq!(decoded.token, "héllo");
    }

    #[test]
    fn test_decode_multiple_lines_and_blanks() {
        let mut decoder = NdjsonDecoder::new();
        decoder.push(b"{\"token\":\"a\",\"lsn\":1}\n\n  \r\n{\"token\":\"b\",\"lsn\":2}\r\n");

        let first: StreamFrame<String> = decoder.decode().unwrap().unwrap();
        let second: StreamFrame<String> = decoder.decode().unwrap().unwrap();
        let none: Option<StreamFrame<String>> = decoder.decode().unwrap();

        assert_eq!(first.lsn, 1);
        assert_eq!(second.token, "b");
        assert!(none.is_none());
    }

    #[test]
    fn test_decode_invalid_json() {
        let mut decoder = NdjsonDecoder::new();
        decoder.push(b"not valid json\n");

        let result: Result<Option<StreamFrame<String>>, _> = decoder.decode();
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }

    #[test]
    fn test_encode_too_large() {
        let frame = StreamFrame {
            token: "x".repeat(MAX_FRAME_SIZE),
            lsn: 1,
        };
        assert!(matches!(
            encode_frame(&frame),
            Err(RelayError::Transport(_))
        ));
    }

    #[test]
    fn test_decode_unterminated_line_too_large() {
        let mut decoder = NdjsonDecoder::new();
        decoder.push(&vec![b'x'; MAX_FRAME_SIZE + 1]);

        let result: Result<Option<serde_json::Value>, _> = decoder.decode();
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }

    #[test]
    fn test_clear() {
        let mut decoder = NdjsonDecoder::new();
        decoder.push(b"{\"partial\":");
        assert!(decoder.available() > 0);
        decoder.clear();
        assert_eq!(decoder.available(), 0);
    }
}
