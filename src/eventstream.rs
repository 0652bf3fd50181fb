//! Decoder for the AWS event-stream binary framing used by
//! `InvokeModelWithResponseStream`.
//!
//! ```text
//! +-----------+-------------+-------------+---------+---------+-------------+
//! | total_len | headers_len | prelude_crc | headers | payload | message_crc |
//! |  u32 BE   |   u32 BE    |   u32 BE    |         |         |   u32 BE    |
//! +-----------+-------------+-------------+---------+---------+-------------+
//! ```

use hyper::body::Bytes;
use std::collections::HashMap;
use thiserror::Error;

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
/// Smallest possible frame: prelude plus trailing checksum.
pub const MIN_FRAME_LEN: usize = PRELUDE_LEN + CRC_LEN;
/// Largest frame Bedrock emits is well below this.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("prelude checksum mismatch")]
    PreludeChecksum,

    #[error("message checksum mismatch")]
    MessageChecksum,

    #[error("frame length {0} is shorter than the minimum")]
    FrameTooShort(usize),

    #[error("frame length {0} exceeds the maximum of {MAX_FRAME_LEN} bytes")]
    FrameTooLarge(usize),

    #[error("header section of {headers_len} bytes overflows frame of {total_len} bytes")]
    HeaderOverflow { headers_len: usize, total_len: usize },

    #[error("header truncated while reading {0}")]
    TruncatedHeader(&'static str),

    #[error("unknown header value type {0}")]
    UnknownHeaderType(u8),

    #[error("header is not valid UTF-8")]
    InvalidUtf8,

    #[error("stream ended with {0} bytes of an incomplete frame")]
    TruncatedStream(usize),
}

/// One decoded message. Only string-typed headers are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: HashMap<String, String>,
    pub payload: Bytes,
}

impl Frame {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.header(":message-type")
    }

    pub fn event_type(&self) -> Option<&str> {
        self.header(":event-type")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(":content-type")
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.header(":exception-type")
    }
}

/// Incremental frame decoder.
///
/// Feed upstream chunks with [`push`](Self::push) and drain complete frames
/// with [`next_frame`](Self::next_frame). Holds at most one partial frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decode the next complete frame, or `None` if more input is needed.
    ///
    /// Errors are not recoverable: the stream position is lost once a
    /// length or checksum is wrong.
    pub fn next_frame(&mut self) -> Option<Result<Frame, DecodeError>> {
        if self.buffer.len() < PRELUDE_LEN {
            return None;
        }

        let total_len = read_u32(&self.buffer[0..4]) as usize;
        let headers_len = read_u32(&self.buffer[4..8]) as usize;
        let prelude_crc = read_u32(&self.buffer[8..12]);

        if crc32fast::hash(&self.buffer[0..8]) != prelude_crc {
            return Some(Err(DecodeError::PreludeChecksum));
        }
        if total_len < MIN_FRAME_LEN {
            return Some(Err(DecodeError::FrameTooShort(total_len)));
        }
        if total_len > MAX_FRAME_LEN {
            return Some(Err(DecodeError::FrameTooLarge(total_len)));
        }
        if PRELUDE_LEN + headers_len + CRC_LEN > total_len {
            return Some(Err(DecodeError::HeaderOverflow {
                headers_len,
                total_len,
            }));
        }
        if self.buffer.len() < total_len {
            return None;
        }

        let message: Vec<u8> = self.buffer.drain(..total_len).collect();
        let crc_offset = total_len - CRC_LEN;
        if crc32fast::hash(&message[..crc_offset]) != read_u32(&message[crc_offset..]) {
            return Some(Err(DecodeError::MessageChecksum));
        }

        let headers_end = PRELUDE_LEN + headers_len;
        let headers = match parse_headers(&message[PRELUDE_LEN..headers_end]) {
            Ok(headers) => headers,
            Err(e) => return Some(Err(e)),
        };
        let payload = Bytes::copy_from_slice(&message[headers_end..crc_offset]);

        Some(Ok(Frame { headers, payload }))
    }

    /// Called once the upstream body is exhausted.
    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TruncatedStream(self.buffer.len()))
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn parse_headers(bytes: &[u8]) -> Result<HashMap<String, String>, DecodeError> {
    let mut headers = HashMap::new();
    let mut idx = 0usize;

    let take = |idx: &mut usize, len: usize, what: &'static str| -> Result<std::ops::Range<usize>, DecodeError> {
        let end = idx
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or(DecodeError::TruncatedHeader(what))?;
        let range = *idx..end;
        *idx = end;
        Ok(range)
    };

    while idx < bytes.len() {
        let name_len = bytes[take(&mut idx, 1, "name length")?][0] as usize;
        let name = std::str::from_utf8(&bytes[take(&mut idx, name_len, "name")?])
            .map_err(|_| DecodeError::InvalidUtf8)?;
        let value_type = bytes[take(&mut idx, 1, "value type")?][0];

        match value_type {
            // bool true / bool false carry no value bytes
            0 | 1 => {}
            2 => {
                take(&mut idx, 1, "byte")?;
            }
            3 => {
                take(&mut idx, 2, "short")?;
            }
            4 => {
                take(&mut idx, 4, "int")?;
            }
            5 => {
                take(&mut idx, 8, "long")?;
            }
            6 | 7 => {
                let len_range = take(&mut idx, 2, "value length")?;
                let len = u16::from_be_bytes([bytes[len_range.start], bytes[len_range.start + 1]]);
                let value = &bytes[take(&mut idx, len as usize, "value")?];
                if value_type == 7 {
                    let value = std::str::from_utf8(value).map_err(|_| DecodeError::InvalidUtf8)?;
                    headers.insert(name.to_string(), value.to_string());
                }
            }
            8 => {
                take(&mut idx, 8, "timestamp")?;
            }
            9 => {
                take(&mut idx, 16, "uuid")?;
            }
            other => return Err(DecodeError::UnknownHeaderType(other)),
        }
    }

    Ok(headers)
}

/// Encode a frame with string headers. Used to build upstream fixtures.
#[cfg(test)]
pub(crate) fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.push(name.len() as u8);
        header_bytes.extend_from_slice(name.as_bytes());
        header_bytes.push(7);
        header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_bytes.extend_from_slice(value.as_bytes());
    }

    let total_len = (PRELUDE_LEN + header_bytes.len() + payload.len() + CRC_LEN) as u32;
    let mut frame = Vec::with_capacity(total_len as usize);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    let prelude_crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&prelude_crc.to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    let message_crc = crc32fast::hash(&frame);
    frame.extend_from_slice(&message_crc.to_be_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_frame(payload: &[u8]) -> Vec<u8> {
        encode_frame(
            &[
                (":message-type", "event"),
                (":event-type", "chunk"),
                (":content-type", "application/json"),
            ],
            payload,
        )
    }

    #[test]
    fn test_decode_single_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&chunk_frame(b"{\"bytes\":\"e30=\"}"));

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.message_type(), Some("event"));
        assert_eq!(frame.event_type(), Some("chunk"));
        assert_eq!(frame.content_type(), Some("application/json"));
        assert_eq!(frame.exception_type(), None);
        assert_eq!(&frame.payload[..], b"{\"bytes\":\"e30=\"}");
        assert!(decoder.next_frame().is_none());
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let bytes = chunk_frame(b"hello");
        let mut decoder = FrameDecoder::new();

        for (i, b) in bytes.iter().enumerate() {
            decoder.push(std::slice::from_ref(b));
            let next = decoder.next_frame();
            if i + 1 < bytes.len() {
                assert!(next.is_none(), "frame decoded early at byte {}", i);
            } else {
                assert_eq!(&next.unwrap().unwrap().payload[..], b"hello");
            }
        }
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decode_preserves_order() {
        let mut stream = chunk_frame(b"one");
        stream.extend(chunk_frame(b"two"));
        stream.extend(chunk_frame(b"three"));

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);

        let payloads: Vec<Vec<u8>> = std::iter::from_fn(|| decoder.next_frame())
            .map(|f| f.unwrap().payload.to_vec())
            .collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn test_empty_frame_is_minimum_length() {
        let bytes = encode_frame(&[], b"");
        assert_eq!(bytes.len(), MIN_FRAME_LEN);

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert!(frame.headers.is_empty());
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_prelude_checksum_mismatch() {
        let mut bytes = chunk_frame(b"payload");
        bytes[8] ^= 0xff;

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.next_frame(), Some(Err(DecodeError::PreludeChecksum)));
    }

    #[test]
    fn test_message_checksum_mismatch() {
        let mut bytes = chunk_frame(b"payload");
        let last = bytes.len() - 5;
        bytes[last] ^= 0x01;

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert_eq!(decoder.next_frame(), Some(Err(DecodeError::MessageChecksum)));
    }

    fn prelude(total_len: u32, headers_len: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&total_len.to_be_bytes());
        bytes.extend_from_slice(&headers_len.to_be_bytes());
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        bytes
    }

    #[test]
    fn test_frame_too_short() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&prelude(8, 0));
        assert_eq!(decoder.next_frame(), Some(Err(DecodeError::FrameTooShort(8))));
    }

    #[test]
    fn test_frame_too_large() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&prelude(MAX_FRAME_LEN as u32 + 1, 0));
        assert_eq!(
            decoder.next_frame(),
            Some(Err(DecodeError::FrameTooLarge(MAX_FRAME_LEN + 1)))
        );
    }

    #[test]
    fn test_header_overflow() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&prelude(32, 100));
        assert_eq!(
            decoder.next_frame(),
            Some(Err(DecodeError::HeaderOverflow {
                headers_len: 100,
                total_len: 32
            }))
        );
    }

    #[test]
    fn test_non_string_headers_are_skipped() {
        let mut headers = Vec::new();
        // bool true
        headers.push(4u8);
        headers.extend_from_slice(b"flag");
        headers.push(0);
        // int
        headers.push(5u8);
        headers.extend_from_slice(b"count");
        headers.push(4);
        headers.extend_from_slice(&7u32.to_be_bytes());
        // string
        headers.push(13u8);
        headers.extend_from_slice(b":message-type");
        headers.push(7);
        headers.extend_from_slice(&5u16.to_be_bytes());
        headers.extend_from_slice(b"event");

        let parsed = parse_headers(&headers).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[":message-type"], "event");
    }

    #[test]
    fn test_unknown_header_type() {
        let headers = [1u8, b'x', 42];
        assert_eq!(parse_headers(&headers), Err(DecodeError::UnknownHeaderType(42)));
    }

    #[test]
    fn test_truncated_header_value() {
        let headers = [1u8, b'x', 7, 0, 10, b'a', b'b'];
        assert_eq!(parse_headers(&headers), Err(DecodeError::TruncatedHeader("value")));
    }

    #[test]
    fn test_invalid_utf8_header() {
        let headers = [1u8, b'x', 7, 0, 2, 0xff, 0xfe];
        assert_eq!(parse_headers(&headers), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_finish_with_partial_frame() {
        let bytes = chunk_frame(b"payload");
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes[..bytes.len() - 3]);

        assert!(decoder.next_frame().is_none());
        assert_eq!(
            decoder.finish(),
            Err(DecodeError::TruncatedStream(bytes.len() - 3))
        );
    }
}
