//! Encoder and decoder for Language Server Protocol base-protocol messages.

use std::error::Error;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io::{Error as IoError, Write};
use std::str::{self, Utf8Error};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Total header block size we are willing to buffer before declaring the
/// stream corrupt. Real servers emit two short lines at most.
const MAX_HEADER_BYTES: usize = 4096;

/// Errors that can occur when processing an LSP frame.
#[derive(Debug)]
pub enum ParseError {
    /// Frame lacks the required `Content-Length` header.
    MissingHeader,
    /// The value of the `Content-Length` header is not a valid length.
    InvalidLength,
    /// Failed to encode the frame.
    Encode(IoError),
    /// Frame body contains invalid UTF8.
    Utf8(Utf8Error),
}

impl Display for ParseError {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        match *self {
            ParseError::MissingHeader => write!(fmt, "missing required `Content-Length` header"),
            ParseError::InvalidLength => write!(fmt, "unable to parse content length"),
            ParseError::Encode(ref e) => write!(fmt, "failed to encode frame: {}", e),
            ParseError::Utf8(ref e) => write!(fmt, "frame contains invalid UTF8: {}", e),
        }
    }
}

impl Error for ParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            ParseError::Encode(ref e) => Some(e),
            ParseError::Utf8(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for ParseError {
    fn from(error: IoError) -> Self {
        ParseError::Encode(error)
    }
}

impl From<Utf8Error> for ParseError {
    fn from(error: Utf8Error) -> Self {
        ParseError::Utf8(error)
    }
}

/// Encodes and decodes Language Server Protocol frames.
///
/// Decoding tolerates header lines in any order, arbitrary whitespace around
/// the colon, and ignores every header other than `Content-Length`
/// (`Content-Type` included). Bodies are read to exactly the advertised
/// length, however large.
///
/// # Encoding
///
/// If the message length is zero, then the codec will skip encoding the
/// message.
#[derive(Clone, Debug, Default)]
pub struct LanguageServerCodec {
    known_frame_len: usize,
}

impl Encoder<String> for LanguageServerCodec {
    type Error = ParseError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if !item.is_empty() {
            // Reserve enough space for the header constants, the rendered
            // length, and the body.
            dst.reserve(item.len() + number_of_digits(item.len()) + 20);
            let mut writer = dst.writer();
            write!(writer, "Content-Length: {}\r\n\r\n{}", item.len(), item)?;
            writer.flush()?;
        }

        Ok(())
    }
}

#[inline]
fn number_of_digits(mut n: usize) -> usize {
    let mut num_digits = 0;

    while n > 0 {
        n /= 10;
        num_digits += 1;
    }

    num_digits
}

impl Decoder for LanguageServerCodec {
    type Item = String;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.known_frame_len > src.len() {
            return Ok(None);
        }

        let header_len = match memchr::memmem::find(src, b"\r\n\r\n") {
            Some(idx) => idx + 4,
            None if src.len() > MAX_HEADER_BYTES => return Err(ParseError::MissingHeader),
            None => return Ok(None),
        };

        let content_len = parse_content_length(&src[..header_len])?;
        let total = header_len + content_len;
        if src.len() < total {
            // Remember the full frame length so subsequent polls skip header
            // parsing, and make sure the buffer can hold the whole body.
            self.known_frame_len = total;
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let body = src.split_to(content_len);
        self.known_frame_len = 0;

        let message = str::from_utf8(&body)?.to_string();
        Ok(Some(message))
    }
}

/// Extracts the `Content-Length` value from a complete header block.
fn parse_content_length(header: &[u8]) -> Result<usize, ParseError> {
    let text = str::from_utf8(header)?;

    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidLength);
        }
    }

    Err(ParseError::MissingHeader)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    fn encoded(body: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body)
    }

    #[test]
    fn encode_and_decode() {
        let decoded = r#"{"jsonrpc":"2.0","method":"exit"}"#.to_string();
        let encoded = encoded(&decoded);

        let mut codec = LanguageServerCodec::default();
        let mut buffer = BytesMut::new();
        codec.encode(decoded.clone(), &mut buffer).unwrap();
        assert_eq!(buffer, BytesMut::from(encoded.as_str()));

        let mut buffer = BytesMut::from(encoded.as_str());
        let message = codec.decode(&mut buffer).unwrap();
        assert_eq!(message, Some(decoded));
    }

    #[test]
    fn skip_encoding_empty_message() {
        let mut codec = LanguageServerCodec::default();
        let mut buffer = BytesMut::new();
        codec.encode("".to_string(), &mut buffer).unwrap();
        assert_eq!(buffer, BytesMut::new());
    }

    #[test]
    fn decodes_optional_content_type() {
        let decoded = r#"{"jsonrpc":"2.0","method":"exit"}"#.to_string();
        let content_type = "Content-Type: application/vscode-jsonrpc; charset=utf-8";
        let encoded = format!(
            "Content-Length: {}\r\n{}\r\n\r\n{}",
            decoded.len(),
            content_type,
            decoded
        );

        let mut codec = LanguageServerCodec::default();
        let mut buffer = BytesMut::from(encoded.as_str());
        let message = codec.decode(&mut buffer).unwrap();
        assert_eq!(message, Some(decoded));
    }

    #[test]
    fn decodes_headers_in_any_order_with_loose_whitespace() {
        let decoded = r#"{"jsonrpc":"2.0","method":"exit"}"#.to_string();
        let encoded = format!(
            "Content-Type: application/vscode-jsonrpc\r\ncontent-length  :   {}  \r\n\r\n{}",
            decoded.len(),
            decoded
        );

        let mut codec = LanguageServerCodec::default();
        let mut buffer = BytesMut::from(encoded.as_str());
        let message = codec.decode(&mut buffer).unwrap();
        assert_eq!(message, Some(decoded));
    }

    #[test]
    fn decodes_incrementally_fed_frame() {
        let decoded = r#"{"jsonrpc":"2.0","method":"initialized","params":{}}"#.to_string();
        let encoded = encoded(&decoded);
        let (head, tail) = encoded.split_at(encoded.len() / 2);

        let mut codec = LanguageServerCodec::default();
        let mut buffer = BytesMut::from(head);
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(tail.as_bytes());
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(decoded));
    }

    #[test]
    fn decodes_multiple_frames_from_one_buffer() {
        let first = r#"{"jsonrpc":"2.0","id":1,"result":null}"#.to_string();
        let second = r#"{"jsonrpc":"2.0","id":2,"result":{}}"#.to_string();
        let mut buffer =
            BytesMut::from(format!("{}{}", encoded(&first), encoded(&second)).as_str());

        let mut codec = LanguageServerCodec::default();
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(second));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn rejects_missing_content_length() {
        let body = r#"{"jsonrpc":"2.0"}"#;
        let encoded = format!("Content-Type: application/vscode-jsonrpc\r\n\r\n{}", body);

        let mut codec = LanguageServerCodec::default();
        let mut buffer = BytesMut::from(encoded.as_str());
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(ParseError::MissingHeader)
        ));
    }

    #[test]
    fn rejects_unparsable_content_length() {
        let encoded = "Content-Length: not-a-number\r\n\r\n{}";

        let mut codec = LanguageServerCodec::default();
        let mut buffer = BytesMut::from(encoded);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(ParseError::InvalidLength)
        ));
    }

    #[test]
    fn large_body_is_not_truncated() {
        let decoded = format!(
            r#"{{"jsonrpc":"2.0","method":"x","params":"{}"}}"#,
            "a".repeat(512 * 1024)
        );
        let encoded = encoded(&decoded);

        let mut codec = LanguageServerCodec::default();
        let mut buffer = BytesMut::from(encoded.as_str());
        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(decoded));
    }
}
