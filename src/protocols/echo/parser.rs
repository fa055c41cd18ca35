//! Echo protocol parser.

use bytes::BytesMut;

use crate::protocols::find_crlf;

/// Longest length line accepted before the CRLF.
const MAX_HEADER_LENGTH: usize = 20;

/// Parsed echo command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Echo data back (header consumed, data follows).
    Echo {
        /// Length of data to echo.
        length: usize,
        /// Bytes consumed by the header (length + \r\n).
        header_len: usize,
    },
    /// Quit command.
    Quit,
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed command.
    Complete(Command),
    /// Need more data for header.
    Incomplete,
    /// Invalid length format.
    InvalidLength,
}

/// Parse an echo protocol command from the input buffer.
///
/// For Echo commands, the caller must wait for `length` bytes of payload
/// after the header before replying.
pub fn parse(input: &[u8]) -> ParseResult {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_HEADER_LENGTH => return ParseResult::InvalidLength,
        None => return ParseResult::Incomplete,
    };

    let line = &input[..line_end];

    if line.eq_ignore_ascii_case(b"QUIT") {
        return ParseResult::Complete(Command::Quit);
    }

    if line.is_empty() || !line.iter().all(u8::is_ascii_digit) {
        return ParseResult::InvalidLength;
    }

    let length = match std::str::from_utf8(line).ok().and_then(|s| s.parse().ok()) {
        Some(len) => len,
        None => return ParseResult::InvalidLength,
    };

    ParseResult::Complete(Command::Echo {
        length,
        header_len: line_end + 2,
    })
}

/// Append the echo reply for `payload`.
pub fn write_response(payload: &[u8], output: &mut BytesMut) {
    let header = format!("{}\r\n", payload.len());
    output.reserve(header.len() + payload.len());
    output.extend_from_slice(header.as_bytes());
    output.extend_from_slice(payload);
}

/// Format an error response.
pub fn response_error(msg: &str) -> Vec<u8> {
    format!("ERROR {msg}\r\n").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_echo() {
        match parse(b"100\r\n") {
            ParseResult::Complete(Command::Echo { length, header_len }) => {
                assert_eq!(length, 100);
                assert_eq!(header_len, 5);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_quit() {
        match parse(b"QUIT\r\n") {
            ParseResult::Complete(Command::Quit) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_incomplete() {
        match parse(b"100") {
            ParseResult::Incomplete => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_length() {
        for input in [&b"abc\r\n"[..], b"+5\r\n", b"\r\n", b"123456789012345678901"] {
            match parse(input) {
                ParseResult::InvalidLength => {}
                other => panic!("unexpected for {:?}: {:?}", input, other),
            }
        }
    }

    #[test]
    fn test_write_response() {
        let mut buf = BytesMut::new();
        write_response(b"hello", &mut buf);
        assert_eq!(&buf[..], b"5\r\nhello");
    }
}
