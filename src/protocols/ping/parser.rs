//! Ping protocol parser.

use bytes::BytesMut;

use crate::protocols::find_crlf;

/// Longest command line accepted.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Parsed ping command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Simple ping (no message).
    Ping,
    /// Ping with a message to echo back.
    PingMsg(&'a [u8]),
    /// Quit command.
    Quit,
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult<'a> {
    /// Successfully parsed command with bytes consumed.
    Complete(Command<'a>, usize),
    /// Need more data.
    Incomplete,
    /// Protocol error (unknown command or overlong line).
    Error,
}

/// Parse a ping protocol command from the input buffer.
pub fn parse(input: &[u8]) -> ParseResult<'_> {
    let line_end = match find_crlf(input) {
        Some(pos) if pos <= MAX_LINE_LENGTH => pos,
        Some(_) => return ParseResult::Error,
        None if input.len() > MAX_LINE_LENGTH => return ParseResult::Error,
        None => return ParseResult::Incomplete,
    };

    let line = &input[..line_end];
    let consumed = line_end + 2;

    if line.eq_ignore_ascii_case(b"PING") {
        ParseResult::Complete(Command::Ping, consumed)
    } else if line.eq_ignore_ascii_case(b"QUIT") {
        ParseResult::Complete(Command::Quit, consumed)
    } else if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        ParseResult::Complete(Command::PingMsg(&line[5..]), consumed)
    } else {
        ParseResult::Error
    }
}

/// Append the reply to `cmd`.
pub fn write_response(cmd: &Command<'_>, output: &mut BytesMut) {
    match cmd {
        Command::Ping => output.extend_from_slice(b"PONG\r\n"),
        Command::PingMsg(msg) => {
            output.reserve(7 + msg.len());
            output.extend_from_slice(b"PONG ");
            output.extend_from_slice(msg);
            output.extend_from_slice(b"\r\n");
        }
        Command::Quit => output.extend_from_slice(b"OK\r\n"),
    }
}

/// Format an error response.
pub fn response_error() -> &'static [u8] {
    b"ERROR unknown command\r\n"
}
