use std::collections::VecDeque;
use bytes::{Buf, Bytes, BytesMut};

use crate::{
    error::{ParserError, Result},
    observer::{Observable, Signal},
};
use super::find;

#[derive(Debug, Clone)]
pub enum PopEvent {
    // A status line: +OK or -ERR with the remainder of the line.
    Line { ok: bool, message: String },
    // A dot-terminated payload, terminator excluded.
    Data(Bytes),
}

impl Signal for PopEvent {
    fn name(&self) -> &'static str {
        match self {
            PopEvent::Line { .. } => "line",
            PopEvent::Data(_) => "data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopReply {
    Status { ok: bool, message: String },
    Data(Bytes),
}

// POP3 reply parser. Status lines parse on their own; for commands that
// answer with a multi-line payload (RETR, LIST, UIDL) the owner arms
// expect_data() and the payload accumulates until the CRLF '.' CRLF
// terminator.
pub struct PopParser {
    pending: BytesMut,
    in_data: bool,
    replies: VecDeque<PopReply>,
    pub events: Observable<PopEvent>,
}

impl Default for PopParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PopParser {

    pub fn new() -> Self {
        PopParser {
            pending: BytesMut::new(),
            in_data: false,
            replies: VecDeque::new(),
            events: Observable::new(),
        }
    }

    pub fn expect_data(&mut self) {
        self.in_data = true;
    }

    pub fn parse(&mut self, data: &[u8]) -> Result<usize> {
        self.pending.extend_from_slice(data);
        loop {
            if self.in_data {
                if !self.parse_data()? {
                    break;
                }
            } else if !self.parse_status()? {
                break;
            }
        }
        Ok(data.len())
    }

    pub fn take_replies(&mut self) -> Vec<PopReply> {
        self.replies.drain(..).collect()
    }

    pub fn destroy(&mut self) {
        self.events.destroy();
        self.pending.clear();
        self.replies.clear();
        self.in_data = false;
    }

    fn parse_status(&mut self) -> Result<bool> {
        let at = match find(&self.pending, b"\r\n") {
            Some(at) => at,
            None => return Ok(false),
        };
        let raw = self.pending.split_to(at);
        self.pending.advance(2);
        let line = String::from_utf8_lossy(&raw).into_owned();

        let (ok, rest) = if let Some(rest) = line.strip_prefix("+OK") {
            (true, rest)
        } else if let Some(rest) = line.strip_prefix("-ERR") {
            (false, rest)
        } else {
            return Err(ParserError::InvalidLine(line).into());
        };
        let message = rest.trim_start().to_string();

        self.events.trigger(&PopEvent::Line { ok, message: message.clone() })?;
        self.replies.push_back(PopReply::Status { ok, message });
        Ok(true)
    }

    fn parse_data(&mut self) -> Result<bool> {
        // an empty payload is just the terminator line
        if self.pending.starts_with(b".\r\n") {
            self.pending.advance(3);
            self.finish_data(Bytes::new())?;
            return Ok(true);
        }
        let at = match find(&self.pending, b"\r\n.\r\n") {
            Some(at) => at,
            None => return Ok(false),
        };
        let payload = self.pending.split_to(at).freeze();
        self.pending.advance(5);
        self.finish_data(payload)?;
        Ok(true)
    }

    fn finish_data(&mut self, payload: Bytes) -> Result<()> {
        self.in_data = false;
        self.events.trigger(&PopEvent::Data(payload.clone()))?;
        self.replies.push_back(PopReply::Data(payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lines() {
        let mut parser = PopParser::new();
        parser.parse(b"+OK ready\r\n-ERR no such message\r\n+OK\r\n").unwrap();
        assert_eq!(parser.take_replies(), vec![
            PopReply::Status { ok: true, message: "ready".into() },
            PopReply::Status { ok: false, message: "no such message".into() },
            PopReply::Status { ok: true, message: "".into() },
        ]);
    }

    #[test]
    fn test_multiline_payload() {
        let mut parser = PopParser::new();
        parser.parse(b"+OK 2 octets\r\n").unwrap();
        parser.expect_data();
        parser.parse(b"line one\r\nline two\r\n.\r\n+OK bye\r\n").unwrap();
        assert_eq!(parser.take_replies(), vec![
            PopReply::Status { ok: true, message: "2 octets".into() },
            PopReply::Data(Bytes::from_static(b"line one\r\nline two")),
            PopReply::Status { ok: true, message: "bye".into() },
        ]);
    }

    #[test]
    fn test_split_payload_terminator() {
        let mut parser = PopParser::new();
        parser.expect_data();
        parser.parse(b"body\r\n.").unwrap();
        assert!(parser.take_replies().is_empty());
        parser.parse(b"\r\n").unwrap();
        assert_eq!(parser.take_replies(), vec![PopReply::Data(Bytes::from_static(b"body"))]);
    }

    #[test]
    fn test_empty_payload() {
        let mut parser = PopParser::new();
        parser.expect_data();
        parser.parse(b".\r\n").unwrap();
        assert_eq!(parser.take_replies(), vec![PopReply::Data(Bytes::new())]);
    }

    #[test]
    fn test_bogus_status_line() {
        let mut parser = PopParser::new();
        assert!(parser.parse(b"HELLO\r\n").is_err());
    }
}
