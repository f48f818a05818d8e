use std::collections::VecDeque;
use bytes::{Buf, BytesMut};

use crate::{
    error::Result,
    observer::{Observable, Signal},
};
use super::find;

// One CRLF-terminated line, either side of the protocol: a server reply
// ("NNN text" final, "NNN-text" continuation) or a client command
// ("VERB [args]").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpLine {
    pub code: String,
    pub message: String,
    pub is_final: bool,
}

#[derive(Debug, Clone)]
pub enum FtpEvent {
    Line(FtpLine),
}

impl Signal for FtpEvent {
    fn name(&self) -> &'static str {
        match self {
            FtpEvent::Line(_) => "line",
        }
    }
}

pub struct FtpParser {
    pending: BytesMut,
    lines: VecDeque<FtpLine>,
    pub events: Observable<FtpEvent>,
}

impl Default for FtpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FtpParser {

    pub fn new() -> Self {
        FtpParser {
            pending: BytesMut::new(),
            lines: VecDeque::new(),
            events: Observable::new(),
        }
    }

    pub fn parse(&mut self, data: &[u8]) -> Result<usize> {
        self.pending.extend_from_slice(data);
        while let Some(at) = find(&self.pending, b"\r\n") {
            let raw = self.pending.split_to(at);
            self.pending.advance(2);
            let line = split_line(&String::from_utf8_lossy(&raw));
            self.events.trigger(&FtpEvent::Line(line.clone()))?;
            self.lines.push_back(line);
        }
        Ok(data.len())
    }

    // Complete lines accumulated since the last drain.
    pub fn take_lines(&mut self) -> Vec<FtpLine> {
        self.lines.drain(..).collect()
    }

    pub fn destroy(&mut self) {
        self.events.destroy();
        self.pending.clear();
        self.lines.clear();
    }
}

fn split_line(line: &str) -> FtpLine {
    let bytes = line.as_bytes();
    // reply form: three digits followed by a space or a dash
    if bytes.len() >= 4
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && (bytes[3] == b' ' || bytes[3] == b'-')
    {
        return FtpLine {
            code: line[..3].to_string(),
            message: line[4..].to_string(),
            is_final: bytes[3] == b' ',
        };
    }
    if bytes.len() == 3 && bytes.iter().all(u8::is_ascii_digit) {
        return FtpLine {
            code: line.to_string(),
            message: String::new(),
            is_final: true,
        };
    }
    // command form
    match line.split_once(' ') {
        Some((verb, rest)) => FtpLine {
            code: verb.to_string(),
            message: rest.trim().to_string(),
            is_final: true,
        },
        None => FtpLine {
            code: line.to_string(),
            message: String::new(),
            is_final: true,
        },
    }
}
