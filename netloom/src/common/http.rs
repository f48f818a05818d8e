use std::collections::HashMap;
use bytes::{Buf, Bytes, BytesMut};

use crate::{
    error::{ParserError, Result},
    observer::{Observable, Signal},
};
use super::find;

pub type HeaderMap = HashMap<String, String>;

// Methods that carry no payload; the message ends right after the headers.
const EMPTY_METHODS: [&str; 2] = ["get", "connect"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http09,
    Http10,
    Http11,
}

// Unknown version strings map conservatively to 1.0 (close after).
fn parse_version(raw: &str) -> Version {
    match raw {
        "HTTP/0.9" => Version::Http09,
        "HTTP/1.1" => Version::Http11,
        _ => Version::Http10,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Line,
    Headers,
    Message,
    Finish,
}

#[derive(Debug, Clone)]
pub enum HttpEvent {
    // Status or request line parsed; details through the accessors.
    Line,
    // Header block parsed, keys lowercased, last write wins.
    Headers(HeaderMap),
    // One chunk of body data, normal or chunked framing.
    Partial(Bytes),
    // End of a non-terminal chunked frame: byte offsets into the message.
    Chunk(usize, usize),
    // Message complete; fires exactly once.
    Data,
}

impl Signal for HttpEvent {
    fn name(&self) -> &'static str {
        match self {
            HttpEvent::Line => "line",
            HttpEvent::Headers(_) => "headers",
            HttpEvent::Partial(_) => "partial",
            HttpEvent::Chunk(..) => "chunk",
            HttpEvent::Data => "data",
        }
    }
}

// Incremental HTTP/1.x parser for both requests and responses. Feed it
// arbitrary byte chunks; events fire as states advance. Not thread safe.
pub struct HttpParser {
    kind: MessageKind,
    store: bool,
    lenient: bool,
    state: State,
    pending: BytesMut,
    headers: HeaderMap,
    message: BytesMut,
    method: Option<String>,
    path: Option<String>,
    version: Option<Version>,
    code: Option<u16>,
    status: Option<String>,
    keep_alive: bool,
    content_l: i64,
    message_l: usize,
    chunked: bool,
    chunk_d: usize,
    chunk_l: usize,
    chunk_s: usize,
    chunk_e: usize,
    body_l: usize,
    pub events: Observable<HttpEvent>,
}

impl HttpParser {

    pub fn new(kind: MessageKind) -> Self {
        HttpParser {
            kind,
            store: false,
            lenient: false,
            state: State::Line,
            pending: BytesMut::new(),
            headers: HeaderMap::new(),
            message: BytesMut::new(),
            method: None,
            path: None,
            version: None,
            code: None,
            status: None,
            keep_alive: false,
            content_l: -1,
            message_l: 0,
            chunked: false,
            chunk_d: 0,
            chunk_l: 0,
            chunk_s: 0,
            chunk_e: 0,
            body_l: 0,
            events: Observable::new(),
        }
    }

    // A parser that accumulates the body in memory for get_message().
    pub fn storing(kind: MessageKind) -> Self {
        let mut parser = Self::new(kind);
        parser.store = true;
        parser
    }

    // Lenient mode accepts LF-only terminators in the line and header block.
    pub fn set_lenient(&mut self, lenient: bool) {
        self.lenient = lenient;
    }

    // Parses one chunk, returning how many of its bytes were consumed. Bytes
    // past the end of a finished message are retained for the next call (and
    // excluded from the count); a finished parser auto-clears first.
    pub fn parse(&mut self, data: &[u8]) -> Result<usize> {
        if self.state == State::Finish {
            self.clear(false);
        }
        self.pending.extend_from_slice(data);
        loop {
            let advanced = match self.state {
                State::Line => self.parse_line()?,
                State::Headers => self.parse_headers()?,
                State::Message => self.parse_message()?,
                State::Finish => break,
            };
            if !advanced {
                break;
            }
        }
        let surplus = if self.state == State::Finish { self.pending.len() } else { 0 };
        Ok(data.len().saturating_sub(surplus))
    }

    // Resets for the next message. Already-initial parsers are a no-op
    // unless forced; pending bytes survive, they belong to what follows.
    pub fn clear(&mut self, force: bool) {
        if !force && self.state == State::Line {
            return;
        }
        self.state = State::Line;
        self.headers.clear();
        self.message.clear();
        self.method = None;
        self.path = None;
        self.version = None;
        self.code = None;
        self.status = None;
        self.keep_alive = false;
        self.content_l = -1;
        self.message_l = 0;
        self.chunked = false;
        self.chunk_d = 0;
        self.chunk_l = 0;
        self.chunk_s = 0;
        self.chunk_e = 0;
        self.body_l = 0;
    }

    pub fn destroy(&mut self) {
        self.events.destroy();
        self.pending.clear();
        self.clear(true);
    }

    // Peer EOF. A body framed by connection close finishes here; returns
    // whether the message is complete.
    pub fn eof(&mut self) -> Result<bool> {
        if self.state == State::Message && !self.chunked && self.content_l < 0 {
            self.state = State::Finish;
            self.events.trigger(&HttpEvent::Data)?;
            return Ok(true);
        }
        Ok(self.state == State::Finish)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.state == State::Finish
    }

    pub fn headers_done(&self) -> bool {
        matches!(self.state, State::Message | State::Finish)
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn get_path(&self) -> &str {
        let path = self.path.as_deref().unwrap_or("");
        path.split('?').next().unwrap_or("")
    }

    pub fn get_query(&self) -> &str {
        let path = self.path.as_deref().unwrap_or("");
        match path.split_once('?') {
            Some((_, query)) => query,
            None => "",
        }
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn code(&self) -> Option<u16> {
        self.code
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn content_length(&self) -> i64 {
        self.content_l
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn get_message(&self) -> &[u8] {
        &self.message
    }

    fn find_line_end(&self) -> Option<(usize, usize)> {
        if self.lenient {
            let at = find(&self.pending, b"\n")?;
            if at > 0 && self.pending[at - 1] == b'\r' {
                Some((at - 1, 2))
            } else {
                Some((at, 1))
            }
        } else {
            find(&self.pending, b"\r\n").map(|at| (at, 2))
        }
    }

    fn parse_line(&mut self) -> Result<bool> {
        let (end, term) = match self.find_line_end() {
            Some(found) => found,
            None => return Ok(false),
        };
        let raw = self.pending.split_to(end);
        self.pending.advance(term);
        let line = String::from_utf8_lossy(&raw).into_owned();

        let mut parts = line.splitn(3, ' ');
        let (first, second, third) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c)) if !a.is_empty() && !b.is_empty() => (a, b, c),
            _ => return Err(ParserError::InvalidStatusLine(line.clone()).into()),
        };

        match self.kind {
            MessageKind::Request => {
                self.method = Some(first.to_ascii_lowercase());
                self.path = Some(second.to_string());
                self.version = Some(parse_version(third));
            }
            MessageKind::Response => {
                self.version = Some(parse_version(first));
                self.code = Some(
                    second
                        .parse()
                        .map_err(|_| ParserError::InvalidStatusLine(line.clone()))?,
                );
                self.status = Some(third.to_string());
            }
        }

        self.state = State::Headers;
        self.events.trigger(&HttpEvent::Line)?;
        Ok(true)
    }

    // (block length, total bytes to consume including the terminator)
    fn find_headers_end(&self) -> Option<(usize, usize)> {
        if self.pending.starts_with(b"\r\n") {
            return Some((0, 2));
        }
        let strict = find(&self.pending, b"\r\n\r\n").map(|at| (at, at + 4));
        if !self.lenient {
            return strict;
        }
        if self.pending.starts_with(b"\n") {
            return Some((0, 1));
        }
        let lax = find(&self.pending, b"\n\n").map(|at| (at, at + 2));
        match (strict, lax) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (found, None) => found,
            (None, found) => found,
        }
    }

    fn parse_headers(&mut self) -> Result<bool> {
        let (end, consume) = match self.find_headers_end() {
            Some(found) => found,
            None => return Ok(false),
        };
        let block = self.pending.split_to(end);
        self.pending.advance(consume - end);

        let text = String::from_utf8_lossy(&block).into_owned();
        for raw in text.split('\n') {
            let raw = raw.trim_end_matches('\r');
            if raw.is_empty() {
                continue;
            }
            let (key, value) = raw
                .split_once(':')
                .ok_or_else(|| ParserError::InvalidHeader(raw.to_string()))?;
            self.headers
                .insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        if let Some(raw) = self.headers.get("content-length") {
            self.content_l = raw
                .parse()
                .map_err(|_| ParserError::InvalidHeader(format!("content-length: {}", raw)))?;
        }
        self.chunked = self
            .headers
            .get("transfer-encoding")
            .map_or(false, |v| v == "chunked");
        self.keep_alive = self
            .headers
            .get("connection")
            .map_or(false, |v| v.eq_ignore_ascii_case("keep-alive"));

        let empty_method = self.kind == MessageKind::Request
            && self.method.as_deref().map_or(false, |m| EMPTY_METHODS.contains(&m));
        if empty_method {
            self.content_l = 0;
        }
        let finished = empty_method || (self.content_l == 0 && !self.chunked);

        self.state = if finished { State::Finish } else { State::Message };
        let map = self.headers.clone();
        self.events.trigger(&HttpEvent::Headers(map))?;
        if finished {
            self.events.trigger(&HttpEvent::Data)?;
        }
        Ok(true)
    }

    fn parse_message(&mut self) -> Result<bool> {
        if self.chunked {
            self.parse_chunked()
        } else {
            self.parse_plain()
        }
    }

    fn parse_plain(&mut self) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }
        let take = if self.content_l >= 0 {
            (self.content_l as usize - self.message_l).min(self.pending.len())
        } else {
            // no declared length: the body runs to EOF
            self.pending.len()
        };
        if take == 0 {
            return Ok(false);
        }
        let data = self.pending.split_to(take).freeze();
        if self.store {
            self.message.extend_from_slice(&data);
        }
        self.message_l += take;
        self.body_l += take;
        self.events.trigger(&HttpEvent::Partial(data))?;
        if self.content_l >= 0 && self.message_l == self.content_l as usize {
            self.state = State::Finish;
            self.events.trigger(&HttpEvent::Data)?;
        }
        Ok(true)
    }

    fn parse_chunked(&mut self) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }

        // chunk boundary: a hex size line, extensions after ';' ignored
        if self.chunk_l == 0 {
            let (end, term) = match self.find_line_end() {
                Some(found) => found,
                None => return Ok(false),
            };
            let raw = self.pending.split_to(end);
            self.pending.advance(term);
            let line = String::from_utf8_lossy(&raw).into_owned();
            let size = line.split(';').next().unwrap_or("").trim();
            self.chunk_d = usize::from_str_radix(size, 16)
                .map_err(|_| ParserError::InvalidChunkSize(line.clone()))?;
            self.chunk_l = self.chunk_d + 2;
            self.chunk_s = self.body_l;
            return Ok(true);
        }

        // chunk payload
        if self.chunk_l > 2 {
            let take = (self.chunk_l - 2).min(self.pending.len());
            let data = self.pending.split_to(take).freeze();
            if self.store {
                self.message.extend_from_slice(&data);
            }
            self.body_l += take;
            self.chunk_l -= take;
            self.events.trigger(&HttpEvent::Partial(data))?;
            return Ok(true);
        }

        // trailing CRLF, possibly split across reads
        let take = self.chunk_l.min(self.pending.len());
        self.pending.advance(take);
        self.chunk_l -= take;
        if self.chunk_l > 0 {
            return Ok(true);
        }
        if self.chunk_d == 0 {
            self.state = State::Finish;
            self.events.trigger(&HttpEvent::Data)?;
        } else {
            self.chunk_e = self.body_l;
            self.events.trigger(&HttpEvent::Chunk(self.chunk_s, self.chunk_e))?;
            if !self.store {
                self.message.clear();
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    fn record(parser: &HttpParser) -> Rc<RefCell<Vec<String>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["line", "headers", "partial", "chunk", "data"] {
            let log = Rc::clone(&log);
            parser.events.bind(name, move |event| {
                let entry = match event {
                    HttpEvent::Partial(data) => {
                        format!("partial:{}", String::from_utf8_lossy(data))
                    }
                    HttpEvent::Chunk(start, end) => format!("chunk:{}..{}", start, end),
                    other => other.name().to_string(),
                };
                log.borrow_mut().push(entry);
                Ok(())
            });
        }
        log
    }

    #[test]
    fn test_request_without_body() {
        let mut parser = HttpParser::storing(MessageKind::Request);
        let log = record(&parser);

        let input = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let consumed = parser.parse(input).unwrap();

        assert_eq!(consumed, input.len());
        assert_eq!(*log.borrow(), vec!["line", "headers", "data"]);
        assert!(parser.is_finished());
        assert_eq!(parser.method(), Some("get"));
        assert_eq!(parser.get_path(), "/");
        assert_eq!(parser.content_length(), 0);
        assert_eq!(parser.headers().get("host").map(String::as_str), Some("a"));
        assert_eq!(parser.version(), Some(Version::Http11));
    }

    #[test]
    fn test_response_chunked_body() {
        let mut parser = HttpParser::storing(MessageKind::Response);
        let log = record(&parser);

        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let body = b"5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n";
        parser.parse(head).unwrap();
        parser.parse(body).unwrap();

        assert_eq!(
            *log.borrow(),
            vec![
                "line",
                "headers",
                "partial:Hello",
                "chunk:0..5",
                "partial: World",
                "chunk:5..11",
                "data",
            ]
        );
        assert_eq!(parser.get_message(), b"Hello World");
        assert_eq!(parser.code(), Some(200));
        assert!(parser.is_chunked());
        assert!(parser.is_finished());
    }

    #[test]
    fn test_split_feed_matches_whole_feed() {
        let whole = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nHello World".to_vec();

        let mut reference = HttpParser::storing(MessageKind::Response);
        let reference_log = record(&reference);
        reference.parse(&whole).unwrap();

        // a coarse three-call split plus a brutal byte-by-byte pass
        for cuts in [vec![7, 22], (1..whole.len()).collect::<Vec<_>>()] {
            let mut parser = HttpParser::storing(MessageKind::Response);
            let log = record(&parser);
            let total = whole.len();
            let mut consumed = 0;
            let mut last = 0;
            for cut in cuts.iter().chain(std::iter::once(&total)) {
                consumed += parser.parse(&whole[last..*cut]).unwrap();
                last = *cut;
            }
            assert_eq!(consumed, whole.len());
            assert_eq!(parser.get_message(), reference.get_message());
            assert_eq!(parser.headers(), reference.headers());
            // partial events may split differently; compare their fusion
            let fuse = |entries: &Vec<String>| {
                let mut out = Vec::new();
                let mut body = String::new();
                for entry in entries {
                    match entry.strip_prefix("partial:") {
                        Some(piece) => body.push_str(piece),
                        None => out.push(entry.clone()),
                    }
                }
                (out, body)
            };
            assert_eq!(fuse(&log.borrow()), fuse(&reference_log.borrow()));
        }
    }

    #[test]
    fn test_chunked_split_inside_size_line() {
        let mut parser = HttpParser::storing(MessageKind::Response);
        parser.parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();

        // straddle the chunk-size CRLF and the trailing CRLF
        for piece in [&b"5"[..], b"\r", b"\nHel", b"lo", b"\r", b"\n0\r\n\r", b"\n"] {
            parser.parse(piece).unwrap();
        }
        assert!(parser.is_finished());
        assert_eq!(parser.get_message(), b"Hello");
    }

    #[test]
    fn test_pipelined_requests_share_a_call() {
        let mut parser = HttpParser::new(MessageKind::Request);
        let first = b"GET /a HTTP/1.1\r\nHost: a\r\n\r\n";
        let second = b"GET /b HTTP/1.1\r\nHost: b\r\n\r\n";
        let mut input = first.to_vec();
        input.extend_from_slice(second);

        let consumed = parser.parse(&input).unwrap();
        assert_eq!(consumed, first.len());
        assert_eq!(parser.get_path(), "/a");

        // the retained surplus parses as the next message on its own
        let consumed = parser.parse(b"").unwrap();
        assert_eq!(consumed, 0);
        assert_eq!(parser.get_path(), "/b");
        assert!(parser.is_finished());
    }

    #[test]
    fn test_body_framed_by_eof() {
        let mut parser = HttpParser::storing(MessageKind::Response);
        parser.parse(b"HTTP/1.0 200 OK\r\nServer: x\r\n\r\npartial bo").unwrap();
        parser.parse(b"dy").unwrap();
        assert!(!parser.is_finished());
        assert!(parser.eof().unwrap());
        assert_eq!(parser.get_message(), b"partial body");
    }

    #[test]
    fn test_get_query_split() {
        let mut parser = HttpParser::new(MessageKind::Request);
        parser.parse(b"GET /search?q=torrent HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(parser.get_path(), "/search");
        assert_eq!(parser.get_query(), "q=torrent");
    }

    #[test]
    fn test_unknown_version_maps_to_http10() {
        let mut parser = HttpParser::new(MessageKind::Request);
        parser.parse(b"GET / HTTP/9.9\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(parser.version(), Some(Version::Http10));
        assert!(!parser.keep_alive());
    }

    #[test]
    fn test_lenient_accepts_bare_lf() {
        let mut parser = HttpParser::storing(MessageKind::Response);
        parser.set_lenient(true);
        parser.parse(b"HTTP/1.1 200 OK\nContent-Length: 2\n\nok").unwrap();
        assert!(parser.is_finished());
        assert_eq!(parser.get_message(), b"ok");
    }

    #[test]
    fn test_strict_rejects_malformed_lines() {
        let mut parser = HttpParser::new(MessageKind::Request);
        assert!(parser.parse(b"BOGUS\r\n").is_err());

        let mut parser = HttpParser::new(MessageKind::Request);
        assert!(parser.parse(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n").is_err());

        let mut parser = HttpParser::storing(MessageKind::Response);
        parser.parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        assert!(parser.parse(b"zz\r\n").is_err());
    }

    #[test]
    fn test_keep_alive_header() {
        let mut parser = HttpParser::new(MessageKind::Request);
        parser.parse(b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n").unwrap();
        assert!(parser.keep_alive());
    }

    #[test]
    fn test_duplicate_headers_last_wins() {
        let mut parser = HttpParser::new(MessageKind::Request);
        parser.parse(b"GET / HTTP/1.1\r\nX-Tag: one\r\nX-Tag: two\r\n\r\n").unwrap();
        assert_eq!(parser.headers().get("x-tag").map(String::as_str), Some("two"));
    }

    #[test]
    fn test_clear_is_noop_unless_forced() {
        let mut parser = HttpParser::new(MessageKind::Request);
        parser.parse(b"GET / HT").unwrap();
        parser.clear(false);
        // still mid-line: the rest of the message completes it
        parser.parse(b"TP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert!(parser.is_finished());

        parser.clear(true);
        assert!(!parser.is_finished());
    }
}
