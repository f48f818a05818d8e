use std::{cell::RefCell, io, net::SocketAddr, rc::Rc};
use mio::Token;

use crate::{
    base::client::Datagram,
    common::http::{HeaderMap, HttpParser, MessageKind},
    error::Result,
    observer::{Observable, Signal},
    reactor::{Agent, Owner, Reactor},
};

// Well-known SSDP multicast endpoint.
pub const SSDP_HOST: [u8; 4] = [239, 255, 255, 250];
pub const SSDP_PORT: u16 = 1900;

pub const DEFAULT_MX: u32 = 3;

#[derive(Debug, Clone)]
pub enum SsdpEvent {
    // A discovery response parsed far enough to expose its header block.
    Headers { code: u16, headers: HeaderMap },
}

impl Signal for SsdpEvent {
    fn name(&self) -> &'static str {
        match self {
            SsdpEvent::Headers { .. } => "headers",
        }
    }
}

// UDP discovery client: multicasts M-SEARCH probes and surfaces each
// response's headers. Every datagram is a self-contained HTTP response, so
// each one gets a fresh parser.
pub struct SsdpClient {
    socket: Datagram,
    pub events: Observable<SsdpEvent>,
}

impl SsdpClient {

    pub fn new() -> io::Result<Self> {
        Ok(SsdpClient {
            socket: Datagram::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?,
            events: Observable::new(),
        })
    }

    pub fn open(this: &Rc<RefCell<Self>>, reactor: &mut Reactor) -> io::Result<Token> {
        let owner: Owner = this.clone();
        this.borrow_mut().socket.open(reactor, owner)
    }

    pub fn discover(&mut self, reactor: &mut Reactor, target: &str) -> Result<()> {
        self.discover_mx(reactor, target, DEFAULT_MX)
    }

    pub fn discover_mx(&mut self, reactor: &mut Reactor, target: &str, mx: u32) -> Result<()> {
        let host = SocketAddr::from((SSDP_HOST, SSDP_PORT));
        tracing::debug!("ssdp discover {}", target);
        let probe = build_msearch(target, host, mx);
        self.socket.send_to(reactor, probe.into_bytes(), host)?;
        Ok(())
    }

    pub fn close(&mut self, reactor: &mut Reactor) {
        self.socket.close(reactor);
        self.events.destroy();
    }
}

pub fn build_msearch(target: &str, host: SocketAddr, mx: u32) -> String {
    let mut out = String::new();
    out.push_str("M-SEARCH * HTTP/1.1\r\n");
    out.push_str(&format!("HOST: {}\r\n", host));
    out.push_str("MAN: \"ssdp:discover\"\r\n");
    out.push_str(&format!("MX: {}\r\n", mx));
    out.push_str(&format!("ST: {}\r\n", target));
    out.push_str("\r\n");
    out
}

impl Agent for SsdpClient {

    fn on_readable(&mut self, _reactor: &mut Reactor, _token: Token) -> Result<()> {
        for (datagram, from) in self.socket.handle_readable() {
            let mut parser = HttpParser::new(MessageKind::Response);
            if let Err(e) = parser.parse(&datagram) {
                tracing::warn!("ssdp response from {} failed to parse: {}", from, e);
                continue;
            }
            if !parser.headers_done() {
                tracing::warn!("ssdp response from {} truncated", from);
                continue;
            }
            self.events.trigger(&SsdpEvent::Headers {
                code: parser.code().unwrap_or(0),
                headers: parser.headers().clone(),
            })?;
        }
        Ok(())
    }

    fn on_writable(&mut self, reactor: &mut Reactor, _token: Token) -> Result<()> {
        self.socket.handle_writable(reactor)?;
        Ok(())
    }

    fn on_error(&mut self, reactor: &mut Reactor, token: Token) {
        tracing::warn!("ssdp socket {:?} failed", token);
        self.socket.close(reactor);
    }
}
