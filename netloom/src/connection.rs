use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
};
use bytes::{Bytes, BytesMut};
use mio::{event::Source, Interest, Token};

use crate::{
    error::{ConnectionError, Result},
    observer::{Observable, Signal},
    reactor::Reactor,
};

// The pluggable byte-stream seam: anything pollable that reads and writes.
// A TLS implementation wraps a plain stream behind this trait and the
// reactor treats it opaquely.
pub trait Transport: Read + Write {
    fn source_mut(&mut self) -> &mut dyn Source;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn shutdown_write(&self) -> io::Result<()>;

    // Pending asynchronous connect error, if any.
    fn take_socket_error(&self) -> io::Result<Option<io::Error>>;
}

impl Transport for mio::net::TcpStream {
    fn source_mut(&mut self) -> &mut dyn Source {
        self
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::local_addr(self)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn take_socket_error(&self) -> io::Result<Option<io::Error>> {
        self.take_error()
    }
}

// Strictly monotone: Pending -> Open -> Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Pending,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub enum ConnEvent {
    Open,
    Close,
    Error,
}

impl Signal for ConnEvent {
    fn name(&self) -> &'static str {
        match self {
            ConnEvent::Open => "open",
            ConnEvent::Close => "close",
            ConnEvent::Error => "error",
        }
    }
}

// Identifies a queued chunk whose full flush the owner wants to hear about.
pub type SendTag = u64;

struct Outbound {
    data: Bytes,
    sent: usize,
    tag: Option<SendTag>,
}

pub struct ReadOutcome {
    pub data: Bytes,
    pub eof: bool,
}

pub struct WriteOutcome {
    // Tags of chunks fully flushed by this writable event.
    pub flushed: Vec<SendTag>,
    // Set when a deferred close completed after the queue drained.
    pub closed: bool,
}

pub struct Connection {
    transport: Box<dyn Transport>,
    token: Token,
    peer: SocketAddr,
    status: Status,
    queue: VecDeque<Outbound>,
    interest: Interest,
    closing: bool,
    interest_dirty: bool,
    pub events: Observable<ConnEvent>,
}

impl Connection {

    // A connection handed over by an accept call; already established.
    pub fn accepted(transport: Box<dyn Transport>, token: Token, peer: SocketAddr) -> Self {
        Connection {
            transport,
            token,
            peer,
            status: Status::Open,
            queue: VecDeque::new(),
            interest: Interest::READABLE,
            closing: false,
            interest_dirty: false,
            events: Observable::new(),
        }
    }

    // An in-progress outbound connect; Open on the first writable event.
    pub fn pending(transport: Box<dyn Transport>, token: Token, peer: SocketAddr) -> Self {
        Connection {
            transport,
            token,
            peer,
            status: Status::Pending,
            queue: VecDeque::new(),
            interest: Interest::READABLE | Interest::WRITABLE,
            closing: false,
            interest_dirty: false,
            events: Observable::new(),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == Status::Open
    }

    pub fn is_closed(&self) -> bool {
        self.status == Status::Closed
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn set_status(&mut self, status: Status) {
        debug_assert!(status >= self.status, "connection status must advance");
        self.status = status;
    }

    // Completes a pending connect, surfacing any deferred socket error.
    pub fn mark_open(&mut self) -> Result<()> {
        if self.status != Status::Pending {
            return Ok(());
        }
        if let Some(e) = self.transport.take_socket_error()? {
            return Err(ConnectionError::Io(e).into());
        }
        self.set_status(Status::Open);
        self.events.trigger(&ConnEvent::Open)
    }

    pub fn send(&mut self, reactor: &mut Reactor, data: impl Into<Bytes>) -> Result<()> {
        self.send_tagged(reactor, data, false, None)
    }

    // Appends to the send queue. With `delay` the writable-interest request
    // is left for a later flush_interest call, batching several sends into
    // one registration change.
    pub fn send_tagged(
        &mut self,
        reactor: &mut Reactor,
        data: impl Into<Bytes>,
        delay: bool,
        tag: Option<SendTag>,
    ) -> Result<()> {
        if self.status == Status::Closed || self.closing {
            return Err(ConnectionError::Closed.into());
        }
        self.queue.push_back(Outbound { data: data.into(), sent: 0, tag });
        if delay {
            self.interest_dirty = true;
            Ok(())
        } else {
            self.want_write(reactor)
        }
    }

    pub fn flush_interest(&mut self, reactor: &mut Reactor) -> Result<()> {
        if self.interest_dirty && !self.queue.is_empty() && self.status != Status::Closed {
            self.want_write(reactor)?;
        }
        self.interest_dirty = false;
        Ok(())
    }

    fn want_write(&mut self, reactor: &mut Reactor) -> Result<()> {
        if !self.interest.is_writable() {
            self.interest = Interest::READABLE | Interest::WRITABLE;
            reactor.reregister(self.transport.source_mut(), self.token, self.interest)?;
        }
        self.interest_dirty = false;
        Ok(())
    }

    // Drains the socket. Readiness is edge-triggered, so reads repeat until
    // WouldBlock or EOF; transient errors are swallowed.
    pub fn handle_readable(&mut self, reactor: &mut Reactor) -> Result<ReadOutcome> {
        if self.status == Status::Pending {
            self.mark_open()?;
        }
        let chunk = reactor.config().read_chunk;
        let mut scratch = vec![0u8; chunk];
        let mut data = BytesMut::new();
        let mut eof = false;
        loop {
            match self.transport.read(&mut scratch) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => data.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Io(e).into()),
            }
        }
        Ok(ReadOutcome { data: data.freeze(), eof })
    }

    // Drains the send queue in FIFO order. A partial send keeps the chunk
    // prefix in place and the writable interest armed.
    pub fn handle_writable(&mut self, reactor: &mut Reactor) -> Result<WriteOutcome> {
        if self.status == Status::Pending {
            self.mark_open()?;
        }
        let mut flushed = Vec::new();
        while let Some(front) = self.queue.front_mut() {
            if front.sent >= front.data.len() {
                let done = self.queue.pop_front().expect("non-empty queue");
                if let Some(tag) = done.tag {
                    flushed.push(tag);
                }
                continue;
            }
            match self.transport.write(&front.data[front.sent..]) {
                Ok(0) => {
                    let e = io::Error::new(io::ErrorKind::WriteZero, "socket write returned zero");
                    return Err(ConnectionError::Io(e).into());
                }
                Ok(n) => {
                    front.sent += n;
                    if front.sent == front.data.len() {
                        let done = self.queue.pop_front().expect("non-empty queue");
                        if let Some(tag) = done.tag {
                            flushed.push(tag);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Io(e).into()),
            }
        }
        let mut closed = false;
        if self.queue.is_empty() {
            if self.closing {
                self.finish_close(reactor)?;
                closed = true;
            } else if self.interest.is_writable() {
                self.interest = Interest::READABLE;
                reactor.reregister(self.transport.source_mut(), self.token, self.interest)?;
            }
        }
        Ok(WriteOutcome { flushed, closed })
    }

    // Graceful close: half-closes writes once the queue has drained. Returns
    // true when the connection is fully closed now, false when the close is
    // deferred until the queue empties.
    pub fn close(&mut self, reactor: &mut Reactor) -> Result<bool> {
        if self.status == Status::Closed {
            return Ok(true);
        }
        if self.queue.is_empty() {
            self.finish_close(reactor)?;
            Ok(true)
        } else {
            self.closing = true;
            self.want_write(reactor)?;
            Ok(false)
        }
    }

    fn finish_close(&mut self, reactor: &mut Reactor) -> Result<()> {
        let _ = self.transport.shutdown_write();
        reactor.deregister(self.transport.source_mut(), self.token).ok();
        self.set_status(Status::Closed);
        self.events.trigger(&ConnEvent::Close)
    }

    // Immediate teardown. Unsent tagged chunks are returned as cancelled so
    // their resources are always released.
    pub fn shutdown(&mut self, reactor: &mut Reactor) -> Vec<SendTag> {
        let cancelled: Vec<SendTag> = self.queue.drain(..).filter_map(|o| o.tag).collect();
        if self.status != Status::Closed {
            reactor.deregister(self.transport.source_mut(), self.token).ok();
            self.set_status(Status::Closed);
            let _ = self.events.trigger(&ConnEvent::Close);
        }
        cancelled
    }

    // I/O failure path: fires error, then close.
    pub fn fail(&mut self, reactor: &mut Reactor) -> Vec<SendTag> {
        let _ = self.events.trigger(&ConnEvent::Error);
        self.shutdown(reactor)
    }
}
