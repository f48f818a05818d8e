use std::{cell::RefCell, collections::HashMap, io, net::SocketAddr, rc::Rc};
use bytes::Bytes;
use mio::{net::TcpListener, Interest, Token};

use crate::{
    connection::{Connection, SendTag, Transport},
    error::{ConnectionError, Result},
    reactor::{Agent, Owner, Reactor},
};

// A registered listening socket.
pub struct Acceptor {
    listener: TcpListener,
    token: Token,
}

impl Acceptor {

    pub fn bind(reactor: &mut Reactor, addr: SocketAddr, owner: Owner) -> Result<Self> {
        let mut listener = TcpListener::bind(addr)?;
        let token = reactor.register(&mut listener, Interest::READABLE, owner)?;
        Ok(Acceptor { listener, token })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    // Accepts until the backlog is drained; wakeups are edge-triggered.
    pub fn accept_ready(&mut self) -> Vec<(mio::net::TcpStream, SocketAddr)> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok(pair) => accepted.push(pair),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                    break;
                }
            }
        }
        accepted
    }

    pub fn close(&mut self, reactor: &mut Reactor) {
        reactor.deregister(&mut self.listener, self.token).ok();
    }
}

#[derive(Default)]
pub struct ConnTable {
    conns: HashMap<Token, Connection>,
}

impl ConnTable {

    pub fn insert(&mut self, conn: Connection) {
        self.conns.insert(conn.token(), conn);
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.conns.get_mut(&token)
    }

    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        self.conns.remove(&token)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.conns.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.conns.keys().copied().collect()
    }
}

// Handle passed into protocol hooks: the reactor, the connection table and
// the sub-acceptor set, everything a protocol may touch besides itself.
pub struct ServerCtl<'a> {
    pub reactor: &'a mut Reactor,
    pub conns: &'a mut ConnTable,
    subs: &'a mut HashMap<Token, Acceptor>,
    owner: &'a Owner,
}

impl<'a> ServerCtl<'a> {

    // Opens an ephemeral sub-listener on the same reactor (the container
    // pattern: one server owning sub-servers, e.g. FTP data channels).
    pub fn open_sub(&mut self, addr: SocketAddr) -> Result<(Token, SocketAddr)> {
        let acceptor = Acceptor::bind(&mut *self.reactor, addr, Rc::clone(self.owner))?;
        let token = acceptor.token();
        let local = acceptor.local_addr()?;
        self.subs.insert(token, acceptor);
        Ok((token, local))
    }

    pub fn close_sub(&mut self, token: Token) {
        if let Some(mut acceptor) = self.subs.remove(&token) {
            acceptor.close(&mut *self.reactor);
        }
    }

    pub fn send(&mut self, token: Token, data: impl Into<Bytes>) -> Result<()> {
        self.send_tagged(token, data, false, None)
    }

    pub fn send_tagged(
        &mut self,
        token: Token,
        data: impl Into<Bytes>,
        delay: bool,
        tag: Option<SendTag>,
    ) -> Result<()> {
        match self.conns.get_mut(token) {
            Some(conn) => conn.send_tagged(&mut *self.reactor, data, delay, tag),
            None => Err(ConnectionError::Closed.into()),
        }
    }

    // Graceful close; a connection with queued data closes once it drains.
    pub fn close(&mut self, token: Token) -> Result<()> {
        if let Some(conn) = self.conns.get_mut(token) {
            if conn.close(&mut *self.reactor)? {
                self.conns.remove(token);
            }
        }
        Ok(())
    }
}

// Per-protocol behaviour hooks. All default to no-ops so a protocol only
// spells out the paths it cares about. Hooks are never re-entered: a close
// initiated from inside a hook does not call back into on_close.
pub trait Protocol: 'static {

    fn on_open(&mut self, ctl: &mut ServerCtl, token: Token) -> Result<()> {
        let _ = (ctl, token);
        Ok(())
    }

    fn on_data(&mut self, ctl: &mut ServerCtl, token: Token, data: Bytes) -> Result<()>;

    // A tagged chunk was fully flushed to the peer.
    fn on_flush(&mut self, ctl: &mut ServerCtl, token: Token, tag: SendTag) -> Result<()> {
        let _ = (ctl, token, tag);
        Ok(())
    }

    // A sub-listener accepted a connection.
    fn on_sub_accept(&mut self, ctl: &mut ServerCtl, listener: Token, conn: Token) -> Result<()> {
        let _ = (ctl, listener, conn);
        Ok(())
    }

    // Peer-initiated or error close. Cancelled tags belong to chunks that
    // never reached the wire.
    fn on_close(&mut self, ctl: &mut ServerCtl, token: Token, cancelled: Vec<SendTag>) {
        let _ = (ctl, token, cancelled);
    }
}

// Generic stream server: one main listener, a connection table and any
// number of ephemeral sub-listeners, all owned by a single reactor agent.
pub struct StreamServer<P: Protocol> {
    acceptor: Option<Acceptor>,
    conns: ConnTable,
    subs: HashMap<Token, Acceptor>,
    owner: Option<Owner>,
    pub protocol: P,
}

impl<P: Protocol> StreamServer<P> {

    pub fn new(protocol: P) -> Self {
        StreamServer {
            acceptor: None,
            conns: ConnTable::default(),
            subs: HashMap::new(),
            owner: None,
            protocol,
        }
    }

    // Binds the main listener and registers the server with the reactor.
    // Returns the bound address (useful with port 0).
    pub fn serve(this: &Rc<RefCell<Self>>, reactor: &mut Reactor, addr: SocketAddr) -> Result<SocketAddr> {
        let owner: Owner = this.clone();
        let mut server = this.borrow_mut();
        let acceptor = Acceptor::bind(reactor, addr, Rc::clone(&owner))?;
        let local = acceptor.local_addr()?;
        server.acceptor = Some(acceptor);
        server.owner = Some(owner);
        tracing::info!("serving on {}", local);
        Ok(local)
    }

    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    fn owner(&self) -> Option<Owner> {
        self.owner.clone()
    }

    fn accept_on_main(&mut self, reactor: &mut Reactor) -> Result<()> {
        let accepted = match self.acceptor.as_mut() {
            Some(acceptor) => acceptor.accept_ready(),
            None => return Ok(()),
        };
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return Ok(()),
        };
        for (stream, addr) in accepted {
            let mut transport: Box<dyn Transport> = Box::new(stream);
            let token = reactor.register(transport.source_mut(), Interest::READABLE, Rc::clone(&owner))?;
            tracing::debug!("accepted {} as {:?}", addr, token);
            self.conns.insert(Connection::accepted(transport, token, addr));
            let mut ctl = ServerCtl {
                reactor: &mut *reactor,
                conns: &mut self.conns,
                subs: &mut self.subs,
                owner: &owner,
            };
            self.protocol.on_open(&mut ctl, token)?;
        }
        Ok(())
    }

    fn accept_on_sub(&mut self, reactor: &mut Reactor, listener: Token) -> Result<()> {
        let accepted = match self.subs.get_mut(&listener) {
            Some(acceptor) => acceptor.accept_ready(),
            None => return Ok(()),
        };
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return Ok(()),
        };
        for (stream, addr) in accepted {
            let mut transport: Box<dyn Transport> = Box::new(stream);
            let token = reactor.register(transport.source_mut(), Interest::READABLE, Rc::clone(&owner))?;
            tracing::debug!("sub-accepted {} as {:?}", addr, token);
            self.conns.insert(Connection::accepted(transport, token, addr));
            let mut ctl = ServerCtl {
                reactor: &mut *reactor,
                conns: &mut self.conns,
                subs: &mut self.subs,
                owner: &owner,
            };
            self.protocol.on_sub_accept(&mut ctl, listener, token)?;
        }
        Ok(())
    }

    fn drop_conn(&mut self, reactor: &mut Reactor, token: Token, error: bool) {
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return,
        };
        if let Some(mut conn) = self.conns.remove(token) {
            let cancelled = if error { conn.fail(reactor) } else { conn.shutdown(reactor) };
            let mut ctl = ServerCtl {
                reactor: &mut *reactor,
                conns: &mut self.conns,
                subs: &mut self.subs,
                owner: &owner,
            };
            self.protocol.on_close(&mut ctl, token, cancelled);
        }
    }
}

impl<P: Protocol> Agent for StreamServer<P> {

    fn on_readable(&mut self, reactor: &mut Reactor, token: Token) -> Result<()> {
        if self.acceptor.as_ref().map(|a| a.token()) == Some(token) {
            return self.accept_on_main(reactor);
        }
        if self.subs.contains_key(&token) {
            return self.accept_on_sub(reactor, token);
        }
        let outcome = match self.conns.get_mut(token) {
            Some(conn) => conn.handle_readable(reactor)?,
            None => return Ok(()),
        };
        if !outcome.data.is_empty() {
            let owner = match self.owner() {
                Some(owner) => owner,
                None => return Ok(()),
            };
            let mut ctl = ServerCtl {
                reactor: &mut *reactor,
                conns: &mut self.conns,
                subs: &mut self.subs,
                owner: &owner,
            };
            self.protocol.on_data(&mut ctl, token, outcome.data)?;
            if let Some(conn) = self.conns.get_mut(token) {
                conn.flush_interest(reactor)?;
            }
        }
        if outcome.eof {
            self.drop_conn(reactor, token, false);
        }
        Ok(())
    }

    fn on_writable(&mut self, reactor: &mut Reactor, token: Token) -> Result<()> {
        let outcome = match self.conns.get_mut(token) {
            Some(conn) => conn.handle_writable(reactor)?,
            None => return Ok(()),
        };
        let owner = match self.owner() {
            Some(owner) => owner,
            None => return Ok(()),
        };
        for tag in outcome.flushed {
            let mut ctl = ServerCtl {
                reactor: &mut *reactor,
                conns: &mut self.conns,
                subs: &mut self.subs,
                owner: &owner,
            };
            self.protocol.on_flush(&mut ctl, token, tag)?;
        }
        if outcome.closed {
            self.conns.remove(token);
            let mut ctl = ServerCtl {
                reactor: &mut *reactor,
                conns: &mut self.conns,
                subs: &mut self.subs,
                owner: &owner,
            };
            self.protocol.on_close(&mut ctl, token, Vec::new());
        }
        Ok(())
    }

    fn on_error(&mut self, reactor: &mut Reactor, token: Token) {
        if self.subs.contains_key(&token) {
            if let Some(mut acceptor) = self.subs.remove(&token) {
                tracing::warn!("sub-listener {:?} failed", token);
                acceptor.close(reactor);
            }
            return;
        }
        if self.acceptor.as_ref().map(|a| a.token()) == Some(token) {
            tracing::error!("listener {:?} failed", token);
            if let Some(mut acceptor) = self.acceptor.take() {
                acceptor.close(reactor);
            }
            return;
        }
        self.drop_conn(reactor, token, true);
    }
}
