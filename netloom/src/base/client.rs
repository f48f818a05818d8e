use std::{collections::VecDeque, io, net::SocketAddr};
use bytes::Bytes;
use mio::{net::UdpSocket, Interest, Token};

use crate::{
    connection::{Connection, Transport},
    error::Result,
    reactor::{Owner, Reactor},
};

// Starts a non-blocking outbound connect. The connection stays Pending
// until the first writable event confirms (or refutes) establishment.
pub fn connect(reactor: &mut Reactor, addr: SocketAddr, owner: Owner) -> Result<Connection> {
    let stream = mio::net::TcpStream::connect(addr)?;
    let mut transport: Box<dyn Transport> = Box::new(stream);
    let token = reactor.register(
        transport.source_mut(),
        Interest::READABLE | Interest::WRITABLE,
        owner,
    )?;
    Ok(Connection::pending(transport, token, addr))
}

// UDP plumbing for datagram clients. Sends go straight to the socket and
// only queue on WouldBlock; readable events drain every pending datagram.
pub struct Datagram {
    socket: UdpSocket,
    token: Option<Token>,
    queue: VecDeque<(Bytes, SocketAddr)>,
}

impl Datagram {

    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Datagram {
            socket: UdpSocket::bind(addr)?,
            token: None,
            queue: VecDeque::new(),
        })
    }

    pub fn open(&mut self, reactor: &mut Reactor, owner: Owner) -> io::Result<Token> {
        let token = reactor.register(&mut self.socket, Interest::READABLE, owner)?;
        self.token = Some(token);
        Ok(token)
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn send_to(&mut self, reactor: &mut Reactor, data: impl Into<Bytes>, addr: SocketAddr) -> io::Result<()> {
        let data = data.into();
        if !self.queue.is_empty() {
            self.queue.push_back((data, addr));
            return Ok(());
        }
        match self.socket.send_to(&data, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.queue.push_back((data, addr));
                if let Some(token) = self.token {
                    reactor.reregister(
                        &mut self.socket,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn handle_readable(&mut self) -> Vec<(Bytes, SocketAddr)> {
        let mut scratch = vec![0u8; 64 * 1024];
        let mut datagrams = Vec::new();
        loop {
            match self.socket.recv_from(&mut scratch) {
                Ok((n, from)) => datagrams.push((Bytes::copy_from_slice(&scratch[..n]), from)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("datagram recv error: {}", e);
                    break;
                }
            }
        }
        datagrams
    }

    pub fn handle_writable(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        while let Some((data, addr)) = self.queue.front() {
            match self.socket.send_to(data, *addr) {
                Ok(_) => {
                    self.queue.pop_front();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.queue.is_empty() {
            if let Some(token) = self.token {
                reactor.reregister(&mut self.socket, token, Interest::READABLE)?;
            }
        }
        Ok(())
    }

    pub fn close(&mut self, reactor: &mut Reactor) {
        if let Some(token) = self.token.take() {
            reactor.deregister(&mut self.socket, token).ok();
        }
    }
}
