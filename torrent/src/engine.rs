use std::{
    cell::RefCell,
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    rc::Rc,
    time::Duration,
};
use bytes::BytesMut;
use rand::Rng;
use tokio_util::codec::{Decoder, Encoder};
use url::Url;
use netloom::{
    base::{client, server::Acceptor},
    connection::{Connection, Status, Transport},
    error::Result as NetResult,
    reactor::{Agent, Interest, Owner, Reactor, Token},
};

use crate::{
    metainfo::MetaInfo,
    task::{TaskError, TorrentTask},
    tracker::{self, AnnounceParams},
    wire::{Handshake, HandshakeCodec, PeerCodec, PeerMessage, WireError},
    Bitfield, BLOCK_SIZE,
};

// Outstanding requests kept on the wire per peer.
const REQUEST_QUEUE: usize = 20;

const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TorrentConfig {

    pub output_dir: PathBuf,

    // Bound for inbound peers when set; outbound-only otherwise.
    pub listen_address: Option<SocketAddr>,

    pub max_peers: usize,

    // Port advertised to trackers.
    pub port: u16,

}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("downloads"),
            listen_address: None,
            max_peers: 30,
            port: 6881,
        }
    }
}

// Azureus-style id: client tag plus random alphanumeric tail.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = *b"-NL1000-000000000000";
    let mut rng = rand::thread_rng();
    for byte in id.iter_mut().skip(8) {
        *byte = rng.sample(rand::distributions::Alphanumeric);
    }
    id
}

#[derive(Debug, thiserror::Error)]
enum EngineError {

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Net(#[from] netloom::Error),
}

struct Peer {
    conn: Connection,
    recv: BytesMut,
    bitfield: Option<Bitfield>,
    handshaken: bool,
    sent_handshake: bool,
    peer_choking: bool,
    // (piece index, byte offset) requests on the wire.
    inflight: Vec<(usize, usize)>,
}

impl Peer {
    fn new(conn: Connection) -> Self {
        Peer {
            conn,
            recv: BytesMut::new(),
            bitfield: None,
            handshaken: false,
            sent_handshake: false,
            peer_choking: true,
            inflight: Vec::new(),
        }
    }
}

// Download engine for one task, driven entirely by the reactor: tracker
// announce at construction, then per-peer handshake / bitfield / request
// pipelines multiplexed over the shared piece state.
pub struct TorrentEngine {
    task: TorrentTask,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    trackers: Vec<Url>,
    peers: HashMap<Token, Peer>,
    listener: Option<Acceptor>,
    owner: Option<Owner>,
    config: TorrentConfig,
    done: bool,
}

impl TorrentEngine {

    pub fn new(meta: &MetaInfo, config: TorrentConfig) -> Result<Self, TaskError> {
        std::fs::create_dir_all(&config.output_dir)?;
        let task = TorrentTask::new(meta, config.output_dir.join(meta.name()))?;
        Ok(TorrentEngine {
            info_hash: meta.info_hash(),
            peer_id: generate_peer_id(),
            trackers: meta.trackers(),
            peers: HashMap::new(),
            listener: None,
            owner: None,
            config,
            task,
            done: false,
        })
    }

    pub fn task(&self) -> &TorrentTask {
        &self.task
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    // Announces to the trackers (a blocking, construction-time stall: the
    // reactor is not yet driving anything for this task), connects the
    // discovered peers and arms the keep-alive timer.
    pub fn start(this: &Rc<RefCell<Self>>, reactor: &mut Reactor) -> NetResult<()> {
        let owner: Owner = this.clone();
        let mut engine = this.borrow_mut();
        engine.owner = Some(Rc::clone(&owner));

        if let Some(addr) = engine.config.listen_address {
            let acceptor = Acceptor::bind(reactor, addr, Rc::clone(&owner))?;
            tracing::info!("accepting peers on {}", acceptor.local_addr()?);
            engine.listener = Some(acceptor);
        }

        let found = engine.announce_all();
        tracing::info!("trackers returned {} peers", found.len());
        let max = engine.config.max_peers;
        for addr in found.into_iter().take(max) {
            engine.connect_peer(reactor, addr);
        }

        let handle = Rc::downgrade(this);
        reactor.schedule_every(KEEPALIVE_PERIOD, move |reactor| {
            match handle.upgrade() {
                Some(engine) => engine.borrow_mut().send_keepalives(reactor),
                None => false,
            }
        });
        Ok(())
    }

    // Every tracker is tried; an unreachable one is skipped. No peers at
    // all leaves the task idle rather than failed.
    fn announce_all(&mut self) -> Vec<SocketAddr> {
        let params = AnnounceParams {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.config.port,
            uploaded: self.task.uploaded(),
            downloaded: self.task.downloaded(),
            left: self.task.left(),
        };
        let mut found = Vec::new();
        for url in &self.trackers {
            match tracker::announce(url, &params) {
                Ok(peers) => found.extend(peers),
                Err(e) => tracing::warn!("tracker {} failed: {}", url, e),
            }
        }
        found.sort_unstable();
        found.dedup();
        found
    }

    fn connect_peer(&mut self, reactor: &mut Reactor, addr: SocketAddr) {
        let owner = match &self.owner {
            Some(owner) => Rc::clone(owner),
            None => return,
        };
        match client::connect(reactor, addr, owner) {
            Ok(conn) => {
                tracing::debug!("connecting to peer {}", addr);
                self.peers.insert(conn.token(), Peer::new(conn));
            }
            Err(e) => tracing::warn!("connect to {} failed: {}", addr, e),
        }
    }

    fn accept_peers(&mut self, reactor: &mut Reactor) -> NetResult<()> {
        let accepted = match self.listener.as_mut() {
            Some(listener) => listener.accept_ready(),
            None => return Ok(()),
        };
        let owner = match &self.owner {
            Some(owner) => Rc::clone(owner),
            None => return Ok(()),
        };
        for (stream, addr) in accepted {
            let mut transport: Box<dyn Transport> = Box::new(stream);
            let token = reactor.register(transport.source_mut(), Interest::READABLE, Rc::clone(&owner))?;
            tracing::info!("inbound peer {}", addr);
            self.peers.insert(token, Peer::new(Connection::accepted(transport, token, addr)));
        }
        Ok(())
    }

    fn send_handshake(&mut self, reactor: &mut Reactor, token: Token) -> Result<(), EngineError> {
        let handshake = Handshake::new(self.info_hash, self.peer_id);
        let peer = match self.peers.get_mut(&token) {
            Some(peer) => peer,
            None => return Ok(()),
        };
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf)?;
        peer.conn.send(reactor, buf.freeze())?;
        peer.sent_handshake = true;
        Ok(())
    }

    fn send_messages(
        &mut self,
        reactor: &mut Reactor,
        token: Token,
        msgs: Vec<PeerMessage>,
    ) -> Result<(), EngineError> {
        let peer = match self.peers.get_mut(&token) {
            Some(peer) => peer,
            None => return Ok(()),
        };
        let mut buf = BytesMut::new();
        for msg in msgs {
            tracing::trace!("send: {}", msg);
            PeerCodec.encode(msg, &mut buf)?;
        }
        peer.conn.send(reactor, buf.freeze())?;
        Ok(())
    }

    // Decodes and handles everything buffered for one peer.
    fn drive_peer(&mut self, reactor: &mut Reactor, token: Token) -> Result<(), EngineError> {
        loop {
            let peer = match self.peers.get_mut(&token) {
                Some(peer) => peer,
                None => return Ok(()),
            };

            if !peer.handshaken {
                let handshake = match HandshakeCodec.decode(&mut peer.recv)? {
                    Some(handshake) => handshake,
                    None => return Ok(()),
                };
                if handshake.info_hash != self.info_hash {
                    return Err(WireError::InfoHashMismatch.into());
                }
                peer.handshaken = true;
                let must_reply = !peer.sent_handshake;
                tracing::debug!("handshake from {}", String::from_utf8_lossy(&handshake.peer_id));
                if must_reply {
                    self.send_handshake(reactor, token)?;
                }
                self.send_messages(reactor, token, vec![PeerMessage::Interested])?;
                continue;
            }

            let msg = match PeerCodec.decode(&mut peer.recv)? {
                Some(msg) => msg,
                None => return Ok(()),
            };
            tracing::trace!("read: {}", msg);
            let outbound = handle_message(&mut self.task, peer, msg)?;
            if !outbound.is_empty() {
                self.send_messages(reactor, token, outbound)?;
            }
            if self.task.is_complete() && !self.done {
                self.finish(reactor);
                return Ok(());
            }
        }
    }

    fn drop_peer(&mut self, reactor: &mut Reactor, token: Token) {
        if let Some(mut peer) = self.peers.remove(&token) {
            // hand the blocks back so another peer can fetch them
            for (piece, offset) in peer.inflight.drain(..) {
                self.task.release_block(piece, offset);
            }
            peer.conn.shutdown(reactor);
            tracing::debug!("peer {} gone, {} remain", peer.conn.peer_addr(), self.peers.len());
        }
    }

    fn finish(&mut self, reactor: &mut Reactor) {
        self.done = true;
        tracing::info!(
            "download complete: {} bytes at {:.0} B/s",
            self.task.downloaded(),
            self.task.speed(),
        );
        let tokens: Vec<Token> = self.peers.keys().copied().collect();
        for token in tokens {
            self.drop_peer(reactor, token);
        }
        if let Some(mut listener) = self.listener.take() {
            listener.close(reactor);
        }
    }

    // Disk failure: fatal to the task, not to the process.
    fn abort(&mut self, reactor: &mut Reactor) {
        tracing::error!("task aborted");
        self.done = true;
        let tokens: Vec<Token> = self.peers.keys().copied().collect();
        for token in tokens {
            self.drop_peer(reactor, token);
        }
        if let Some(mut listener) = self.listener.take() {
            listener.close(reactor);
        }
    }

    fn send_keepalives(&mut self, reactor: &mut Reactor) -> bool {
        if self.done {
            return false;
        }
        let tokens: Vec<Token> = self.peers.keys().copied().collect();
        for token in tokens {
            let _ = self.send_messages(reactor, token, vec![PeerMessage::KeepAlive]);
        }
        true
    }

    fn handle_peer_result(&mut self, reactor: &mut Reactor, token: Token, result: Result<(), EngineError>) {
        match result {
            Ok(()) => {}
            Err(EngineError::Task(e)) => {
                tracing::error!("disk failure: {}", e);
                self.abort(reactor);
            }
            Err(e) => {
                tracing::warn!("peer {:?} dropped: {}", token, e);
                self.drop_peer(reactor, token);
            }
        }
    }
}

impl Agent for TorrentEngine {

    fn on_readable(&mut self, reactor: &mut Reactor, token: Token) -> NetResult<()> {
        if self.listener.as_ref().map(|l| l.token()) == Some(token) {
            return self.accept_peers(reactor);
        }
        let outcome = match self.peers.get_mut(&token) {
            Some(peer) => peer.conn.handle_readable(reactor)?,
            None => return Ok(()),
        };
        if !outcome.data.is_empty() {
            if let Some(peer) = self.peers.get_mut(&token) {
                peer.recv.extend_from_slice(&outcome.data);
            }
            let result = self.drive_peer(reactor, token);
            self.handle_peer_result(reactor, token, result);
        }
        if outcome.eof {
            self.drop_peer(reactor, token);
        }
        Ok(())
    }

    fn on_writable(&mut self, reactor: &mut Reactor, token: Token) -> NetResult<()> {
        let newly_open = match self.peers.get_mut(&token) {
            Some(peer) => {
                let was_pending = peer.conn.status() == Status::Pending;
                peer.conn.handle_writable(reactor)?;
                was_pending && peer.conn.status() == Status::Open
            }
            None => return Ok(()),
        };
        if newly_open {
            let result = self.send_handshake(reactor, token);
            self.handle_peer_result(reactor, token, result);
        }
        Ok(())
    }

    fn on_error(&mut self, reactor: &mut Reactor, token: Token) {
        if self.listener.as_ref().map(|l| l.token()) == Some(token) {
            tracing::error!("peer listener failed");
            if let Some(mut listener) = self.listener.take() {
                listener.close(reactor);
            }
            return;
        }
        self.drop_peer(reactor, token);
    }
}

// Pure message handling: mutates task and peer state and returns the
// messages to put on the wire. Kept free of sockets so the protocol logic
// is testable on its own.
fn handle_message(
    task: &mut TorrentTask,
    peer: &mut Peer,
    msg: PeerMessage,
) -> Result<Vec<PeerMessage>, EngineError> {
    let mut out = Vec::new();
    match msg {
        PeerMessage::KeepAlive => {}

        PeerMessage::Choke => {
            if !peer.peer_choking {
                peer.peer_choking = true;
                for (piece, offset) in peer.inflight.drain(..) {
                    task.release_block(piece, offset);
                }
            }
        }

        PeerMessage::Unchoke => {
            if peer.peer_choking {
                peer.peer_choking = false;
                fill_requests(task, peer, &mut out);
            }
        }

        // Bitfield is only meaningful straight after the handshake.
        PeerMessage::Bitfield(mut bitfield) => {
            bitfield.resize(task.num_pieces(), false);
            tracing::debug!("peer has {}/{} pieces", bitfield.count_ones(), task.num_pieces());
            peer.bitfield = Some(bitfield);
        }

        PeerMessage::Have(index) => {
            if let Some(bitfield) = peer.bitfield.as_mut() {
                if (index as usize) < bitfield.len() {
                    bitfield.set(index as usize, true);
                }
            }
            if !peer.peer_choking {
                fill_requests(task, peer, &mut out);
            }
        }

        PeerMessage::Piece { index, begin, data } => {
            let key = (index as usize, begin as usize);
            match peer.inflight.iter().position(|block| *block == key) {
                Some(at) => {
                    peer.inflight.remove(at);
                    let written = task.set_data(&data, key.0, key.1)?;
                    if written.piece_valid == Some(false) {
                        tracing::warn!("piece {} rejected, re-requesting", index);
                    }
                    if !peer.peer_choking {
                        fill_requests(task, peer, &mut out);
                    }
                }
                None => tracing::warn!("unexpected block: piece {} begin {}", index, begin),
            }
        }

        // Download-only engine: upload-side traffic is acknowledged nowhere.
        PeerMessage::Interested
        | PeerMessage::NotInterested
        | PeerMessage::Request { .. }
        | PeerMessage::Cancel { .. }
        | PeerMessage::Port(_) => {}
    }
    Ok(out)
}

// Tops the request pipeline up to its target depth with fixed-size block
// requests against the peer's bitfield.
fn fill_requests(task: &mut TorrentTask, peer: &mut Peer, out: &mut Vec<PeerMessage>) {
    let bitfield = match peer.bitfield.as_ref() {
        Some(bitfield) => bitfield,
        None => return,
    };
    while peer.inflight.len() < REQUEST_QUEUE {
        match task.pop_block(bitfield) {
            Some((piece, offset)) => {
                peer.inflight.push((piece, offset));
                out.push(PeerMessage::Request {
                    index: piece as u32,
                    begin: offset as u32,
                    length: BLOCK_SIZE as u32,
                });
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sha1::{Digest, Sha1};
    use crate::metainfo::Info;

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    fn fixture_task(dir: &tempfile::TempDir) -> (TorrentTask, Vec<u8>) {
        let piece_length = 2 * BLOCK_SIZE as u32;
        let payload: Vec<u8> = (0..2 * piece_length as usize)
            .map(|at| (at % 253) as u8)
            .collect();
        let mut pieces = Vec::new();
        for piece in payload.chunks(piece_length as usize) {
            pieces.extend_from_slice(&sha1_of(piece));
        }
        let info = Info {
            files: None,
            length: Some(payload.len() as u64),
            name: "engine.bin".into(),
            piece_length,
            pieces,
            private: None,
        };
        let meta = MetaInfo::from_parts(info, vec![]).unwrap();
        let task = TorrentTask::new(&meta, dir.path().join("engine.bin")).unwrap();
        (task, payload)
    }

    fn fake_peer() -> Peer {
        // a connected stream pair just to satisfy the type; the protocol
        // logic under test never touches the socket
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let stream = mio::net::TcpStream::from_std(client);
        let transport: Box<dyn Transport> = Box::new(stream);
        Peer::new(Connection::accepted(transport, Token(999), addr))
    }

    #[test]
    fn test_peer_id_shape() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-NL1000-");
        assert!(id[8..].iter().all(|byte| byte.is_ascii_alphanumeric()));
        assert_ne!(generate_peer_id()[8..], id[8..]);
    }

    #[test]
    fn test_unchoke_fills_request_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let (mut task, _) = fixture_task(&dir);
        let mut peer = fake_peer();

        let out = handle_message(&mut task, &mut peer, PeerMessage::Bitfield(Bitfield::repeat(true, 2))).unwrap();
        assert!(out.is_empty());

        let out = handle_message(&mut task, &mut peer, PeerMessage::Unchoke).unwrap();
        // four blocks exist in total, all requested at once
        assert_eq!(out.len(), 4);
        assert_eq!(peer.inflight.len(), 4);
        assert_eq!(
            out[0],
            PeerMessage::Request { index: 0, begin: 0, length: BLOCK_SIZE as u32 },
        );
        assert_eq!(
            out[3],
            PeerMessage::Request { index: 1, begin: BLOCK_SIZE as u32, length: BLOCK_SIZE as u32 },
        );
    }

    #[test]
    fn test_block_delivery_completes_download() {
        let dir = tempfile::tempdir().unwrap();
        let (mut task, payload) = fixture_task(&dir);
        let mut peer = fake_peer();

        handle_message(&mut task, &mut peer, PeerMessage::Bitfield(Bitfield::repeat(true, 2))).unwrap();
        let requests = handle_message(&mut task, &mut peer, PeerMessage::Unchoke).unwrap();

        for request in requests {
            let (index, begin) = match request {
                PeerMessage::Request { index, begin, .. } => (index, begin),
                other => panic!("unexpected message {}", other),
            };
            let start = index as usize * task.piece_length() + begin as usize;
            let delivered = PeerMessage::Piece {
                index,
                begin,
                data: Bytes::copy_from_slice(&payload[start..start + BLOCK_SIZE]),
            };
            handle_message(&mut task, &mut peer, delivered).unwrap();
        }

        assert!(task.is_complete());
        assert!(peer.inflight.is_empty());
    }

    #[test]
    fn test_choke_releases_inflight_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut task, _) = fixture_task(&dir);
        let mut peer = fake_peer();

        handle_message(&mut task, &mut peer, PeerMessage::Bitfield(Bitfield::repeat(true, 2))).unwrap();
        handle_message(&mut task, &mut peer, PeerMessage::Unchoke).unwrap();
        assert_eq!(task.requested.remaining_blocks(), 0);

        handle_message(&mut task, &mut peer, PeerMessage::Choke).unwrap();
        assert!(peer.inflight.is_empty());
        assert_eq!(task.requested.remaining_blocks(), 4);

        // an unchoke re-requests everything
        let out = handle_message(&mut task, &mut peer, PeerMessage::Unchoke).unwrap();
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_unexpected_block_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (mut task, payload) = fixture_task(&dir);
        let mut peer = fake_peer();

        let delivered = PeerMessage::Piece {
            index: 0,
            begin: 0,
            data: Bytes::copy_from_slice(&payload[..BLOCK_SIZE]),
        };
        handle_message(&mut task, &mut peer, delivered).unwrap();
        assert_eq!(task.downloaded(), 0);
    }

    #[test]
    fn test_have_widens_peer_bitfield() {
        let dir = tempfile::tempdir().unwrap();
        let (mut task, _) = fixture_task(&dir);
        let mut peer = fake_peer();

        handle_message(&mut task, &mut peer, PeerMessage::Bitfield(Bitfield::repeat(false, 2))).unwrap();
        let out = handle_message(&mut task, &mut peer, PeerMessage::Unchoke).unwrap();
        assert!(out.is_empty());

        let out = handle_message(&mut task, &mut peer, PeerMessage::Have(1)).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|msg| matches!(msg, PeerMessage::Request { index: 1, .. })));
    }
}
