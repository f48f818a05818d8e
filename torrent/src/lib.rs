mod engine;
mod metainfo;
mod pieces;
mod task;
mod tracker;
mod wire;

// Request granularity on the peer wire.
pub const BLOCK_SIZE: usize = 0x4000;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub use engine::{generate_peer_id, TorrentConfig, TorrentEngine};
pub use metainfo::{FileEntry, Info, MetaInfo, MetaInfoError};
pub use pieces::Pieces;
pub use task::{BlockWritten, TaskError, TaskEvent, TorrentTask};
pub use tracker::{announce, AnnounceParams, AnnounceResponse, TrackerError};
pub use wire::{Handshake, HandshakeCodec, PeerCodec, PeerMessage, WireError};
