use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::Bitfield;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, thiserror::Error)]
pub enum WireError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake carries an unknown protocol string")]
    UnknownProtocol,

    #[error("handshake carries a foreign info-hash")]
    InfoHashMismatch,

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("message length does not match its payload")]
    BadLength,
}

pub type Result<T> = std::result::Result<T, WireError>;

// 19-byte protocol prefix, 8 reserved bytes, info-hash, peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = WireError;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL.len() as u8);
        dst.put_slice(&PROTOCOL);
        dst.put_slice(&handshake.reserved);
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        debug_assert_eq!(dst.len() % HANDSHAKE_LEN, 0);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>> {
        if src.is_empty() {
            return Ok(None);
        }
        // the prefix length byte identifies the protocol before the rest of
        // the handshake is even in
        if src[0] as usize != PROTOCOL.len() {
            return Err(WireError::UnknownProtocol);
        }
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        src.advance(1);
        let mut protocol = [0u8; 19];
        src.copy_to_slice(&mut protocol);
        if protocol != PROTOCOL {
            return Err(WireError::UnknownProtocol);
        }
        let mut reserved = [0u8; 8];
        src.copy_to_slice(&mut reserved);
        let mut info_hash = [0u8; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0u8; 20];
        src.copy_to_slice(&mut peer_id);
        Ok(Some(Handshake { reserved, info_hash, peer_id }))
    }
}

// Length-prefixed peer wire messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {

    // A zero-length message that only refreshes the peer's idle timer.
    KeepAlive,

    Choke,

    Unchoke,

    Interested,

    NotInterested,

    // The sender now has the piece at this index.
    Have(u32),

    // Pieces the sender holds, sent right after the handshake.
    Bitfield(Bitfield),

    Request { index: u32, begin: u32, length: u32 },

    // One block of piece data.
    Piece { index: u32, begin: u32, data: Bytes },

    Cancel { index: u32, begin: u32, length: u32 },

    // DHT listen port.
    Port(u16),
}

pub struct PeerCodec;

impl Encoder<PeerMessage> for PeerCodec {

    type Error = WireError;

    fn encode(&mut self, msg: PeerMessage, dst: &mut BytesMut) -> Result<()> {
        match msg {
            PeerMessage::KeepAlive => dst.put_u32(0),
            PeerMessage::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            }
            PeerMessage::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            }
            PeerMessage::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            }
            PeerMessage::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            }
            // have: <len=0005><id=4><piece index>
            PeerMessage::Have(index) => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(index);
            }
            // bitfield: <len=0001+X><id=5><bitfield>
            PeerMessage::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.put_slice(raw);
            }
            // request: <len=0013><id=6><index><begin><length>
            PeerMessage::Request { index, begin, length } => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            // piece: <len=0009+X><id=7><index><begin><block>
            PeerMessage::Piece { index, begin, data } => {
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_slice(&data);
            }
            // cancel: <len=0013><id=8><index><begin><length>
            PeerMessage::Cancel { index, begin, length } => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(index);
                dst.put_u32(begin);
                dst.put_u32(length);
            }
            // port: <len=0003><id=9><listen-port>
            PeerMessage::Port(port) => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {

    type Item = PeerMessage;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<PeerMessage>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if src.len() < 4 + length {
            // whole message not in yet
            return Ok(None);
        }
        src.advance(4);
        if length == 0 {
            return Ok(Some(PeerMessage::KeepAlive));
        }

        let id = src.get_u8();
        let msg = match id {
            0 => PeerMessage::Choke,
            1 => PeerMessage::Unchoke,
            2 => PeerMessage::Interested,
            3 => PeerMessage::NotInterested,
            4 => {
                if length != 5 {
                    return Err(WireError::BadLength);
                }
                PeerMessage::Have(src.get_u32())
            }
            5 => {
                let mut raw = vec![0u8; length - 1];
                src.copy_to_slice(&mut raw);
                PeerMessage::Bitfield(Bitfield::from_vec(raw))
            }
            6 => {
                if length != 13 {
                    return Err(WireError::BadLength);
                }
                PeerMessage::Request {
                    index: src.get_u32(),
                    begin: src.get_u32(),
                    length: src.get_u32(),
                }
            }
            7 => {
                if length < 9 {
                    return Err(WireError::BadLength);
                }
                let index = src.get_u32();
                let begin = src.get_u32();
                let data = src.split_to(length - 9).freeze();
                PeerMessage::Piece { index, begin, data }
            }
            8 => {
                if length != 13 {
                    return Err(WireError::BadLength);
                }
                PeerMessage::Cancel {
                    index: src.get_u32(),
                    begin: src.get_u32(),
                    length: src.get_u32(),
                }
            }
            9 => {
                if length != 3 {
                    return Err(WireError::BadLength);
                }
                PeerMessage::Port(src.get_u16())
            }
            other => return Err(WireError::UnknownMessageId(other)),
        };
        Ok(Some(msg))
    }
}

impl std::fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMessage::KeepAlive => write!(f, "keep alive"),
            PeerMessage::Choke => write!(f, "choke"),
            PeerMessage::Unchoke => write!(f, "unchoke"),
            PeerMessage::Interested => write!(f, "interested"),
            PeerMessage::NotInterested => write!(f, "not interested"),
            PeerMessage::Have(index) => write!(f, "have {}", index),
            PeerMessage::Bitfield(bitfield) => {
                write!(f, "bitfield with {} pieces", bitfield.count_ones())
            }
            PeerMessage::Request { index, begin, length } => {
                write!(f, "request {{ piece: {}, begin: {}, length: {} }}", index, begin, length)
            }
            PeerMessage::Piece { index, begin, data } => {
                write!(f, "piece {{ piece: {}, begin: {}, length: {} }}", index, begin, data.len())
            }
            PeerMessage::Cancel { index, begin, length } => {
                write!(f, "cancel {{ piece: {}, begin: {}, length: {} }}", index, begin, length)
            }
            PeerMessage::Port(port) => write!(f, "port {}", port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_handshake_round_trip() {
        let out = Handshake::new(hex!("0123456789abcdef0123456789abcdef01234567"), *b"-NL1000-012345678901");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(out.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let back = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(back, out);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_incremental() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"BitTorrent proto");
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(b"col");
        buf.put_slice(&[0; 8]);
        buf.put_slice(&[1; 20]);
        buf.put_slice(&[2; 20]);
        let handshake = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(handshake.info_hash, [1; 20]);
        assert_eq!(handshake.peer_id, [2; 20]);
    }

    #[test]
    fn test_handshake_wrong_protocol() {
        let mut buf = BytesMut::new();
        buf.put_u8(18);
        buf.put_slice(b"Something else here");
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_message_stream_round_trip() {
        let messages = [
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have(7),
            PeerMessage::Bitfield(Bitfield::from_vec(vec![0xa5, 0x0f])),
            PeerMessage::Request { index: 3, begin: 0x4000, length: 0x4000 },
            PeerMessage::Piece { index: 3, begin: 0x4000, data: Bytes::from_static(b"abc") },
            PeerMessage::Cancel { index: 3, begin: 0x4000, length: 0x4000 },
            PeerMessage::Port(6881),
        ];

        let mut buf = BytesMut::new();
        for msg in messages.iter() {
            PeerCodec.encode(msg.clone(), &mut buf).unwrap();
        }
        for msg in messages.iter() {
            let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded, msg);
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_message_decode_across_splits() {
        let mut whole = BytesMut::new();
        PeerCodec
            .encode(
                PeerMessage::Piece { index: 1, begin: 0, data: Bytes::from_static(b"payload") },
                &mut whole,
            )
            .unwrap();

        let mut buf = BytesMut::new();
        for byte in whole.iter().take(whole.len() - 1) {
            buf.put_u8(*byte);
            assert!(PeerCodec.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(whole[whole.len() - 1]);
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            PeerMessage::Piece { index: 1, begin: 0, data: Bytes::from_static(b"payload") },
        );
    }

    #[test]
    fn test_unknown_message_id() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0, 0, 0, 1, 0xee]);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(WireError::UnknownMessageId(0xee)),
        ));
    }

    #[test]
    fn test_bad_length_rejected() {
        let mut buf = BytesMut::new();
        // a have message must be exactly 5 bytes long
        buf.put_slice(&[0, 0, 0, 6, 4, 0, 0, 0, 1, 9]);
        assert!(matches!(PeerCodec.decode(&mut buf), Err(WireError::BadLength)));
    }
}
