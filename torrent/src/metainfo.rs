use serde_derive::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use url::Url;

use crate::BLOCK_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("pieces must be a non-empty multiple of 20 bytes")]
    InvalidPieces,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileEntry {

    pub path: Vec<String>,

    pub length: u64,

}

// Fields stay in bencode key order so re-encoding for the info hash yields
// a canonical dictionary.
#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // A list of dictionaries, one per file; absent for single-file torrents.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,

    // Length of the file in bytes; absent for multi-file torrents.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    pub name: String,

    // Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Concatenated 20-byte SHA-1 values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

}

impl Info {
    // SHA-1 of the bencoded info dictionary.
    fn hash(&self) -> Result<[u8; 20], MetaInfoError> {
        let encoded = serde_bencode::to_bytes(self)?;
        let mut hasher = Sha1::new();
        hasher.update(&encoded);
        Ok(hasher.finalize().into())
    }
}

#[derive(Clone, Deserialize)]
pub struct MetaInfo {

    #[serde(default)]
    pub announce: Option<String>,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,

    pub info: Info,

    #[serde(skip)]
    info_hash: [u8; 20],

}

impl MetaInfo {

    pub fn from_bytes(data: &[u8]) -> Result<Self, MetaInfoError> {
        let mut meta: MetaInfo = serde_bencode::from_bytes(data)?;
        if meta.info.pieces.is_empty() || meta.info.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPieces);
        }
        meta.info_hash = meta.info.hash()?;
        tracing::debug!("loaded torrent '{}' ({} pieces)", meta.info.name, meta.num_pieces());
        Ok(meta)
    }

    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self, MetaInfoError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    // Builds metainfo from already-decoded parts; used where no .torrent
    // file exists (tests, synthetic tasks).
    pub fn from_parts(info: Info, announce: Vec<String>) -> Result<Self, MetaInfoError> {
        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPieces);
        }
        let info_hash = info.hash()?;
        Ok(MetaInfo {
            announce: announce.first().cloned(),
            announce_list: if announce.is_empty() { None } else { Some(vec![announce]) },
            info,
            info_hash,
        })
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks_exact(20)
            // length is validated to be a multiple of 20 on construction
            .map(|chunk| chunk.try_into().unwrap())
            .collect()
    }

    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len() / 20
    }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    // Actual length of a piece; the last one may fall short.
    pub fn piece_len(&self, piece: usize) -> usize {
        let nominal = self.info.piece_length as u64;
        let start = piece as u64 * nominal;
        nominal.min(self.total_len().saturating_sub(start)) as usize
    }

    pub fn blocks_per_piece(&self) -> usize {
        (self.info.piece_length as usize + BLOCK_SIZE - 1) / BLOCK_SIZE
    }

    // Announce URLs with tier order preserved and the plain announce key as
    // the fallback tier.
    pub fn trackers(&self) -> Vec<Url> {
        let mut urls = Vec::new();
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for raw in tier {
                    if let Ok(url) = Url::parse(raw) {
                        urls.push(url);
                    }
                }
            }
        }
        if urls.is_empty() {
            if let Some(raw) = &self.announce {
                if let Ok(url) = Url::parse(raw) {
                    urls.push(url);
                }
            }
        }
        urls
    }
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce)
            .field("name", &self.info.name)
            .field("num_pieces", &self.num_pieces())
            .field("piece_length", &self.info.piece_length)
            .field("total_len", &self.total_len())
            .field("info_hash", &self.info_hash_hex())
            .finish()
    }
}
