use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
    time::Instant,
};
use sha1::{Digest, Sha1};
use netloom::{Observable, Signal};

use crate::{metainfo::MetaInfo, pieces::Pieces, Bitfield, BLOCK_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum TaskError {

    // Disk failures are fatal to the whole task.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block outside piece bounds: piece {piece} offset {offset}")]
    OutOfBounds { piece: usize, offset: usize },

    #[error("event handler failed: {0}")]
    Handler(#[from] netloom::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;

#[derive(Debug, Clone, Copy)]
pub enum TaskEvent {
    // A block's bytes hit the disk.
    Block { piece: usize, offset: usize },
    // Every block of the piece is stored; verification follows.
    Piece { piece: usize },
}

impl Signal for TaskEvent {
    fn name(&self) -> &'static str {
        match self {
            TaskEvent::Block { .. } => "block",
            TaskEvent::Piece { .. } => "piece",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BlockWritten {
    pub piece_complete: bool,
    // Verification verdict when the piece completed.
    pub piece_valid: Option<bool>,
}

// One download operation over the peer mesh: the output file (opened once,
// written only from the reactor thread), the request/stored bitmaps and the
// transfer counters.
pub struct TorrentTask {
    path: PathBuf,
    file: File,
    piece_hashes: Vec<[u8; 20]>,
    piece_length: usize,
    total_len: u64,
    num_pieces: usize,
    pub requested: Pieces,
    pub stored: Pieces,
    pub events: Observable<TaskEvent>,
    started: Instant,
    uploaded: u64,
    downloaded: u64,
}

impl TorrentTask {

    pub fn new(meta: &MetaInfo, target: impl Into<PathBuf>) -> Result<Self> {
        let path = target.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let num_pieces = meta.num_pieces();
        let piece_length = meta.info.piece_length as usize;
        let blocks_per_piece = meta.blocks_per_piece();
        // pre-allocate the whole piece span up front
        file.set_len(num_pieces as u64 * piece_length as u64)?;
        tracing::info!(
            "task '{}': {} pieces of {} bytes at {:?}",
            meta.name(),
            num_pieces,
            piece_length,
            path,
        );

        Ok(TorrentTask {
            path,
            file,
            piece_hashes: meta.piece_hashes(),
            piece_length,
            total_len: meta.total_len(),
            num_pieces,
            requested: Pieces::new(num_pieces, blocks_per_piece),
            stored: Pieces::new(num_pieces, blocks_per_piece),
            events: Observable::new(),
            started: Instant::now(),
            uploaded: 0,
            downloaded: 0,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn piece_length(&self) -> usize {
        self.piece_length
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    pub fn left(&self) -> u64 {
        self.total_len.saturating_sub(self.downloaded)
    }

    // Mean download rate in bytes per second since the task started.
    pub fn speed(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.downloaded as f64 / elapsed
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stored.is_done()
    }

    // Actual byte length of a piece; the last one may fall short of nominal.
    pub fn piece_len(&self, piece: usize) -> usize {
        let start = piece as u64 * self.piece_length as u64;
        (self.piece_length as u64).min(self.total_len.saturating_sub(start)) as usize
    }

    // Picks the next block to request from a peer advertising `peer`:
    // first pending piece in the intersection, first outstanding block
    // within it. Returns (piece index, byte offset).
    pub fn pop_block(&mut self, peer: &Bitfield) -> Option<(usize, usize)> {
        let piece = self.requested.first_candidate(peer)?;
        let block = self.requested.claim_block(piece)?;
        Some((piece, block * BLOCK_SIZE))
    }

    // Returns an in-flight block nobody will deliver to the request pool.
    pub fn release_block(&mut self, piece: usize, offset: usize) {
        self.requested.release_block(piece, offset / BLOCK_SIZE);
    }

    // Writes one delivered block through to disk and marks it stored. When
    // the write completes a piece, the piece is verified in place; a hash
    // mismatch re-queues every block of the piece on both bitmaps.
    pub fn set_data(&mut self, data: &[u8], piece: usize, offset: usize) -> Result<BlockWritten> {
        if piece >= self.num_pieces || offset + data.len() > self.piece_length {
            return Err(TaskError::OutOfBounds { piece, offset });
        }
        let block = offset / BLOCK_SIZE;
        debug_assert!(
            !self.requested.block_pending(piece, block),
            "block stored before being requested",
        );

        self.file
            .seek(SeekFrom::Start(piece as u64 * self.piece_length as u64 + offset as u64))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        self.downloaded += data.len() as u64;

        let piece_complete = self.stored.clear_block(piece, block);
        self.events.trigger(&TaskEvent::Block { piece, offset })?;

        let mut piece_valid = None;
        if piece_complete {
            self.events.trigger(&TaskEvent::Piece { piece })?;
            let valid = self.verify_piece(piece)?;
            if !valid {
                tracing::warn!("piece {} failed hash verification, re-queueing", piece);
                self.requested.requeue_piece(piece);
                self.stored.requeue_piece(piece);
            }
            piece_valid = Some(valid);
        }
        Ok(BlockWritten { piece_complete, piece_valid })
    }

    // Re-opens the file read-only and streams the piece's actual length
    // through SHA-1 against the metainfo hash.
    pub fn verify_piece(&self, piece: usize) -> Result<bool> {
        let mut reader = File::open(&self.path)?;
        reader.seek(SeekFrom::Start(piece as u64 * self.piece_length as u64))?;

        let mut remaining = self.piece_len(piece);
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; BLOCK_SIZE];
        while remaining > 0 {
            let take = remaining.min(BLOCK_SIZE);
            reader.read_exact(&mut buf[..take])?;
            hasher.update(&buf[..take]);
            remaining -= take;
        }
        let digest: [u8; 20] = hasher.finalize().into();
        Ok(digest == self.piece_hashes[piece])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};
    use crate::metainfo::Info;

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    // Two pieces of two blocks each, with real hashes over known payload.
    fn fixture() -> (MetaInfo, Vec<u8>, tempfile::TempDir) {
        let piece_length = 2 * BLOCK_SIZE as u32;
        let payload: Vec<u8> = (0..2 * piece_length as usize)
            .map(|at| (at % 251) as u8)
            .collect();
        let mut pieces = Vec::new();
        for piece in payload.chunks(piece_length as usize) {
            pieces.extend_from_slice(&sha1_of(piece));
        }
        let info = Info {
            files: None,
            length: Some(payload.len() as u64),
            name: "fixture.bin".into(),
            piece_length,
            pieces,
            private: None,
        };
        let meta = MetaInfo::from_parts(info, vec![]).unwrap();
        (meta, payload, tempfile::tempdir().unwrap())
    }

    #[test]
    fn test_pop_block_intersects_peer_bitfield() {
        let (meta, _, dir) = fixture();
        let mut task = TorrentTask::new(&meta, dir.path().join("out.bin")).unwrap();

        let mut peer = Bitfield::repeat(false, 2);
        peer.set(1, true);

        assert_eq!(task.pop_block(&peer), Some((1, 0)));
        assert_eq!(task.pop_block(&peer), Some((1, BLOCK_SIZE)));
        assert_eq!(task.pop_block(&peer), None);

        let all = Bitfield::repeat(true, 2);
        assert_eq!(task.pop_block(&all), Some((0, 0)));
    }

    #[test]
    fn test_write_through_verifies_pieces() {
        let (meta, payload, dir) = fixture();
        let mut task = TorrentTask::new(&meta, dir.path().join("out.bin")).unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        for name in ["block", "piece"] {
            let log = Rc::clone(&events);
            task.events.bind(name, move |event| {
                log.borrow_mut().push(match event {
                    TaskEvent::Block { piece, offset } => format!("block:{}:{}", piece, offset),
                    TaskEvent::Piece { piece } => format!("piece:{}", piece),
                });
                Ok(())
            });
        }

        let all = Bitfield::repeat(true, 2);
        while let Some((piece, offset)) = task.pop_block(&all) {
            let start = piece * task.piece_length() + offset;
            let written = task
                .set_data(&payload[start..start + BLOCK_SIZE], piece, offset)
                .unwrap();
            if written.piece_complete {
                assert_eq!(written.piece_valid, Some(true));
            }
        }

        assert!(task.is_complete());
        assert_eq!(task.downloaded(), payload.len() as u64);
        assert_eq!(task.left(), 0);
        assert_eq!(
            *events.borrow(),
            vec![
                format!("block:0:0"),
                format!("block:0:{}", BLOCK_SIZE),
                "piece:0".to_string(),
                format!("block:1:0"),
                format!("block:1:{}", BLOCK_SIZE),
                "piece:1".to_string(),
            ]
        );
    }

    #[test]
    fn test_corrupt_piece_requeues_both_bitmaps() {
        let (meta, payload, dir) = fixture();
        let mut task = TorrentTask::new(&meta, dir.path().join("out.bin")).unwrap();

        let mut peer = Bitfield::repeat(false, 2);
        peer.set(0, true);
        task.pop_block(&peer).unwrap();
        task.pop_block(&peer).unwrap();

        let garbage = vec![0xff; BLOCK_SIZE];
        task.set_data(&garbage, 0, 0).unwrap();
        let written = task.set_data(&garbage, 0, BLOCK_SIZE).unwrap();
        assert_eq!(written.piece_valid, Some(false));

        // the piece is requestable again and still unstored
        assert!(task.requested.piece_pending(0));
        assert!(task.stored.piece_pending(0));
        assert_eq!(task.pop_block(&peer), Some((0, 0)));

        // a correct retry settles it
        task.pop_block(&peer);
        task.set_data(&payload[..BLOCK_SIZE], 0, 0).unwrap();
        let written = task
            .set_data(&payload[BLOCK_SIZE..2 * BLOCK_SIZE], 0, BLOCK_SIZE)
            .unwrap();
        assert_eq!(written.piece_valid, Some(true));
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let (meta, _, dir) = fixture();
        let mut task = TorrentTask::new(&meta, dir.path().join("out.bin")).unwrap();
        assert!(task.set_data(&[0], 2, 0).is_err());
        assert!(task.set_data(&[0; 8], 0, 2 * BLOCK_SIZE - 4).is_err());
    }

    #[test]
    fn test_short_last_piece_length() {
        let piece_length = 2 * BLOCK_SIZE as u32;
        let payload_len = piece_length as usize + 100;
        let info = Info {
            files: None,
            length: Some(payload_len as u64),
            name: "short.bin".into(),
            piece_length,
            pieces: vec![0; 40],
            private: None,
        };
        let meta = MetaInfo::from_parts(info, vec![]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let task = TorrentTask::new(&meta, dir.path().join("out.bin")).unwrap();
        assert_eq!(task.piece_len(0), piece_length as usize);
        assert_eq!(task.piece_len(1), 100);
    }
}
