use crate::Bitfield;

// Outstanding-work bitmaps for one download. `bitfield` holds one bit per
// piece, `mask` one bit per block; a set bit means that unit still has work
// left. A task keeps two of these: blocks not yet requested, and blocks not
// yet stored.
//
// Bits only go true -> false, except through the explicit release/requeue
// calls, and bitfield[i] is false exactly when every block of piece i is
// false in the mask.
#[derive(Debug, Clone)]
pub struct Pieces {
    bitfield: Bitfield,
    mask: Bitfield,
    num_pieces: usize,
    blocks_per_piece: usize,
}

impl Pieces {

    pub fn new(num_pieces: usize, blocks_per_piece: usize) -> Self {
        Pieces {
            bitfield: Bitfield::repeat(true, num_pieces),
            mask: Bitfield::repeat(true, num_pieces * blocks_per_piece),
            num_pieces,
            blocks_per_piece,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn blocks_per_piece(&self) -> usize {
        self.blocks_per_piece
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn piece_pending(&self, piece: usize) -> bool {
        self.bitfield[piece]
    }

    pub fn block_pending(&self, piece: usize, block: usize) -> bool {
        self.mask[piece * self.blocks_per_piece + block]
    }

    // First piece that is still pending here and that the peer can serve.
    pub fn first_candidate(&self, peer: &Bitfield) -> Option<usize> {
        self.bitfield
            .iter_ones()
            .find(|&piece| peer.get(piece).map_or(false, |bit| *bit))
    }

    // Claims the first outstanding block of the piece, clearing it from the
    // mask and recomputing the piece bit.
    pub fn claim_block(&mut self, piece: usize) -> Option<usize> {
        let base = piece * self.blocks_per_piece;
        let block = self.mask[base..base + self.blocks_per_piece].first_one()?;
        self.clear_block(piece, block);
        Some(block)
    }

    // Clears one block; returns true when the whole piece just emptied.
    pub fn clear_block(&mut self, piece: usize, block: usize) -> bool {
        let base = piece * self.blocks_per_piece;
        self.mask.set(base + block, false);
        let emptied = self.mask[base..base + self.blocks_per_piece].not_any();
        if emptied {
            self.bitfield.set(piece, false);
        }
        emptied
    }

    // Returns an unserved block to the pool (its peer choked or vanished).
    pub fn release_block(&mut self, piece: usize, block: usize) {
        self.mask.set(piece * self.blocks_per_piece + block, true);
        self.bitfield.set(piece, true);
    }

    // Explicit reversal for a piece that failed verification.
    pub fn requeue_piece(&mut self, piece: usize) {
        let base = piece * self.blocks_per_piece;
        self.mask[base..base + self.blocks_per_piece].fill(true);
        self.bitfield.set(piece, true);
    }

    pub fn is_done(&self) -> bool {
        self.mask.not_any()
    }

    pub fn remaining_blocks(&self) -> usize {
        self.mask.count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_order_and_piece_bit() {
        let mut pieces = Pieces::new(2, 2);
        let peer = Bitfield::repeat(true, 2);

        assert_eq!(pieces.first_candidate(&peer), Some(0));
        assert_eq!(pieces.claim_block(0), Some(0));
        assert!(pieces.piece_pending(0));
        assert_eq!(pieces.claim_block(0), Some(1));
        assert!(!pieces.piece_pending(0));
        assert_eq!(pieces.claim_block(0), None);
        assert_eq!(pieces.first_candidate(&peer), Some(1));
    }

    #[test]
    fn test_candidate_respects_peer_bitfield() {
        let pieces = Pieces::new(3, 1);
        let mut peer = Bitfield::repeat(false, 3);
        assert_eq!(pieces.first_candidate(&peer), None);
        peer.set(2, true);
        assert_eq!(pieces.first_candidate(&peer), Some(2));
    }

    #[test]
    fn test_piece_bit_tracks_mask_exactly() {
        let mut pieces = Pieces::new(1, 3);
        pieces.clear_block(0, 1);
        assert!(pieces.piece_pending(0));
        pieces.clear_block(0, 0);
        assert!(pieces.piece_pending(0));
        assert!(pieces.clear_block(0, 2));
        assert!(!pieces.piece_pending(0));
        assert!(pieces.is_done());
    }

    #[test]
    fn test_release_and_requeue_restore_bits() {
        let mut pieces = Pieces::new(1, 2);
        pieces.clear_block(0, 0);
        pieces.clear_block(0, 1);
        assert!(pieces.is_done());

        pieces.release_block(0, 1);
        assert!(pieces.piece_pending(0));
        assert!(pieces.block_pending(0, 1));
        assert!(!pieces.block_pending(0, 0));

        pieces.requeue_piece(0);
        assert_eq!(pieces.remaining_blocks(), 2);
    }
}
