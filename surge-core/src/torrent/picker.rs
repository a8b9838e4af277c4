//! Rarest-first piece and block selection.
//!
//! Tracks which pieces we have, how many connected peers have each piece and
//! the block state of pieces in flight. Partially downloaded pieces are
//! finished before new ones are started.

use std::collections::BTreeMap;

use super::{PieceIndex, TorrentInfo};

/// Size of a block request (16 KiB)
pub const BLOCK_SIZE: u32 = 0x4000;

/// One block of one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    /// Piece the block belongs to
    pub piece: PieceIndex,
    /// Byte offset within the piece
    pub offset: u32,
    /// Block length in bytes
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Free,
    Requested,
    Received,
}

#[derive(Debug)]
struct PartialPiece {
    blocks: Vec<BlockState>,
    data: Vec<u8>,
}

/// Piece selection state for one torrent.
#[derive(Debug)]
pub struct PiecePicker {
    piece_length: u32,
    total_length: u64,
    have: Vec<bool>,
    availability: Vec<u32>,
    partial: BTreeMap<u32, PartialPiece>,
}

impl PiecePicker {
    /// Creates a picker for `info` starting from the pieces in `have`.
    pub fn new(info: &TorrentInfo, have: Vec<bool>) -> Self {
        let num_pieces = info.num_pieces() as usize;
        let mut have = have;
        have.resize(num_pieces, false);

        Self {
            piece_length: info.piece_length(),
            total_length: info.total_length(),
            have,
            availability: vec![0; num_pieces],
            partial: BTreeMap::new(),
        }
    }

    /// Number of pieces in the torrent.
    pub fn num_pieces(&self) -> u32 {
        self.have.len() as u32
    }

    /// Whether we have piece `index`.
    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.have.get(index.as_usize()).copied().unwrap_or(false)
    }

    /// Our bitfield.
    pub fn bitfield(&self) -> &[bool] {
        &self.have
    }

    /// Number of pieces we have.
    pub fn num_have(&self) -> u32 {
        self.have.iter().filter(|&&h| h).count() as u32
    }

    /// Whether every piece is present.
    pub fn is_complete(&self) -> bool {
        self.have.iter().all(|&h| h)
    }

    /// Whether a peer with `peer_has` holds any piece we lack.
    pub fn is_interesting(&self, peer_has: &[bool]) -> bool {
        self.have
            .iter()
            .zip(peer_has)
            .any(|(&ours, &theirs)| theirs && !ours)
    }

    /// Number of connected peers known to have `index`.
    pub fn availability(&self, index: PieceIndex) -> u32 {
        self.availability.get(index.as_usize()).copied().unwrap_or(0)
    }

    /// Accounts for a newly connected peer's bitfield.
    pub fn add_peer(&mut self, peer_has: &[bool]) {
        for (count, &has) in self.availability.iter_mut().zip(peer_has) {
            if has {
                *count += 1;
            }
        }
    }

    /// Removes a disconnected peer's bitfield from availability.
    pub fn remove_peer(&mut self, peer_has: &[bool]) {
        for (count, &has) in self.availability.iter_mut().zip(peer_has) {
            if has {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Accounts for a peer announcing piece `index`.
    pub fn peer_has_piece(&mut self, index: PieceIndex) {
        if let Some(count) = self.availability.get_mut(index.as_usize()) {
            *count += 1;
        }
    }

    /// Picks up to `max` free blocks from pieces the peer has.
    ///
    /// Blocks of partially downloaded pieces come first, lowest piece index
    /// first. New pieces are then started rarest first, ties broken by the
    /// lowest index. Picked blocks are marked requested.
    pub fn pick_blocks(&mut self, peer_has: &[bool], max: usize) -> Vec<BlockRequest> {
        let mut picked = Vec::new();
        if max == 0 {
            return picked;
        }

        let partial_pieces: Vec<u32> = self
            .partial
            .keys()
            .copied()
            .filter(|&p| peer_has.get(p as usize).copied().unwrap_or(false))
            .collect();
        for piece in partial_pieces {
            self.take_free_blocks(piece, max, &mut picked);
            if picked.len() >= max {
                return picked;
            }
        }

        let mut candidates: Vec<u32> = (0..self.num_pieces())
            .filter(|&p| {
                !self.have[p as usize]
                    && !self.partial.contains_key(&p)
                    && peer_has.get(p as usize).copied().unwrap_or(false)
            })
            .collect();
        candidates.sort_by_key(|&p| (self.availability[p as usize], p));

        for piece in candidates {
            let size = self.piece_size(piece);
            let num_blocks = size.div_ceil(BLOCK_SIZE) as usize;
            self.partial.insert(
                piece,
                PartialPiece {
                    blocks: vec![BlockState::Free; num_blocks],
                    data: vec![0; size as usize],
                },
            );
            self.take_free_blocks(piece, max, &mut picked);
            if picked.len() >= max {
                break;
            }
        }

        picked
    }

    /// Returns a requested block to the free pool.
    pub fn abort_request(&mut self, block: &BlockRequest) {
        let Some(partial) = self.partial.get_mut(&block.piece.as_u32()) else {
            return;
        };
        let slot = (block.offset / BLOCK_SIZE) as usize;
        if let Some(state) = partial.blocks.get_mut(slot) {
            if *state == BlockState::Requested {
                *state = BlockState::Free;
            }
        }
    }

    /// Stores a received block.
    ///
    /// Returns the assembled piece once its last block arrives. Blocks for
    /// pieces we already have, or already received, are ignored.
    pub fn received_block(
        &mut self,
        block: &BlockRequest,
        data: &[u8],
    ) -> Option<(PieceIndex, Vec<u8>)> {
        let piece = block.piece.as_u32();
        let partial = self.partial.get_mut(&piece)?;
        let slot = (block.offset / BLOCK_SIZE) as usize;
        let start = block.offset as usize;
        let end = start.checked_add(data.len())?;

        let state = partial.blocks.get_mut(slot)?;
        if *state == BlockState::Received || end > partial.data.len() {
            return None;
        }
        *state = BlockState::Received;
        partial.data[start..end].copy_from_slice(data);

        if partial.blocks.iter().all(|&s| s == BlockState::Received) {
            let partial = self.partial.remove(&piece)?;
            return Some((block.piece, partial.data));
        }
        None
    }

    /// Marks piece `index` as verified and present.
    pub fn mark_have(&mut self, index: PieceIndex) {
        if let Some(have) = self.have.get_mut(index.as_usize()) {
            *have = true;
        }
        self.partial.remove(&index.as_u32());
    }

    /// Discards a piece that failed its hash check so it is downloaded again.
    pub fn piece_failed(&mut self, index: PieceIndex) {
        self.partial.remove(&index.as_u32());
    }

    fn piece_size(&self, piece: u32) -> u32 {
        let offset = u64::from(piece) * u64::from(self.piece_length);
        let remaining = self.total_length.saturating_sub(offset);
        remaining.min(u64::from(self.piece_length)) as u32
    }

    fn take_free_blocks(&mut self, piece: u32, max: usize, picked: &mut Vec<BlockRequest>) {
        let size = self.piece_size(piece);
        let Some(partial) = self.partial.get_mut(&piece) else {
            return;
        };

        for (slot, state) in partial.blocks.iter_mut().enumerate() {
            if picked.len() >= max {
                return;
            }
            if *state != BlockState::Free {
                continue;
            }
            *state = BlockState::Requested;
            let offset = slot as u32 * BLOCK_SIZE;
            picked.push(BlockRequest {
                piece: PieceIndex::new(piece),
                offset,
                length: (size - offset).min(BLOCK_SIZE),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::create_torrent;

    fn picker(num_pieces: u32, piece_size: u32) -> PiecePicker {
        let info = create_torrent(None, "t", piece_size, num_pieces, false).unwrap();
        PiecePicker::new(&info, Vec::new())
    }

    #[test]
    fn test_rarest_first_with_index_tiebreak() {
        let mut picker = picker(4, BLOCK_SIZE);
        picker.add_peer(&[true, true, true, true]);
        picker.add_peer(&[true, true, false, true]);
        picker.add_peer(&[false, true, false, false]);

        // availability: [2, 3, 1, 2]
        let blocks = picker.pick_blocks(&[true; 4], 4);
        let order: Vec<u32> = blocks.iter().map(|b| b.piece.as_u32()).collect();
        assert_eq!(order, vec![2, 0, 3, 1]);
    }

    #[test]
    fn test_partial_pieces_finish_first() {
        let mut picker = picker(2, BLOCK_SIZE * 2);
        picker.add_peer(&[true, true]);

        let first = picker.pick_blocks(&[true, true], 1);
        assert_eq!(first[0].piece, PieceIndex::new(0));
        assert_eq!(first[0].offset, 0);

        let next = picker.pick_blocks(&[true, true], 1);
        assert_eq!(next[0].piece, PieceIndex::new(0));
        assert_eq!(next[0].offset, BLOCK_SIZE);
    }

    #[test]
    fn test_only_picks_what_peer_has() {
        let mut picker = picker(3, BLOCK_SIZE);
        let blocks = picker.pick_blocks(&[false, true, false], 10);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].piece, PieceIndex::new(1));
        assert!(picker.pick_blocks(&[false, true, false], 10).is_empty());
    }

    #[test]
    fn test_piece_assembles_from_blocks() {
        let mut picker = picker(1, BLOCK_SIZE + 100);
        let blocks = picker.pick_blocks(&[true], 4);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].length, 100);

        assert!(picker.received_block(&blocks[1], &[7u8; 100]).is_none());
        // Duplicate delivery is ignored
        assert!(picker.received_block(&blocks[1], &[7u8; 100]).is_none());

        let (index, data) = picker
            .received_block(&blocks[0], &vec![1u8; BLOCK_SIZE as usize])
            .unwrap();
        assert_eq!(index, PieceIndex::new(0));
        assert_eq!(data.len(), (BLOCK_SIZE + 100) as usize);
        assert_eq!(data[BLOCK_SIZE as usize], 7);

        picker.mark_have(index);
        assert!(picker.is_complete());
        assert_eq!(picker.num_have(), 1);
    }

    #[test]
    fn test_aborted_and_failed_pieces_are_picked_again() {
        let mut picker = picker(1, BLOCK_SIZE);
        let blocks = picker.pick_blocks(&[true], 1);
        assert!(picker.pick_blocks(&[true], 1).is_empty());

        picker.abort_request(&blocks[0]);
        let again = picker.pick_blocks(&[true], 1);
        assert_eq!(again, blocks);

        picker
            .received_block(&again[0], &vec![0u8; BLOCK_SIZE as usize])
            .unwrap();
        picker.piece_failed(PieceIndex::new(0));
        assert!(!picker.has_piece(PieceIndex::new(0)));
        assert_eq!(picker.pick_blocks(&[true], 1), blocks);
    }

    #[test]
    fn test_interest_and_availability() {
        let mut picker = picker(2, BLOCK_SIZE);
        picker.mark_have(PieceIndex::new(0));
        assert!(!picker.is_interesting(&[true, false]));
        assert!(picker.is_interesting(&[false, true]));

        picker.add_peer(&[true, true]);
        picker.peer_has_piece(PieceIndex::new(1));
        assert_eq!(picker.availability(PieceIndex::new(1)), 2);
        picker.remove_peer(&[true, true]);
        assert_eq!(picker.availability(PieceIndex::new(0)), 0);
        assert_eq!(picker.availability(PieceIndex::new(1)), 1);
    }
}
