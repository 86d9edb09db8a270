//! Chain stream — the explicit per-chain scan position passed to each component.

use serde::{Deserialize, Serialize};

use crate::types::{BlockNumber, ChainId};

/// Inclusive block range `[from, to]` scanned in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: BlockNumber,
    pub to: BlockNumber,
}

impl BlockRange {
    pub fn len(&self) -> u64 {
        self.to.saturating_sub(self.from).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.to < self.from
    }

    pub fn contains(&self, block: BlockNumber) -> bool {
        block >= self.from && block <= self.to
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// A monitored chain's position.
///
/// `cursor` is the last block whose events have all been durably published,
/// or `None` before the first successful cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStream {
    pub chain_id: ChainId,
    pub cursor: Option<BlockNumber>,
    /// First block to scan when no checkpoint exists.
    pub start_block: BlockNumber,
    /// Blocks between the cursor and the last observed head.
    pub lag: u64,
}

impl ChainStream {
    pub fn new(chain_id: ChainId, start_block: BlockNumber) -> Self {
        Self {
            chain_id,
            cursor: None,
            start_block,
            lag: 0,
        }
    }

    /// Resume from a persisted checkpoint.
    pub fn resume(chain_id: ChainId, start_block: BlockNumber, cursor: Option<BlockNumber>) -> Self {
        Self {
            chain_id,
            cursor,
            start_block,
            lag: 0,
        }
    }

    /// The next block to scan (cursor + 1, or the start block).
    ///
    /// `None` once the cursor sits at `u64::MAX`: there is nothing left to scan.
    pub fn next_block(&self) -> Option<BlockNumber> {
        match self.cursor {
            Some(c) => c.checked_add(1),
            None => Some(self.start_block),
        }
    }

    /// Compute `[next, min(next + batch - 1, head)]`, or `None` if caught up.
    ///
    /// `overlap` re-scans that many blocks below the cursor (shallow reorg
    /// tolerance after restart); it never reaches below `start_block`.
    pub fn next_range(&self, head: BlockNumber, batch_size: u64, overlap: u64) -> Option<BlockRange> {
        let next = self.next_block()?;
        if next > head || batch_size == 0 {
            return None;
        }
        let from = next.saturating_sub(overlap).max(self.start_block);
        let to = next.saturating_add(batch_size - 1).min(head);
        Some(BlockRange { from, to })
    }

    /// Jump the cursor to an externally set position, forwards or backwards.
    ///
    /// Returns `true` if the cursor moved backwards (or was cleared).
    pub fn reposition(&mut self, cursor: Option<BlockNumber>) -> bool {
        let backwards = cursor < self.cursor;
        self.cursor = cursor;
        backwards
    }

    /// Move the cursor forward. Returns `false` (and does nothing) on regression.
    pub fn advance(&mut self, to_block: BlockNumber) -> bool {
        if matches!(self.cursor, Some(c) if to_block < c) {
            return false;
        }
        self.cursor = Some(to_block);
        true
    }

    /// Update and return `lag` relative to `head`.
    pub fn observe_head(&mut self, head: BlockNumber) -> u64 {
        self.lag = head.saturating_sub(self.cursor.unwrap_or(self.start_block.saturating_sub(1)));
        self.lag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_range_starts_at_start_block() {
        let s = ChainStream::new(1, 100);
        let r = s.next_range(110, 11, 0).unwrap();
        assert_eq!(r, BlockRange { from: 100, to: 110 });
        assert_eq!(r.len(), 11);
    }

    #[test]
    fn range_capped_at_head_and_batch() {
        let s = ChainStream::resume(1, 0, Some(200));
        assert_eq!(s.next_range(1_000, 50, 0), Some(BlockRange { from: 201, to: 250 }));
        assert_eq!(s.next_range(205, 50, 0), Some(BlockRange { from: 201, to: 205 }));
        assert_eq!(s.next_range(200, 50, 0), None);
    }

    #[test]
    fn overlap_rescans_below_cursor() {
        let s = ChainStream::resume(1, 100, Some(120));
        let r = s.next_range(200, 10, 5).unwrap();
        assert_eq!(r, BlockRange { from: 116, to: 130 });

        let fresh = ChainStream::resume(1, 100, Some(101));
        assert_eq!(fresh.next_range(200, 10, 5).unwrap().from, 100);
    }

    #[test]
    fn advance_is_monotonic() {
        let mut s = ChainStream::new(1, 0);
        assert!(s.advance(10));
        assert!(s.advance(10));
        assert!(!s.advance(9));
        assert_eq!(s.cursor, Some(10));
        assert_eq!(s.observe_head(25), 15);
    }

    #[test]
    fn huge_batch_size_is_capped_at_head() {
        let s = ChainStream::resume(1, 0, Some(200));
        assert_eq!(
            s.next_range(1_000, u64::MAX, 0),
            Some(BlockRange { from: 201, to: 1_000 })
        );
        let near_end = ChainStream::resume(1, 0, Some(u64::MAX - 2));
        assert_eq!(
            near_end.next_range(u64::MAX, u64::MAX, 0),
            Some(BlockRange { from: u64::MAX - 1, to: u64::MAX })
        );
    }

    #[test]
    fn cursor_at_max_block_is_caught_up() {
        let s = ChainStream::resume(1, 0, Some(u64::MAX));
        assert_eq!(s.next_block(), None);
        assert_eq!(s.next_range(u64::MAX, 10, 3), None);
    }

    #[test]
    fn reposition_moves_either_way() {
        let mut s = ChainStream::resume(1, 100, Some(150));
        assert!(!s.reposition(Some(400)));
        assert_eq!(s.next_range(1_000, 10, 0).unwrap().from, 401);
        assert!(s.reposition(Some(120)));
        assert_eq!(s.next_range(1_000, 10, 0).unwrap().from, 121);
        assert!(s.reposition(None));
        assert_eq!(s.next_range(1_000, 10, 0).unwrap().from, 100);
    }
}
