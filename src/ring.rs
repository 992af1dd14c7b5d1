//! Frame-stamped scratch memory ring.
//!
//! The resolver uploads per-pass constants into a fixed-size scratch buffer
//! that the GPU reads over the following frames. Blocks are never freed
//! explicitly: a block written for frame N becomes reusable once at least
//! `reuse_horizon` frames have been recorded since, which is the caller's
//! guarantee that the GPU is no longer reading it.

use std::collections::VecDeque;

/// A range lent out of the scratch ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBlock {
    /// Byte offset of the block inside the scratch buffer.
    pub offset: u64,
    /// Size of the block in bytes.
    pub size: u64,
    /// Frame index at which the block was acquired.
    pub frame_stamp: u32,
}

impl RingBlock {
    fn expired(&self, current_frame: u32, reuse_horizon: u32) -> bool {
        current_frame.wrapping_sub(self.frame_stamp) >= reuse_horizon
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Wrap-around allocator over a fixed byte range.
///
/// Live blocks are kept in issue order; the head cursor prefers forward
/// allocation and wraps to the start only when the tail is exhausted, so the
/// oldest blocks are always the first candidates for reclamation.
#[derive(Debug)]
pub struct ScratchRing {
    size: u64,
    head: u64,
    blocks: VecDeque<RingBlock>,
}

impl ScratchRing {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            head: 0,
            blocks: VecDeque::new(),
        }
    }

    /// Total size of the managed range in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Acquires a block of `size` bytes at the given alignment.
    ///
    /// Blocks whose stamp is at least `reuse_horizon` frames behind
    /// `current_frame` are reclaimed on demand. Returns `None` when no
    /// contiguous run can be made available; the ring state is left
    /// untouched in that case so the caller can retry next frame.
    pub fn acquire(
        &mut self,
        size: u64,
        alignment: u64,
        current_frame: u32,
        reuse_horizon: u32,
    ) -> Option<RingBlock> {
        let mut wrapped = false;
        loop {
            let new_head = align_up(self.head, alignment);
            let mut space = self.space_to_next_live_block(alignment);

            while size > space {
                if self.next_live_block().is_none() {
                    // Tail exhausted; loop back to the beginning once.
                    if self.head == 0 || wrapped {
                        return None;
                    }
                    self.head = 0;
                    wrapped = true;
                    break;
                }

                // Reclaim expired blocks in issue order until the run fits.
                loop {
                    let front = *self.next_live_block()?;
                    if !front.expired(current_frame, reuse_horizon) {
                        return None;
                    }
                    self.blocks.pop_front();
                    space = self.space_to_next_live_block(alignment);
                    if self.next_live_block().is_none() || size <= space {
                        break;
                    }
                }
            }

            if size <= space {
                let block = RingBlock {
                    offset: new_head,
                    size,
                    frame_stamp: current_frame,
                };
                self.blocks.push_back(block);
                self.head = new_head + size;
                return Some(block);
            }
        }
    }

    /// The oldest block that the head cursor has not yet caught up with.
    fn next_live_block(&self) -> Option<&RingBlock> {
        let front = self.blocks.front()?;
        if front.offset + front.size <= self.head {
            // The cursor is past this block; it only matters after a wrap.
            None
        } else {
            Some(front)
        }
    }

    /// Free space between the aligned head and the next live block (or the
    /// end of the ring).
    fn space_to_next_live_block(&self, alignment: u64) -> u64 {
        let new_head = align_up(self.head, alignment);
        let limit = match self.next_live_block() {
            Some(block) => block.offset,
            None => self.size,
        };
        limit.max(new_head) - new_head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_allocation() {
        let mut ring = ScratchRing::new(1024);
        let a = ring.acquire(256, 256, 0, 2).unwrap();
        let b = ring.acquire(256, 256, 0, 2).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
    }

    #[test]
    fn test_alignment_rounds_up() {
        let mut ring = ScratchRing::new(1024);
        let a = ring.acquire(40, 16, 0, 2).unwrap();
        let b = ring.acquire(16, 256, 0, 2).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let mut ring = ScratchRing::new(512);
        assert!(ring.acquire(512, 16, 0, 2).is_some());
        // The only block is still in flight.
        assert!(ring.acquire(512, 16, 1, 2).is_none());
        // Failure must not have disturbed the ring: the block expires on
        // schedule and the same range is handed out again.
        assert!(ring.acquire(512, 16, 2, 2).is_some());
    }

    #[test]
    fn test_reuse_after_horizon() {
        let reuse_horizon = 3;
        let mut ring = ScratchRing::new(256);
        let first = ring.acquire(256, 16, 0, reuse_horizon).unwrap();

        for frame in 1..reuse_horizon {
            assert!(ring.acquire(256, 16, frame, reuse_horizon).is_none());
        }

        let recycled = ring
            .acquire(256, 16, reuse_horizon, reuse_horizon)
            .unwrap();
        assert_eq!(recycled.offset, first.offset);
    }

    #[test]
    fn test_no_live_blocks_overlap() {
        let reuse_horizon = 2;
        let mut ring = ScratchRing::new(1024);
        let mut live: Vec<RingBlock> = Vec::new();

        for frame in 0..32 {
            for _ in 0..3 {
                if let Some(block) = ring.acquire(96, 16, frame, reuse_horizon) {
                    live.push(block);
                }
            }
            live.retain(|b| !b.expired(frame, reuse_horizon));
            for (i, a) in live.iter().enumerate() {
                for b in live.iter().skip(i + 1) {
                    let disjoint =
                        a.offset + a.size <= b.offset || b.offset + b.size <= a.offset;
                    assert!(disjoint, "unexpired blocks overlap: {a:?} vs {b:?}");
                }
            }
        }
    }

    #[test]
    fn test_wraps_to_start_when_tail_exhausted() {
        let mut ring = ScratchRing::new(768);
        let a = ring.acquire(256, 256, 0, 1).unwrap();
        let _b = ring.acquire(256, 256, 0, 1).unwrap();
        let _c = ring.acquire(256, 256, 0, 1).unwrap();

        // Next frame: the tail is exhausted, the cursor wraps and reclaims
        // the expired first block.
        let d = ring.acquire(256, 256, 1, 1).unwrap();
        assert_eq!(d.offset, a.offset);
    }

    #[test]
    fn test_oversized_request_fails_cleanly() {
        let mut ring = ScratchRing::new(128);
        assert!(ring.acquire(256, 16, 0, 1).is_none());
        assert!(ring.acquire(128, 16, 0, 1).is_some());
    }
}
