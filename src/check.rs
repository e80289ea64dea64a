use std::ptr::NonNull;

use thiserror::Error;

use crate::{
    block::{BlockHeader, MIN_BLOCK_SIZE, WORD_SIZE},
    heap::Heap,
    source::MemorySource,
    tag::ALIGNMENT,
    Pointer,
};

/// A violated heap invariant, reported by [`Heap::consistency_check`].
/// Addresses are included so a violation can be matched against a
/// [`Heap::dump`] of the same heap.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("block at {block:#x} has misaligned size {size}")]
    MisalignedSize { block: usize, size: usize },

    #[error("block at {block:#x} is only {size} bytes, below the minimum block size")]
    UndersizedBlock { block: usize, size: usize },

    #[error("block at {block:#x} disagrees with its memory predecessor about the preceding-used tag")]
    PrecedingTagMismatch { block: usize },

    #[error("adjacent free blocks at {first:#x} and {second:#x}")]
    AdjacentFreeBlocks { first: usize, second: usize },

    #[error("free block at {block:#x} has a footer that differs from its header")]
    FooterMismatch { block: usize },

    #[error("free block at {block:#x} is missing from the free list")]
    NotInFreeList { block: usize },

    #[error("free list entry at {block:#x} has its used bit set")]
    UsedBlockInFreeList { block: usize },

    #[error("free list links around {block:#x} are inconsistent")]
    BrokenListLinks { block: usize },

    #[error("free list holds {listed} blocks but the heap walk found {walked}")]
    FreeCountMismatch { listed: usize, walked: usize },

    #[error("block sizes plus the sentinel cover {walked} bytes but the heap spans {spanned}")]
    SizeSumMismatch { walked: usize, spanned: usize },

    #[error("heap walk left the managed region at {address:#x}")]
    WalkOutOfBounds { address: usize },
}

impl<S: MemorySource> Heap<S> {
    /// Walks the whole heap in address order and audits the free list,
    /// validating every allocator invariant:
    ///
    /// 1. recorded sizes are aligned and at least the minimum block size;
    /// 2. each preceding-used bit matches the true status of the block's
    ///    memory predecessor (including the sentinel's);
    /// 3. no two free blocks are adjacent in memory;
    /// 4. every free block's footer equals its header;
    /// 5. block sizes plus the sentinel word cover the region exactly, and
    ///    the free list contains precisely the blocks whose used bit is
    ///    clear, with intact links.
    ///
    /// Returns the first violation found. This is a test and debugging hook,
    /// not something to call on a hot path: the free list membership check
    /// alone is quadratic.
    pub fn consistency_check(&self) -> Result<(), ConsistencyError> {
        let (Some(low), Some(high)) = (self.source.heap_low(), self.source.heap_high()) else {
            return Ok(());
        };

        let low = low.as_ptr() as usize;
        let end = high.as_ptr() as usize;

        let mut address = low;
        let mut preceding_used = true;
        let mut preceding_free: Option<usize> = None;
        let mut walked = 0;
        let mut free_seen = 0;

        unsafe {
            loop {
                if address + WORD_SIZE > end {
                    return Err(ConsistencyError::WalkOutOfBounds { address });
                }

                let block = NonNull::new_unchecked(address as *mut BlockHeader);
                let tags = BlockHeader::tags_of(block);

                if tags.size() == 0 {
                    // The sentinel must be used, must sit in the very last
                    // word, and still carries a meaningful preceding-used bit.
                    if !tags.is_used() || address + WORD_SIZE != end {
                        return Err(ConsistencyError::WalkOutOfBounds { address });
                    }
                    if tags.preceding_used() != preceding_used {
                        return Err(ConsistencyError::PrecedingTagMismatch { block: address });
                    }
                    break;
                }

                if tags.size() % ALIGNMENT != 0 {
                    return Err(ConsistencyError::MisalignedSize {
                        block: address,
                        size: tags.size(),
                    });
                }
                if tags.size() < MIN_BLOCK_SIZE {
                    return Err(ConsistencyError::UndersizedBlock {
                        block: address,
                        size: tags.size(),
                    });
                }
                if tags.preceding_used() != preceding_used {
                    return Err(ConsistencyError::PrecedingTagMismatch { block: address });
                }

                if !tags.is_used() {
                    if let Some(first) = preceding_free {
                        return Err(ConsistencyError::AdjacentFreeBlocks {
                            first,
                            second: address,
                        });
                    }
                    if BlockHeader::preceding_footer_of(BlockHeader::following(block)) != tags {
                        return Err(ConsistencyError::FooterMismatch { block: address });
                    }
                    if !self.free_blocks.iter().any(|node| node == block) {
                        return Err(ConsistencyError::NotInFreeList { block: address });
                    }

                    free_seen += 1;
                    preceding_free = Some(address);
                } else {
                    preceding_free = None;
                }

                walked += tags.size();
                preceding_used = tags.is_used();
                address += tags.size();
            }

            if walked + WORD_SIZE != end - low {
                return Err(ConsistencyError::SizeSumMismatch {
                    walked: walked + WORD_SIZE,
                    spanned: end - low,
                });
            }

            // Audit the list itself: membership was checked during the walk,
            // so here we verify the used bits, the back links and that the
            // list doesn't contain anything the walk didn't see (which also
            // catches cycles).
            let mut listed = 0;
            let mut prev: Pointer<BlockHeader> = None;

            for node in self.free_blocks.iter() {
                let address = node.as_ptr() as usize;

                if BlockHeader::tags_of(node).is_used() {
                    return Err(ConsistencyError::UsedBlockInFreeList { block: address });
                }
                if (*node.as_ptr()).prev != prev {
                    return Err(ConsistencyError::BrokenListLinks { block: address });
                }

                listed += 1;
                if listed > free_seen {
                    return Err(ConsistencyError::FreeCountMismatch {
                        listed,
                        walked: free_seen,
                    });
                }

                prev = Some(node);
            }

            if listed != free_seen {
                return Err(ConsistencyError::FreeCountMismatch {
                    listed,
                    walked: free_seen,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        source::FixedArena,
        tag::{SizeAndTags, SENTINEL},
    };

    fn heap() -> Heap<FixedArena> {
        Heap::init(FixedArena::with_page_size(4 * 1024, 256)).unwrap()
    }

    #[test]
    fn fresh_heap_is_consistent() {
        heap().consistency_check().unwrap();
    }

    #[test]
    fn stays_consistent_through_churn() {
        let mut heap = heap();

        unsafe {
            let a = heap.allocate(100).unwrap().unwrap();
            let b = heap.allocate(300).unwrap().unwrap();
            heap.consistency_check().unwrap();

            heap.deallocate(a);
            heap.consistency_check().unwrap();

            let c = heap.allocate(40).unwrap().unwrap();
            heap.consistency_check().unwrap();

            heap.deallocate(b);
            heap.deallocate(c);
            heap.consistency_check().unwrap();
        }
    }

    #[test]
    fn detects_a_stolen_used_bit() {
        let heap = heap();

        unsafe {
            // Mark the sole free block used without touching the free list.
            // The walk trips over the sentinel's stale preceding-used bit
            // first, then the list audit would find the used entry.
            let block = heap.free_blocks.head.unwrap();
            BlockHeader::set_tags_of(block, BlockHeader::tags_of(block).with_used(true));

            let sentinel = BlockHeader::following(block).as_ptr() as usize;
            assert_eq!(
                heap.consistency_check(),
                Err(ConsistencyError::PrecedingTagMismatch { block: sentinel })
            );
        }
    }

    #[test]
    fn detects_a_corrupted_footer() {
        let mut heap = heap();

        unsafe {
            // Split once so a free block with a real footer exists behind a
            // used one.
            let _a = heap.allocate(100).unwrap().unwrap();
            let block = heap.free_blocks.head.unwrap();
            let address = block.as_ptr() as usize;

            let size = BlockHeader::tags_of(block).size();
            let footer = (address + size - WORD_SIZE) as *mut SizeAndTags;
            footer.write(SizeAndTags::new(size + 8).with_preceding_used(true));

            assert_eq!(
                heap.consistency_check(),
                Err(ConsistencyError::FooterMismatch { block: address })
            );
        }
    }

    #[test]
    fn detects_a_block_missing_from_the_list() {
        let mut heap = heap();

        unsafe {
            let a = heap.allocate(100).unwrap().unwrap();
            heap.deallocate(a);

            let block = heap.free_blocks.head.unwrap();
            heap.free_blocks.remove(block);

            assert_eq!(
                heap.consistency_check(),
                Err(ConsistencyError::NotInFreeList {
                    block: block.as_ptr() as usize
                })
            );
        }
    }

    #[test]
    fn detects_a_misplaced_sentinel() {
        let heap = heap();

        unsafe {
            let block = heap.free_blocks.head.unwrap();
            let sentinel = BlockHeader::following(block);
            BlockHeader::set_tags_of(sentinel, SENTINEL.with_used(false));

            let address = sentinel.as_ptr() as usize;
            assert_eq!(
                heap.consistency_check(),
                Err(ConsistencyError::WalkOutOfBounds { address })
            );
        }
    }
}
