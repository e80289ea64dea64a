use std::{cmp, ptr::NonNull};

use log::{debug, trace};
use thiserror::Error;

use crate::{
    block::{BlockHeader, MIN_BLOCK_SIZE, WORD_SIZE},
    freelist::FreeList,
    source::MemorySource,
    tag::{align_up, SizeAndTags, SENTINEL},
    Pointer,
};

/// The memory source could not extend the heap any further. There is no
/// fallback memory, so the embedding application decides whether to abort or
/// to shed load.
#[derive(Debug, Error)]
#[error("memory source could not extend the heap by {requested} bytes")]
pub struct AllocError {
    pub(crate) requested: usize,
}

/// A heap of boundary-tagged blocks over one [`MemorySource`] region.
///
/// The heap is a single contiguous range laid out as
///
/// ```text
/// heap_low                                         heap_high
/// v                                                        v
/// +-----------+-----------+--  ...  --+-----------+--------+
/// |   block   |   block   |           |   block   |sentinel|
/// +-----------+-----------+--  ...  --+-----------+--------+
/// ```
///
/// where the sentinel is one word with size 0 and the used bit set, a
/// permanent "used neighbor" that terminates every forward scan. The free
/// list head and the heap bounds live in this struct rather than inside the
/// heap itself.
///
/// All state is mutated in place and nothing here locks: the heap assumes
/// exclusive, non-reentrant access.
pub struct Heap<S: MemorySource> {
    /// Free blocks, in LIFO order.
    pub(crate) free_blocks: FreeList,
    /// Where the bytes come from.
    pub(crate) source: S,
}

impl<S: MemorySource> Heap<S> {
    /// Constructs the minimal valid heap: one free block of minimum size
    /// followed by the end-of-heap sentinel. Fails only if `source` cannot
    /// supply the initial region.
    ///
    /// This is the only way to obtain a [`Heap`], so every other operation
    /// runs on an initialized heap by construction.
    pub fn init(source: S) -> Result<Self, AllocError> {
        let mut heap = Self {
            free_blocks: FreeList::new(),
            source,
        };

        let init_size = MIN_BLOCK_SIZE + WORD_SIZE;
        unsafe {
            let Some(address) = heap.source.extend(init_size) else {
                return Err(AllocError {
                    requested: init_size,
                });
            };

            // Nothing precedes the first block, so its preceding-used bit is
            // set for good.
            let block = address.cast::<BlockHeader>();
            BlockHeader::set_tags_of(
                block,
                SizeAndTags::new(MIN_BLOCK_SIZE).with_preceding_used(true),
            );
            BlockHeader::write_footer(block);
            BlockHeader::set_tags_of(BlockHeader::following(block), SENTINEL);

            heap.free_blocks.insert(block);
        }

        debug!("initialized {init_size} byte heap");

        Ok(heap)
    }

    /// Allocates at least `size` usable bytes and returns their address,
    /// which is always a multiple of the alignment. Requesting 0 bytes
    /// returns `Ok(None)` and mutates nothing. `Err` means the memory source
    /// is exhausted.
    ///
    /// # Safety
    ///
    /// The returned address is valid until it is passed to
    /// [`Self::deallocate`]; writing more than `size` bytes through it is
    /// undefined behavior.
    pub unsafe fn allocate(&mut self, size: usize) -> Result<Pointer<u8>, AllocError> {
        if size == 0 {
            return Ok(None);
        }

        // One extra word for the header; a used block needs no footer.
        let needed = cmp::max(MIN_BLOCK_SIZE, align_up(size + WORD_SIZE));

        let block = match self.free_blocks.first_fit(needed) {
            Some(block) => block,
            None => {
                self.grow(needed)?;
                // The grown (and possibly coalesced) block fits `needed`, so
                // a second miss means the allocator itself is broken.
                self.free_blocks
                    .first_fit(needed)
                    .ok_or(AllocError { requested: needed })?
            }
        };

        self.free_blocks.remove(block);

        let tags = BlockHeader::tags_of(block);
        let found = tags.size();

        if found - needed >= MIN_BLOCK_SIZE {
            // Enough slack to stand alone: shrink the chosen block and format
            // the remainder as a new free block right after it.
            BlockHeader::set_tags_of(
                block,
                SizeAndTags::new(needed)
                    .with_preceding_used(tags.preceding_used())
                    .with_used(true),
            );

            let remainder = BlockHeader::following(block);
            BlockHeader::set_tags_of(
                remainder,
                SizeAndTags::new(found - needed).with_preceding_used(true),
            );
            BlockHeader::write_footer(remainder);
            self.free_blocks.insert(remainder);
        } else {
            // Consumed whole; the slack stays as internal fragmentation and
            // the memory neighbor learns that this block is now used.
            BlockHeader::set_tags_of(block, tags.with_used(true));

            let following = BlockHeader::following(block);
            BlockHeader::set_tags_of(
                following,
                BlockHeader::tags_of(following).with_preceding_used(true),
            );
        }

        let payload = BlockHeader::payload_address_of(block);
        trace!("allocate({size}) -> {payload:?}, {needed} byte block");

        Ok(Some(payload))
    }

    /// Releases the block behind `payload` and merges it with any free memory
    /// neighbors.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by [`Self::allocate`] on this heap
    /// and not deallocated since. Violations are undefined behavior, not
    /// detected.
    pub unsafe fn deallocate(&mut self, payload: NonNull<u8>) {
        let block = BlockHeader::from_payload_address(payload);
        let tags = BlockHeader::tags_of(block).with_used(false);

        BlockHeader::set_tags_of(block, tags);
        BlockHeader::write_footer(block);

        let following = BlockHeader::following(block);
        BlockHeader::set_tags_of(
            following,
            BlockHeader::tags_of(following).with_preceding_used(false),
        );

        trace!("deallocate({payload:?}), {} byte block", tags.size());

        self.free_blocks.insert(block);
        self.coalesce(block);
    }

    /// Merges `block` with any immediately adjacent free blocks, in address
    /// order. Called on a block already inserted into the free list; if any
    /// neighbor is absorbed the merged result is re-linked and `block` itself
    /// becomes invalid.
    unsafe fn coalesce(&mut self, block: NonNull<BlockHeader>) {
        let old_size = BlockHeader::tags_of(block).size();
        let mut new_size = old_size;

        // Backward pass: while the block under the cursor says its memory
        // predecessor is free, recover that predecessor's size from the
        // footer right before the cursor and absorb it.
        let mut cursor = block;
        while !BlockHeader::tags_of(cursor).preceding_used() {
            let size = BlockHeader::preceding_footer_of(cursor).size();
            let preceding =
                NonNull::new_unchecked(cursor.as_ptr().cast::<u8>().sub(size)).cast::<BlockHeader>();

            self.free_blocks.remove(preceding);
            new_size += size;
            cursor = preceding;
        }
        let merged = cursor;

        // Forward pass, naturally bounded by the sentinel's used bit.
        let mut cursor = BlockHeader::following(block);
        while !BlockHeader::tags_of(cursor).is_used() {
            self.free_blocks.remove(cursor);
            new_size += BlockHeader::tags_of(cursor).size();
            cursor = BlockHeader::following(cursor);
        }

        if new_size != old_size {
            // The original entry's boundaries changed, so re-link it as one
            // block. The leftmost absorbed block's predecessor must be used,
            // otherwise it would have been absorbed too.
            self.free_blocks.remove(block);

            BlockHeader::set_tags_of(
                merged,
                SizeAndTags::new(new_size).with_preceding_used(true),
            );
            BlockHeader::write_footer(merged);

            self.free_blocks.insert(merged);

            trace!(
                "coalesced {old_size} byte block at {block:?} into {new_size} bytes at {merged:?}"
            );
        }
    }

    /// Extends the heap by enough pages to fit a block of `min_size` bytes.
    /// The word that was the end-of-heap sentinel becomes the new block's
    /// header, keeping the heap gapless; a fresh sentinel is written at the
    /// new top. The new block is inserted and immediately coalesced, since a
    /// free block may have been sitting at the old heap end.
    unsafe fn grow(&mut self, min_size: usize) -> Result<(), AllocError> {
        let page_size = self.source.page_size();
        let total_size = min_size.div_ceil(page_size) * page_size;

        let Some(address) = self.source.extend(total_size) else {
            return Err(AllocError {
                requested: total_size,
            });
        };

        let block =
            NonNull::new_unchecked(address.as_ptr().sub(WORD_SIZE)).cast::<BlockHeader>();
        let preceding_used = BlockHeader::tags_of(block).preceding_used();

        BlockHeader::set_tags_of(
            block,
            SizeAndTags::new(total_size).with_preceding_used(preceding_used),
        );
        BlockHeader::write_footer(block);
        BlockHeader::set_tags_of(BlockHeader::following(block), SENTINEL);

        self.free_blocks.insert(block);
        self.coalesce(block);

        debug!("extended heap by {total_size} bytes for a {min_size} byte request");

        Ok(())
    }

    /// The memory source underneath this heap, mainly to query its bounds.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Logs every block of the heap in address order at debug level. Purely
    /// diagnostic.
    pub fn dump(&self) {
        let (Some(low), Some(high)) = (self.source.heap_low(), self.source.heap_high()) else {
            return;
        };

        debug!(
            "heap [{:#x}, {:#x}), free list head {:?}, {} free blocks",
            low.as_ptr() as usize,
            high.as_ptr() as usize,
            self.free_blocks.head,
            self.free_blocks.len,
        );

        unsafe {
            let mut block = low.cast::<BlockHeader>();

            loop {
                let tags = BlockHeader::tags_of(block);
                if tags.size() == 0 {
                    debug!("{:#x}: end of heap", block.as_ptr() as usize);
                    break;
                }

                if tags.is_used() {
                    debug!(
                        "{:#x}: {} bytes, preceding_used={}, USED",
                        block.as_ptr() as usize,
                        tags.size(),
                        tags.preceding_used(),
                    );
                } else {
                    debug!(
                        "{:#x}: {} bytes, preceding_used={}, FREE, next={:?}, prev={:?}",
                        block.as_ptr() as usize,
                        tags.size(),
                        tags.preceding_used(),
                        (*block.as_ptr()).next,
                        (*block.as_ptr()).prev,
                    );
                }

                block = BlockHeader::following(block);
            }
        }
    }
}
