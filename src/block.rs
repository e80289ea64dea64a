use std::{mem, ptr::NonNull};

use crate::{tag::SizeAndTags, Pointer};

/// Size of a word on this machine. Block headers, footers and the end-of-heap
/// sentinel are all exactly one word.
pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

/// Minimum block size in bytes. A free block has to hold its header, the two
/// free list links and its footer, and no block may ever be smaller than that,
/// used or not, because any block can become free later.
pub(crate) const MIN_BLOCK_SIZE: usize = mem::size_of::<BlockHeader>() + WORD_SIZE;

/// View over the start of a heap block. The first word is the boundary tag and
/// is the only part that exists for every block; `next` and `prev` overlap the
/// payload and are meaningful **only while the block is free**:
///
/// ```text
/// +----------------------------+
/// | size_and_tags              | <- always valid
/// +----------------------------+
/// | next free block            | <- valid while free, payload while used
/// +----------------------------+
/// | prev free block            | <- valid while free, payload while used
/// +----------------------------+
/// |            ...             |
/// +----------------------------+
/// ```
///
/// Because the end-of-heap sentinel is a single word, code that may land on it
/// (forward scans, preceding-used updates) must go through [`Self::tags_of`]
/// and [`Self::set_tags_of`], which touch one word only and never materialize
/// a reference to the whole struct.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Boundary tag: size plus used and preceding-used bits.
    pub size_and_tags: SizeAndTags,
    /// Next block in the free list.
    pub next: Pointer<BlockHeader>,
    /// Previous block in the free list.
    pub prev: Pointer<BlockHeader>,
}

impl BlockHeader {
    /// Returns the block header given the payload address we previously
    /// handed out for it.
    ///
    /// ```text
    /// +-------------+
    /// |   header    | <- Returned address points here.
    /// +-------------+
    /// |   payload   | <- Given address should point here.
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// `address` must be a pointer previously returned by the allocator and
    /// not deallocated since. Anything else is undefined behavior.
    #[inline]
    pub unsafe fn from_payload_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().sub(WORD_SIZE)).cast()
    }

    /// Returns the payload address of `block`, one word past the header.
    ///
    /// We use this as `BlockHeader::payload_address_of(block)` instead of
    /// `block.payload_address()` to avoid creating intermediary references to
    /// `self` and keep Miri happy.
    #[inline]
    pub unsafe fn payload_address_of(block: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(WORD_SIZE))
    }

    /// Reads the boundary tag of `block`. Single word read, safe to use on the
    /// sentinel.
    #[inline]
    pub unsafe fn tags_of(block: NonNull<Self>) -> SizeAndTags {
        block.as_ptr().cast::<SizeAndTags>().read()
    }

    /// Writes the boundary tag of `block`. Single word write, safe to use on
    /// the sentinel.
    #[inline]
    pub unsafe fn set_tags_of(block: NonNull<Self>, tags: SizeAndTags) {
        block.as_ptr().cast::<SizeAndTags>().write(tags)
    }

    /// Returns the block immediately following `block` in memory. For the last
    /// block of the heap this is the sentinel word.
    #[inline]
    pub unsafe fn following(block: NonNull<Self>) -> NonNull<Self> {
        let size = Self::tags_of(block).size();
        NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(size)).cast()
    }

    /// Reads the footer of the block immediately preceding `block` in memory,
    /// the word right before `block`'s header. Only meaningful when the
    /// preceding block is free; that's the whole point of footers.
    #[inline]
    pub unsafe fn preceding_footer_of(block: NonNull<Self>) -> SizeAndTags {
        block
            .as_ptr()
            .cast::<u8>()
            .sub(WORD_SIZE)
            .cast::<SizeAndTags>()
            .read()
    }

    /// Copies the header tag of `block` into its footer word, the last word of
    /// the block. Must only be called on free blocks; for used blocks that
    /// word belongs to the payload.
    #[inline]
    pub unsafe fn write_footer(block: NonNull<Self>) {
        let tags = Self::tags_of(block);
        block
            .as_ptr()
            .cast::<u8>()
            .add(tags.size() - WORD_SIZE)
            .cast::<SizeAndTags>()
            .write(tags);
    }
}
