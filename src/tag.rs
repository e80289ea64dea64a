/// Alignment requirement for the allocator. Every block size is a multiple of
/// this value, which is what frees the low bits of the size word for the two
/// status tags.
pub(crate) const ALIGNMENT: usize = 8;

/// Mask covering the bits of a boundary tag that don't belong to the size.
const TAG_MASK: usize = ALIGNMENT - 1;

/// Bit 0 of a boundary tag: whether this block is used/allocated.
const TAG_USED: usize = 1;

/// Bit 1 of a boundary tag: whether the block immediately preceding this one
/// in memory is used/allocated. Kept up to date on every allocation and
/// deallocation, it lets used blocks go without a footer.
const TAG_PRECEDING_USED: usize = 2;

/// A boundary tag: block size and the two status bits packed into one machine
/// word. Headers and footers store exactly this value. Pure bit manipulation,
/// no state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub(crate) struct SizeAndTags(usize);

impl SizeAndTags {
    /// Builds a tag for a block of `size` bytes with both status bits clear.
    /// `size` must be a multiple of [`ALIGNMENT`].
    #[inline]
    pub const fn new(size: usize) -> Self {
        debug_assert!(size & TAG_MASK == 0);
        Self(size)
    }

    /// Size of the block, tags masked off.
    #[inline]
    pub const fn size(self) -> usize {
        self.0 & !TAG_MASK
    }

    #[inline]
    pub const fn is_used(self) -> bool {
        self.0 & TAG_USED != 0
    }

    #[inline]
    pub const fn preceding_used(self) -> bool {
        self.0 & TAG_PRECEDING_USED != 0
    }

    #[inline]
    pub const fn with_used(self, used: bool) -> Self {
        if used {
            Self(self.0 | TAG_USED)
        } else {
            Self(self.0 & !TAG_USED)
        }
    }

    #[inline]
    pub const fn with_preceding_used(self, used: bool) -> Self {
        if used {
            Self(self.0 | TAG_PRECEDING_USED)
        } else {
            Self(self.0 & !TAG_PRECEDING_USED)
        }
    }
}

/// The end-of-heap word: size 0, used bit set. Placed at the top of the
/// managed region so forward scans stop there without special-casing the heap
/// boundary.
pub(crate) const SENTINEL: SizeAndTags = SizeAndTags::new(0).with_used(true);

/// Rounds `size` up to the next multiple of [`ALIGNMENT`].
#[inline]
pub(crate) const fn align_up(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !TAG_MASK
}
