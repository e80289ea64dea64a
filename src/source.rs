use std::ptr::NonNull;

use crate::{block::WORD_SIZE, tag::ALIGNMENT, Pointer};

/// Default page size for sources that don't learn it from the OS.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// Abstraction over the raw memory-growth primitive underneath the allocator.
/// The allocator only ever grows its heap, queries its bounds and rounds
/// growth requests to pages; it doesn't care whether the bytes come from the
/// program break, an owned buffer or something else entirely.
pub trait MemorySource {
    /// Grows the managed region by exactly `length` bytes and returns the
    /// address of the start of the new range, or `None` if the source is
    /// exhausted.
    ///
    /// Implementations must hand back zero-initialized memory appended
    /// contiguously to the previously extended range, with the first range
    /// aligned to the allocator's alignment.
    ///
    /// # Safety
    ///
    /// Caller must not request a length of 0 and must not use more than
    /// `length` bytes of the returned range.
    unsafe fn extend(&mut self, length: usize) -> Pointer<u8>;

    /// Lowest address of the managed region, or `None` before the first
    /// successful [`Self::extend`].
    fn heap_low(&self) -> Pointer<u8>;

    /// One past the highest address of the managed region, or `None` before
    /// the first successful [`Self::extend`].
    fn heap_high(&self) -> Pointer<u8>;

    /// Growth granularity hint. [`crate::Heap`] rounds growth requests up to
    /// a multiple of this.
    fn page_size(&self) -> usize;
}

/// [`MemorySource`] over the Unix program break. Every extension moves the
/// break with `sbrk(2)`, which appends to the existing data segment, so the
/// managed region stays contiguous.
///
/// The process must not move the break behind our back between extensions;
/// in particular this source cannot share a process with a `brk`-based libc
/// allocator that is actively allocating.
#[cfg(unix)]
pub struct Sbrk {
    low: Pointer<u8>,
    high: Pointer<u8>,
    page_size: usize,
}

#[cfg(unix)]
impl Sbrk {
    pub fn new() -> Self {
        Self {
            low: None,
            high: None,
            // Only known at runtime, so ask once and keep it.
            page_size: unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize },
        }
    }

    /// `sbrk` reports failure by returning `(void*) -1`.
    fn failed(address: *mut libc::c_void) -> bool {
        address == usize::MAX as *mut libc::c_void
    }
}

#[cfg(unix)]
impl Default for Sbrk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl MemorySource for Sbrk {
    unsafe fn extend(&mut self, length: usize) -> Pointer<u8> {
        // sbrk gives no alignment guarantee, so round the break up before the
        // first extension. Later extensions start aligned because every
        // requested length is a multiple of the alignment.
        if self.low.is_none() {
            let brk = libc::sbrk(0);
            if Self::failed(brk) {
                return None;
            }

            let misalignment = brk as usize % ALIGNMENT;
            if misalignment != 0 {
                let padding = (ALIGNMENT - misalignment) as libc::intptr_t;
                if Self::failed(libc::sbrk(padding)) {
                    return None;
                }
            }
        }

        let address = libc::sbrk(length as libc::intptr_t);
        if Self::failed(address) {
            return None;
        }

        let address = NonNull::new_unchecked(address.cast::<u8>());
        if self.low.is_none() {
            self.low = Some(address);
        }
        self.high = NonNull::new(address.as_ptr().add(length));

        Some(address)
    }

    fn heap_low(&self) -> Pointer<u8> {
        self.low
    }

    fn heap_high(&self) -> Pointer<u8> {
        self.high
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// [`MemorySource`] over an owned, fixed-capacity buffer with a software
/// break. The buffer is word-aligned and zero-filled, and extensions are
/// trivially contiguous, which makes this source the deterministic stand-in
/// for [`Sbrk`] in tests and under Miri.
pub struct FixedArena {
    /// Backing storage. Stored as words so the base address is word-aligned.
    storage: Box<[usize]>,
    /// Base address of the storage, captured once so every pointer we hand
    /// out derives from the same provenance.
    base: NonNull<u8>,
    /// Software break: bytes extended so far.
    brk: usize,
    page_size: usize,
}

impl FixedArena {
    /// Builds an arena able to hold `capacity` bytes, with the default page
    /// size of 4096 bytes.
    pub fn new(capacity: usize) -> Self {
        Self::with_page_size(capacity, DEFAULT_PAGE_SIZE)
    }

    /// Same as [`Self::new`] but with a caller-chosen page size, which makes
    /// heap growth cheap to trigger in tests.
    pub fn with_page_size(capacity: usize, page_size: usize) -> Self {
        let words = capacity.div_ceil(WORD_SIZE);
        let mut storage = vec![0usize; words].into_boxed_slice();
        let base = NonNull::new(storage.as_mut_ptr().cast::<u8>())
            .unwrap_or(NonNull::dangling());

        Self {
            storage,
            base,
            brk: 0,
            page_size,
        }
    }

    fn capacity(&self) -> usize {
        self.storage.len() * WORD_SIZE
    }
}

impl MemorySource for FixedArena {
    unsafe fn extend(&mut self, length: usize) -> Pointer<u8> {
        if length > self.capacity() - self.brk {
            return None;
        }

        let address = NonNull::new_unchecked(self.base.as_ptr().add(self.brk));
        self.brk += length;

        Some(address)
    }

    fn heap_low(&self) -> Pointer<u8> {
        (self.brk > 0).then_some(self.base)
    }

    fn heap_high(&self) -> Pointer<u8> {
        if self.brk == 0 {
            return None;
        }

        NonNull::new(unsafe { self.base.as_ptr().add(self.brk) })
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
