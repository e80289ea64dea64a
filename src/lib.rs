//! Explicit free-list allocator with boundary tags.
//!
//! The allocator manages a single contiguous heap obtained from a
//! [`MemorySource`] (the Unix program break via [`Sbrk`], or an owned buffer
//! via [`FixedArena`]). Blocks carry a one word header packing their size
//! together with two status bits; free blocks additionally carry a footer so
//! neighbors can be found in both directions:
//!
//! ```text
//! USED: +---------------+   FREE: +---------------+
//!       |    header     |         |    header     |
//!       +---------------+         +---------------+
//!       |  payload and  |         |   next ptr    |
//!       |    padding    |         +---------------+
//!       |       .       |         |   prev ptr    |
//!       |       .       |         +---------------+
//!       |       .       |         |  free space   |
//!       |               |         |      ...      |
//!       |               |         +---------------+
//!       |               |         |    footer     |
//!       +---------------+         +---------------+
//! ```
//!
//! Free blocks form an intrusive doubly linked list with LIFO insertion and
//! first-fit search, and are coalesced with their memory neighbors the moment
//! they are freed, so no two free blocks are ever adjacent. "Next" and
//! "previous" refer to free list order, "following" and "preceding" to memory
//! address order. The two are unrelated.
//!
//! # Examples
//!
//! ```rust
//! use tagalloc::{FixedArena, Heap};
//!
//! let mut heap = Heap::init(FixedArena::new(16 * 1024)).unwrap();
//!
//! unsafe {
//!     let address = heap.allocate(128).unwrap().unwrap();
//!     // Alignment is guaranteed.
//!     assert_eq!(address.as_ptr() as usize % 8, 0);
//!     heap.deallocate(address);
//! }
//! ```
//!
//! The allocator is single threaded and performs no locking; wrap the [`Heap`]
//! in a mutex if it has to be shared. Deallocating a pointer that was not
//! returned by [`Heap::allocate`], or deallocating twice, is undefined
//! behavior and is not detected.

use std::ptr::NonNull;

mod block;
mod check;
mod freelist;
mod heap;
mod source;
mod tag;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use check::ConsistencyError;
pub use heap::{AllocError, Heap};
#[cfg(unix)]
pub use source::Sbrk;
pub use source::{FixedArena, MemorySource};
