use std::ptr::NonNull;

use crate::{block::BlockHeader, Pointer};

/// Intrusive doubly linked list over all currently free blocks. The links
/// live inside the freed payloads themselves (see [`BlockHeader`]), so the
/// list never allocates. We are the allocator, we couldn't anyway.
///
/// Insertion is LIFO: the most recently freed or created block becomes the
/// head and is therefore the first candidate of the next search. Combined
/// with first-fit this gives O(1) insertion and removal at the cost of some
/// fragmentation, which is an accepted trade-off here, not an oversight.
///
/// List order is completely unrelated to memory address order. A block right
/// next to the head in memory can sit at the other end of the list.
pub(crate) struct FreeList {
    /// Most recently inserted free block.
    pub head: Pointer<BlockHeader>,
    /// Number of blocks in the list.
    pub len: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Inserts `block` at the head of the list.
    ///
    /// # Safety
    ///
    /// `block` must point to a valid free block that is not already linked.
    pub unsafe fn insert(&mut self, block: NonNull<BlockHeader>) {
        if let Some(old_head) = self.head {
            (*old_head.as_ptr()).prev = Some(block);
        }

        (*block.as_ptr()).next = self.head;
        (*block.as_ptr()).prev = None;

        self.head = Some(block);
        self.len += 1;
    }

    /// Detaches `block` from wherever it sits in the list. Handles the head,
    /// tail, sole element and interior cases.
    ///
    /// # Safety
    ///
    /// `block` must currently be linked into this list.
    pub unsafe fn remove(&mut self, block: NonNull<BlockHeader>) {
        let next = (*block.as_ptr()).next;
        let prev = (*block.as_ptr()).prev;

        if let Some(next) = next {
            (*next.as_ptr()).prev = prev;
        }

        match prev {
            Some(prev) => (*prev.as_ptr()).next = next,
            None => {
                debug_assert!(self.head == Some(block));
                self.head = next;
            }
        }

        self.len -= 1;
    }

    /// Linear first-fit scan: returns the first block in list order whose
    /// size is at least `min_size`, or `None`. No best-fit, no reordering.
    pub unsafe fn first_fit(&self, min_size: usize) -> Pointer<BlockHeader> {
        let mut current = self.head;

        while let Some(block) = current {
            if BlockHeader::tags_of(block).size() >= min_size {
                return Some(block);
            }
            current = (*block.as_ptr()).next;
        }

        None
    }

    /// Iterates over the list in link order.
    ///
    /// # Safety
    ///
    /// The list must not be mutated while the iterator is alive.
    pub unsafe fn iter(&self) -> Iter {
        Iter { current: self.head }
    }
}

pub(crate) struct Iter {
    current: Pointer<BlockHeader>,
}

impl Iterator for Iter {
    type Item = NonNull<BlockHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;
        self.current = unsafe { (*block.as_ptr()).next };
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::MIN_BLOCK_SIZE, tag::SizeAndTags};

    /// Backing storage for list nodes. Boxes keep the addresses stable.
    fn blocks(count: usize) -> Vec<Box<BlockHeader>> {
        (0..count)
            .map(|_| {
                Box::new(BlockHeader {
                    size_and_tags: SizeAndTags::new(MIN_BLOCK_SIZE),
                    next: None,
                    prev: None,
                })
            })
            .collect()
    }

    fn pointers(storage: &mut [Box<BlockHeader>]) -> Vec<NonNull<BlockHeader>> {
        storage.iter_mut().map(|b| NonNull::from(&mut **b)).collect()
    }

    #[test]
    fn insertion_is_lifo() {
        let mut storage = blocks(3);
        let nodes = pointers(&mut storage);
        let mut list = FreeList::new();

        unsafe {
            for node in &nodes {
                list.insert(*node);
            }

            let order: Vec<_> = list.iter().collect();
            assert_eq!(order, vec![nodes[2], nodes[1], nodes[0]]);
            assert_eq!(list.len, 3);
            assert_eq!((*nodes[2].as_ptr()).prev, None);
            assert_eq!((*nodes[0].as_ptr()).next, None);
        }
    }

    #[test]
    fn remove_head_interior_and_tail() {
        let mut storage = blocks(4);
        let nodes = pointers(&mut storage);
        let mut list = FreeList::new();

        unsafe {
            for node in &nodes {
                list.insert(*node);
            }

            // List order is [3, 2, 1, 0]. Remove the head.
            list.remove(nodes[3]);
            assert_eq!(list.iter().collect::<Vec<_>>(), vec![nodes[2], nodes[1], nodes[0]]);

            // Interior.
            list.remove(nodes[1]);
            assert_eq!(list.iter().collect::<Vec<_>>(), vec![nodes[2], nodes[0]]);
            assert_eq!((*nodes[0].as_ptr()).prev, Some(nodes[2]));

            // Tail.
            list.remove(nodes[0]);
            assert_eq!(list.iter().collect::<Vec<_>>(), vec![nodes[2]]);
            assert_eq!((*nodes[2].as_ptr()).next, None);

            // Sole element.
            list.remove(nodes[2]);
            assert_eq!(list.head, None);
            assert_eq!(list.len, 0);
        }
    }

    #[test]
    fn first_fit_returns_first_match_in_list_order() {
        let mut storage = blocks(3);
        let nodes = pointers(&mut storage);
        let mut list = FreeList::new();

        unsafe {
            BlockHeader::set_tags_of(nodes[0], SizeAndTags::new(64));
            BlockHeader::set_tags_of(nodes[1], SizeAndTags::new(128));
            BlockHeader::set_tags_of(nodes[2], SizeAndTags::new(32));

            for node in &nodes {
                list.insert(*node);
            }

            // List order is [32, 128, 64]: the 128 block comes before the
            // equally adequate 64 one.
            assert_eq!(list.first_fit(48), Some(nodes[1]));
            assert_eq!(list.first_fit(32), Some(nodes[2]));
            assert_eq!(list.first_fit(256), None);
        }
    }
}
