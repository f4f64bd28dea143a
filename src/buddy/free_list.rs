//! Index-based free list
//!
//! A doubly linked list of free blocks whose nodes live in the zone's
//! [`PageLinks`] table, addressed by the frame number of each block's
//! first page. Insertion at either end and removal are O(1).

#[cfg(feature = "log")]
use log::error;

use super::page_map::PageLinks;

/// Free list - nodes are borrowed from the page link table
///
/// This maintains only the list structure (head/tail/len).
pub struct FreeList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn front(&self) -> Option<usize> {
        self.head
    }

    /// Insert at the head: the block is reused first.
    pub fn push_front(&mut self, links: &mut PageLinks, pfn: usize) {
        let node = links.get_mut(pfn);
        node.prev = None;
        node.next = self.head;
        match self.head {
            Some(old) => links.get_mut(old).prev = Some(pfn),
            None => self.tail = Some(pfn),
        }
        self.head = Some(pfn);
        self.len += 1;
    }

    /// Insert at the tail: the block is reused last.
    pub fn push_back(&mut self, links: &mut PageLinks, pfn: usize) {
        let node = links.get_mut(pfn);
        node.next = None;
        node.prev = self.tail;
        match self.tail {
            Some(old) => links.get_mut(old).next = Some(pfn),
            None => self.head = Some(pfn),
        }
        self.tail = Some(pfn);
        self.len += 1;
    }

    /// Unlink `pfn`, which must currently be on this list.
    pub fn remove(&mut self, links: &mut PageLinks, pfn: usize) {
        if self.len == 0 {
            error!("free list: removing {:#x} from an empty list", pfn);
            panic!("free list corrupted: remove from empty list");
        }
        let node = *links.get(pfn);
        match node.prev {
            Some(prev) => links.get_mut(prev).next = node.next,
            None => {
                if self.head != Some(pfn) {
                    error!("free list: {:#x} has no predecessor but is not head", pfn);
                    panic!("free list corrupted: dangling node");
                }
                self.head = node.next;
            }
        }
        match node.next {
            Some(next) => links.get_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }
        let node = links.get_mut(pfn);
        node.prev = None;
        node.next = None;
        self.len -= 1;
    }

    /// Iterate over the frame numbers on this list, head first.
    pub fn iter<'a>(&'a self, links: &'a PageLinks) -> FreeListIter<'a> {
        FreeListIter {
            links,
            current: self.head,
            remaining: self.len,
        }
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the blocks of a [`FreeList`]
pub struct FreeListIter<'a> {
    links: &'a PageLinks,
    current: Option<usize>,
    remaining: usize,
}

impl Iterator for FreeListIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        // `remaining` bounds the walk in case of a cycle
        if self.remaining == 0 {
            return None;
        }
        let pfn = self.current?;
        self.current = self.links.get(pfn).next;
        self.remaining -= 1;
        Some(pfn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn collect(list: &FreeList, links: &PageLinks) -> Vec<usize> {
        list.iter(links).collect()
    }

    #[test]
    fn test_push_front_and_back() {
        let mut links = PageLinks::new(100, 16);
        let mut list = FreeList::new();
        list.push_front(&mut links, 104);
        list.push_front(&mut links, 102);
        list.push_back(&mut links, 108);
        assert_eq!(collect(&list, &links), [102, 104, 108]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.front(), Some(102));
    }

    #[test]
    fn test_remove_middle_head_tail() {
        let mut links = PageLinks::new(0, 16);
        let mut list = FreeList::new();
        for pfn in [1, 2, 3, 4] {
            list.push_back(&mut links, pfn);
        }
        list.remove(&mut links, 3);
        assert_eq!(collect(&list, &links), [1, 2, 4]);
        list.remove(&mut links, 1);
        assert_eq!(collect(&list, &links), [2, 4]);
        list.remove(&mut links, 4);
        assert_eq!(collect(&list, &links), [2]);
        list.remove(&mut links, 2);
        assert!(list.is_empty());
        assert_eq!(list.front(), None);

        // List is reusable after being emptied
        list.push_back(&mut links, 7);
        assert_eq!(collect(&list, &links), [7]);
    }

    #[test]
    #[should_panic]
    fn test_remove_from_empty_panics() {
        let mut links = PageLinks::new(0, 4);
        let mut list = FreeList::new();
        list.remove(&mut links, 1);
    }
}
