//! Value-profile site lists.
//!
//! Each value site is a singly linked list of `ValueProfNode`s allocated by
//! the profiled binary's runtime. Resetting a site only clears counts, so the
//! traversal hands out `&mut u64` for the `count` field and nothing else:
//! `value` and `next` are unreachable through it.

use std::marker::PhantomData;
use std::ptr;

/// One observed value at a value-profile site
#[derive(Debug)]
#[repr(C)]
pub struct ValueProfNode {
    /// Observed value (call target, copy size, ...)
    pub value: u64,
    /// Number of times `value` was observed
    pub count: u64,
    /// Next node of the same site, or null
    pub next: *mut ValueProfNode,
}

impl ValueProfNode {
    /// Create an unlinked node
    #[must_use]
    pub const fn new(value: u64, count: u64) -> Self {
        Self {
            value,
            count,
            next: ptr::null_mut(),
        }
    }
}

/// Non-owning iterator over the `count` fields of one site list
#[derive(Debug)]
pub struct SiteCounts<'a> {
    cursor: *mut ValueProfNode,
    _nodes: PhantomData<&'a mut u64>,
}

impl SiteCounts<'_> {
    /// Start at `head`; a null head yields nothing
    ///
    /// # Safety
    ///
    /// Every node reachable from `head` must be valid for reads and writes
    /// for the iterator's lifetime, the list must be null-terminated and acyclic, and nothing
    /// else may access the nodes while the iterator or its items are alive.
    #[must_use]
    pub unsafe fn new(head: *mut ValueProfNode) -> Self {
        Self {
            cursor: head,
            _nodes: PhantomData,
        }
    }
}

impl<'a> Iterator for SiteCounts<'a> {
    type Item = &'a mut u64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_null() {
            return None;
        }
        let node = self.cursor;
        // SAFETY: `new` guarantees every reachable node is live and unaliased;
        // `next` is read before the count is handed out and never written.
        unsafe {
            self.cursor = ptr::addr_of!((*node).next).read();
            Some(&mut *ptr::addr_of_mut!((*node).count))
        }
    }
}

impl std::iter::FusedIterator for SiteCounts<'_> {}

/// Clear every count in the list starting at `head`; returns the node count
///
/// # Safety
///
/// Same contract as [`SiteCounts::new`].
pub unsafe fn clear_site(head: *mut ValueProfNode) -> usize {
    let mut nodes = 0;
    for count in SiteCounts::new(head) {
        *count = 0;
        nodes += 1;
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(nodes: &mut [ValueProfNode]) -> *mut ValueProfNode {
        for i in (0..nodes.len().saturating_sub(1)).rev() {
            let next: *mut ValueProfNode = &mut nodes[i + 1];
            nodes[i].next = next;
        }
        nodes.first_mut().map_or(ptr::null_mut(), |n| n as *mut _)
    }

    #[test]
    fn test_null_head_is_empty() {
        let mut counts = unsafe { SiteCounts::new(ptr::null_mut()) };
        assert!(counts.next().is_none());
        assert!(counts.next().is_none());
    }

    #[test]
    fn test_visits_every_count_in_order() {
        let mut nodes = [
            ValueProfNode::new(0xa, 1),
            ValueProfNode::new(0xb, 2),
            ValueProfNode::new(0xc, 3),
        ];
        let head = chain(&mut nodes);
        let seen: Vec<u64> = unsafe { SiteCounts::new(head) }.map(|c| *c).collect();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_clear_keeps_links_and_values() {
        let mut nodes = [
            ValueProfNode::new(0xa, 10),
            ValueProfNode::new(0xb, 20),
            ValueProfNode::new(0xc, 30),
        ];
        let head = chain(&mut nodes);
        let links: Vec<*mut ValueProfNode> = nodes.iter().map(|n| n.next).collect();

        let cleared = unsafe { clear_site(head) };

        assert_eq!(cleared, 3);
        assert!(nodes.iter().all(|n| n.count == 0));
        assert_eq!(nodes.iter().map(|n| n.next).collect::<Vec<_>>(), links);
        assert_eq!(nodes.iter().map(|n| n.value).collect::<Vec<_>>(), vec![0xa, 0xb, 0xc]);
    }
}
