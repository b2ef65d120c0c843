//! Index-linked LIFO free lists.
//!
//! Every managed page owns one slot in a shared [`PageLinks`] array holding the
//! index of the next free page. A [`FreeList`] is then just a head index and a
//! length; pushing and popping rewrite a single link. The links of a page are
//! only meaningful while the page is free, and only the holder of the lock
//! guarding the list that contains the page may touch them.
//!
//! ```text
//!  FreeList { head: 7, len: 3 }
//!
//!  links:  [ 0 ][ 1 ][ 2 ][ 3 ][ 4 ][ 5 ][ 6 ][ 7 ]
//!                      NIL            2         4
//!          7 ──► 4 ──► 2 ──► NIL
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

/// Marks the end of a chain.
pub const NIL: u32 = u32::MAX;

/// The "next free" link of every managed page.
///
/// Links are atomics only so the array can be shared between pools without
/// `unsafe`; all accesses are relaxed because the pool locks order them.
pub struct PageLinks {
    next: Box<[AtomicU32]>,
}

impl PageLinks {
    #[must_use]
    pub fn new(pages: usize) -> Self {
        debug_assert!(pages < NIL as usize, "too many pages for 32-bit links");
        let next: Vec<AtomicU32> = (0..pages).map(|_| AtomicU32::new(NIL)).collect();
        Self {
            next: next.into_boxed_slice(),
        }
    }

    #[inline]
    fn next(&self, idx: u32) -> u32 {
        self.next[idx as usize].load(Ordering::Relaxed)
    }

    #[inline]
    fn set_next(&self, idx: u32, next: u32) {
        self.next[idx as usize].store(next, Ordering::Relaxed);
    }
}

/// A run of free pages detached from a list, still linked head to tail.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Chain {
    head: u32,
    tail: u32,
    len: usize,
}

impl Chain {
    #[inline]
    #[must_use]
    pub const fn head(&self) -> u32 {
        self.head
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Splits off the head page, returning it and the remainder (if any).
    #[must_use]
    pub fn split_first(self, links: &PageLinks) -> (u32, Option<Self>) {
        debug_assert!(!self.is_empty());
        if self.len == 1 {
            return (self.head, None);
        }
        let rest = Self {
            head: links.next(self.head),
            tail: self.tail,
            len: self.len - 1,
        };
        links.set_next(self.head, NIL);
        (self.head, Some(rest))
    }
}

/// LIFO stack of free page indices threaded through [`PageLinks`].
#[derive(Debug)]
pub struct FreeList {
    head: u32,
    len: usize,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeList {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: NIL, len: 0 }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, links: &PageLinks, idx: u32) {
        links.set_next(idx, self.head);
        self.head = idx;
        self.len += 1;
    }

    pub fn pop(&mut self, links: &PageLinks) -> Option<u32> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        self.head = links.next(idx);
        links.set_next(idx, NIL);
        self.len -= 1;
        Some(idx)
    }

    /// Detaches up to `max` pages from the top of the list.
    ///
    /// The pages keep their links, so this walks `min(max, len)` links once and
    /// relinks nothing.
    pub fn detach(&mut self, links: &PageLinks, max: usize) -> Option<Chain> {
        let n = max.min(self.len);
        if n == 0 {
            return None;
        }

        let head = self.head;
        let mut tail = head;
        for _ in 1..n {
            tail = links.next(tail);
        }

        self.head = links.next(tail);
        self.len -= n;
        links.set_next(tail, NIL);
        Some(Chain { head, tail, len: n })
    }

    /// Puts a detached chain back on top of this list.
    pub fn splice(&mut self, links: &PageLinks, chain: Chain) {
        links.set_next(chain.tail, self.head);
        self.head = chain.head;
        self.len += chain.len;
    }

    /// Walks the list from the top.
    pub fn iter<'a>(&self, links: &'a PageLinks) -> impl Iterator<Item = u32> + 'a {
        let mut cur = self.head;
        core::iter::from_fn(move || {
            if cur == NIL {
                return None;
            }
            let idx = cur;
            cur = links.next(idx);
            Some(idx)
        })
    }
}
