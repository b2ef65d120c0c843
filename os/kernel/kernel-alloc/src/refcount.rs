//! One-byte reference counts for every managed page.
//!
//! A count is the number of live mappings of a page. Zero means the page is
//! free. Every update is a single compare-and-swap on the page's own counter,
//! so concurrent updates to one page never get lost and updates to different
//! pages never contend.

use crate::config::ManagedRange;
use crate::error::KernelFatal;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};
use kernel_info::memory::MAX_REF_COUNT;
use kernel_memory_addresses::PhysicalPage;

pub struct RefCountTable {
    range: ManagedRange,
    counts: Box<[AtomicU8]>,
}

impl RefCountTable {
    /// A table with every count at zero.
    #[must_use]
    pub fn new(range: ManagedRange) -> Self {
        let counts: Vec<AtomicU8> = (0..range.pages).map(|_| AtomicU8::new(0)).collect();
        Self {
            range,
            counts: counts.into_boxed_slice(),
        }
    }

    fn slot(&self, page: PhysicalPage) -> Result<&AtomicU8, KernelFatal> {
        if page < self.range.base {
            return Err(KernelFatal::Untracked(page.base()));
        }
        self.range
            .index_of(page)
            .map(|idx| &self.counts[idx])
            .ok_or(KernelFatal::OutOfRange(page.base()))
    }

    /// Sets the count of a freshly allocated page to one.
    ///
    /// # Errors
    /// [`KernelFatal::Untracked`] or [`KernelFatal::OutOfRange`].
    pub fn init_count(&self, page: PhysicalPage) -> Result<(), KernelFatal> {
        self.slot(page)?.store(1, Ordering::Release);
        Ok(())
    }

    /// Adds one mapping and returns the new count.
    ///
    /// # Errors
    /// [`KernelFatal::RefCountOverflow`] at [`MAX_REF_COUNT`], otherwise as
    /// [`init_count`](Self::init_count).
    pub fn increment(&self, page: PhysicalPage) -> Result<u8, KernelFatal> {
        self.slot(page)?
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c < MAX_REF_COUNT {
                    c.checked_add(1)
                } else {
                    None
                }
            })
            .map(|prev| prev + 1)
            .map_err(|_| KernelFatal::RefCountOverflow(page))
    }

    /// Drops one mapping and returns the remaining count.
    ///
    /// # Errors
    /// [`KernelFatal::RefCountUnderflow`] if the count is already zero,
    /// otherwise as [`init_count`](Self::init_count).
    pub fn decrement(&self, page: PhysicalPage) -> Result<u8, KernelFatal> {
        self.slot(page)?
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .map(|prev| prev - 1)
            .map_err(|_| KernelFatal::RefCountUnderflow(page))
    }

    /// # Errors
    /// As [`init_count`](Self::init_count).
    pub fn query(&self, page: PhysicalPage) -> Result<u8, KernelFatal> {
        Ok(self.slot(page)?.load(Ordering::Acquire))
    }

    /// Forces the count to zero. Only for seeding the free pools at boot.
    ///
    /// # Errors
    /// As [`init_count`](Self::init_count).
    pub fn reset(&self, page: PhysicalPage) -> Result<(), KernelFatal> {
        self.slot(page)?.store(0, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use kernel_memory_addresses::PhysicalAddress;
    use std::sync::Arc;
    use std::thread;

    const BASE: u64 = 0x8020_0000;

    fn table(pages: u64) -> RefCountTable {
        let range = MemoryConfig::with_pages(PhysicalAddress::new(BASE), pages, 1)
            .validate()
            .unwrap();
        RefCountTable::new(range)
    }

    fn page(n: u64) -> PhysicalPage {
        PhysicalPage::containing(PhysicalAddress::new(BASE + n * 4096))
    }

    #[test]
    fn count_lifecycle() {
        let t = table(4);
        assert_eq!(t.query(page(1)), Ok(0));
        t.init_count(page(1)).unwrap();
        assert_eq!(t.increment(page(1)), Ok(2));
        assert_eq!(t.decrement(page(1)), Ok(1));
        assert_eq!(t.decrement(page(1)), Ok(0));
        assert_eq!(
            t.decrement(page(1)),
            Err(KernelFatal::RefCountUnderflow(page(1)))
        );
        assert_eq!(t.query(page(1)), Ok(0));
    }

    #[test]
    fn overflow_is_refused_and_leaves_count_intact() {
        let t = table(1);
        t.init_count(page(0)).unwrap();
        for _ in 1..MAX_REF_COUNT {
            t.increment(page(0)).unwrap();
        }
        assert_eq!(t.query(page(0)), Ok(MAX_REF_COUNT));
        assert_eq!(
            t.increment(page(0)),
            Err(KernelFatal::RefCountOverflow(page(0)))
        );
        assert_eq!(t.query(page(0)), Ok(MAX_REF_COUNT));
    }

    #[test]
    fn page_just_below_base_is_untracked() {
        let t = table(2);
        let below = PhysicalPage::containing(PhysicalAddress::new(BASE - 4096));
        let err = KernelFatal::Untracked(PhysicalAddress::new(BASE - 4096));
        assert_eq!(t.query(below), Err(err));
        assert_eq!(t.increment(below), Err(err));
        assert_eq!(t.decrement(below), Err(err));
        assert_eq!(t.init_count(below), Err(err));
        assert_eq!(t.reset(below), Err(err));
    }

    #[test]
    fn page_at_top_is_out_of_range() {
        let t = table(2);
        assert_eq!(
            t.query(page(2)),
            Err(KernelFatal::OutOfRange(page(2).base()))
        );
    }

    #[test]
    fn reset_forces_zero() {
        let t = table(1);
        t.init_count(page(0)).unwrap();
        t.increment(page(0)).unwrap();
        t.reset(page(0)).unwrap();
        assert_eq!(t.query(page(0)), Ok(0));
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let t = Arc::new(table(1));
        t.init_count(page(0)).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = Arc::clone(&t);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        t.increment(page(0)).unwrap();
                        t.decrement(page(0)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(t.query(page(0)), Ok(1));
    }
}
