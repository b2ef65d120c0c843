//! Per-core free pools with cross-core balancing.
//!
//! Each core owns one [`FreeList`] behind its own [`SpinLock`]. A core
//! allocates from and frees into its own pool. Only when its pool runs dry
//! does it go looking in the others:
//!
//! ```text
//!   acquire(core 0)
//!      │ local pool empty
//!      ▼
//!   lock cores 0 and 1 ─ core 1 empty ─ unlock both
//!   lock cores 0 and 2 ─ detach up to `share` pages from core 2,
//!      │                 keep the first, splice the rest into core 0
//!      ▼
//!   unlock both
//! ```
//!
//! `share` is an even split of all free pages over all cores. A migration
//! holds the thief's and the donor's lock together, so a page is always in
//! exactly one pool or handed out. Two pool locks are only ever taken in
//! ascending core order.

use crate::error::KernelFatal;
use crate::free_list::{FreeList, PageLinks};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::memory::MAX_CPUS;
use kernel_sync::{LockStats, SpinLock, SpinLockGuard};

/// Pool lock names, one per core.
const LOCK_NAMES: [&str; MAX_CPUS] = [
    "kmem_cpu0",
    "kmem_cpu1",
    "kmem_cpu2",
    "kmem_cpu3",
    "kmem_cpu4",
    "kmem_cpu5",
    "kmem_cpu6",
    "kmem_cpu7",
];

/// Identity of an execution core.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CoreId(usize);

impl CoreId {
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl From<usize> for CoreId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

struct CorePool {
    list: SpinLock<FreeList>,
    /// Mirror of `list.len()`, written under the lock, read without it.
    len: AtomicUsize,
}

impl CorePool {
    fn new(core: usize) -> Self {
        let name = LOCK_NAMES.get(core).copied().unwrap_or("kmem");
        Self {
            list: SpinLock::named(name, FreeList::new()),
            len: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn publish_len(&self, list: &FreeList) {
        self.len.store(list.len(), Ordering::Relaxed);
    }
}

/// One free pool per core over a shared set of page indices.
pub struct PagePools {
    links: PageLinks,
    pools: Box<[CorePool]>,
}

impl PagePools {
    /// Empty pools for `cores` cores over `pages` page indices.
    #[must_use]
    pub fn new(pages: usize, cores: usize) -> Self {
        let pools: Vec<CorePool> = (0..cores).map(CorePool::new).collect();
        Self {
            links: PageLinks::new(pages),
            pools: pools.into_boxed_slice(),
        }
    }

    #[inline]
    #[must_use]
    pub fn cores(&self) -> usize {
        self.pools.len()
    }

    fn pool(&self, core: CoreId) -> Result<&CorePool, KernelFatal> {
        self.pools
            .get(core.index())
            .ok_or(KernelFatal::NoSuchCore(core))
    }

    /// Takes one free page, preferring `core`'s own pool.
    ///
    /// Returns `Ok(None)` once every pool has been found empty.
    ///
    /// # Errors
    /// [`KernelFatal::NoSuchCore`] for an unknown core.
    pub fn acquire(&self, core: CoreId) -> Result<Option<u32>, KernelFatal> {
        let local = self.pool(core)?;
        let popped = local.list.with_lock(|list| {
            let idx = list.pop(&self.links);
            local.publish_len(list);
            idx
        });

        if popped.is_some() {
            return Ok(popped);
        }
        Ok(self.steal(core, local))
    }

    /// Locks `a` and `b` in ascending core order and returns their guards in
    /// argument order.
    fn lock_pair(
        &self,
        a: usize,
        b: usize,
    ) -> (SpinLockGuard<'_, FreeList>, SpinLockGuard<'_, FreeList>) {
        debug_assert_ne!(a, b);
        if a < b {
            let first = self.pools[a].list.lock();
            (first, self.pools[b].list.lock())
        } else {
            let first = self.pools[b].list.lock();
            (self.pools[a].list.lock(), first)
        }
    }

    /// Moves a batch from the first non-empty donor into `local`, keeping one
    /// page for the caller.
    fn steal(&self, core: CoreId, local: &CorePool) -> Option<u32> {
        let cores = self.cores();
        let share = (self.approx_free() / cores).max(1);

        for offset in 1..cores {
            let donor_id = (core.index() + offset) % cores;
            let donor = &self.pools[donor_id];
            let (mut own, mut theirs) = self.lock_pair(core.index(), donor_id);

            // Someone may have freed into our pool since we last looked.
            if let Some(idx) = own.pop(&self.links) {
                local.publish_len(&own);
                return Some(idx);
            }

            let Some(chain) = theirs.detach(&self.links, share) else {
                continue;
            };
            donor.publish_len(&theirs);

            log::debug!(
                "{core}: took {} free pages from {} (share {share})",
                chain.len(),
                donor.list.name()
            );

            let (first, rest) = chain.split_first(&self.links);
            if let Some(rest) = rest {
                own.splice(&self.links, rest);
                local.publish_len(&own);
            }
            return Some(first);
        }

        log::trace!("{core}: no free page on any core");
        None
    }

    /// Puts page `idx` on top of `core`'s pool.
    ///
    /// The caller must own the page; it must not be in any pool.
    ///
    /// # Errors
    /// [`KernelFatal::NoSuchCore`] for an unknown core.
    pub fn release(&self, core: CoreId, idx: u32) -> Result<(), KernelFatal> {
        let pool = self.pool(core)?;
        pool.list.with_lock(|list| {
            list.push(&self.links, idx);
            pool.publish_len(list);
        });
        Ok(())
    }

    /// Total number of free pages across every pool.
    ///
    /// Locks the pools one after the other, so the sum may be stale by the
    /// time it is returned.
    #[must_use]
    pub fn count_free(&self) -> usize {
        self.pools
            .iter()
            .map(|pool| pool.list.with_lock(|list| list.len()))
            .sum()
    }

    /// Number of free pages in `core`'s pool alone.
    ///
    /// # Errors
    /// [`KernelFatal::NoSuchCore`] for an unknown core.
    pub fn local_count(&self, core: CoreId) -> Result<usize, KernelFatal> {
        let pool = self.pool(core)?;
        Ok(pool.list.with_lock(|list| list.len()))
    }

    /// Lock-free estimate of [`count_free`](Self::count_free).
    #[must_use]
    pub fn approx_free(&self) -> usize {
        self.pools
            .iter()
            .map(|pool| pool.len.load(Ordering::Relaxed))
            .sum()
    }

    /// Usage counters of every pool lock, by core.
    pub fn lock_stats(&self) -> impl Iterator<Item = (CoreId, LockStats)> + '_ {
        self.pools
            .iter()
            .enumerate()
            .map(|(i, pool)| (CoreId::new(i), pool.list.stats()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn seeded(pages: u32, cores: usize, core: usize) -> PagePools {
        let pools = PagePools::new(pages as usize, cores);
        for idx in 0..pages {
            pools.release(CoreId::new(core), idx).unwrap();
        }
        pools
    }

    #[test]
    fn local_pool_is_lifo() {
        let pools = seeded(4, 1, 0);
        let cpu0 = CoreId::new(0);
        assert_eq!(pools.acquire(cpu0).unwrap(), Some(3));
        pools.release(cpu0, 3).unwrap();
        assert_eq!(pools.acquire(cpu0).unwrap(), Some(3));
        assert_eq!(pools.count_free(), 3);
    }

    #[test]
    fn exhaustion_is_not_an_error() {
        let pools = seeded(2, 2, 1);
        let cpu0 = CoreId::new(0);
        assert!(pools.acquire(cpu0).unwrap().is_some());
        assert!(pools.acquire(cpu0).unwrap().is_some());
        assert_eq!(pools.acquire(cpu0).unwrap(), None);
        assert_eq!(pools.acquire(CoreId::new(1)).unwrap(), None);

        pools.release(CoreId::new(1), 0).unwrap();
        assert_eq!(pools.acquire(cpu0).unwrap(), Some(0));
    }

    #[test]
    fn steal_moves_an_even_share() {
        let pools = PagePools::new(120, 4);
        for donor in 1..4u32 {
            for n in 0..40 {
                pools.release(CoreId::new(donor as usize), donor * 40 - 40 + n).unwrap();
            }
        }

        let cpu0 = CoreId::new(0);
        assert!(pools.acquire(cpu0).unwrap().is_some());

        assert_eq!(pools.count_free(), 119);
        assert_eq!(pools.local_count(cpu0).unwrap(), 29);
        assert_eq!(pools.local_count(CoreId::new(1)).unwrap(), 10);
        assert_eq!(pools.local_count(CoreId::new(2)).unwrap(), 40);
        assert_eq!(pools.local_count(CoreId::new(3)).unwrap(), 40);
    }

    #[test]
    fn steal_visits_donors_round_robin() {
        let pools = PagePools::new(8, 4);
        pools.release(CoreId::new(1), 0).unwrap();
        pools.release(CoreId::new(3), 1).unwrap();

        // core 2 looks at 3 before wrapping around to 1
        assert_eq!(pools.acquire(CoreId::new(2)).unwrap(), Some(1));
        assert_eq!(pools.acquire(CoreId::new(2)).unwrap(), Some(0));
    }

    #[test]
    fn thief_holds_its_own_pool_while_taking_from_a_donor() {
        let pools = Arc::new(seeded(4, 2, 1));
        let donor = pools.pools[1].list.lock();

        let thief = {
            let pools = Arc::clone(&pools);
            thread::spawn(move || pools.acquire(CoreId::new(0)).unwrap())
        };

        // the thief spins on the donor lock with its own pool already locked
        while pools.pools[1].list.stats().contended == 0 {
            thread::yield_now();
        }
        assert!(pools.pools[0].list.is_locked());
        assert!(pools.pools[0].list.try_lock().is_none());
        drop(donor);

        assert_eq!(thief.join().unwrap(), Some(3));
        assert_eq!(pools.local_count(CoreId::new(0)).unwrap(), 1);
        assert_eq!(pools.local_count(CoreId::new(1)).unwrap(), 2);

        let cpu1 = CoreId::new(1);
        let drained: Vec<_> = std::iter::from_fn(|| pools.acquire(cpu1).unwrap()).collect();
        assert_eq!(drained, vec![1, 0, 2]);
        assert_eq!(pools.count_free(), 0);
    }

    #[test]
    fn steal_prefers_pages_freed_into_the_local_pool() {
        let pools = PagePools::new(2, 2);
        let cpu0 = CoreId::new(0);
        pools.release(CoreId::new(1), 1).unwrap();
        // freed into core 0 after its own pop came up empty
        pools.release(cpu0, 0).unwrap();

        assert_eq!(pools.steal(cpu0, &pools.pools[0]), Some(0));
        assert_eq!(pools.local_count(CoreId::new(1)).unwrap(), 1);
    }

    #[test]
    fn every_pool_lock_has_its_own_name() {
        let pools = PagePools::new(0, MAX_CPUS);
        let mut names: Vec<_> = pools.pools.iter().map(|pool| pool.list.name()).collect();
        assert_eq!(names[0], "kmem_cpu0");
        assert_eq!(names[MAX_CPUS - 1], "kmem_cpu7");

        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), MAX_CPUS);
    }

    #[test]
    fn unknown_core_is_fatal() {
        let pools = seeded(1, 2, 0);
        assert_eq!(
            pools.acquire(CoreId::new(2)),
            Err(KernelFatal::NoSuchCore(CoreId::new(2)))
        );
        assert!(pools.release(CoreId::new(5), 0).is_err());
        assert!(pools.local_count(CoreId::new(2)).is_err());
    }

    #[test]
    fn concurrent_acquire_hands_out_each_page_once() {
        const CORES: usize = 4;
        const PAGES: u32 = 400;

        let pools = Arc::new(seeded(PAGES, CORES, 0));
        let barrier = Arc::new(Barrier::new(CORES));

        let handles: Vec<_> = (0..CORES)
            .map(|core| {
                let pools = Arc::clone(&pools);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut got = Vec::new();
                    while let Some(idx) = pools.acquire(CoreId::new(core)).unwrap() {
                        got.push(idx);
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..PAGES).collect::<Vec<_>>());
        assert_eq!(pools.count_free(), 0);
    }

    #[test]
    fn lock_stats_are_per_core() {
        let pools = seeded(2, 2, 0);
        let stats: Vec<_> = pools.lock_stats().collect();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].1.acquisitions, 2);
        assert_eq!(stats[1].1.acquisitions, 0);
    }
}
