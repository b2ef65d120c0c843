//! The physical memory manager context.

use crate::config::{ConfigError, ManagedRange, MemoryConfig};
use crate::error::KernelFatal;
use crate::phys_mapper::PhysMapper;
use crate::pool::{CoreId, PagePools};
use crate::refcount::RefCountTable;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::{ALLOC_FILL, FREE_FILL};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};
use kernel_sync::LockStats;
use kernel_vmem::MappingObserver;

/// Owns the free pools, the reference counts and the page backing.
///
/// One instance is shared by all cores; every operation takes the calling
/// core explicitly. The first kernel-fatal error any operation detects halts
/// the manager: it is logged once, and from then on every operation fails
/// with [`KernelFatal::Halted`].
pub struct PhysicalMemoryManager<M> {
    range: ManagedRange,
    pools: PagePools,
    refs: RefCountTable,
    mapper: M,
    halted: AtomicBool,
}

impl<M: PhysMapper> PhysicalMemoryManager<M> {
    /// Builds the manager and hands every managed page to the boot core.
    ///
    /// Each page gets a zero reference count and is poisoned with [`FREE_FILL`].
    ///
    /// # Errors
    /// Whatever [`MemoryConfig::validate`] reports, or
    /// [`ConfigError::Unbacked`] if `mapper` cannot reach a managed page.
    pub fn new(config: &MemoryConfig, mapper: M) -> Result<Self, ConfigError> {
        let range = config.validate()?;
        if let Some(page) = range.iter().find(|&p| !mapper.covers(p)) {
            return Err(ConfigError::Unbacked(page));
        }

        let this = Self {
            range,
            pools: PagePools::new(range.pages, config.cores),
            refs: RefCountTable::new(range),
            mapper,
            halted: AtomicBool::new(false),
        };
        this.seed(config.boot_core)
            .map_err(|_| ConfigError::BootCoreOutOfRange {
                boot: config.boot_core,
                cores: config.cores,
            })?;

        log::info!(
            "managing {} pages ({} KiB) at {}..{} on {} cores",
            range.pages,
            range.pages as u64 * PAGE_SIZE / 1024,
            range.base.base(),
            range.top(),
            config.cores
        );
        Ok(this)
    }

    fn seed(&self, boot: CoreId) -> Result<(), KernelFatal> {
        for (idx, page) in self.range.iter().enumerate() {
            self.refs.reset(page)?;
            // SAFETY: nothing else knows about the page yet.
            unsafe { self.mapper.fill_page(page, FREE_FILL) };
            self.pools.release(boot, Self::slot(idx))?;
        }
        log::debug!("seeded {boot} with {} free pages", self.range.pages);
        Ok(())
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    const fn slot(idx: usize) -> u32 {
        // The reference table capacity keeps every index well inside u32.
        idx as u32
    }

    #[must_use]
    pub const fn managed_range(&self) -> ManagedRange {
        self.range
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub fn cores(&self) -> usize {
        self.pools.cores()
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Latches the halt flag and passes `err` through.
    pub(crate) fn fatal(&self, err: KernelFatal) -> KernelFatal {
        if err != KernelFatal::Halted && !self.halted.swap(true, Ordering::AcqRel) {
            log::error!("kernel fatal: {err}; halting physical memory manager");
        }
        err
    }

    pub(crate) fn ensure_running(&self) -> Result<(), KernelFatal> {
        if self.is_halted() {
            Err(KernelFatal::Halted)
        } else {
            Ok(())
        }
    }

    fn checked<T>(&self, r: Result<T, KernelFatal>) -> Result<T, KernelFatal> {
        r.map_err(|e| self.fatal(e))
    }

    /// Hands out one page owned by a single mapping.
    ///
    /// The page is filled with [`ALLOC_FILL`] and its reference count is 1.
    /// `Ok(None)` means no core has a free page left.
    ///
    /// # Errors
    /// [`KernelFatal::NoSuchCore`] or [`KernelFatal::Halted`].
    pub fn acquire_page(&self, core: CoreId) -> Result<Option<PhysicalPage>, KernelFatal> {
        self.ensure_running()?;
        let Some(idx) = self.checked(self.pools.acquire(core))? else {
            return Ok(None);
        };

        let page = self.range.page(idx as usize);
        // SAFETY: the page just left the pool; we are its only holder.
        unsafe { self.mapper.fill_page(page, ALLOC_FILL) };
        self.checked(self.refs.init_count(page))?;

        log::trace!("{core}: acquired {page}");
        Ok(Some(page))
    }

    /// Drops one reference to the page at `addr`.
    ///
    /// When the last reference goes, the page is filled with [`FREE_FILL`] and
    /// pushed onto `core`'s pool. Returns the remaining count.
    ///
    /// # Errors
    /// - [`KernelFatal::Misaligned`] if `addr` is not a page base.
    /// - [`KernelFatal::Untracked`] below and [`KernelFatal::OutOfRange`]
    ///   at or above the managed range.
    /// - [`KernelFatal::RefCountUnderflow`] if the page is already free.
    /// - [`KernelFatal::NoSuchCore`] or [`KernelFatal::Halted`].
    pub fn release_page(&self, core: CoreId, addr: PhysicalAddress) -> Result<u8, KernelFatal> {
        self.ensure_running()?;
        let page = self.checked(self.page_at(addr))?;
        if core.index() >= self.cores() {
            return Err(self.fatal(KernelFatal::NoSuchCore(core)));
        }

        let remaining = self.checked(self.refs.decrement(page))?;
        if remaining == 0 {
            self.reclaim(core, page)?;
        }
        Ok(remaining)
    }

    /// Returns a page whose count just reached zero to `core`'s pool.
    fn reclaim(&self, core: CoreId, page: PhysicalPage) -> Result<(), KernelFatal> {
        let idx = self
            .range
            .index_of(page)
            .ok_or(KernelFatal::OutOfRange(page.base()));
        let idx = self.checked(idx)?;

        // SAFETY: the last reference is gone.
        unsafe { self.mapper.fill_page(page, FREE_FILL) };
        self.checked(self.pools.release(core, Self::slot(idx)))?;
        log::trace!("{core}: released {page}");
        Ok(())
    }

    fn page_at(&self, addr: PhysicalAddress) -> Result<PhysicalPage, KernelFatal> {
        let page = PhysicalPage::from_aligned(addr).ok_or(KernelFatal::Misaligned(addr))?;
        if page < self.range.base {
            return Err(KernelFatal::Untracked(addr));
        }
        if self.range.index_of(page).is_none() {
            return Err(KernelFatal::OutOfRange(addr));
        }
        Ok(page)
    }

    /// Number of free pages across all cores.
    ///
    /// # Errors
    /// [`KernelFatal::Halted`].
    pub fn free_page_count(&self) -> Result<usize, KernelFatal> {
        self.ensure_running()?;
        Ok(self.pools.count_free())
    }

    /// [`free_page_count`](Self::free_page_count) in bytes.
    ///
    /// # Errors
    /// [`KernelFatal::Halted`].
    pub fn free_memory_bytes(&self) -> Result<u64, KernelFatal> {
        Ok(self.free_page_count()? as u64 * PAGE_SIZE)
    }

    /// Number of free pages in `core`'s own pool.
    ///
    /// # Errors
    /// [`KernelFatal::NoSuchCore`] or [`KernelFatal::Halted`].
    pub fn local_free_count(&self, core: CoreId) -> Result<usize, KernelFatal> {
        self.ensure_running()?;
        self.checked(self.pools.local_count(core))
    }

    /// Current reference count of `page`.
    ///
    /// # Errors
    /// [`KernelFatal::Untracked`], [`KernelFatal::OutOfRange`] or
    /// [`KernelFatal::Halted`].
    pub fn ref_count(&self, page: PhysicalPage) -> Result<u8, KernelFatal> {
        self.ensure_running()?;
        self.checked(self.refs.query(page))
    }

    /// Records an additional mapping of `page` and returns the new count.
    ///
    /// # Errors
    /// [`KernelFatal::RefCountOverflow`], [`KernelFatal::Untracked`],
    /// [`KernelFatal::OutOfRange`] or [`KernelFatal::Halted`].
    pub fn mapping_duplicated(&self, page: PhysicalPage) -> Result<u8, KernelFatal> {
        self.ensure_running()?;
        self.checked(self.refs.increment(page))
    }

    /// Drops one reference to `page`, reclaiming it on `core` at zero.
    pub(crate) fn drop_reference(
        &self,
        core: CoreId,
        page: PhysicalPage,
    ) -> Result<u8, KernelFatal> {
        let remaining = self.checked(self.refs.decrement(page))?;
        if remaining == 0 {
            self.reclaim(core, page)?;
        }
        Ok(remaining)
    }

    /// Usage counters of every pool lock.
    pub fn pool_lock_stats(&self) -> impl Iterator<Item = (CoreId, LockStats)> + '_ {
        self.pools.lock_stats()
    }
}

impl<M: PhysMapper> MappingObserver for PhysicalMemoryManager<M> {
    type Error = KernelFatal;

    fn mapping_duplicated(&self, page: PhysicalPage) -> Result<(), KernelFatal> {
        Self::mapping_duplicated(self, page).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys_mapper::PhysicalRam;

    const BASE: u64 = 0x8020_0000;

    fn manager(pages: u64, cores: usize) -> PhysicalMemoryManager<PhysicalRam> {
        let config = MemoryConfig::with_pages(PhysicalAddress::new(BASE), pages, cores);
        let range = config.validate().unwrap();
        PhysicalMemoryManager::new(&config, PhysicalRam::new(range.base, range.pages)).unwrap()
    }

    #[test]
    fn boot_puts_everything_on_the_boot_core() {
        let mm = manager(8, 2);
        assert_eq!(mm.free_page_count(), Ok(8));
        assert_eq!(mm.local_free_count(CoreId::new(0)), Ok(8));
        assert_eq!(mm.local_free_count(CoreId::new(1)), Ok(0));
        assert_eq!(mm.free_memory_bytes(), Ok(8 * PAGE_SIZE));
    }

    #[test]
    fn acquire_poisons_and_counts() {
        let mm = manager(2, 1);
        let page = mm.acquire_page(CoreId::new(0)).unwrap().unwrap();
        assert_eq!(mm.ref_count(page), Ok(1));
        let bytes = unsafe { mm.mapper().phys_to_ref(page) };
        assert!(bytes.iter().all(|&b| b == ALLOC_FILL));
    }

    #[test]
    fn release_poisons_with_a_different_pattern() {
        let mm = manager(1, 1);
        let cpu0 = CoreId::new(0);
        let page = mm.acquire_page(cpu0).unwrap().unwrap();
        assert_eq!(mm.release_page(cpu0, page.base()), Ok(0));
        let bytes = unsafe { mm.mapper().phys_to_ref(page) };
        assert!(bytes.iter().all(|&b| b == FREE_FILL));
        assert_ne!(ALLOC_FILL, FREE_FILL);
    }

    #[test]
    fn shared_page_survives_first_release() {
        let mm = manager(1, 1);
        let cpu0 = CoreId::new(0);
        let page = mm.acquire_page(cpu0).unwrap().unwrap();
        assert_eq!(PhysicalMemoryManager::mapping_duplicated(&mm, page), Ok(2));

        assert_eq!(mm.release_page(cpu0, page.base()), Ok(1));
        assert_eq!(mm.free_page_count(), Ok(0));
        assert_eq!(mm.release_page(cpu0, page.base()), Ok(0));
        assert_eq!(mm.free_page_count(), Ok(1));
    }

    #[test]
    fn misaligned_release_halts() {
        let mm = manager(1, 1);
        let cpu0 = CoreId::new(0);
        let addr = PhysicalAddress::new(BASE + 8);
        assert_eq!(
            mm.release_page(cpu0, addr),
            Err(KernelFatal::Misaligned(addr))
        );
        assert!(mm.is_halted());
        assert_eq!(mm.acquire_page(cpu0), Err(KernelFatal::Halted));
        assert_eq!(mm.free_page_count(), Err(KernelFatal::Halted));
    }

    #[test]
    fn release_outside_the_range_is_fatal() {
        let mm = manager(2, 1);
        let cpu0 = CoreId::new(0);
        let below = PhysicalAddress::new(BASE - PAGE_SIZE);
        assert_eq!(
            mm.release_page(cpu0, below),
            Err(KernelFatal::Untracked(below))
        );

        let mm = manager(2, 1);
        let top = PhysicalAddress::new(BASE + 2 * PAGE_SIZE);
        assert_eq!(
            mm.release_page(cpu0, top),
            Err(KernelFatal::OutOfRange(top))
        );
        assert!(mm.is_halted());
    }

    #[test]
    fn unbacked_range_is_rejected() {
        let config = MemoryConfig::with_pages(PhysicalAddress::new(BASE), 4, 1);
        let range = config.validate().unwrap();
        let ram = PhysicalRam::new(range.base, 3);
        assert!(matches!(
            PhysicalMemoryManager::new(&config, ram),
            Err(ConfigError::Unbacked(p)) if p == range.page(3)
        ));
    }
}
