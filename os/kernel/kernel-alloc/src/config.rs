//! Runtime configuration of the physical memory manager.

use kernel_info::memory::{KERNEL_END, MAX_CPUS, PHYS_TOP, REF_TABLE_CAPACITY};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, PhysicalPage, page_round_down, page_round_up,
};

use crate::pool::CoreId;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one core is required")]
    NoCores,
    #[error("{0} cores requested, at most {max} are supported", max = MAX_CPUS)]
    TooManyCores(usize),
    #[error("boot core {boot} is not among the {cores} configured cores")]
    BootCoreOutOfRange { boot: CoreId, cores: usize },
    #[error("managed range {base}..{top} holds no page")]
    EmptyRange {
        base: PhysicalAddress,
        top: PhysicalAddress,
    },
    #[error(
        "managed range holds {pages} pages, the reference table tracks at most {max}",
        max = REF_TABLE_CAPACITY
    )]
    RangeTooLarge { pages: usize },
    #[error("page {0} of the managed range has no backing memory")]
    Unbacked(PhysicalPage),
}

/// The managed physical range and the cores sharing it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryConfig {
    /// First byte the allocator owns; everything below is kernel image and boot data.
    pub managed_base: PhysicalAddress,
    /// One past the last byte the allocator owns.
    pub managed_top: PhysicalAddress,
    /// Number of cores, each with its own free pool.
    pub cores: usize,
    /// The core whose pool receives every page at boot.
    pub boot_core: CoreId,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            managed_base: PhysicalAddress::new(KERNEL_END),
            managed_top: PhysicalAddress::new(PHYS_TOP),
            cores: MAX_CPUS,
            boot_core: CoreId::new(0),
        }
    }
}

/// A checked [`MemoryConfig`] with page-granular bounds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ManagedRange {
    pub base: PhysicalPage,
    pub pages: usize,
}

impl ManagedRange {
    /// One past the last managed page.
    #[must_use]
    pub const fn top(&self) -> PhysicalAddress {
        self.base.nth(self.pages as u64).base()
    }

    /// Index of `page` in the range, or `None` if outside it.
    #[must_use]
    pub fn index_of(&self, page: PhysicalPage) -> Option<usize> {
        let idx = usize::try_from(page.index_from(self.base)?).ok()?;
        (idx < self.pages).then_some(idx)
    }

    /// The `idx`-th managed page.
    #[must_use]
    pub const fn page(&self, idx: usize) -> PhysicalPage {
        self.base.nth(idx as u64)
    }

    pub fn iter(&self) -> impl Iterator<Item = PhysicalPage> + use<> {
        let base = self.base;
        (0..self.pages as u64).map(move |n| base.nth(n))
    }
}

impl MemoryConfig {
    /// A config for `cores` cores over `pages` pages starting at `managed_base`.
    #[must_use]
    pub fn with_pages(managed_base: PhysicalAddress, pages: u64, cores: usize) -> Self {
        Self {
            managed_base,
            managed_top: managed_base + pages * PAGE_SIZE,
            cores,
            boot_core: CoreId::new(0),
        }
    }

    /// Checks the config and returns the page range it describes.
    ///
    /// The base is rounded up and the top rounded down to page boundaries.
    ///
    /// # Errors
    /// See [`ConfigError`]. [`ConfigError::Unbacked`] is never returned here.
    pub fn validate(&self) -> Result<ManagedRange, ConfigError> {
        if self.cores == 0 {
            return Err(ConfigError::NoCores);
        }
        if self.cores > MAX_CPUS {
            return Err(ConfigError::TooManyCores(self.cores));
        }
        if self.boot_core.index() >= self.cores {
            return Err(ConfigError::BootCoreOutOfRange {
                boot: self.boot_core,
                cores: self.cores,
            });
        }

        let base = page_round_up(self.managed_base.as_u64());
        let top = page_round_down(self.managed_top.as_u64());
        if top <= base {
            return Err(ConfigError::EmptyRange {
                base: self.managed_base,
                top: self.managed_top,
            });
        }

        let pages = usize::try_from((top - base) / PAGE_SIZE).unwrap_or(usize::MAX);
        if pages > REF_TABLE_CAPACITY {
            return Err(ConfigError::RangeTooLarge { pages });
        }

        Ok(ManagedRange {
            base: PhysicalPage::containing(PhysicalAddress::new(base)),
            pages,
        })
    }
}
