//! Ordered-map backed address space.
//!
//! Holds leaf entries keyed by virtual page instead of walking hardware page
//! tables. It serves as the page-table manager for hosted builds and tests,
//! and carries the fork-time sharing logic that marks mappings copy-on-write.

use crate::{AddressSpace, MapError, MappingObserver, PageTableEntry};
use alloc::collections::BTreeMap;
use kernel_memory_addresses::{VirtualAddress, VirtualPage};

/// Errors raised by [`SoftAddressSpace::duplicate_cow_into`].
#[derive(Debug, thiserror::Error)]
pub enum DuplicateError<E> {
    #[error("failed to map the shared page into the child: {0}")]
    Map(#[from] MapError),
    #[error("reference tracking rejected the shared page: {0}")]
    Observer(E),
}

/// Address space backed by a `BTreeMap<VirtualPage, PageTableEntry>`.
#[derive(Debug, Default, Clone)]
pub struct SoftAddressSpace {
    entries: BTreeMap<VirtualPage, PageTableEntry>,
    /// Maximum number of leaf entries; models running out of page-table pages.
    limit: Option<usize>,
}

impl SoftAddressSpace {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            limit: None,
        }
    }

    /// An address space that refuses to hold more than `limit` mappings.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VirtualPage, PageTableEntry)> + '_ {
        self.entries.iter().map(|(vp, e)| (*vp, *e))
    }

    /// Shares every mapping of `self` with `child`.
    ///
    /// Writable and copy-on-write mappings become read-only copy-on-write in
    /// both spaces; read-only mappings are shared as they are. For every page
    /// mapped into `child`, `observer` is told about the additional mapping,
    /// after the child entry is installed.
    ///
    /// On error, `child` keeps the mappings installed so far. After a map
    /// error all of them were reported to `observer`; after an observer error
    /// the last one was not.
    ///
    /// # Errors
    /// - [`DuplicateError::Map`] if `child` cannot take another mapping.
    /// - [`DuplicateError::Observer`] if `observer` rejects a page.
    pub fn duplicate_cow_into<O: MappingObserver>(
        &mut self,
        child: &mut Self,
        observer: &O,
    ) -> Result<(), DuplicateError<O::Error>> {
        for (vp, entry) in &mut self.entries {
            if entry.is_shareable() {
                *entry = entry.into_copy_on_write();
            }

            child.map(vp.base(), *entry)?;
            observer
                .mapping_duplicated(entry.physical_page())
                .map_err(DuplicateError::Observer)?;
        }

        log::debug!(
            "shared {} mappings copy-on-write ({} in child)",
            self.entries.len(),
            child.len()
        );
        Ok(())
    }

    /// Removes every mapping and returns them in address order.
    ///
    /// The caller owns one reference to each returned page.
    pub fn unmap_all(&mut self) -> impl Iterator<Item = (VirtualPage, PageTableEntry)> + use<> {
        core::mem::take(&mut self.entries).into_iter()
    }
}

impl AddressSpace for SoftAddressSpace {
    fn translate(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        self.entries.get(&VirtualPage::containing(va)).copied()
    }

    fn unmap(&mut self, va: VirtualAddress) -> Option<PageTableEntry> {
        self.entries.remove(&VirtualPage::containing(va))
    }

    fn map(&mut self, va: VirtualAddress, entry: PageTableEntry) -> Result<(), MapError> {
        let vp = VirtualPage::containing(va);
        if !entry.valid() {
            return Err(MapError::NotValid(vp));
        }
        if self.entries.contains_key(&vp) {
            return Err(MapError::AlreadyMapped(vp));
        }
        if self.limit.is_some_and(|limit| self.entries.len() >= limit) {
            return Err(MapError::OutOfMemory(vp));
        }
        self.entries.insert(vp, entry);
        Ok(())
    }
}
