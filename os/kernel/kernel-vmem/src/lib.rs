//! # Virtual Memory Interface
//!
//! The page-table side of copy-on-write sharing, reduced to what the physical
//! memory subsystem needs from it.
//!
//! ## What you get
//! - [`PageTableEntry`]: a leaf entry (Sv39 layout) with a software
//!   [`copy_on_write`](PageTableEntry::copy_on_write) bit in the RSW field.
//! - [`AddressSpace`]: translate / unmap / map on one process address space.
//!   The copy-on-write fault resolver only ever talks to page tables through
//!   this trait.
//! - [`MappingObserver`]: how the page-table manager reports that it made an
//!   existing physical page additionally shared, instead of copying it.
//! - [`SoftAddressSpace`]: an ordered-map backed address space, including the
//!   fork-time [`duplicate_cow_into`](SoftAddressSpace::duplicate_cow_into).
//!
//! ## Entry layout
//!
//! ```text
//! | 63‒54    | 53‒10 | 9   | 8   | 7 | 6 | 5 | 4 | 3 | 2 | 1 | 0 |
//! | reserved |  PPN  | RSW | COW | D | A | G | U | X | W | R | V |
//! ```
//!
//! A copy-on-write mapping is always read-only (`W = 0`, `COW = 1`). A write
//! through it faults, and the fault resolver replaces it with a private,
//! writable mapping (`W = 1`, `COW = 0`).

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod page_table_entry;
mod soft_space;

pub use crate::page_table_entry::PageTableEntry;
pub use crate::soft_space::{DuplicateError, SoftAddressSpace};
pub use kernel_memory_addresses::{PhysicalPage, VirtualAddress, VirtualPage};

/// Errors raised by [`AddressSpace::map`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("virtual page {0} is already mapped")]
    AlreadyMapped(VirtualPage),
    #[error("refusing to install an entry without the valid bit at {0}")]
    NotValid(VirtualPage),
    #[error("out of page-table memory while mapping {0}")]
    OutOfMemory(VirtualPage),
}

/// One process address space, as seen by the fault resolver.
///
/// Implementations operate on 4 KiB leaf entries only; `va` may point anywhere
/// inside the page.
pub trait AddressSpace {
    /// Returns the leaf entry mapping `va`, if any.
    fn translate(&self, va: VirtualAddress) -> Option<PageTableEntry>;

    /// Removes the mapping for `va` and returns the entry it held.
    ///
    /// Does not touch the physical page or its reference count.
    fn unmap(&mut self, va: VirtualAddress) -> Option<PageTableEntry>;

    /// Installs `entry` for the page containing `va`.
    ///
    /// # Errors
    /// - [`MapError::AlreadyMapped`] if the page already has a mapping.
    /// - [`MapError::NotValid`] if `entry` lacks the valid bit.
    /// - [`MapError::OutOfMemory`] if page-table memory ran out.
    fn map(&mut self, va: VirtualAddress, entry: PageTableEntry) -> Result<(), MapError>;
}

/// Receives notice whenever a mapping to an existing physical page is added.
///
/// The physical memory manager implements this to bump the page's reference
/// count, so that the page is reclaimed only after the last mapping is gone.
pub trait MappingObserver {
    type Error;

    /// A new mapping to `page` now exists in addition to the previous ones.
    ///
    /// # Errors
    /// Whatever the observer considers fatal, e.g. a reference count overflow.
    fn mapping_duplicated(&self, page: PhysicalPage) -> Result<(), Self::Error>;
}
