//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and 4 KiB page bases, so that a
//! physical page can never be passed where a virtual address is expected.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | Any byte address in physical memory. |
//! | [`PhysicalPage`] | The page-aligned base of a physical page. |
//! | [`VirtualAddress`] | Any byte address in a process address space. |
//! | [`VirtualPage`] | The page-aligned base of a virtual page. |
//!
//! Page types can only be built from aligned addresses
//! ([`PhysicalPage::from_aligned`]) or by rounding
//! ([`PhysicalPage::containing`]), so holding a page value implies alignment.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x8020_1234);
//! assert!(!pa.is_page_aligned());
//! assert_eq!(PhysicalPage::containing(pa).base().as_u64(), 0x8020_1000);
//! assert!(PhysicalPage::from_aligned(pa).is_none());
//!
//! let va = VirtualAddress::new(0x4000_0042);
//! assert_eq!(VirtualPage::containing(va).base().as_u64(), 0x4000_0000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

pub use kernel_info::memory::PAGE_SIZE;

/// Mask selecting the in-page offset bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Align `x` down to the nearest page boundary.
#[inline(always)]
#[must_use]
pub const fn page_round_down(x: u64) -> u64 {
    x & !PAGE_MASK
}

/// Align `x` up to the nearest page boundary.
///
/// `x + PAGE_MASK` must not overflow.
#[inline(always)]
#[must_use]
pub const fn page_round_up(x: u64) -> u64 {
    (x + PAGE_MASK) & !PAGE_MASK
}
