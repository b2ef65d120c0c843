use crate::{PAGE_SIZE, PhysicalAddress, page_round_down};
use core::fmt;

/// Base address of a 4 KiB physical page.
///
/// ### Invariants
/// - The low 12 bits of the base are always zero.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u64);

impl PhysicalPage {
    /// Page that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(page_round_down(addr.as_u64()))
    }

    /// Page starting exactly at `addr`, or `None` if `addr` is not aligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: PhysicalAddress) -> Option<Self> {
        if addr.is_page_aligned() {
            Some(Self(addr.as_u64()))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0)
    }

    /// Number of pages between `origin` and `self`, or `None` if `self` lies below `origin`.
    #[inline]
    #[must_use]
    pub const fn index_from(self, origin: Self) -> Option<u64> {
        match self.0.checked_sub(origin.0) {
            Some(d) => Some(d / PAGE_SIZE),
            None => None,
        }
    }

    /// The page `n` pages above `self`.
    #[inline]
    #[must_use]
    pub const fn nth(self, n: u64) -> Self {
        Self(self.0 + n * PAGE_SIZE)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/4K", self.0)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage(0x{:016X})", self.0)
    }
}
