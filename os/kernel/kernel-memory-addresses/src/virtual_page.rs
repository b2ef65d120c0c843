use crate::{PAGE_SIZE, VirtualAddress, page_round_down};
use core::fmt;

/// Base address of a 4 KiB virtual page.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u64);

impl VirtualPage {
    /// Page that contains `va` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(va: VirtualAddress) -> Self {
        Self(page_round_down(va.as_u64()))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + PAGE_SIZE)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/4K", self.0)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage(0x{:016X})", self.0)
    }
}
