use bitfield_struct::bitfield;
use core::fmt;
use kernel_info::memory::PAGE_SHIFT;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// A single 64-bit leaf page table entry (RISC-V Sv39 layout).
///
/// ### Example
/// ```rust
/// # use kernel_vmem::{PageTableEntry, PhysicalPage};
/// # use kernel_memory_addresses::PhysicalAddress;
/// let page = PhysicalPage::containing(PhysicalAddress::new(0x8020_3000));
/// let e = PageTableEntry::user_rw(page);
/// assert!(e.valid() && e.writable() && !e.copy_on_write());
/// assert_eq!(e.physical_page(), page);
///
/// let shared = e.into_copy_on_write();
/// assert!(!shared.writable() && shared.copy_on_write());
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Valid (V, bit 0).
    pub valid: bool,

    /// Readable (R, bit 1).
    pub readable: bool,

    /// Writable (W, bit 2).
    ///
    /// Always clear while [`copy_on_write`](Self::copy_on_write) is set.
    pub writable: bool,

    /// Executable (X, bit 3).
    pub executable: bool,

    /// User-mode accessible (U, bit 4).
    pub user: bool,

    /// Global (G, bit 5).
    pub global: bool,

    /// Accessed (A, bit 6).
    pub accessed: bool,

    /// Dirty (D, bit 7).
    pub dirty: bool,

    /// Copy-on-write (first RSW bit, bit 8). Ignored by hardware.
    ///
    /// Set on both sides of a shared mapping; a write fault through a page
    /// with this bit is resolved by copying.
    pub copy_on_write: bool,

    /// Second RSW bit (bit 9).
    #[bits(1)]
    __rsw: u8,

    /// Physical page number (bits 10..=53).
    #[bits(44)]
    ppn: u64,

    #[bits(10)]
    __reserved: u16,
}

impl PageTableEntry {
    /// A valid, readable, writable user mapping of `page`.
    #[inline]
    #[must_use]
    pub const fn user_rw(page: PhysicalPage) -> Self {
        Self::new()
            .with_valid(true)
            .with_readable(true)
            .with_writable(true)
            .with_user(true)
            .with_ppn(page.base().as_u64() >> PAGE_SHIFT)
    }

    /// A valid, read-only user mapping of `page` (no copy-on-write).
    #[inline]
    #[must_use]
    pub const fn user_ro(page: PhysicalPage) -> Self {
        Self::user_rw(page).with_writable(false)
    }

    #[inline]
    #[must_use]
    pub const fn physical_page(&self) -> PhysicalPage {
        PhysicalPage::containing(PhysicalAddress::new(self.ppn() << PAGE_SHIFT))
    }

    /// Same permissions, pointing at `page` instead.
    #[inline]
    #[must_use]
    pub const fn with_physical_page(self, page: PhysicalPage) -> Self {
        self.with_ppn(page.base().as_u64() >> PAGE_SHIFT)
    }

    /// Read-only, copy-on-write variant of this entry.
    #[inline]
    #[must_use]
    pub const fn into_copy_on_write(self) -> Self {
        self.with_writable(false).with_copy_on_write(true)
    }

    /// Private, writable variant of a copy-on-write entry.
    #[inline]
    #[must_use]
    pub const fn into_private(self) -> Self {
        self.with_writable(true).with_copy_on_write(false)
    }

    /// Whether the page would be shared rather than copied on duplication.
    #[inline]
    #[must_use]
    pub const fn is_shareable(&self) -> bool {
        self.writable() || self.copy_on_write()
    }
}

impl fmt::Display for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{} {}{}{}{}{}{}",
            self.physical_page(),
            flag(self.valid(), 'V'),
            flag(self.readable(), 'R'),
            flag(self.writable(), 'W'),
            flag(self.executable(), 'X'),
            flag(self.user(), 'U'),
            flag(self.copy_on_write(), 'C'),
        )
    }
}
