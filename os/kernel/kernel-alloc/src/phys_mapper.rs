//! # Access to the bytes of physical pages
//!
//! The allocator poisons pages on acquire and release and the copy-on-write
//! resolver copies them, so it needs a way to "touch" a physical page from
//! the current address space. [`PhysMapper`] abstracts over how that happens:
//!
//! - [`DirectMap`]: the kernel maps all of physical memory at a constant
//!   offset (a higher-half direct map); the byte for `pa` lives at `pa + offset`.
//! - [`PhysicalRam`]: a heap arena standing in for physical memory, used by
//!   hosted builds and tests. Simulated physical addresses index into it.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage};

/// The contents of one 4 KiB page.
pub type PageBytes = [u8; PAGE_SIZE as usize];

/// Converts physical pages into references usable from the current address space.
///
/// # Safety
/// - The caller must own `page` exclusively for the lifetime of a `&mut`
///   and must ensure nobody writes it for the lifetime of a `&`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - `page` must be [covered](PhysMapper::covers) by the mapper.
pub trait PhysMapper: Sync {
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a>(&self, page: PhysicalPage) -> &'a mut PageBytes;

    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_ref<'a>(&self, page: PhysicalPage) -> &'a PageBytes;

    /// Whether `page` can be reached through this mapper.
    fn covers(&self, page: PhysicalPage) -> bool;

    /// Overwrites every byte of `page` with `byte`.
    ///
    /// # Safety
    /// As [`phys_to_mut`](Self::phys_to_mut).
    unsafe fn fill_page(&self, page: PhysicalPage, byte: u8) {
        unsafe { self.phys_to_mut(page) }.fill(byte);
    }

    /// Copies all of `src` into `dst`.
    ///
    /// # Safety
    /// As [`phys_to_ref`](Self::phys_to_ref) for `src` and
    /// [`phys_to_mut`](Self::phys_to_mut) for `dst`; the two must differ.
    unsafe fn copy_page(&self, src: PhysicalPage, dst: PhysicalPage) {
        debug_assert_ne!(src, dst, "copying a page onto itself");
        let (src, dst) = unsafe { (self.phys_to_ref(src), self.phys_to_mut(dst)) };
        dst.copy_from_slice(src);
    }
}

/// [`PhysMapper`] for kernels that map all physical memory at a fixed offset.
#[derive(Debug, Copy, Clone)]
pub struct DirectMap {
    offset: u64,
}

impl DirectMap {
    /// # Safety
    /// Every physical page the mapper is asked about must be mapped writable
    /// at `pa + offset` for as long as the mapper is in use.
    #[must_use]
    pub const unsafe fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[inline]
    fn ptr(&self, page: PhysicalPage) -> *mut PageBytes {
        page.base().as_u64().wrapping_add(self.offset) as usize as *mut PageBytes
    }
}

impl PhysMapper for DirectMap {
    unsafe fn phys_to_mut<'a>(&self, page: PhysicalPage) -> &'a mut PageBytes {
        // SAFETY: `new` guarantees the direct map covers `page`.
        unsafe { &mut *self.ptr(page) }
    }

    unsafe fn phys_to_ref<'a>(&self, page: PhysicalPage) -> &'a PageBytes {
        // SAFETY: `new` guarantees the direct map covers `page`.
        unsafe { &*self.ptr(page) }
    }

    fn covers(&self, _page: PhysicalPage) -> bool {
        true
    }
}

#[repr(C, align(4096))]
struct Frame(UnsafeCell<PageBytes>);

/// Heap-backed stand-in for a contiguous range of physical memory.
pub struct PhysicalRam {
    base: PhysicalPage,
    frames: Box<[Frame]>,
}

// Safety: frames are only reached through `PhysMapper`, whose contract
// forbids concurrent access to one page.
unsafe impl Sync for PhysicalRam {}

impl PhysicalRam {
    /// Zeroed memory for `pages` pages starting at `base`.
    #[must_use]
    pub fn new(base: PhysicalPage, pages: usize) -> Self {
        let frames: Vec<Frame> = (0..pages)
            .map(|_| Frame(UnsafeCell::new([0; PAGE_SIZE as usize])))
            .collect();
        Self {
            base,
            frames: frames.into_boxed_slice(),
        }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalPage {
        self.base
    }

    #[must_use]
    pub fn pages(&self) -> usize {
        self.frames.len()
    }

    fn frame(&self, page: PhysicalPage) -> Option<&Frame> {
        let idx = usize::try_from(page.index_from(self.base)?).ok()?;
        self.frames.get(idx)
    }

    fn cell(&self, page: PhysicalPage) -> *mut PageBytes {
        match self.frame(page) {
            Some(frame) => frame.0.get(),
            None => panic!("physical page {page} is not backed by this arena"),
        }
    }
}

impl PhysMapper for PhysicalRam {
    unsafe fn phys_to_mut<'a>(&self, page: PhysicalPage) -> &'a mut PageBytes {
        // SAFETY: exclusive access is the caller's obligation.
        unsafe { &mut *self.cell(page) }
    }

    unsafe fn phys_to_ref<'a>(&self, page: PhysicalPage) -> &'a PageBytes {
        // SAFETY: absence of writers is the caller's obligation.
        unsafe { &*self.cell(page) }
    }

    fn covers(&self, page: PhysicalPage) -> bool {
        self.frame(page).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    fn page(n: u64) -> PhysicalPage {
        PhysicalPage::containing(PhysicalAddress::new(0x8020_0000 + n * PAGE_SIZE))
    }

    #[test]
    fn arena_frames_are_page_aligned() {
        let ram = PhysicalRam::new(page(0), 2);
        for n in 0..2 {
            let ptr = ram.cell(page(n)) as usize;
            assert_eq!(ptr % PAGE_SIZE as usize, 0);
        }
    }

    #[test]
    fn arena_coverage() {
        let ram = PhysicalRam::new(page(1), 2);
        assert!(!ram.covers(page(0)));
        assert!(ram.covers(page(1)));
        assert!(ram.covers(page(2)));
        assert!(!ram.covers(page(3)));
    }

    #[test]
    fn fill_and_copy() {
        let ram = PhysicalRam::new(page(0), 2);
        unsafe {
            ram.fill_page(page(0), 0xAB);
            ram.phys_to_mut(page(0))[17] = 0x42;
            ram.copy_page(page(0), page(1));

            let copy = ram.phys_to_ref(page(1));
            assert_eq!(copy[17], 0x42);
            assert_eq!(copy[0], 0xAB);
            assert_eq!(copy[4095], 0xAB);
        }
    }

    #[test]
    fn direct_map_adds_offset() {
        let ram = PhysicalRam::new(page(0), 1);
        let host = ram.cell(page(0)) as u64;
        let map = unsafe { DirectMap::new(host.wrapping_sub(page(0).base().as_u64())) };

        unsafe {
            map.fill_page(page(0), 0x5A);
            assert!(ram.phys_to_ref(page(0)).iter().all(|&b| b == 0x5A));
        }
    }
}
