//! # Memory Layout

/// Size of one physical page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Physical address where the kernel image is loaded.
pub const KERNEL_BASE: u64 = 0x8000_0000;

/// First physical address after the kernel image (page aligned).
///
/// Pages below this address are reserved for the kernel and boot code.
pub const KERNEL_END: u64 = KERNEL_BASE + 0x20_0000; // 2 MiB image

/// Exclusive upper bound of the managed physical range.
pub const PHYS_TOP: u64 = KERNEL_BASE + 128 * 1024 * 1024;

/// Maximum number of execution cores the allocator keeps pools for.
pub const MAX_CPUS: usize = 8;

/// Number of pages the reference-count table can track.
pub const REF_TABLE_CAPACITY: usize = 0x8000;

/// Largest value a page reference count may hold.
pub const MAX_REF_COUNT: u8 = u8::MAX;

/// Byte pattern written over a page when it is handed out.
pub const ALLOC_FILL: u8 = 0x05;

/// Byte pattern written over a page when it returns to a pool.
pub const FREE_FILL: u8 = 0x01;

/// One past the highest user virtual address (Sv39: 2^38).
pub const USER_VA_END: u64 = 1 << 38;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(KERNEL_END.is_multiple_of(PAGE_SIZE));
    assert!(PHYS_TOP.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_END > KERNEL_BASE);
    assert!(PHYS_TOP > KERNEL_END);
    assert!(((PHYS_TOP - KERNEL_END) / PAGE_SIZE) as usize <= REF_TABLE_CAPACITY);
    assert!(ALLOC_FILL != FREE_FILL);
    assert!(MAX_CPUS > 0);
};
