//! # Kernel Configuration
//!
//! Authoritative source for the constants that size and place the physical
//! memory subsystem. Every crate that needs to agree on the managed range,
//! the page size, or the number of execution cores reads them from here.
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000  ┌─────────────────────────────────┐
//!              │  MMIO, boot ROM, device space   │
//! KERNEL_BASE  ├─────────────────────────────────┤ 0x8000_0000
//!              │  Kernel image (text, data, bss) │
//!              │  permanently reserved, untracked│
//! KERNEL_END   ├─────────────────────────────────┤ managed_base
//!              │  Managed pages                  │
//!              │  (free pools + shared pages)    │
//! PHYS_TOP     └─────────────────────────────────┘ managed_top
//! ```
//!
//! Pages below [`KERNEL_END`](memory::KERNEL_END) are never handed out and
//! never reference counted. Everything from there up to
//! [`PHYS_TOP`](memory::PHYS_TOP) belongs to the page allocator.
//!
//! ## Compile-Time Checks
//!
//! The layout is validated with `const` assertions, so an inconsistent
//! configuration (e.g. a managed range the reference table cannot cover)
//! fails the build instead of corrupting memory at runtime.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
