//! # Physical Page Allocation and Copy-on-Write
//!
//! This crate owns the physical pages of the kernel: which ones are free, how
//! many mappings share each allocated one, and how a write to a shared page is
//! turned into a private copy. All of it lives in one
//! [`PhysicalMemoryManager`] context shared by every core.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │           Copy-on-Write Fault Resolver              │
//! │    • handle_page_fault / resolve_cow_fault          │
//! │    • private copy, remap, drop shared claim         │
//! └───────────┬─────────────────────────┬───────────────┘
//!             │                         │
//! ┌───────────▼──────────────┐ ┌────────▼──────────────┐
//! │    Per-Core Free Pools   │ │ Reference-Count Table │
//! │  • one locked LIFO/core  │ │ • one byte per page   │
//! │  • batch stealing        │ │ • checked CAS updates │
//! └───────────┬──────────────┘ └───────────────────────┘
//!             │
//! ┌───────────▼─────────────────────────────────────────┐
//! │                 Physical Mapper                     │
//! │    • page bytes for poisoning and copying           │
//! │    • direct map (kernel) or heap arena (hosted)     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The page-table side is reached only through the [`AddressSpace`] trait of
//! `kernel-vmem`. When the page-table manager shares an existing page instead
//! of copying it, it reports that through [`MappingObserver`], which the
//! manager implements by bumping the page's reference count.
//!
//! ## Page lifecycle
//!
//! ```text
//!   boot ──► free ──acquire_page──► exclusive (1) ──mapping_duplicated──► shared (n)
//!             ▲                        │                                    │
//!             └──── count reaches 0 ◄──┴────── release_page / COW fault ◄───┘
//! ```
//!
//! Free pages are poisoned with [`FREE_FILL`](kernel_info::memory::FREE_FILL),
//! freshly acquired ones with [`ALLOC_FILL`](kernel_info::memory::ALLOC_FILL).
//!
//! ## Errors
//!
//! Running out of pages is not an error: [`PhysicalMemoryManager::acquire_page`]
//! returns `Ok(None)`. A [`KernelFatal`] means kernel bookkeeping is broken;
//! the manager halts and refuses all further work. A [`ProcessFatal`] kills
//! only the faulting process.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::{CoreId, MemoryConfig, PhysicalMemoryManager, PhysicalRam};
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let config = MemoryConfig::with_pages(PhysicalAddress::new(0x8020_0000), 16, 2);
//! let range = config.validate().unwrap();
//! let mm = PhysicalMemoryManager::new(&config, PhysicalRam::new(range.base, range.pages)).unwrap();
//!
//! let page = mm.acquire_page(CoreId::new(1)).unwrap().unwrap();
//! assert_eq!(mm.free_page_count().unwrap(), 15);
//! mm.release_page(CoreId::new(1), page.base()).unwrap();
//! assert_eq!(mm.local_free_count(CoreId::new(1)).unwrap(), 8);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod config;
mod cow;
mod error;
pub mod free_list;
mod manager;
pub mod phys_mapper;
mod pool;
mod refcount;

pub use crate::config::{ConfigError, ManagedRange, MemoryConfig};
pub use crate::cow::{FaultingProcess, PageFaultKind, TrapCause};
pub use crate::error::{FaultError, KernelFatal, ProcessFatal};
pub use crate::manager::PhysicalMemoryManager;
pub use crate::phys_mapper::{DirectMap, PageBytes, PhysMapper, PhysicalRam};
pub use crate::pool::{CoreId, PagePools};
pub use crate::refcount::RefCountTable;
pub use kernel_sync::LockStats;
pub use kernel_vmem::{AddressSpace, MappingObserver};
