//! Copy-on-write fault resolution.
//!
//! A write through a copy-on-write mapping lands here. The writer gets a
//! private copy of the page, and its claim on the shared original is dropped:
//!
//! ```text
//!   translate(va) ── none ──────────────► kill (Unmapped)
//!        │
//!        ├─ COW bit clear ──────────────► kill (NotCopyOnWrite)
//!        ├─ original count 0 ───────────► halt (RefCountUnderflow)
//!        ▼
//!   acquire_page ── exhausted ──────────► kill (OutOfMemory)
//!        │
//!   copy bytes, unmap va ── entry differs ─► halt (MappingChanged)
//!        │
//!   map copy RW ── map fails ───────────► kill (RemapFailed)
//!        │
//!   decrement original ── 0 ──► reclaim original
//! ```
//!
//! The original is only decremented once the private mapping is installed,
//! so a concurrent fault on another mapping of the same page never sees a
//! count that is lower than the number of mappings.

use crate::error::{FaultError, KernelFatal, ProcessFatal};
use crate::manager::PhysicalMemoryManager;
use crate::phys_mapper::PhysMapper;
use crate::pool::CoreId;
use bitfield_struct::bitfield;
use kernel_info::memory::USER_VA_END;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use kernel_vmem::AddressSpace;

/// The process a fault is resolved for.
pub trait FaultingProcess {
    type Space: AddressSpace;

    fn pid(&self) -> u32;

    fn address_space(&mut self) -> &mut Self::Space;

    /// Marks the process for termination. It must not be resumed.
    fn kill(&mut self);
}

/// Supervisor trap cause, as read from `scause`.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct TrapCause {
    /// Exception code, or the interrupt number if `interrupt` is set.
    #[bits(63)]
    pub code: u64,

    /// 0 = synchronous exception.
    /// 1 = interrupt.
    pub interrupt: bool,
}

/// The access that raised a page fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageFaultKind {
    Instruction,
    Load,
    Store,
}

impl TrapCause {
    pub const INSTRUCTION_PAGE_FAULT: u64 = 12;
    pub const LOAD_PAGE_FAULT: u64 = 13;
    pub const STORE_PAGE_FAULT: u64 = 15;

    /// A synchronous exception with the given code.
    #[must_use]
    pub const fn exception(code: u64) -> Self {
        Self::new().with_code(code)
    }

    /// A store or AMO page fault, as raised by a copy-on-write mapping.
    #[must_use]
    pub const fn store_page_fault() -> Self {
        Self::exception(Self::STORE_PAGE_FAULT)
    }

    /// The kind of page fault, or `None` for any other trap.
    #[must_use]
    pub const fn page_fault(&self) -> Option<PageFaultKind> {
        if self.interrupt() {
            return None;
        }
        match self.code() {
            Self::INSTRUCTION_PAGE_FAULT => Some(PageFaultKind::Instruction),
            Self::LOAD_PAGE_FAULT => Some(PageFaultKind::Load),
            Self::STORE_PAGE_FAULT => Some(PageFaultKind::Store),
            _ => None,
        }
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        match self.page_fault() {
            Some(PageFaultKind::Instruction) => "instruction page fault",
            Some(PageFaultKind::Load) => "load page fault",
            Some(PageFaultKind::Store) => "store page fault",
            None if self.interrupt() => "interrupt",
            None => "exception other than a page fault",
        }
    }
}

fn kill<P: FaultingProcess>(process: &mut P, err: ProcessFatal) -> FaultError {
    debug_assert_eq!(err.pid(), process.pid());
    log::warn!("killing pid {}: {err}", err.pid());
    process.kill();
    err.into()
}

impl<M: PhysMapper> PhysicalMemoryManager<M> {
    /// Gives `process` a private, writable copy of the copy-on-write page at `va`.
    ///
    /// Returns the new page. The original loses one reference and goes back to
    /// `core`'s pool if that was the last.
    ///
    /// # Errors
    /// - [`FaultError::Process`] after killing `process`, see [`ProcessFatal`].
    /// - [`FaultError::Kernel`] if reference tracking is broken; the manager
    ///   halts.
    pub fn resolve_cow_fault<P: FaultingProcess>(
        &self,
        core: CoreId,
        process: &mut P,
        va: VirtualAddress,
    ) -> Result<PhysicalPage, FaultError> {
        self.ensure_running()?;
        let pid = process.pid();

        let Some(entry) = process.address_space().translate(va) else {
            return Err(kill(process, ProcessFatal::Unmapped { pid, va }));
        };
        if !entry.copy_on_write() {
            return Err(kill(process, ProcessFatal::NotCopyOnWrite { pid, va }));
        }

        let original = entry.physical_page();
        // A mapped page holds at least one reference; check before touching anything.
        if self.ref_count(original)? == 0 {
            return Err(self.fatal(KernelFatal::RefCountUnderflow(original)).into());
        }

        let Some(copy) = self.acquire_page(core)? else {
            return Err(kill(process, ProcessFatal::OutOfMemory { pid, va }));
        };

        // SAFETY: `copy` is exclusively ours. `original` is mapped read-only
        // everywhere and our reference keeps it from being reclaimed.
        unsafe { self.mapper().copy_page(original, copy) };

        let space = process.address_space();
        if space.unmap(va) != Some(entry) {
            self.drop_reference(core, copy)?;
            return Err(self.fatal(KernelFatal::MappingChanged(va)).into());
        }
        if let Err(source) = space.map(va, entry.with_physical_page(copy).into_private()) {
            self.drop_reference(core, copy)?;
            self.drop_reference(core, original)?;
            return Err(kill(process, ProcessFatal::RemapFailed { pid, va, source }));
        }

        let remaining = self.drop_reference(core, original)?;
        log::trace!("{core}: pid {pid} copied {original} to {copy} at {va}, {remaining} left");
        Ok(copy)
    }

    /// Dispatches a page fault taken by `process` at `va`.
    ///
    /// Store page faults on user addresses go to
    /// [`resolve_cow_fault`](Self::resolve_cow_fault); every other trap kills
    /// the process.
    ///
    /// # Errors
    /// As [`resolve_cow_fault`](Self::resolve_cow_fault), plus
    /// [`ProcessFatal::BadAddress`] and [`ProcessFatal::UnexpectedFault`].
    pub fn handle_page_fault<P: FaultingProcess>(
        &self,
        core: CoreId,
        process: &mut P,
        va: VirtualAddress,
        cause: TrapCause,
    ) -> Result<PhysicalPage, FaultError> {
        self.ensure_running()?;
        let pid = process.pid();

        if va.as_u64() >= USER_VA_END {
            return Err(kill(process, ProcessFatal::BadAddress { pid, va }));
        }
        if cause.page_fault() != Some(PageFaultKind::Store) {
            log::debug!("pid {pid}: {} at {va}", cause.explain());
            return Err(kill(
                process,
                ProcessFatal::UnexpectedFault {
                    pid,
                    va,
                    code: cause.into_bits(),
                },
            ));
        }

        self.resolve_cow_fault(core, process, va)
    }
}
