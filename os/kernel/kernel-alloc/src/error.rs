use crate::pool::CoreId;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_vmem::MapError;

/// A broken kernel invariant. The whole system must stop.
///
/// The [`PhysicalMemoryManager`](crate::PhysicalMemoryManager) latches the
/// first one it sees; afterwards every operation returns [`KernelFatal::Halted`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum KernelFatal {
    #[error("physical address {0} is not page aligned")]
    Misaligned(PhysicalAddress),
    #[error("physical address {0} lies outside the managed range")]
    OutOfRange(PhysicalAddress),
    #[error("physical address {0} lies below the managed range and is not reference counted")]
    Untracked(PhysicalAddress),
    #[error("reference count of page {0} is already zero")]
    RefCountUnderflow(PhysicalPage),
    #[error("reference count of page {0} would exceed its maximum")]
    RefCountOverflow(PhysicalPage),
    #[error("page table entry at {0} changed while its copy-on-write fault was resolved")]
    MappingChanged(VirtualAddress),
    #[error("no such core: {0}")]
    NoSuchCore(CoreId),
    #[error("physical memory manager halted after a fatal error")]
    Halted,
}

/// A fault the offending process does not survive.
///
/// The process has already been killed when one of these is returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ProcessFatal {
    #[error("pid {pid}: write to read-only page at {va}")]
    NotCopyOnWrite { pid: u32, va: VirtualAddress },
    #[error("pid {pid}: out of memory copying page at {va}")]
    OutOfMemory { pid: u32, va: VirtualAddress },
    #[error("pid {pid}: no mapping at {va}")]
    Unmapped { pid: u32, va: VirtualAddress },
    #[error("pid {pid}: address {va} is outside user space")]
    BadAddress { pid: u32, va: VirtualAddress },
    #[error("pid {pid}: could not map private copy at {va}")]
    RemapFailed {
        pid: u32,
        va: VirtualAddress,
        #[source]
        source: MapError,
    },
    #[error("pid {pid}: unexpected page fault at {va} (scause {code:#x})")]
    UnexpectedFault {
        pid: u32,
        va: VirtualAddress,
        code: u64,
    },
}

impl ProcessFatal {
    #[must_use]
    pub const fn pid(&self) -> u32 {
        match self {
            Self::NotCopyOnWrite { pid, .. }
            | Self::OutOfMemory { pid, .. }
            | Self::Unmapped { pid, .. }
            | Self::BadAddress { pid, .. }
            | Self::RemapFailed { pid, .. }
            | Self::UnexpectedFault { pid, .. } => *pid,
        }
    }
}

/// Outcome of a failed page-fault resolution.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    #[error(transparent)]
    Kernel(#[from] KernelFatal),
    #[error(transparent)]
    Process(#[from] ProcessFatal),
}

impl FaultError {
    #[must_use]
    pub const fn is_kernel_fatal(&self) -> bool {
        matches!(self, Self::Kernel(_))
    }
}
