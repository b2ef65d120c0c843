#![allow(dead_code)]

use kernel_alloc::{
    AddressSpace, CoreId, FaultingProcess, MemoryConfig, PhysMapper, PhysicalMemoryManager,
    PhysicalRam,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_vmem::{MapError, PageTableEntry, SoftAddressSpace};

pub const BASE: u64 = 0x8020_0000;

pub type Manager = PhysicalMemoryManager<PhysicalRam>;

pub fn manager(pages: u64, cores: usize) -> Manager {
    manager_booted_on(pages, cores, 0)
}

pub fn manager_booted_on(pages: u64, cores: usize, boot: usize) -> Manager {
    let mut config = MemoryConfig::with_pages(PhysicalAddress::new(BASE), pages, cores);
    config.boot_core = CoreId::new(boot);
    let range = config.validate().unwrap();
    PhysicalMemoryManager::new(&config, PhysicalRam::new(range.base, range.pages)).unwrap()
}

pub fn cpu(n: usize) -> CoreId {
    CoreId::new(n)
}

pub fn va(n: u64) -> VirtualAddress {
    VirtualAddress::new(0x4000_0000 + n * 4096)
}

/// Writes `bytes` at the start of `page`.
pub fn write(mm: &Manager, page: PhysicalPage, bytes: &[u8]) {
    let mem = unsafe { mm.mapper().phys_to_mut(page) };
    mem[..bytes.len()].copy_from_slice(bytes);
}

pub fn read(mm: &Manager, page: PhysicalPage) -> Vec<u8> {
    unsafe { mm.mapper().phys_to_ref(page) }.to_vec()
}

pub struct TestProcess<S = SoftAddressSpace> {
    pub pid: u32,
    pub space: S,
    pub killed: bool,
}

impl TestProcess {
    pub fn new(pid: u32) -> Self {
        Self::with_space(pid, SoftAddressSpace::new())
    }
}

impl<S> TestProcess<S> {
    pub fn with_space(pid: u32, space: S) -> Self {
        Self {
            pid,
            space,
            killed: false,
        }
    }
}

impl<S: AddressSpace> TestProcess<S> {
    /// Allocates a page on `core` and maps it writable at `va`.
    pub fn map_fresh(&mut self, mm: &Manager, core: CoreId, va: VirtualAddress) -> PhysicalPage {
        let page = mm.acquire_page(core).unwrap().unwrap();
        self.space.map(va, PageTableEntry::user_rw(page)).unwrap();
        page
    }

    pub fn entry(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        self.space.translate(va)
    }
}

impl<S: AddressSpace> FaultingProcess for TestProcess<S> {
    type Space = S;

    fn pid(&self) -> u32 {
        self.pid
    }

    fn address_space(&mut self) -> &mut S {
        &mut self.space
    }

    fn kill(&mut self) {
        self.killed = true;
    }
}

/// Address space whose `map` fails once armed, and whose `unmap` can be made
/// to report nothing.
#[derive(Default)]
pub struct FlakySpace {
    pub inner: SoftAddressSpace,
    pub fail_maps: bool,
    pub lose_unmaps: bool,
}

impl AddressSpace for FlakySpace {
    fn translate(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        self.inner.translate(va)
    }

    fn unmap(&mut self, va: VirtualAddress) -> Option<PageTableEntry> {
        let entry = self.inner.unmap(va);
        if self.lose_unmaps { None } else { entry }
    }

    fn map(&mut self, va: VirtualAddress, entry: PageTableEntry) -> Result<(), MapError> {
        if self.fail_maps {
            return Err(MapError::OutOfMemory(kernel_vmem::VirtualPage::containing(va)));
        }
        self.inner.map(va, entry)
    }
}
