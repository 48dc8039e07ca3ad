#![allow(dead_code)]

use kernel_alloc::boot_map::KernelImage;
use kernel_alloc::context::KernelMemory;
use kernel_alloc::frame_alloc::FreeRegion;
use kernel_info::boot::{MemoryKind, MemoryRegion};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{Direct, PhysMapper};
use std::cell::UnsafeCell;

pub const PAGE: u32 = 0x1000;

#[repr(align(4096))]
struct Frame([u8; 4096]);

/// Simulated RAM: physical address `pa` lives in frame `pa >> 12`.
pub struct TestPhys {
    frames: Vec<UnsafeCell<Frame>>,
}

impl TestPhys {
    pub fn with_frames(n: usize) -> Self {
        Self {
            frames: (0..n).map(|_| UnsafeCell::new(Frame([0; 4096]))).collect(),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.frames.len() as u64 * u64::from(PAGE)
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let frame = self.frames[(pa.as_u32() >> 12) as usize].get().cast::<u8>();
        unsafe { &mut *frame.add((pa.as_u32() & 0xfff) as usize).cast::<T>() }
    }

    fn covers(&self, pa: PhysicalAddress) -> bool {
        ((pa.as_u32() >> 12) as usize) < self.frames.len()
    }
}

pub type TestMemory<'s, 'm> = KernelMemory<'s, Direct<'m, TestPhys>, Direct<'m, TestPhys>>;

/// The whole simulated RAM as one available entry, with the BIOS area in
/// front of it reserved.
pub fn memory_map(phys: &TestPhys) -> [MemoryRegion; 2] {
    [
        MemoryRegion {
            base: 0,
            length: 0x1000,
            kind: MemoryKind::Reserved,
        },
        MemoryRegion::available(0x1000, phys.bytes() - 0x1000),
    ]
}

/// An 8 KiB kernel at 0x1000; with up to 2 MiB of RAM its bookkeeping area
/// is one page, so the reservation is `[0x1000, 0x4000)`.
pub fn small_kernel() -> KernelImage {
    KernelImage::new(PhysicalAddress::new(0x1000), PhysicalAddress::new(0x3000))
}

pub fn slots(n: usize) -> Vec<FreeRegion> {
    vec![FreeRegion::default(); n]
}
