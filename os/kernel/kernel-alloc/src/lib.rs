//! # Kernel Memory Allocation
//!
//! The three allocators of the kernel's memory core and the glue between
//! them:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Kernel heap (heap)                          │
//! │   byte-granular, first fit, grows by pages  │
//! └──────────────────┬──────────────────────────┘
//!                    │ map_pages
//! ┌──────────────────▼──────────────────────────┐
//! │ Virtual memory manager (vmm)                │
//! │   4 KiB mappings in the kernel directory    │
//! └──────────────────┬──────────────────────────┘
//!                    │ frames for pages and tables
//! ┌──────────────────▼──────────────────────────┐
//! │ Physical frame allocator (frame_alloc)      │
//! │   stack of free regions, seeded at boot     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! [`boot_map`] turns the loader's memory map into free regions,
//! [`context::KernelMemory`] owns all three behind spin locks, and
//! [`allocator::KernelAllocator`] exposes the heap as a `GlobalAlloc`.
//!
//! Page-table memory is reached through a [`PagingAccess`](kernel_vmem::PagingAccess)
//! view: [`phys_mapper::HigherHalfMapper`] while the kernel directory is
//! being built, the recursive window once it is loaded.
//!
//! ## Boot sequence
//! ```rust,no_run
//! use kernel_alloc::boot_map::{KernelImage, Reservation};
//! use kernel_alloc::context::{KernelMemory, bookkeeping_slots};
//! use kernel_alloc::phys_mapper::HigherHalfMapper;
//! use kernel_info::boot::BootMemoryInfo;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{Direct, Recursive};
//!
//! # fn boot(info: BootMemoryInfo<'_>, image: KernelImage, loader_pd: PhysicalAddress)
//! #     -> Result<(), kernel_alloc::vmm::VmmError> {
//! static MAPPER: HigherHalfMapper = HigherHalfMapper::BOOT;
//! let slots = unsafe { bookkeeping_slots(&image, &info)? };
//! let memory: KernelMemory<'_, _> = KernelMemory::init(
//!     slots,
//!     &info,
//!     image,
//!     &[Reservation::frame(loader_pd)],
//!     Direct::new(&MAPPER),
//!     Recursive,
//! )?;
//! memory.activate(|root| { /* load CR3 */ })?;
//! let block = memory.allocate(128);
//! # Ok(()) }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod allocator;
pub mod boot_map;
pub mod context;
pub mod frame_alloc;
pub mod heap;
pub mod phys_mapper;
pub mod vmm;

#[cfg(test)]
pub(crate) mod tests {
    use core::cell::UnsafeCell;
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_vmem::PhysMapper;

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
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let frame = self.frames[(pa.as_u32() >> 12) as usize].get().cast::<u8>();
            // SAFETY: the caller promises `T` matches the bytes in the frame.
            unsafe { &mut *frame.add((pa.as_u32() & 0xfff) as usize).cast::<T>() }
        }

        fn covers(&self, pa: PhysicalAddress) -> bool {
            ((pa.as_u32() >> 12) as usize) < self.frames.len()
        }
    }
}
