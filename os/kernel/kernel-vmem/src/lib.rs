//! # Virtual Memory Support
//!
//! 32-bit x86 paging without PAE: one page directory, page tables below it,
//! 4 KiB pages and (with `CR4.PSE`) 4 MiB pages.
//!
//! ## What you get
//! - An [`address space`](address_space) rooted at a page directory frame.
//! - Page directory and page table types ([`page_table::pd`], [`page_table::pt`]).
//! - [`PageFlags`] shared by both levels.
//! - Two ways to reach the paging structures ([`PagingAccess`]): through a
//!   [`PhysMapper`] or through the recursive self-map.
//! - The bring-up [`PagingState`] machine and [`PageFault`] decoding.
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! ```text
//!  CR3 → PD ─┬─ PDE (PS=0) → PT → PTE → 4 KiB page
//!            └─ PDE (PS=1) ─────────────→ 4 MiB page
//! ```
//!
//! Both tables hold 1024 entries of 4 bytes. The physical address sits in
//! the upper 20 bits of an entry, the flags in the lower 12.
//!
//! ### Recursive mapping
//!
//! Directory slot 1023 points back at the directory itself. With that
//! directory active, the table of slot `i` shows up at
//! `0xFFC0_0000 + i * 0x1000` and the directory at `0xFFFF_F000`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod access;
pub mod address_space;
mod fault;
pub mod page_table;
mod state;

pub use crate::access::{Direct, PagingAccess, Recursive, invlpg};
pub use crate::address_space::{AddressSpace, RootPage, Unmapped};
pub use crate::fault::{PageFault, PageFaultErrorCode};
pub use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry, PdEntryKind};
pub use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
pub use crate::state::PagingState;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

bitflags::bitflags! {
    /// Flags of a page directory or page table entry.
    ///
    /// The same low 12 bits are used at both levels, except where noted.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct PageFlags: u32 {
        /// Page is present in physical memory.
        ///
        /// Cleared entries fault on access.
        const PRESENT = 1 << 0;

        /// Page is writable.
        const WRITABLE = 1 << 1;

        /// Page is accessible from user mode (CPL=3).
        const USER = 1 << 2;

        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;

        /// Caching disabled, for MMIO.
        const CACHE_DISABLE = 1 << 4;

        /// Set by the CPU on access.
        const ACCESSED = 1 << 5;

        /// Set by the CPU on the first write. Leaf entries only.
        const DIRTY = 1 << 6;

        /// Directory entry maps a 4 MiB page (PS). In a page table entry
        /// this bit is PAT.
        const LARGE = 1 << 7;

        /// Not flushed from the TLB on a CR3 reload (needs `CR4.PGE`).
        const GLOBAL = 1 << 8;
    }
}

/// Failures of the paging structure operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PagingError {
    #[error("address is not aligned to the page size")]
    Misaligned,
    #[error("address is already mapped")]
    AlreadyMapped,
    #[error("address is not mapped")]
    NotMapped,
    #[error("address lies in a 4 MiB page")]
    LargePage,
    #[error("address lies in the recursive page table window")]
    RecursiveWindow,
    #[error("no frame available for a page table")]
    OutOfFrames,
    #[error("invalid paging state transition from {from:?} to {to:?}")]
    InvalidTransition { from: PagingState, to: PagingState },
}

/// Minimal frame allocator used to obtain **physical** 4 KiB frames
/// for page tables.
///
/// Returns `None` when exhausted. Returned frames are 4 KiB aligned by type.
pub trait FrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space.
///
/// Early in boot this is the higher-half alias of low memory; host tests use
/// a simulated RAM.
pub trait PhysMapper {
    /// Convert a *physical* address to a mutable reference.
    ///
    /// # Safety
    /// - `pa` must lie in a range this mapper [covers](Self::covers), mapped
    ///   writable.
    /// - `T` must match the bytes at `pa`, and no other reference to them may
    ///   be alive for `'a`.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Whether `pa` is reachable through [`phys_to_mut`](Self::phys_to_mut).
    #[inline]
    fn covers(&self, pa: PhysicalAddress) -> bool {
        let _ = pa;
        true
    }
}

/// Enable 4 MiB pages and load `root` into CR3.
///
/// # Safety
/// `root` must be a complete directory that maps the running code, its stack
/// and every structure the caller touches afterwards.
#[cfg(all(feature = "asm", target_arch = "x86"))]
pub unsafe fn load_root(root: RootPage) {
    use kernel_registers::cr3::Cr3;
    use kernel_registers::cr4::Cr4;
    use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

    unsafe {
        let cr4 = Cr4::load_unsafe().with_pse(true);
        cr4.store_unsafe();
        Cr3::from_directory_phys(root.base(), false, false).store_unsafe();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::cell::UnsafeCell;

    /// A trivial **bump** allocator: always hands out the next 4 KiB frame.
    pub struct BumpAlloc {
        start: u32,
        next: u32,
        end: u32,
    }

    impl BumpAlloc {
        pub fn new(start: u32, end: u32) -> Self {
            Self {
                start,
                next: start,
                end,
            }
        }

        /// Frames handed out so far.
        pub fn used(&self) -> u32 {
            (self.next - self.start) >> 12
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            Some(PhysicalAddress::new(p).page())
        }
    }

    /// A 4 KiB-aligned raw frame, our "physical RAM" backing store.
    #[repr(align(4096))]
    struct Aligned4K(#[allow(dead_code)] [u8; 4096]);

    /// Simulated RAM: physical address `pa` lives in frame `pa >> 12`.
    ///
    /// Frame zero exists too, so tests typically start allocating at 0x1000.
    /// Frames sit in [`UnsafeCell`]s since page tables are written through
    /// a shared mapper.
    pub struct TestPhys {
        frames: Vec<UnsafeCell<Aligned4K>>,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
            Self {
                frames: (0..n).map(|_| UnsafeCell::new(Aligned4K([0; 4096]))).collect(),
            }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u32() >> 12) as usize;
            let off = (pa.as_u32() & 0xfff) as usize;
            let base = self.frames[idx].get().cast::<u8>();
            // SAFETY: the caller promises `T` matches the bytes in the frame.
            unsafe { &mut *base.add(off).cast::<T>() }
        }

        fn covers(&self, pa: PhysicalAddress) -> bool {
            ((pa.as_u32() >> 12) as usize) < self.frames.len()
        }
    }

    #[test]
    fn flags_match_hardware_bits() {
        assert_eq!(PageFlags::PRESENT.bits(), 0x1);
        assert_eq!((PageFlags::PRESENT | PageFlags::WRITABLE).bits(), 0x3);
        assert_eq!(PageFlags::LARGE.bits(), 0x80);
        assert_eq!(PageFlags::GLOBAL.bits(), 0x100);
    }

    #[test]
    fn test_phys_covers_only_its_frames() {
        let phys = TestPhys::with_frames(4);
        assert!(phys.covers(PhysicalAddress::new(0x3FFF)));
        assert!(!phys.covers(PhysicalAddress::new(0x4000)));
    }
}
