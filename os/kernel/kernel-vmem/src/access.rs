//! # Paging Structure Access
//!
//! Page tables are physical frames; code can only touch virtual memory. An
//! access view decides how a directory or table frame becomes a reference:
//!
//! - [`Recursive`]: through the self-map window (`PD_VADDR`, `PT_BASE_VADDR`).
//!   Valid once the directory's slot 1023 points at itself and that directory
//!   is the one loaded in CR3.
//! - [`Direct`]: through a [`PhysMapper`]. Used while building a directory
//!   that is not active yet, and by host tests that simulate RAM.

use crate::PhysMapper;
use crate::page_table::pd::{DirectoryIndex, PageDirectory};
use crate::page_table::pt::PageTable;
use kernel_info::memory::{PAGE_SIZE, PD_VADDR, PT_BASE_VADDR};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// How paging code reaches directory and table memory.
pub trait PagingAccess {
    /// The directory whose frame is `root`.
    ///
    /// # Safety
    /// - `root` must be a directory frame reachable through this view.
    /// - The caller must not create overlapping mutable references.
    unsafe fn directory<'a>(&self, root: PhysicalPage<Size4K>) -> &'a mut PageDirectory;

    /// The page table installed at directory slot `index`, whose frame is `frame`.
    ///
    /// # Safety
    /// - The directory entry at `index` must already point at `frame`.
    /// - The caller must not create overlapping mutable references.
    unsafe fn table<'a>(&self, index: DirectoryIndex, frame: PhysicalPage<Size4K>) -> &'a mut PageTable;

    /// Pointer to the byte at `va`, which the directory maps to `pa`.
    ///
    /// # Safety
    /// `va` must be mapped to `pa` in the directory this view serves.
    unsafe fn data(&self, va: VirtualAddress, pa: PhysicalAddress) -> *mut u8;

    /// Invalidate any cached translation for `va`.
    #[inline]
    fn flush(&self, va: VirtualAddress) {
        let _ = va;
    }

    /// Whether a frame can be used as a directory or table through this view.
    #[inline]
    fn reaches(&self, frame: PhysicalPage<Size4K>) -> bool {
        let _ = frame;
        true
    }
}

/// Access through the recursive self-map of the **active** directory.
#[derive(Copy, Clone, Debug, Default)]
pub struct Recursive;

impl Recursive {
    /// Virtual address at which directory slot `index`'s table is visible.
    #[inline]
    #[must_use]
    pub const fn table_window(index: DirectoryIndex) -> VirtualAddress {
        #[allow(clippy::cast_possible_truncation)]
        let index = index.as_usize() as u32;
        VirtualAddress::new(PT_BASE_VADDR + index * PAGE_SIZE)
    }
}

impl PagingAccess for Recursive {
    #[inline]
    unsafe fn directory<'a>(&self, _root: PhysicalPage<Size4K>) -> &'a mut PageDirectory {
        // SAFETY: slot 1023 maps the active directory at PD_VADDR.
        unsafe { &mut *(PD_VADDR as usize as *mut PageDirectory) }
    }

    #[inline]
    unsafe fn table<'a>(&self, index: DirectoryIndex, _frame: PhysicalPage<Size4K>) -> &'a mut PageTable {
        let va = Self::table_window(index);
        // SAFETY: the caller guarantees the slot points at a table.
        unsafe { &mut *(va.as_usize() as *mut PageTable) }
    }

    #[inline]
    unsafe fn data(&self, va: VirtualAddress, _pa: PhysicalAddress) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(va.as_usize())
    }

    #[inline]
    fn flush(&self, va: VirtualAddress) {
        invlpg(va);
    }
}

/// Access through a physical memory mapper.
pub struct Direct<'m, M: PhysMapper> {
    mapper: &'m M,
}

impl<M: PhysMapper> Clone for Direct<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: PhysMapper> Copy for Direct<'_, M> {}

impl<'m, M: PhysMapper> Direct<'m, M> {
    #[inline]
    pub const fn new(mapper: &'m M) -> Self {
        Self { mapper }
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }
}

impl<M: PhysMapper> PagingAccess for Direct<'_, M> {
    #[inline]
    unsafe fn directory<'a>(&self, root: PhysicalPage<Size4K>) -> &'a mut PageDirectory {
        unsafe { self.mapper.phys_to_mut::<PageDirectory>(root.base()) }
    }

    #[inline]
    unsafe fn table<'a>(&self, _index: DirectoryIndex, frame: PhysicalPage<Size4K>) -> &'a mut PageTable {
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame.base()) }
    }

    #[inline]
    unsafe fn data(&self, _va: VirtualAddress, pa: PhysicalAddress) -> *mut u8 {
        core::ptr::from_mut(unsafe { self.mapper.phys_to_mut::<u8>(pa) })
    }

    #[inline]
    fn reaches(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.mapper.covers(frame.base())
    }
}

/// Invalidate the TLB entry for `va`.
#[inline]
pub fn invlpg(va: VirtualAddress) {
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(feature = "asm", target_arch = "x86")))]
    let _ = va;
}
