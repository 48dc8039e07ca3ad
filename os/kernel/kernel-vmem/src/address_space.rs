//! # Address Space (IA-32, two-level)
//!
//! Typed operations on one page directory and the tables hanging off it.
//!
//! ## Highlights
//!
//! - [`AddressSpace::map_4k`] installs one 4 KiB mapping, creating (and
//!   zeroing) the page table on first use of a directory slot.
//! - [`AddressSpace::map_4m`] installs a 4 MiB large page directly in the
//!   directory.
//! - [`AddressSpace::unmap_4k`] clears one mapping and hands back the page
//!   table frame when the table became empty.
//! - [`AddressSpace::query`] translates a VA to a PA (handles large pages).
//! - [`AddressSpace::install_recursive`] writes the self-map into slot 1023.
//!
//! Every failing call leaves the structures exactly as they were.

use crate::access::{PagingAccess, Recursive};
use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry, PdEntryKind};
use crate::page_table::pt::{PageTable, PtEntry};
use crate::page_table::split_indices;
use crate::{FrameAlloc, PageFlags, PagingError};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress};

/// The directory frame of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'a, P: PagingAccess + ?Sized> {
    root: RootPage,
    access: &'a P,
}

/// Outcome of a successful [`AddressSpace::unmap_4k`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Unmapped {
    /// The frame that was mapped at the address.
    pub frame: PhysicalPage<Size4K>,
    /// Page table frame released because it no longer maps anything.
    /// Its directory slot has been cleared; the caller owns the frame now.
    pub released_table: Option<PhysicalPage<Size4K>>,
}

impl<'a, P: PagingAccess + ?Sized> AddressSpace<'a, P> {
    /// # Safety
    /// - `root` must be a page directory frame reachable through `access`.
    /// - No other code may mutate this directory or its tables while the
    ///   returned handle is alive.
    #[inline]
    pub const unsafe fn from_root(access: &'a P, root: RootPage) -> Self {
        Self { root, access }
    }

    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    #[inline]
    fn directory(&self) -> &'a mut PageDirectory {
        // SAFETY: upheld by the `from_root` contract.
        unsafe { self.access.directory(self.root) }
    }

    #[inline]
    fn table(&self, index: DirectoryIndex, frame: PhysicalPage<Size4K>) -> &'a mut PageTable {
        // SAFETY: callers pass the frame read from slot `index`.
        unsafe { self.access.table(index, frame) }
    }

    /// Directory entry covering `va`.
    #[inline]
    #[must_use]
    pub fn directory_entry(&self, va: VirtualAddress) -> PdEntry {
        self.directory().get(DirectoryIndex::from(va))
    }

    /// Zero the whole directory.
    pub fn clear(&self) {
        self.directory().zero();
    }

    /// Map one 4 KiB page `va → pa`.
    ///
    /// A missing page table is taken from `alloc`, zeroed and installed as
    /// present + writable (+ user when `flags` asks for it).
    ///
    /// # Errors
    /// - [`PagingError::Misaligned`] if `va` or `pa` is not 4 KiB aligned.
    /// - [`PagingError::AlreadyMapped`] if `va` is mapped, by a page table
    ///   entry or a 4 MiB page.
    /// - [`PagingError::OutOfFrames`] if a page table was needed and `alloc`
    ///   had none.
    /// - [`PagingError::RecursiveWindow`] if `va` lies in slot 1023, whose
    ///   "table" is the directory itself.
    pub fn map_4k<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), PagingError> {
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(PagingError::Misaligned);
        }
        let (di, ti) = split_indices(va);
        if di == DirectoryIndex::RECURSIVE {
            return Err(PagingError::RecursiveWindow);
        }

        let table_frame = match self.directory().get(di).kind() {
            Some(PdEntryKind::Leaf4MiB(..)) => return Err(PagingError::AlreadyMapped),
            Some(PdEntryKind::PageTable(frame, _)) => frame,
            None => self.install_table(alloc, di, flags)?,
        };

        let table = self.table(di, table_frame);
        if table.get(ti).is_present() {
            return Err(PagingError::AlreadyMapped);
        }
        table.set(ti, PtEntry::make_4k(pa.page(), flags));
        self.access.flush(va);
        log::trace!("mapped {va} -> {pa} ({flags:?})");
        Ok(())
    }

    fn install_table<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        di: DirectoryIndex,
        flags: PageFlags,
    ) -> Result<PhysicalPage<Size4K>, PagingError> {
        let frame = alloc.alloc_4k().ok_or(PagingError::OutOfFrames)?;
        let table_flags = PageFlags::PRESENT | PageFlags::WRITABLE | (flags & PageFlags::USER);
        self.directory().set(di, PdEntry::make_table(frame, table_flags));
        self.access.flush(Recursive::table_window(di));
        self.table(di, frame).zero();
        log::trace!("new page table {:?} for slot {}", frame, di.as_usize());
        Ok(frame)
    }

    /// Map one 4 MiB large page `va → pa` directly in the directory.
    ///
    /// # Errors
    /// - [`PagingError::Misaligned`] if either address is not 4 MiB aligned.
    /// - [`PagingError::AlreadyMapped`] if the slot is present.
    /// - [`PagingError::RecursiveWindow`] for slot 1023.
    pub fn map_4m(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), PagingError> {
        if !va.is_aligned::<Size4M>() || !pa.is_aligned::<Size4M>() {
            return Err(PagingError::Misaligned);
        }
        let di = DirectoryIndex::from(va);
        if di == DirectoryIndex::RECURSIVE {
            return Err(PagingError::RecursiveWindow);
        }
        let dir = self.directory();
        if dir.get(di).is_present() {
            return Err(PagingError::AlreadyMapped);
        }
        dir.set(di, PdEntry::make_4m(pa.page::<Size4M>(), flags));
        self.access.flush(va);
        log::trace!("mapped {va} -> {pa} as 4 MiB page");
        Ok(())
    }

    /// Unmap a single 4 KiB page at `va`.
    ///
    /// The entry is overwritten with the "not present, writable" placeholder.
    /// If that was the last present entry, the table is unhooked from the
    /// directory and reported in [`Unmapped::released_table`].
    ///
    /// # Errors
    /// - [`PagingError::Misaligned`] if `va` is not 4 KiB aligned.
    /// - [`PagingError::LargePage`] if `va` lies in a 4 MiB mapping.
    /// - [`PagingError::NotMapped`] if nothing is mapped at `va`.
    /// - [`PagingError::RecursiveWindow`] if `va` lies in slot 1023; the
    ///   self-map is never taken apart page by page.
    pub fn unmap_4k(&self, va: VirtualAddress) -> Result<Unmapped, PagingError> {
        if !va.is_aligned::<Size4K>() {
            return Err(PagingError::Misaligned);
        }
        let (di, ti) = split_indices(va);
        if di == DirectoryIndex::RECURSIVE {
            return Err(PagingError::RecursiveWindow);
        }

        let table_frame = match self.directory().get(di).kind() {
            None => return Err(PagingError::NotMapped),
            Some(PdEntryKind::Leaf4MiB(..)) => return Err(PagingError::LargePage),
            Some(PdEntryKind::PageTable(frame, _)) => frame,
        };

        let table = self.table(di, table_frame);
        let Some((frame, _)) = table.get(ti).page_4k() else {
            return Err(PagingError::NotMapped);
        };
        table.set(ti, PtEntry::unmapped());
        self.access.flush(va);
        log::trace!("unmapped {va} (was {frame:?})");

        let released_table = if table.is_unused() {
            self.directory().set_zero(di);
            self.access.flush(Recursive::table_window(di));
            log::trace!("released page table {:?} of slot {}", table_frame, di.as_usize());
            Some(table_frame)
        } else {
            None
        };

        Ok(Unmapped {
            frame,
            released_table,
        })
    }

    /// Translate `va` if mapped, honouring 4 MiB pages.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (di, ti) = split_indices(va);
        match self.directory().get(di).kind()? {
            PdEntryKind::Leaf4MiB(base, _) => Some(base.join(va.offset::<Size4M>())),
            PdEntryKind::PageTable(frame, _) => {
                let (page, _) = self.table(di, frame).get(ti).page_4k()?;
                Some(page.join(va.offset::<Size4K>()))
            }
        }
    }

    /// `true` if any mapping covers `va`.
    #[inline]
    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.query(va).is_some()
    }

    /// `true` if the directory slot covering `va` has nothing present.
    #[inline]
    #[must_use]
    pub fn slot_is_empty(&self, va: VirtualAddress) -> bool {
        !self.directory_entry(va).is_present()
    }

    /// Point slot 1023 at the directory itself.
    ///
    /// # Errors
    /// [`PagingError::AlreadyMapped`] if the slot holds something else.
    pub fn install_recursive(&self) -> Result<(), PagingError> {
        let dir = self.directory();
        let self_entry = PdEntry::make_table(self.root, PageFlags::PRESENT | PageFlags::WRITABLE);
        let current = dir.get(DirectoryIndex::RECURSIVE);
        if current.is_present() {
            return if current.table() == Some(self.root) {
                Ok(())
            } else {
                Err(PagingError::AlreadyMapped)
            };
        }
        dir.set(DirectoryIndex::RECURSIVE, self_entry);
        log::debug!("recursive slot points at {:?}", self.root);
        Ok(())
    }

    /// Whether slot 1023 points at this directory.
    #[must_use]
    pub fn has_recursive(&self) -> bool {
        self.directory().get(DirectoryIndex::RECURSIVE).table() == Some(self.root)
    }

    /// Number of present 4 KiB mappings in the table covering `va`.
    #[must_use]
    pub fn table_occupancy(&self, va: VirtualAddress) -> Option<usize> {
        let di = DirectoryIndex::from(va);
        let frame = self.directory().get(di).table()?;
        Some(self.table(di, frame).present_count())
    }
}
