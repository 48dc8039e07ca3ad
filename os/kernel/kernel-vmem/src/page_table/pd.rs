//! # IA-32 Page Directory (PD)
//!
//! - [`DirectoryIndex`]: index type for virtual-address bits `[31:22]`.
//! - [`PdEntry`]: a directory entry that either points to a page table
//!   (`PS=0`) or maps a 4 MiB page directly (`PS=1`, needs `CR4.PSE`).
//! - [`PdEntryKind`]: decoded view of an entry.
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 directory entries.
//!
//! Raw constructors don't validate consistency. TLB maintenance is the
//! caller's responsibility after mutating active mappings.

use crate::PageFlags;
use crate::page_table::{FLAGS_MASK, PRESENT_BIT, PS_BIT};
use bitfield_struct::bitfield;
use kernel_info::memory::{ENTRIES_PER_TABLE, RECURSIVE_INDEX};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirectoryIndex(u16);

impl DirectoryIndex {
    /// The slot holding the recursive self-map.
    #[allow(clippy::cast_possible_truncation)]
    pub const RECURSIVE: Self = Self(RECURSIVE_INDEX as u16);

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.directory_index() as u16)
    }

    /// Construct from a raw `u16`. Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES_PER_TABLE);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// First virtual address covered by this slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::from_indices(self.as_usize(), 0)
    }
}

/// Directory entry pointing at a **Page Table** (`PS = 0`).
#[bitfield(u32)]
pub struct Pde {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    /// Bit 6: ignored for table pointers.
    #[bits(1)]
    __ignored6: u8,
    /// Bit 7: PS, must be 0 here.
    #[bits(1)]
    __ps_must_be_0: u8,
    /// Bit 8: ignored for table pointers.
    #[bits(1)]
    __ignored8: u8,
    #[bits(3)]
    pub os_available: u8,
    /// Page table frame >> 12.
    #[bits(20)]
    table_4k: u32,
}

impl Pde {
    #[inline]
    #[must_use]
    pub const fn with_table(mut self, table: PhysicalPage<Size4K>) -> Self {
        self.set_table_4k(table.base().as_u32() >> 12);
        self
    }

    #[inline]
    #[must_use]
    pub const fn table(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.table_4k() << 12))
    }
}

/// Directory entry mapping a **4 MiB page** (`PS = 1`).
#[bitfield(u32)]
pub struct Pde4M {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// Bit 7: PS, always 1 for this form.
    #[bits(default = true)]
    pub(crate) page_size: bool,
    pub global: bool,
    #[bits(3)]
    pub os_available: u8,
    /// Bit 12: PAT selector for large pages.
    pub pat_large: bool,
    /// Bits 13..21: reserved without PSE-36.
    #[bits(9)]
    __reserved: u16,
    /// Page frame >> 22.
    #[bits(10)]
    frame_4m: u16,
}

impl Pde4M {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_page(mut self, page: PhysicalPage<Size4M>) -> Self {
        self.set_frame_4m((page.base().as_u32() >> 22) as u16);
        self.set_page_size(true);
        self
    }

    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage<Size4M> {
        PhysicalPage::from_addr(PhysicalAddress::new((self.frame_4m() as u32) << 22))
    }
}

/// Overlays [`Pde`] and [`Pde4M`] on the same 32-bit storage.
///
/// Prefer [`PdEntry::kind`] for typed access; it checks the **PS** bit.
#[derive(Copy, Clone)]
#[repr(C)]
pub union PdEntry {
    bits: u32,
    table: Pde,
    large: Pde4M,
}

/// Decoded directory entry.
#[derive(Copy, Clone, Debug)]
pub enum PdEntryKind {
    PageTable(PhysicalPage<Size4K>, Pde),
    Leaf4MiB(PhysicalPage<Size4M>, Pde4M),
}

impl Default for PdEntry {
    #[inline]
    fn default() -> Self {
        Self::zero()
    }
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self { bits: 0 }
    }

    /// Pointer to `table`. P is forced on, PS forced off.
    #[inline]
    #[must_use]
    pub const fn make_table(table: PhysicalPage<Size4K>, flags: PageFlags) -> Self {
        let bits = (flags.bits() & FLAGS_MASK & !PS_BIT) | PRESENT_BIT;
        Self {
            table: Pde::from_bits(bits).with_table(table),
        }
    }

    /// 4 MiB leaf mapping `page`. P and PS are forced on.
    #[inline]
    #[must_use]
    pub const fn make_4m(page: PhysicalPage<Size4M>, flags: PageFlags) -> Self {
        let bits = (flags.bits() & FLAGS_MASK) | PRESENT_BIT | PS_BIT;
        Self {
            large: Pde4M::from_bits(bits).with_page(page),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.raw() & PRESENT_BIT != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_large(self) -> bool {
        self.raw() & PS_BIT != 0
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        // SAFETY: every variant is a plain u32.
        unsafe { self.bits }
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(bits: u32) -> Self {
        Self { bits }
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.raw() & FLAGS_MASK)
    }

    /// Decode the entry, or `None` if not present.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<PdEntryKind> {
        if !self.is_present() {
            return None;
        }
        // SAFETY: the PS bit selects the active variant.
        unsafe {
            Some(if self.is_large() {
                PdEntryKind::Leaf4MiB(self.large.page(), self.large)
            } else {
                PdEntryKind::PageTable(self.table.table(), self.table)
            })
        }
    }

    /// The page table frame, if this entry points at one.
    #[inline]
    #[must_use]
    pub const fn table(self) -> Option<PhysicalPage<Size4K>> {
        match self.kind() {
            Some(PdEntryKind::PageTable(page, _)) => Some(page),
            _ => None,
        }
    }
}

impl core::fmt::Debug for PdEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PdEntry(0x{:08X})", self.raw())
    }
}

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES_PER_TABLE],
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirectoryIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`. TLB invalidation is up to the caller.
    #[inline]
    pub const fn set(&mut self, i: DirectoryIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub const fn set_zero(&mut self, i: DirectoryIndex) {
        self.set(i, PdEntry::zero());
    }
}
