//! # IA-32 Page Table (PT)
//!
//! - [`TableIndex`]: index type for VA bits `[21:12]`.
//! - [`Pte`]: bit layout of a page table entry.
//! - [`PtEntry`]: one entry, mapping a single 4 KiB page when present.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 entries.
//!
//! A table never points to another table; every present entry is a leaf.
//! After modifying active mappings, the caller performs TLB maintenance.

use crate::PageFlags;
use crate::page_table::{FLAGS_MASK, PRESENT_BIT};
use bitfield_struct::bitfield;
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Value written over an unmapped entry: not present, but writable.
///
/// Distinguishes "explicitly unmapped" from "never mapped" (all zero).
pub const UNMAPPED_PLACEHOLDER: u32 = 0x2;

/// Index into a Page Table (derived from VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Build an index from a virtual address (extracts bits `[21:12]`).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.table_index() as u16)
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
}

/// Page table entry bits.
///
/// | Bits  | Name | Meaning |
/// |-------|------|---------|
/// | 0     | P    | Present |
/// | 1     | RW   | Writable |
/// | 2     | US   | User accessible |
/// | 3     | PWT  | Write-through |
/// | 4     | PCD  | Cache disable |
/// | 5     | A    | Accessed |
/// | 6     | D    | Dirty |
/// | 7     | PAT  | Page attribute table index |
/// | 8     | G    | Global |
/// | 9–11  | AVL  | Free for the OS |
/// | 12–31 | addr | Frame base >> 12 |
#[bitfield(u32)]
pub struct Pte {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub pat: bool,
    pub global: bool,
    #[bits(3)]
    pub os_available: u8,
    #[bits(20)]
    frame_4k: u32,
}

impl Pte {
    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.frame_4k() << 12))
    }
}

/// A single Page Table entry.
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PtEntry(u32);

impl PtEntry {
    /// Create a zero (never mapped) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// The placeholder left behind by an unmap.
    #[inline]
    #[must_use]
    pub const fn unmapped() -> Self {
        Self(UNMAPPED_PLACEHOLDER)
    }

    /// Present leaf mapping `page` with `flags` (P is forced on).
    #[inline]
    #[must_use]
    pub const fn make_4k(page: PhysicalPage<Size4K>, flags: PageFlags) -> Self {
        Self(page.base().as_u32() | (flags.bits() & FLAGS_MASK) | PRESENT_BIT)
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & PRESENT_BIT != 0
    }

    /// If present, the mapped frame and its flags.
    #[inline]
    #[must_use]
    pub const fn page_4k(self) -> Option<(PhysicalPage<Size4K>, PageFlags)> {
        if !self.is_present() {
            return None;
        }
        let bits = Pte::from_bits(self.0);
        Some((bits.physical_page(), self.flags()))
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> Pte {
        Pte::from_bits(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Construct from a raw value (no validation).
    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(v)
    }
}

impl core::fmt::Debug for PtEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PtEntry(0x{:08X})", self.0)
    }
}

/// The Page Table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create a fully zeroed Page Table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); ENTRIES_PER_TABLE],
        }
    }

    /// Clear every entry in place.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PtEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`. TLB invalidation is up to the caller.
    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// `true` if no entry in the table is present.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        !self.entries.iter().any(|e| e.is_present())
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}
