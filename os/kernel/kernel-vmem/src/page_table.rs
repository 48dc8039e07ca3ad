//! # Memory Page Table
//!
//! The two structures of non-PAE 32-bit paging. Both are one 4 KiB frame of
//! 1024 little-endian `u32` entries.

pub mod pd;
pub mod pt;

use crate::page_table::pd::DirectoryIndex;
use crate::page_table::pt::TableIndex;
use kernel_memory_addresses::VirtualAddress;

/// Hardware **Present** bit position shared across levels (bit 0).
pub(crate) const PRESENT_BIT: u32 = 1 << 0;

/// Hardware **Page Size** (PS) bit (bit 7).
///
/// - In a directory entry: `1` maps a 4 MiB page, `0` points at a page table.
/// - In a page table entry: bit 7 is **PAT** (not PS).
pub(crate) const PS_BIT: u32 = 1 << 7;

/// Low 12 bits of an entry hold flags; the rest is the frame address.
pub(crate) const FLAGS_MASK: u32 = 0xFFF;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirectoryIndex, TableIndex) {
    (DirectoryIndex::from(va), TableIndex::from(va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let (di, ti) = split_indices(VirtualAddress::new(0xC012_3456));
        assert_eq!(di.as_usize(), 0x300);
        assert_eq!(ti.as_usize(), 0x123);

        let (di, ti) = split_indices(VirtualAddress::new(0xFFFF_FFFF));
        assert_eq!(di.as_usize(), 1023);
        assert_eq!(ti.as_usize(), 1023);
    }
}
