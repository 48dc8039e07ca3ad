//! # Boot Information
//!
//! The subset of the multiboot (v1) information structure the memory manager
//! consumes: the basic lower/upper memory sizes and the BIOS memory map.

use core::fmt;

/// `mem_lower`/`mem_upper` are valid.
pub const MULTIBOOT_FLAG_MEMORY: u32 = 1 << 0;

/// `mmap_length`/`mmap_addr` are valid.
pub const MULTIBOOT_FLAG_MMAP: u32 = 1 << 6;

/// Multiboot information structure, as pointed to by `ebx` at entry.
///
/// Only the fields up to the memory map are declared; the structure
/// continues with drive, config table and VBE information we never read.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MultibootInfo {
    pub flags: u32,
    /// KiB of memory below 1 MiB.
    pub mem_lower: u32,
    /// KiB of memory above 1 MiB, up to the first hole.
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    /// Length of the memory map buffer in bytes.
    pub mmap_length: u32,
    /// Physical address of the memory map buffer.
    pub mmap_addr: u32,
}

impl MultibootInfo {
    /// Basic memory sizes, if the boot loader provided them.
    #[must_use]
    pub const fn basic_memory(&self) -> Option<BasicMemory> {
        if self.flags & MULTIBOOT_FLAG_MEMORY == 0 {
            return None;
        }
        Some(BasicMemory {
            lower_kib: self.mem_lower,
            upper_kib: self.mem_upper,
        })
    }

    /// Physical location and byte length of the memory map buffer.
    #[must_use]
    pub const fn memory_map_location(&self) -> Option<(u32, u32)> {
        if self.flags & MULTIBOOT_FLAG_MMAP == 0 {
            return None;
        }
        Some((self.mmap_addr, self.mmap_length))
    }

    /// Combines the header with the memory map bytes the caller made
    /// reachable (see [`memory_map_location`](Self::memory_map_location)).
    ///
    /// The map is ignored unless the header flags it as present.
    #[must_use]
    pub const fn memory_info<'a>(&self, mmap: &'a [u8]) -> BootMemoryInfo<'a> {
        BootMemoryInfo {
            basic: self.basic_memory(),
            map: if self.flags & MULTIBOOT_FLAG_MMAP == 0 {
                None
            } else {
                Some(MemoryMap::Raw(mmap))
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BasicMemory {
    pub lower_kib: u32,
    pub upper_kib: u32,
}

impl BasicMemory {
    /// Total bytes reported by the boot loader.
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        (self.lower_kib as u64 + self.upper_kib as u64) * 1024
    }
}

/// Memory map entry type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    Available,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    Other(u32),
}

impl From<u32> for MemoryKind {
    fn from(value: u32) -> Self {
        match value {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            other => Self::Other(other),
        }
    }
}

/// One physical memory range, with the 64-bit halves already combined.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn available(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            kind: MemoryKind::Available,
        }
    }

    /// Exclusive end of the range, saturating.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, MemoryKind::Available)
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryRegion(0x{:09X}..0x{:09X}, {:?})",
            self.base,
            self.end(),
            self.kind
        )
    }
}

/// Memory map as handed to the frame allocator.
#[derive(Clone, Copy, Debug)]
pub enum MemoryMap<'a> {
    /// Raw multiboot buffer: `{size, base_lo, base_hi, len_lo, len_hi, type}`
    /// records with a stride of `size + 4` bytes.
    Raw(&'a [u8]),
    /// Already decoded regions.
    Regions(&'a [MemoryRegion]),
}

impl<'a> MemoryMap<'a> {
    #[must_use]
    pub fn iter(&self) -> MemoryMapIter<'a> {
        match *self {
            Self::Raw(bytes) => MemoryMapIter::Raw { bytes, offset: 0 },
            Self::Regions(regions) => MemoryMapIter::Regions(regions.iter()),
        }
    }
}

impl<'a> IntoIterator for MemoryMap<'a> {
    type Item = MemoryRegion;
    type IntoIter = MemoryMapIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub enum MemoryMapIter<'a> {
    Raw { bytes: &'a [u8], offset: usize },
    Regions(core::slice::Iter<'a, MemoryRegion>),
}

/// Bytes of a raw entry following its `size` field.
const RAW_ENTRY_PAYLOAD: usize = 20;

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

impl Iterator for MemoryMapIter<'_> {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Regions(iter) => iter.next().copied(),
            Self::Raw { bytes, offset } => {
                let at = *offset;
                let size = read_u32(bytes, at)? as usize;
                // A truncated or malformed record ends the walk. `at + 4` is in
                // bounds since the size field was read.
                let next = (at + 4)
                    .checked_add(size)
                    .filter(|&next| size >= RAW_ENTRY_PAYLOAD && next <= bytes.len());
                let Some(next) = next else {
                    *offset = bytes.len();
                    return None;
                };
                let word = |i: usize| read_u32(bytes, at + 4 + i * 4);
                let base = u64::from(word(0)?) | (u64::from(word(1)?) << 32);
                let length = u64::from(word(2)?) | (u64::from(word(3)?) << 32);
                let kind = MemoryKind::from(word(4)?);
                *offset = next;
                Some(MemoryRegion { base, length, kind })
            }
        }
    }
}

/// What the frame allocator learns about physical memory at boot.
#[derive(Clone, Copy, Debug, Default)]
pub struct BootMemoryInfo<'a> {
    pub basic: Option<BasicMemory>,
    pub map: Option<MemoryMap<'a>>,
}

impl<'a> BootMemoryInfo<'a> {
    /// Memory info built from decoded regions only.
    #[must_use]
    pub const fn from_regions(regions: &'a [MemoryRegion]) -> Self {
        Self {
            basic: None,
            map: Some(MemoryMap::Regions(regions)),
        }
    }

    #[must_use]
    pub const fn with_basic(mut self, lower_kib: u32, upper_kib: u32) -> Self {
        self.basic = Some(BasicMemory {
            lower_kib,
            upper_kib,
        });
        self
    }
}
