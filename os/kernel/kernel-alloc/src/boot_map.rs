//! # Boot-time seeding of the frame allocator
//!
//! Turns the boot loader's memory map into free-region records:
//!
//! 1. Size physical memory ([`ram_size`]) and from that the worst-case
//!    bookkeeping area ([`bookkeeping_bytes`]).
//! 2. For each available map entry, clip to 4 GiB, skip frame zero and
//!    shrink to whole frames.
//! 3. Cut out every [`Reservation`] (kernel image plus bookkeeping, the boot
//!    page directory, anything else the caller names).
//! 4. Free what is left through the coalescing path.

use crate::frame_alloc::{FrameAllocError, FreeRegion, StackFrameAlloc};
use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::{LARGE_PAGE_SIZE, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, Size4K};

/// Most reservations [`seed`] accepts (including the kernel's own).
pub const MAX_RESERVATIONS: usize = 8;

const PHYS_LIMIT: u64 = 1 << 32;
const PAGE: u64 = PAGE_SIZE as u64;

/// A physical range `[start, end)` that must never be handed out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Reservation {
    pub start: u64,
    pub end: u64,
}

impl Reservation {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// One 4 KiB frame, e.g. the boot page directory.
    #[must_use]
    pub const fn frame(at: PhysicalAddress) -> Self {
        let start = at.as_u32() as u64 & !(PAGE - 1);
        Self::new(start, start + PAGE)
    }

    /// Widened to whole frames.
    const fn page_aligned(self) -> Self {
        Self {
            start: self.start & !(PAGE - 1),
            end: (self.end + PAGE - 1) & !(PAGE - 1),
        }
    }
}

/// Physical placement of the kernel image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KernelImage {
    /// First byte of the image.
    pub start: PhysicalAddress,
    /// One past the last byte, including `.bss`.
    pub end: PhysicalAddress,
}

impl KernelImage {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self { start, end }
    }

    /// Where the free-region stack goes: the first frame after the image.
    #[must_use]
    pub const fn bookkeeping_start(&self) -> Option<PhysicalAddress> {
        match self.end.checked_align_up::<Size4K>() {
            Some(a) => Some(a),
            None => None,
        }
    }

    /// The image plus `bookkeeping` bytes behind it.
    #[must_use]
    pub const fn reservation(&self, bookkeeping: u32) -> Reservation {
        let end = (self.end.as_u32() as u64 + PAGE - 1) & !(PAGE - 1);
        Reservation::new(self.start.as_u32() as u64, end + bookkeeping as u64)
    }

    /// Number of 4 MiB pages needed to map everything below the end of the
    /// reservation, at least one.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn large_pages(&self, bookkeeping: u32) -> u32 {
        let end = self.reservation(bookkeeping).end;
        let pages = end.div_ceil(LARGE_PAGE_SIZE as u64);
        // At most 2048 pages: both ends lie below 8 GiB.
        if pages == 0 { 1 } else { pages as u32 }
    }
}

/// How a reserved range relates to a free range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Overlap {
    /// The reservation ends at or before the free range.
    Below,
    /// The reservation starts at or after the end of the free range.
    Above,
    /// The reservation covers the start of the free range.
    CoversStart,
    /// The reservation covers the end of the free range.
    CoversEnd,
    /// The reservation lies strictly inside, splitting the range in two.
    Inside,
    /// The reservation swallows the whole free range.
    Covered,
}

/// Classify `reserved` against the free range `[start, end)`.
#[must_use]
pub const fn classify(start: u64, end: u64, reserved: Reservation) -> Overlap {
    if reserved.end <= start {
        Overlap::Below
    } else if reserved.start >= end {
        Overlap::Above
    } else if reserved.start <= start && reserved.end >= end {
        Overlap::Covered
    } else if reserved.start <= start {
        Overlap::CoversStart
    } else if reserved.end >= end {
        Overlap::CoversEnd
    } else {
        Overlap::Inside
    }
}

/// Physical memory size in bytes.
///
/// Prefers the boot loader's lower/upper memory figures; otherwise the highest
/// end of an available map entry (clipped to 4 GiB).
///
/// # Errors
/// [`FrameAllocError::MissingMemoryMap`] if neither is present.
pub fn ram_size(info: &BootMemoryInfo<'_>) -> Result<u64, FrameAllocError> {
    if let Some(basic) = info.basic {
        return Ok(basic.total_bytes());
    }
    let map = info.map.ok_or(FrameAllocError::MissingMemoryMap)?;
    Ok(map
        .iter()
        .filter(|r| r.is_available())
        .map(|r| r.end().min(PHYS_LIMIT))
        .max()
        .unwrap_or(0))
}

/// Records needed to track `ram` bytes in the worst case: one per frame.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn frame_capacity(ram: u64) -> usize {
    // Clipped to 2^20 frames.
    let ram = if ram > PHYS_LIMIT { PHYS_LIMIT } else { ram };
    (ram / PAGE) as usize
}

/// Size of the bookkeeping area for `ram` bytes, rounded up to a page.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn bookkeeping_bytes(ram: u64) -> u32 {
    let bytes = (frame_capacity(ram) * size_of::<FreeRegion>()) as u64;
    // At most 8 MiB for 4 GiB of RAM.
    ((bytes + PAGE - 1) & !(PAGE - 1)) as u32
}

/// What seeding found.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SeedSummary {
    /// Ranges handed to the allocator.
    pub ranges: usize,
    /// Frames handed to the allocator.
    pub pages: u32,
}

/// Up to `MAX_RESERVATIONS + 1` pieces of one free range.
struct Pieces {
    items: [(u64, u64); MAX_RESERVATIONS + 1],
    len: usize,
}

impl Pieces {
    const fn one(start: u64, end: u64) -> Self {
        let mut items = [(0, 0); MAX_RESERVATIONS + 1];
        items[0] = (start, end);
        Self { items, len: 1 }
    }

    fn push(&mut self, start: u64, end: u64) {
        if start < end {
            self.items[self.len] = (start, end);
            self.len += 1;
        }
    }

    fn subtract(&self, reserved: Reservation) -> Self {
        let mut out = Self {
            items: [(0, 0); MAX_RESERVATIONS + 1],
            len: 0,
        };
        for &(start, end) in &self.items[..self.len] {
            match classify(start, end, reserved) {
                Overlap::Below | Overlap::Above => out.push(start, end),
                Overlap::CoversStart => out.push(reserved.end, end),
                Overlap::CoversEnd => out.push(start, reserved.start),
                Overlap::Inside => {
                    out.push(start, reserved.start);
                    out.push(reserved.end, end);
                }
                Overlap::Covered => {}
            }
        }
        out
    }
}

/// Seed `alloc` with every available frame not covered by `reservations`.
///
/// # Errors
/// - [`FrameAllocError::MissingMemoryMap`] if the boot information carries no
///   memory map (logged).
/// - [`FrameAllocError::InvalidArgument`] for more than [`MAX_RESERVATIONS`]
///   reservations.
/// - [`FrameAllocError::CapacityOverflow`] if the records do not fit.
#[allow(clippy::cast_possible_truncation)]
pub fn seed(
    alloc: &mut StackFrameAlloc<'_>,
    info: &BootMemoryInfo<'_>,
    reservations: &[Reservation],
) -> Result<SeedSummary, FrameAllocError> {
    if reservations.len() > MAX_RESERVATIONS {
        return Err(FrameAllocError::InvalidArgument);
    }
    let Some(map) = info.map else {
        log::error!("no memory map provided by the boot loader");
        return Err(FrameAllocError::MissingMemoryMap);
    };

    let mut summary = SeedSummary::default();
    for region in map.iter().filter(|r| r.is_available()) {
        // Frame zero stays reserved so that address zero is never handed out.
        let Some(start) = region.base.max(PAGE).checked_next_multiple_of(PAGE) else {
            log::warn!("skipping memory map entry at {:#x}", region.base);
            continue;
        };
        let end = region.end().min(PHYS_LIMIT) & !(PAGE - 1);
        if start >= end {
            continue;
        }

        let mut pieces = Pieces::one(start, end);
        for reserved in reservations {
            pieces = pieces.subtract(reserved.page_aligned());
        }

        for &(start, end) in &pieces.items[..pieces.len] {
            // Both bounds lie below 4 GiB and start >= 4 KiB, so the length fits.
            let base = PhysicalAddress::new(start as u32);
            let bytes = (end - start) as u32;
            match alloc.free_frames(base, bytes) {
                Ok(()) => {
                    summary.ranges += 1;
                    summary.pages += bytes / PAGE_SIZE;
                }
                Err(FrameAllocError::Conflict) => {
                    log::warn!("memory map entries overlap at {base}, range skipped");
                }
                Err(e) => return Err(e),
            }
        }
    }

    log::info!(
        "frame allocator seeded: {} frames ({} KiB) in {} ranges, {} records",
        summary.pages,
        u64::from(summary.pages) * PAGE / 1024,
        summary.ranges,
        alloc.len()
    );
    Ok(summary)
}
