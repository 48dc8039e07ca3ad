//! # Physical Frame Allocator
//!
//! Free physical memory is a stack of [`FreeRegion`] records, each a run of
//! contiguous 4 KiB frames. The stack lives in caller-provided storage (the
//! bookkeeping area right behind the kernel image) because nothing can be
//! allocated dynamically before this allocator exists.
//!
//! ```text
//!  top ─► { 0x0030_0000, 16 }
//!         { 0x0010_4000,  4 }
//!         { 0x0020_0000, 64 }
//!  0   ─► { 0x0000_1000, 158 }
//! ```
//!
//! - Single frames are popped from the top; a longer run is pushed back
//!   shortened by one frame.
//! - Multi-frame requests take the first record from the top that is large
//!   enough.
//! - Frees coalesce with the free neighbours on both sides.
//! - Records are only sorted right after [`StackFrameAlloc::sort`].

use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, checked_align_up};
use kernel_vmem::FrameAlloc;

/// End of the 32-bit physical address space.
const PHYS_LIMIT: u64 = 1 << 32;

/// Failures of the physical frame allocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("no free physical memory large enough")]
    Exhausted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("range overlaps memory that is already free")]
    Conflict,
    #[error("free-region stack is full")]
    CapacityOverflow,
    #[error("boot information carries no memory map")]
    MissingMemoryMap,
}

impl FrameAllocError {
    /// Conditions the kernel cannot continue from.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::CapacityOverflow | Self::MissingMemoryMap)
    }
}

/// A run of free, contiguous 4 KiB frames.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FreeRegion {
    pub base: PhysicalAddress,
    pub pages: u32,
}

impl FreeRegion {
    #[must_use]
    pub const fn new(base: PhysicalAddress, pages: u32) -> Self {
        Self { base, pages }
    }

    /// Exclusive end address. May be exactly 4 GiB, hence `u64`.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u32() as u64 + self.pages as u64 * PAGE_SIZE as u64
    }

    /// Whether `[start, end)` shares at least one byte with this region.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, start: u64, end: u64) -> bool {
        (self.base.as_u32() as u64) < end && start < self.end()
    }
}

/// Number of frames needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u32) -> u32 {
    bytes.div_ceil(PAGE_SIZE)
}

/// `bytes` rounded up to a whole page, `None` past 4 GiB.
#[inline]
#[must_use]
pub const fn round_page_aligned(bytes: u32) -> Option<u32> {
    checked_align_up(bytes, PAGE_SIZE)
}

/// Frame allocator over a stack of [`FreeRegion`] records.
pub struct StackFrameAlloc<'s> {
    slots: &'s mut [FreeRegion],
    len: usize,
}

impl<'s> StackFrameAlloc<'s> {
    /// An empty allocator; `slots.len()` is its capacity.
    #[must_use]
    pub const fn new(slots: &'s mut [FreeRegion]) -> Self {
        Self { slots, len: 0 }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Records that can still be pushed before the stack is full.
    #[inline]
    #[must_use]
    pub const fn spare(&self) -> usize {
        self.slots.len() - self.len
    }

    /// The live records, bottom first.
    #[inline]
    #[must_use]
    pub fn regions(&self) -> &[FreeRegion] {
        &self.slots[..self.len]
    }

    /// Total number of free frames.
    #[must_use]
    pub fn free_pages(&self) -> u32 {
        self.regions().iter().map(|r| r.pages).sum()
    }

    /// Whether the frame at `addr` is currently free.
    #[must_use]
    pub fn is_free(&self, addr: PhysicalAddress) -> bool {
        let at = u64::from(addr.as_u32());
        self.regions().iter().any(|r| r.overlaps(at, at + 1))
    }

    fn push(&mut self, region: FreeRegion) -> Result<(), FrameAllocError> {
        if self.len == self.capacity() {
            log::error!(
                "free-region stack full ({} records), cannot track {:?}",
                self.capacity(),
                region
            );
            return Err(FrameAllocError::CapacityOverflow);
        }
        self.slots[self.len] = region;
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<FreeRegion> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.slots[self.len])
    }

    /// Removes record `index`, keeping the order of all others.
    fn remove(&mut self, index: usize) -> FreeRegion {
        let region = self.slots[index];
        self.slots.copy_within(index + 1..self.len, index);
        self.len -= 1;
        region
    }

    /// Allocate one frame.
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] if no frame is free.
    pub fn allocate_frame(&mut self) -> Result<PhysicalAddress, FrameAllocError> {
        let region = self.pop().ok_or(FrameAllocError::Exhausted)?;
        if region.pages > 1 {
            // Cannot overflow: the slot was just vacated.
            self.push(FreeRegion::new(region.base + PAGE_SIZE, region.pages - 1))?;
        }
        log::trace!("frame {} allocated", region.base);
        Ok(region.base)
    }

    /// Allocate the first frame of the topmost record for which `accept`
    /// holds, e.g. one reachable through a limited physical mapping.
    ///
    /// # Errors
    /// [`FrameAllocError::Exhausted`] if no record qualifies.
    pub fn allocate_frame_where(
        &mut self,
        accept: impl Fn(PhysicalAddress) -> bool,
    ) -> Result<PhysicalAddress, FrameAllocError> {
        let index = (0..self.len)
            .rev()
            .find(|&i| accept(self.slots[i].base))
            .ok_or(FrameAllocError::Exhausted)?;
        let region = &mut self.slots[index];
        let base = region.base;
        if region.pages > 1 {
            region.base += PAGE_SIZE;
            region.pages -= 1;
        } else {
            self.remove(index);
        }
        log::trace!("frame {base} allocated");
        Ok(base)
    }

    /// Allocate `byte_size` bytes (rounded up to frames) of contiguous
    /// physical memory.
    ///
    /// # Errors
    /// - [`FrameAllocError::InvalidArgument`] for a zero size.
    /// - [`FrameAllocError::Exhausted`] if no record is large enough; the
    ///   stack is left unchanged.
    pub fn allocate_frames(&mut self, byte_size: u32) -> Result<PhysicalAddress, FrameAllocError> {
        if byte_size == 0 {
            return Err(FrameAllocError::InvalidArgument);
        }
        let pages = pages_for(byte_size);
        let index = (0..self.len)
            .rev()
            .find(|&i| self.slots[i].pages >= pages)
            .ok_or(FrameAllocError::Exhausted)?;

        let region = self.remove(index);
        if region.pages > pages {
            self.push(FreeRegion::new(
                region.base + pages * PAGE_SIZE,
                region.pages - pages,
            ))?;
        }
        log::trace!("{pages} frames allocated at {}", region.base);
        Ok(region.base)
    }

    /// Return one frame.
    ///
    /// # Errors
    /// See [`free_frames`](Self::free_frames).
    pub fn free_frame(&mut self, addr: PhysicalAddress) -> Result<(), FrameAllocError> {
        self.free_frames(addr, PAGE_SIZE)
    }

    /// Return `byte_size` bytes (rounded up to frames) starting at `addr`.
    ///
    /// # Errors
    /// - [`FrameAllocError::InvalidArgument`] for a zero size, a misaligned
    ///   address or a range past 4 GiB.
    /// - [`FrameAllocError::Conflict`] if any of the frames is already free.
    /// - [`FrameAllocError::CapacityOverflow`] if a new record is needed but
    ///   the stack is full.
    pub fn free_frames(&mut self, addr: PhysicalAddress, byte_size: u32) -> Result<(), FrameAllocError> {
        if byte_size == 0 || !addr.is_aligned::<Size4K>() {
            return Err(FrameAllocError::InvalidArgument);
        }
        let pages = pages_for(byte_size);
        let start = u64::from(addr.as_u32());
        let end = start + u64::from(pages) * u64::from(PAGE_SIZE);
        if end > PHYS_LIMIT {
            return Err(FrameAllocError::InvalidArgument);
        }
        if self.regions().iter().any(|r| r.overlaps(start, end)) {
            log::warn!("double free of {pages} frames at {addr}");
            return Err(FrameAllocError::Conflict);
        }

        let below = self.regions().iter().position(|r| r.end() == start);
        let above = self
            .regions()
            .iter()
            .position(|r| u64::from(r.base.as_u32()) == end);

        match (below, above) {
            (Some(lo), Some(hi)) => {
                self.slots[lo].pages += pages + self.slots[hi].pages;
                self.remove(hi);
            }
            (Some(lo), None) => self.slots[lo].pages += pages,
            (None, Some(hi)) => {
                let region = &mut self.slots[hi];
                region.base = addr;
                region.pages += pages;
            }
            (None, None) => {
                self.push(FreeRegion::new(addr, pages))?;
                if self.len >= self.capacity() / 2 {
                    self.defragment();
                }
            }
        }
        log::trace!("{pages} frames freed at {addr}");
        Ok(())
    }

    fn adjacent_pair(&self) -> Option<(usize, usize)> {
        let regions = self.regions();
        regions.iter().enumerate().find_map(|(lo, low)| {
            regions
                .iter()
                .position(|high| u64::from(high.base.as_u32()) == low.end())
                .map(|hi| (lo, hi))
        })
    }

    /// Merge adjacent records until a full pass finds nothing to merge.
    ///
    /// Returns the number of merges.
    pub fn defragment(&mut self) -> usize {
        let mut merges = 0;
        while let Some((lo, hi)) = self.adjacent_pair() {
            self.slots[lo].pages += self.slots[hi].pages;
            self.remove(hi);
            merges += 1;
        }
        if merges > 0 {
            log::debug!("defragmented free-region stack: {merges} merges, {} records left", self.len);
        }
        merges
    }

    /// Order records by base so the highest region is on top.
    pub fn sort(&mut self) {
        let len = self.len;
        self.slots[..len].sort_unstable_by_key(|r| r.base);
    }

    /// Dump all records at debug level.
    pub fn log_regions(&self) {
        log::debug!(
            "{} free regions, {} free frames, capacity {}",
            self.len,
            self.free_pages(),
            self.capacity()
        );
        for (i, r) in self.regions().iter().enumerate().rev() {
            log::debug!("  [{i:>4}] {} .. 0x{:08X} ({} frames)", r.base, r.end(), r.pages);
        }
    }
}

impl FrameAlloc for StackFrameAlloc<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate_frame().ok().map(|pa| pa.page())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pa(v: u32) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn single_frames_come_from_the_top() {
        let mut slots = [FreeRegion::default(); 16];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        pfa.free_frames(pa(0x10_0000), 256 * PAGE_SIZE).unwrap();

        assert_eq!(pfa.allocate_frame(), Ok(pa(0x10_0000)));
        assert_eq!(pfa.allocate_frame(), Ok(pa(0x10_1000)));
        assert_eq!(pfa.regions(), &[FreeRegion::new(pa(0x10_2000), 254)]);
    }

    #[test]
    fn exhausted_when_empty() {
        let mut slots = [FreeRegion::default(); 4];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        assert_eq!(pfa.allocate_frame(), Err(FrameAllocError::Exhausted));
        assert_eq!(pfa.allocate_frames(1), Err(FrameAllocError::Exhausted));
        assert_eq!(pfa.allocate_frames(0), Err(FrameAllocError::InvalidArgument));
    }

    #[test]
    fn multi_frame_first_fit_from_top() {
        let mut slots = [FreeRegion::default(); 16];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        pfa.free_frames(pa(0x1000), 8 * PAGE_SIZE).unwrap();
        pfa.free_frames(pa(0x10_0000), 2 * PAGE_SIZE).unwrap();
        pfa.free_frames(pa(0x20_0000), 4 * PAGE_SIZE).unwrap();

        // Top is {0x200000, 4}; it fits exactly.
        assert_eq!(pfa.allocate_frames(4 * PAGE_SIZE), Ok(pa(0x20_0000)));
        // {0x100000, 2} is too small, the bottom record is split.
        assert_eq!(pfa.allocate_frames(3 * PAGE_SIZE + 1), Ok(pa(0x1000)));
        assert_eq!(
            pfa.regions(),
            &[FreeRegion::new(pa(0x10_0000), 2), FreeRegion::new(pa(0x5000), 4)]
        );
        assert_eq!(pfa.allocate_frames(5 * PAGE_SIZE), Err(FrameAllocError::Exhausted));
        assert_eq!(pfa.free_pages(), 6);
    }

    #[test]
    fn frees_coalesce_on_both_sides() {
        let mut slots = [FreeRegion::default(); 16];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        pfa.free_frame(pa(0x10_0000)).unwrap();
        pfa.free_frame(pa(0x10_1000)).unwrap();
        assert_eq!(pfa.regions(), &[FreeRegion::new(pa(0x10_0000), 2)]);

        pfa.free_frame(pa(0x10_3000)).unwrap();
        assert_eq!(pfa.len(), 2);
        pfa.free_frame(pa(0x10_2000)).unwrap();
        assert_eq!(pfa.regions(), &[FreeRegion::new(pa(0x10_0000), 4)]);

        pfa.free_frame(pa(0x0F_F000)).unwrap();
        assert_eq!(pfa.regions(), &[FreeRegion::new(pa(0x0F_F000), 5)]);
    }

    #[test]
    fn bad_frees_are_rejected() {
        let mut slots = [FreeRegion::default(); 8];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        pfa.free_frames(pa(0x4000), 4 * PAGE_SIZE).unwrap();

        assert_eq!(pfa.free_frame(pa(0x4001)), Err(FrameAllocError::InvalidArgument));
        assert_eq!(pfa.free_frames(pa(0x9000), 0), Err(FrameAllocError::InvalidArgument));
        assert_eq!(pfa.free_frame(pa(0x6000)), Err(FrameAllocError::Conflict));
        assert_eq!(pfa.free_frames(pa(0x2000), 3 * PAGE_SIZE), Err(FrameAllocError::Conflict));
        assert_eq!(
            pfa.free_frames(pa(0xFFFF_F000), 2 * PAGE_SIZE),
            Err(FrameAllocError::InvalidArgument)
        );
        assert_eq!(pfa.regions(), &[FreeRegion::new(pa(0x4000), 4)]);
    }

    #[test]
    fn last_frame_below_4gib() {
        let mut slots = [FreeRegion::default(); 4];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        pfa.free_frame(pa(0xFFFF_F000)).unwrap();
        assert_eq!(pfa.regions()[0].end(), PHYS_LIMIT);
        assert_eq!(pfa.allocate_frame(), Ok(pa(0xFFFF_F000)));
    }

    #[test]
    fn capacity_overflow_is_reported() {
        let mut slots = [FreeRegion::default(); 1];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        pfa.free_frame(pa(0x1000)).unwrap();
        let err = pfa.free_frame(pa(0x8000)).unwrap_err();
        assert_eq!(err, FrameAllocError::CapacityOverflow);
        assert!(err.is_fatal());
        assert_eq!(pfa.regions(), &[FreeRegion::new(pa(0x1000), 1)]);
    }

    #[test]
    fn defragment_merges_shuffled_runs() {
        let mut slots = [FreeRegion::default(); 16];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        // Frees merge with both neighbours, so adjacent records only come
        // from seeding by hand.
        for base in [0x3000, 0x1000, 0x4000, 0x2000] {
            pfa.push(FreeRegion::new(pa(base), 1)).unwrap();
        }
        assert_eq!(pfa.defragment(), 3);
        assert_eq!(pfa.regions(), &[FreeRegion::new(pa(0x1000), 4)]);
        assert_eq!(pfa.defragment(), 0);
    }

    #[test]
    fn half_full_stack_defragments_on_free() {
        let mut slots = [FreeRegion::default(); 8];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        for base in [0x1000, 0x2000, 0x3000] {
            pfa.push(FreeRegion::new(pa(base), 1)).unwrap();
        }
        // Fourth record reaches capacity / 2.
        pfa.free_frame(pa(0x8000)).unwrap();
        assert_eq!(
            pfa.regions(),
            &[FreeRegion::new(pa(0x1000), 3), FreeRegion::new(pa(0x8000), 1)]
        );
        assert_eq!(pfa.free_pages(), 4);
    }

    #[test]
    fn below_half_full_records_stay_as_they_are() {
        let mut slots = [FreeRegion::default(); 16];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        for base in [0x1000, 0x2000, 0x3000] {
            pfa.push(FreeRegion::new(pa(base), 1)).unwrap();
        }
        pfa.free_frame(pa(0x8000)).unwrap();
        assert_eq!(pfa.len(), 4);
    }

    #[test]
    fn sort_puts_highest_base_on_top() {
        let mut slots = [FreeRegion::default(); 16];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        for base in [0x30_0000, 0x1000, 0x20_0000] {
            pfa.free_frame(pa(base)).unwrap();
        }
        pfa.sort();
        assert_eq!(pfa.allocate_frame(), Ok(pa(0x30_0000)));
        assert_eq!(pfa.allocate_frame(), Ok(pa(0x20_0000)));
    }

    #[test]
    fn allocate_frame_where_skips_rejected_records() {
        let mut slots = [FreeRegion::default(); 16];
        let mut pfa = StackFrameAlloc::new(&mut slots);
        pfa.free_frames(pa(0x1000), 2 * PAGE_SIZE).unwrap();
        pfa.free_frame(pa(0x80_0000)).unwrap();

        let low = |a: PhysicalAddress| a.as_u32() < 0x40_0000;
        assert_eq!(pfa.allocate_frame_where(low), Ok(pa(0x1000)));
        assert_eq!(pfa.allocate_frame_where(low), Ok(pa(0x2000)));
        assert_eq!(pfa.allocate_frame_where(low), Err(FrameAllocError::Exhausted));
        assert_eq!(pfa.regions(), &[FreeRegion::new(pa(0x80_0000), 1)]);
    }

    #[test]
    fn helpers() {
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
        assert_eq!(round_page_aligned(0x1001), Some(0x2000));
        assert_eq!(round_page_aligned(u32::MAX), None);
        assert_eq!(size_of::<FreeRegion>(), 8);
    }
}
