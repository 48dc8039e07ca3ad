//! # Higher-half PhysMapper
//!
//! During bring-up the loader maps low physical memory at
//! [`KERNEL_VIRTUAL_BASE`], so a physical address `pa` below the mapped limit
//! is reachable at `KERNEL_VIRTUAL_BASE + pa`. The VMM uses this to build the
//! kernel page directory before it is loaded; afterwards tables are reached
//! through the recursive window instead.
//!
//! ## Example
//! ```rust,no_run
//! use kernel_alloc::phys_mapper::HigherHalfMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::{PageTable, PhysMapper};
//!
//! let mapper = HigherHalfMapper::BOOT;
//! unsafe {
//!     let table: &mut PageTable = mapper.phys_to_mut(PhysicalAddress::new(0x9000));
//!     table.zero();
//! }
//! ```

use kernel_info::memory::{KERNEL_VIRTUAL_BASE, LARGE_PAGE_SIZE};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] over the loader's higher-half window `[0, limit)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HigherHalfMapper {
    limit: u32,
}

impl HigherHalfMapper {
    /// The first 4 MiB, which every loader in use maps.
    pub const BOOT: Self = Self::new(LARGE_PAGE_SIZE);

    /// A window covering physical `[0, limit)`.
    #[must_use]
    pub const fn new(limit: u32) -> Self {
        Self { limit }
    }

    #[inline]
    #[must_use]
    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Virtual address of `pa` inside the window.
    #[inline]
    #[must_use]
    pub const fn virtual_of(&self, pa: PhysicalAddress) -> Option<u32> {
        if pa.as_u32() < self.limit {
            Some(KERNEL_VIRTUAL_BASE + pa.as_u32())
        } else {
            None
        }
    }
}

impl Default for HigherHalfMapper {
    fn default() -> Self {
        Self::BOOT
    }
}

impl PhysMapper for HigherHalfMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(self.covers(pa), "{pa} is outside the boot window");
        let va = KERNEL_VIRTUAL_BASE.wrapping_add(pa.as_u32()) as usize;
        // SAFETY: caller guarantees `pa` is inside the loader's mapping.
        unsafe { &mut *core::ptr::with_exposed_provenance_mut::<T>(va) }
    }

    fn covers(&self, pa: PhysicalAddress) -> bool {
        pa.as_u32() < self.limit
    }
}
