//! Kernel virtual memory manager (VMM).
//!
//! Owns the kernel's page directory and walks it through one of two access
//! views:
//!
//! - the *boot* view `P` while the directory is being built (it is not loaded
//!   yet, so only a physical mapper can reach it), and
//! - the *active* view `Q` once it is in CR3, normally the recursive window.
//!
//! Frames for page tables and backing pages come from the caller's
//! [`StackFrameAlloc`], so the frame allocator keeps its own lock.
//!
//! # Example
//! ```ignore
//! let mut vmm = Vmm::new(Direct::new(&HigherHalfMapper::BOOT), Recursive);
//! vmm.bootstrap(&mut pfa, 1)?;
//! vmm.install_self_map()?;
//! unsafe { vmm.activate_cpu()? };
//! let va = vmm.alloc_page(&mut pfa, VirtualAddress::new(0xD000_0000), PageFlags::WRITABLE, false)?;
//! ```

use crate::frame_alloc::{FrameAllocError, StackFrameAlloc};
use core::ptr::NonNull;
use kernel_info::memory::{KERNEL_VIRTUAL_BASE, LARGE_PAGE_SIZE, LOW_MEMORY_END, PAGE_SIZE, PT_BASE_VADDR};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_sync::IrqGuard;
use kernel_vmem::{AddressSpace, PageFlags, PagingAccess, PagingError, PagingState, Recursive, RootPage};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("address is not page aligned")]
    Misaligned,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("virtual address already mapped")]
    AlreadyMapped,
    #[error("virtual address not mapped")]
    NotMapped,
    #[error("no free virtual range large enough")]
    NoVirtualSpace,
    #[error("operation not valid in the current paging state")]
    InvalidState,
    #[error("frame not reachable through the boot mapping")]
    Unreachable,
    #[error(transparent)]
    Frame(#[from] FrameAllocError),
}

impl From<PagingError> for VmmError {
    fn from(value: PagingError) -> Self {
        match value {
            PagingError::Misaligned => Self::Misaligned,
            PagingError::AlreadyMapped => Self::AlreadyMapped,
            PagingError::NotMapped => Self::NotMapped,
            PagingError::LargePage | PagingError::RecursiveWindow => Self::InvalidArgument,
            PagingError::OutOfFrames => Self::OutOfMemory,
            PagingError::InvalidTransition { .. } => Self::InvalidState,
        }
    }
}

/// Frame allocation with exhaustion reported as [`VmmError::OutOfMemory`].
fn take_frame(frames: &mut StackFrameAlloc<'_>) -> Result<PhysicalAddress, VmmError> {
    frames.allocate_frame().map_err(|e| match e {
        FrameAllocError::Exhausted => VmmError::OutOfMemory,
        other => VmmError::Frame(other),
    })
}

/// Minimal kernel virtual memory manager.
pub struct Vmm<P: PagingAccess, Q: PagingAccess = Recursive> {
    boot: P,
    active: Q,
    root: Option<RootPage>,
    state: PagingState,
}

impl<P: PagingAccess, Q: PagingAccess> Vmm<P, Q> {
    #[must_use]
    pub const fn new(boot: P, active: Q) -> Self {
        Self {
            boot,
            active,
            root: None,
            state: PagingState::Uninitialized,
        }
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> PagingState {
        self.state
    }

    /// Physical frame of the kernel page directory, once bootstrapped.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> Option<RootPage> {
        self.root
    }

    fn advance(&mut self, to: PagingState) -> Result<(), VmmError> {
        self.state = self.state.advance(to)?;
        log::info!("paging {to:?}");
        Ok(())
    }

    /// The directory through the view that fits the current state.
    fn space(&self) -> Result<AddressSpace<'_, dyn PagingAccess + '_>, VmmError> {
        let root = self.root.ok_or(VmmError::InvalidState)?;
        let access: &dyn PagingAccess = if self.state.is_active() {
            &self.active
        } else {
            &self.boot
        };
        // SAFETY: the directory is only touched through `&mut self` methods.
        Ok(unsafe { AddressSpace::from_root(access, root) })
    }

    /// Page-level operations work on the loaded directory only.
    fn active_space(&self) -> Result<AddressSpace<'_, dyn PagingAccess + '_>, VmmError> {
        if !self.state.is_active() {
            return Err(VmmError::InvalidState);
        }
        self.space()
    }

    /// Build the kernel directory: one zeroed frame reachable through the
    /// boot view, with `large_pages` 4 MiB pages mapping physical memory from
    /// 0 at [`KERNEL_VIRTUAL_BASE`].
    ///
    /// # Errors
    /// - [`VmmError::InvalidState`] unless uninitialized.
    /// - [`VmmError::InvalidArgument`] for zero large pages or more than fit
    ///   below the recursive window.
    /// - [`VmmError::Unreachable`] if no free frame is reachable.
    pub fn bootstrap(
        &mut self,
        frames: &mut StackFrameAlloc<'_>,
        large_pages: u32,
    ) -> Result<RootPage, VmmError> {
        if self.state != PagingState::Uninitialized {
            return Err(VmmError::InvalidState);
        }
        if large_pages == 0 || large_pages > (PT_BASE_VADDR - KERNEL_VIRTUAL_BASE) / LARGE_PAGE_SIZE {
            return Err(VmmError::InvalidArgument);
        }

        let boot = &self.boot;
        let root = frames
            .allocate_frame_where(|pa| boot.reaches(pa.page()))
            .map_err(|e| match e {
                FrameAllocError::Exhausted => VmmError::Unreachable,
                other => VmmError::Frame(other),
            })?
            .page();
        self.root = Some(root);

        let space = self.space()?;
        space.clear();
        for i in 0..large_pages {
            let va = VirtualAddress::new(KERNEL_VIRTUAL_BASE + i * LARGE_PAGE_SIZE);
            let pa = PhysicalAddress::new(i * LARGE_PAGE_SIZE);
            space.map_4m(va, pa, PageFlags::WRITABLE)?;
        }
        log::info!(
            "kernel page directory at {:?}, {} MiB mapped at {:#010x}",
            root,
            large_pages * 4,
            KERNEL_VIRTUAL_BASE
        );
        self.advance(PagingState::Bootstrapped)?;
        Ok(root)
    }

    /// Point the last directory slot at the directory.
    ///
    /// # Errors
    /// [`VmmError::InvalidState`] unless bootstrapped.
    pub fn install_self_map(&mut self) -> Result<(), VmmError> {
        if self.state != PagingState::Bootstrapped {
            return Err(VmmError::InvalidState);
        }
        self.space()?.install_recursive()?;
        self.advance(PagingState::SelfMapped)
    }

    /// Make the directory current: `switch` is called with interrupts masked
    /// and must load it into CR3. Afterwards the active view is used.
    ///
    /// # Errors
    /// [`VmmError::InvalidState`] unless self-mapped.
    pub fn activate(&mut self, switch: impl FnOnce(RootPage)) -> Result<(), VmmError> {
        if self.state != PagingState::SelfMapped {
            return Err(VmmError::InvalidState);
        }
        let root = self.root.ok_or(VmmError::InvalidState)?;
        {
            let _irq = IrqGuard::new();
            switch(root);
        }
        self.advance(PagingState::Active)
    }

    /// [`activate`](Self::activate) with `CR4.PSE` set and `CR3` loaded.
    ///
    /// # Safety
    /// Ring 0 only; the directory must map the running kernel.
    ///
    /// # Errors
    /// See [`activate`](Self::activate).
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    pub unsafe fn activate_cpu(&mut self) -> Result<(), VmmError> {
        self.activate(|root| unsafe { kernel_vmem::load_root(root) })
    }

    /// Map the frame `phys` at `virt`.
    ///
    /// # Errors
    /// - [`VmmError::InvalidState`] before activation.
    /// - [`VmmError::Misaligned`] for unaligned addresses.
    /// - [`VmmError::AlreadyMapped`] if `virt` is taken; nothing changes.
    /// - [`VmmError::OutOfMemory`] if a page table was needed and no frame is
    ///   free.
    pub fn map_page(
        &mut self,
        frames: &mut StackFrameAlloc<'_>,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        Ok(self.active_space()?.map_4k(frames, virt, phys, flags)?)
    }

    /// Unmap `virt` and return the frame that was mapped there. A page table
    /// left empty goes back to `frames`.
    ///
    /// # Errors
    /// - [`VmmError::Misaligned`] for an unaligned address.
    /// - [`VmmError::NotMapped`] if nothing is mapped at `virt`.
    /// - [`VmmError::InvalidArgument`] inside the recursive window.
    /// - [`VmmError::Frame`] with `CapacityOverflow` if `frames` has no spare
    ///   record for a released table; the mapping is left in place.
    pub fn unmap_page(
        &mut self,
        frames: &mut StackFrameAlloc<'_>,
        virt: VirtualAddress,
    ) -> Result<PhysicalAddress, VmmError> {
        ensure_spare(frames, 1)?;
        let unmapped = self.active_space()?.unmap_4k(virt)?;
        if let Some(table) = unmapped.released_table {
            frames.free_frame(table.base())?;
        }
        Ok(unmapped.frame.base())
    }

    /// Unmap `virt` and return its backing frame to `frames`.
    ///
    /// # Errors
    /// See [`unmap_page`](Self::unmap_page); two spare records are needed
    /// here.
    pub fn free_page(&mut self, frames: &mut StackFrameAlloc<'_>, virt: VirtualAddress) -> Result<(), VmmError> {
        ensure_spare(frames, 2)?;
        let frame = self.unmap_page(frames, virt)?;
        frames.free_frame(frame)?;
        Ok(())
    }

    /// Back one page with a fresh frame. See [`alloc_pages`](Self::alloc_pages).
    ///
    /// # Errors
    /// See [`alloc_pages`](Self::alloc_pages).
    pub fn alloc_page(
        &mut self,
        frames: &mut StackFrameAlloc<'_>,
        preferred: VirtualAddress,
        flags: PageFlags,
        mandatory: bool,
    ) -> Result<VirtualAddress, VmmError> {
        self.alloc_pages(frames, preferred, flags, 1, mandatory)
    }

    /// Back `count` contiguous pages with fresh frames, at `preferred` or,
    /// unless `mandatory`, at the first free run above low memory.
    ///
    /// All or nothing: on failure the frames and page tables taken by this
    /// call are returned.
    ///
    /// # Errors
    /// - [`VmmError::InvalidArgument`] for a zero count.
    /// - [`VmmError::Misaligned`] for an unaligned `preferred`.
    /// - [`VmmError::AlreadyMapped`] if `mandatory` and the range is taken.
    /// - [`VmmError::NoVirtualSpace`] if no free run is large enough.
    /// - [`VmmError::OutOfMemory`] if frames run out.
    pub fn alloc_pages(
        &mut self,
        frames: &mut StackFrameAlloc<'_>,
        preferred: VirtualAddress,
        flags: PageFlags,
        count: u32,
        mandatory: bool,
    ) -> Result<VirtualAddress, VmmError> {
        if count == 0 {
            return Err(VmmError::InvalidArgument);
        }
        if !preferred.is_aligned::<Size4K>() {
            return Err(VmmError::Misaligned);
        }
        self.active_space()?;

        let fits = run_end(preferred, count).is_some_and(|end| end <= u64::from(PT_BASE_VADDR));
        let first = if fits {
            self.map_run(frames, preferred, count, flags)
        } else {
            Err(VmmError::AlreadyMapped)
        };
        match first {
            Err(VmmError::AlreadyMapped) if !mandatory => {
                let start = self.find_free_run(count)?;
                log::trace!("{preferred} taken, using {start} for {count} pages");
                self.map_run(frames, start, count, flags)?;
                Ok(start)
            }
            Err(e) => Err(e),
            Ok(()) => Ok(preferred),
        }
    }

    fn map_run(
        &mut self,
        frames: &mut StackFrameAlloc<'_>,
        start: VirtualAddress,
        count: u32,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        for i in 0..count {
            if let Err(e) = self.map_fresh(frames, start + i * PAGE_SIZE, flags) {
                self.unwind_run(frames, start, i);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Map one fresh frame at `va`; the frame goes back if mapping fails.
    fn map_fresh(
        &mut self,
        frames: &mut StackFrameAlloc<'_>,
        va: VirtualAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        let frame = take_frame(frames)?;
        if let Err(e) = self.map_page(frames, frame, va, flags) {
            if frames.free_frame(frame).is_err() {
                log::error!("lost frame {frame} while undoing a failed mapping");
            }
            return Err(e);
        }
        Ok(())
    }

    fn unwind_run(&mut self, frames: &mut StackFrameAlloc<'_>, start: VirtualAddress, mapped: u32) {
        for i in (0..mapped).rev() {
            if let Err(e) = self.free_page(frames, start + i * PAGE_SIZE) {
                log::error!("failed to undo mapping at {}: {e}", start + i * PAGE_SIZE);
            }
        }
    }

    /// First run of `count` unmapped pages from [`LOW_MEMORY_END`] up to the
    /// recursive window.
    fn find_free_run(&self, count: u32) -> Result<VirtualAddress, VmmError> {
        let space = self.active_space()?;
        let mut run_start = LOW_MEMORY_END;
        let mut run = 0;
        let mut va = LOW_MEMORY_END;
        while va < PT_BASE_VADDR {
            if space.is_mapped(VirtualAddress::new(va)) {
                run = 0;
                run_start = va + PAGE_SIZE;
            } else {
                run += 1;
                if run == count {
                    return Ok(VirtualAddress::new(run_start));
                }
            }
            va += PAGE_SIZE;
        }
        Err(VmmError::NoVirtualSpace)
    }

    /// Translate `virt` if mapped.
    #[must_use]
    pub fn query(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.space().ok()?.query(virt)
    }

    /// Where the kernel reads and writes the byte mapped at `virt`, valid
    /// until the mapping changes.
    ///
    /// # Errors
    /// - [`VmmError::InvalidState`] before activation.
    /// - [`VmmError::NotMapped`] if nothing is mapped at `virt`.
    pub fn reach(&self, virt: VirtualAddress) -> Result<NonNull<u8>, VmmError> {
        let phys = self.active_space()?.query(virt).ok_or(VmmError::NotMapped)?;
        // SAFETY: `virt` maps to `phys` in the loaded directory.
        NonNull::new(unsafe { self.active.data(virt, phys) }).ok_or(VmmError::NotMapped)
    }
}

/// Unmapping cannot be undone once the entry is cleared, so room for the
/// frames it gives back is checked up front.
fn ensure_spare(frames: &StackFrameAlloc<'_>, records: usize) -> Result<(), VmmError> {
    if frames.spare() < records {
        log::warn!("free-region stack full, refusing to unmap");
        return Err(FrameAllocError::CapacityOverflow.into());
    }
    Ok(())
}

/// Exclusive end of `count` pages from `start`, as `u64`.
fn run_end(start: VirtualAddress, count: u32) -> Option<u64> {
    u64::from(start.as_u32()).checked_add(u64::from(count) * u64::from(PAGE_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_alloc::FreeRegion;
    use crate::tests::TestPhys;
    use kernel_info::memory::PD_VADDR;
    use kernel_vmem::{Direct, PhysMapper};

    type TestVmm<'m> = Vmm<Direct<'m, TestPhys>, Direct<'m, TestPhys>>;

    fn active_vmm<'m>(phys: &'m TestPhys, frames: &mut StackFrameAlloc<'_>) -> TestVmm<'m> {
        let mut vmm = Vmm::new(Direct::new(phys), Direct::new(phys));
        vmm.bootstrap(frames, 1).unwrap();
        vmm.install_self_map().unwrap();
        vmm.activate(|_| {}).unwrap();
        vmm
    }

    #[test]
    fn bring_up_in_order() {
        let phys = TestPhys::with_frames(64);
        let mut slots = [FreeRegion::default(); 16];
        let mut frames = StackFrameAlloc::new(&mut slots);
        frames.free_frames(PhysicalAddress::new(0x1000), 63 * PAGE_SIZE).unwrap();

        let mut vmm: TestVmm<'_> = Vmm::new(Direct::new(&phys), Direct::new(&phys));
        assert_eq!(vmm.install_self_map(), Err(VmmError::InvalidState));
        assert_eq!(vmm.activate(|_| {}), Err(VmmError::InvalidState));

        let root = vmm.bootstrap(&mut frames, 1).unwrap();
        assert_eq!(vmm.state(), PagingState::Bootstrapped);
        assert_eq!(vmm.bootstrap(&mut frames, 1), Err(VmmError::InvalidState));
        assert_eq!(
            vmm.query(VirtualAddress::new(0xC012_3456)),
            Some(PhysicalAddress::new(0x12_3456))
        );
        assert_eq!(
            vmm.map_page(&mut frames, PhysicalAddress::new(0x2000), VirtualAddress::new(0x40_0000), PageFlags::WRITABLE),
            Err(VmmError::InvalidState)
        );

        vmm.install_self_map().unwrap();
        assert_eq!(vmm.query(VirtualAddress::new(PD_VADDR)), Some(root.base()));

        let mut switched = None;
        vmm.activate(|r| switched = Some(r)).unwrap();
        assert_eq!(switched, Some(root));
        assert_eq!(vmm.state(), PagingState::Active);
    }

    #[test]
    fn bootstrap_needs_a_reachable_frame() {
        let phys = TestPhys::with_frames(4);
        let mut slots = [FreeRegion::default(); 4];
        let mut frames = StackFrameAlloc::new(&mut slots);
        frames.free_frame(PhysicalAddress::new(0x10_0000)).unwrap();

        let mut vmm: TestVmm<'_> = Vmm::new(Direct::new(&phys), Direct::new(&phys));
        assert_eq!(vmm.bootstrap(&mut frames, 1), Err(VmmError::Unreachable));
        assert_eq!(frames.free_pages(), 1);
        assert_eq!(vmm.state(), PagingState::Uninitialized);
    }

    #[test]
    fn map_then_unmap_releases_table() {
        let phys = TestPhys::with_frames(64);
        let mut slots = [FreeRegion::default(); 16];
        let mut frames = StackFrameAlloc::new(&mut slots);
        frames.free_frames(PhysicalAddress::new(0x1000), 63 * PAGE_SIZE).unwrap();
        let mut vmm = active_vmm(&phys, &mut frames);
        let before = frames.free_pages();

        let va = VirtualAddress::new(0x40_0000);
        let pa = PhysicalAddress::new(0x20_0000);
        vmm.map_page(&mut frames, pa, va, PageFlags::WRITABLE).unwrap();
        assert_eq!(frames.free_pages(), before - 1);
        assert_eq!(vmm.query(va), Some(pa));

        assert_eq!(
            vmm.map_page(&mut frames, PhysicalAddress::new(0x30_0000), va, PageFlags::WRITABLE),
            Err(VmmError::AlreadyMapped)
        );
        assert_eq!(vmm.query(va), Some(pa));
        assert_eq!(frames.free_pages(), before - 1);

        assert_eq!(vmm.unmap_page(&mut frames, va), Ok(pa));
        assert_eq!(vmm.query(va), None);
        assert_eq!(frames.free_pages(), before);
        assert_eq!(vmm.unmap_page(&mut frames, va), Err(VmmError::NotMapped));
        assert_eq!(vmm.unmap_page(&mut frames, va + 1), Err(VmmError::Misaligned));
    }

    #[test]
    fn large_page_region_is_taken() {
        let phys = TestPhys::with_frames(64);
        let mut slots = [FreeRegion::default(); 16];
        let mut frames = StackFrameAlloc::new(&mut slots);
        frames.free_frames(PhysicalAddress::new(0x1000), 63 * PAGE_SIZE).unwrap();
        let mut vmm = active_vmm(&phys, &mut frames);

        let kernel = VirtualAddress::new(KERNEL_VIRTUAL_BASE + 0x1000);
        assert_eq!(
            vmm.map_page(&mut frames, PhysicalAddress::new(0x5000), kernel, PageFlags::WRITABLE),
            Err(VmmError::AlreadyMapped)
        );
        assert_eq!(vmm.unmap_page(&mut frames, kernel), Err(VmmError::InvalidArgument));
    }

    #[test]
    fn alloc_pages_searches_unless_mandatory() {
        let phys = TestPhys::with_frames(64);
        let mut slots = [FreeRegion::default(); 16];
        let mut frames = StackFrameAlloc::new(&mut slots);
        frames.free_frames(PhysicalAddress::new(0x1000), 63 * PAGE_SIZE).unwrap();
        let mut vmm = active_vmm(&phys, &mut frames);

        let taken = VirtualAddress::new(0x0010_2000);
        vmm.alloc_page(&mut frames, taken, PageFlags::WRITABLE, true).unwrap();
        assert_eq!(
            vmm.alloc_pages(&mut frames, taken, PageFlags::WRITABLE, 2, true),
            Err(VmmError::AlreadyMapped)
        );

        // First free run of three pages above 1 MiB skips the taken page.
        let got = vmm
            .alloc_pages(&mut frames, taken, PageFlags::WRITABLE, 3, false)
            .unwrap();
        assert_eq!(got, VirtualAddress::new(0x0010_3000));
        let got = vmm
            .alloc_pages(&mut frames, taken, PageFlags::WRITABLE, 2, false)
            .unwrap();
        assert_eq!(got, VirtualAddress::new(0x0010_0000));

        assert_eq!(
            vmm.alloc_pages(&mut frames, taken, PageFlags::WRITABLE, 0, false),
            Err(VmmError::InvalidArgument)
        );
        assert_eq!(
            vmm.alloc_pages(&mut frames, taken + 4, PageFlags::WRITABLE, 1, false),
            Err(VmmError::Misaligned)
        );
    }

    #[test]
    fn failed_alloc_pages_changes_nothing() {
        let phys = TestPhys::with_frames(16);
        let mut slots = [FreeRegion::default(); 16];
        let mut frames = StackFrameAlloc::new(&mut slots);
        frames.free_frames(PhysicalAddress::new(0x1000), 15 * PAGE_SIZE).unwrap();
        let mut vmm = active_vmm(&phys, &mut frames);
        let before = frames.free_pages();

        let start = VirtualAddress::new(0x0800_0000);
        assert_eq!(
            vmm.alloc_pages(&mut frames, start, PageFlags::WRITABLE, before + 1, true),
            Err(VmmError::OutOfMemory)
        );
        assert_eq!(frames.free_pages(), before);
        assert_eq!(vmm.query(start), None);
        assert!(vmm.space().unwrap().slot_is_empty(start));
    }

    #[test]
    fn free_page_returns_the_frame() {
        let phys = TestPhys::with_frames(32);
        let mut slots = [FreeRegion::default(); 16];
        let mut frames = StackFrameAlloc::new(&mut slots);
        frames.free_frames(PhysicalAddress::new(0x1000), 31 * PAGE_SIZE).unwrap();
        let mut vmm = active_vmm(&phys, &mut frames);
        let before = frames.free_pages();

        let va = vmm
            .alloc_pages(&mut frames, VirtualAddress::new(0xD000_0000), PageFlags::WRITABLE, 3, true)
            .unwrap();
        assert_eq!(frames.free_pages(), before - 4);
        for i in 0..3 {
            vmm.free_page(&mut frames, va + i * PAGE_SIZE).unwrap();
        }
        assert_eq!(frames.free_pages(), before);
    }

    #[test]
    fn full_frame_stack_keeps_the_mapping() {
        let phys = TestPhys::with_frames(32);
        let mut slots = [FreeRegion::default(); 4];
        let mut frames = StackFrameAlloc::new(&mut slots);
        frames.free_frames(PhysicalAddress::new(0x1000), 31 * PAGE_SIZE).unwrap();
        let mut vmm = active_vmm(&phys, &mut frames);
        let va = vmm
            .alloc_page(&mut frames, VirtualAddress::new(0xD000_0000), PageFlags::WRITABLE, true)
            .unwrap();
        let frame = vmm.query(va).unwrap();

        // Frames far from the others, one record each.
        let mut far = 0x0100_0000;
        while frames.spare() > 0 {
            frames.free_frame(PhysicalAddress::new(far)).unwrap();
            far += 0x0010_0000;
        }
        let len = frames.len();

        assert_eq!(
            vmm.free_page(&mut frames, va),
            Err(VmmError::Frame(FrameAllocError::CapacityOverflow))
        );
        assert_eq!(
            vmm.unmap_page(&mut frames, va),
            Err(VmmError::Frame(FrameAllocError::CapacityOverflow))
        );
        assert_eq!(vmm.query(va), Some(frame));
        assert_eq!(frames.len(), len);
    }

    #[test]
    fn reach_goes_through_the_active_view() {
        let phys = TestPhys::with_frames(32);
        let mut slots = [FreeRegion::default(); 16];
        let mut frames = StackFrameAlloc::new(&mut slots);
        frames.free_frames(PhysicalAddress::new(0x1000), 31 * PAGE_SIZE).unwrap();
        let idle: TestVmm<'_> = Vmm::new(Direct::new(&phys), Direct::new(&phys));
        assert_eq!(idle.reach(VirtualAddress::new(0xC000_1000)), Err(VmmError::InvalidState));

        let mut vmm = active_vmm(&phys, &mut frames);
        let va = vmm
            .alloc_page(&mut frames, VirtualAddress::new(0xD000_0000), PageFlags::WRITABLE, true)
            .unwrap();
        let frame = vmm.query(va + 0x10).unwrap();
        unsafe { vmm.reach(va + 0x10).unwrap().write(0x5A) };
        let seen: &mut u8 = unsafe { phys.phys_to_mut(frame) };
        assert_eq!(*seen, 0x5A);
        assert_eq!(vmm.reach(va + PAGE_SIZE), Err(VmmError::NotMapped));
    }

    #[test]
    fn recursive_window_cannot_be_mapped_or_freed() {
        let phys = TestPhys::with_frames(32);
        let mut slots = [FreeRegion::default(); 16];
        let mut frames = StackFrameAlloc::new(&mut slots);
        frames.free_frames(PhysicalAddress::new(0x1000), 31 * PAGE_SIZE).unwrap();
        let mut vmm = active_vmm(&phys, &mut frames);
        let root = vmm.query(VirtualAddress::new(PD_VADDR)).unwrap();
        let spare = frames.allocate_frame().unwrap();
        let before = frames.free_pages();

        assert_eq!(
            vmm.map_page(&mut frames, spare, VirtualAddress::new(PT_BASE_VADDR + 0x1000), PageFlags::WRITABLE),
            Err(VmmError::InvalidArgument)
        );
        assert_eq!(vmm.free_page(&mut frames, VirtualAddress::new(PD_VADDR)), Err(VmmError::InvalidArgument));
        assert_eq!(vmm.unmap_page(&mut frames, VirtualAddress::new(PD_VADDR)), Err(VmmError::InvalidArgument));

        assert!(!frames.is_free(root));
        assert_eq!(frames.free_pages(), before);
        assert_eq!(vmm.query(VirtualAddress::new(PD_VADDR)), Some(root));
    }
}
