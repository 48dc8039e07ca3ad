//! # Kernel memory context
//!
//! [`KernelMemory`] owns the three allocators, each behind its own
//! [`SpinMutex`], and runs the boot sequence that connects them:
//!
//! ```text
//! ram_size ─► seed PFA ─► bootstrap directory ─► self-map ─┐
//!                                                          ▼
//!                                  (caller) activate ─► heap grows on demand
//! ```
//!
//! Locks are always taken in the order heap → paging → frames.

use crate::boot_map::{self, KernelImage, MAX_RESERVATIONS, Reservation};
use crate::frame_alloc::{FrameAllocError, FreeRegion, StackFrameAlloc};
use crate::heap::{BlockHeader, HeapBackend, HeapError, KernelHeap};
use crate::vmm::{Vmm, VmmError};
use core::ptr::NonNull;
use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::{KERNEL_VIRTUAL_BASE, LARGE_PAGE_SIZE, PAGE_SIZE};
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_sync::SpinMutex;
use kernel_vmem::{PageFlags, PagingAccess, PagingState, Recursive, RootPage};

/// The kernel's physical, virtual and heap allocators.
pub struct KernelMemory<'s, P: PagingAccess, Q: PagingAccess = Recursive> {
    heap: SpinMutex<KernelHeap>,
    vmm: SpinMutex<Vmm<P, Q>>,
    frames: SpinMutex<StackFrameAlloc<'s>>,
}

impl<'s, P: PagingAccess, Q: PagingAccess> KernelMemory<'s, P, Q> {
    /// Seed the frame allocator, build the kernel page directory and
    /// self-map it. Loading it is left to [`activate`](Self::activate).
    ///
    /// `slots` is the bookkeeping area for free-region records; `reserved`
    /// names ranges to keep out of the allocator besides the kernel image
    /// and its bookkeeping area (e.g. the loader's page directory).
    ///
    /// # Errors
    /// - [`FrameAllocError::MissingMemoryMap`] (wrapped) without a memory map.
    /// - [`FrameAllocError::InvalidArgument`] (wrapped) for too many
    ///   reservations.
    /// - Whatever seeding or bootstrapping reports.
    pub fn init(
        slots: &'s mut [FreeRegion],
        info: &BootMemoryInfo<'_>,
        image: KernelImage,
        reserved: &[Reservation],
        boot: P,
        active: Q,
    ) -> Result<Self, VmmError> {
        let ram = boot_map::ram_size(info)?;
        let bookkeeping = boot_map::bookkeeping_bytes(ram);
        log::info!("physical memory: {} KiB", ram / 1024);
        if slots.len() < boot_map::frame_capacity(ram) {
            log::debug!(
                "{} free-region slots for up to {} frames",
                slots.len(),
                boot_map::frame_capacity(ram)
            );
        }

        if reserved.len() >= MAX_RESERVATIONS {
            return Err(FrameAllocError::InvalidArgument.into());
        }
        let mut reservations = [Reservation::new(0, 0); MAX_RESERVATIONS];
        reservations[0] = image.reservation(bookkeeping);
        reservations[1..=reserved.len()].copy_from_slice(reserved);

        let mut frames = StackFrameAlloc::new(slots);
        boot_map::seed(&mut frames, info, &reservations[..=reserved.len()])?;

        let large_pages = image.large_pages(bookkeeping);
        let mut vmm = Vmm::new(boot, active);
        vmm.bootstrap(&mut frames, large_pages)?;
        vmm.install_self_map()?;

        let heap_start = VirtualAddress::new(KERNEL_VIRTUAL_BASE + large_pages * LARGE_PAGE_SIZE);
        log::info!("kernel heap starts at {heap_start}");

        Ok(Self {
            heap: SpinMutex::new(KernelHeap::new(heap_start.page::<Size4K>())),
            vmm: SpinMutex::new(vmm),
            frames: SpinMutex::new(frames),
        })
    }

    /// Switch to the kernel directory; `switch` loads it into CR3 with
    /// interrupts masked.
    ///
    /// # Errors
    /// [`VmmError::InvalidState`] if already active.
    pub fn activate(&self, switch: impl FnOnce(RootPage)) -> Result<(), VmmError> {
        self.vmm.lock().activate(switch)
    }

    /// [`activate`](Self::activate) on the CPU.
    ///
    /// # Safety
    /// Ring 0 only, with the kernel running from the mapped image.
    ///
    /// # Errors
    /// As [`activate`](Self::activate).
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    pub unsafe fn activate_cpu(&self) -> Result<(), VmmError> {
        unsafe { self.vmm.lock().activate_cpu() }
    }

    #[must_use]
    pub fn paging_state(&self) -> PagingState {
        self.vmm.lock().state()
    }

    /// Exclusive access to the frame allocator.
    pub fn with_frames<U>(&self, f: impl FnOnce(&mut StackFrameAlloc<'s>) -> U) -> U {
        self.frames.with_lock(f)
    }

    /// Exclusive access to the VMM and the frames it draws from.
    pub fn with_vmm<U>(&self, f: impl FnOnce(&mut Vmm<P, Q>, &mut StackFrameAlloc<'s>) -> U) -> U {
        let mut vmm = self.vmm.lock();
        let mut frames = self.frames.lock();
        f(&mut *vmm, &mut *frames)
    }

    /// Exclusive access to the heap with a backend that maps through the VMM.
    pub fn with_heap<U>(
        &self,
        f: impl FnOnce(&mut KernelHeap, &mut VmmHeapBackend<'_, 's, P, Q>) -> U,
    ) -> U {
        let mut heap = self.heap.lock();
        let mut backend = VmmHeapBackend {
            vmm: &self.vmm,
            frames: &self.frames,
        };
        f(&mut *heap, &mut backend)
    }

    /// See [`KernelHeap::allocate`].
    ///
    /// # Errors
    /// As [`KernelHeap::allocate`].
    pub fn allocate(&self, byte_size: u32) -> Result<NonNull<u8>, HeapError> {
        self.with_heap(|heap, backend| heap.allocate(backend, byte_size))
    }

    /// See [`KernelHeap::allocate_zeroed`].
    ///
    /// # Errors
    /// As [`KernelHeap::allocate_zeroed`].
    pub fn allocate_zeroed(&self, count: u32, size: u32) -> Result<NonNull<u8>, HeapError> {
        self.with_heap(|heap, backend| heap.allocate_zeroed(backend, count, size))
    }

    /// See [`KernelHeap::reallocate`].
    ///
    /// # Errors
    /// As [`KernelHeap::reallocate`].
    pub fn reallocate(&self, ptr: NonNull<u8>, new_size: u32) -> Result<NonNull<u8>, HeapError> {
        self.with_heap(|heap, backend| heap.reallocate(backend, ptr, new_size))
    }

    /// See [`KernelHeap::free`].
    ///
    /// # Errors
    /// As [`KernelHeap::free`].
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.with_heap(|heap, backend| heap.free(backend, ptr))
    }
}

/// Heap backend over the live kernel address space.
///
/// Pages are mapped all-or-nothing with fresh frames. Heap bytes are reached
/// page by page through the VMM's active view, since consecutive pages need
/// not sit in consecutive frames.
pub struct VmmHeapBackend<'c, 's, P: PagingAccess, Q: PagingAccess> {
    vmm: &'c SpinMutex<Vmm<P, Q>>,
    frames: &'c SpinMutex<StackFrameAlloc<'s>>,
}

impl<P: PagingAccess, Q: PagingAccess> VmmHeapBackend<'_, '_, P, Q> {
    /// Pointer to `at` and the bytes left in its page.
    fn reach(&self, at: VirtualAddress) -> Result<(NonNull<u8>, u32), VmmError> {
        let ptr = self.vmm.lock().reach(at)?;
        Ok((ptr, PAGE_SIZE - (at.as_u32() & (PAGE_SIZE - 1))))
    }
}

impl<P: PagingAccess, Q: PagingAccess> HeapBackend for VmmHeapBackend<'_, '_, P, Q> {
    fn map_pages(&mut self, at: VirtualAddress, count: u32) -> Result<(), VmmError> {
        let mut vmm = self.vmm.lock();
        let mut frames = self.frames.lock();
        vmm.alloc_pages(&mut *frames, at, PageFlags::WRITABLE, count, true)
            .map(|_| ())
    }

    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn read_header(&mut self, at: VirtualAddress) -> Result<BlockHeader, VmmError> {
        let (ptr, _) = self.reach(at)?;
        // SAFETY: aligned headers never cross a page; the caller owns the bytes.
        Ok(unsafe { ptr.cast::<BlockHeader>().read() })
    }

    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn write_header(&mut self, at: VirtualAddress, header: BlockHeader) -> Result<(), VmmError> {
        let (ptr, _) = self.reach(at)?;
        // SAFETY: as in `read_header`.
        unsafe { ptr.cast::<BlockHeader>().write(header) };
        Ok(())
    }

    unsafe fn fill(&mut self, at: VirtualAddress, len: u32, byte: u8) -> Result<(), VmmError> {
        let mut at = at;
        let mut left = len;
        while left > 0 {
            let (ptr, room) = self.reach(at)?;
            let n = room.min(left);
            // SAFETY: `n` bytes stay inside the page; the caller owns them.
            unsafe { ptr.write_bytes(byte, n as usize) };
            at = at + n;
            left -= n;
        }
        Ok(())
    }

    unsafe fn copy(&mut self, from: VirtualAddress, to: VirtualAddress, len: u32) -> Result<(), VmmError> {
        let (mut from, mut to) = (from, to);
        let mut left = len;
        while left > 0 {
            let (src, src_room) = self.reach(from)?;
            let (dst, dst_room) = self.reach(to)?;
            let n = src_room.min(dst_room).min(left);
            // SAFETY: both chunks stay inside their pages; the ranges are disjoint.
            unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), n as usize) };
            from = from + n;
            to = to + n;
            left -= n;
        }
        Ok(())
    }
}

/// The free-region slots placed right after the kernel image, seen through
/// the loader's higher-half window.
///
/// # Safety
/// The bookkeeping area for `info` must be mapped writable at
/// `KERNEL_VIRTUAL_BASE + bookkeeping_start`, and not used for anything else.
///
/// # Errors
/// - [`FrameAllocError::MissingMemoryMap`] if memory cannot be sized.
/// - [`FrameAllocError::InvalidArgument`] if the image ends at the top of the
///   address space.
pub unsafe fn bookkeeping_slots(
    image: &KernelImage,
    info: &BootMemoryInfo<'_>,
) -> Result<&'static mut [FreeRegion], FrameAllocError> {
    let ram = boot_map::ram_size(info)?;
    let start = image.bookkeeping_start().ok_or(FrameAllocError::InvalidArgument)?;
    let va = KERNEL_VIRTUAL_BASE
        .checked_add(start.as_u32())
        .ok_or(FrameAllocError::InvalidArgument)?;
    let ptr = core::ptr::with_exposed_provenance_mut::<FreeRegion>(va as usize);
    // SAFETY: caller guarantees the area is mapped and exclusively ours.
    Ok(unsafe { core::slice::from_raw_parts_mut(ptr, boot_map::frame_capacity(ram)) })
}
