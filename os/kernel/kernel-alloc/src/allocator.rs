//! # `GlobalAlloc` over the kernel heap
//!
//! [`KernelAllocator`] forwards `alloc`/`dealloc` to a [`KernelMemory`]
//! installed once at boot. Before installation, and for any error, it
//! returns null; `GlobalAlloc` has no other way to report failure.
//!
//! Register it from the kernel binary:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOCATOR: KernelAllocator<Direct<'static, HigherHalfMapper>> = KernelAllocator::new();
//!
//! // once paging is active:
//! ALLOCATOR.install(memory).ok();
//! ```

use crate::context::KernelMemory;
use crate::heap::HeapError;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_info::memory::HEAP_ALIGN;
use kernel_sync::SyncOnceCell;
use kernel_vmem::{PagingAccess, Recursive};

/// Heap-backed global allocator.
pub struct KernelAllocator<P: PagingAccess + 'static, Q: PagingAccess + 'static = Recursive> {
    memory: SyncOnceCell<&'static KernelMemory<'static, P, Q>>,
}

impl<P: PagingAccess + 'static, Q: PagingAccess + 'static> KernelAllocator<P, Q> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            memory: SyncOnceCell::new(),
        }
    }

    /// Route allocations to `memory` from now on.
    ///
    /// # Errors
    /// Gives `memory` back if one is installed already.
    pub fn install(
        &self,
        memory: &'static KernelMemory<'static, P, Q>,
    ) -> Result<(), &'static KernelMemory<'static, P, Q>> {
        self.memory.set(memory)
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.memory.is_set()
    }

    fn with_memory(
        &self,
        layout: Layout,
        f: impl FnOnce(&KernelMemory<'static, P, Q>, u32) -> Result<NonNull<u8>, HeapError>,
    ) -> *mut u8 {
        if layout.align() > HEAP_ALIGN as usize {
            return ptr::null_mut();
        }
        let (Some(&memory), Ok(size)) = (self.memory.get(), u32::try_from(layout.size())) else {
            return ptr::null_mut();
        };
        f(memory, size).map_or_else(
            |e| {
                log::debug!("heap allocation of {size} bytes failed: {e}");
                ptr::null_mut()
            },
            NonNull::as_ptr,
        )
    }
}

impl<P: PagingAccess + 'static, Q: PagingAccess + 'static> Default for KernelAllocator<P, Q> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<P, Q> GlobalAlloc for KernelAllocator<P, Q>
where
    P: PagingAccess + 'static,
    Q: PagingAccess + 'static,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_memory(layout, |memory, size| memory.allocate(size))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.with_memory(layout, |memory, size| memory.allocate_zeroed(1, size))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let (Some(&memory), Some(ptr)) = (self.memory.get(), NonNull::new(ptr)) else {
            return;
        };
        if let Err(e) = memory.free(ptr) {
            log::error!("bad heap free at {ptr:p}: {e}");
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        self.with_memory(new_layout, |memory, size| memory.reallocate(old, size))
    }
}
