//! # Kernel Heap
//!
//! A first-fit, split-and-coalesce allocator over a contiguous virtual range
//! starting right after the kernel image. The range grows on demand, page by
//! page, through a [`HeapBackend`]; it never shrinks.
//!
//! Every block starts with a [`BlockHeader`] of [`HEAP_BLOCK_HEADER`] bytes
//! stored in heap memory, followed by its payload. Blocks tile the mapped
//! range without gaps, so walking `start + header + size` from the heap
//! start visits every block in address order:
//!
//! ```text
//! heap_start                                                   heap_end
//! ┌────────┬──────────────┬────────┬─────────┬────────┬──────────┐
//! │ header │ free payload │ header │ payload │ header │ payload  │
//! └────────┴──────────────┴────────┴─────────┴────────┴──────────┘
//!   free block (head)       allocated (tail)   allocated (tail)
//! ```
//!
//! Free blocks form a doubly linked, address-ordered list through the
//! `prev`/`next` fields of their headers. Allocations are carved off the
//! *tail* of a free block, so the free block keeps its header and its place
//! in the list.
//!
//! The heap never dereferences heap memory itself; header reads and writes,
//! zero-filling and copying all go through the backend.

use crate::vmm::VmmError;
use core::ptr::{self, NonNull};
use kernel_info::memory::{HEAP_ALIGN, HEAP_BLOCK_HEADER, KHEAP_LENGTH, PAGE_SIZE};
use kernel_memory_addresses::{Size4K, VirtualAddress, VirtualPage, checked_align_up};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("invalid size or pointer arithmetic overflow")]
    InvalidArgument,
    #[error("kernel heap window exhausted")]
    Exhausted,
    #[error("pointer was not returned by this heap")]
    InvalidPointer,
    #[error("block is already free")]
    DoubleFree,
    #[error("heap backend failed: {0}")]
    Backend(#[from] VmmError),
}

/// Tag of a block on the free list.
const TAG_FREE: u32 = 0x4652_4545;
/// Tag of a block handed out to a caller.
const TAG_USED: u32 = 0x5553_4544;

/// The header in front of every block's payload.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BlockHeader {
    /// Free or used tag, zero once the block was merged away.
    tag: u32,
    /// Payload bytes after the header.
    size: u32,
    /// Header address of the previous free block, zero for none.
    prev: u32,
    /// Header address of the next free block, zero for none.
    next: u32,
}

const _: () = assert!(size_of::<BlockHeader>() == HEAP_BLOCK_HEADER as usize);

impl BlockHeader {
    const fn used(size: u32) -> Self {
        Self {
            tag: TAG_USED,
            size,
            prev: 0,
            next: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.tag == TAG_FREE
    }

    #[inline]
    #[must_use]
    pub const fn is_used(&self) -> bool {
        self.tag == TAG_USED
    }

    /// Payload bytes after the header.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }
}

/// Where heap memory comes from.
pub trait HeapBackend {
    /// Back `count` pages starting at `at` with memory.
    ///
    /// # Errors
    /// Whatever the underlying mapping reports; the range must then be left
    /// unmapped.
    fn map_pages(&mut self, at: VirtualAddress, count: u32) -> Result<(), VmmError>;

    /// Read the block header at `at`.
    ///
    /// # Safety
    /// `at` must be [`HEAP_ALIGN`]ed and lie in mapped heap memory.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] if `at` is not backed.
    unsafe fn read_header(&mut self, at: VirtualAddress) -> Result<BlockHeader, VmmError>;

    /// Write the block header at `at`.
    ///
    /// # Safety
    /// As [`read_header`](Self::read_header); the bytes must belong to the
    /// heap.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] if `at` is not backed.
    unsafe fn write_header(&mut self, at: VirtualAddress, header: BlockHeader) -> Result<(), VmmError>;

    /// Set `len` bytes at `at` to `byte`.
    ///
    /// # Safety
    /// `[at, at + len)` must be mapped heap memory owned by the caller.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] if part of the range is not backed.
    unsafe fn fill(&mut self, at: VirtualAddress, len: u32, byte: u8) -> Result<(), VmmError>;

    /// Copy `len` bytes from `from` to `to`; the ranges do not overlap.
    ///
    /// # Safety
    /// Both ranges must be mapped heap memory.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] if part of either range is not backed.
    unsafe fn copy(&mut self, from: VirtualAddress, to: VirtualAddress, len: u32) -> Result<(), VmmError>;
}

fn read<B: HeapBackend + ?Sized>(backend: &mut B, at: u32) -> Result<BlockHeader, HeapError> {
    // SAFETY: the heap only passes header addresses of its own blocks.
    Ok(unsafe { backend.read_header(VirtualAddress::new(at)) }?)
}

fn write<B: HeapBackend + ?Sized>(backend: &mut B, at: u32, header: BlockHeader) -> Result<(), HeapError> {
    // SAFETY: as in `read`.
    Ok(unsafe { backend.write_header(VirtualAddress::new(at), header) }?)
}

fn update<B: HeapBackend + ?Sized>(
    backend: &mut B,
    at: u32,
    f: impl FnOnce(&mut BlockHeader),
) -> Result<(), HeapError> {
    let mut header = read(backend, at)?;
    f(&mut header);
    write(backend, at, header)
}

#[inline]
const fn link(raw: u32) -> Option<u32> {
    if raw == 0 { None } else { Some(raw) }
}

#[inline]
const fn raw(link: Option<u32>) -> u32 {
    match link {
        Some(at) => at,
        None => 0,
    }
}

/// Smallest remainder worth keeping as its own free block.
const MIN_SPLIT: u32 = HEAP_BLOCK_HEADER + HEAP_ALIGN;

/// The kernel heap.
///
/// Only the list head and the bounds live here; everything else is in the
/// headers inside heap memory.
pub struct KernelHeap {
    /// Header address of the lowest free block.
    head: Option<u32>,
    start: u32,
    end: u32,
    free_bytes: u32,
    free_blocks: usize,
}

impl KernelHeap {
    /// An empty heap whose first page will be mapped at `start`.
    #[must_use]
    pub const fn new(start: VirtualPage<Size4K>) -> Self {
        let start = start.base().as_u32();
        Self {
            head: None,
            start,
            end: start,
            free_bytes: 0,
            free_blocks: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn heap_start(&self) -> VirtualAddress {
        VirtualAddress::new(self.start)
    }

    /// First address past the mapped part of the heap.
    #[inline]
    #[must_use]
    pub const fn heap_end(&self) -> VirtualAddress {
        VirtualAddress::new(self.end)
    }

    #[inline]
    #[must_use]
    pub const fn mapped_bytes(&self) -> u32 {
        self.end - self.start
    }

    /// Payload bytes available in free blocks.
    #[inline]
    #[must_use]
    pub const fn free_bytes(&self) -> u32 {
        self.free_bytes
    }

    /// Number of blocks on the free list.
    #[inline]
    #[must_use]
    pub const fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    /// Allocate `byte_size` bytes, aligned to [`HEAP_ALIGN`].
    ///
    /// # Errors
    /// - [`HeapError::InvalidArgument`] for a zero size.
    /// - [`HeapError::Exhausted`] if growing would leave the heap window.
    /// - [`HeapError::Backend`] if the backend could not map more pages.
    pub fn allocate<B: HeapBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        byte_size: u32,
    ) -> Result<NonNull<u8>, HeapError> {
        if byte_size == 0 {
            return Err(HeapError::InvalidArgument);
        }
        let size = checked_align_up(byte_size, HEAP_ALIGN).ok_or(HeapError::InvalidArgument)?;

        let at = match self.find_fit(backend, size)? {
            Some(at) => at,
            None => self.grow(backend, size)?,
        };
        let payload = self.carve(backend, at, size)?;
        log::trace!("heap: {byte_size} bytes at {payload:#010x}");
        to_ptr(payload)
    }

    /// Allocate `count * size` zeroed bytes.
    ///
    /// # Errors
    /// [`HeapError::InvalidArgument`] if the product overflows, otherwise as
    /// [`allocate`](Self::allocate).
    pub fn allocate_zeroed<B: HeapBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        count: u32,
        size: u32,
    ) -> Result<NonNull<u8>, HeapError> {
        let total = count.checked_mul(size).ok_or(HeapError::InvalidArgument)?;
        let ptr = self.allocate(backend, total)?;
        // SAFETY: the block was just allocated and is at least `total` bytes.
        if let Err(e) = unsafe { backend.fill(VirtualAddress::from_nonnull(ptr), total, 0) } {
            self.free(backend, ptr)?;
            return Err(e.into());
        }
        Ok(ptr)
    }

    /// Return a block to the heap.
    ///
    /// # Errors
    /// - [`HeapError::DoubleFree`] if `ptr` lies in free heap memory.
    /// - [`HeapError::InvalidPointer`] for anything else not handed out by
    ///   this heap.
    pub fn free<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let payload = VirtualAddress::from_nonnull(ptr).as_u32();
        let (at, header) = self.find_allocated(backend, payload)?;
        log::trace!("heap: free {payload:#010x}");
        self.release(backend, at, header.size)
    }

    /// Resize the block at `ptr` to `new_size` bytes, keeping its contents.
    ///
    /// Grows in place into a free successor when possible, otherwise moves.
    /// On error the old block is untouched.
    ///
    /// # Errors
    /// - [`HeapError::InvalidArgument`] for a zero size.
    /// - [`HeapError::InvalidPointer`] / [`HeapError::DoubleFree`] as
    ///   [`free`](Self::free).
    /// - Otherwise as [`allocate`](Self::allocate).
    pub fn reallocate<B: HeapBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        ptr: NonNull<u8>,
        new_size: u32,
    ) -> Result<NonNull<u8>, HeapError> {
        if new_size == 0 {
            return Err(HeapError::InvalidArgument);
        }
        let payload = VirtualAddress::from_nonnull(ptr).as_u32();
        let (at, old) = self.find_allocated(backend, payload)?;
        let need = checked_align_up(new_size, HEAP_ALIGN).ok_or(HeapError::InvalidArgument)?;
        if old.size >= need {
            return Ok(ptr);
        }

        let next = payload + old.size;
        if let Some(successor) = self.free_successor(backend, next)?
            && old.size + HEAP_BLOCK_HEADER + successor.size >= need
        {
            self.absorb(backend, at, old.size, next, need)?;
            log::trace!("heap: grew {payload:#010x} in place to {need} bytes");
            return Ok(ptr);
        }

        let moved = self.allocate(backend, new_size)?;
        // SAFETY: both blocks are allocated, distinct, and at least `old.size` bytes.
        let copied = unsafe { backend.copy(VirtualAddress::new(payload), VirtualAddress::from_nonnull(moved), old.size) };
        if let Err(e) = copied {
            self.free(backend, moved)?;
            return Err(e.into());
        }
        self.release(backend, at, old.size)?;
        Ok(moved)
    }

    /// Exact fit if there is one, else the first block large enough.
    fn find_fit<B: HeapBackend + ?Sized>(&self, backend: &mut B, size: u32) -> Result<Option<u32>, HeapError> {
        let mut first = None;
        let mut cursor = self.head;
        while let Some(at) = cursor {
            let header = read(backend, at)?;
            if header.size == size {
                return Ok(Some(at));
            }
            if first.is_none() && header.size >= size {
                first = Some(at);
            }
            cursor = link(header.next);
        }
        Ok(first)
    }

    /// Header of the allocated block whose payload starts at `payload`.
    ///
    /// Walks the blocks in address order, so a pointer into the middle of a
    /// block is never mistaken for a header.
    fn find_allocated<B: HeapBackend + ?Sized>(
        &self,
        backend: &mut B,
        payload: u32,
    ) -> Result<(u32, BlockHeader), HeapError> {
        let mut at = self.start;
        while at < self.end {
            let header = read(backend, at)?;
            let end = at + HEAP_BLOCK_HEADER + header.size;
            if payload < end {
                return if at + HEAP_BLOCK_HEADER == payload && header.is_used() {
                    Ok((at, header))
                } else if at <= payload && header.is_free() {
                    Err(HeapError::DoubleFree)
                } else {
                    Err(HeapError::InvalidPointer)
                };
            }
            at = end;
        }
        Err(HeapError::InvalidPointer)
    }

    /// The free block starting exactly at `at`, if any.
    fn free_successor<B: HeapBackend + ?Sized>(
        &self,
        backend: &mut B,
        at: u32,
    ) -> Result<Option<BlockHeader>, HeapError> {
        if at >= self.end {
            return Ok(None);
        }
        let header = read(backend, at)?;
        Ok(header.is_free().then_some(header))
    }

    /// Hand out `size` bytes of the free block at `at`, from its tail when
    /// the rest is worth keeping. Returns the payload address.
    fn carve<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, at: u32, size: u32) -> Result<u32, HeapError> {
        let mut header = read(backend, at)?;
        let rest = header.size - size;
        if rest >= MIN_SPLIT {
            header.size = rest - HEAP_BLOCK_HEADER;
            write(backend, at, header)?;
            let tail = at + HEAP_BLOCK_HEADER + header.size;
            write(backend, tail, BlockHeader::used(size))?;
            self.free_bytes -= HEAP_BLOCK_HEADER + size;
            return Ok(tail + HEAP_BLOCK_HEADER);
        }

        let header = self.unlink(backend, at)?;
        write(backend, at, BlockHeader::used(header.size))?;
        Ok(at + HEAP_BLOCK_HEADER)
    }

    /// Map enough pages at the heap end for a `size` byte block and return
    /// the header address of the free block that now covers them.
    fn grow<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, size: u32) -> Result<u32, HeapError> {
        let bytes = size.checked_add(HEAP_BLOCK_HEADER).ok_or(HeapError::Exhausted)?;
        let pages = bytes.div_ceil(PAGE_SIZE);
        let grown = pages * PAGE_SIZE;
        let new_end = self.end.checked_add(grown).ok_or(HeapError::Exhausted)?;
        if new_end - self.start > KHEAP_LENGTH {
            log::warn!("heap: window exhausted at {:#010x}", self.end);
            return Err(HeapError::Exhausted);
        }
        let last = self.last_free_at_end(backend)?;

        backend.map_pages(VirtualAddress::new(self.end), pages)?;
        log::debug!("heap: grew by {pages} pages at {:#010x}", self.end);

        let old_end = self.end;
        self.end = new_end;
        if let Some(at) = last {
            update(backend, at, |h| h.size += grown)?;
            self.free_bytes += grown;
            Ok(at)
        } else {
            self.insert(backend, old_end, grown - HEAP_BLOCK_HEADER)?;
            Ok(old_end)
        }
    }

    /// The last free block, if it reaches the end of the mapped range.
    fn last_free_at_end<B: HeapBackend + ?Sized>(&self, backend: &mut B) -> Result<Option<u32>, HeapError> {
        let mut last = None;
        let mut cursor = self.head;
        while let Some(at) = cursor {
            let header = read(backend, at)?;
            last = Some((at, header.size));
            cursor = link(header.next);
        }
        Ok(last
            .filter(|&(at, size)| at + HEAP_BLOCK_HEADER + size == self.end)
            .map(|(at, _)| at))
    }

    /// Extend the allocated block at `at` into the free block at `next` up
    /// to `need` payload bytes; any worthwhile excess stays free behind it.
    fn absorb<B: HeapBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        at: u32,
        size: u32,
        next: u32,
        need: u32,
    ) -> Result<(), HeapError> {
        let gone = self.unlink(backend, next)?;
        write(backend, next, BlockHeader::default())?;
        let total = size + HEAP_BLOCK_HEADER + gone.size;
        let excess = total - need;
        if excess >= MIN_SPLIT {
            write(backend, at, BlockHeader::used(need))?;
            self.insert(backend, at + HEAP_BLOCK_HEADER + need, excess - HEAP_BLOCK_HEADER)
        } else {
            write(backend, at, BlockHeader::used(total))
        }
    }

    /// Put the allocated block at `at` back on the free list, merging with
    /// free neighbours on either side.
    fn release<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, at: u32, size: u32) -> Result<(), HeapError> {
        self.insert(backend, at, size)?;
        let header = read(backend, at)?;
        let at = match link(header.prev) {
            Some(prev) if prev + HEAP_BLOCK_HEADER + read(backend, prev)?.size == at => {
                self.merge_into(backend, prev, at)?;
                prev
            }
            _ => at,
        };
        let header = read(backend, at)?;
        if let Some(next) = link(header.next)
            && at + HEAP_BLOCK_HEADER + header.size == next
        {
            self.merge_into(backend, at, next)?;
        }
        Ok(())
    }

    /// Fold the free block at `other` into the free block right before it.
    fn merge_into<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, into: u32, other: u32) -> Result<(), HeapError> {
        let gone = self.unlink(backend, other)?;
        write(backend, other, BlockHeader::default())?;
        update(backend, into, |h| h.size += HEAP_BLOCK_HEADER + gone.size)?;
        self.free_bytes += HEAP_BLOCK_HEADER + gone.size;
        Ok(())
    }

    /// Write a free header of `size` bytes at `at` and link it in by address.
    fn insert<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, at: u32, size: u32) -> Result<(), HeapError> {
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(c) = cursor {
            if c > at {
                break;
            }
            prev = Some(c);
            cursor = link(read(backend, c)?.next);
        }

        let header = BlockHeader {
            tag: TAG_FREE,
            size,
            prev: raw(prev),
            next: raw(cursor),
        };
        write(backend, at, header)?;
        match prev {
            Some(p) => update(backend, p, |h| h.next = at)?,
            None => self.head = Some(at),
        }
        if let Some(n) = cursor {
            update(backend, n, |h| h.prev = at)?;
        }
        self.free_bytes += size;
        self.free_blocks += 1;
        Ok(())
    }

    /// Take the free block at `at` off the list and return its header as it
    /// was; the caller rewrites it.
    fn unlink<B: HeapBackend + ?Sized>(&mut self, backend: &mut B, at: u32) -> Result<BlockHeader, HeapError> {
        let header = read(backend, at)?;
        match link(header.prev) {
            Some(p) => update(backend, p, |h| h.next = header.next)?,
            None => self.head = link(header.next),
        }
        if let Some(n) = link(header.next) {
            update(backend, n, |h| h.prev = header.prev)?;
        }
        self.free_bytes -= header.size;
        self.free_blocks -= 1;
        Ok(header)
    }
}

fn to_ptr(addr: u32) -> Result<NonNull<u8>, HeapError> {
    NonNull::new(ptr::with_exposed_provenance_mut(addr as usize)).ok_or(HeapError::InvalidPointer)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::ops::Range;

    /// Heap memory as a host buffer addressed by kernel virtual addresses.
    pub struct BufferBackend {
        pub base: u32,
        pub memory: Vec<u8>,
        pub mapped_pages: u32,
        pub fail: bool,
    }

    impl BufferBackend {
        pub fn new(base: u32) -> Self {
            Self {
                base,
                memory: Vec::new(),
                mapped_pages: 0,
                fail: false,
            }
        }

        fn range(&self, at: VirtualAddress, len: usize) -> Result<Range<usize>, VmmError> {
            let start = at.as_u32().checked_sub(self.base).ok_or(VmmError::NotMapped)? as usize;
            if start + len > self.memory.len() {
                return Err(VmmError::NotMapped);
            }
            Ok(start..start + len)
        }

        pub fn read(&self, ptr: NonNull<u8>, len: usize) -> &[u8] {
            let range = self.range(VirtualAddress::from_nonnull(ptr), len).unwrap();
            &self.memory[range]
        }

        pub fn write(&mut self, ptr: NonNull<u8>, bytes: &[u8]) {
            let range = self.range(VirtualAddress::from_nonnull(ptr), bytes.len()).unwrap();
            self.memory[range].copy_from_slice(bytes);
        }

        /// The header in front of the payload at `ptr`.
        pub fn header_of(&mut self, ptr: NonNull<u8>) -> BlockHeader {
            let at = VirtualAddress::from_nonnull(ptr).as_u32() - HEAP_BLOCK_HEADER;
            unsafe { self.read_header(VirtualAddress::new(at)) }.unwrap()
        }
    }

    impl HeapBackend for BufferBackend {
        fn map_pages(&mut self, at: VirtualAddress, count: u32) -> Result<(), VmmError> {
            if self.fail {
                return Err(VmmError::OutOfMemory);
            }
            assert_eq!((at.as_u32() - self.base) as usize, self.memory.len());
            self.memory.resize(self.memory.len() + (count * PAGE_SIZE) as usize, 0xAA);
            self.mapped_pages += count;
            Ok(())
        }

        unsafe fn read_header(&mut self, at: VirtualAddress) -> Result<BlockHeader, VmmError> {
            let range = self.range(at, size_of::<BlockHeader>())?;
            Ok(unsafe { self.memory[range].as_ptr().cast::<BlockHeader>().read_unaligned() })
        }

        unsafe fn write_header(&mut self, at: VirtualAddress, header: BlockHeader) -> Result<(), VmmError> {
            let range = self.range(at, size_of::<BlockHeader>())?;
            unsafe { self.memory[range].as_mut_ptr().cast::<BlockHeader>().write_unaligned(header) };
            Ok(())
        }

        unsafe fn fill(&mut self, at: VirtualAddress, len: u32, byte: u8) -> Result<(), VmmError> {
            let range = self.range(at, len as usize)?;
            self.memory[range].fill(byte);
            Ok(())
        }

        unsafe fn copy(&mut self, from: VirtualAddress, to: VirtualAddress, len: u32) -> Result<(), VmmError> {
            let from = self.range(from, len as usize)?;
            let to = self.range(to, len as usize)?;
            self.memory.copy_within(from, to.start);
            Ok(())
        }
    }

    const BASE: u32 = 0xC040_0000;

    fn heap() -> (KernelHeap, BufferBackend) {
        let start = VirtualAddress::new(BASE).page::<Size4K>();
        (KernelHeap::new(start), BufferBackend::new(BASE))
    }

    fn addr(ptr: NonNull<u8>) -> u32 {
        VirtualAddress::from_nonnull(ptr).as_u32()
    }

    #[test]
    fn freed_block_is_reused_without_growth() {
        let (mut heap, mut mem) = heap();
        let a = heap.allocate(&mut mem, 64).unwrap();
        let b = heap.allocate(&mut mem, 64).unwrap();
        assert_ne!(a, b);
        assert_eq!(heap.mapped_bytes(), PAGE_SIZE);

        heap.free(&mut mem, a).unwrap();
        let c = heap.allocate(&mut mem, 64).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.mapped_bytes(), PAGE_SIZE);
        assert_eq!(mem.mapped_pages, 1);
    }

    #[test]
    fn carves_from_the_tail() {
        let (mut heap, mut mem) = heap();
        let a = heap.allocate(&mut mem, 64).unwrap();
        assert_eq!(addr(a), BASE + PAGE_SIZE - 64);
        assert_eq!(addr(a) % HEAP_ALIGN, 0);
        assert_eq!(heap.free_bytes(), PAGE_SIZE - 2 * HEAP_BLOCK_HEADER - 64);

        let before = heap.free_bytes();
        let b = heap.allocate(&mut mem, 1).unwrap();
        assert_eq!(addr(b), addr(a) - HEAP_BLOCK_HEADER - 16);
        assert_eq!(before - heap.free_bytes(), HEAP_BLOCK_HEADER + 16);
    }

    #[test]
    fn headers_live_in_heap_memory() {
        let (mut heap, mut mem) = heap();
        let a = heap.allocate(&mut mem, 64).unwrap();
        let header = mem.header_of(a);
        assert!(header.is_used());
        assert_eq!(header.size(), 64);

        let head = unsafe { mem.read_header(VirtualAddress::new(BASE)) }.unwrap();
        assert!(head.is_free());
        assert_eq!(head.size(), heap.free_bytes());

        heap.free(&mut mem, a).unwrap();
        // Merged into the head block; its own header is gone.
        assert!(!mem.header_of(a).is_used());
        assert!(!mem.header_of(a).is_free());
        let head = unsafe { mem.read_header(VirtualAddress::new(BASE)) }.unwrap();
        assert_eq!(head.size(), PAGE_SIZE - HEAP_BLOCK_HEADER);
    }

    #[test]
    fn block_count_is_not_bounded() {
        let (mut heap, mut mem) = heap();
        let ptrs: Vec<_> = (0..2000).map(|_| heap.allocate(&mut mem, 16).unwrap()).collect();

        // 128 blocks of 32 bytes fill each page exactly.
        assert_eq!(heap.mapped_bytes(), 16 * PAGE_SIZE);
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), 16 * PAGE_SIZE - 2000 * 32 - HEAP_BLOCK_HEADER);

        for &p in ptrs.iter().step_by(2) {
            heap.free(&mut mem, p).unwrap();
        }
        assert_eq!(heap.free_blocks(), 1001);
        for &p in ptrs.iter().skip(1).step_by(2) {
            heap.free(&mut mem, p).unwrap();
        }
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), 16 * PAGE_SIZE - HEAP_BLOCK_HEADER);
    }

    #[test]
    fn free_restores_free_bytes() {
        let (mut heap, mut mem) = heap();
        let warmup = heap.allocate(&mut mem, 16).unwrap();
        heap.free(&mut mem, warmup).unwrap();
        let before = heap.free_bytes();

        let a = heap.allocate(&mut mem, 100).unwrap();
        let b = heap.allocate(&mut mem, 200).unwrap();
        heap.free(&mut mem, a).unwrap();
        heap.free(&mut mem, b).unwrap();
        assert_eq!(heap.free_bytes(), before);
        assert_eq!(heap.free_blocks(), 1);
    }

    #[test]
    fn coalesces_in_any_order() {
        let (mut heap, mut mem) = heap();
        let ptrs: Vec<_> = (0..4).map(|_| heap.allocate(&mut mem, 48).unwrap()).collect();
        let before = heap.free_blocks();
        heap.free(&mut mem, ptrs[1]).unwrap();
        heap.free(&mut mem, ptrs[3]).unwrap();
        assert_eq!(heap.free_blocks(), before + 1);
        heap.free(&mut mem, ptrs[2]).unwrap();
        assert_eq!(heap.free_blocks(), before);
        heap.free(&mut mem, ptrs[0]).unwrap();
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), PAGE_SIZE - HEAP_BLOCK_HEADER);
    }

    #[test]
    fn prefers_an_exact_fit() {
        let (mut heap, mut mem) = heap();
        let a = heap.allocate(&mut mem, 32).unwrap();
        let _keep = heap.allocate(&mut mem, 16).unwrap();
        let b = heap.allocate(&mut mem, 64).unwrap();
        let _keep2 = heap.allocate(&mut mem, 16).unwrap();
        heap.free(&mut mem, a).unwrap();
        heap.free(&mut mem, b).unwrap();
        // First fit by address would pick the large head block.
        assert_eq!(heap.allocate(&mut mem, 64).unwrap(), b);
        assert_eq!(heap.allocate(&mut mem, 32).unwrap(), a);
    }

    #[test]
    fn grows_and_merges_with_the_last_free_block() {
        let (mut heap, mut mem) = heap();
        let big = heap.allocate(&mut mem, 6000).unwrap();
        assert_eq!(mem.mapped_pages, 2);
        assert_eq!(heap.heap_end().as_u32(), BASE + 2 * PAGE_SIZE);
        heap.free(&mut mem, big).unwrap();
        assert_eq!(heap.free_blocks(), 1);

        // Growth is sized for the request alone, then merged with the tail.
        let huge = heap.allocate(&mut mem, 3 * PAGE_SIZE).unwrap();
        assert_eq!(mem.mapped_pages, 6);
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.free_bytes(), 6 * PAGE_SIZE - 2 * HEAP_BLOCK_HEADER - 3 * PAGE_SIZE);
        heap.free(&mut mem, huge).unwrap();
        assert_eq!(heap.free_bytes(), 6 * PAGE_SIZE - HEAP_BLOCK_HEADER);
    }

    #[test]
    fn growth_behind_a_used_block_starts_a_new_free_block() {
        let (mut heap, mut mem) = heap();
        let _first = heap.allocate(&mut mem, PAGE_SIZE - HEAP_BLOCK_HEADER).unwrap();
        assert_eq!(heap.free_blocks(), 0);
        let second = heap.allocate(&mut mem, 64).unwrap();
        assert_eq!(addr(second), BASE + 2 * PAGE_SIZE - 64);
        assert_eq!(heap.free_blocks(), 1);
        let head = unsafe { mem.read_header(VirtualAddress::new(BASE + PAGE_SIZE)) }.unwrap();
        assert!(head.is_free());
        assert_eq!(head.size(), PAGE_SIZE - 2 * HEAP_BLOCK_HEADER - 64);
    }

    #[test]
    fn rejects_bad_frees() {
        let (mut heap, mut mem) = heap();
        assert_eq!(heap.allocate(&mut mem, 0), Err(HeapError::InvalidArgument));
        let a = heap.allocate(&mut mem, 64).unwrap();
        let b = heap.allocate(&mut mem, 64).unwrap();
        heap.free(&mut mem, a).unwrap();
        assert_eq!(heap.free(&mut mem, a), Err(HeapError::DoubleFree));
        assert_eq!(
            heap.free(&mut mem, to_ptr(addr(b) + 16).unwrap()),
            Err(HeapError::InvalidPointer)
        );
        assert_eq!(heap.free(&mut mem, to_ptr(0x1000).unwrap()), Err(HeapError::InvalidPointer));
        assert_eq!(
            heap.free(&mut mem, to_ptr(BASE + 2 * PAGE_SIZE).unwrap()),
            Err(HeapError::InvalidPointer)
        );
        heap.free(&mut mem, b).unwrap();
    }

    #[test]
    fn forged_header_inside_a_payload_is_rejected() {
        let (mut heap, mut mem) = heap();
        let a = heap.allocate(&mut mem, 64).unwrap();
        let inner = addr(a) + 32;
        unsafe { mem.write_header(VirtualAddress::new(inner - HEAP_BLOCK_HEADER), BlockHeader::used(16)) }.unwrap();
        assert_eq!(heap.free(&mut mem, to_ptr(inner).unwrap()), Err(HeapError::InvalidPointer));
        heap.free(&mut mem, a).unwrap();
    }

    #[test]
    fn backend_failure_is_reported() {
        let (mut heap, mut mem) = heap();
        mem.fail = true;
        assert_eq!(
            heap.allocate(&mut mem, 64),
            Err(HeapError::Backend(VmmError::OutOfMemory))
        );
        assert_eq!(heap.mapped_bytes(), 0);
        assert_eq!(heap.free_blocks(), 0);
    }

    #[test]
    fn window_is_bounded() {
        let (mut heap, mut mem) = heap();
        assert_eq!(heap.allocate(&mut mem, KHEAP_LENGTH), Err(HeapError::Exhausted));
        assert_eq!(mem.mapped_pages, 0);
    }

    #[test]
    fn zeroed_allocation() {
        let (mut heap, mut mem) = heap();
        let p = heap.allocate_zeroed(&mut mem, 8, 4).unwrap();
        assert!(mem.read(p, 32).iter().all(|&b| b == 0));
        assert_eq!(heap.allocate_zeroed(&mut mem, u32::MAX, 2), Err(HeapError::InvalidArgument));
    }

    #[test]
    fn reallocate_in_place_and_by_moving() {
        let (mut heap, mut mem) = heap();
        let a = heap.allocate(&mut mem, 32).unwrap();
        let b = heap.allocate(&mut mem, 32).unwrap();
        mem.write(b, b"0123456789abcdef");

        // Smaller or equal stays put.
        assert_eq!(heap.reallocate(&mut mem, b, 20).unwrap(), b);

        // `a` follows `b` and becomes free, so `b` grows into it.
        heap.free(&mut mem, a).unwrap();
        assert_eq!(heap.reallocate(&mut mem, b, 64).unwrap(), b);
        assert_eq!(mem.read(b, 16), b"0123456789abcdef");
        assert_eq!(mem.header_of(b).size(), 80);

        // Nothing free after `b` now; it has to move.
        let c = heap.reallocate(&mut mem, b, 512).unwrap();
        assert_ne!(c, b);
        assert_eq!(mem.read(c, 16), b"0123456789abcdef");
        assert_eq!(heap.free(&mut mem, b), Err(HeapError::DoubleFree));
        assert_eq!(heap.reallocate(&mut mem, c, 0), Err(HeapError::InvalidArgument));
    }

    #[test]
    fn reallocate_splits_a_large_successor() {
        let (mut heap, mut mem) = heap();
        let a = heap.allocate(&mut mem, 256).unwrap();
        let b = heap.allocate(&mut mem, 32).unwrap();
        heap.free(&mut mem, a).unwrap();
        let free_before = heap.free_bytes();

        assert_eq!(heap.reallocate(&mut mem, b, 96).unwrap(), b);
        assert_eq!(mem.header_of(b).size(), 96);
        assert_eq!(heap.free_blocks(), 2);
        assert_eq!(heap.free_bytes(), free_before - 64);
    }
}
