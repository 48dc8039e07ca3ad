//! # Memory Layout

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: u32 = 0x1000;

/// Size of a large page mapped directly by a page directory entry.
pub const LARGE_PAGE_SIZE: u32 = 0x40_0000;

/// Number of 32-bit entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Where the kernel executes (VMA).
pub const KERNEL_VIRTUAL_BASE: u32 = 0xC000_0000;

/// Directory slot that points back at the directory itself.
pub const RECURSIVE_INDEX: usize = ENTRIES_PER_TABLE - 1;

/// Virtual address of the active page directory once the recursive entry is installed.
pub const PD_VADDR: u32 = 0xFFFF_F000;

/// Virtual address of page table 0 in the recursive window; table `i` lives at
/// `PT_BASE_VADDR + i * PAGE_SIZE`.
pub const PT_BASE_VADDR: u32 = 0xFFC0_0000;

/// End of legacy low memory. Non-mandatory page searches start here.
pub const LOW_MEMORY_END: u32 = 0x10_0000; // 1 MiB

/// Maximum length of the kernel heap (256 MiB).
pub const KHEAP_LENGTH: u32 = 0x1000_0000;

/// Alignment of every pointer handed out by the kernel heap.
pub const HEAP_ALIGN: u32 = 16;

/// Bytes accounted for the header in front of each heap block.
pub const HEAP_BLOCK_HEADER: u32 = 16;

#[allow(clippy::cast_possible_truncation)]
const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(LARGE_PAGE_SIZE == PAGE_SIZE * ENTRIES_PER_TABLE as u32);
    assert!(KERNEL_VIRTUAL_BASE.is_multiple_of(LARGE_PAGE_SIZE));
    assert!(PT_BASE_VADDR == (RECURSIVE_INDEX as u32) * LARGE_PAGE_SIZE);
    assert!(PD_VADDR == PT_BASE_VADDR + (RECURSIVE_INDEX as u32) * PAGE_SIZE);
    assert!(LOW_MEMORY_END < KERNEL_VIRTUAL_BASE);
    assert!(KERNEL_VIRTUAL_BASE as u64 + KHEAP_LENGTH as u64 <= PT_BASE_VADDR as u64);
    assert!(HEAP_ALIGN.is_power_of_two());
    assert!(HEAP_BLOCK_HEADER.is_multiple_of(HEAP_ALIGN));
};
