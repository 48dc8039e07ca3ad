//! # Kernel Memory Layout and Boot Interface
//!
//! Compile-time memory layout of the 32-bit higher-half kernel and the
//! read-only view of the boot loader's memory information.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * Page and large-page sizes, entries per paging structure
//! * Higher-half kernel base and the recursive paging window
//! * Kernel heap placement limits and block geometry
//!
//! ### Boot Information ([`boot`])
//! * The multiboot information structure as handed over in `ebx`
//! * A safe iterator over the memory map entries
//! * [`BootMemoryInfo`](boot::BootMemoryInfo), the input to frame allocator seeding
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Low memory (first MiB, BIOS)   │
//! 0x0010_0000 ├─────────────────────────────────┤ LOW_MEMORY_END
//!             │  Free for page allocations      │
//! 0xC000_0000 ├─────────────────────────────────┤ KERNEL_VIRTUAL_BASE
//!             │  Kernel image (4 MiB page)      │
//!             │  Frame stack bookkeeping        │
//!             │  Kernel heap (grows upwards)    │
//! 0xFFC0_0000 ├─────────────────────────────────┤ PT_BASE_VADDR
//!             │  Page tables (recursive map)    │
//! 0xFFFF_F000 ├─────────────────────────────────┤ PD_VADDR
//!             │  Page directory                 │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
