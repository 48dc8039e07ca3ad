//! Page fault error code decoding.

use core::fmt;
use kernel_memory_addresses::VirtualAddress;

bitflags::bitflags! {
    /// Error code pushed by the CPU for a page fault (vector 14).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageFaultErrorCode: u32 {
        /// Protection violation; cleared means the page was not present.
        const PRESENT = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
        /// A reserved bit was set in a paging entry.
        const RESERVED_WRITE = 1 << 3;
        /// The access was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

impl PageFaultErrorCode {
    /// Human readable summary of the user/write/present bits.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self.bits() & 0b111 {
            0b000 => "supervisory process tried to read a non-present page entry",
            0b001 => "supervisory process tried to read a page and caused a protection fault",
            0b010 => "supervisory process tried to write to a non-present page entry",
            0b011 => "supervisory process tried to write a page and caused a protection fault",
            0b100 => "user process tried to read a non-present page entry",
            0b101 => "user process tried to read a page and caused a protection fault",
            0b110 => "user process tried to write to a non-present page entry",
            _ => "user process tried to write a page and caused a protection fault",
        }
    }
}

/// A decoded page fault: the faulting address (CR2) and the error code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub code: PageFaultErrorCode,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, code: u32) -> Self {
        Self {
            address,
            code: PageFaultErrorCode::from_bits_truncate(code),
        }
    }

    /// Read the faulting address from CR2.
    ///
    /// # Safety
    /// Ring 0 only, and before anything else can fault and overwrite CR2.
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    #[must_use]
    pub unsafe fn from_cpu(code: u32) -> Self {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::cr2::Cr2;
        Self::new(unsafe { Cr2::load_unsafe() }.address(), code)
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page fault at {}: {}", self.address, self.code.describe())?;
        if self.code.contains(PageFaultErrorCode::RESERVED_WRITE) {
            f.write_str(" (reserved bit set)")?;
        }
        if self.code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
            f.write_str(" (instruction fetch)")?;
        }
        Ok(())
    }
}
