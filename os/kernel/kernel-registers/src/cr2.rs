#[cfg(all(feature = "asm", target_arch = "x86"))]
use crate::LoadRegisterUnsafe;
use kernel_memory_addresses::VirtualAddress;

/// CR2: Page-Fault Linear Address.
///
/// Written by the CPU right before it raises `#PF`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Cr2(VirtualAddress);

impl Cr2 {
    #[must_use]
    pub const fn new(faulting: VirtualAddress) -> Self {
        Self(faulting)
    }

    #[must_use]
    pub const fn address(self) -> VirtualAddress {
        self.0
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl LoadRegisterUnsafe for Cr2 {
    unsafe fn load_unsafe() -> Self {
        let cr2: u32;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        Self(VirtualAddress::new(cr2))
    }
}
