//! Interrupt flag control.
//!
//! On 32-bit x86 with the `asm` feature the functions here execute
//! `pushfd`/`cli`/`sti`. Every other build (host tests, tooling) works on a
//! simulated interrupt flag so the save/restore discipline stays observable.

use kernel_registers::eflags::Eflags;

#[cfg(not(all(feature = "asm", target_arch = "x86")))]
static SIMULATED_IF: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

/// Returns the current `EFLAGS` value.
#[cfg(all(feature = "asm", target_arch = "x86"))]
#[inline]
#[must_use]
pub fn eflags() -> Eflags {
    use kernel_registers::LoadRegister;
    Eflags::load()
}

/// Returns the simulated `EFLAGS` value (only `IF` and the fixed bit 1).
#[cfg(not(all(feature = "asm", target_arch = "x86")))]
#[inline]
#[must_use]
pub fn eflags() -> Eflags {
    Eflags::new().with_if_interrupt_enable(SIMULATED_IF.load(core::sync::atomic::Ordering::SeqCst))
}

/// Disables hardware interrupts (`cli`).
///
/// Must only be called where `cli` is permitted (ring 0).
#[inline]
pub fn disable_interrupts() {
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(all(feature = "asm", target_arch = "x86")))]
    SIMULATED_IF.store(false, core::sync::atomic::Ordering::SeqCst);
}

/// Enables hardware interrupts (`sti`).
#[inline]
pub fn enable_interrupts() {
    #[cfg(all(feature = "asm", target_arch = "x86"))]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(all(feature = "asm", target_arch = "x86")))]
    SIMULATED_IF.store(true, core::sync::atomic::Ordering::SeqCst);
}

#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    eflags().if_interrupt_enable()
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots `IF`. If interrupts were enabled it executes
/// `cli`; on drop it executes `sti` only if they were enabled before, so
/// nested guards compose and every exit path restores the caller's state.
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            disable_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether interrupts were enabled when the guard was taken.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable_interrupts();
        }
    }
}
