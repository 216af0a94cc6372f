//! x86_64 architecture support
//!
//! [`X86Hal`] implements the executive's [`Hal`] on x86_64 hardware:
//!
//! - IRQL is the task priority register (CR8); IRQL n masks every vector
//!   whose priority class (vector >> 4) is n or below
//! - Software interrupts are x2APIC self-IPIs or fixed IPIs on the APC and
//!   DISPATCH vectors
//! - The one-shot quantum timer is the x2APIC timer on the clock vector
//! - The cycle counter is the TSC; the processor number lives in TSC_AUX
//! - Context switching swaps callee-saved registers on the kernel stack,
//!   FXSAVE state and TSS.RSP0
//!
//! The boot path calibrates the TSC and APIC timer, builds the HAL, then
//! calls [`X86Hal::register_processor`] on every processor before starting
//! it. Interrupt stubs call [`X86Hal::end_of_interrupt`] and then the
//! matching `Kernel` entry point.

pub mod context;
pub mod serial;

use core::arch::asm;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::registers::model_specific::Msr;
use x86_64::structures::paging::PhysFrame;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::{PhysAddr, VirtAddr};

use crate::hal::{ArchThreadState, Hal, ThreadContext, ThreadEntry};
use crate::ke::irql::levels::{APC_LEVEL, DISPATCH_LEVEL};
use crate::ke::irql::Kirql;
use crate::ke::KeError;

pub use serial::{init_logging, SerialLogger};

/// Processors the HAL can address
pub const MAX_PROCESSORS: usize = 64;

/// Interrupt vectors (priority class = IRQL)
pub mod vectors {
    /// APC_LEVEL software interrupt
    pub const APC_VECTOR: u8 = 0x1F;
    /// DISPATCH_LEVEL software interrupt
    pub const DISPATCH_VECTOR: u8 = 0x2F;
    /// Quantum timer, CLOCK_LEVEL
    pub const CLOCK_VECTOR: u8 = 0xD1;
    /// Spurious interrupt vector
    pub const SPURIOUS_VECTOR: u8 = 0xFF;
}

/// Model-specific registers used by the HAL
mod msr {
    pub const IA32_APIC_BASE: u32 = 0x1B;
    pub const IA32_TSC_AUX: u32 = 0xC000_0103;
    pub const X2APIC_ID: u32 = 0x802;
    pub const X2APIC_EOI: u32 = 0x80B;
    pub const X2APIC_SVR: u32 = 0x80F;
    pub const X2APIC_ICR: u32 = 0x830;
    pub const X2APIC_LVT_TIMER: u32 = 0x832;
    pub const X2APIC_INIT_COUNT: u32 = 0x838;
    pub const X2APIC_DIVIDE: u32 = 0x83E;
    pub const X2APIC_SELF_IPI: u32 = 0x83F;
}

/// IA32_APIC_BASE: global enable and x2APIC mode
const APIC_BASE_ENABLE: u64 = 1 << 11;
const APIC_BASE_X2APIC: u64 = 1 << 10;

/// SVR software enable
const SVR_ENABLE: u64 = 1 << 8;

/// ICR level assert (fixed delivery, physical destination)
const ICR_ASSERT: u64 = 1 << 14;

/// APIC timer divide configuration: divide by 16
const TIMER_DIVIDE_BY_16: u64 = 0b0011;

/// First address above the user half of the address space
const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

#[inline]
fn rdmsr(index: u32) -> u64 {
    unsafe { Msr::new(index).read() }
}

#[inline]
fn wrmsr(index: u32, value: u64) {
    let mut msr = Msr::new(index);
    unsafe { msr.write(value) }
}

/// HAL for x86_64 processors with an x2APIC and invariant TSC
pub struct X86Hal {
    /// TSC frequency
    tsc_hz: u64,
    /// APIC timer input frequency after the divider
    apic_timer_hz: u64,
    /// x2APIC ID of each registered processor
    apic_ids: [AtomicU32; MAX_PROCESSORS],
    /// TSS of each registered processor
    tss: [AtomicPtr<TaskStateSegment>; MAX_PROCESSORS],
}

impl X86Hal {
    /// Build the HAL from calibrated TSC and APIC-timer frequencies
    pub const fn new(tsc_hz: u64, apic_timer_hz: u64) -> Self {
        Self {
            tsc_hz,
            apic_timer_hz,
            apic_ids: [const { AtomicU32::new(0) }; MAX_PROCESSORS],
            tss: [const { AtomicPtr::new(ptr::null_mut()) }; MAX_PROCESSORS],
        }
    }

    /// Bring the executing processor under the HAL as processor `cpu`
    ///
    /// Switches the local APIC to x2APIC mode, records the processor number
    /// in TSC_AUX and remembers the TSS whose RSP0 follows the running
    /// thread.
    ///
    /// # Safety
    /// Must run on the processor being registered, with interrupts
    /// disabled. `tss` must stay valid for as long as the processor runs.
    pub unsafe fn register_processor(&self, cpu: usize, tss: *mut TaskStateSegment) -> Result<(), KeError> {
        if cpu >= MAX_PROCESSORS {
            return Err(KeError::InvalidParameter);
        }

        wrmsr(msr::IA32_APIC_BASE, rdmsr(msr::IA32_APIC_BASE) | APIC_BASE_ENABLE | APIC_BASE_X2APIC);
        wrmsr(msr::X2APIC_SVR, SVR_ENABLE | vectors::SPURIOUS_VECTOR as u64);
        wrmsr(msr::X2APIC_DIVIDE, TIMER_DIVIDE_BY_16);
        wrmsr(msr::IA32_TSC_AUX, cpu as u64);

        let apic_id = rdmsr(msr::X2APIC_ID) as u32;
        self.apic_ids[cpu].store(apic_id, Ordering::Release);
        self.tss[cpu].store(tss, Ordering::Release);

        log::info!("hal: processor {} registered (x2APIC id {})", cpu, apic_id);
        Ok(())
    }

    /// Signal end of interrupt to the local APIC
    #[inline]
    pub fn end_of_interrupt(&self) {
        wrmsr(msr::X2APIC_EOI, 0);
    }

    fn vector_for(irql: Kirql) -> Option<u8> {
        match irql {
            APC_LEVEL => Some(vectors::APC_VECTOR),
            DISPATCH_LEVEL => Some(vectors::DISPATCH_VECTOR),
            _ => None,
        }
    }
}

impl Hal for X86Hal {
    #[inline]
    fn processor_number(&self) -> usize {
        rdmsr(msr::IA32_TSC_AUX) as usize
    }

    #[inline]
    fn set_irql(&self, irql: Kirql) {
        unsafe {
            asm!("mov cr8, {}", in(reg) irql as u64, options(nomem, nostack, preserves_flags));
        }
    }

    fn request_software_interrupt(&self, processor: usize, irql: Kirql) {
        let Some(vector) = Self::vector_for(irql) else {
            log::warn!("hal: no software interrupt at irql {}", irql);
            return;
        };

        if processor == self.processor_number() {
            wrmsr(msr::X2APIC_SELF_IPI, vector as u64);
            return;
        }

        match self.apic_ids.get(processor) {
            Some(apic_id) => {
                let destination = (apic_id.load(Ordering::Acquire) as u64) << 32;
                wrmsr(msr::X2APIC_ICR, destination | ICR_ASSERT | vector as u64);
            }
            None => log::warn!("hal: software interrupt for unknown processor {}", processor),
        }
    }

    #[inline]
    fn read_cycle_counter(&self) -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    #[inline]
    fn cycles_to_nanoseconds(&self, cycles: u64) -> u64 {
        if self.tsc_hz == 0 {
            return cycles;
        }
        (cycles as u128 * 1_000_000_000 / self.tsc_hz as u128) as u64
    }

    fn arm_oneshot(&self, microseconds: u64) {
        let count = (microseconds as u128 * self.apic_timer_hz as u128 / 1_000_000).clamp(1, u32::MAX as u128);
        // One-shot mode is LVT timer mode 0
        wrmsr(msr::X2APIC_LVT_TIMER, vectors::CLOCK_VECTOR as u64);
        wrmsr(msr::X2APIC_INIT_COUNT, count as u64);
    }

    fn switch_address_space(&self, directory_table_base: u64) {
        let frame = PhysFrame::containing_address(PhysAddr::new(directory_table_base));
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    unsafe fn switch_thread_state(&self, old: &mut ArchThreadState, new: &ArchThreadState) {
        core::arch::x86_64::_fxsave64(old.fx_save.as_mut_ptr());
        core::arch::x86_64::_fxrstor64(new.fx_save.as_ptr());

        if new.kernel_stack_top == 0 {
            return;
        }
        let tss = self
            .tss
            .get(self.processor_number())
            .map_or(ptr::null_mut(), |tss| tss.load(Ordering::Acquire));
        if !tss.is_null() {
            (*tss).privilege_stack_table[0] = VirtAddr::new(new.kernel_stack_top);
        }
    }

    #[inline]
    unsafe fn swap_context(&self, old: &mut ThreadContext, new: &ThreadContext) {
        context::ki_swap_context(old, new);
    }

    unsafe fn init_thread_context(
        &self,
        context: &mut ThreadContext,
        arch: &mut ArchThreadState,
        stack_top: *mut u8,
        entry: ThreadEntry,
    ) {
        // Start from the current FPU state (default control words)
        core::arch::x86_64::_fxsave64(arch.fx_save.as_mut_ptr());
        context::setup_initial_context(context, stack_top, entry);
    }

    unsafe fn copy_to_user(&self, destination: u64, source: &[u8]) -> Result<(), KeError> {
        let end = destination
            .checked_add(source.len() as u64)
            .ok_or(KeError::AccessViolation)?;
        if destination == 0 || end > USER_SPACE_END {
            return Err(KeError::AccessViolation);
        }
        ptr::copy_nonoverlapping(source.as_ptr(), destination as *mut u8, source.len());
        Ok(())
    }

    #[inline]
    fn wait_for_interrupt(&self) {
        x86_64::instructions::hlt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vectors_match_irql_classes() {
        assert_eq!(vectors::APC_VECTOR >> 4, APC_LEVEL);
        assert_eq!(vectors::DISPATCH_VECTOR >> 4, DISPATCH_LEVEL);
        assert_eq!(vectors::CLOCK_VECTOR >> 4, crate::ke::irql::levels::CLOCK_LEVEL);
        assert_eq!(X86Hal::vector_for(APC_LEVEL), Some(vectors::APC_VECTOR));
        assert_eq!(X86Hal::vector_for(5), None);
    }

    #[test]
    fn test_cycles_to_nanoseconds() {
        let hal = X86Hal::new(3_000_000_000, 100_000_000);
        assert_eq!(hal.cycles_to_nanoseconds(3_000), 1_000);
        assert_eq!(hal.cycles_to_nanoseconds(u64::MAX), (u64::MAX as u128 / 3) as u64);
    }

    #[test]
    fn test_copy_to_user_rejects_kernel_addresses() {
        let hal = X86Hal::new(1, 1);
        unsafe {
            assert_eq!(hal.copy_to_user(0xFFFF_8000_0000_0000, &[1]), Err(KeError::AccessViolation));
            assert_eq!(hal.copy_to_user(USER_SPACE_END - 1, &[1, 2]), Err(KeError::AccessViolation));
            assert_eq!(hal.copy_to_user(0, &[1]), Err(KeError::AccessViolation));
        }
    }
}
