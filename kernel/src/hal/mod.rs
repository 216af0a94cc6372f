//! Hardware Abstraction Layer (hal)
//!
//! The executive core never touches hardware directly. Everything it needs
//! from the machine goes through the [`Hal`] trait:
//!
//! - **Interrupts**: programming the per-processor interrupt mask for an IRQL
//!   and requesting software interrupts (APC_LEVEL, DISPATCH_LEVEL), locally
//!   or on another processor
//! - **Timers**: the cycle counter, its conversion to nanoseconds, and the
//!   one-shot quantum timer
//! - **Context**: the raw register/stack swap, FPU and kernel-stack
//!   bookkeeping around it, and address-space switching
//! - **User memory**: faulting-safe copies to user addresses
//!
//! The x86_64 implementation lives in `arch::x86_64`; unit tests run against
//! the simulated machine in [`sim`].

#[cfg(test)]
pub mod sim;

use crate::ke::irql::Kirql;
use crate::ke::KeError;

/// Entry point a fresh thread's first context switch lands in
pub type ThreadEntry = extern "C" fn() -> !;

/// Saved register context of a thread that is not running
///
/// The callee-saved registers live on the thread's own kernel stack; only
/// the stack pointer is kept here.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ThreadContext {
    pub stack_pointer: u64,
}

/// Extended per-thread machine state switched alongside the registers
#[repr(C, align(16))]
pub struct ArchThreadState {
    /// FXSAVE area (x87/SSE state)
    pub fx_save: [u8; 512],
    /// Top of the thread's kernel stack (loaded into TSS.RSP0)
    pub kernel_stack_top: u64,
}

impl ArchThreadState {
    pub const fn new() -> Self {
        Self {
            fx_save: [0; 512],
            kernel_stack_top: 0,
        }
    }
}

/// Machine services consumed by the executive core
pub trait Hal: Sync {
    /// Index of the executing processor
    fn processor_number(&self) -> usize;

    /// Program the interrupt mask for an IRQL on the executing processor
    fn set_irql(&self, irql: Kirql);

    /// Request a software interrupt at `irql` (APC_LEVEL or DISPATCH_LEVEL)
    /// on processor `processor`
    fn request_software_interrupt(&self, processor: usize, irql: Kirql);

    /// Free-running cycle counter
    fn read_cycle_counter(&self) -> u64;

    /// Convert a cycle count to nanoseconds
    fn cycles_to_nanoseconds(&self, cycles: u64) -> u64;

    /// Arm the per-processor one-shot timer
    fn arm_oneshot(&self, microseconds: u64);

    /// Load a new address space
    fn switch_address_space(&self, directory_table_base: u64);

    /// Swap FPU state and point the kernel-entry stack at the new thread
    ///
    /// # Safety
    /// Called with the processor at DISPATCH_LEVEL right before
    /// [`Hal::swap_context`].
    unsafe fn switch_thread_state(&self, old: &mut ArchThreadState, new: &ArchThreadState);

    /// Save the current register context into `old` and resume `new`
    ///
    /// Returns when some later switch resumes `old`.
    ///
    /// # Safety
    /// `new` must hold a context saved by an earlier swap or built by
    /// [`Hal::init_thread_context`], and its stack must still be alive.
    unsafe fn swap_context(&self, old: &mut ThreadContext, new: &ThreadContext);

    /// Build the initial context of a thread so that its first resume enters
    /// `entry` on `stack_top`
    ///
    /// # Safety
    /// `stack_top` must be the 16-byte aligned end of a writable stack.
    unsafe fn init_thread_context(
        &self,
        context: &mut ThreadContext,
        arch: &mut ArchThreadState,
        stack_top: *mut u8,
        entry: ThreadEntry,
    );

    /// Copy bytes to a user-mode address
    ///
    /// # Safety
    /// The current address space must be the one `destination` belongs to.
    unsafe fn copy_to_user(&self, destination: u64, source: &[u8]) -> Result<(), KeError>;

    /// Halt until the next interrupt
    #[inline]
    fn wait_for_interrupt(&self) {
        core::hint::spin_loop();
    }

    /// Monotonic time in nanoseconds
    #[inline]
    fn now_ns(&self) -> u64 {
        self.cycles_to_nanoseconds(self.read_cycle_counter())
    }
}
