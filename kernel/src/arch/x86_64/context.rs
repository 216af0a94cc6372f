//! Context switching implementation for x86_64
//!
//! Provides low-level context switch routines that save and restore
//! CPU register state between threads.
//!
//! The x86_64 ABI requires preserving: RBX, RBP, R12-R15
//! We also save/restore RFLAGS and RSP (via stack manipulation)

use core::arch::naked_asm;
use core::mem::offset_of;

use crate::hal::{ThreadContext, ThreadEntry};

/// Offset of the saved stack pointer in ThreadContext
const CONTEXT_STACK_POINTER_OFFSET: usize = offset_of!(ThreadContext, stack_pointer);

/// Initial RFLAGS of a new thread (IF set, reserved bit 1)
const INITIAL_RFLAGS: u64 = 0x202;

/// Swap context from old thread to new thread
///
/// Saves callee-saved registers of old thread and restores new thread's registers.
/// Returns when the old thread is resumed.
///
/// # Safety
/// - Both context pointers must be valid
/// - New context must hold a stack prepared by an earlier swap or by
///   [`setup_initial_context`]
#[unsafe(naked)]
pub unsafe extern "C" fn ki_swap_context(_old: *mut ThreadContext, _new: *const ThreadContext) {
    naked_asm!(
        // Save callee-saved registers on old thread's stack
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "pushfq",

        // old context is in rdi
        "mov [rdi + {stack_offset}], rsp",

        // new context is in rsi
        "mov rsp, [rsi + {stack_offset}]",

        // Restore callee-saved registers from new thread's stack
        "popfq",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",

        // Return to new thread (rip is on stack from its own call, or the
        // entry point planted by setup_initial_context)
        "ret",
        stack_offset = const CONTEXT_STACK_POINTER_OFFSET,
    )
}

/// Set up a thread's initial stack for first context switch
///
/// Prepares the stack so that [`ki_swap_context`] will enter `entry` as if
/// it had been called.
///
/// # Safety
/// - stack_top must be the 16-byte aligned top (highest address) of a
///   writable stack with room for the frame
pub unsafe fn setup_initial_context(context: &mut ThreadContext, stack_top: *mut u8, entry: ThreadEntry) {
    // Stack layout (growing downward from stack_top):
    // [stack_top]
    //   - fake return address of entry  <- keeps the call ABI alignment
    //   - return address (entry)
    //   - rbx, rbp, r12, r13, r14, r15
    //   - rflags
    // [stack_pointer points here]
    let mut sp = stack_top as *mut u64;

    sp = sp.sub(1);
    sp.write(0);

    sp = sp.sub(1);
    sp.write(entry as usize as u64);

    for _ in 0..6 {
        sp = sp.sub(1);
        sp.write(0);
    }

    sp = sp.sub(1);
    sp.write(INITIAL_RFLAGS);

    context.stack_pointer = sp as u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn entry() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    #[test]
    fn test_initial_frame_layout() {
        #[repr(C, align(16))]
        struct Stack([u64; 32]);
        let mut stack = Stack([0xAA; 32]);
        let top = unsafe { (stack.0.as_mut_ptr() as *mut u8).add(core::mem::size_of::<Stack>()) };
        let mut context = ThreadContext::default();

        unsafe { setup_initial_context(&mut context, top, entry) };

        // rflags + 6 registers + entry + fake return address
        assert_eq!(context.stack_pointer, top as u64 - 9 * 8);
        let frame = &stack.0[32 - 9..];
        assert_eq!(frame[0], INITIAL_RFLAGS);
        assert!(frame[1..7].iter().all(|&reg| reg == 0));
        assert_eq!(frame[7], entry as usize as u64);
        assert_eq!(frame[8], 0);
        // Entry sees rsp = 8 mod 16, as after a call
        assert_eq!((top as u64 - 8) % 16, 8);
    }
}
