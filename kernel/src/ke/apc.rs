//! Asynchronous Procedure Calls (APC)
//!
//! APCs allow code to execute asynchronously in the context of a specific thread.
//! They are queued to a thread and delivered when certain conditions are met.
//!
//! # APC Types
//!
//! - **Kernel APC**: The kernel routine executes at APC_LEVEL in kernel mode
//!   - Special kernel APCs (no normal routine): run even inside critical
//!     regions; queued after earlier special APCs but ahead of normal ones
//!   - Normal kernel APCs: run when the thread is not in a critical region;
//!     the normal routine then runs at PASSIVE_LEVEL
//!
//! - **User APC**: The kernel routine runs in kernel mode, then the normal
//!   routine is redirected to user mode when the thread returns there from an
//!   alertable wait
//!
//! Guarded regions hold off every kernel APC. Kernel APCs are delivered when
//! the thread's IRQL drops to PASSIVE_LEVEL; a kernel APC queued to a thread
//! blocked in a wait at PASSIVE_LEVEL interrupts the wait, which resumes after
//! delivery.
//!
//! # NT Compatibility
//! Equivalent to NT's KAPC / KeInitializeApc / KeInsertQueueApc

use core::cell::UnsafeCell;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use super::bugcheck::{codes, ke_bugcheck_ex};
use super::dispatcher::WaitOutcome;
use super::irql::levels::{APC_LEVEL, PASSIVE_LEVEL};
use super::irql::{DispatchLevel, IrqlToken};
use super::kernel::Kernel;
use super::list::ListEntry;
use super::thread::{KThread, ProcessorMode, ThreadState};
use super::KeError;
use crate::containing_record;

/// Second stage of an APC
#[derive(Debug, Clone, Copy)]
pub enum NormalRoutine {
    /// Kernel routine run at PASSIVE_LEVEL
    Kernel(fn(normal_context: usize, system_argument1: usize, system_argument2: usize)),
    /// User-mode routine address, entered through the user APC dispatcher
    User(u64),
    /// User-mode image entry point, entered through the thread start thunk
    UserThreadStart(u64),
}

/// Parameters handed to an APC's routines
///
/// The kernel routine may rewrite any of them, including clearing the normal
/// routine to cancel the second stage.
#[derive(Debug, Clone, Copy)]
pub struct ApcCall {
    pub normal_routine: Option<NormalRoutine>,
    pub normal_context: usize,
    pub system_argument1: usize,
    pub system_argument2: usize,
}

/// Kernel APC routine signature
///
/// Called at APC_LEVEL when the APC is delivered.
pub type KernelRoutine = fn(apc: *mut KApc, call: &mut ApcCall);

/// Rundown routine signature
///
/// Called if the thread terminates before the APC can be delivered.
pub type RundownRoutine = fn(apc: *mut KApc);

/// Kernel APC object
///
/// Equivalent to NT's KAPC structure
#[repr(C)]
pub struct KApc {
    /// Entry in the thread's APC queue
    apc_list_entry: UnsafeCell<ListEntry>,

    /// Target thread for this APC
    thread: UnsafeCell<*mut KThread>,

    /// Kernel routine (always called first at APC_LEVEL)
    kernel_routine: UnsafeCell<Option<KernelRoutine>>,

    /// Rundown routine (called if thread terminates)
    rundown_routine: UnsafeCell<Option<RundownRoutine>>,

    /// Normal routine (called after kernel routine)
    normal_routine: UnsafeCell<Option<NormalRoutine>>,

    /// Normal context passed to normal routine
    normal_context: UnsafeCell<usize>,

    /// System argument 1
    system_argument1: UnsafeCell<usize>,

    /// System argument 2
    system_argument2: UnsafeCell<usize>,

    /// Queue the APC belongs to
    apc_mode: UnsafeCell<ProcessorMode>,

    /// Whether this APC is currently inserted in a queue (thread lock)
    inserted: AtomicBool,
}

// Safety: queued fields are only touched under the target thread's lock
unsafe impl Sync for KApc {}
unsafe impl Send for KApc {}

impl KApc {
    /// Create a new uninitialized APC
    pub const fn new() -> Self {
        Self {
            apc_list_entry: UnsafeCell::new(ListEntry::new()),
            thread: UnsafeCell::new(ptr::null_mut()),
            kernel_routine: UnsafeCell::new(None),
            rundown_routine: UnsafeCell::new(None),
            normal_routine: UnsafeCell::new(None),
            normal_context: UnsafeCell::new(0),
            system_argument1: UnsafeCell::new(0),
            system_argument2: UnsafeCell::new(0),
            apc_mode: UnsafeCell::new(ProcessorMode::KernelMode),
            inserted: AtomicBool::new(false),
        }
    }

    /// Initialize an APC
    ///
    /// Equivalent to KeInitializeApc. An APC without a normal routine is a
    /// special kernel APC whatever `apc_mode` says. Re-initializing a queued
    /// APC is fatal.
    ///
    /// # Safety
    /// Thread pointer must be valid for the lifetime of this APC
    pub unsafe fn init(
        &self,
        thread: *mut KThread,
        kernel_routine: KernelRoutine,
        rundown_routine: Option<RundownRoutine>,
        normal_routine: Option<NormalRoutine>,
        apc_mode: ProcessorMode,
        normal_context: usize,
    ) {
        if self.is_inserted() {
            ke_bugcheck_ex(codes::INVALID_APC_STATE, self as *const KApc as u64, thread as u64, 0, 0);
        }

        *self.thread.get() = thread;
        *self.kernel_routine.get() = Some(kernel_routine);
        *self.rundown_routine.get() = rundown_routine;
        *self.normal_routine.get() = normal_routine;
        *self.apc_mode.get() = if normal_routine.is_some() {
            apc_mode
        } else {
            ProcessorMode::KernelMode
        };
        *self.normal_context.get() = normal_context;
        (*self.apc_list_entry.get()).init_head();
    }

    /// Check if this APC is currently queued
    #[inline]
    pub fn is_inserted(&self) -> bool {
        self.inserted.load(Ordering::Acquire)
    }

    /// Get the target thread
    #[inline]
    pub fn thread(&self) -> *mut KThread {
        unsafe { *self.thread.get() }
    }

    /// Get the APC mode
    #[inline]
    pub fn apc_mode(&self) -> ProcessorMode {
        unsafe { *self.apc_mode.get() }
    }

    /// Check if this is a special kernel APC (no normal routine)
    #[inline]
    pub fn is_special(&self) -> bool {
        unsafe { (*self.normal_routine.get()).is_none() }
    }

    fn call(&self) -> ApcCall {
        unsafe {
            ApcCall {
                normal_routine: *self.normal_routine.get(),
                normal_context: *self.normal_context.get(),
                system_argument1: *self.system_argument1.get(),
                system_argument2: *self.system_argument2.get(),
            }
        }
    }

    /// Insert this APC into its target thread's queue
    ///
    /// Equivalent to KeInsertQueueApc.
    ///
    /// # Returns
    /// true if queued; false if already queued or the thread is exiting
    ///
    /// # Safety
    /// The APC must stay alive and in place until it has been delivered,
    /// removed or run down.
    pub unsafe fn insert(&self, ke: &Kernel, system_argument1: usize, system_argument2: usize) -> bool {
        let thread = self.thread();
        if thread.is_null() {
            return false;
        }

        let irql = ke.raise_irql::<DispatchLevel>();
        let inserted = {
            let _thread_lock = (*thread).lock.lock_at_dpc_level(&irql);
            let state = &mut (*thread).apc_state;

            if !state.apc_queueable.load(Ordering::Acquire) {
                log::warn!("apc {:p} refused: thread {} is exiting", self, (*thread).thread_id);
                false
            } else if self.is_inserted() {
                false
            } else {
                self.inserted.store(true, Ordering::Release);
                *self.system_argument1.get() = system_argument1;
                *self.system_argument2.get() = system_argument2;

                let mode = self.apc_mode();
                let queue = &mut state.queues[mode as usize];
                let entry = self.apc_list_entry.get();
                if self.is_special() {
                    // Behind the special APCs already queued
                    let head = queue as *mut ListEntry;
                    let mut position = head;
                    for queued in queue.iter() {
                        if !(*containing_record!(queued, KApc, apc_list_entry)).is_special() {
                            position = queued;
                            break;
                        }
                    }
                    queue.insert_before(position, entry);
                } else {
                    queue.insert_tail(entry);
                }

                log::debug!(
                    "apc {:p} queued to thread {} ({:?}, special: {})",
                    self,
                    (*thread).thread_id,
                    mode,
                    self.is_special()
                );

                match mode {
                    ProcessorMode::KernelMode => {
                        state.kernel_apc_pending.store(true, Ordering::Release);
                        ke.signal_kernel_apc(&irql, thread, self.is_special());
                    }
                    ProcessorMode::UserMode => {
                        let wait = &(*thread).wait;
                        if thread != ke.current_thread()
                            && wait.alertable.load(Ordering::Acquire)
                            && wait.mode() == ProcessorMode::UserMode
                            && wait.completion.try_complete(WaitOutcome::UserApc)
                            && ke.unblock_locked(&irql, thread)
                        {
                            state.user_apc_pending.store(true, Ordering::Release);
                        }
                    }
                }
                true
            }
        };
        ke.lower_irql(irql);
        inserted
    }

    /// Remove this APC from its thread's queue
    ///
    /// Equivalent to KeRemoveQueueApc.
    ///
    /// # Returns
    /// true if the APC was removed, false if it wasn't queued
    pub fn remove(&self, ke: &Kernel) -> bool {
        let thread = self.thread();
        if thread.is_null() || !self.is_inserted() {
            return false;
        }

        let irql = ke.raise_irql::<DispatchLevel>();
        let removed = unsafe {
            let _thread_lock = (*thread).lock.lock_at_dpc_level(&irql);
            if self.is_inserted() {
                let now_empty = (*self.apc_list_entry.get()).remove_entry();
                self.inserted.store(false, Ordering::Release);
                if now_empty {
                    let state = &(*thread).apc_state;
                    match self.apc_mode() {
                        ProcessorMode::KernelMode => state.kernel_apc_pending.store(false, Ordering::Release),
                        ProcessorMode::UserMode => state.user_apc_pending.store(false, Ordering::Release),
                    }
                }
                true
            } else {
                false
            }
        };
        ke.lower_irql(irql);
        removed
    }
}

impl Default for KApc {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// APC State in Thread
// ============================================================================

/// APC state stored in each thread
///
/// The queues change only under the thread lock; the flags are readable
/// from anywhere.
#[repr(C)]
pub struct KApcState {
    /// Pending APCs, indexed by ProcessorMode
    pub(crate) queues: [ListEntry; 2],

    /// Kernel APCs queued
    pub(crate) kernel_apc_pending: AtomicBool,

    /// User APC ready for delivery on the way back to user mode
    pub(crate) user_apc_pending: AtomicBool,

    /// The thread is delivering kernel APCs
    pub(crate) kernel_apc_in_progress: AtomicBool,

    /// Cleared once the thread starts exiting
    pub(crate) apc_queueable: AtomicBool,
}

impl KApcState {
    /// Create a new APC state
    pub const fn new() -> Self {
        Self {
            queues: [ListEntry::new(), ListEntry::new()],
            kernel_apc_pending: AtomicBool::new(false),
            user_apc_pending: AtomicBool::new(false),
            kernel_apc_in_progress: AtomicBool::new(false),
            apc_queueable: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn kernel_apc_pending(&self) -> bool {
        self.kernel_apc_pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn user_apc_pending(&self) -> bool {
        self.user_apc_pending.load(Ordering::Acquire)
    }

    /// Check if the queue of `mode` is empty (snapshot)
    #[inline]
    pub fn is_queue_empty(&self, mode: ProcessorMode) -> bool {
        self.queues[mode as usize].is_empty()
    }
}

impl Default for KApcState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// User-mode redirection
// ============================================================================

/// Register state saved on kernel entry from user mode
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct KTrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

bitflags::bitflags! {
    /// Parts of a saved context that are valid
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ContextFlags: u32 {
        /// RIP, CS, RFLAGS, RSP, SS
        const CONTROL = 0x00000001;
        /// General purpose registers
        const INTEGER = 0x00000002;
        /// Segment registers
        const SEGMENTS = 0x00000004;
        /// x87/SSE state
        const FLOATING_POINT = 0x00000008;
    }
}

/// Record pushed on the user stack ahead of a user APC
///
/// The user APC dispatcher restores `context` once the routine returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct UserApcRecord {
    /// `ContextFlags` bits describing `context`
    pub context_flags: u32,
    reserved: u32,
    /// Interrupted user context
    pub context: KTrapFrame,
}

/// Bytes skipped below the interrupted user stack pointer (red zone)
const USER_STACK_RED_ZONE: u64 = 128;

impl UserApcRecord {
    fn new(context: &KTrapFrame) -> Self {
        Self {
            context_flags: (ContextFlags::CONTROL | ContextFlags::INTEGER).bits(),
            reserved: 0,
            context: *context,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) with only u32/u64 fields and no padding
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }
}

/// Redirect a return to user mode into `thunk`, which calls `routine` with
/// the APC's arguments in RCX/RDX/R8/R9 and then restores the saved record
fn redirect_to_user(ke: &Kernel, frame: &mut KTrapFrame, thunk: u64, routine: u64, call: &ApcCall) -> Result<(), KeError> {
    if thunk == 0 {
        log::warn!("user apc dropped: no user-mode dispatcher registered");
        return Err(KeError::InvalidParameter);
    }

    let record = UserApcRecord::new(frame);
    let stack = frame
        .rsp
        .checked_sub(USER_STACK_RED_ZONE + size_of::<UserApcRecord>() as u64)
        .ok_or(KeError::AccessViolation)?
        & !15;

    unsafe { ke.hal().copy_to_user(stack, record.as_bytes())? };

    frame.rsp = stack;
    frame.rip = thunk;
    frame.rcx = routine;
    frame.rdx = call.normal_context as u64;
    frame.r8 = call.system_argument1 as u64;
    frame.r9 = call.system_argument2 as u64;
    Ok(())
}

// ============================================================================
// Delivery
// ============================================================================

impl Kernel {
    /// React to a kernel APC queued to `thread`: interrupt a wait at
    /// PASSIVE_LEVEL, or ask its processor for an APC interrupt
    ///
    /// # Safety
    /// Thread lock held.
    unsafe fn signal_kernel_apc(&self, irql: &IrqlToken<DispatchLevel>, thread: *mut KThread, special: bool) {
        let deliverable = (*thread).special_apc_disable.load(Ordering::Acquire) == 0
            && (special
                || ((*thread).kernel_apc_disable.load(Ordering::Acquire) == 0
                    && !(*thread).apc_state.kernel_apc_in_progress.load(Ordering::Acquire)));

        let wait = &(*thread).wait;
        if deliverable
            && wait.wait_irql.load(Ordering::Acquire) == PASSIVE_LEVEL
            && wait.completion.try_complete(WaitOutcome::KernelApc)
        {
            self.unblock_locked(irql, thread);
        } else if (*thread).state == ThreadState::Running {
            self.hal
                .request_software_interrupt((*thread).processor.load(Ordering::Relaxed), APC_LEVEL);
        }
    }

    /// Deliver what the current thread has pending
    ///
    /// Equivalent to KiDeliverApc. Must be called at PASSIVE_LEVEL. Runs
    /// every deliverable kernel APC in queue order: kernel routine at
    /// APC_LEVEL, then any normal routine at PASSIVE_LEVEL with normal kernel
    /// APCs held off. If `previous_mode` is user mode and nothing held
    /// delivery back, one pending user APC is then set up in `trap_frame`.
    pub fn deliver_apcs(&self, previous_mode: ProcessorMode, trap_frame: Option<&mut KTrapFrame>) -> Result<(), KeError> {
        let thread = self.current_thread();
        if thread.is_null() {
            return Ok(());
        }

        let completed = unsafe { self.deliver_kernel_apcs(thread) };
        if !completed || previous_mode != ProcessorMode::UserMode {
            return Ok(());
        }
        // A critical or guarded region holds the user queue too
        if unsafe { (*thread).are_apcs_disabled() } {
            return Ok(());
        }

        unsafe { self.deliver_user_apc(thread, trap_frame) }
    }

    /// Kernel phase of delivery; false if a disabled region stopped it
    unsafe fn deliver_kernel_apcs(&self, thread: *mut KThread) -> bool {
        let state = &(*thread).apc_state;
        if (*thread).special_apc_disable.load(Ordering::Acquire) != 0
            || state.kernel_apc_in_progress.swap(true, Ordering::AcqRel)
        {
            return false;
        }

        let apc_irql = self.raise_irql_to(APC_LEVEL);
        let mut completed = true;

        loop {
            let irql = self.raise_irql::<DispatchLevel>();
            let next = {
                let _thread_lock = (*thread).lock.lock_at_dpc_level(&irql);
                let queue = &mut (*thread).apc_state.queues[ProcessorMode::KernelMode as usize];
                state.kernel_apc_pending.store(false, Ordering::Release);

                let first = queue.first();
                if first.is_null() {
                    None
                } else {
                    let apc = containing_record!(first, KApc, apc_list_entry);
                    let special = (*apc).is_special();
                    if (special && (*thread).special_apc_disable.load(Ordering::Acquire) != 0)
                        || (!special && (*thread).kernel_apc_disable.load(Ordering::Acquire) != 0)
                    {
                        state.kernel_apc_pending.store(true, Ordering::Release);
                        completed = false;
                        None
                    } else {
                        (*first).remove_entry();
                        (*apc).inserted.store(false, Ordering::Release);
                        state.kernel_apc_pending.store(!queue.is_empty(), Ordering::Release);
                        Some((apc, *(*apc).kernel_routine.get(), (*apc).call()))
                    }
                }
            };
            self.lower_irql(irql);

            let (apc, kernel_routine, mut call) = match next {
                Some(next) => next,
                None => break,
            };

            log::trace!("delivering kernel apc {:p} to thread {}", apc, (*thread).thread_id);
            if let Some(kernel_routine) = kernel_routine {
                kernel_routine(apc, &mut call);
            }

            if let Some(NormalRoutine::Kernel(normal)) = call.normal_routine {
                (*thread).kernel_apc_disable.fetch_add(1, Ordering::AcqRel);
                self.lower_irql_to(PASSIVE_LEVEL);
                normal(call.normal_context, call.system_argument1, call.system_argument2);
                self.raise_irql_to(APC_LEVEL);
                (*thread).kernel_apc_disable.fetch_sub(1, Ordering::AcqRel);
            }
        }

        // Still marked in progress, so this lower does not re-enter
        self.lower_irql_to(apc_irql);
        state.kernel_apc_in_progress.store(false, Ordering::Release);
        completed
    }

    /// User phase of delivery: redirect the return to user mode into the
    /// first queued user APC
    unsafe fn deliver_user_apc(&self, thread: *mut KThread, trap_frame: Option<&mut KTrapFrame>) -> Result<(), KeError> {
        let state = &(*thread).apc_state;
        if !state.user_apc_pending() {
            return Ok(());
        }

        let frame = match trap_frame {
            Some(frame) => frame,
            None => ke_bugcheck_ex(codes::NO_USER_MODE_CONTEXT, thread as u64, 0, 0, 0),
        };

        let irql = self.raise_irql::<DispatchLevel>();
        let next = {
            let _thread_lock = (*thread).lock.lock_at_dpc_level(&irql);
            state.user_apc_pending.store(false, Ordering::Release);
            let queue = &mut (*thread).apc_state.queues[ProcessorMode::UserMode as usize];
            let first = queue.first();
            if first.is_null() {
                None
            } else {
                let apc = containing_record!(first, KApc, apc_list_entry);
                (*first).remove_entry();
                (*apc).inserted.store(false, Ordering::Release);
                Some((apc, *(*apc).kernel_routine.get(), (*apc).call()))
            }
        };
        self.lower_irql(irql);

        let (apc, kernel_routine, mut call) = match next {
            Some(next) => next,
            None => return Ok(()),
        };

        let apc_irql = self.raise_irql_to(APC_LEVEL);
        if let Some(kernel_routine) = kernel_routine {
            kernel_routine(apc, &mut call);
        }
        self.lower_irql_to(apc_irql);

        log::debug!("user apc {:p} redirected for thread {}", apc, (*thread).thread_id);
        match call.normal_routine {
            Some(NormalRoutine::User(routine)) => {
                redirect_to_user(self, frame, self.user_apc_dispatcher(), routine, &call)
            }
            Some(NormalRoutine::UserThreadStart(entry)) => {
                redirect_to_user(self, frame, self.user_thread_start(), entry, &call)
            }
            Some(NormalRoutine::Kernel(_)) => {
                log::warn!("user apc {:p} carries a kernel normal routine", apc);
                Err(KeError::InvalidParameter)
            }
            None => Ok(()),
        }
    }

    /// Deliver kernel APCs on the way down to PASSIVE_LEVEL
    ///
    /// Called by the IRQL lowering path.
    pub(crate) fn check_kernel_apc_delivery(&self) {
        let thread = self.current_thread();
        if thread.is_null() {
            return;
        }

        let deliver = unsafe {
            let state = &(*thread).apc_state;
            state.kernel_apc_pending()
                && !state.kernel_apc_in_progress.load(Ordering::Acquire)
                && (*thread).special_apc_disable.load(Ordering::Acquire) == 0
        };
        if deliver {
            unsafe { self.deliver_kernel_apcs(thread) };
        }
    }

    /// APC_LEVEL software interrupt entry point
    ///
    /// `previous_mode` and `trap_frame` describe the interrupted context. If
    /// the interrupted code ran above PASSIVE_LEVEL, delivery waits for it to
    /// lower.
    pub fn apc_interrupt(&self, previous_mode: ProcessorMode, trap_frame: Option<&mut KTrapFrame>) -> Result<(), KeError> {
        if self.current_irql() != PASSIVE_LEVEL {
            return Ok(());
        }
        self.deliver_apcs(previous_mode, trap_frame)
    }

    /// Hold off normal kernel APCs for the current thread
    ///
    /// Equivalent to KeEnterCriticalRegion
    pub fn enter_critical_region(&self) {
        let thread = self.current_thread();
        unsafe { (*thread).kernel_apc_disable.fetch_add(1, Ordering::AcqRel) };
    }

    /// Leave a critical region, delivering APCs it held off
    ///
    /// Equivalent to KeLeaveCriticalRegion. Leaving more regions than were
    /// entered is fatal.
    pub fn leave_critical_region(&self) {
        let thread = self.current_thread();
        let previous = unsafe { (*thread).kernel_apc_disable.fetch_sub(1, Ordering::AcqRel) };
        if previous <= 0 {
            ke_bugcheck_ex(codes::APC_INDEX_MISMATCH, thread as u64, previous as u64, 0, 0);
        }
        if previous == 1 && self.current_irql() == PASSIVE_LEVEL {
            self.check_kernel_apc_delivery();
        }
    }

    /// Hold off every kernel APC for the current thread
    ///
    /// Equivalent to KeEnterGuardedRegion
    pub fn enter_guarded_region(&self) {
        let thread = self.current_thread();
        unsafe { (*thread).special_apc_disable.fetch_add(1, Ordering::AcqRel) };
    }

    /// Leave a guarded region
    ///
    /// Equivalent to KeLeaveGuardedRegion
    pub fn leave_guarded_region(&self) {
        let thread = self.current_thread();
        let previous = unsafe { (*thread).special_apc_disable.fetch_sub(1, Ordering::AcqRel) };
        if previous <= 0 {
            ke_bugcheck_ex(codes::APC_INDEX_MISMATCH, thread as u64, previous as u64, 1, 0);
        }
        if previous == 1 && self.current_irql() == PASSIVE_LEVEL {
            self.check_kernel_apc_delivery();
        }
    }

    /// Close a thread's APC queues and run down what is still queued
    ///
    /// Equivalent to KeFlushQueueApc at thread exit. Each queued APC's
    /// rundown routine is called, if it has one.
    ///
    /// # Safety
    /// The thread must be live.
    pub(crate) unsafe fn rundown_apcs(&self, thread: *mut KThread) {
        let state = &(*thread).apc_state;
        let mut flushed = 0usize;

        loop {
            let irql = self.raise_irql::<DispatchLevel>();
            let next = {
                let _thread_lock = (*thread).lock.lock_at_dpc_level(&irql);
                state.apc_queueable.store(false, Ordering::Release);

                let first = state
                    .queues
                    .iter()
                    .map(|queue| queue.first())
                    .find(|entry| !entry.is_null())
                    .unwrap_or(ptr::null_mut());
                if first.is_null() {
                    state.kernel_apc_pending.store(false, Ordering::Release);
                    state.user_apc_pending.store(false, Ordering::Release);
                    None
                } else {
                    let apc = containing_record!(first, KApc, apc_list_entry);
                    (*first).remove_entry();
                    (*apc).inserted.store(false, Ordering::Release);
                    Some((apc, *(*apc).rundown_routine.get()))
                }
            };
            self.lower_irql(irql);

            match next {
                Some((apc, rundown)) => {
                    flushed += 1;
                    if let Some(rundown) = rundown {
                        rundown(apc);
                    }
                }
                None => break,
            }
        }

        if flushed != 0 {
            log::debug!("ran down {} apc(s) of thread {}", flushed, (*thread).thread_id);
        }
    }
}
