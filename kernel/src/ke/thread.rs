//! Kernel Thread (KTHREAD) implementation
//!
//! KTHREAD is the kernel's representation of a thread. It contains:
//! - Scheduling state (priority level, quantum, state)
//! - Saved register context and the kernel stack it lives on
//! - List entries for the ready queue / sleep list and the process thread list
//! - Wait bookkeeping and the APC queues
//! - The owning process
//!
//! Threads are heap allocated and never move; every other structure refers
//! to them by raw pointer. Fields are guarded as follows:
//!
//! - `state`, `wait_list_entry`, `level`: the dispatcher database lock
//! - APC queues and the alert flags: the thread lock
//! - `thread_list_entry`: the owning process's lock
//! - everything atomic: lock-free, read from other processors

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::sync::Arc;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use super::apc::KApcState;
use super::dispatcher::{KWaitBlock, WaitCompletion};
use super::kernel::Kernel;
use super::irql::Kirql;
use super::list::ListEntry;
use super::process::{priority_level, KProcess, ThreadPriority};
use super::spinlock::KSpinLock;
use super::KeError;
use crate::hal::{ArchThreadState, ThreadContext};

/// Thread states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread is initialized but not yet started
    Initialized,
    /// Thread is in a ready queue waiting to run
    Ready,
    /// Thread is currently running on a processor
    Running,
    /// Thread is blocked until another party unblocks it
    Waiting,
    /// Thread is on the sleep list until `wake_time` (nanoseconds) or an
    /// earlier unblock
    Sleeping { wake_time: u64 },
    /// Thread has terminated
    Terminated,
}

/// Processor mode a wait or APC belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ProcessorMode {
    KernelMode = 0,
    UserMode = 1,
}

impl ProcessorMode {
    pub(crate) fn from_raw(raw: u8) -> Self {
        if raw == ProcessorMode::UserMode as u8 {
            ProcessorMode::UserMode
        } else {
            ProcessorMode::KernelMode
        }
    }
}

/// Routine a kernel thread starts in
pub type ThreadStartRoutine = fn(usize);

/// Parameters of the wait the thread is currently in
pub(crate) struct KWaitState {
    /// Outcome slot claimed by exactly one waking party
    pub(crate) completion: WaitCompletion,
    /// Wait may be interrupted by alerts and user APCs
    pub(crate) alertable: AtomicBool,
    /// ProcessorMode of the wait
    pub(crate) mode: AtomicU8,
    /// IRQL the waiter came from
    pub(crate) wait_irql: AtomicU8,
    /// Wait blocks registered for the current wait (debugging)
    pub(crate) block_list: *mut KWaitBlock,
    pub(crate) block_count: usize,
}

impl KWaitState {
    const fn new() -> Self {
        Self {
            completion: WaitCompletion::new(),
            alertable: AtomicBool::new(false),
            mode: AtomicU8::new(ProcessorMode::KernelMode as u8),
            wait_irql: AtomicU8::new(0),
            block_list: ptr::null_mut(),
            block_count: 0,
        }
    }

    pub(crate) fn mode(&self) -> ProcessorMode {
        ProcessorMode::from_raw(self.mode.load(Ordering::Acquire))
    }
}

/// Kernel Thread structure
///
/// This is modeled after Windows NT's KTHREAD structure.
#[repr(C)]
pub struct KThread {
    // List entries for queue membership
    /// Entry in a ready queue or the sleep list
    pub(crate) wait_list_entry: ListEntry,
    /// Entry in process's thread list
    pub(crate) thread_list_entry: ListEntry,

    /// Thread lock (APC queues, alert state)
    pub(crate) lock: KSpinLock,

    // Identity
    pub(crate) thread_id: u32,
    pub(crate) name: &'static str,
    pub(crate) process: Arc<KProcess>,

    // Scheduling fields
    /// Current thread state
    pub(crate) state: ThreadState,
    /// Priority relative to the process class
    pub(crate) priority: ThreadPriority,
    /// Run-queue level (1-31, higher = more important)
    pub(crate) level: u8,
    /// Cycles left in the current quantum
    pub(crate) quantum: AtomicU64,
    /// Total cycles charged to the thread
    pub(crate) cycle_time: AtomicU64,
    /// Processor the thread last ran on
    pub(crate) processor: AtomicUsize,
    /// Set by an unblock that found the thread still running: the next
    /// block returns immediately
    pub(crate) dont_block: AtomicBool,
    /// Registers not yet saved by the switch away from this thread
    pub(crate) swap_busy: AtomicBool,

    // Context
    /// Saved register context for context switch
    pub(crate) context: ThreadContext,
    /// FPU and kernel-stack state
    pub(crate) arch_state: ArchThreadState,
    /// IRQL to restore once the thread resumes from a switch
    pub(crate) saved_irql: Kirql,

    // Stack
    /// Lowest address of the kernel stack (null for an adopted boot thread)
    pub(crate) stack_base: *mut u8,
    pub(crate) stack_size: usize,

    // Thread routine
    pub(crate) start_routine: Option<ThreadStartRoutine>,
    pub(crate) start_context: usize,

    // Wait support
    pub(crate) wait: KWaitState,
    /// Built-in wait blocks for waits on up to THREAD_WAIT_BLOCKS objects
    pub(crate) wait_blocks: [KWaitBlock; super::dispatcher::THREAD_WAIT_BLOCKS],
    /// Pending alert per processor mode
    pub(crate) alerted: [AtomicBool; 2],

    // APC support
    /// APC queues and delivery flags
    pub(crate) apc_state: KApcState,
    /// Normal kernel APCs held off while non-zero (critical regions)
    pub(crate) kernel_apc_disable: AtomicI32,
    /// All kernel APCs held off while non-zero (guarded regions)
    pub(crate) special_apc_disable: AtomicI32,

    /// Kernel mutexes currently owned
    pub(crate) owned_mutexes: AtomicU32,
}

// Threads are shared between processors by raw pointer; their fields are
// protected as described in the module documentation
unsafe impl Send for KThread {}
unsafe impl Sync for KThread {}

impl KThread {
    fn new(
        thread_id: u32,
        name: &'static str,
        process: Arc<KProcess>,
        priority: ThreadPriority,
        quantum: u64,
    ) -> Self {
        let level = priority_level(process.priority_class(), priority);
        Self {
            wait_list_entry: ListEntry::new(),
            thread_list_entry: ListEntry::new(),
            lock: KSpinLock::new(()),
            thread_id,
            name,
            process,
            state: ThreadState::Initialized,
            priority,
            level,
            quantum: AtomicU64::new(quantum),
            cycle_time: AtomicU64::new(0),
            processor: AtomicUsize::new(0),
            dont_block: AtomicBool::new(false),
            swap_busy: AtomicBool::new(false),
            context: ThreadContext::default(),
            arch_state: ArchThreadState::new(),
            saved_irql: 0,
            stack_base: ptr::null_mut(),
            stack_size: 0,
            start_routine: None,
            start_context: 0,
            wait: KWaitState::new(),
            wait_blocks: [KWaitBlock::new(); super::dispatcher::THREAD_WAIT_BLOCKS],
            alerted: [AtomicBool::new(false), AtomicBool::new(false)],
            apc_state: KApcState::new(),
            kernel_apc_disable: AtomicI32::new(0),
            special_apc_disable: AtomicI32::new(0),
            owned_mutexes: AtomicU32::new(0),
        }
    }

    /// Allocate and initialize a thread object, linking it into its process
    fn allocate(
        ke: &Kernel,
        process: &Arc<KProcess>,
        name: &'static str,
        priority: ThreadPriority,
    ) -> Result<*mut KThread, KeError> {
        let layout = Layout::new::<KThread>();
        // SAFETY: KThread is not zero-sized
        let thread = unsafe { alloc(layout) } as *mut KThread;
        if thread.is_null() {
            log::warn!("thread allocation failed for {}", name);
            return Err(KeError::InsufficientResources);
        }

        let thread_id = ke.allocate_thread_id();
        unsafe {
            ptr::write(
                thread,
                KThread::new(thread_id, name, process.clone(), priority, ke.config().quantum_cycles),
            );

            let mut list = process.threads.lock(ke);
            list.head.insert_tail(&mut (*thread).thread_list_entry);
            list.count += 1;
        }
        process.thread_created();

        Ok(thread)
    }

    /// Create a kernel thread that will start in `start_routine(start_context)`
    ///
    /// The thread is left Initialized; [`Kernel::ready_thread`] makes it
    /// runnable. Allocation failure of either the thread object or its stack
    /// yields `InsufficientResources`.
    pub fn create(
        ke: &Kernel,
        process: &Arc<KProcess>,
        name: &'static str,
        priority: ThreadPriority,
        start_routine: ThreadStartRoutine,
        start_context: usize,
    ) -> Result<*mut KThread, KeError> {
        let stack_size = ke.config().kernel_stack_size;
        let stack_layout =
            Layout::from_size_align(stack_size, 16).map_err(|_| KeError::InvalidParameter)?;
        if stack_size == 0 {
            return Err(KeError::InvalidParameter);
        }

        // SAFETY: non-zero size checked above
        let stack = unsafe { alloc(stack_layout) };
        if stack.is_null() {
            log::warn!("kernel stack allocation failed for {}", name);
            return Err(KeError::InsufficientResources);
        }

        let thread = match Self::allocate(ke, process, name, priority) {
            Ok(thread) => thread,
            Err(e) => {
                unsafe { dealloc(stack, stack_layout) };
                return Err(e);
            }
        };

        unsafe {
            let t = &mut *thread;
            t.stack_base = stack;
            t.stack_size = stack_size;
            t.start_routine = Some(start_routine);
            t.start_context = start_context;

            let stack_top = stack.add(stack_size);
            t.arch_state.kernel_stack_top = stack_top as u64;
            ke.hal().init_thread_context(&mut t.context, &mut t.arch_state, stack_top, thread_startup);
        }

        log::debug!("thread {} ({}) created at level {}", unsafe { (*thread).thread_id }, name, unsafe {
            (*thread).level
        });
        Ok(thread)
    }

    /// Wrap the code that is already executing (the boot path of a processor)
    /// in a thread object, so it can block and be switched away from like any
    /// other thread
    pub fn adopt_current(
        ke: &Kernel,
        process: &Arc<KProcess>,
        name: &'static str,
        priority: ThreadPriority,
    ) -> Result<*mut KThread, KeError> {
        Self::allocate(ke, process, name, priority)
    }

    /// Free a thread object and its stack
    ///
    /// # Safety
    /// The thread must be Initialized or Terminated, must not be the current
    /// thread of any processor, and no pointer to it may be used afterwards.
    pub unsafe fn destroy(ke: &Kernel, thread: *mut KThread) {
        let t = &mut *thread;
        if t.thread_list_entry.is_linked() {
            let mut list = t.process.threads.lock(ke);
            t.thread_list_entry.remove_entry();
            list.count -= 1;
            drop(list);
            t.process.thread_exited();
        }

        let stack = t.stack_base;
        let stack_size = t.stack_size;
        ptr::drop_in_place(thread);
        dealloc(thread as *mut u8, Layout::new::<KThread>());

        if !stack.is_null() {
            dealloc(stack, Layout::from_size_align_unchecked(stack_size, 16));
        }
    }

    /// Unique thread identifier
    #[inline]
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current thread state (a snapshot unless the dispatcher lock is held)
    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Run-queue level
    #[inline]
    pub fn priority_level(&self) -> u8 {
        self.level
    }

    /// Owning process
    #[inline]
    pub fn process(&self) -> &Arc<KProcess> {
        &self.process
    }

    /// Cycles charged to the thread so far
    #[inline]
    pub fn cycle_time(&self) -> u64 {
        self.cycle_time.load(Ordering::Relaxed)
    }

    /// Pending alert for `mode`
    #[inline]
    pub fn is_alerted(&self, mode: ProcessorMode) -> bool {
        self.alerted[mode as usize].load(Ordering::Acquire)
    }

    /// Current thread is inside a critical or guarded region
    #[inline]
    pub fn are_apcs_disabled(&self) -> bool {
        self.kernel_apc_disable.load(Ordering::Acquire) != 0
            || self.special_apc_disable.load(Ordering::Acquire) != 0
    }
}

/// First code a new thread runs, entered from its first context switch
///
/// The switch leaves the processor at DISPATCH_LEVEL; the thread drops to
/// PASSIVE_LEVEL, runs its start routine and terminates.
extern "C" fn thread_startup() -> ! {
    let ke = super::kernel();
    // SAFETY: entered straight from a context switch
    unsafe { ke.finish_switch() };
    let thread = ke.current_thread();

    ke.lower_irql_to(super::irql::levels::PASSIVE_LEVEL);

    // SAFETY: the current thread stays alive while it runs
    let (routine, context) = unsafe { ((*thread).start_routine, (*thread).start_context) };
    if let Some(routine) = routine {
        routine(context);
    }

    ke.terminate_current_thread()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::TestSystem;
    use crate::ke::process::PriorityClass;

    fn noop(_: usize) {}

    #[test]
    fn test_create_links_into_process() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let process = Arc::new(KProcess::new(8, 0x5000, PriorityClass::High));

        let thread = KThread::create(ke, &process, "worker", ThreadPriority::AboveNormal, noop, 0).unwrap();
        unsafe {
            assert_eq!((*thread).state(), ThreadState::Initialized);
            assert_eq!((*thread).priority_level(), 14);
            assert_eq!((*thread).name(), "worker");
            assert!(!(*thread).stack_base.is_null());
            assert_eq!(process.active_threads(), 1);
            assert_eq!(process.threads.lock(ke).count, 1);

            KThread::destroy(ke, thread);
        }
        assert_eq!(process.active_threads(), 0);
        assert!(process.threads.lock(ke).head.is_empty());
    }

    #[test]
    fn test_thread_ids_are_unique() {
        let sys = TestSystem::new(1);
        let a = sys.spawn("a", ThreadPriority::Normal);
        let b = sys.spawn("b", ThreadPriority::Normal);
        unsafe {
            assert_ne!((*a).thread_id(), (*b).thread_id());
        }
    }

    #[test]
    fn test_zero_stack_size_is_rejected() {
        let sys = TestSystem::new(1);
        let config = crate::ke::KernelConfig {
            kernel_stack_size: 0,
            ..TestSystem::config(1)
        };
        let ke = Kernel::new(sys.hal, config);
        let result = KThread::create(&ke, &sys.process, "bad", ThreadPriority::Normal, noop, 0);
        assert_eq!(result.err(), Some(KeError::InvalidParameter));
    }
}
