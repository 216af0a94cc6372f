//! Kernel Instance
//!
//! [`Kernel`] ties the executive together: the HAL it drives, the boot-time
//! configuration, one PRCB per processor and the dispatcher database that
//! every processor schedules from.
//!
//! # Boot Sequence
//!
//! 1. The boot path builds the HAL and registers the instance with
//!    [`initialize`]
//! 2. Each processor wraps the code it is running in a thread object
//!    ([`KThread::adopt_current`]), creates its idle thread and calls
//!    [`Kernel::start_processor`]
//! 3. Interrupt glue reaches the instance through [`kernel`]

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Once;

use super::bugcheck::{codes, ke_bugcheck_ex};
use super::irql::{DispatchLevel, IrqlToken, SynchLevel};
use super::prcb::{KPrcb, PerCpu};
use super::process::{KProcess, ThreadPriority};
use super::scheduler::DispatcherDatabase;
use super::spinlock::SpinLock;
use super::thread::{KThread, ThreadStartRoutine, ThreadState};
use super::KeError;
use crate::hal::Hal;

/// Boot-time tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of processors that will be started
    pub processor_count: usize,
    /// Quantum length in cycle-counter ticks
    pub quantum_cycles: u64,
    /// One-shot timer interval re-armed at every quantum end
    pub quantum_timer_us: u64,
    /// Kernel stack size for created threads
    pub kernel_stack_size: usize,
}

impl KernelConfig {
    /// Default configuration: one processor, roughly 20ms quanta at 3GHz
    pub const fn new() -> Self {
        Self {
            processor_count: 1,
            quantum_cycles: 60_000_000,
            quantum_timer_us: 20_000,
            kernel_stack_size: 16384,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel executive instance
pub struct Kernel {
    pub(crate) hal: &'static dyn Hal,
    config: KernelConfig,
    /// Per-processor control blocks
    pub(crate) prcbs: PerCpu<KPrcb>,
    /// Ready queues and sleep list, shared by every processor
    pub(crate) dispatcher: SpinLock<DispatcherDatabase>,
    /// Earliest wake time on the sleep list (u64::MAX when empty)
    pub(crate) next_wake_time: AtomicU64,
    next_thread_id: AtomicU32,
    /// User-mode APC dispatch thunk
    user_apc_dispatcher: AtomicU64,
    /// User-mode thread start thunk
    user_thread_start: AtomicU64,
}

impl Kernel {
    /// Build a kernel instance over `hal`
    ///
    /// No processor is running yet; see [`Kernel::start_processor`].
    pub fn new(hal: &'static dyn Hal, config: KernelConfig) -> Self {
        let processors = config.processor_count.max(1);
        Self {
            hal,
            config: KernelConfig {
                processor_count: processors,
                ..config
            },
            prcbs: PerCpu::new(processors, KPrcb::new),
            dispatcher: SpinLock::new(DispatcherDatabase::new()),
            next_wake_time: AtomicU64::new(u64::MAX),
            next_thread_id: AtomicU32::new(1),
            user_apc_dispatcher: AtomicU64::new(0),
            user_thread_start: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn hal(&self) -> &'static dyn Hal {
        self.hal
    }

    #[inline]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// PRCB of the executing processor
    ///
    /// The token proves preemption is off, so the processor cannot change
    /// while the PRCB is in use.
    #[inline]
    pub(crate) fn current_prcb<L: SynchLevel>(&self, _irql: &IrqlToken<L>) -> &KPrcb {
        // SAFETY: at or above DISPATCH_LEVEL the caller stays on this processor
        unsafe { self.current_prcb_unchecked() }
    }

    /// PRCB of the executing processor, without proof that the caller stays
    /// on it
    ///
    /// An unknown processor number is fatal.
    ///
    /// # Safety
    /// Only for the fields the executing thread owns whichever processor it
    /// is on: the IRQL bookkeeping done inside raise/lower and interrupt
    /// entry, and the current-thread slot read by [`Kernel::current_thread`].
    #[inline]
    pub(crate) unsafe fn current_prcb_unchecked(&self) -> &KPrcb {
        let cpu = self.hal.processor_number();
        match self.prcbs.get(cpu) {
            Some(prcb) => prcb,
            None => ke_bugcheck_ex(
                codes::INVALID_DATA_ACCESS_TRAP,
                cpu as u64,
                self.prcbs.len() as u64,
                0,
                0,
            ),
        }
    }

    /// PRCB of processor `cpu`
    #[inline]
    pub fn prcb(&self, cpu: usize) -> Option<&KPrcb> {
        self.prcbs.get(cpu)
    }

    /// Number of configured processors
    #[inline]
    pub fn processor_count(&self) -> usize {
        self.prcbs.len()
    }

    /// Index of the executing processor
    ///
    /// Below DISPATCH_LEVEL the answer may be stale by the time it is used.
    #[inline]
    pub fn current_processor(&self) -> usize {
        unsafe { self.current_prcb_unchecked() }.number()
    }

    /// Thread running on the executing processor
    #[inline]
    pub fn current_thread(&self) -> *mut KThread {
        // SAFETY: the slot names the caller on whichever processor runs it
        unsafe { self.current_prcb_unchecked() }.current_thread()
    }

    pub(crate) fn allocate_thread_id(&self) -> u32 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Bring processor `cpu` under scheduler control
    ///
    /// `initial` is the thread object wrapping the code already running on
    /// the processor; it becomes the Running thread. `idle` runs whenever
    /// nothing is ready. Passing the same thread for both starts the
    /// processor in its idle loop.
    ///
    /// # Safety
    /// Must run once per processor, on that processor, before it schedules.
    /// Both threads must be live and not queued anywhere.
    pub unsafe fn start_processor(&self, cpu: usize, idle: *mut KThread, initial: *mut KThread) {
        let prcb = match self.prcbs.get(cpu) {
            Some(prcb) => prcb,
            None => ke_bugcheck_ex(codes::INVALID_DATA_ACCESS_TRAP, cpu as u64, self.prcbs.len() as u64, 0, 0),
        };

        let irql = self.raise_irql::<DispatchLevel>();
        {
            let _database = self.dispatcher.lock_at_dpc_level(&irql);
            (*idle).processor.store(cpu, Ordering::Relaxed);
            (*idle).state = ThreadState::Ready;
            (*initial).processor.store(cpu, Ordering::Relaxed);
            (*initial).state = ThreadState::Running;
            prcb.set_idle_thread(idle);
            prcb.set_current_thread(initial);
        }
        prcb.swap_cycle_stamp(self.hal.read_cycle_counter());
        self.hal.arm_oneshot(self.config.quantum_timer_us);
        self.lower_irql(irql);

        log::info!(
            "processor {} online: running {} (id {}), idle {} (id {})",
            cpu,
            (*initial).name,
            (*initial).thread_id,
            (*idle).name,
            (*idle).thread_id
        );
    }

    /// Register the user-mode thunks that user APCs and user thread starts
    /// are redirected to
    pub fn set_user_apc_dispatcher(&self, apc_dispatcher: u64, thread_start: u64) {
        self.user_apc_dispatcher.store(apc_dispatcher, Ordering::Release);
        self.user_thread_start.store(thread_start, Ordering::Release);
    }

    #[inline]
    pub(crate) fn user_apc_dispatcher(&self) -> u64 {
        self.user_apc_dispatcher.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn user_thread_start(&self) -> u64 {
        self.user_thread_start.load(Ordering::Acquire)
    }

    /// Create a kernel thread and make it Ready
    pub fn create_thread(
        &self,
        process: &Arc<KProcess>,
        name: &'static str,
        priority: ThreadPriority,
        start_routine: ThreadStartRoutine,
        start_context: usize,
    ) -> Result<*mut KThread, KeError> {
        let thread = KThread::create(self, process, name, priority, start_routine, start_context)?;
        self.ready_thread(thread);
        Ok(thread)
    }

    /// Body of every idle thread
    ///
    /// Waits for interrupts while nothing is runnable and hands the
    /// processor to the scheduler as soon as something is.
    pub fn idle_loop(&self) -> ! {
        loop {
            let irql = self.raise_irql::<DispatchLevel>();
            let runnable = self.dispatcher.lock_at_dpc_level(&irql).ready.summary() != 0;
            let prcb = self.current_prcb(&irql);
            if runnable {
                prcb.request_dispatch();
            }
            let work = runnable || prcb.dpc_pending();
            // Lowering runs the DPCs and the switch
            self.lower_irql(irql);

            if !work {
                self.hal.wait_for_interrupt();
            }
        }
    }
}

/// Start routine of idle threads created by the boot path
pub fn idle_thread_routine(_context: usize) {
    kernel().idle_loop()
}

/// The registered kernel instance
static KERNEL: Once<Kernel> = Once::new();

/// Register the kernel instance
///
/// Only the first call builds a kernel; later calls return the existing one.
pub fn initialize(hal: &'static dyn Hal, config: KernelConfig) -> &'static Kernel {
    let ke = KERNEL.call_once(|| Kernel::new(hal, config));
    log::info!(
        "kernel executive initialized: {} processor(s), quantum {} cycles",
        ke.config.processor_count,
        ke.config.quantum_cycles
    );
    ke
}

/// The registered kernel instance
///
/// Use before [`initialize`] is fatal.
pub fn kernel() -> &'static Kernel {
    match KERNEL.get() {
        Some(ke) => ke,
        None => ke_bugcheck_ex(codes::INVALID_DATA_ACCESS_TRAP, 0, 0, 0, 0),
    }
}
