//! Kernel Processor Control Block (KPRCB)
//!
//! The KPRCB contains per-processor state including:
//! - Current, next and idle thread pointers
//! - The processor's IRQL
//! - The DPC queue and its pending count
//! - Quantum-end and dispatch-pending requests for the next drain
//!
//! In a multiprocessor system, each CPU has its own KPRCB. The blocks live in
//! a [`PerCpu`] arena owned by the kernel instance and are reached through
//! `Kernel::current_prcb`, which resolves the executing processor through the
//! HAL and demands an IRQL token at DISPATCH_LEVEL or above, so the caller
//! cannot move to another processor while it holds the block. The ready queues are not here: they are shared by every processor in
//! the dispatcher database.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

use super::dpc::DpcQueue;
use super::irql::{levels::PASSIVE_LEVEL, Kirql};
use super::spinlock::SpinLock;
use super::thread::KThread;

/// Fixed set of per-processor values, indexed by processor number
pub struct PerCpu<T> {
    slots: Box<[T]>,
}

impl<T> PerCpu<T> {
    /// Build one slot per processor
    pub fn new(count: usize, init: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: (0..count).map(init).collect::<Vec<_>>().into_boxed_slice(),
        }
    }

    /// Slot of processor `cpu`
    #[inline]
    pub fn get(&self, cpu: usize) -> Option<&T> {
        self.slots.get(cpu)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}

/// Kernel Processor Control Block
///
/// Modeled after Windows NT's KPRCB structure.
pub struct KPrcb {
    /// Processor number (0 for BSP)
    number: usize,

    /// Current IRQL (mirrors the hardware mask)
    irql: AtomicU8,

    /// Currently running thread
    current_thread: AtomicPtr<KThread>,

    /// Thread being switched to (set by the scheduler, consumed by the switch)
    next_thread: AtomicPtr<KThread>,

    /// Idle thread for this processor
    idle_thread: AtomicPtr<KThread>,

    /// Outgoing thread of the switch in progress
    previous_thread: AtomicPtr<KThread>,

    /// Quantum end flag (set by the clock, cleared by the scheduler)
    quantum_end: AtomicBool,

    /// A thread above the running one became ready
    dispatch_pending: AtomicBool,

    /// DPC queue, taken at HIGH_LEVEL
    pub(crate) dpc_queue: SpinLock<DpcQueue>,

    /// Number of queued DPCs (readable without the lock)
    dpc_count: AtomicU32,

    /// A DPC routine is executing
    dpc_routine_active: AtomicBool,

    /// Interrupt nesting depth
    interrupt_count: AtomicU32,

    /// Number of context switches on this processor
    context_switches: AtomicU64,

    /// Cycle counter at the last accounting point
    last_cycle_stamp: AtomicU64,
}

impl KPrcb {
    /// Create the PRCB of processor `number`
    pub fn new(number: usize) -> Self {
        Self {
            number,
            irql: AtomicU8::new(PASSIVE_LEVEL),
            current_thread: AtomicPtr::new(ptr::null_mut()),
            next_thread: AtomicPtr::new(ptr::null_mut()),
            idle_thread: AtomicPtr::new(ptr::null_mut()),
            previous_thread: AtomicPtr::new(ptr::null_mut()),
            quantum_end: AtomicBool::new(false),
            dispatch_pending: AtomicBool::new(false),
            dpc_queue: SpinLock::new(DpcQueue::new()),
            dpc_count: AtomicU32::new(0),
            dpc_routine_active: AtomicBool::new(false),
            interrupt_count: AtomicU32::new(0),
            context_switches: AtomicU64::new(0),
            last_cycle_stamp: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn number(&self) -> usize {
        self.number
    }

    #[inline]
    pub fn irql(&self) -> Kirql {
        self.irql.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_irql(&self, irql: Kirql) {
        self.irql.store(irql, Ordering::Relaxed);
    }

    /// Get the currently running thread
    #[inline]
    pub fn current_thread(&self) -> *mut KThread {
        self.current_thread.load(Ordering::Acquire)
    }

    /// Set the currently running thread
    ///
    /// # Safety
    /// Must be called from scheduler context with the dispatcher lock held,
    /// or by code standing in for the scheduler
    #[inline]
    pub unsafe fn set_current_thread(&self, thread: *mut KThread) {
        self.current_thread.store(thread, Ordering::Release);
    }

    #[inline]
    pub fn next_thread(&self) -> *mut KThread {
        self.next_thread.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_next_thread(&self, thread: *mut KThread) {
        self.next_thread.store(thread, Ordering::Release);
    }

    #[inline]
    pub fn idle_thread(&self) -> *mut KThread {
        self.idle_thread.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_idle_thread(&self, thread: *mut KThread) {
        self.idle_thread.store(thread, Ordering::Release);
    }

    /// Is `thread` this processor's idle thread?
    #[inline]
    pub fn is_idle(&self, thread: *mut KThread) -> bool {
        thread == self.idle_thread()
    }

    #[inline]
    pub(crate) fn set_previous_thread(&self, thread: *mut KThread) {
        self.previous_thread.store(thread, Ordering::Release);
    }

    #[inline]
    pub(crate) fn take_previous_thread(&self) -> *mut KThread {
        self.previous_thread.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    #[inline]
    pub fn quantum_end(&self) -> bool {
        self.quantum_end.load(Ordering::Acquire)
    }

    /// Flag quantum end; returns true if it was not already flagged
    #[inline]
    pub(crate) fn request_quantum_end(&self) -> bool {
        !self.quantum_end.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn clear_quantum_end(&self) {
        self.quantum_end.store(false, Ordering::Release);
    }

    #[inline]
    pub fn dispatch_pending(&self) -> bool {
        self.dispatch_pending.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn request_dispatch(&self) {
        self.dispatch_pending.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_dispatch_pending(&self) {
        self.dispatch_pending.store(false, Ordering::Release);
    }

    /// Any DPCs queued?
    #[inline]
    pub fn dpc_pending(&self) -> bool {
        self.dpc_count.load(Ordering::Acquire) != 0
    }

    /// Number of queued DPCs
    #[inline]
    pub fn dpc_queue_depth(&self) -> usize {
        self.dpc_count.load(Ordering::Acquire) as usize
    }

    /// Publish the queue depth; called with the DPC queue lock held
    #[inline]
    pub(crate) fn set_dpc_count(&self, count: u32) {
        self.dpc_count.store(count, Ordering::Release);
    }

    #[inline]
    pub fn dpc_routine_active(&self) -> bool {
        self.dpc_routine_active.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_dpc_routine_active(&self, active: bool) {
        self.dpc_routine_active.store(active, Ordering::Release);
    }

    #[inline]
    pub(crate) fn interrupt_entered(&self) {
        self.interrupt_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn interrupt_exited(&self) {
        self.interrupt_count.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn interrupt_count(&self) -> u32 {
        self.interrupt_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn note_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Store a new accounting stamp, returning the previous one
    #[inline]
    pub(crate) fn swap_cycle_stamp(&self, now: u64) -> u64 {
        self.last_cycle_stamp.swap(now, Ordering::AcqRel)
    }
}
