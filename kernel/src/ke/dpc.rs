//! Deferred Procedure Call (DPC) Implementation
//!
//! DPCs allow code running at high IRQL (interrupt handlers) to defer
//! work to a lower IRQL (DISPATCH_LEVEL). This is essential because
//! interrupt handlers should complete quickly and not do extensive processing.
//!
//! Each processor owns a FIFO of queued DPCs. Any processor may queue to any
//! other; the queue lock is only ever taken at HIGH_LEVEL because the queue is
//! also walked from the interrupt-return path. Queueing requests a
//! DISPATCH_LEVEL software interrupt on the target processor; the queue is
//! drained whenever that processor's IRQL drops below DISPATCH_LEVEL.
//!
//! # Usage
//! ```ignore
//! static MY_DPC: KDpc = KDpc::new();
//!
//! // Initialize once
//! MY_DPC.init(my_dpc_routine, context);
//!
//! // Queue from interrupt handler
//! unsafe { MY_DPC.insert(ke, system_arg1, system_arg2) };
//! ```
//!
//! # NT Compatibility
//! Equivalent to NT's KDPC / KeInitializeDpc / KeInsertQueueDpc

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use super::bugcheck::{codes, ke_bugcheck_ex};
use super::irql::{levels::DISPATCH_LEVEL, DispatchLevel, HighLevel, IrqlToken};
use super::kernel::Kernel;
use super::list::ListEntry;
use crate::containing_record;

/// DPC routine function signature
///
/// # Arguments
/// * `dpc` - Pointer to the DPC object
/// * `deferred_context` - Context set during initialization
/// * `system_argument1` - First argument passed to insert
/// * `system_argument2` - Second argument passed to insert
pub type DpcRoutine = fn(
    dpc: *mut KDpc,
    deferred_context: usize,
    system_argument1: usize,
    system_argument2: usize,
);

/// DPC importance level
///
/// Determines where in the DPC queue the DPC is inserted
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpcImportance {
    /// Insert at tail of queue
    Low = 0,
    /// Insert at tail of queue (default)
    Medium = 1,
    /// Insert at head of queue
    High = 2,
}

/// Per-processor DPC queue, guarded by the PRCB's DPC lock
pub(crate) struct DpcQueue {
    head: ListEntry,
    depth: u32,
}

// SAFETY: only reached through the PRCB's DPC lock
unsafe impl Send for DpcQueue {}

impl DpcQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: ListEntry::new(),
            depth: 0,
        }
    }
}

/// `queued_on` value of a DPC that sits in no queue
const NOT_QUEUED: u32 = u32::MAX;

/// Kernel Deferred Procedure Call object
///
/// Equivalent to NT's KDPC structure
#[repr(C)]
pub struct KDpc {
    /// Entry for linking into DPC queue
    dpc_list_entry: UnsafeCell<ListEntry>,

    /// The routine to call when DPC fires
    deferred_routine: UnsafeCell<Option<DpcRoutine>>,

    /// Context passed to routine (set during init)
    deferred_context: UnsafeCell<usize>,

    /// First system argument (set during insert)
    system_argument1: UnsafeCell<usize>,

    /// Second system argument (set during insert)
    system_argument2: UnsafeCell<usize>,

    /// Target processor (None = the inserting processor)
    target_processor: UnsafeCell<Option<usize>>,

    /// DPC importance
    importance: UnsafeCell<DpcImportance>,

    /// Processor whose queue holds the DPC, or NOT_QUEUED.
    /// Changes only under that processor's DPC lock.
    queued_on: AtomicU32,
}

// Safety: the queued fields are only touched under the target's DPC lock
unsafe impl Sync for KDpc {}
unsafe impl Send for KDpc {}

impl KDpc {
    /// Create a new uninitialized DPC
    pub const fn new() -> Self {
        Self {
            dpc_list_entry: UnsafeCell::new(ListEntry::new()),
            deferred_routine: UnsafeCell::new(None),
            deferred_context: UnsafeCell::new(0),
            system_argument1: UnsafeCell::new(0),
            system_argument2: UnsafeCell::new(0),
            target_processor: UnsafeCell::new(None),
            importance: UnsafeCell::new(DpcImportance::Medium),
            queued_on: AtomicU32::new(NOT_QUEUED),
        }
    }

    /// Fatal if the DPC sits in a queue
    fn check_not_queued(&self) {
        let cpu = self.queued_on.load(Ordering::Acquire);
        if cpu != NOT_QUEUED {
            ke_bugcheck_ex(codes::INVALID_DPC_STATE, self as *const KDpc as u64, cpu as u64, 0, 0);
        }
    }

    /// Initialize the DPC with a routine and context
    ///
    /// Equivalent to KeInitializeDpc. Re-initializing a queued DPC is fatal.
    pub fn init(&self, routine: DpcRoutine, context: usize) {
        self.check_not_queued();
        unsafe {
            (*self.dpc_list_entry.get()).init_head();
            *self.deferred_routine.get() = Some(routine);
            *self.deferred_context.get() = context;
            *self.system_argument1.get() = 0;
            *self.system_argument2.get() = 0;
            *self.target_processor.get() = None;
            *self.importance.get() = DpcImportance::Medium;
        }
    }

    /// Set the DPC importance
    pub fn set_importance(&self, importance: DpcImportance) {
        self.check_not_queued();
        unsafe {
            *self.importance.get() = importance;
        }
    }

    /// Set the target processor for this DPC
    ///
    /// Retargeting a queued DPC is fatal.
    pub fn set_target_processor(&self, processor: usize) {
        self.check_not_queued();
        unsafe {
            *self.target_processor.get() = Some(processor);
        }
    }

    /// Check if this DPC is currently queued
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queued_on.load(Ordering::Acquire) != NOT_QUEUED
    }

    /// Queue the DPC for execution
    ///
    /// Equivalent to KeInsertQueueDpc. Callable at any IRQL.
    ///
    /// # Returns
    /// true if the DPC was queued, false if it was already queued
    ///
    /// # Safety
    /// The DPC must stay alive and in place until it has run or been removed.
    pub unsafe fn insert(&self, ke: &Kernel, system_argument1: usize, system_argument2: usize) -> bool {
        let irql = ke.raise_irql::<HighLevel>();

        let cpu = match *self.target_processor.get() {
            Some(cpu) => cpu,
            None => ke.current_processor(),
        };
        let prcb = match ke.prcb(cpu) {
            Some(prcb) => prcb,
            None => ke_bugcheck_ex(codes::INVALID_DPC_STATE, self as *const KDpc as u64, cpu as u64, 1, 0),
        };

        let inserted = {
            let mut queue = prcb.dpc_queue.lock_at_dpc_level(&irql);
            if self
                .queued_on
                .compare_exchange(NOT_QUEUED, cpu as u32, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                false
            } else {
                *self.system_argument1.get() = system_argument1;
                *self.system_argument2.get() = system_argument2;

                let entry = self.dpc_list_entry.get();
                if *self.importance.get() == DpcImportance::High || queue.head.is_empty() {
                    queue.head.insert_head(entry);
                } else {
                    queue.head.insert_tail(entry);
                }
                queue.depth += 1;
                prcb.set_dpc_count(queue.depth);
                true
            }
        };

        if inserted {
            log::debug!("dpc {:p} queued on cpu {}", self, cpu);
            ke.hal().request_software_interrupt(cpu, DISPATCH_LEVEL);
        }

        ke.lower_irql(irql);
        inserted
    }

    /// Remove DPC from queue (cancel pending DPC)
    ///
    /// Equivalent to KeRemoveQueueDpc
    ///
    /// # Returns
    /// true if the DPC was removed, false if it wasn't queued
    pub fn remove(&self, ke: &Kernel) -> bool {
        let cpu = self.queued_on.load(Ordering::Acquire);
        if cpu == NOT_QUEUED {
            return false;
        }
        let prcb = match ke.prcb(cpu as usize) {
            Some(prcb) => prcb,
            None => return false,
        };

        let irql = ke.raise_irql::<HighLevel>();
        let removed = {
            let mut queue = prcb.dpc_queue.lock_at_dpc_level(&irql);
            // It may have run, or been requeued elsewhere, since the load
            if self.queued_on.load(Ordering::Acquire) == cpu {
                unsafe { (*self.dpc_list_entry.get()).remove_entry() };
                queue.depth -= 1;
                prcb.set_dpc_count(queue.depth);
                self.queued_on.store(NOT_QUEUED, Ordering::Release);
                true
            } else {
                false
            }
        };
        ke.lower_irql(irql);
        removed
    }
}

impl Default for KDpc {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Run the current processor's DPC queue until it is empty
    ///
    /// Equivalent to KiRetireDpcList. Each DPC is dequeued at HIGH_LEVEL and
    /// its routine called at DISPATCH_LEVEL, so routines may take spin locks
    /// and queue further DPCs.
    pub(crate) fn retire_dpc_list(&self, irql: &IrqlToken<DispatchLevel>) {
        loop {
            let high = self.raise_irql::<HighLevel>();
            let prcb = self.current_prcb(&high);

            let next = {
                let mut queue = prcb.dpc_queue.lock_at_dpc_level(&high);
                if queue.head.is_empty() {
                    None
                } else {
                    unsafe {
                        let entry = queue.head.remove_head();
                        queue.depth -= 1;
                        prcb.set_dpc_count(queue.depth);

                        let dpc = containing_record!(entry, KDpc, dpc_list_entry);
                        let call = (
                            *(*dpc).deferred_routine.get(),
                            *(*dpc).deferred_context.get(),
                            *(*dpc).system_argument1.get(),
                            *(*dpc).system_argument2.get(),
                        );
                        // From here on the DPC may be queued again
                        (*dpc).queued_on.store(NOT_QUEUED, Ordering::Release);
                        Some((dpc, call))
                    }
                }
            };

            // Back to DISPATCH_LEVEL, where the drain found us
            self.lower_irql(high);

            let (dpc, (routine, context, argument1, argument2)) = match next {
                Some(next) => next,
                None => break,
            };

            if let Some(routine) = routine {
                let prcb = self.current_prcb(irql);
                prcb.set_dpc_routine_active(true);
                routine(dpc, context, argument1, argument2);
                prcb.set_dpc_routine_active(false);
            }
        }
    }

    /// Number of DPCs queued on processor `cpu`
    pub fn dpc_queue_depth(&self, cpu: usize) -> usize {
        self.prcb(cpu).map_or(0, |prcb| prcb.dpc_queue_depth())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::TestSystem;
    use alloc::vec::Vec;
    use std::sync::Mutex;

    /// Appends system_argument1 to the log the context points at
    fn record(_dpc: *mut KDpc, context: usize, argument1: usize, _argument2: usize) {
        let log = unsafe { &*(context as *const Mutex<Vec<usize>>) };
        log.lock().unwrap().push(argument1);
    }

    fn runs(log: &Mutex<Vec<usize>>) -> Vec<usize> {
        core::mem::take(&mut *log.lock().unwrap())
    }

    #[test]
    fn test_dpc_queue_order_and_idempotence() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let log = Mutex::new(Vec::<usize>::new());
        let context = &log as *const _ as usize;

        let (a, b, c) = (KDpc::new(), KDpc::new(), KDpc::new());
        a.init(record, context);
        b.init(record, context);
        c.init(record, context);
        c.set_importance(DpcImportance::High);

        let irql = ke.raise_irql::<DispatchLevel>();
        unsafe {
            assert!(a.insert(ke, 1, 0));
            assert!(b.insert(ke, 2, 0));
            // Re-inserting changes nothing, arguments included
            assert!(!a.insert(ke, 99, 0));
            assert_eq!(ke.dpc_queue_depth(0), 2);
            assert!(c.insert(ke, 3, 0));
        }
        assert!(a.is_queued());
        assert!(runs(&log).is_empty());
        assert!(sys.software_interrupts().contains(&(0, DISPATCH_LEVEL)));

        ke.lower_irql(irql);
        assert_eq!(runs(&log), [3, 1, 2]);
        assert_eq!(ke.dpc_queue_depth(0), 0);
        assert!(!a.is_queued());
    }

    #[test]
    fn test_insert_below_dispatch_runs_on_the_way_down() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let log = Mutex::new(Vec::<usize>::new());
        let dpc = KDpc::new();
        dpc.init(record, &log as *const _ as usize);

        assert!(unsafe { dpc.insert(ke, 5, 0) });
        assert_eq!(runs(&log), [5]);
        assert!(!ke.prcb(0).unwrap().dpc_routine_active());
    }

    #[test]
    fn test_remove_before_run() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let log = Mutex::new(Vec::<usize>::new());
        let dpc = KDpc::new();
        dpc.init(record, &log as *const _ as usize);

        assert!(!dpc.remove(ke));

        let irql = ke.raise_irql::<DispatchLevel>();
        unsafe { dpc.insert(ke, 7, 0) };
        assert!(dpc.remove(ke));
        assert!(!dpc.remove(ke));
        assert_eq!(ke.dpc_queue_depth(0), 0);
        ke.lower_irql(irql);

        assert!(runs(&log).is_empty());
    }

    #[test]
    fn test_remote_target_queues_on_that_processor() {
        let sys = TestSystem::new(2);
        let ke = sys.kernel;
        let log = Mutex::new(Vec::<usize>::new());
        let dpc = KDpc::new();
        dpc.init(record, &log as *const _ as usize);
        dpc.set_target_processor(1);

        // Lowering on cpu 0 leaves cpu 1's queue alone
        assert!(unsafe { dpc.insert(ke, 9, 0) });
        assert_eq!(ke.dpc_queue_depth(1), 1);
        assert!(runs(&log).is_empty());
        assert!(sys.software_interrupts().contains(&(1, DISPATCH_LEVEL)));

        sys.hal.run_on(1, || ke.dispatch_interrupt());
        assert_eq!(runs(&log), [9]);
        assert_eq!(ke.dpc_queue_depth(1), 0);
    }

    #[test]
    #[should_panic(expected = "INVALID_DPC_STATE")]
    fn test_reinit_while_queued_is_fatal() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let log = Mutex::new(Vec::<usize>::new());
        let dpc = KDpc::new();
        dpc.init(record, &log as *const _ as usize);

        let _irql = ke.raise_irql::<DispatchLevel>();
        unsafe { dpc.insert(ke, 0, 0) };
        dpc.init(record, 0);
    }

    #[test]
    #[should_panic(expected = "INVALID_DPC_STATE")]
    fn test_unknown_target_is_fatal() {
        let sys = TestSystem::new(1);
        let dpc = KDpc::new();
        dpc.init(record, 0);
        dpc.set_target_processor(4);
        unsafe { dpc.insert(sys.kernel, 0, 0) };
    }
}
