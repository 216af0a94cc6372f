//! Multi-Object Wait Support
//!
//! Provides NT-compatible wait functions that allow threads to wait on
//! one or more dispatcher objects (events, mutexes, semaphores).
//!
//! # Wait Types
//! - **WaitAny**: Wait satisfied when any one object is signaled
//! - **WaitAll**: Wait satisfied when all objects are signaled simultaneously
//!
//! # Wait rounds
//!
//! A wait runs in rounds. Each round arms the thread's completion slot,
//! registers wait blocks (or is satisfied on the spot), blocks until some
//! party claims the slot, then unlinks whatever blocks are still queued.
//! A kernel APC that interrupts the wait, or a WaitAll object that changed,
//! starts a new round against the same absolute deadline.
//!
//! # Timeouts
//! `None` waits forever, `Some(0)` polls without blocking and any other
//! value is a relative timeout in nanoseconds.
//!
//! # NT Compatibility
//! - `wait_for_single_object` - Equivalent to KeWaitForSingleObject
//! - `wait_for_multiple_objects` - Equivalent to KeWaitForMultipleObjects
//! - `delay_execution` - Equivalent to KeDelayExecutionThread
//! - `alert_thread` / `test_alert` - Equivalent to KeAlertThread / KeTestAlertThread

use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::Ordering;

use super::bugcheck::{codes, ke_bugcheck_ex};
use super::dispatcher::{
    DispatcherHeader, KWaitBlock, WaitOutcome, WaitStatus, WaitType, MAXIMUM_WAIT_OBJECTS, THREAD_WAIT_BLOCKS,
};
use super::irql::levels::DISPATCH_LEVEL;
use super::irql::{DispatchLevel, IrqlToken};
use super::kernel::Kernel;
use super::thread::{KThread, ProcessorMode};
use super::KeError;

/// Where the wait blocks of one wait live
enum BlockStorage<'a> {
    /// The thread's built-in blocks
    Thread,
    /// Caller-supplied array
    Caller(&'a mut [KWaitBlock]),
    /// Allocated for this wait
    Heap(Vec<KWaitBlock>),
}

impl BlockStorage<'_> {
    fn as_mut_ptr(&mut self, thread: *mut KThread) -> *mut KWaitBlock {
        match self {
            BlockStorage::Thread => unsafe { ptr::addr_of_mut!((*thread).wait_blocks).cast::<KWaitBlock>() },
            BlockStorage::Caller(blocks) => blocks.as_mut_ptr(),
            BlockStorage::Heap(blocks) => blocks.as_mut_ptr(),
        }
    }
}

impl Kernel {
    /// Wait for a single dispatcher object
    ///
    /// Equivalent to KeWaitForSingleObject
    pub fn wait_for_single_object(
        &self,
        object: &DispatcherHeader,
        mode: ProcessorMode,
        alertable: bool,
        timeout_ns: Option<u64>,
    ) -> Result<WaitStatus, KeError> {
        self.wait_for_multiple_objects(&[object], WaitType::WaitAny, mode, alertable, timeout_ns, None)
    }

    /// Wait for several dispatcher objects
    ///
    /// Equivalent to KeWaitForMultipleObjects. Waits on more than
    /// THREAD_WAIT_BLOCKS objects use `wait_blocks` if given, otherwise
    /// blocks allocated for the duration of the wait.
    ///
    /// # Returns
    /// - `Object(i)`: object `i` satisfied a WaitAny (always 0 for WaitAll)
    /// - `Timeout`, `Alerted`, `UserApc`: the wait ended without a signal
    ///
    /// More than MAXIMUM_WAIT_OBJECTS objects, or a `wait_blocks` array
    /// shorter than `objects`, is fatal, as is a blocking wait at or above
    /// DISPATCH_LEVEL.
    pub fn wait_for_multiple_objects(
        &self,
        objects: &[&DispatcherHeader],
        wait_type: WaitType,
        mode: ProcessorMode,
        alertable: bool,
        timeout_ns: Option<u64>,
        wait_blocks: Option<&mut [KWaitBlock]>,
    ) -> Result<WaitStatus, KeError> {
        let count = objects.len();
        if count > MAXIMUM_WAIT_OBJECTS {
            ke_bugcheck_ex(
                codes::MAXIMUM_WAIT_OBJECTS_EXCEEDED,
                count as u64,
                MAXIMUM_WAIT_OBJECTS as u64,
                0,
                0,
            );
        }
        if let Some(blocks) = &wait_blocks {
            if blocks.len() < count {
                ke_bugcheck_ex(
                    codes::MAXIMUM_WAIT_OBJECTS_EXCEEDED,
                    count as u64,
                    blocks.len() as u64,
                    1,
                    0,
                );
            }
        }
        if count == 0 {
            return Err(KeError::InvalidParameter);
        }
        if wait_type == WaitType::WaitAll
            && objects
                .iter()
                .enumerate()
                .any(|(i, object)| objects[..i].iter().any(|earlier| ptr::eq(*earlier, *object)))
        {
            return Err(KeError::InvalidParameter);
        }
        self.check_wait_irql(timeout_ns);

        let storage = match wait_blocks {
            Some(blocks) => BlockStorage::Caller(blocks),
            None if count <= THREAD_WAIT_BLOCKS => BlockStorage::Thread,
            None => {
                let mut blocks = Vec::new();
                if blocks.try_reserve_exact(count).is_err() {
                    log::warn!("wait on {} objects: no memory for wait blocks", count);
                    return Err(KeError::InsufficientResources);
                }
                blocks.resize(count, KWaitBlock::new());
                BlockStorage::Heap(blocks)
            }
        };

        Ok(self.wait_rounds(objects, wait_type, mode, alertable, timeout_ns, storage))
    }

    /// Sleep for `interval_ns` nanoseconds
    ///
    /// Equivalent to KeDelayExecutionThread. A zero interval just yields.
    /// An alertable delay ends early on an alert or a user APC.
    pub fn delay_execution(&self, mode: ProcessorMode, alertable: bool, interval_ns: u64) -> WaitStatus {
        if interval_ns == 0 {
            self.yield_execution();
            return WaitStatus::Timeout;
        }
        self.check_wait_irql(Some(interval_ns));
        self.wait_rounds(&[], WaitType::WaitAny, mode, alertable, Some(interval_ns), BlockStorage::Thread)
    }

    fn check_wait_irql(&self, timeout_ns: Option<u64>) {
        let irql = self.current_irql();
        if timeout_ns != Some(0) && irql >= DISPATCH_LEVEL {
            ke_bugcheck_ex(codes::IRQL_NOT_LESS_OR_EQUAL, irql as u64, DISPATCH_LEVEL as u64, 0, 0);
        }
    }

    fn wait_rounds(
        &self,
        objects: &[&DispatcherHeader],
        wait_type: WaitType,
        mode: ProcessorMode,
        alertable: bool,
        timeout_ns: Option<u64>,
        mut storage: BlockStorage<'_>,
    ) -> WaitStatus {
        let thread = self.current_thread();
        let deadline = timeout_ns.map(|timeout| self.hal.now_ns().saturating_add(timeout));
        let blocks = storage.as_mut_ptr(thread);

        loop {
            let irql = self.raise_irql::<DispatchLevel>();
            let outcome = unsafe {
                match self.begin_round(&irql, thread, mode, alertable) {
                    Some(early) => early,
                    None => {
                        let registered = self.register_blocks(&irql, thread, objects, wait_type, blocks);
                        self.await_completion(&irql, thread, deadline);
                        self.unlink_blocks(&irql, blocks, registered);

                        let wait = &(*thread).wait;
                        let outcome = wait.completion.load();
                        wait.completion.disarm();
                        wait.alertable.store(false, Ordering::Release);
                        outcome
                    }
                }
            };
            // Kernel APCs that ended the round are delivered here
            self.lower_irql(irql);

            match outcome {
                WaitOutcome::Satisfied(index) => return WaitStatus::Object(index),
                WaitOutcome::Timeout => return WaitStatus::Timeout,
                WaitOutcome::Alerted => return WaitStatus::Alerted,
                WaitOutcome::UserApc => {
                    unsafe { (*thread).apc_state.user_apc_pending.store(true, Ordering::Release) };
                    return WaitStatus::UserApc;
                }
                WaitOutcome::KernelApc | WaitOutcome::Recheck => {
                    log::trace!("thread {:p}: wait round restarted ({:?})", thread, outcome);
                }
                WaitOutcome::Idle | WaitOutcome::Pending => {}
            }
        }
    }

    /// Check alerts and pending user APCs, then arm the completion slot
    ///
    /// Runs under the thread lock so an alert or user APC queued
    /// concurrently either is seen here or finds the wait armed.
    unsafe fn begin_round(
        &self,
        irql: &IrqlToken<DispatchLevel>,
        thread: *mut KThread,
        mode: ProcessorMode,
        alertable: bool,
    ) -> Option<WaitOutcome> {
        let _thread_lock = (*thread).lock.lock_at_dpc_level(irql);
        let apc_state = &(*thread).apc_state;

        if alertable {
            if (*thread).alerted[mode as usize].swap(false, Ordering::AcqRel) {
                return Some(WaitOutcome::Alerted);
            }
            if mode == ProcessorMode::UserMode && !apc_state.is_queue_empty(ProcessorMode::UserMode) {
                return Some(WaitOutcome::UserApc);
            }
        } else if mode == ProcessorMode::UserMode && apc_state.user_apc_pending() {
            return Some(WaitOutcome::UserApc);
        }

        let wait = &(*thread).wait;
        wait.completion.arm();
        wait.alertable.store(alertable, Ordering::Release);
        wait.mode.store(mode as u8, Ordering::Release);
        wait.wait_irql.store(irql.previous(), Ordering::Release);
        None
    }

    /// Queue the wait blocks of one round, or satisfy the wait right away
    ///
    /// Returns how many blocks were queued.
    unsafe fn register_blocks(
        &self,
        irql: &IrqlToken<DispatchLevel>,
        thread: *mut KThread,
        objects: &[&DispatcherHeader],
        wait_type: WaitType,
        blocks: *mut KWaitBlock,
    ) -> usize {
        let wait = &mut (*thread).wait;
        wait.block_list = blocks;
        wait.block_count = objects.len();

        match wait_type {
            WaitType::WaitAny => {
                let mut registered = 0;
                for (index, object) in objects.iter().enumerate() {
                    let mut guard = object.lock(irql);
                    if guard.is_signaled_for(thread) {
                        if (*thread).wait.completion.try_complete(WaitOutcome::Satisfied(index)) {
                            guard.satisfy(thread);
                        }
                        break;
                    }
                    let block = blocks.add(index);
                    (*block).init(thread, *object, WaitType::WaitAny, index as u16);
                    guard.insert_wait_block(block);
                    registered += 1;
                }
                registered
            }
            WaitType::WaitAll => self.register_wait_all(thread, objects, blocks),
        }
    }

    /// All-or-nothing check of a WaitAll with every object locked
    unsafe fn register_wait_all(
        &self,
        thread: *mut KThread,
        objects: &[&DispatcherHeader],
        blocks: *mut KWaitBlock,
    ) -> usize {
        // Address order, so concurrent WaitAlls cannot deadlock
        let mut order = [0u8; MAXIMUM_WAIT_OBJECTS];
        let order = &mut order[..objects.len()];
        for (slot, index) in order.iter_mut().zip(0u8..) {
            *slot = index;
        }
        order.sort_unstable_by_key(|&index| objects[index as usize] as *const DispatcherHeader as usize);

        for &index in order.iter() {
            objects[index as usize].lock_raw();
        }

        let all_signaled = objects
            .iter()
            .all(|object| object.assume_locked().is_signaled_for(thread));

        let registered = if all_signaled {
            if (*thread).wait.completion.try_complete(WaitOutcome::Satisfied(0)) {
                for object in objects {
                    object.assume_locked().satisfy(thread);
                }
            }
            0
        } else {
            for (index, object) in objects.iter().enumerate() {
                let block = blocks.add(index);
                (*block).init(thread, *object, WaitType::WaitAll, index as u16);
                object.assume_locked().insert_wait_block(block);
            }
            objects.len()
        };

        for &index in order.iter().rev() {
            objects[index as usize].unlock_raw();
        }
        registered
    }

    /// Block until the completion slot is claimed, claiming it with a
    /// timeout once the deadline passes
    unsafe fn await_completion(&self, irql: &IrqlToken<DispatchLevel>, thread: *mut KThread, deadline: Option<u64>) {
        let completion = &(*thread).wait.completion;
        while completion.is_pending() {
            match deadline {
                Some(deadline) if self.hal.now_ns() >= deadline => {
                    completion.try_complete(WaitOutcome::Timeout);
                }
                Some(deadline) => {
                    self.sleep_until_at_dpc_level(irql, deadline);
                }
                None => {
                    self.block_at_dpc_level(irql);
                }
            }
        }
    }

    /// Take back the blocks of a finished round that no signaler consumed
    unsafe fn unlink_blocks(&self, irql: &IrqlToken<DispatchLevel>, blocks: *mut KWaitBlock, registered: usize) {
        for index in 0..registered {
            let block = blocks.add(index);
            let _guard = (*(*block).object).lock(irql);
            if !(*block).thread.is_null() {
                (*block).wait_list_entry.remove_entry();
                (*block).thread = ptr::null_mut();
            }
        }
    }

    /// Alert a thread
    ///
    /// Equivalent to KeAlertThread. A thread in an alertable wait that the
    /// alert mode can break (any wait for a kernel-mode alert, user-mode waits
    /// for a user-mode alert) returns `Alerted`; otherwise the alert is left
    /// pending for its next alertable wait. Returns whether an alert was
    /// already pending.
    pub fn alert_thread(&self, thread: *mut KThread, mode: ProcessorMode) -> bool {
        let irql = self.raise_irql::<DispatchLevel>();
        let was_alerted = unsafe {
            let _thread_lock = (*thread).lock.lock_at_dpc_level(&irql);
            let alerted = &(*thread).alerted[mode as usize];
            let was_alerted = alerted.load(Ordering::Acquire);

            if !was_alerted {
                let wait = &(*thread).wait;
                let breaks_wait = wait.alertable.load(Ordering::Acquire)
                    && (mode == ProcessorMode::KernelMode || wait.mode() == ProcessorMode::UserMode);
                if breaks_wait && wait.completion.try_complete(WaitOutcome::Alerted) {
                    self.unblock_locked(&irql, thread);
                } else {
                    alerted.store(true, Ordering::Release);
                }
            }
            was_alerted
        };
        self.lower_irql(irql);
        was_alerted
    }

    /// Consume the current thread's pending alert for `mode`
    ///
    /// Equivalent to KeTestAlertThread. For user mode, a non-empty user APC
    /// queue also marks a user APC pending for the return to user mode.
    pub fn test_alert(&self, mode: ProcessorMode) -> bool {
        let thread = self.current_thread();
        let irql = self.raise_irql::<DispatchLevel>();
        let alerted = unsafe {
            let _thread_lock = (*thread).lock.lock_at_dpc_level(&irql);
            let alerted = (*thread).alerted[mode as usize].swap(false, Ordering::AcqRel);
            let apc_state = &(*thread).apc_state;
            if mode == ProcessorMode::UserMode && !apc_state.is_queue_empty(ProcessorMode::UserMode) {
                apc_state.user_apc_pending.store(true, Ordering::Release);
            }
            alerted
        };
        self.lower_irql(irql);
        alerted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{SendPtr, TestSystem};
    use crate::hal::Hal;
    use crate::ke::apc::{ApcCall, KApc};
    use crate::ke::event::{EventType, KEvent};
    use crate::ke::mutex::KMutex;
    use crate::ke::semaphore::KSemaphore;
    use alloc::boxed::Box;

    fn leak<T>(value: T) -> &'static T {
        Box::leak(Box::new(value))
    }

    fn sync_event(signaled: bool) -> &'static KEvent {
        leak(KEvent::new(EventType::Synchronization, signaled))
    }

    #[test]
    fn test_wait_any_reports_first_signaled_index() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let events = [sync_event(false), sync_event(true), sync_event(true)];
        let headers = [&events[0].header, &events[1].header, &events[2].header];

        let status = ke.wait_for_multiple_objects(&headers, WaitType::WaitAny, ProcessorMode::KernelMode, false, None, None);
        assert_eq!(status, Ok(WaitStatus::Object(1)));
        assert_eq!(events[1].read_state(), 0);
        assert_eq!(events[2].read_state(), 1);
        assert!(!events[0].header.has_waiters());
        assert_eq!(sys.hal.switch_count(), 0);
    }

    #[test]
    fn test_wait_any_blocks_until_signal() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let events = [sync_event(false), sync_event(false)];

        sys.on_next_switch(move || {
            events[1].set(ke);
        });

        let headers = [&events[0].header, &events[1].header];
        let status = ke.wait_for_multiple_objects(&headers, WaitType::WaitAny, ProcessorMode::KernelMode, false, None, None);
        assert_eq!(status, Ok(WaitStatus::Object(1)));
        assert!(!events[0].header.has_waiters());
        assert!(!events[1].header.has_waiters());
        assert_eq!(events[1].read_state(), 0);
    }

    #[test]
    fn test_wait_all_satisfied_immediately() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event = sync_event(true);
        let semaphore = leak(KSemaphore::new(2, 5).unwrap());
        let mutex = leak(KMutex::new());

        let headers = [&event.header, &semaphore.header, &mutex.header];
        let status = ke.wait_for_multiple_objects(&headers, WaitType::WaitAll, ProcessorMode::KernelMode, false, None, None);
        assert_eq!(status, Ok(WaitStatus::Object(0)));
        assert_eq!(event.read_state(), 0);
        assert_eq!(semaphore.read_state(), 1);
        assert_eq!(mutex.owner(), sys.main_thread);
        assert_eq!(mutex.release(ke), 0);
    }

    #[test]
    fn test_wait_all_takes_nothing_until_all_signaled() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let first = sync_event(true);
        let second = sync_event(false);

        sys.on_next_switch(move || {
            // Still untouched by the blocked WaitAll
            assert_eq!(first.read_state(), 1);
            second.set(ke);
        });

        let headers = [&first.header, &second.header];
        let status = ke.wait_for_multiple_objects(&headers, WaitType::WaitAll, ProcessorMode::KernelMode, false, None, None);
        assert_eq!(status, Ok(WaitStatus::Object(0)));
        assert_eq!(first.read_state(), 0);
        assert_eq!(second.read_state(), 0);
        assert!(!first.header.has_waiters());
    }

    #[test]
    fn test_wait_all_rejects_duplicates() {
        let sys = TestSystem::new(1);
        let event = sync_event(true);
        let headers = [&event.header, &event.header];
        let status = sys.kernel.wait_for_multiple_objects(&headers, WaitType::WaitAll, ProcessorMode::KernelMode, false, None, None);
        assert_eq!(status, Err(KeError::InvalidParameter));
        assert_eq!(event.read_state(), 1);
    }

    #[test]
    fn test_empty_wait_is_invalid() {
        let sys = TestSystem::new(1);
        let status = sys.kernel.wait_for_multiple_objects(&[], WaitType::WaitAny, ProcessorMode::KernelMode, false, None, None);
        assert_eq!(status, Err(KeError::InvalidParameter));
    }

    #[test]
    fn test_more_objects_than_thread_blocks() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let events: Vec<&'static KEvent> = (0..6).map(|i| sync_event(i == 5)).collect();
        let headers: Vec<&DispatcherHeader> = events.iter().map(|event| &event.header).collect();

        let status = ke.wait_for_multiple_objects(&headers, WaitType::WaitAny, ProcessorMode::KernelMode, false, None, None);
        assert_eq!(status, Ok(WaitStatus::Object(5)));
        assert!(events[..5].iter().all(|event| !event.header.has_waiters()));

        events[2].set(ke);
        let mut blocks = [KWaitBlock::new(); 6];
        let status = ke.wait_for_multiple_objects(
            &headers,
            WaitType::WaitAny,
            ProcessorMode::KernelMode,
            false,
            None,
            Some(&mut blocks),
        );
        assert_eq!(status, Ok(WaitStatus::Object(2)));
    }

    #[test]
    #[should_panic(expected = "MAXIMUM_WAIT_OBJECTS_EXCEEDED")]
    fn test_too_many_objects_is_fatal() {
        let sys = TestSystem::new(1);
        let event = sync_event(true);
        let headers: Vec<&DispatcherHeader> = (0..65).map(|_| &event.header).collect();
        let _ = sys.kernel.wait_for_multiple_objects(&headers, WaitType::WaitAny, ProcessorMode::KernelMode, false, None, None);
    }

    #[test]
    #[should_panic(expected = "MAXIMUM_WAIT_OBJECTS_EXCEEDED")]
    fn test_short_block_array_is_fatal() {
        let sys = TestSystem::new(1);
        let events = [sync_event(true), sync_event(true), sync_event(true)];
        let headers = [&events[0].header, &events[1].header, &events[2].header];
        let mut blocks = [KWaitBlock::new(); 2];
        let _ = sys.kernel.wait_for_multiple_objects(
            &headers,
            WaitType::WaitAny,
            ProcessorMode::KernelMode,
            false,
            None,
            Some(&mut blocks),
        );
    }

    #[test]
    fn test_poll_at_dispatch_level() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event = sync_event(false);

        let irql = ke.raise_irql::<DispatchLevel>();
        let status = ke.wait_for_single_object(&event.header, ProcessorMode::KernelMode, false, Some(0));
        ke.lower_irql(irql);

        assert_eq!(status, Ok(WaitStatus::Timeout));
        assert!(!event.header.has_waiters());
        assert_eq!(sys.hal.switch_count(), 0);
    }

    #[test]
    #[should_panic(expected = "IRQL_NOT_LESS_OR_EQUAL")]
    fn test_blocking_wait_at_dispatch_level_is_fatal() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event = sync_event(true);
        let _irql = ke.raise_irql::<DispatchLevel>();
        let _ = ke.wait_for_single_object(&event.header, ProcessorMode::KernelMode, false, None);
    }

    #[test]
    fn test_pending_alert_ends_alertable_wait_only() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let main = sys.main_thread;
        let event = sync_event(true);

        assert!(!ke.alert_thread(main, ProcessorMode::KernelMode));
        assert!(ke.alert_thread(main, ProcessorMode::KernelMode));

        // Not alertable: the alert stays pending
        let status = ke.wait_for_single_object(&event.header, ProcessorMode::KernelMode, false, None);
        assert_eq!(status, Ok(WaitStatus::Object(0)));
        unsafe { assert!((*main).is_alerted(ProcessorMode::KernelMode)) };

        let status = ke.wait_for_single_object(&event.header, ProcessorMode::KernelMode, true, None);
        assert_eq!(status, Ok(WaitStatus::Alerted));
        unsafe { assert!(!(*main).is_alerted(ProcessorMode::KernelMode)) };
        assert_eq!(sys.hal.switch_count(), 0);
    }

    #[test]
    fn test_alert_breaks_blocked_wait() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event = sync_event(false);
        let main = SendPtr(sys.main_thread);

        sys.on_next_switch(move || {
            let main = main;
            assert!(!ke.alert_thread(main.0, ProcessorMode::KernelMode));
        });

        let status = ke.wait_for_single_object(&event.header, ProcessorMode::KernelMode, true, None);
        assert_eq!(status, Ok(WaitStatus::Alerted));
        assert!(!event.header.has_waiters());
        unsafe { assert!(!(*sys.main_thread).is_alerted(ProcessorMode::KernelMode)) };
    }

    #[test]
    fn test_user_alert_does_not_break_kernel_wait() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event = sync_event(false);
        let main = SendPtr(sys.main_thread);

        sys.on_next_switch(move || {
            let main = main;
            ke.alert_thread(main.0, ProcessorMode::UserMode);
            event.set(ke);
        });

        let status = ke.wait_for_single_object(&event.header, ProcessorMode::KernelMode, true, None);
        assert_eq!(status, Ok(WaitStatus::Object(0)));
        assert!(ke.test_alert(ProcessorMode::UserMode));
        assert!(!ke.test_alert(ProcessorMode::UserMode));
    }

    fn ignore_call(_apc: *mut KApc, _call: &mut ApcCall) {}

    #[test]
    fn test_user_apc_ends_alertable_user_wait() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event = sync_event(false);
        let apc: &'static KApc = leak(KApc::new());
        unsafe {
            apc.init(
                sys.main_thread,
                ignore_call,
                None,
                Some(crate::ke::apc::NormalRoutine::User(0x40_0000)),
                ProcessorMode::UserMode,
                0,
            );
        }

        sys.on_next_switch(move || {
            assert!(unsafe { apc.insert(ke, 0, 0) });
        });

        let status = ke.wait_for_single_object(&event.header, ProcessorMode::UserMode, true, None);
        assert_eq!(status, Ok(WaitStatus::UserApc));
        assert!(!event.header.has_waiters());
        unsafe { assert!((*sys.main_thread).apc_state.user_apc_pending()) };

        // Already queued: the next alertable user wait returns at once
        let status = ke.wait_for_single_object(&event.header, ProcessorMode::UserMode, true, None);
        assert_eq!(status, Ok(WaitStatus::UserApc));
    }

    struct SetOnDelivery {
        ke: &'static Kernel,
        event: &'static KEvent,
    }

    fn set_event(_apc: *mut KApc, call: &mut ApcCall) {
        let target = unsafe { &*(call.normal_context as *const SetOnDelivery) };
        target.event.set(target.ke);
    }

    #[test]
    fn test_kernel_apc_interrupts_and_resumes_wait() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event = sync_event(false);
        let target: &'static SetOnDelivery = leak(SetOnDelivery { ke, event });
        let apc: &'static KApc = leak(KApc::new());
        unsafe {
            apc.init(
                sys.main_thread,
                set_event,
                None,
                None,
                ProcessorMode::KernelMode,
                target as *const SetOnDelivery as usize,
            );
        }

        sys.on_next_switch(move || {
            assert!(unsafe { apc.insert(ke, 0, 0) });
        });

        // Not alertable, yet the APC runs mid-wait and the wait then
        // picks up the signal it left behind
        let status = ke.wait_for_single_object(&event.header, ProcessorMode::KernelMode, false, None);
        assert_eq!(status, Ok(WaitStatus::Object(0)));
        assert_eq!(event.read_state(), 0);
        assert!(!apc.is_inserted());
        assert_eq!(sys.hal.switch_count(), 2);
    }

    #[test]
    fn test_delay_execution() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let hal = sys.hal;
        let start = hal.now_ns();

        sys.on_next_switch(move || hal.advance(5_000));
        assert_eq!(ke.delay_execution(ProcessorMode::KernelMode, false, 2_000), WaitStatus::Timeout);
        assert!(hal.now_ns() >= start + 2_000);

        // Zero interval only yields
        let switches = hal.switch_count();
        assert_eq!(ke.delay_execution(ProcessorMode::KernelMode, false, 0), WaitStatus::Timeout);
        assert_eq!(hal.switch_count(), switches);

        ke.alert_thread(sys.main_thread, ProcessorMode::KernelMode);
        assert_eq!(ke.delay_execution(ProcessorMode::KernelMode, true, 2_000), WaitStatus::Alerted);
    }
}
