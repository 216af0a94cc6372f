//! NT-style Priority Scheduler
//!
//! Implements a 32-level priority scheduler with:
//! - O(1) thread selection using the ready summary bitmap
//! - Quantum-based round robin within a level
//! - Preemption when a thread above the running one becomes ready
//! - A sleep list sorted by wake time
//!
//! Priority levels:
//! - 1-15: Variable priority classes
//! - 16-31: Realtime class
//! - 0: never queued; the idle thread runs when nothing else can
//!
//! # Locking
//!
//! The ready queues and the sleep list form the dispatcher database, one
//! instance shared by every processor under a single spin lock. Thread state
//! only changes with that lock held. When several locks are needed they are
//! taken in the order object lock, thread lock, dispatcher lock.
//!
//! # Switching
//!
//! Every switch happens at DISPATCH_LEVEL. Interrupts never switch: the clock
//! only flags quantum end, readying a better thread only flags a dispatch,
//! and the switch itself happens when IRQL drops below DISPATCH_LEVEL (see
//! `ke::irql`). A thread that blocks does so on its own stack and resumes
//! right after its `swap_context` call.
//!
//! `unblock` may reach a thread that has decided to wait but has not yet
//! blocked. It then sets the thread's `dont_block` latch, and the next
//! `block` or `sleep` consumes the latch and returns at once. Callers loop on
//! their own wake condition, so an early return is harmless.

use alloc::sync::Arc;
use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::Ordering;

use super::bugcheck::{codes, ke_bugcheck_ex};
use super::dispatcher::WaitOutcome;
use super::irql::{levels::DISPATCH_LEVEL, DispatchLevel, IrqlToken, SynchLevel};
use super::kernel::Kernel;
use super::list::ListEntry;
use super::prcb::KPrcb;
use super::process::{priority_level, ThreadPriority, MAXIMUM_PRIORITY};
use super::spinlock::SpinLockGuard;
use super::thread::{KThread, ThreadState};
use crate::containing_record;

/// Ready queues: one FIFO per level plus the summary bitmap
pub(crate) struct ReadyQueue {
    lists: [ListEntry; MAXIMUM_PRIORITY],
    /// Bit N is set if lists[N] is non-empty
    summary: u32,
}

impl ReadyQueue {
    pub(crate) const fn new() -> Self {
        const EMPTY_LIST: ListEntry = ListEntry::new();
        Self {
            lists: [EMPTY_LIST; MAXIMUM_PRIORITY],
            summary: 0,
        }
    }

    #[inline]
    pub(crate) fn summary(&self) -> u32 {
        self.summary
    }

    /// Highest non-empty level
    #[inline]
    pub(crate) fn highest_level(&self) -> Option<u8> {
        if self.summary == 0 {
            None
        } else {
            Some((31 - self.summary.leading_zeros()) as u8)
        }
    }

    /// Queue a thread behind the others at its level
    ///
    /// # Safety
    /// The thread must be live and not linked anywhere.
    pub(crate) unsafe fn insert_tail(&mut self, thread: *mut KThread) {
        let level = (*thread).level as usize;
        self.lists[level].insert_tail(&mut (*thread).wait_list_entry);
        self.summary |= 1 << level;
    }

    /// Queue a thread in front of the others at its level
    ///
    /// # Safety
    /// The thread must be live and not linked anywhere.
    pub(crate) unsafe fn insert_head(&mut self, thread: *mut KThread) {
        let level = (*thread).level as usize;
        self.lists[level].insert_head(&mut (*thread).wait_list_entry);
        self.summary |= 1 << level;
    }

    /// Unlink a queued thread
    ///
    /// # Safety
    /// The thread must be queued here at its current level.
    pub(crate) unsafe fn remove(&mut self, thread: *mut KThread) {
        let level = (*thread).level as usize;
        (*thread).wait_list_entry.remove_entry();
        if self.lists[level].is_empty() {
            self.summary &= !(1 << level);
        }
    }

    /// Dequeue the oldest thread of the highest level, if that level is at
    /// least `min_level`; null otherwise
    ///
    /// # Safety
    /// Every queued thread must be live.
    pub(crate) unsafe fn pop_at_or_above(&mut self, min_level: u8) -> *mut KThread {
        match self.highest_level() {
            Some(level) if level >= min_level => {
                let list = &mut self.lists[level as usize];
                let entry = list.remove_head();
                if list.is_empty() {
                    self.summary &= !(1 << level);
                }
                containing_record!(entry, KThread, wait_list_entry)
            }
            _ => ptr::null_mut(),
        }
    }

    /// Dequeue the next thread to run, or null
    ///
    /// # Safety
    /// Every queued thread must be live.
    #[inline]
    pub(crate) unsafe fn pop_highest(&mut self) -> *mut KThread {
        self.pop_at_or_above(0)
    }
}

/// State shared by every processor's scheduler
pub(crate) struct DispatcherDatabase {
    pub(crate) ready: ReadyQueue,
    /// Sleeping threads, earliest wake time first
    pub(crate) sleep_list: ListEntry,
}

// SAFETY: only reached through the dispatcher lock
unsafe impl Send for DispatcherDatabase {}

/// Wake time of a sleeping thread
#[inline]
unsafe fn wake_time_of(thread: *mut KThread) -> u64 {
    match (*thread).state {
        ThreadState::Sleeping { wake_time } => wake_time,
        _ => u64::MAX,
    }
}

impl DispatcherDatabase {
    pub(crate) const fn new() -> Self {
        Self {
            ready: ReadyQueue::new(),
            sleep_list: ListEntry::new(),
        }
    }

    /// Insert into the sleep list, behind sleepers with the same wake time
    ///
    /// # Safety
    /// The thread must be live, Sleeping and unlinked.
    pub(crate) unsafe fn insert_sleeper(&mut self, thread: *mut KThread, wake_time: u64) {
        let head = &mut self.sleep_list as *mut ListEntry;
        let mut position = head;
        for entry in self.sleep_list.iter() {
            let sleeper = containing_record!(entry, KThread, wait_list_entry);
            if wake_time_of(sleeper) > wake_time {
                position = entry;
                break;
            }
        }
        self.sleep_list.insert_before(position, &mut (*thread).wait_list_entry);
    }

    /// Earliest wake time, or u64::MAX with nobody asleep
    pub(crate) fn earliest_wake(&self) -> u64 {
        let first = self.sleep_list.first();
        if first.is_null() {
            u64::MAX
        } else {
            unsafe { wake_time_of(containing_record!(first, KThread, wait_list_entry)) }
        }
    }
}

impl Kernel {
    /// Level of the thread running on `prcb`, the idle thread counting as 0
    unsafe fn running_level(prcb: &KPrcb) -> u8 {
        let current = prcb.current_thread();
        if current.is_null() || prcb.is_idle(current) {
            0
        } else {
            (*current).level
        }
    }

    /// Queue a thread and ask a processor to run it if it beats what that
    /// processor is running
    ///
    /// # Safety
    /// Dispatcher lock held; thread live and unlinked.
    pub(crate) unsafe fn ready_locked(
        &self,
        irql: &IrqlToken<DispatchLevel>,
        database: &mut DispatcherDatabase,
        thread: *mut KThread,
    ) {
        (*thread).state = ThreadState::Ready;
        database.ready.insert_tail(thread);

        let level = (*thread).level;
        log::trace!("thread {} ready at level {}", (*thread).thread_id, level);

        let local = self.current_prcb(irql);
        let target = if Self::running_level(local) < level {
            Some(local)
        } else {
            self.prcbs.iter().find(|prcb| {
                let current = prcb.current_thread();
                !current.is_null() && prcb.is_idle(current)
            })
        };

        if let Some(prcb) = target {
            prcb.request_dispatch();
            self.hal.request_software_interrupt(prcb.number(), DISPATCH_LEVEL);
        }
    }

    /// Make an Initialized thread runnable
    pub fn ready_thread(&self, thread: *mut KThread) {
        let irql = self.raise_irql::<DispatchLevel>();
        {
            let mut database = self.dispatcher.lock_at_dpc_level(&irql);
            unsafe {
                if (*thread).state == ThreadState::Initialized {
                    self.ready_locked(&irql, &mut database, thread);
                } else {
                    log::warn!("ready_thread: thread {} is {:?}", (*thread).thread_id, (*thread).state);
                }
            }
        }
        self.lower_irql(irql);
    }

    /// Next thread for `prcb`: the best ready one, or its idle thread
    unsafe fn select_next(&self, database: &mut DispatcherDatabase, prcb: &KPrcb) -> *mut KThread {
        let next = database.ready.pop_highest();
        if next.is_null() {
            prcb.idle_thread()
        } else {
            next
        }
    }

    /// Charge the cycles since the last stamp to `thread`
    ///
    /// Returns true when this charge used up the rest of its quantum.
    unsafe fn charge_cycles(&self, prcb: &KPrcb, thread: *mut KThread) -> bool {
        let now = self.hal.read_cycle_counter();
        let elapsed = now.saturating_sub(prcb.swap_cycle_stamp(now));
        (*thread).cycle_time.fetch_add(elapsed, Ordering::Relaxed);

        if prcb.is_idle(thread) {
            return false;
        }

        let previous = match (*thread)
            .quantum
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| Some(q.saturating_sub(elapsed)))
        {
            Ok(q) | Err(q) => q,
        };
        previous != 0 && previous <= elapsed
    }

    /// Hand the processor from `old` to `new`
    ///
    /// The caller has already set `old`'s new state and queued it where it
    /// belongs. The dispatcher lock is released before the register swap;
    /// the processor stays at DISPATCH_LEVEL throughout. Returns when `old`
    /// is resumed.
    pub(crate) unsafe fn swap_thread(
        &self,
        irql: &IrqlToken<DispatchLevel>,
        database: SpinLockGuard<'_, DispatcherDatabase>,
        old: *mut KThread,
        new: *mut KThread,
    ) {
        if old == new {
            (*new).state = ThreadState::Running;
            return;
        }

        let prcb = self.current_prcb(irql);
        (*new).state = ThreadState::Running;
        (*new).processor.store(prcb.number(), Ordering::Relaxed);
        if (*new).quantum.load(Ordering::Relaxed) == 0 {
            (*new).quantum.store(self.config().quantum_cycles, Ordering::Relaxed);
        }

        // Nobody may resume `old` until its registers are saved
        (*old).swap_busy.store(true, Ordering::Release);
        prcb.set_next_thread(new);
        prcb.set_previous_thread(old);
        prcb.set_current_thread(new);
        prcb.clear_quantum_end();
        prcb.clear_dispatch_pending();
        drop(database);

        self.charge_cycles(prcb, old);

        while (*new).swap_busy.load(Ordering::Acquire) {
            spin_loop();
        }

        self.hal.switch_thread_state(&mut (*old).arch_state, &(*new).arch_state);
        if !Arc::ptr_eq(&(*old).process, &(*new).process) {
            self.hal.switch_address_space((&(*new).process).directory_table_base);
        }

        prcb.note_context_switch();
        prcb.set_next_thread(ptr::null_mut());
        log::trace!(
            "cpu {}: switch {} -> {}",
            prcb.number(),
            (*old).thread_id,
            (*new).thread_id
        );

        self.hal.swap_context(&mut (*old).context, &(*new).context);
        self.finish_switch();
    }

    /// Tail of every switch, run by the thread that was switched to
    ///
    /// Releases the outgoing thread for other processors.
    ///
    /// # Safety
    /// Only right after a context switch lands on this processor.
    pub(crate) unsafe fn finish_switch(&self) {
        // SAFETY: the switch left this processor at DISPATCH_LEVEL
        let previous = self.current_prcb_unchecked().take_previous_thread();
        if !previous.is_null() {
            (*previous).swap_busy.store(false, Ordering::Release);
        }
    }

    fn check_can_block(&self, prcb: &KPrcb, irql: &IrqlToken<DispatchLevel>) {
        if prcb.dpc_routine_active() {
            ke_bugcheck_ex(codes::ATTEMPTED_SWITCH_FROM_DPC, prcb.current_thread() as u64, 0, 0, 0);
        }
        if irql.previous() >= DISPATCH_LEVEL {
            ke_bugcheck_ex(
                codes::IRQL_NOT_LESS_OR_EQUAL,
                irql.previous() as u64,
                DISPATCH_LEVEL as u64,
                0,
                0,
            );
        }
    }

    /// Block the current thread until someone unblocks it
    ///
    /// Returns false without blocking if a racing unblock already arrived.
    ///
    /// # Safety
    /// `irql` must be the caller's own raise from below DISPATCH_LEVEL.
    pub(crate) unsafe fn block_at_dpc_level(&self, irql: &IrqlToken<DispatchLevel>) -> bool {
        let prcb = self.current_prcb(irql);
        self.check_can_block(prcb, irql);
        let thread = prcb.current_thread();

        let mut database = self.dispatcher.lock_at_dpc_level(irql);
        if (*thread).dont_block.swap(false, Ordering::AcqRel) {
            return false;
        }

        (*thread).state = ThreadState::Waiting;
        (*thread).saved_irql = irql.previous();
        let next = self.select_next(&mut database, prcb);
        self.swap_thread(irql, database, thread, next);
        true
    }

    /// Put the current thread on the sleep list until `wake_time` (ns) or an
    /// earlier unblock
    ///
    /// Returns false without sleeping if a racing unblock already arrived or
    /// the wake time has passed.
    ///
    /// # Safety
    /// As for [`Kernel::block_at_dpc_level`].
    pub(crate) unsafe fn sleep_until_at_dpc_level(&self, irql: &IrqlToken<DispatchLevel>, wake_time: u64) -> bool {
        let prcb = self.current_prcb(irql);
        self.check_can_block(prcb, irql);
        let thread = prcb.current_thread();

        let mut database = self.dispatcher.lock_at_dpc_level(irql);
        if (*thread).dont_block.swap(false, Ordering::AcqRel) {
            return false;
        }
        if wake_time <= self.hal.now_ns() {
            return false;
        }

        (*thread).state = ThreadState::Sleeping { wake_time };
        (*thread).saved_irql = irql.previous();
        database.insert_sleeper(thread, wake_time);
        self.next_wake_time.fetch_min(wake_time, Ordering::AcqRel);

        let next = self.select_next(&mut database, prcb);
        self.swap_thread(irql, database, thread, next);
        true
    }

    /// Block the current thread until another party unblocks it
    ///
    /// May return early (false) when an unblock raced ahead of the call.
    pub fn block(&self) -> bool {
        let irql = self.raise_irql::<DispatchLevel>();
        let blocked = unsafe { self.block_at_dpc_level(&irql) };
        self.lower_irql(irql);
        blocked
    }

    /// Sleep until the absolute time `wake_time` (ns) or an earlier unblock
    pub fn sleep_until(&self, wake_time: u64) -> bool {
        let irql = self.raise_irql::<DispatchLevel>();
        let slept = unsafe { self.sleep_until_at_dpc_level(&irql, wake_time) };
        self.lower_irql(irql);
        slept
    }

    /// Sleep for `duration_ns` nanoseconds or until an earlier unblock
    pub fn sleep(&self, duration_ns: u64) -> bool {
        self.sleep_until(self.hal.now_ns().saturating_add(duration_ns))
    }

    /// Move a Waiting or Sleeping thread back to Ready
    ///
    /// A thread that is still Running gets its `dont_block` latch set
    /// instead. Returns true if the thread was made Ready.
    pub fn unblock(&self, thread: *mut KThread) -> bool {
        let irql = self.raise_irql::<DispatchLevel>();
        let readied = unsafe { self.unblock_at_dpc_level(&irql, thread) };
        self.lower_irql(irql);
        readied
    }

    /// [`Kernel::unblock`] for callers already at DISPATCH_LEVEL
    ///
    /// # Safety
    /// The thread must be live; the caller must not hold its lock or the
    /// dispatcher lock.
    pub(crate) unsafe fn unblock_at_dpc_level(&self, irql: &IrqlToken<DispatchLevel>, thread: *mut KThread) -> bool {
        let _thread_lock = (*thread).lock.lock_at_dpc_level(irql);
        self.unblock_locked(irql, thread)
    }

    /// [`Kernel::unblock`] for callers holding the thread lock
    ///
    /// # Safety
    /// The thread must be live and its lock held by the caller.
    pub(crate) unsafe fn unblock_locked(&self, irql: &IrqlToken<DispatchLevel>, thread: *mut KThread) -> bool {
        let mut database = self.dispatcher.lock_at_dpc_level(irql);
        match (*thread).state {
            ThreadState::Waiting => {
                self.ready_locked(irql, &mut database, thread);
                true
            }
            ThreadState::Sleeping { .. } => {
                (*thread).wait_list_entry.remove_entry();
                self.next_wake_time.store(database.earliest_wake(), Ordering::Release);
                self.ready_locked(irql, &mut database, thread);
                true
            }
            ThreadState::Running => {
                (*thread).dont_block.store(true, Ordering::Release);
                false
            }
            _ => false,
        }
    }

    /// Ready every sleeper whose wake time has passed
    unsafe fn wake_sleepers(
        &self,
        irql: &IrqlToken<DispatchLevel>,
        database: &mut DispatcherDatabase,
        now: u64,
    ) -> usize {
        let mut woken = 0;
        loop {
            let entry = database.sleep_list.first();
            if entry.is_null() {
                break;
            }
            let thread = containing_record!(entry, KThread, wait_list_entry);
            if wake_time_of(thread) > now {
                break;
            }

            (*thread).wait_list_entry.remove_entry();
            // Ends a timed wait; a no-op if the wait already ended otherwise
            (*thread).wait.completion.try_complete(WaitOutcome::Timeout);
            self.ready_locked(irql, database, thread);
            woken += 1;
        }
        self.next_wake_time.store(database.earliest_wake(), Ordering::Release);
        woken
    }

    /// Clock-interrupt accounting for the current thread
    ///
    /// Charges the cycles since the last stamp against the quantum and flags
    /// quantum end when it runs out; also flags a dispatch when a sleeper is
    /// due. Never switches. Returns true if this call flagged quantum end.
    pub fn on_timer<L: SynchLevel>(&self, irql: &IrqlToken<L>) -> bool {
        let prcb = self.current_prcb(irql);
        let thread = prcb.current_thread();
        if thread.is_null() {
            return false;
        }

        let exhausted = unsafe { self.charge_cycles(prcb, thread) };
        let expired = exhausted && prcb.request_quantum_end();

        let sleeper_due = self.hal.now_ns() >= self.next_wake_time.load(Ordering::Acquire);
        if sleeper_due {
            prcb.request_dispatch();
        }

        if expired || sleeper_due {
            self.hal.request_software_interrupt(prcb.number(), DISPATCH_LEVEL);
        }
        expired
    }

    /// Quantum end: wake due sleepers, refill the quantum and rotate to the
    /// next thread at or above the current level, if any
    ///
    /// # Safety
    /// Must run at DISPATCH_LEVEL in the drain path.
    pub(crate) unsafe fn handle_quantum_end(&self, irql: &IrqlToken<DispatchLevel>) {
        let prcb = self.current_prcb(irql);
        prcb.clear_quantum_end();
        self.hal.arm_oneshot(self.config().quantum_timer_us);

        let current = prcb.current_thread();
        if current.is_null() {
            return;
        }

        let mut database = self.dispatcher.lock_at_dpc_level(irql);
        self.wake_sleepers(irql, &mut database, self.hal.now_ns());

        let idle = prcb.is_idle(current);
        let floor = if idle {
            0
        } else {
            (*current).quantum.store(self.config().quantum_cycles, Ordering::Relaxed);
            (*current).level
        };

        let next = database.ready.pop_at_or_above(floor);
        if next.is_null() {
            return;
        }

        (*current).state = ThreadState::Ready;
        if !idle {
            database.ready.insert_tail(current);
        }
        self.swap_thread(irql, database, current, next);
    }

    /// Preemption point: switch to a ready thread above the current one
    ///
    /// # Safety
    /// Must run at DISPATCH_LEVEL in the drain path.
    pub(crate) unsafe fn dispatch_ready_thread(&self, irql: &IrqlToken<DispatchLevel>) {
        let prcb = self.current_prcb(irql);
        prcb.clear_dispatch_pending();

        let current = prcb.current_thread();
        if current.is_null() {
            return;
        }

        let mut database = self.dispatcher.lock_at_dpc_level(irql);
        self.wake_sleepers(irql, &mut database, self.hal.now_ns());
        // Anything the wake asked of this processor is handled right here
        prcb.clear_dispatch_pending();

        let idle = prcb.is_idle(current);
        let floor = if idle { 0 } else { (*current).level + 1 };
        let next = database.ready.pop_at_or_above(floor);
        if next.is_null() {
            return;
        }

        // A preempted thread keeps its place at the front of its level
        (*current).state = ThreadState::Ready;
        if !idle {
            database.ready.insert_head(current);
        }
        self.swap_thread(irql, database, current, next);
    }

    /// Give up the rest of the quantum to a thread at or above the current
    /// level
    ///
    /// Returns true if another thread ran.
    pub fn yield_execution(&self) -> bool {
        let irql = self.raise_irql::<DispatchLevel>();
        let prcb = self.current_prcb(&irql);
        let current = prcb.current_thread();

        let switched = unsafe {
            let mut database = self.dispatcher.lock_at_dpc_level(&irql);
            let idle = prcb.is_idle(current);
            let floor = if idle { 0 } else { (*current).level };
            let next = database.ready.pop_at_or_above(floor);
            if next.is_null() {
                false
            } else {
                (*current).quantum.store(self.config().quantum_cycles, Ordering::Relaxed);
                (*current).state = ThreadState::Ready;
                if !idle {
                    database.ready.insert_tail(current);
                }
                self.swap_thread(&irql, database, current, next);
                true
            }
        };

        self.lower_irql(irql);
        switched
    }

    /// Change a thread's relative priority, returning the old one
    ///
    /// A Ready thread moves to its new level's queue; a running thread that
    /// drops below a ready one is preempted on the way out.
    pub fn set_priority(&self, thread: *mut KThread, priority: ThreadPriority) -> ThreadPriority {
        let irql = self.raise_irql::<DispatchLevel>();
        let old = unsafe {
            let mut database = self.dispatcher.lock_at_dpc_level(&irql);
            let old = (*thread).priority;
            let level = priority_level((&(*thread).process).priority_class(), priority);
            (*thread).priority = priority;

            if (*thread).state == ThreadState::Ready && (*thread).wait_list_entry.is_linked() {
                database.ready.remove(thread);
                (*thread).level = level;
                self.ready_locked(&irql, &mut database, thread);
            } else {
                (*thread).level = level;
                let prcb = self.current_prcb(&irql);
                if thread == prcb.current_thread() && database.ready.highest_level().is_some_and(|l| l > level) {
                    prcb.request_dispatch();
                }
            }
            old
        };
        self.lower_irql(irql);
        old
    }

    /// Release what a terminating thread still holds: refuse new APCs and
    /// run down the queued ones
    ///
    /// Terminating while owning a mutex is fatal.
    ///
    /// # Safety
    /// The thread must be live.
    pub(crate) unsafe fn run_down_thread(&self, thread: *mut KThread) {
        let owned = (*thread).owned_mutexes.load(Ordering::Acquire);
        if owned != 0 {
            ke_bugcheck_ex(codes::THREAD_TERMINATE_HELD_MUTEX, thread as u64, owned as u64, 0, 0);
        }
        self.rundown_apcs(thread);
    }

    /// Terminate the current thread and switch away for good
    pub fn terminate_current_thread(&self) -> ! {
        let thread = self.current_thread();
        unsafe { self.run_down_thread(thread) };

        let irql = self.raise_irql::<DispatchLevel>();
        let prcb = self.current_prcb(&irql);
        unsafe {
            let mut database = self.dispatcher.lock_at_dpc_level(&irql);
            (*thread).state = ThreadState::Terminated;
            log::debug!("thread {} ({}) terminated", (*thread).thread_id, (*thread).name);
            let next = self.select_next(&mut database, prcb);
            self.swap_thread(&irql, database, thread, next);
        }

        // A terminated thread is never switched back to
        ke_bugcheck_ex(codes::INVALID_DATA_ACCESS_TRAP, thread as u64, 0, 0, 0)
    }
}
