//! Dispatcher Objects (DISPATCHER_HEADER)
//!
//! All waitable kernel objects (events, semaphores, mutexes) share a common
//! DISPATCHER_HEADER so the wait system can handle them uniformly.
//!
//! The header carries the object's spin lock, its signal state and the FIFO
//! list of wait blocks. Everything here runs with that lock held:
//!
//! - deciding whether an object is signaled for a given thread
//! - consuming the signal when a wait is satisfied (per-type rule)
//! - handing a signal to queued waiters, oldest first
//!
//! # Wait completion
//!
//! A thread's wait has a single completion slot. Whoever ends the wait (a
//! signaler, the timeout path, an APC or alert) claims the slot with a
//! compare-and-swap from PENDING; everyone else sees the CAS fail and backs
//! off. Signalers also null a wait block's thread pointer as they unlink it,
//! so the waiter knows which blocks are still registered.

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use super::kernel::Kernel;
use super::irql::{DispatchLevel, IrqlToken};
use super::list::ListEntry;
use super::mutex::KMutex;
use super::spinlock::{KSpinLock, SpinLockGuard};
use super::thread::KThread;
use crate::containing_record;

/// Object types for dispatcher objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherType {
    /// Manual-reset event: stays signaled, releases every waiter
    NotificationEvent = 0,
    /// Auto-reset event: releases one waiter and resets
    SynchronizationEvent = 1,
    /// Counting semaphore
    Semaphore = 2,
    /// Recursive owned mutex
    Mutex = 3,
}

/// Dispatcher object header
///
/// This is embedded at the start of all waitable objects.
/// Equivalent to NT's DISPATCHER_HEADER.
#[repr(C)]
pub struct DispatcherHeader {
    /// Object type
    pub object_type: DispatcherType,
    /// Protects the signal state, the wait list and type-specific fields
    lock: KSpinLock,
    /// Signal state
    /// - For events: 0 = not signaled, 1 = signaled
    /// - For mutex: 1 = available, 0 = owned
    /// - For semaphore: count of available resources
    signal_state: UnsafeCell<i32>,
    /// Wait blocks of threads waiting on this object, oldest first
    wait_list_head: UnsafeCell<ListEntry>,
}

// Safety: interior state is only touched under `lock`
unsafe impl Sync for DispatcherHeader {}
unsafe impl Send for DispatcherHeader {}

impl DispatcherHeader {
    /// Create a new dispatcher header
    pub const fn new(object_type: DispatcherType, signal_state: i32) -> Self {
        Self {
            object_type,
            lock: KSpinLock::new(()),
            signal_state: UnsafeCell::new(signal_state),
            wait_list_head: UnsafeCell::new(ListEntry::new()),
        }
    }

    /// Snapshot of the signal state (no lock taken)
    #[inline]
    pub fn signal_state(&self) -> i32 {
        unsafe { ptr::read_volatile(self.signal_state.get()) }
    }

    /// Check if the object is signaled (snapshot)
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.signal_state() > 0
    }

    /// Check if there are waiters (snapshot)
    #[inline]
    pub fn has_waiters(&self) -> bool {
        unsafe { !(*self.wait_list_head.get()).is_empty() }
    }

    /// Take the object lock
    #[inline]
    pub(crate) fn lock<'a>(&'a self, irql: &'a IrqlToken<DispatchLevel>) -> ObjectGuard<'a> {
        ObjectGuard {
            header: self,
            _guard: Some(self.lock.lock_at_dpc_level(irql)),
        }
    }

    /// Acquire the object lock without a guard
    ///
    /// Used when a variable number of objects is locked at once.
    ///
    /// # Safety
    /// Caller must be at DISPATCH_LEVEL and pair this with [`Self::unlock_raw`].
    #[inline]
    pub(crate) unsafe fn lock_raw(&self) {
        self.lock.raw_lock();
    }

    /// # Safety
    /// The lock must be held through [`Self::lock_raw`].
    #[inline]
    pub(crate) unsafe fn unlock_raw(&self) {
        self.lock.force_unlock();
    }

    /// Locked view of an object whose lock the caller already holds
    ///
    /// # Safety
    /// The lock must be held through [`Self::lock_raw`] for the life of the view.
    #[inline]
    pub(crate) unsafe fn assume_locked(&self) -> ObjectGuard<'_> {
        ObjectGuard {
            header: self,
            _guard: None,
        }
    }
}

/// Locked view of a dispatcher object
pub(crate) struct ObjectGuard<'a> {
    header: &'a DispatcherHeader,
    _guard: Option<SpinLockGuard<'a, ()>>,
}

impl<'a> ObjectGuard<'a> {
    #[inline]
    pub(crate) fn header(&self) -> &'a DispatcherHeader {
        self.header
    }

    #[inline]
    pub(crate) fn signal_state(&self) -> i32 {
        unsafe { *self.header.signal_state.get() }
    }

    #[inline]
    pub(crate) fn set_signal_state(&mut self, state: i32) {
        unsafe { *self.header.signal_state.get() = state }
    }

    #[inline]
    pub(crate) fn wait_list(&mut self) -> &mut ListEntry {
        unsafe { &mut *self.header.wait_list_head.get() }
    }

    /// Would a wait by `thread` be satisfied right now?
    ///
    /// Mutexes are also signaled for the thread that already owns them.
    pub(crate) fn is_signaled_for(&self, thread: *mut KThread) -> bool {
        match self.header.object_type {
            DispatcherType::Mutex => {
                self.signal_state() > 0 || unsafe { KMutex::from_header(self.header) }.owner() == thread
            }
            _ => self.signal_state() > 0,
        }
    }

    /// Consume the signal on behalf of `thread`, whose wait it satisfies
    ///
    /// # Safety
    /// `thread` must be a live thread and the object must be signaled for it.
    pub(crate) unsafe fn satisfy(&mut self, thread: *mut KThread) {
        match self.header.object_type {
            DispatcherType::NotificationEvent => {}
            DispatcherType::SynchronizationEvent => self.set_signal_state(0),
            DispatcherType::Semaphore => {
                let count = self.signal_state();
                self.set_signal_state(count - 1);
            }
            DispatcherType::Mutex => {
                KMutex::from_header(self.header).take_ownership(self, thread);
            }
        }
    }

    /// Queue a wait block at the tail of the wait list
    ///
    /// # Safety
    /// The block must stay in place until it is unlinked again.
    #[inline]
    pub(crate) unsafe fn insert_wait_block(&mut self, block: *mut KWaitBlock) {
        self.wait_list().insert_tail(&mut (*block).wait_list_entry);
    }

    /// Hand the signal to waiters, oldest first, for as long as the object
    /// stays signaled
    ///
    /// Returns the number of threads released.
    ///
    /// # Safety
    /// Every queued wait block must belong to a live thread.
    pub(crate) unsafe fn wake_waiters(&mut self, ke: &Kernel, irql: &IrqlToken<DispatchLevel>) -> usize {
        let mut released = 0;

        loop {
            let entry = self.wait_list().first();
            if entry.is_null() {
                break;
            }

            let block = containing_record!(entry, KWaitBlock, wait_list_entry);
            let thread = (*block).thread;
            if !self.is_signaled_for(thread) {
                break;
            }

            (*block).wait_list_entry.remove_entry();
            (*block).thread = ptr::null_mut();

            match (*block).wait_type {
                WaitType::WaitAny => {
                    let index = (*block).block_index as usize;
                    if (*thread).wait.completion.try_complete(WaitOutcome::Satisfied(index)) {
                        self.satisfy(thread);
                        ke.unblock_at_dpc_level(irql, thread);
                        released += 1;
                    }
                    // Otherwise the wait already ended some other way; the
                    // block was stale
                }
                WaitType::WaitAll => {
                    // The waiter re-evaluates every object itself
                    if (*thread).wait.completion.try_complete(WaitOutcome::Recheck) {
                        ke.unblock_at_dpc_level(irql, thread);
                        released += 1;
                    }
                }
            }
        }

        released
    }
}

/// Wait block - represents a thread's wait on an object
///
/// When a thread waits on an object, a wait block is created
/// linking the thread to the object's wait list.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct KWaitBlock {
    /// Link in the object's wait list
    pub(crate) wait_list_entry: ListEntry,
    /// Thread that is waiting; nulled once the block is consumed
    pub(crate) thread: *mut KThread,
    /// Object being waited on
    pub(crate) object: *const DispatcherHeader,
    /// Wait type (WaitAll or WaitAny)
    pub(crate) wait_type: WaitType,
    /// Index of the object in the caller's array
    pub(crate) block_index: u16,
}

impl KWaitBlock {
    /// Create a new wait block
    pub const fn new() -> Self {
        Self {
            wait_list_entry: ListEntry::new(),
            thread: ptr::null_mut(),
            object: ptr::null(),
            wait_type: WaitType::WaitAny,
            block_index: 0,
        }
    }

    /// Initialize a wait block
    pub(crate) fn init(
        &mut self,
        thread: *mut KThread,
        object: *const DispatcherHeader,
        wait_type: WaitType,
        block_index: u16,
    ) {
        self.wait_list_entry.init_head();
        self.thread = thread;
        self.object = object;
        self.wait_type = wait_type;
        self.block_index = block_index;
    }
}

impl Default for KWaitBlock {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait type for multi-object waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WaitType {
    /// Wait for any one object to be signaled
    WaitAny = 0,
    /// Wait for all objects to be signaled
    WaitAll = 1,
}

/// Successful result of a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The object at this index satisfied the wait (index 0 for WaitAll)
    Object(usize),
    /// The timeout expired
    Timeout,
    /// A user-mode APC is ready for delivery
    UserApc,
    /// The thread was alerted
    Alerted,
}

/// Maximum number of objects in a multi-object wait
pub const MAXIMUM_WAIT_OBJECTS: usize = 64;

/// Number of built-in wait blocks per thread
pub const THREAD_WAIT_BLOCKS: usize = 4;

// ============================================================================
// Wait completion slot
// ============================================================================

const COMPLETION_IDLE: u32 = 0;
const COMPLETION_PENDING: u32 = 1;
const COMPLETION_TIMEOUT: u32 = 2;
const COMPLETION_USER_APC: u32 = 3;
const COMPLETION_ALERTED: u32 = 4;
const COMPLETION_RECHECK: u32 = 5;
const COMPLETION_KERNEL_APC: u32 = 6;
const COMPLETION_SATISFIED: u32 = 0x100;

/// How a wait ended (or that it has not)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// No wait in progress
    Idle,
    /// Armed, nobody has claimed it yet
    Pending,
    /// Object at this index was handed to the waiter
    Satisfied(usize),
    Timeout,
    UserApc,
    Alerted,
    /// A WaitAll object changed; re-evaluate
    Recheck,
    /// A kernel APC needs delivering; deliver and resume waiting
    KernelApc,
}

impl WaitOutcome {
    fn encode(self) -> u32 {
        match self {
            WaitOutcome::Idle => COMPLETION_IDLE,
            WaitOutcome::Pending => COMPLETION_PENDING,
            WaitOutcome::Satisfied(index) => COMPLETION_SATISFIED + index as u32,
            WaitOutcome::Timeout => COMPLETION_TIMEOUT,
            WaitOutcome::UserApc => COMPLETION_USER_APC,
            WaitOutcome::Alerted => COMPLETION_ALERTED,
            WaitOutcome::Recheck => COMPLETION_RECHECK,
            WaitOutcome::KernelApc => COMPLETION_KERNEL_APC,
        }
    }

    fn decode(raw: u32) -> Self {
        match raw {
            COMPLETION_PENDING => WaitOutcome::Pending,
            COMPLETION_TIMEOUT => WaitOutcome::Timeout,
            COMPLETION_USER_APC => WaitOutcome::UserApc,
            COMPLETION_ALERTED => WaitOutcome::Alerted,
            COMPLETION_RECHECK => WaitOutcome::Recheck,
            COMPLETION_KERNEL_APC => WaitOutcome::KernelApc,
            raw if raw >= COMPLETION_SATISFIED => WaitOutcome::Satisfied((raw - COMPLETION_SATISFIED) as usize),
            _ => WaitOutcome::Idle,
        }
    }
}

/// Atomic outcome slot of a thread's current wait
pub(crate) struct WaitCompletion(AtomicU32);

impl WaitCompletion {
    pub(crate) const fn new() -> Self {
        Self(AtomicU32::new(COMPLETION_IDLE))
    }

    /// Start a new wait round
    #[inline]
    pub(crate) fn arm(&self) {
        self.0.store(COMPLETION_PENDING, Ordering::Release);
    }

    /// Wait over; later wake attempts fail
    #[inline]
    pub(crate) fn disarm(&self) {
        self.0.store(COMPLETION_IDLE, Ordering::Release);
    }

    /// Claim the wait with `outcome`; only the first claimer succeeds
    #[inline]
    pub(crate) fn try_complete(&self, outcome: WaitOutcome) -> bool {
        self.0
            .compare_exchange(COMPLETION_PENDING, outcome.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn load(&self) -> WaitOutcome {
        WaitOutcome::decode(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire) == COMPLETION_PENDING
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_claimed_once() {
        let completion = WaitCompletion::new();
        assert!(!completion.try_complete(WaitOutcome::Timeout));

        completion.arm();
        assert!(completion.is_pending());
        assert!(completion.try_complete(WaitOutcome::Satisfied(3)));
        assert!(!completion.try_complete(WaitOutcome::Timeout));
        assert_eq!(completion.load(), WaitOutcome::Satisfied(3));

        completion.disarm();
        assert_eq!(completion.load(), WaitOutcome::Idle);
    }

    #[test]
    fn test_completion_races_have_one_winner() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        for _ in 0..100 {
            let completion = Arc::new(WaitCompletion::new());
            completion.arm();
            let winners = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = [WaitOutcome::Timeout, WaitOutcome::Satisfied(0), WaitOutcome::UserApc]
                .into_iter()
                .map(|outcome| {
                    let completion = completion.clone();
                    let winners = winners.clone();
                    std::thread::spawn(move || {
                        if completion.try_complete(outcome) {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(winners.load(Ordering::SeqCst), 1);
            assert_ne!(completion.load(), WaitOutcome::Pending);
        }
    }

    #[test]
    fn test_header_snapshot() {
        let header = DispatcherHeader::new(DispatcherType::Semaphore, 2);
        assert!(header.is_signaled());
        assert!(!header.has_waiters());
        assert_eq!(header.signal_state(), 2);
    }
}
