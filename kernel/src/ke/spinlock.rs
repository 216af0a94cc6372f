//! Kernel Spinlock Implementation (KSPIN_LOCK)
//!
//! Spinlocks provide mutual exclusion for short critical sections.
//! They busy-wait (spin) until the lock becomes available.
//!
//! Every spinlock lives at DISPATCH_LEVEL or above: holding one while being
//! preempted would let the new thread spin on a lock whose owner can never
//! run. Two acquisition forms exist:
//!
//! - [`SpinLock::lock`] raises to DISPATCH_LEVEL, acquires, and the guard
//!   releases and lowers back on drop
//! - [`SpinLock::lock_at_dpc_level`] takes an [`IrqlToken`] proving the caller
//!   already runs at a synchronization level and only acquires
//!
//! Acquire uses acquire ordering and release uses release ordering, so all
//! writes made inside the critical section are visible to the next holder.
//! Locks are not reentrant: re-acquiring a held lock on the same processor
//! spins forever.
//!
//! # Usage
//! ```ignore
//! let lock = SpinLock::new(0u32);
//! let mut guard = lock.lock(ke);
//! *guard += 1;
//! // guard dropped, lock released, IRQL restored
//! ```

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::kernel::Kernel;
use super::irql::{DispatchLevel, IrqlToken, SynchLevel};

/// Exponential backoff for contended spinning
struct Backoff {
    step: u32,
}

impl Backoff {
    /// Cap at 2^6 pause instructions per round
    const SPIN_LIMIT: u32 = 6;

    #[inline]
    const fn new() -> Self {
        Self { step: 0 }
    }

    #[inline]
    fn spin(&mut self) {
        for _ in 0..(1u32 << self.step) {
            spin_loop();
        }
        if self.step < Self::SPIN_LIMIT {
            self.step += 1;
        }
    }
}

/// A spinlock for mutual exclusion
///
/// Equivalent to NT's KSPIN_LOCK
#[repr(C)]
pub struct SpinLock<T> {
    /// Lock state (true = locked)
    locked: AtomicBool,
    /// Protected data
    data: UnsafeCell<T>,
}

/// Lock without protected data, for structures whose fields it guards
/// by convention
pub type KSpinLock = SpinLock<()>;

// SpinLock is Sync if T is Send (data can be sent between threads)
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    fn acquire_raw(&self) {
        let mut backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
    }

    #[inline]
    fn try_acquire_raw(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn release_raw(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Acquire the lock without changing IRQL
    ///
    /// Equivalent to KeAcquireSpinLockAtDpcLevel(). The token proves the caller
    /// is already at a level where it cannot be preempted.
    #[inline]
    pub fn lock_at_dpc_level<'a, L: SynchLevel>(
        &'a self,
        _irql: &'a IrqlToken<L>,
    ) -> SpinLockGuard<'a, T> {
        self.acquire_raw();
        SpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without changing IRQL or spinning
    #[inline]
    pub fn try_lock_at_dpc_level<'a, L: SynchLevel>(
        &'a self,
        _irql: &'a IrqlToken<L>,
    ) -> Option<SpinLockGuard<'a, T>> {
        if self.try_acquire_raw() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Raise to DISPATCH_LEVEL and acquire
    ///
    /// Equivalent to KeAcquireSpinLock(). Dropping the guard releases the lock
    /// and lowers IRQL back to where this call found it.
    #[inline]
    pub fn lock<'a>(&'a self, ke: &'a Kernel) -> SpinLockIrqlGuard<'a, T> {
        let irql = ke.raise_irql::<DispatchLevel>();
        self.acquire_raw();
        SpinLockIrqlGuard {
            lock: self,
            ke,
            irql: Some(irql),
        }
    }

    /// Acquire without an IRQL proof
    ///
    /// # Safety
    /// The caller must be at DISPATCH_LEVEL or above and must release with
    /// [`SpinLock::force_unlock`].
    #[inline]
    pub unsafe fn raw_lock(&self) {
        self.acquire_raw();
    }

    /// Release a lock taken with [`SpinLock::raw_lock`]
    ///
    /// # Safety
    /// The caller must own the lock.
    #[inline]
    pub unsafe fn force_unlock(&self) {
        self.release_raw();
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Raw access to the protected data
    ///
    /// # Safety
    /// Only for racy snapshot reads or while the caller holds the lock.
    #[inline]
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    /// Exclusive access through a unique reference (no locking needed)
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for a spinlock acquired at DISPATCH_LEVEL or above
///
/// Releases the lock when dropped; IRQL is left alone
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_raw();
    }
}

/// RAII guard for a spinlock that raised IRQL on acquisition
///
/// Releases the lock, then lowers IRQL
pub struct SpinLockIrqlGuard<'a, T> {
    lock: &'a SpinLock<T>,
    ke: &'a Kernel,
    irql: Option<IrqlToken<DispatchLevel>>,
}

impl<'a, T> Deref for SpinLockIrqlGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockIrqlGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockIrqlGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_raw();
        if let Some(irql) = self.irql.take() {
            self.ke.lower_irql(irql);
        }
    }
}

// ============================================================================
// Reader/Writer Spinlock
// ============================================================================

/// Writer announced: new readers hold off
const WRITER_WAITING: u32 = 1 << 31;
/// Reader-count value meaning "a writer owns the lock"
const WRITER_HELD: u32 = WRITER_WAITING - 1;

/// Reader/writer spinlock
///
/// Many readers or one writer. A writer that starts waiting sets a flag that
/// stops new readers from entering, so a steady stream of readers cannot
/// starve it. Like [`SpinLock`], it is only held at DISPATCH_LEVEL or above.
pub struct RwSpinLock<T> {
    /// Low 31 bits: reader count (or WRITER_HELD); top bit: WRITER_WAITING
    state: AtomicU32,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}
unsafe impl<T: Send> Send for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    fn acquire_shared(&self) {
        let mut backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Relaxed);
            let readers = state & !WRITER_WAITING;
            if state & WRITER_WAITING == 0 && readers != WRITER_HELD {
                if self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            backoff.spin();
        }
    }

    fn acquire_exclusive(&self) {
        let mut backoff = Backoff::new();
        self.state.fetch_or(WRITER_WAITING, Ordering::Relaxed);
        loop {
            // Only the waiting bit left: every reader and the previous
            // writer are gone
            if self
                .state
                .compare_exchange_weak(WRITER_WAITING, WRITER_HELD, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            // Another writer may have cleared our bit when it took the lock
            let state = self.state.load(Ordering::Relaxed);
            if state & WRITER_WAITING == 0 {
                if state == 0
                    && self
                        .state
                        .compare_exchange_weak(0, WRITER_HELD, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    return;
                }
                self.state.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            }
            backoff.spin();
        }
    }

    fn release_shared(&self) {
        self.state.fetch_sub(1, Ordering::Release);
    }

    fn release_exclusive(&self) {
        // Keep a waiting-writer flag set by someone else
        self.state.fetch_and(WRITER_WAITING, Ordering::Release);
    }

    /// Acquire shared without changing IRQL
    pub fn read_at_dpc_level<'a, L: SynchLevel>(
        &'a self,
        _irql: &'a IrqlToken<L>,
    ) -> RwSpinLockReadGuard<'a, T> {
        self.acquire_shared();
        RwSpinLockReadGuard { lock: self }
    }

    /// Acquire exclusive without changing IRQL
    pub fn write_at_dpc_level<'a, L: SynchLevel>(
        &'a self,
        _irql: &'a IrqlToken<L>,
    ) -> RwSpinLockWriteGuard<'a, T> {
        self.acquire_exclusive();
        RwSpinLockWriteGuard { lock: self }
    }

    /// Current raw state word (diagnostics)
    pub fn raw_state(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }
}

/// Shared access guard
pub struct RwSpinLockReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<'a, T> Deref for RwSpinLockReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for RwSpinLockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

/// Exclusive access guard
pub struct RwSpinLockWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<'a, T> Deref for RwSpinLockWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for RwSpinLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for RwSpinLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::TestSystem;
    use crate::ke::irql::levels::{DISPATCH_LEVEL, PASSIVE_LEVEL};
    use std::sync::Arc;

    #[test]
    fn test_lock_raises_and_restores_irql() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let lock = SpinLock::new(5u32);

        {
            let mut guard = lock.lock(ke);
            assert_eq!(ke.current_irql(), DISPATCH_LEVEL);
            assert!(lock.is_locked());
            *guard += 1;
        }

        assert!(!lock.is_locked());
        assert_eq!(ke.current_irql(), PASSIVE_LEVEL);
        assert_eq!(unsafe { *lock.data_ptr() }, 6);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = KSpinLock::new(());
        let irql = unsafe { IrqlToken::<DispatchLevel>::assume() };

        let guard = lock.lock_at_dpc_level(&irql);
        assert!(lock.try_lock_at_dpc_level(&irql).is_none());
        drop(guard);
        assert!(lock.try_lock_at_dpc_level(&irql).is_some());
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        const THREADS: usize = 4;
        const ITERATIONS: usize = 10_000;

        let lock = Arc::new(SpinLock::new(0usize));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    let irql = unsafe { IrqlToken::<DispatchLevel>::assume() };
                    for _ in 0..ITERATIONS {
                        let mut guard = lock.lock_at_dpc_level(&irql);
                        // Non-atomic read-modify-write: lost updates show up
                        // as a short total
                        let value = *guard;
                        std::hint::black_box(&value);
                        *guard = value + 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(unsafe { *lock.data_ptr() }, THREADS * ITERATIONS);
    }

    #[test]
    fn test_rw_readers_share() {
        let lock = RwSpinLock::new(7u32);
        let irql = unsafe { IrqlToken::<DispatchLevel>::assume() };

        let a = lock.read_at_dpc_level(&irql);
        let b = lock.read_at_dpc_level(&irql);
        assert_eq!(*a + *b, 14);
        assert_eq!(lock.raw_state(), 2);
        drop(a);
        drop(b);
        assert_eq!(lock.raw_state(), 0);

        {
            let mut w = lock.write_at_dpc_level(&irql);
            *w = 9;
            assert_eq!(lock.raw_state(), WRITER_HELD);
        }
        assert_eq!(lock.raw_state(), 0);
        assert_eq!(*lock.read_at_dpc_level(&irql), 9);
    }

    #[test]
    fn test_rw_writer_excludes_readers() {
        const WRITERS: usize = 2;
        const READERS: usize = 2;
        const ITERATIONS: usize = 2_000;

        // Writers keep both halves equal; readers must never see them differ
        let lock = Arc::new(RwSpinLock::new((0u64, 0u64)));
        let mut handles = Vec::new();

        for _ in 0..WRITERS {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                let irql = unsafe { IrqlToken::<DispatchLevel>::assume() };
                for _ in 0..ITERATIONS {
                    let mut w = lock.write_at_dpc_level(&irql);
                    w.0 += 1;
                    std::hint::black_box(&*w);
                    w.1 += 1;
                }
            }));
        }
        for _ in 0..READERS {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                let irql = unsafe { IrqlToken::<DispatchLevel>::assume() };
                for _ in 0..ITERATIONS {
                    let r = lock.read_at_dpc_level(&irql);
                    assert_eq!(r.0, r.1);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        let irql = unsafe { IrqlToken::<DispatchLevel>::assume() };
        let r = lock.read_at_dpc_level(&irql);
        assert_eq!(r.0, (WRITERS * ITERATIONS) as u64);
    }
}
