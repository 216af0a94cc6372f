//! Kernel Mutex Implementation (KMUTEX)
//!
//! A mutex provides mutual exclusion with the ability to block
//! waiting threads. Unlike spinlocks, mutexes allow the thread
//! to sleep while waiting, freeing the CPU for other work.
//!
//! Features:
//! - Recursive locking (same thread can acquire multiple times)
//! - Ownership tracking; release by anyone but the owner is fatal
//! - Optional kernel APC disable while held
//!
//! The signal state is 1 while free and 0 while owned. Ownership passes
//! straight from the releasing thread to the oldest waiter.
//!
//! # Usage
//! ```ignore
//! static MUTEX: KMutex = KMutex::new();
//!
//! // Acquire (blocks if held by another thread)
//! MUTEX.acquire(ke)?;
//!
//! // ... critical section ...
//!
//! // Release
//! MUTEX.release(ke);
//! ```

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use super::bugcheck::{codes, ke_bugcheck_ex};
use super::dispatcher::{DispatcherHeader, DispatcherType, ObjectGuard, WaitStatus};
use super::irql::DispatchLevel;
use super::kernel::Kernel;
use super::thread::{KThread, ProcessorMode};
use super::KeError;

/// Kernel Mutex
///
/// Equivalent to NT's KMUTEX/KMUTANT
#[repr(C)]
pub struct KMutex {
    /// Dispatcher header (must be first for casting)
    pub header: DispatcherHeader,
    /// Owning thread (null if not owned)
    owner_thread: AtomicPtr<KThread>,
    /// Recursion count (how many times owner has acquired); header lock
    recursion_count: UnsafeCell<u32>,
    /// Disable the owner's normal kernel APCs while held
    apc_disable: bool,
}

// Safety: KMutex is designed for multi-threaded access
unsafe impl Sync for KMutex {}
unsafe impl Send for KMutex {}

impl KMutex {
    /// Create a mutex that disables kernel APCs for its owner
    ///
    /// Equivalent to KeInitializeMutex()
    pub const fn new() -> Self {
        Self::with_apc_disable(true)
    }

    /// Create a mutex, choosing whether ownership disables kernel APCs
    pub const fn with_apc_disable(apc_disable: bool) -> Self {
        Self {
            header: DispatcherHeader::new(DispatcherType::Mutex, 1),
            owner_thread: AtomicPtr::new(ptr::null_mut()),
            recursion_count: UnsafeCell::new(0),
            apc_disable,
        }
    }

    /// Recover the mutex around its header
    ///
    /// # Safety
    /// `header` must be the header of a `KMutex`.
    #[inline]
    pub(crate) unsafe fn from_header(header: &DispatcherHeader) -> &KMutex {
        &*(header as *const DispatcherHeader as *const KMutex)
    }

    /// Get the owning thread
    #[inline]
    pub fn owner(&self) -> *mut KThread {
        self.owner_thread.load(Ordering::Acquire)
    }

    /// Check if the mutex is owned
    #[inline]
    pub fn is_owned(&self) -> bool {
        !self.owner().is_null()
    }

    /// Check if owned by the current thread
    #[inline]
    pub fn is_owned_by_current(&self, ke: &Kernel) -> bool {
        self.owner() == ke.current_thread()
    }

    /// Recursion depth of the current owner (snapshot)
    pub fn recursion_count(&self) -> u32 {
        unsafe { ptr::read_volatile(self.recursion_count.get()) }
    }

    /// Read the signal state (1 = free, 0 = owned)
    ///
    /// Equivalent to KeReadStateMutex()
    #[inline]
    pub fn read_state(&self) -> i32 {
        self.header.signal_state()
    }

    /// Hand the mutex to `thread` (or deepen its recursion)
    ///
    /// Called with the header lock held.
    pub(crate) unsafe fn take_ownership(&self, guard: &mut ObjectGuard<'_>, thread: *mut KThread) {
        let count = &mut *self.recursion_count.get();
        if self.owner() == thread {
            *count += 1;
            return;
        }

        self.owner_thread.store(thread, Ordering::Release);
        *count = 1;
        guard.set_signal_state(0);
        (*thread).owned_mutexes.fetch_add(1, Ordering::Relaxed);
        if self.apc_disable {
            (*thread).kernel_apc_disable.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Acquire the mutex
    ///
    /// Blocks the calling thread until the mutex is available.
    /// If the current thread already owns the mutex, increments
    /// the recursion count.
    pub fn acquire(&self, ke: &Kernel) -> Result<WaitStatus, KeError> {
        ke.wait_for_single_object(&self.header, ProcessorMode::KernelMode, false, None)
    }

    /// Try to acquire the mutex without blocking
    ///
    /// Returns true if acquired, false if mutex is held by another thread
    pub fn try_acquire(&self, ke: &Kernel) -> bool {
        matches!(
            ke.wait_for_single_object(&self.header, ProcessorMode::KernelMode, false, Some(0)),
            Ok(WaitStatus::Object(0))
        )
    }

    /// Release the mutex
    ///
    /// Decrements recursion count. When count reaches 0, the mutex
    /// becomes available and passes to the oldest waiter.
    ///
    /// Returns the recursion depth still held by the caller.
    /// Release by a thread that doesn't own the mutex is fatal.
    pub fn release(&self, ke: &Kernel) -> u32 {
        let current = ke.current_thread();
        let irql = ke.raise_irql::<DispatchLevel>();

        let remaining = {
            let mut object = self.header.lock(&irql);

            let owner = self.owner();
            if owner != current {
                drop(object);
                ke_bugcheck_ex(
                    codes::THREAD_NOT_MUTEX_OWNER,
                    self as *const KMutex as u64,
                    owner as u64,
                    current as u64,
                    0,
                );
            }

            // SAFETY: header lock held
            let count = unsafe { &mut *self.recursion_count.get() };
            *count -= 1;
            let remaining = *count;

            if remaining == 0 {
                self.owner_thread.store(ptr::null_mut(), Ordering::Release);
                object.set_signal_state(1);
                unsafe {
                    (*current).owned_mutexes.fetch_sub(1, Ordering::Relaxed);
                    object.wake_waiters(ke, &irql);
                }
            }
            remaining
        };

        if remaining == 0 && self.apc_disable {
            ke.leave_critical_region();
        }

        ke.lower_irql(irql);
        remaining
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII mutex guard for scoped locking
pub struct MutexGuard<'a> {
    mutex: &'a KMutex,
    ke: &'a Kernel,
}

impl<'a> MutexGuard<'a> {
    /// Create a new guard by acquiring the mutex
    pub fn new(mutex: &'a KMutex, ke: &'a Kernel) -> Result<Self, KeError> {
        mutex.acquire(ke)?;
        Ok(Self { mutex, ke })
    }
}

impl<'a> Drop for MutexGuard<'a> {
    fn drop(&mut self) {
        self.mutex.release(self.ke);
    }
}
