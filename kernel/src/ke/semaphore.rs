//! Kernel Semaphore Implementation (KSEMAPHORE)
//!
//! A semaphore is a synchronization object that maintains a count.
//! Multiple threads can acquire the semaphore as long as the count
//! is greater than zero. When the count reaches zero, waiting threads
//! block until another thread releases the semaphore.
//!
//! # Usage
//! ```ignore
//! // Create a semaphore with initial count 3 and max 5
//! let sem = KSemaphore::new(3, 5)?;
//!
//! // Thread acquires (decrements count)
//! sem.wait(ke, ProcessorMode::KernelMode, false, None)?;  // count: 3 -> 2
//!
//! // Thread releases (increments count)
//! sem.release(ke, 1)?;  // count: 2 -> 3
//! ```
//!
//! # NT Compatibility
//! Equivalent to NT's KSEMAPHORE / KeInitializeSemaphore / KeReleaseSemaphore

use super::dispatcher::{DispatcherHeader, DispatcherType, WaitStatus};
use super::irql::DispatchLevel;
use super::kernel::Kernel;
use super::thread::ProcessorMode;
use super::KeError;

/// Kernel Semaphore
///
/// Equivalent to NT's KSEMAPHORE
#[repr(C)]
pub struct KSemaphore {
    /// Dispatcher header (must be first for casting)
    /// signal_state holds the current count
    pub header: DispatcherHeader,
    /// Maximum count limit
    limit: i32,
}

impl KSemaphore {
    /// Create a semaphore
    ///
    /// # Arguments
    /// * `initial_count` - Starting count (number of available resources)
    /// * `limit` - Maximum count the semaphore can reach
    ///
    /// The limit must be positive and the count within `0..=limit`.
    pub const fn new(initial_count: i32, limit: i32) -> Result<Self, KeError> {
        if limit <= 0 || initial_count < 0 || initial_count > limit {
            return Err(KeError::InvalidParameter);
        }
        Ok(Self {
            header: DispatcherHeader::new(DispatcherType::Semaphore, initial_count),
            limit,
        })
    }

    /// Get the current count
    ///
    /// Equivalent to KeReadStateSemaphore()
    #[inline]
    pub fn read_state(&self) -> i32 {
        self.header.signal_state()
    }

    /// Get the maximum count
    #[inline]
    pub fn limit(&self) -> i32 {
        self.limit
    }

    /// Release the semaphore
    ///
    /// Adds `adjustment` to the count and wakes as many waiters as the new
    /// count allows, oldest first.
    ///
    /// Returns the previous count. Pushing the count past the limit fails
    /// with `SemaphoreLimitExceeded` and changes nothing.
    pub fn release(&self, ke: &Kernel, adjustment: i32) -> Result<i32, KeError> {
        if adjustment <= 0 {
            return Err(KeError::InvalidParameter);
        }

        let irql = ke.raise_irql::<DispatchLevel>();
        let result = {
            let mut object = self.header.lock(&irql);
            let previous = object.signal_state();

            match previous.checked_add(adjustment) {
                Some(count) if count <= self.limit => {
                    object.set_signal_state(count);
                    if previous == 0 {
                        unsafe { object.wake_waiters(ke, &irql) };
                    }
                    Ok(previous)
                }
                _ => Err(KeError::SemaphoreLimitExceeded),
            }
        };
        ke.lower_irql(irql);

        if result.is_err() {
            log::warn!("semaphore {:p} release by {} exceeds limit {}", self, adjustment, self.limit);
        }
        result
    }

    /// Wait for the semaphore (decrements count once satisfied)
    pub fn wait(
        &self,
        ke: &Kernel,
        mode: ProcessorMode,
        alertable: bool,
        timeout_ns: Option<u64>,
    ) -> Result<WaitStatus, KeError> {
        ke.wait_for_single_object(&self.header, mode, alertable, timeout_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{SendPtr, TestSystem};
    use crate::ke::thread::ThreadState;

    #[test]
    fn test_creation_bounds() {
        assert!(KSemaphore::new(0, 1).is_ok());
        assert_eq!(KSemaphore::new(2, 1).err(), Some(KeError::InvalidParameter));
        assert_eq!(KSemaphore::new(0, 0).err(), Some(KeError::InvalidParameter));
        assert_eq!(KSemaphore::new(-1, 4).err(), Some(KeError::InvalidParameter));
    }

    #[test]
    fn test_release_over_limit_changes_nothing() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let sem = KSemaphore::new(1, 2).unwrap();

        assert_eq!(sem.release(ke, 1), Ok(1));
        assert_eq!(sem.release(ke, 1), Err(KeError::SemaphoreLimitExceeded));
        assert_eq!(sem.read_state(), 2);
        assert_eq!(sem.release(ke, 0), Err(KeError::InvalidParameter));
    }

    #[test]
    fn test_wait_consumes_units() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let sem = KSemaphore::new(2, 2).unwrap();
        let mode = ProcessorMode::KernelMode;

        assert_eq!(sem.wait(ke, mode, false, Some(0)), Ok(WaitStatus::Object(0)));
        assert_eq!(sem.wait(ke, mode, false, Some(0)), Ok(WaitStatus::Object(0)));
        assert_eq!(sem.wait(ke, mode, false, Some(0)), Ok(WaitStatus::Timeout));
        assert_eq!(sem.read_state(), 0);
    }

    #[test]
    fn test_blocked_waiter_released_by_other_thread() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let sem: &'static KSemaphore = Box::leak(Box::new(KSemaphore::new(0, 1).unwrap()));
        let main = SendPtr(sys.main_thread);

        // Thread B runs while A is switched out
        sys.on_next_switch(move || {
            let main = main;
            unsafe { assert_eq!((*main.0).state(), ThreadState::Waiting) };
            assert_eq!(sem.release(ke, 1), Ok(0));
            unsafe { assert_eq!((*main.0).state(), ThreadState::Ready) };
        });

        let status = sem.wait(ke, ProcessorMode::KernelMode, false, None);
        assert_eq!(status, Ok(WaitStatus::Object(0)));
        assert_eq!(sem.read_state(), 0);
        assert_eq!(sys.hal.switch_count(), 2);
    }
}
