//! Kernel Event Implementation (KEVENT)
//!
//! Events are synchronization objects used for signaling between threads.
//! A thread can wait for an event to be signaled, and another thread
//! can signal the event to wake the waiting thread(s).
//!
//! Two types of events:
//! - **Notification (Manual Reset)**: Stays signaled until explicitly reset.
//!   Wakes ALL waiting threads when signaled.
//! - **Synchronization (Auto Reset)**: Automatically resets after waking
//!   ONE thread. Only one waiter is released per signal, oldest first.
//!
//! # Usage
//! ```ignore
//! static EVENT: KEvent = KEvent::new(EventType::Notification, false);
//!
//! // Thread A waits
//! EVENT.wait(ke, ProcessorMode::KernelMode, false, None)?;
//!
//! // Thread B signals
//! EVENT.set(ke);
//! ```

use super::dispatcher::{DispatcherHeader, DispatcherType, WaitStatus};
use super::irql::DispatchLevel;
use super::kernel::Kernel;
use super::thread::ProcessorMode;
use super::KeError;

/// Event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    /// Notification event (manual reset)
    /// - Wakes ALL waiters when signaled
    /// - Stays signaled until explicitly reset
    Notification = 0,
    /// Synchronization event (auto reset)
    /// - Wakes ONE waiter when signaled
    /// - Automatically resets after waking a thread
    Synchronization = 1,
}

/// Kernel Event
///
/// Equivalent to NT's KEVENT
#[repr(C)]
pub struct KEvent {
    /// Dispatcher header (must be first for casting)
    pub header: DispatcherHeader,
}

impl KEvent {
    /// Create an event
    ///
    /// # Arguments
    /// * `event_type` - Notification (manual reset) or Synchronization (auto reset)
    /// * `initial_state` - true = signaled, false = not signaled
    pub const fn new(event_type: EventType, initial_state: bool) -> Self {
        let object_type = match event_type {
            EventType::Notification => DispatcherType::NotificationEvent,
            EventType::Synchronization => DispatcherType::SynchronizationEvent,
        };
        Self {
            header: DispatcherHeader::new(object_type, initial_state as i32),
        }
    }

    /// Get the event type
    pub fn event_type(&self) -> EventType {
        match self.header.object_type {
            DispatcherType::SynchronizationEvent => EventType::Synchronization,
            _ => EventType::Notification,
        }
    }

    /// Set the event to signaled state
    ///
    /// For notification events, wakes all waiting threads.
    /// For synchronization events, wakes one waiting thread and the event
    /// stays signaled only if nobody was waiting.
    ///
    /// Returns the previous signal state.
    pub fn set(&self, ke: &Kernel) -> i32 {
        let irql = ke.raise_irql::<DispatchLevel>();
        let previous = {
            let mut object = self.header.lock(&irql);
            let previous = object.signal_state();
            if previous == 0 {
                object.set_signal_state(1);
                unsafe { object.wake_waiters(ke, &irql) };
            }
            previous
        };
        ke.lower_irql(irql);
        previous
    }

    /// Reset the event to non-signaled state
    ///
    /// Equivalent to KeClearEvent()
    pub fn clear(&self, ke: &Kernel) {
        let irql = ke.raise_irql::<DispatchLevel>();
        self.header.lock(&irql).set_signal_state(0);
        ke.lower_irql(irql);
    }

    /// Reset the event and return its previous state
    ///
    /// Equivalent to KeResetEvent()
    pub fn reset(&self, ke: &Kernel) -> i32 {
        let irql = ke.raise_irql::<DispatchLevel>();
        let previous = {
            let mut object = self.header.lock(&irql);
            let previous = object.signal_state();
            object.set_signal_state(0);
            previous
        };
        ke.lower_irql(irql);
        previous
    }

    /// Release current waiters, then leave the event non-signaled
    ///
    /// Equivalent to KePulseEvent(). Returns the previous signal state.
    pub fn pulse(&self, ke: &Kernel) -> i32 {
        let irql = ke.raise_irql::<DispatchLevel>();
        let previous = {
            let mut object = self.header.lock(&irql);
            let previous = object.signal_state();
            if previous == 0 {
                object.set_signal_state(1);
                unsafe { object.wake_waiters(ke, &irql) };
            }
            object.set_signal_state(0);
            previous
        };
        ke.lower_irql(irql);
        previous
    }

    /// Read the current signal state
    ///
    /// Equivalent to KeReadStateEvent()
    #[inline]
    pub fn read_state(&self) -> i32 {
        self.header.signal_state()
    }

    /// Check if the event is signaled
    #[inline]
    pub fn is_signaled(&self) -> bool {
        self.header.is_signaled()
    }

    /// Wait for the event
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
    use crate::ke::dispatcher::{KWaitBlock, WaitType};
    use crate::ke::thread::{KThread, ThreadState};
    use crate::ke::ThreadPriority;

    /// Queue `thread` on `event` as if it had started a WaitAny on it
    unsafe fn register_waiter(ke: &Kernel, event: &KEvent, thread: *mut KThread, block: *mut KWaitBlock) {
        (*block).init(thread, &event.header, WaitType::WaitAny, 0);
        (*thread).wait.completion.arm();
        let irql = ke.raise_irql::<DispatchLevel>();
        {
            let mut object = event.header.lock(&irql);
            object.insert_wait_block(block);
        }
        {
            let _database = ke.dispatcher.lock_at_dpc_level(&irql);
            (*thread).state = ThreadState::Waiting;
        }
        ke.lower_irql(irql);
    }

    #[test]
    fn test_set_clear_reset_pulse() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event = KEvent::new(EventType::Notification, false);

        assert_eq!(event.set(ke), 0);
        assert_eq!(event.set(ke), 1);
        assert!(event.is_signaled());
        assert_eq!(event.reset(ke), 1);
        assert_eq!(event.read_state(), 0);

        event.set(ke);
        event.clear(ke);
        assert_eq!(event.read_state(), 0);

        assert_eq!(event.pulse(ke), 0);
        assert_eq!(event.read_state(), 0);
    }

    #[test]
    fn test_signaled_event_satisfies_immediately() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let notification = KEvent::new(EventType::Notification, true);
        let synchronization = KEvent::new(EventType::Synchronization, true);

        let mode = ProcessorMode::KernelMode;
        assert_eq!(notification.wait(ke, mode, false, None), Ok(WaitStatus::Object(0)));
        assert_eq!(notification.read_state(), 1);

        assert_eq!(synchronization.wait(ke, mode, false, None), Ok(WaitStatus::Object(0)));
        assert_eq!(synchronization.read_state(), 0);
        assert_eq!(synchronization.wait(ke, mode, false, Some(0)), Ok(WaitStatus::Timeout));
    }

    #[test]
    fn test_synchronization_set_wakes_oldest_waiter_only() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event = KEvent::new(EventType::Synchronization, false);
        let w1 = sys.spawn("w1", ThreadPriority::Normal);
        let w2 = sys.spawn("w2", ThreadPriority::Normal);
        let mut b1 = KWaitBlock::new();
        let mut b2 = KWaitBlock::new();

        unsafe {
            register_waiter(ke, &event, w1, &mut b1);
            register_waiter(ke, &event, w2, &mut b2);

            event.set(ke);
            assert_eq!((*w1).state(), ThreadState::Ready);
            assert_eq!((*w2).state(), ThreadState::Waiting);
            assert!(b1.thread.is_null());
            assert_eq!(b2.thread, w2);
            assert_eq!(event.read_state(), 0);

            event.set(ke);
            assert_eq!((*w2).state(), ThreadState::Ready);
            assert!(!event.header.has_waiters());
        }
    }

    #[test]
    fn test_notification_set_wakes_everyone() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event = KEvent::new(EventType::Notification, false);
        let w1 = sys.spawn("w1", ThreadPriority::Normal);
        let w2 = sys.spawn("w2", ThreadPriority::Normal);
        let mut b1 = KWaitBlock::new();
        let mut b2 = KWaitBlock::new();

        unsafe {
            register_waiter(ke, &event, w1, &mut b1);
            register_waiter(ke, &event, w2, &mut b2);

            event.pulse(ke);
            assert_eq!((*w1).state(), ThreadState::Ready);
            assert_eq!((*w2).state(), ThreadState::Ready);
            assert_eq!(event.read_state(), 0);
        }
    }

    #[test]
    fn test_waiting_thread_resumes_on_set() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event: &'static KEvent = Box::leak(Box::new(KEvent::new(EventType::Synchronization, false)));

        sys.on_next_switch(move || {
            event.set(ke);
        });

        let status = event.wait(ke, ProcessorMode::KernelMode, false, None);
        assert_eq!(status, Ok(WaitStatus::Object(0)));
        assert_eq!(event.read_state(), 0);
        assert_eq!(ke.current_thread(), sys.main_thread);
        unsafe {
            assert_eq!((*sys.main_thread).state(), ThreadState::Running);
        }
    }

    #[test]
    fn test_timeout_loses_to_earlier_set() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event: &'static KEvent = Box::leak(Box::new(KEvent::new(EventType::Synchronization, false)));
        let hal = sys.hal;

        // Signal and deadline land in the same switch-out window
        sys.on_next_switch(move || {
            event.set(ke);
            hal.advance(10_000);
        });

        let status = event.wait(ke, ProcessorMode::KernelMode, false, Some(1_000));
        assert_eq!(status, Ok(WaitStatus::Object(0)));
        assert_eq!(event.read_state(), 0);
        assert!(!event.header.has_waiters());
    }

    #[test]
    fn test_timeout_without_signal() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event: &'static KEvent = Box::leak(Box::new(KEvent::new(EventType::Synchronization, false)));
        let hal = sys.hal;

        sys.on_next_switch(move || hal.advance(10_000));

        let status = event.wait(ke, ProcessorMode::KernelMode, false, Some(1_000));
        assert_eq!(status, Ok(WaitStatus::Timeout));
        assert!(!event.header.has_waiters());

        // A later set is not lost: it leaves the event signaled
        assert_eq!(event.set(ke), 0);
        assert_eq!(event.read_state(), 1);
    }

    #[test]
    fn test_timeout_race_has_single_outcome() {
        let sys = TestSystem::new(1);
        let ke = sys.kernel;
        let event: &'static KEvent = Box::leak(Box::new(KEvent::new(EventType::Synchronization, false)));
        let hal = sys.hal;
        let main = SendPtr(sys.main_thread);

        // The timeout fires first and claims the wait; the set then finds
        // the block already gone
        sys.on_next_switch(move || {
            let main = main;
            hal.advance(10_000);
            let claimed = unsafe { (*main.0).wait.completion.try_complete(crate::ke::dispatcher::WaitOutcome::Timeout) };
            assert!(claimed);
            event.set(ke);
        });

        let status = event.wait(ke, ProcessorMode::KernelMode, false, Some(1_000)).unwrap();
        match status {
            WaitStatus::Timeout => assert_eq!(event.read_state(), 1),
            WaitStatus::Object(0) => assert_eq!(event.read_state(), 0),
            other => panic!("unexpected wait outcome {:?}", other),
        }
        assert!(!event.header.has_waiters());
    }
}
