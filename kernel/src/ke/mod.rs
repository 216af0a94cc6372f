//! Kernel Executive (ke)
//!
//! The kernel executive is the concurrency heart of the NT kernel, providing:
//!
//! - **Scheduler**: 32 priority levels, shared ready queues, quantum-based
//!   preemption and timed sleeps
//! - **Dispatcher Objects**: KEVENT, KSEMAPHORE, KMUTEX
//! - **DPC**: Deferred Procedure Calls for interrupt deferral
//! - **APC**: Asynchronous Procedure Calls for thread-specific callbacks
//! - **Spinlocks**: IRQL-aware mutual exclusion
//! - **Wait/Unwait**: Multi-object wait support
//!
//! # IRQL (Interrupt Request Level)
//!
//! The kernel uses IRQL to manage interrupt priority:
//! - PASSIVE_LEVEL (0): Normal thread execution
//! - APC_LEVEL (1): APC delivery masked
//! - DISPATCH_LEVEL (2): DPC execution, scheduler runs
//! - Device IRQLs (3-12): Hardware interrupts
//! - CLOCK_LEVEL (13), IPI_LEVEL (14), HIGH_LEVEL (15)
//!
//! # Key Structures
//!
//! - `KPRCB`: Per-processor control block
//! - `KTHREAD`: Kernel thread object
//! - `KPROCESS`: Kernel process object
//! - `DISPATCHER_HEADER`: Common header for waitable objects

// Core modules
pub mod bugcheck;
pub mod irql;
pub mod kernel;
pub mod list;
pub mod prcb;
pub mod process;
pub mod scheduler;
pub mod thread;

// Synchronization primitives
pub mod dispatcher;
pub mod event;
pub mod mutex;
pub mod semaphore;
pub mod spinlock;

// Deferred execution
pub mod apc;
pub mod dpc;

// Wait support
pub mod wait;

// Re-export key types
pub use kernel::{idle_thread_routine, initialize, kernel, Kernel, KernelConfig};
pub use list::ListEntry;
pub use prcb::KPrcb;
pub use process::{KProcess, PriorityClass, ThreadPriority};
pub use thread::{KThread, ProcessorMode, ThreadStartRoutine, ThreadState};

// Re-export IRQL types
pub use irql::{ApcLevel, ClockLevel, DispatchLevel, HighLevel, IrqlToken, Kirql};

// Re-export synchronization types
pub use dispatcher::{DispatcherHeader, DispatcherType, KWaitBlock, WaitStatus, WaitType};
pub use event::{EventType, KEvent};
pub use mutex::{KMutex, MutexGuard};
pub use semaphore::KSemaphore;
pub use spinlock::{KSpinLock, SpinLock, SpinLockGuard, SpinLockIrqlGuard};

// Re-export DPC types
pub use dpc::{DpcImportance, DpcRoutine, KDpc};

// Re-export APC types
pub use apc::{ApcCall, ContextFlags, KApc, KTrapFrame, KernelRoutine, NormalRoutine, RundownRoutine, UserApcRecord};

// Re-export bug check entry points
pub use bugcheck::{ke_bugcheck, ke_bugcheck_ex};

/// Errors returned by the executive's fallible operations
///
/// Contract violations are bug checks, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeError {
    /// An allocation failed
    InsufficientResources,
    /// An argument was out of range or inconsistent
    InvalidParameter,
    /// A semaphore release would exceed its limit
    SemaphoreLimitExceeded,
    /// A user-mode address could not be written
    AccessViolation,
}
