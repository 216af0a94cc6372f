//! Kernel Process (KPROCESS) implementation
//!
//! KPROCESS is the kernel's representation of a process. It contains:
//! - Address space information (page directory base)
//! - The priority class new threads are scheduled under
//! - List of threads belonging to the process
//!
//! Processes are shared by their threads through `Arc`; the address space is
//! loaded on a context switch whenever the incoming thread belongs to a
//! different process than the outgoing one.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use super::list::ListEntry;
use super::spinlock::SpinLock;

/// Number of run-queue levels
pub const MAXIMUM_PRIORITY: usize = 32;
/// First realtime level
pub const LOW_REALTIME_PRIORITY: u8 = 16;
/// Highest level
pub const HIGH_PRIORITY: u8 = 31;

/// Process priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PriorityClass {
    Idle = 0,
    BelowNormal = 1,
    Normal = 2,
    AboveNormal = 3,
    High = 4,
    Realtime = 5,
}

impl PriorityClass {
    /// Base run-queue level of the class
    pub const fn base_priority(self) -> u8 {
        match self {
            PriorityClass::Idle => 4,
            PriorityClass::BelowNormal => 6,
            PriorityClass::Normal => 8,
            PriorityClass::AboveNormal => 10,
            PriorityClass::High => 13,
            PriorityClass::Realtime => 24,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => PriorityClass::Idle,
            1 => PriorityClass::BelowNormal,
            3 => PriorityClass::AboveNormal,
            4 => PriorityClass::High,
            5 => PriorityClass::Realtime,
            _ => PriorityClass::Normal,
        }
    }
}

/// Thread priority relative to its process class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ThreadPriority {
    /// Pinned to the bottom of the class band
    Idle = -15,
    Lowest = -2,
    BelowNormal = -1,
    Normal = 0,
    AboveNormal = 1,
    Highest = 2,
    /// Pinned to the top of the class band
    TimeCritical = 15,
}

/// Map a (class, relative priority) pair to a run-queue level
///
/// Non-realtime classes stay within 1..=15 and realtime within 16..=31;
/// level 0 is never handed out.
pub const fn priority_level(class: PriorityClass, priority: ThreadPriority) -> u8 {
    let realtime = matches!(class, PriorityClass::Realtime);
    let (floor, ceiling) = if realtime {
        (LOW_REALTIME_PRIORITY, HIGH_PRIORITY)
    } else {
        (1, LOW_REALTIME_PRIORITY - 1)
    };

    match priority {
        ThreadPriority::Idle => floor,
        ThreadPriority::TimeCritical => ceiling,
        _ => {
            let level = class.base_priority() as i16 + priority as i8 as i16;
            if level < floor as i16 {
                floor
            } else if level > ceiling as i16 {
                ceiling
            } else {
                level as u8
            }
        }
    }
}

/// Thread list head; only touched under the process lock
pub(crate) struct ThreadList {
    pub(crate) head: ListEntry,
    pub(crate) count: u32,
}

// SAFETY: the list is only walked under the process lock
unsafe impl Send for ThreadList {}

/// Kernel Process structure
///
/// This is modeled after Windows NT's KPROCESS structure.
pub struct KProcess {
    /// Process ID
    pub process_id: u32,

    /// Page directory base (CR3 value for this process)
    pub directory_table_base: u64,

    /// Priority class, stored as its discriminant
    priority_class: AtomicU8,

    /// Threads belonging to the process
    pub(crate) threads: SpinLock<ThreadList>,

    /// Threads created but not yet terminated
    active_threads: AtomicU32,
}

impl KProcess {
    /// Create a process
    pub fn new(process_id: u32, directory_table_base: u64, priority_class: PriorityClass) -> Self {
        Self {
            process_id,
            directory_table_base,
            priority_class: AtomicU8::new(priority_class as u8),
            threads: SpinLock::new(ThreadList {
                head: ListEntry::new(),
                count: 0,
            }),
            active_threads: AtomicU32::new(0),
        }
    }

    /// Get the process priority class
    #[inline]
    pub fn priority_class(&self) -> PriorityClass {
        PriorityClass::from_raw(self.priority_class.load(Ordering::Relaxed))
    }

    /// Change the class; running threads pick it up on their next priority change
    pub fn set_priority_class(&self, class: PriorityClass) {
        self.priority_class.store(class as u8, Ordering::Relaxed);
    }

    /// Number of live threads
    #[inline]
    pub fn active_threads(&self) -> u32 {
        self.active_threads.load(Ordering::Acquire)
    }

    pub(crate) fn thread_created(&self) {
        self.active_threads.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn thread_exited(&self) {
        self.active_threads.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_level_mapping() {
        use PriorityClass::*;
        use ThreadPriority as P;

        assert_eq!(priority_level(Normal, P::Normal), 8);
        assert_eq!(priority_level(Normal, P::Highest), 10);
        assert_eq!(priority_level(Normal, P::Lowest), 6);
        assert_eq!(priority_level(Idle, P::Lowest), 2);
        assert_eq!(priority_level(High, P::Highest), 15);
        assert_eq!(priority_level(AboveNormal, P::AboveNormal), 11);
        assert_eq!(priority_level(BelowNormal, P::BelowNormal), 5);
        assert_eq!(priority_level(Realtime, P::Normal), 24);
        assert_eq!(priority_level(Realtime, P::Highest), 26);
    }

    #[test]
    fn test_priority_extremes_pin_to_band() {
        use PriorityClass::*;
        use ThreadPriority as P;

        for class in [Idle, BelowNormal, Normal, AboveNormal, High] {
            assert_eq!(priority_level(class, P::Idle), 1);
            assert_eq!(priority_level(class, P::TimeCritical), 15);
        }
        assert_eq!(priority_level(Realtime, P::Idle), 16);
        assert_eq!(priority_level(Realtime, P::TimeCritical), 31);
    }

    #[test]
    fn test_priority_class_roundtrip() {
        let process = KProcess::new(4, 0x1000, PriorityClass::Normal);
        assert_eq!(process.priority_class(), PriorityClass::Normal);
        process.set_priority_class(PriorityClass::High);
        assert_eq!(process.priority_class(), PriorityClass::High);
    }
}
