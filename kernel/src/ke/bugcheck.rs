//! Kernel Bug Check Implementation
//!
//! Contract violations inside the executive (raising IRQL downward, releasing
//! a mutex the caller does not own, waiting on too many objects, re-queueing a
//! DPC on another processor) are not recoverable errors. They stop the system
//! with a STOP code and four diagnostic parameters.
//!
//! The stop itself is a panic carrying the STOP code's name, so the embedding
//! kernel's panic handler decides how to freeze the machine (and unit tests can
//! observe the violation with `#[should_panic]`).

use core::sync::atomic::{AtomicU32, Ordering};
use spin::Once;

/// Counter for bugcheck attempts (including nested ones)
static BUGCHECK_COUNT: AtomicU32 = AtomicU32::new(0);

/// Data of the first bugcheck - saved for debugging
static BUGCHECK_DATA: Once<BugCheckData> = Once::new();

/// Bug check information structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BugCheckData {
    /// The bug check code
    pub code: u32,
    /// First parameter
    pub parameter1: u64,
    /// Second parameter
    pub parameter2: u64,
    /// Third parameter
    pub parameter3: u64,
    /// Fourth parameter
    pub parameter4: u64,
}

// ============================================================================
// Bug Check Codes (STOP Codes)
// ============================================================================

pub mod codes {
    //! Bug check codes raised by the executive core

    /// APC_INDEX_MISMATCH (0x01)
    /// Kernel APC disable count unbalanced
    pub const APC_INDEX_MISMATCH: u32 = 0x00000001;

    /// IRQL_NOT_DISPATCH_LEVEL (0x08)
    /// IRQL not at DISPATCH_LEVEL when expected
    pub const IRQL_NOT_DISPATCH_LEVEL: u32 = 0x00000008;

    /// IRQL_NOT_GREATER_OR_EQUAL (0x09)
    /// Raise to a level below the current one
    /// Parameter1: current IRQL
    /// Parameter2: requested IRQL
    pub const IRQL_NOT_GREATER_OR_EQUAL: u32 = 0x00000009;

    /// IRQL_NOT_LESS_OR_EQUAL (0x0A)
    /// Lower to a level above the current one, or a blocking call at
    /// DISPATCH_LEVEL or above
    /// Parameter1: current IRQL
    /// Parameter2: requested IRQL
    pub const IRQL_NOT_LESS_OR_EQUAL: u32 = 0x0000000A;

    /// MAXIMUM_WAIT_OBJECTS_EXCEEDED (0x0C)
    /// Too many wait objects in multi-object wait
    /// Parameter1: object count
    /// Parameter2: available wait blocks
    pub const MAXIMUM_WAIT_OBJECTS_EXCEEDED: u32 = 0x0000000C;

    /// NO_USER_MODE_CONTEXT (0x0E)
    /// User APC delivery without a user-mode trap frame
    pub const NO_USER_MODE_CONTEXT: u32 = 0x0000000E;

    /// THREAD_NOT_MUTEX_OWNER (0x11)
    /// Thread released a mutex it doesn't own
    /// Parameter1: mutex address
    /// Parameter2: owning thread
    /// Parameter3: releasing thread
    pub const THREAD_NOT_MUTEX_OWNER: u32 = 0x00000011;

    /// INVALID_DATA_ACCESS_TRAP (0x04)
    /// Executive used before it was initialized, or on an unknown processor
    pub const INVALID_DATA_ACCESS_TRAP: u32 = 0x00000004;

    /// ATTEMPTED_SWITCH_FROM_DPC (0xB8)
    /// Blocking operation from a DPC routine
    pub const ATTEMPTED_SWITCH_FROM_DPC: u32 = 0x000000B8;

    /// INVALID_DPC_STATE (0x102)
    /// Re-initialize or retarget of a queued DPC
    /// Parameter1: DPC address
    /// Parameter2: processor it is queued on
    pub const INVALID_DPC_STATE: u32 = 0x00000102;

    /// INVALID_APC_STATE (0x103)
    /// Kernel APC disable underflow or mismatched critical region
    pub const INVALID_APC_STATE: u32 = 0x00000103;

    /// THREAD_TERMINATE_HELD_MUTEX (0x100)
    /// Thread exited while still owning a kernel mutex
    pub const THREAD_TERMINATE_HELD_MUTEX: u32 = 0x00000100;
}

/// Get the name of a bug check code
pub fn bugcheck_name(code: u32) -> &'static str {
    match code {
        codes::APC_INDEX_MISMATCH => "APC_INDEX_MISMATCH",
        codes::INVALID_DATA_ACCESS_TRAP => "INVALID_DATA_ACCESS_TRAP",
        codes::IRQL_NOT_DISPATCH_LEVEL => "IRQL_NOT_DISPATCH_LEVEL",
        codes::IRQL_NOT_GREATER_OR_EQUAL => "IRQL_NOT_GREATER_OR_EQUAL",
        codes::IRQL_NOT_LESS_OR_EQUAL => "IRQL_NOT_LESS_OR_EQUAL",
        codes::MAXIMUM_WAIT_OBJECTS_EXCEEDED => "MAXIMUM_WAIT_OBJECTS_EXCEEDED",
        codes::NO_USER_MODE_CONTEXT => "NO_USER_MODE_CONTEXT",
        codes::THREAD_NOT_MUTEX_OWNER => "THREAD_NOT_MUTEX_OWNER",
        codes::ATTEMPTED_SWITCH_FROM_DPC => "ATTEMPTED_SWITCH_FROM_DPC",
        codes::THREAD_TERMINATE_HELD_MUTEX => "THREAD_TERMINATE_HELD_MUTEX",
        codes::INVALID_DPC_STATE => "INVALID_DPC_STATE",
        codes::INVALID_APC_STATE => "INVALID_APC_STATE",
        _ => "UNKNOWN_BUGCHECK",
    }
}

// ============================================================================
// Bug Check Functions
// ============================================================================

/// Stop the system with a bug check code
pub fn ke_bugcheck(code: u32) -> ! {
    ke_bugcheck_ex(code, 0, 0, 0, 0)
}

/// Stop the system with a bug check code and parameters
///
/// The first bugcheck's data is kept for [`get_bugcheck_data`]; nested
/// bugchecks only log.
///
/// # Never Returns
/// Ends in a panic naming the STOP code.
#[cold]
pub fn ke_bugcheck_ex(code: u32, p1: u64, p2: u64, p3: u64, p4: u64) -> ! {
    let count = BUGCHECK_COUNT.fetch_add(1, Ordering::SeqCst);

    let data = BugCheckData {
        code,
        parameter1: p1,
        parameter2: p2,
        parameter3: p3,
        parameter4: p4,
    };
    BUGCHECK_DATA.call_once(|| data);

    if count > 0 {
        log::error!("nested bugcheck 0x{:08X}", code);
    }

    log::error!(
        "*** STOP: 0x{:08X} (0x{:016X}, 0x{:016X}, 0x{:016X}, 0x{:016X}) {}",
        code,
        p1,
        p2,
        p3,
        p4,
        bugcheck_name(code)
    );

    panic!("*** STOP: 0x{:08X} {}", code, bugcheck_name(code))
}

/// Check if a bugcheck has been raised
pub fn is_bugcheck_active() -> bool {
    BUGCHECK_COUNT.load(Ordering::SeqCst) > 0
}

/// Get the first bugcheck's data, if any
pub fn get_bugcheck_data() -> Option<BugCheckData> {
    BUGCHECK_DATA.get().copied()
}

// ============================================================================
// Convenience Macros
// ============================================================================

/// Trigger a bugcheck with up to four parameters
#[macro_export]
macro_rules! bugcheck {
    ($code:expr) => {
        $crate::ke::bugcheck::ke_bugcheck($code)
    };
    ($code:expr, $p1:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, 0, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr, $p4:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, $p4 as u64)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bugcheck_names() {
        assert_eq!(bugcheck_name(codes::THREAD_NOT_MUTEX_OWNER), "THREAD_NOT_MUTEX_OWNER");
        assert_eq!(bugcheck_name(0xDEAD), "UNKNOWN_BUGCHECK");
    }

    #[test]
    #[should_panic(expected = "MAXIMUM_WAIT_OBJECTS_EXCEEDED")]
    fn test_bugcheck_macro_panics_with_name() {
        bugcheck!(codes::MAXIMUM_WAIT_OBJECTS_EXCEEDED, 65, 64);
    }

    #[test]
    fn test_bugcheck_is_recorded() {
        let result = std::panic::catch_unwind(|| ke_bugcheck_ex(codes::INVALID_DPC_STATE, 1, 2, 3, 4));
        assert!(result.is_err());
        assert!(is_bugcheck_active());
        // Other tests may have stopped first; only the first stop is kept
        assert!(get_bugcheck_data().is_some());
    }
}
