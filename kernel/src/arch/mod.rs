//! Architecture-specific code
//!
//! This module provides the hardware implementation of the HAL for x86_64.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::*;
