//! Nostalgia OS Kernel Executive Core
//!
//! The concurrency and scheduling heart of an NT-compatible kernel, targeting
//! x86_64.
//!
//! # Architecture Overview
//!
//! - **ke** - Kernel Executive: IRQL, spin locks, dispatcher objects
//!   (events, semaphores, mutexes), DPC/APC delivery, the 32-level scheduler
//!   and the wait API built on top of them
//! - **hal** - The collaborator interface the executive consumes: interrupt
//!   masking, cycle counter, one-shot timer, address-space and context switch
//! - **arch** - The x86_64 implementation of that interface
//!
//! # Initialization
//!
//! The boot path builds a [`ke::Kernel`] around an `&'static dyn Hal`, registers
//! it with [`ke::initialize`], then brings each processor online with
//! [`ke::Kernel::start_processor`]. Interrupt glue reaches the instance
//! through [`ke::kernel`].
//!
//! The crate is `no_std`; it links `std` only when built for its own unit
//! tests, which run against the simulated HAL in `hal::sim`.

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]
// Kernel-specific lint configurations:
// - missing_safety_doc: In a kernel, virtually everything is unsafe by nature
// - declare_interior_mutable_const: Common pattern for static initialization in no_std
// - not_unsafe_ptr_arg_deref: thread and object pointers are the currency of the dispatcher
// - mut_from_ref: lock-protected fields are handed out from shared references
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::declare_interior_mutable_const)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::mut_from_ref)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod arch;
pub mod hal;
pub mod ke;

pub use ke::{initialize, kernel, Kernel, KernelConfig};
