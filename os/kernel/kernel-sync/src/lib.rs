//! # Kernel synchronization primitives
//!
//! Busy-waiting locks for short, non-blocking critical sections. A lock here
//! never sleeps, so it may be taken from interrupt or scheduler-adjacent
//! context, but it must never be held across anything that can block or fault.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{LockStats, SpinLock, SpinLockGuard};
