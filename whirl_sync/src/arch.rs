//! Atomics and spin-wait helpers, switchable between `std` and `loom`
//!
//! Everything in the crate goes through these re-exports so that building
//! with `--cfg loom` swaps all shared state over to loom's model-checked
//! equivalents.
//!
//! The wait helpers stand in for the microarchitectural event hints
//! (WFE/SEV on arm, PAUSE on x86): Rust only exposes the portable
//! [`core::hint::spin_loop`], so waiting is a plain polling loop with spin
//! hints, optionally with truncated exponential backoff.

#[cfg(loom)]
pub use loom::sync::atomic::{
    fence, AtomicBool, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize,
    Ordering,
};
#[cfg(not(loom))]
pub use std::sync::atomic::{
    fence, AtomicBool, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, AtomicU8, AtomicUsize,
    Ordering,
};

#[cfg(loom)]
pub fn spin_hint() {
    loom::thread::yield_now();
}
#[cfg(not(loom))]
pub fn spin_hint() {
    std::hint::spin_loop();
}

/// Spin until `cond` returns true.
pub fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    while !cond() {
        spin_hint();
    }
}

/// Spin until `cond` returns true, doubling the number of spin hints per
/// poll up to `maxdoze`. Used where waiters queue up behind a single
/// publication word and hammering it would slow down the publisher.
pub fn wait_until_w_bkoff<F: FnMut() -> bool>(mut cond: F, maxdoze: u32) {
    let mut doze = 1;
    while !cond() {
        for _ in 0..doze {
            spin_hint();
        }
        if doze < maxdoze {
            doze *= 2;
        }
    }
}

/// Spin until `a` reads equal to `expected`.
pub fn wait_until_equal_u16(a: &AtomicU16, expected: u16, order: Ordering) {
    while a.load(order) != expected {
        spin_hint();
    }
}

/// Spin until `a` reads equal to `expected`.
pub fn wait_until_equal_u32(a: &AtomicU32, expected: u32, order: Ordering) {
    while a.load(order) != expected {
        spin_hint();
    }
}

/// Busy delay of `niter` spin hints.
pub fn delay_loop(niter: u32) {
    for _ in 0..niter {
        spin_hint();
    }
}
