//! The lock family
//!
//! Six independent primitives, each a fixed-size word (or, for CLH, a queue
//! of nodes). None of them block in the kernel; contention is handled by
//! spinning with processor hints. They differ in what they guarantee:
//!
//! | lock            | exclusion     | fairness                      |
//! |-----------------|---------------|-------------------------------|
//! | [`SpinLock`]    | mutex         | none                          |
//! | [`RwLock`]      | shared/excl   | none (writers can starve)     |
//! | [`TicketLock`]  | mutex         | FIFO                          |
//! | [`TfRwLock`]    | shared/excl   | FIFO (readers batch)          |
//! | [`PfRwLock`]    | shared/excl   | alternating reader/writer phases |
//! | [`ClhLock`]     | mutex         | FIFO                          |
//!
//! API shape is explicit acquire/release rather than RAII guards: these
//! locks protect state that lives outside them, and the benchmark drives
//! them through dynamic dispatch where a guard type per lock kind would be
//! in the way. The cost is that an unmatched release is a bug the library
//! can only catch at runtime; where cheaply detectable it aborts via
//! [`crate::err::usage_abort`].

mod clhlock;
mod pfrwlock;
mod rwlock;
mod spinlock;
mod tfrwlock;
mod tktlock;

pub use clhlock::{ClhLock, ClhSlot};
pub use pfrwlock::PfRwLock;
pub use rwlock::RwLock;
pub use spinlock::SpinLock;
pub use tfrwlock::TfRwLock;
pub use tktlock::TicketLock;

#[cfg(test)]
mod tests;
