//! Spin-based synchronization primitives and a bounded concurrent ring buffer
//!
//! Everything in this crate busy-waits. No primitive ever parks a thread in
//! the kernel; waits are spin loops built around atomic read-modify-write
//! operations with explicit memory orderings, plus processor spin hints.
//! This is the right trade-off when critical sections are short and threads
//! are pinned to their own cores, which is exactly the situation the
//! companion `bm_lock` benchmark sets up.
//!
//! The lock family covers a range of fairness/throughput trade-offs:
//!
//! - [`locks::SpinLock`] -- plain test-and-set, no fairness
//! - [`locks::RwLock`] -- one-word reader/writer lock, writers can starve
//! - [`locks::TicketLock`] -- FIFO mutex
//! - [`locks::TfRwLock`] -- task-fair reader/writer lock (strict arrival order)
//! - [`locks::PfRwLock`] -- phase-fair reader/writer lock (bounded writer wait)
//! - [`locks::ClhLock`] -- queue lock, each waiter spins on its own cache line
//!
//! The [`ringbuf`] module provides a bounded MPMC ring buffer whose
//! producer and consumer sides are independently configured at allocation
//! time (single, multi blocking, multi non-blocking, and for consumers also
//! lock-free speculative dequeue).
//!
//! All cross-thread state can be swapped over to [loom] for model checking
//! by building with `--cfg loom`; see the [`arch`] module.
//!
//! [loom]: https://docs.rs/loom

pub mod arch;
pub mod err;
pub mod locks;
pub mod ringbuf;
pub mod util;
