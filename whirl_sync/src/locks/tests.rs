use std::cell::UnsafeCell;
use std::sync::Arc;
use std::thread;

use super::*;
use crate::arch::*;

#[cfg(not(loom))]
/// A counter guarded by one of the locks under test.
struct Guarded<L> {
    lock: L,
    value: UnsafeCell<u64>,
}
// safety: tests only touch `value` while holding `lock`
#[cfg(not(loom))]
unsafe impl<L: Sync> Sync for Guarded<L> {}

#[cfg(not(loom))]
impl<L> Guarded<L> {
    fn new(lock: L) -> Self {
        Self {
            lock,
            value: UnsafeCell::new(0),
        }
    }
    unsafe fn bump(&self) {
        *self.value.get() += 1;
    }
    fn get(&mut self) -> u64 {
        *self.value.get_mut()
    }
}

#[cfg(not(loom))]
#[test]
fn spinlock_two_threads() {
    const LAPS: u64 = 10_000;
    let g = Arc::new(Guarded::new(SpinLock::new()));
    let mut threads = Vec::new();
    for _ in 0..4 {
        let g = Arc::clone(&g);
        threads.push(thread::spawn(move || {
            for _ in 0..LAPS {
                g.lock.acquire();
                unsafe { g.bump() };
                g.lock.release();
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    let mut g = Arc::into_inner(g).unwrap();
    assert_eq!(g.get(), 4 * LAPS);
}

#[cfg(not(loom))]
#[test]
fn spinlock_try_acquire() {
    let l = SpinLock::new();
    assert!(l.try_acquire());
    assert!(!l.try_acquire());
    l.release();
    assert!(l.try_acquire());
    l.release();
}

#[cfg(not(loom))]
#[test]
fn ticket_lock_single_thread_serving() {
    let l = TicketLock::new();
    for i in 0..100u16 {
        let tkt = l.acquire();
        assert_eq!(tkt, i);
        l.release(tkt);
    }
    assert_eq!(l.next.load(Ordering::Relaxed), 100);
    assert_eq!(l.serving.load(Ordering::Relaxed), 100);
}

#[cfg(not(loom))]
#[test]
fn ticket_lock_grants_in_ticket_order() {
    const NTHREADS: usize = 8;
    const LAPS: usize = 500;
    let g = Arc::new(Guarded::new(TicketLock::new()));
    // record the ticket of every grant; grant order must equal ticket order
    let log = Arc::new(UnsafeCellVec::default());
    let mut threads = Vec::new();
    for _ in 0..NTHREADS {
        let g = Arc::clone(&g);
        let log = Arc::clone(&log);
        threads.push(thread::spawn(move || {
            for _ in 0..LAPS {
                let tkt = g.lock.acquire();
                unsafe {
                    g.bump();
                    log.push(tkt);
                }
                g.lock.release(tkt);
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    let mut g = Arc::into_inner(g).unwrap();
    assert_eq!(g.get(), (NTHREADS * LAPS) as u64);
    let grants = Arc::into_inner(log).unwrap().into_inner();
    assert_eq!(grants.len(), NTHREADS * LAPS);
    for (i, tkt) in grants.iter().enumerate() {
        assert_eq!(*tkt, i as u16);
    }
}

#[cfg(not(loom))]
/// Grant log written only inside a critical section.
#[derive(Default)]
struct UnsafeCellVec(UnsafeCell<Vec<u16>>);
// safety: pushes happen under the lock being tested
#[cfg(not(loom))]
unsafe impl Sync for UnsafeCellVec {}
#[cfg(not(loom))]
impl UnsafeCellVec {
    unsafe fn push(&self, x: u16) {
        (*self.0.get()).push(x);
    }
    fn into_inner(self) -> Vec<u16> {
        self.0.into_inner()
    }
}

#[cfg(not(loom))]
/// Occupancy counters in the style of the benchmark harness: readers and
/// writers bump their own counter and check the peer's.
#[derive(Default)]
struct Occupancy {
    count_rd: AtomicU32,
    count_wr: AtomicU32,
    failures: AtomicU32,
}

#[cfg(not(loom))]
impl Occupancy {
    fn enter_rd(&self) {
        if self.count_wr.load(Ordering::Relaxed) != 0 {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.count_rd.fetch_add(1, Ordering::Relaxed);
    }
    fn exit_rd(&self) {
        self.count_rd.fetch_sub(1, Ordering::Relaxed);
        if self.count_wr.load(Ordering::Relaxed) != 0 {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
    fn enter_wr(&self) {
        if self.count_wr.fetch_add(1, Ordering::Relaxed) != 0 {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        if self.count_rd.load(Ordering::Relaxed) != 0 {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
    fn exit_wr(&self) {
        if self.count_wr.fetch_sub(1, Ordering::Relaxed) != 1 {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        if self.count_rd.load(Ordering::Relaxed) != 0 {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
    fn assert_clean(&self) {
        assert_eq!(self.failures.load(Ordering::Relaxed), 0);
        assert_eq!(self.count_rd.load(Ordering::Relaxed), 0);
        assert_eq!(self.count_wr.load(Ordering::Relaxed), 0);
    }
}

#[cfg(not(loom))]
fn rw_stress<L, R, W>(lock: L, readers: usize, laps: u32, rd: R, wr: W)
where
    L: Sync + Send + 'static,
    R: Fn(&L, &Occupancy) + Sync + Send + Copy + 'static,
    W: Fn(&L, &Occupancy) + Sync + Send + Copy + 'static,
{
    let shared = Arc::new((lock, Occupancy::default()));
    let mut threads = Vec::new();
    for _ in 0..readers {
        let shared = Arc::clone(&shared);
        threads.push(thread::spawn(move || {
            for _ in 0..laps {
                rd(&shared.0, &shared.1);
            }
        }));
    }
    {
        let shared = Arc::clone(&shared);
        threads.push(thread::spawn(move || {
            for _ in 0..laps {
                wr(&shared.0, &shared.1);
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    shared.1.assert_clean();
}

#[cfg(not(loom))]
#[test]
fn rwlock_three_readers_one_writer() {
    rw_stress(
        RwLock::new(),
        3,
        5_000,
        |l, occ| {
            l.acquire_rd();
            occ.enter_rd();
            delay_loop(10);
            occ.exit_rd();
            l.release_rd();
        },
        |l, occ| {
            l.acquire_wr();
            occ.enter_wr();
            delay_loop(10);
            occ.exit_wr();
            l.release_wr();
        },
    );
}

#[cfg(not(loom))]
#[test]
fn tfrwlock_three_readers_one_writer() {
    rw_stress(
        TfRwLock::new(),
        3,
        5_000,
        |l, occ| {
            l.acquire_rd();
            occ.enter_rd();
            delay_loop(10);
            occ.exit_rd();
            l.release_rd();
        },
        |l, occ| {
            let tkt = l.acquire_wr();
            occ.enter_wr();
            delay_loop(10);
            occ.exit_wr();
            l.release_wr(tkt);
        },
    );
}

#[cfg(not(loom))]
#[test]
fn pfrwlock_three_readers_one_writer() {
    rw_stress(
        PfRwLock::new(),
        3,
        5_000,
        |l, occ| {
            l.acquire_rd();
            occ.enter_rd();
            delay_loop(10);
            occ.exit_rd();
            l.release_rd();
        },
        |l, occ| {
            l.acquire_wr();
            occ.enter_wr();
            delay_loop(10);
            occ.exit_wr();
            l.release_wr();
        },
    );
}

#[cfg(not(loom))]
#[test]
fn tfrwlock_reader_count_wraps_without_corrupting_writers() {
    // push the 16-bit reader counters through a wrap
    let l = TfRwLock::new();
    for _ in 0..70_000u32 {
        l.acquire_rd();
        l.release_rd();
    }
    let tkt = l.acquire_wr();
    assert_eq!(tkt, 0);
    l.release_wr(tkt);
}

#[cfg(not(loom))]
#[test]
fn clh_two_threads_counter() {
    const LAPS: u64 = 10_000;
    let g = Arc::new(Guarded::new(ClhLock::new()));
    let mut threads = Vec::new();
    for _ in 0..2 {
        let g = Arc::clone(&g);
        threads.push(thread::spawn(move || {
            let mut slot = ClhSlot::new();
            for _ in 0..LAPS {
                g.lock.acquire(&mut slot);
                unsafe { g.bump() };
                ClhLock::release(&mut slot);
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    let mut g = Arc::into_inner(g).unwrap();
    assert_eq!(g.get(), 2 * LAPS);
}

#[cfg(not(loom))]
#[test]
fn clh_slot_reuse_across_locks() {
    // a slot is per-thread, not per-lock
    let a = ClhLock::new();
    let b = ClhLock::new();
    let mut slot = ClhSlot::new();
    for _ in 0..100 {
        a.acquire(&mut slot);
        ClhLock::release(&mut slot);
        b.acquire(&mut slot);
        ClhLock::release(&mut slot);
    }
}

#[cfg(loom)]
mod loom_tests {
    use super::*;

    fn me_check(inside: &AtomicU32) {
        assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
        inside.fetch_sub(1, Ordering::Relaxed);
    }

    #[test]
    fn loom_spinlock_mutual_exclusion() {
        loom::model(|| {
            let lock = &*Box::leak(Box::new(SpinLock::new()));
            let inside = &*Box::leak(Box::new(AtomicU32::new(0)));
            let ts: Vec<_> = (0..2)
                .map(|_| {
                    loom::thread::spawn(move || {
                        lock.acquire();
                        me_check(inside);
                        lock.release();
                    })
                })
                .collect();
            for t in ts {
                t.join().unwrap();
            }
        });
    }

    #[test]
    fn loom_ticket_mutual_exclusion() {
        loom::model(|| {
            let lock = &*Box::leak(Box::new(TicketLock::new()));
            let inside = &*Box::leak(Box::new(AtomicU32::new(0)));
            let ts: Vec<_> = (0..2)
                .map(|_| {
                    loom::thread::spawn(move || {
                        let tkt = lock.acquire();
                        me_check(inside);
                        lock.release(tkt);
                    })
                })
                .collect();
            for t in ts {
                t.join().unwrap();
            }
        });
    }

    #[test]
    fn loom_clh_mutual_exclusion() {
        loom::model(|| {
            let lock = &*Box::leak(Box::new(ClhLock::new()));
            let inside = &*Box::leak(Box::new(AtomicU32::new(0)));
            let ts: Vec<_> = (0..2)
                .map(|_| {
                    loom::thread::spawn(move || {
                        let mut slot = ClhSlot::new();
                        lock.acquire(&mut slot);
                        me_check(inside);
                        ClhLock::release(&mut slot);
                    })
                })
                .collect();
            for t in ts {
                t.join().unwrap();
            }
        });
    }

    #[test]
    fn loom_rwlock_reader_vs_writer() {
        loom::model(|| {
            let lock = &*Box::leak(Box::new(RwLock::new()));
            let writers = &*Box::leak(Box::new(AtomicU32::new(0)));
            let r = loom::thread::spawn(move || {
                lock.acquire_rd();
                assert_eq!(writers.load(Ordering::Relaxed), 0);
                lock.release_rd();
            });
            let w = loom::thread::spawn(move || {
                lock.acquire_wr();
                writers.store(1, Ordering::Relaxed);
                writers.store(0, Ordering::Relaxed);
                lock.release_wr();
            });
            r.join().unwrap();
            w.join().unwrap();
        });
    }
}
