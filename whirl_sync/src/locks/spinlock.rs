use crate::arch::*;

/// Plain test-and-set spinlock.
///
/// One byte of state: 0 free, 1 held. Acquisition order among waiters is
/// whatever the cache coherence protocol happens to produce; under heavy
/// contention the same core can win repeatedly. Use one of the FIFO locks
/// when that matters.
#[derive(Debug)]
pub struct SpinLock {
    lock: AtomicU8,
}

impl SpinLock {
    pub fn new() -> Self {
        Self {
            lock: AtomicU8::new(0),
        }
    }

    /// Spin until the lock is acquired.
    pub fn acquire(&self) {
        loop {
            // wait until the lock is observed free before attempting the
            // RMW, so waiters do not bounce the line around in exclusive
            // state
            while self.lock.load(Ordering::Relaxed) != 0 {
                spin_hint();
            }
            if self
                .lock
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Single acquisition attempt.
    pub fn try_acquire(&self) -> bool {
        self.lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        self.lock.store(0, Ordering::Release);
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}
