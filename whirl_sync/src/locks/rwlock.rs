use crate::arch::*;
use crate::err::usage_abort;

/// Writer-present flag; the low 31 bits count readers.
const WRITER: u32 = 1 << 31;

/// One-word reader/writer lock.
///
/// Cheapest of the shared/exclusive locks: readers are one CAS in, one
/// fetch-sub out. The price is that a writer must first win the flag CAS
/// against arriving readers and then outwait the readers already in, so
/// sustained reader pressure can starve writers indefinitely.
#[derive(Debug)]
pub struct RwLock {
    lock: AtomicU32,
}

impl RwLock {
    pub fn new() -> Self {
        Self {
            lock: AtomicU32::new(0),
        }
    }

    /// Spin until no bit of `mask` is set, returning the observed value.
    fn wait_for_no(&self, mask: u32) -> u32 {
        let mut l = self.lock.load(Ordering::Relaxed);
        while l & mask != 0 {
            spin_hint();
            l = self.lock.load(Ordering::Relaxed);
        }
        l
    }

    /// Acquire in shared mode.
    pub fn acquire_rd(&self) {
        let mut l = self.wait_for_no(WRITER);
        loop {
            // attempt to increment the reader count; acquire on success
            // pairs with the releasing writer's store
            match self
                .lock
                .compare_exchange_weak(l, l + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(x) => {
                    l = x;
                    if l & WRITER != 0 {
                        l = self.wait_for_no(WRITER);
                    }
                }
            }
        }
    }

    /// Release shared mode.
    ///
    /// Aborts if the lock was not read-held.
    pub fn release_rd(&self) {
        // the critical section performed loads only; the fence keeps them
        // from sinking below the count update
        fence(Ordering::Release);
        let prev = self.lock.fetch_sub(1, Ordering::Relaxed);
        // checked after the release, using the pre-release value
        if prev & WRITER != 0 || prev == 0 {
            usage_abort("rwlock", "invalid read release", self as *const _ as usize);
        }
    }

    /// Acquire in exclusive mode.
    pub fn acquire_wr(&self) {
        let mut l = self.wait_for_no(WRITER);
        loop {
            // set the writer flag, preserving the reader count
            match self
                .lock
                .compare_exchange_weak(l, l | WRITER, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => {
                    l = x;
                    if l & WRITER != 0 {
                        l = self.wait_for_no(WRITER);
                    }
                }
            }
        }
        // the flag keeps new readers out; wait for the ones already in
        while self.lock.load(Ordering::Acquire) & !WRITER != 0 {
            spin_hint();
        }
    }

    /// Release exclusive mode.
    ///
    /// Aborts if the lock is not in the write-held state.
    pub fn release_wr(&self) {
        if self.lock.load(Ordering::Relaxed) != WRITER {
            usage_abort("rwlock", "invalid write release", self as *const _ as usize);
        }
        self.lock.store(0, Ordering::Release);
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}
