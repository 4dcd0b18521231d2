use crate::arch::*;

/// Phase id of the writer currently gating readers (alternates per writer).
const PHID: u32 = 0x01;
/// A writer is waiting or writing.
const PRES: u32 = 0x02;
/// Reader count increment; the count lives above the flag byte.
const RD_ONE: u32 = 0x100;
const RD_SHIFT: u32 = 8;

/// Phase-fair reader/writer lock.
///
/// Two reader counters and two writer tickets. Writers queue FIFO among
/// themselves on the ticket pair; the writer at the head of that queue
/// closes the reader gate by setting the writer-present flag in the reader
/// entry word, then waits for the readers already inside to drain. Readers
/// that arrive while the flag is set wait for the *flags* to change, not
/// for the lock to be free, so they run in the very next reader phase even
/// if more writers are queued. Writer latency is thereby bounded by one
/// reader phase, and reader latency by one writer section.
#[derive(Debug)]
#[repr(C)]
pub struct PfRwLock {
    pub(crate) rd_enter: AtomicU32,
    pub(crate) rd_leave: AtomicU32,
    pub(crate) wr_enter: AtomicU16,
    pub(crate) wr_leave: AtomicU16,
}

impl PfRwLock {
    pub fn new() -> Self {
        Self {
            rd_enter: AtomicU32::new(0),
            rd_leave: AtomicU32::new(0),
            wr_enter: AtomicU16::new(0),
            wr_leave: AtomicU16::new(0),
        }
    }

    /// Acquire in shared mode.
    pub fn acquire_rd(&self) {
        let w = self.rd_enter.fetch_add(RD_ONE, Ordering::Acquire) & (PRES | PHID);
        if w != 0 {
            // writer present: wait until it finishes or the phase flips,
            // whichever comes first
            wait_until(|| self.rd_enter.load(Ordering::Acquire) & (PRES | PHID) != w);
        }
    }

    /// Release shared mode.
    pub fn release_rd(&self) {
        self.rd_leave.fetch_add(RD_ONE, Ordering::Release);
    }

    /// Acquire in exclusive mode.
    pub fn acquire_wr(&self) {
        // FIFO among writers
        let tkt = self.wr_enter.fetch_add(1, Ordering::Relaxed);
        wait_until_equal_u16(&self.wr_leave, tkt, Ordering::Acquire);
        // close the reader gate; the fetch-add snapshots the count of
        // readers already in
        let flags = PRES | (tkt as u32 & PHID);
        let rd = self.rd_enter.fetch_add(flags, Ordering::Relaxed) >> RD_SHIFT;
        // wait for those readers to drain; later arrivals are gated
        wait_until(|| self.rd_leave.load(Ordering::Acquire) >> RD_SHIFT == rd);
    }

    /// Release exclusive mode.
    pub fn release_wr(&self) {
        // we hold the writer token, so wr_leave is still our ticket
        let tkt = self.wr_leave.load(Ordering::Relaxed);
        let flags = PRES | (tkt as u32 & PHID);
        // reopen the reader gate, then pass the writer token on
        self.rd_enter.fetch_sub(flags, Ordering::Release);
        self.wr_leave.store(tkt.wrapping_add(1), Ordering::Release);
    }
}

impl Default for PfRwLock {
    fn default() -> Self {
        Self::new()
    }
}
