//! Bounded concurrent ring buffer
//!
//! One allocation holds a header and a power-of-two slot array. The
//! producer and consumer sides are configured independently at allocation
//! time:
//!
//! - producer: single ([`F_SPENQ`]), multi blocking ([`F_MPENQ`]), or multi
//!   non-blocking ([`F_NBENQ`])
//! - consumer: single ([`F_SCDEQ`]), multi blocking ([`F_MCDEQ`]), multi
//!   non-blocking ([`F_NBDEQ`]), or lock-free speculative ([`F_LFDEQ`])
//!
//! Each side runs the same two-phase protocol: *reserve* a range of slots
//! (a CAS on the side's tail cursor, or a plain read for a single
//! producer/consumer), copy the payload, then *publish* the range by
//! advancing the side's head cursor. Publication is where the modes differ:
//!
//! - blocking: wait until every earlier reservation has published, then
//!   store (in-order handoff; a stalled thread stalls its successors)
//! - non-blocking: publish out of order through a pending bitmask packed
//!   next to the cursor in one 64-bit word. In-order completions are a
//!   single CAS (wait-free); out-of-order completions park their bits in
//!   the mask and the cursor advances by the run of trailing ones, so
//!   consumers still observe a strictly in-order, contiguous head. The
//!   window is [`PENDMAX`] slots; a release that ends beyond it spins until
//!   the head catches up.
//! - lock-free dequeue: consumers skip reservation entirely, read slots
//!   speculatively below the producer-published bound and commit by CASing
//!   the shared consumed cursor; a lost race rereads. Reads can overlap a
//!   producer overwriting the same slots, which is why slots are atomic
//!   words, not arbitrary payloads.
//!
//! Elements are pointer-width tokens (`usize`), typically pointers to the
//! real payload.
//!
//! The handle returned by [`RingBuf::alloc`] carries the two sides' modes
//! in the low six bits of the pointer (the header is 64-byte aligned, so
//! they are free); every call strips them off before touching memory. This
//! keeps the hot paths from re-reading a mode word that never changes.
//!
//! Index arithmetic is on free-running `u32` cursors; slot addressing masks
//! with `ringsz - 1`. Differences like `head - tail` are wrap-safe as long
//! as at most `2^31` elements are in flight, far above the capacity bound.

use std::alloc::{self, Layout};
use std::mem;
use std::ptr;

use thiserror::Error;
use tracing::Level;

use crate::arch::*;
use crate::err::report_error;
use crate::util::{round_up_pow2, CACHE_LINE};

/// Single producer.
pub const F_SPENQ: u32 = 0x0001;
/// Multiple producers, blocking in-order publication.
pub const F_MPENQ: u32 = 0x0002;
/// Single consumer.
pub const F_SCDEQ: u32 = 0x0004;
/// Multiple consumers, blocking in-order publication.
pub const F_MCDEQ: u32 = 0x0008;
/// Multiple producers, non-blocking publication.
pub const F_NBENQ: u32 = 0x0010;
/// Multiple consumers, non-blocking publication.
pub const F_NBDEQ: u32 = 0x0020;
/// Multiple consumers, lock-free speculative dequeue.
pub const F_LFDEQ: u32 = 0x0040;

const SUPPORTED_FLAGS: u32 =
    F_SPENQ | F_MPENQ | F_SCDEQ | F_MCDEQ | F_NBENQ | F_NBDEQ | F_LFDEQ;

// per-side mode bits stored in the tagged pointer
const FLAG_BLK: usize = 0x1;
const FLAG_LOCKFREE: usize = 0x2;
const FLAG_NONBLK: usize = 0x4;
const FLAG_MASK: usize = 0x7;
const TAG_MASK: usize = 0x3f;

/// Maximum out-of-order publication distance in non-blocking mode.
pub const PENDMAX: u32 = 32;

const BKOFF_MAXDOZE: u32 = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingBufError {
    #[error("invalid number of elements: {0}")]
    InvalidNumElems(u32),
    #[error("invalid flags: {0:#x}")]
    InvalidFlags(u32),
    #[error("ring buffer not empty")]
    NotEmpty,
}

/// Published cursor plus pending-release bitmask, CASed as one word.
/// Low 32 bits: cursor. High 32 bits: pending mask (non-blocking mode
/// only; always zero otherwise).
fn pair(cur: u32, pend: u32) -> u64 {
    ((pend as u64) << 32) | cur as u64
}
fn cur(x: u64) -> u32 {
    x as u32
}
fn pend(x: u64) -> u32 {
    (x >> 32) as u32
}

/// One side of the ring.
///
/// `head` is the cursor of slots released *to* this side: for the producer
/// endpoint that is how far consumers have drained, for the consumer
/// endpoint how far producers have filled. `tail` is this side's own
/// reservation cursor (unused by a single producer/consumer, whose
/// published cursor doubles as the reservation).
#[repr(C, align(16))]
struct Endpoint {
    head: AtomicU64,
    tail: AtomicU32,
    capacity: u32,
}

#[repr(C, align(64))]
struct RingBufInner {
    prod: Endpoint,
    prod_mask: u32,
    cons: Endpoint,
    cons_mask: u32,
    // the slot array (AtomicUsize * ringsz) follows the header
}

const _: () = assert!(mem::align_of::<RingBufInner>() >= 64);

/// Reservation handed from the acquire phase to the copy and publication
/// phases.
#[derive(Debug, Clone, Copy)]
struct SlotRange {
    index: u32,
    actual: u32,
    mask: u32,
}

const EMPTY_RANGE: SlotRange = SlotRange {
    index: 0,
    actual: 0,
    mask: 0,
};

/// Handle to an allocated ring buffer. Copyable; all operations take
/// `&self`. The low six pointer bits carry the configured modes
/// (producer in bits 0..=2, consumer in bits 3..=5).
#[derive(Debug, Clone, Copy)]
pub struct RingBuf {
    ptr: *mut RingBufInner,
}

// safety: the header is all atomics after initialization and the slot
// protocol enforces exclusive slot access per the configured modes
unsafe impl Send for RingBuf {}
unsafe impl Sync for RingBuf {}

/// Single producer/consumer reservation. The caller is the only thread on
/// its side, so its published cursor doubles as the reservation cursor and
/// no CAS is needed.
fn acquire_slots(head: &AtomicU64, tail: &AtomicU64, mask: u32, num: u32, capacity: u32) -> SlotRange {
    let tail = cur(tail.load(Ordering::Relaxed));
    // pairs with the peer side's releasing publication
    let head = cur(head.load(Ordering::Acquire));
    let actual = num.min(capacity.wrapping_add(head).wrapping_sub(tail));
    if actual == 0 {
        return EMPTY_RANGE;
    }
    SlotRange {
        index: tail,
        actual,
        mask,
    }
}

/// Multi producer/consumer reservation: CAS this side's tail cursor.
///
/// The peer cursor is loaded once; a stale value can only under-report the
/// available range, and the tail CAS re-validates the reservation itself.
fn acquire_slots_mt(ep: &Endpoint, mask: u32, num: u32) -> SlotRange {
    let mut tail = ep.tail.load(Ordering::Relaxed);
    // pairs with the peer side's releasing publication
    let head = cur(ep.head.load(Ordering::Acquire));
    loop {
        let actual = num.min(ep.capacity.wrapping_add(head).wrapping_sub(tail));
        if actual == 0 {
            return EMPTY_RANGE;
        }
        match ep.tail.compare_exchange_weak(
            tail,
            tail.wrapping_add(actual),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                return SlotRange {
                    index: tail,
                    actual,
                    mask,
                }
            }
            Err(x) => tail = x,
        }
    }
}

/// Publish `[idx, idx + n)` through the cursor at `loc`, per the side's
/// mode. `loads_only` is set by consumers, whose critical accesses were
/// loads; they fence instead of using a release store.
fn release_slots(loc: &AtomicU64, idx: u32, n: u32, loads_only: bool, flags: usize) {
    if flags & FLAG_BLK != 0 {
        // in-order handoff: wait for every earlier reservation to publish
        wait_until_w_bkoff(|| cur(loc.load(Ordering::Relaxed)) == idx, BKOFF_MAXDOZE);
    }
    if flags & FLAG_NONBLK == 0 {
        let new = pair(idx.wrapping_add(n), 0);
        if loads_only {
            // keep the slot reads above the publication
            fence(Ordering::Release);
            loc.store(new, Ordering::Relaxed);
        } else {
            loc.store(new, Ordering::Release);
        }
        return;
    }
    // non-blocking publication
    let mut old;
    loop {
        // in-order fast path: pending mask clear before and after
        old = pair(idx, 0);
        let new = pair(idx.wrapping_add(n), 0);
        match loc.compare_exchange(old, new, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => return,
            Err(x) => old = x,
        }
        let delta = idx.wrapping_add(n).wrapping_sub(cur(old));
        if delta <= PENDMAX {
            break;
        }
        // our range ends beyond the pending window (always the case for
        // ranges larger than the window); wait for the cursor to catch up
        spin_hint();
    }
    loop {
        let offset = idx.wrapping_sub(cur(old));
        debug_assert!(n + offset <= PENDMAX);
        let ourpend = ((1u64 << n) - 1) << offset;
        debug_assert_eq!(pend(old) as u64 & ourpend, 0);
        let newpend = pend(old) as u64 | ourpend;
        // the cursor may advance by the run of trailing ones
        let inorder = (!newpend).trailing_zeros();
        let new = pair(
            cur(old).wrapping_add(inorder),
            (newpend >> inorder) as u32,
        );
        match loc.compare_exchange(old, new, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => return,
            Err(x) => old = x,
        }
    }
}

impl RingBuf {
    fn layout(ringsz: u64) -> Option<Layout> {
        let slots = usize::try_from(ringsz)
            .ok()?
            .checked_mul(mem::size_of::<AtomicUsize>())?;
        let nbytes = mem::size_of::<RingBufInner>().checked_add(slots)?;
        Layout::from_size_align(nbytes, CACHE_LINE.max(mem::align_of::<RingBufInner>())).ok()
    }

    /// Allocate a ring buffer with room for `nelems` elements (the slot
    /// array is `nelems` rounded up to a power of two) and the given mode
    /// flags.
    ///
    /// Rejected flag combinations: `F_SPENQ | F_NBENQ`, `F_SCDEQ | F_NBDEQ`,
    /// `F_SCDEQ | F_LFDEQ`, `F_NBDEQ | F_LFDEQ`.
    pub fn alloc(nelems: u32, flags: u32) -> Result<RingBuf, RingBufError> {
        if nelems == 0 {
            report_error("ringbuf", "invalid number of elements", nelems as u64);
            return Err(RingBufError::InvalidNumElems(nelems));
        }
        // single-x and non-blocking-x are mutually exclusive, as are the
        // two multi-consumer protocols
        let invalid_combos = [
            F_SPENQ | F_NBENQ,
            F_SCDEQ | F_NBDEQ,
            F_SCDEQ | F_LFDEQ,
            F_NBDEQ | F_LFDEQ,
        ];
        if flags & !SUPPORTED_FLAGS != 0
            || invalid_combos.iter().any(|&c| flags & c == c)
        {
            report_error("ringbuf", "invalid flags", flags as u64);
            return Err(RingBufError::InvalidFlags(flags));
        }
        let ringsz = round_up_pow2(nelems);
        let mask = (ringsz - 1) as u32;
        let layout = match Self::layout(ringsz) {
            Some(l) => l,
            None => {
                report_error("ringbuf", "invalid number of elements", nelems as u64);
                return Err(RingBufError::InvalidNumElems(nelems));
            }
        };
        // safety: layout has nonzero size
        let base = unsafe { alloc::alloc(layout) } as *mut RingBufInner;
        if base.is_null() {
            alloc::handle_alloc_error(layout);
        }
        // safety: base is valid for the whole layout; the header and every
        // slot are constructed in place before the handle escapes
        unsafe {
            ptr::write(
                base,
                RingBufInner {
                    prod: Endpoint {
                        head: AtomicU64::new(0),
                        tail: AtomicU32::new(0),
                        capacity: nelems,
                    },
                    prod_mask: mask,
                    cons: Endpoint {
                        head: AtomicU64::new(0),
                        tail: AtomicU32::new(0),
                        capacity: 0,
                    },
                    cons_mask: mask,
                },
            );
            let slots = (base as *mut u8).add(mem::size_of::<RingBufInner>()) as *mut AtomicUsize;
            for i in 0..ringsz as usize {
                ptr::write(slots.add(i), AtomicUsize::new(0));
            }
        }
        let prod_bits = if flags & F_SPENQ != 0 {
            0
        } else if flags & F_NBENQ != 0 {
            FLAG_NONBLK
        } else {
            FLAG_BLK
        };
        let mut cons_bits = if flags & F_SCDEQ != 0 {
            0
        } else if flags & F_NBDEQ != 0 {
            FLAG_NONBLK
        } else {
            FLAG_BLK
        };
        if flags & F_LFDEQ != 0 {
            cons_bits |= FLAG_LOCKFREE;
        }
        tracing::event!(
            name: "ringbuf::alloc",
            Level::DEBUG,
            nelems,
            flags = format_args!("{flags:#x}"),
            ringsz
        );
        Ok(RingBuf {
            ptr: ((base as usize) | (cons_bits << 3) | prod_bits) as *mut RingBufInner,
        })
    }

    /// Free the ring buffer. Refuses (and reports) if it still holds
    /// elements.
    pub fn free(self) -> Result<(), RingBufError> {
        let (base, layout);
        {
            let rb = self.inner();
            let produced = cur(rb.cons.head.load(Ordering::Relaxed));
            let consumed = cur(rb.prod.head.load(Ordering::Relaxed));
            if produced != consumed {
                report_error("ringbuf", "ring buffer not empty", self.base_addr() as u64);
                return Err(RingBufError::NotEmpty);
            }
            let ringsz = rb.prod_mask as u64 + 1;
            // the layout succeeded at alloc time
            layout = Self::layout(ringsz).unwrap();
            base = self.base_addr();
        }
        tracing::event!(name: "ringbuf::free", Level::DEBUG, base = format_args!("{base:#x}"));
        // safety: base/layout are exactly what alloc produced, and the
        // caller is done with every outstanding handle copy
        unsafe { alloc::dealloc(base as *mut u8, layout) };
        Ok(())
    }

    fn base_addr(&self) -> usize {
        self.ptr as usize & !TAG_MASK
    }
    fn prod_flags(&self) -> usize {
        self.ptr as usize & FLAG_MASK
    }
    fn cons_flags(&self) -> usize {
        (self.ptr as usize >> 3) & FLAG_MASK
    }
    fn inner(&self) -> &RingBufInner {
        // safety: the untagged pointer is the allocation made by alloc()
        unsafe { &*(self.base_addr() as *const RingBufInner) }
    }
    fn slot(&self, idx: u32, mask: u32) -> &AtomicUsize {
        // safety: the slot array of mask+1 entries directly follows the
        // header; idx is masked into range
        unsafe {
            let slots =
                (self.base_addr() as *const u8).add(mem::size_of::<RingBufInner>()) as *const AtomicUsize;
            &*slots.add((idx & mask) as usize)
        }
    }

    fn write_slots(&self, ev: &[usize], r: SlotRange, nonblk: bool) {
        if nonblk {
            // slot 0 goes last with release: a consumer that observes the
            // head of the batch sees all of it
            for i in 1..r.actual {
                self.slot(r.index.wrapping_add(i), r.mask)
                    .store(ev[i as usize], Ordering::Relaxed);
            }
            self.slot(r.index, r.mask).store(ev[0], Ordering::Release);
        } else {
            for i in 0..r.actual {
                self.slot(r.index.wrapping_add(i), r.mask)
                    .store(ev[i as usize], Ordering::Relaxed);
            }
        }
    }

    fn read_slots(&self, ev: &mut [usize], r: SlotRange) {
        for i in 0..r.actual {
            ev[i as usize] = self
                .slot(r.index.wrapping_add(i), r.mask)
                .load(Ordering::Relaxed);
        }
    }

    /// Enqueue up to `ev.len()` elements; returns how many were taken
    /// (possibly zero when the ring is full).
    pub fn enqueue(&self, ev: &[usize]) -> u32 {
        let pf = self.prod_flags();
        let rb = self.inner();
        let num = ev.len().min(u32::MAX as usize) as u32;

        let r = if pf & (FLAG_BLK | FLAG_NONBLK) == 0 {
            acquire_slots(
                &rb.prod.head,
                &rb.cons.head,
                rb.prod_mask,
                num,
                rb.prod.capacity,
            )
        } else {
            acquire_slots_mt(&rb.prod, rb.prod_mask, num)
        };
        if r.actual == 0 {
            return 0;
        }

        self.write_slots(ev, r, pf & FLAG_NONBLK != 0);

        // publish to consumers through their endpoint's head
        release_slots(&rb.cons.head, r.index, r.actual, false, pf);
        r.actual
    }

    /// Dequeue up to `ev.len()` elements; returns how many arrived and the
    /// ring index of the first one.
    pub fn dequeue(&self, ev: &mut [usize]) -> (u32, u32) {
        let cf = self.cons_flags();
        let rb = self.inner();
        let num = ev.len().min(u32::MAX as usize) as u32;

        if cf & FLAG_LOCKFREE != 0 {
            let mask = rb.cons_mask;
            // the consumed cursor is shared by all lock-free consumers;
            // the consumer endpoint's tail is unused in this mode
            let mut head = cur(rb.prod.head.load(Ordering::Relaxed));
            let tail = cur(rb.cons.head.load(Ordering::Acquire));
            loop {
                let actual = num.min(tail.wrapping_sub(head));
                if actual == 0 {
                    return (0, 0);
                }
                // speculative, non-destructive read; a lost commit rereads
                for i in 0..actual {
                    ev[i as usize] = self.slot(head.wrapping_add(i), mask).load(Ordering::Relaxed);
                }
                // commit, releasing the slots to producers
                match rb.prod.head.compare_exchange_weak(
                    pair(head, 0),
                    pair(head.wrapping_add(actual), 0),
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return (actual, head),
                    Err(x) => head = cur(x),
                }
            }
        }

        let r = if cf & (FLAG_BLK | FLAG_NONBLK) == 0 {
            acquire_slots(&rb.cons.head, &rb.prod.head, rb.cons_mask, num, 0)
        } else {
            acquire_slots_mt(&rb.cons, rb.cons_mask, num)
        };
        if r.actual == 0 {
            return (0, 0);
        }

        self.read_slots(ev, r);

        // release the drained slots to producers through their endpoint's
        // head; we only read, hence loads_only
        release_slots(&rb.prod.head, r.index, r.actual, true, cf);
        (r.actual, r.index)
    }
}
