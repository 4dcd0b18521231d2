use std::ops::{Deref, DerefMut};

/// Assumed cache line size in bytes.
///
/// 64 covers x86-64 and most aarch64 parts. Some arm designs have 128-byte
/// lines; padding to 64 there merely halves the false-sharing protection.
pub const CACHE_LINE: usize = 64;

/// Round up to the next power of two, in the u64 domain so that inputs
/// above `1 << 31` stay representable.
pub fn round_up_pow2(x: u32) -> u64 {
    (x.max(1) as u64).next_power_of_two()
}

/// Pads and aligns its contents to a full cache line so two instances never
/// share one.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct CacheAligned<T>(pub T);

impl<T> Deref for CacheAligned<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}
impl<T> DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

const _: () = assert!(std::mem::align_of::<CacheAligned<u32>>() == CACHE_LINE);
