use rand::{Rng, RngCore};
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;



#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of randomness for identifier generation and cache sampling, abstracted so tests can
///  make it deterministic.
#[cfg_attr(test, mockall::automock)]
pub trait Random {
    fn next_u128() -> u128;
    fn gen_usize_range(range: Range<usize>) -> usize;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u128() -> u128 {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        u128::from_le_bytes(raw)
    }

    fn gen_usize_range(range: Range<usize>) -> usize {
        rand::thread_rng().gen_range(range)
    }
}
