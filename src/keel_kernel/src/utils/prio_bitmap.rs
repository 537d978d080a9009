//! Provides `OneLevelPrioBitmap`, a bit array structure supporting
//! constant-time find-first-set scans, sized for the scheduler's priority
//! levels.
use core::fmt;

use super::Init;

/// The bitmap type used by the scheduler's ready queue (one bit per
/// priority level).
pub type LevelBitmap = OneLevelPrioBitmap<u8>;

/// A bit array structure supporting constant-time bit scan operations.
///
/// All valid instantiations implement [`PrioBitmap`].
pub trait PrioBitmap: Init + Send + Sync + Clone + Copy + fmt::Debug + 'static {
    /// The number of bits this bitmap can store.
    const LEN: usize;

    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the position of the first (lowest-index) set bit.
    fn find_set(&self) -> Option<usize>;
}

/// Stores up to `T::BITS` entries in a single machine word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OneLevelPrioBitmap<T> {
    bits: T,
}

macro_rules! impl_one_level {
    ($($ty:ty),*) => {$(
        impl Init for OneLevelPrioBitmap<$ty> {
            const INIT: Self = Self { bits: 0 };
        }

        impl fmt::Debug for OneLevelPrioBitmap<$ty> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_list()
                    .entries((0..Self::LEN).filter(|&i| self.get(i)))
                    .finish()
            }
        }

        impl PrioBitmap for OneLevelPrioBitmap<$ty> {
            const LEN: usize = <$ty>::BITS as usize;

            fn get(&self, i: usize) -> bool {
                assert!(i < Self::LEN);
                self.bits & (1 << i) != 0
            }

            fn clear(&mut self, i: usize) {
                assert!(i < Self::LEN);
                self.bits &= !(1 << i);
            }

            fn set(&mut self, i: usize) {
                assert!(i < Self::LEN);
                self.bits |= 1 << i;
            }

            fn find_set(&self) -> Option<usize> {
                let i = self.bits.trailing_zeros() as usize;
                if i == Self::LEN {
                    None
                } else {
                    Some(i)
                }
            }
        }
    )*};
}

impl_one_level!(u8, u16, u32);
