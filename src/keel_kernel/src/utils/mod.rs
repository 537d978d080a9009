//! Utilities
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise. It's exposed only because it's needed by macros and ports.
mod init;
mod prio_bitmap;
mod rand;

pub use self::init::Init;
pub use self::prio_bitmap::{LevelBitmap, OneLevelPrioBitmap, PrioBitmap};
pub(crate) use self::rand::Xorshift32;
