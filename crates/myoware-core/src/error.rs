//! Error types for MyoWare Core
//!
//! Errors here stay allocation-free so the crate remains usable on shield
//! firmware as well as on the central.

use core::fmt;

/// A running mode string did not name a known mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeParseError;

impl fmt::Display for ModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown running mode (expected \"standalone\" or \"up-to-host\")")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ModeParseError {}
