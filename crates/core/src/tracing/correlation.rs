//! Correlation IDs for tying together the log lines of one connection
//!
//! Every accepted connection or background job gets a random 64-bit id that is
//! attached to its span, so interleaved output from concurrent tasks can be
//! filtered back apart.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// A correlation ID rendered as 16 lowercase hex digits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Create a new random correlation ID
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// Create a correlation ID from a known value
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Raw value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Self)
    }
}
