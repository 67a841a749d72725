//! ReplicaId: Identifies one replica of a map in Loro version vectors.
//!
//! Wraps a u64 internally (the Loro peer id) but displays as
//! a 16-character hex string in logs.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicaIdError {
    #[error("Invalid replica ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Replica ID must not be zero")]
    Zero,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Identifier of one replica (device/process) editing a map.
///
/// # Examples
/// ```
/// use crdt_map::ReplicaId;
///
/// let parsed: ReplicaId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// assert_eq!(parsed.to_string(), "a1b2c3d4e5f67890");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplicaId(u64);

impl ReplicaId {
    /// Generate a new random replica ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    /// Get the underlying u64 value (for Loro API).
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = ReplicaIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ReplicaIdError::InvalidFormat);
        }
        let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
        Self::try_from(id)
    }
}

impl TryFrom<u64> for ReplicaId {
    type Error = ReplicaIdError;

    fn try_from(id: u64) -> Result<Self, Self::Error> {
        if id == 0 {
            return Err(ReplicaIdError::Zero);
        }
        Ok(Self(id))
    }
}
