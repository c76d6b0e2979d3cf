//! Newtype identifiers

use std::fmt;

/// Identifies one producer lane inside the ring buffer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaneId(pub u32);

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lane:{}", self.0)
    }
}

impl From<u32> for LaneId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
