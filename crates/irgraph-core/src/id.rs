//! Stable ID newtypes for store entities.
//!
//! All IDs are distinct newtype wrappers, so a `KindId` cannot be used where
//! a `SlotId` is expected. [`ElementId`] embeds the [`DatabaseId`] of the
//! database that owns the element, which gives every element a process-wide
//! identity without any shared registry.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_DATABASE_ID: AtomicU32 = AtomicU32::new(0);

/// Identity of one database (one compilation unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseId(pub u32);

impl DatabaseId {
    /// Allocates a fresh, never-before-used database id.
    pub(crate) fn fresh() -> Self {
        DatabaseId(NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Element identity: the owning database plus the element's arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId {
    pub db: DatabaseId,
    pub index: u32,
}

impl ElementId {
    pub(crate) fn new(db: DatabaseId, index: usize) -> Self {
        ElementId {
            db,
            index: index as u32,
        }
    }
}

/// Element kind: index of the element's class in the [`Schema`](crate::schema::Schema).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KindId(pub u16);

/// Child slot number within a parent's class. Valid slots are `1..=7`;
/// `0` is reserved for "no containing slot" in the packed element flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SlotId(u8);

impl SlotId {
    /// Highest slot number that fits the 3-bit containing-slot field.
    pub const MAX: u8 = 7;

    /// Returns `None` for `0` and for values above [`SlotId::MAX`].
    pub const fn new(raw: u8) -> Option<SlotId> {
        if raw == 0 || raw > Self::MAX {
            None
        } else {
            Some(SlotId(raw))
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    /// Position of this slot in a class's slot list.
    pub(crate) fn position(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl TryFrom<u8> for SlotId {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        SlotId::new(raw).ok_or_else(|| format!("slot id must be in 1..={}, got {}", SlotId::MAX, raw))
    }
}

impl From<SlotId> for u8 {
    fn from(slot: SlotId) -> u8 {
        slot.0
    }
}

/// Reference field number within an element class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReferenceFieldId(pub u8);

// Display implementations.

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db{}", self.0)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.index, self.db)
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
