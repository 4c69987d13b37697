//! Packed per-element state flags.
//!
//! One byte per element: five membership bits plus a 3-bit field recording
//! which child slot of the parent currently holds the element.
//!
//! ```text
//!  7   6   5   4   3   2   1   0
//! [ slot id ] IR  RB  MB  FR  KI
//! ```

use bitflags::bitflags;

use crate::id::SlotId;

bitflags! {
    /// Membership state of one element.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ElementFlags: u8 {
        /// Present in its database's kind index.
        const IN_KIND_INDEX = 1 << 0;
        /// Every forward reference of the element has been registered as a
        /// back-reference on its target. Cleared when a reference changes.
        const HAS_VALID_FORWARD_REFERENCES = 1 << 1;
        /// Queued in the pending-movements buffer.
        const IN_MOVED_BUFFER = 1 << 2;
        /// Has been registered as some element's back-reference at least once.
        const REGISTERED_AS_BACK_REFERENCE = 1 << 3;
        /// The element should be in the kind index whenever it is attached.
        const INDEXING_REQUESTED = 1 << 4;
        /// Containing slot id, `0` meaning "no parent slot".
        const CONTAINING_SLOT = 0b1110_0000;
    }
}

impl ElementFlags {
    const SLOT_SHIFT: u32 = 5;

    /// The child slot of the parent that holds this element.
    pub fn containing_slot(self) -> Option<SlotId> {
        SlotId::new((self.bits() & Self::CONTAINING_SLOT.bits()) >> Self::SLOT_SHIFT)
    }

    pub fn set_containing_slot(&mut self, slot: Option<SlotId>) {
        let raw = slot.map_or(0, SlotId::get) << Self::SLOT_SHIFT;
        *self = Self::from_bits_retain((self.bits() & !Self::CONTAINING_SLOT.bits()) | raw);
    }
}
