//! Element: one IR tree node as stored in a database arena.
//!
//! Elements are addressed by [`ElementId`] and only reachable through their
//! owning [`Database`](crate::database::Database). The parent link is a
//! plain id, so the tree carries no ownership cycles; the database arena
//! owns every element outright.

use smallvec::SmallVec;

use crate::backref::BackReferences;
use crate::flags::ElementFlags;
use crate::id::{DatabaseId, ElementId, KindId, ReferenceFieldId, SlotId};
use crate::property::PropertyMap;
use crate::schema::{ElementClass, SlotMultiplicity};

/// Structural parent of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parent {
    /// A top-level element held directly by its database.
    Database,
    /// A child of another element.
    Element(ElementId),
}

impl Parent {
    pub fn element(self) -> Option<ElementId> {
        match self {
            Parent::Database => None,
            Parent::Element(id) => Some(id),
        }
    }
}

/// Children held in one child slot of a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChildSlot {
    Single(Option<ElementId>),
    List(Vec<ElementId>),
}

impl ChildSlot {
    pub(crate) fn for_multiplicity(multiplicity: SlotMultiplicity) -> Self {
        match multiplicity {
            SlotMultiplicity::Single => ChildSlot::Single(None),
            SlotMultiplicity::List => ChildSlot::List(Vec::new()),
        }
    }

    pub(crate) fn elements(&self) -> &[ElementId] {
        match self {
            ChildSlot::Single(child) => child.as_slice(),
            ChildSlot::List(children) => children,
        }
    }

    /// Unlinks `child`, returning whether it was present.
    pub(crate) fn remove(&mut self, child: ElementId) -> bool {
        match self {
            ChildSlot::Single(occupant) => {
                if *occupant == Some(child) {
                    *occupant = None;
                    true
                } else {
                    false
                }
            }
            ChildSlot::List(children) => match children.iter().position(|c| *c == child) {
                Some(pos) => {
                    children.remove(pos);
                    true
                }
                None => false,
            },
        }
    }

    /// Puts `new` where `old` is, returning whether `old` was present.
    pub(crate) fn substitute(&mut self, old: ElementId, new: ElementId) -> bool {
        match self {
            ChildSlot::Single(occupant) => {
                if *occupant == Some(old) {
                    *occupant = Some(new);
                    true
                } else {
                    false
                }
            }
            ChildSlot::List(children) => match children.iter_mut().find(|c| **c == old) {
                Some(entry) => {
                    *entry = new;
                    true
                }
                None => false,
            },
        }
    }
}

/// A single IR node.
#[derive(Debug)]
pub struct Element {
    pub(crate) kind: KindId,
    pub(crate) flags: ElementFlags,
    pub(crate) parent: Option<Parent>,
    /// Database this element is attached to, as of the last reconciliation.
    /// Stale while movements are pending.
    pub(crate) attached_to: Option<DatabaseId>,
    /// Loaded with a permanent parent; can never be moved.
    pub(crate) anchored: bool,
    pub(crate) children: Box<[ChildSlot]>,
    pub(crate) references: SmallVec<[Option<ElementId>; 2]>,
    pub(crate) back_references: BackReferences,
    pub(crate) properties: PropertyMap,
}

impl Element {
    pub(crate) fn new(class: &ElementClass) -> Self {
        Element {
            kind: class.id(),
            // No forward references yet, so the (empty) cache is valid.
            flags: ElementFlags::HAS_VALID_FORWARD_REFERENCES,
            parent: None,
            attached_to: None,
            anchored: false,
            children: class
                .child_slots()
                .iter()
                .map(|slot| ChildSlot::for_multiplicity(slot.multiplicity))
                .collect(),
            references: SmallVec::from_elem(None, class.reference_fields().len()),
            back_references: BackReferences::Empty,
            properties: PropertyMap::default(),
        }
    }

    pub fn kind(&self) -> KindId {
        self.kind
    }

    pub fn flags(&self) -> ElementFlags {
        self.flags
    }

    /// Raw structural parent. Always current, even with movements pending.
    pub fn parent(&self) -> Option<Parent> {
        self.parent
    }

    pub fn containing_slot(&self) -> Option<SlotId> {
        self.flags.containing_slot()
    }

    pub fn is_anchored(&self) -> bool {
        self.anchored
    }

    pub(crate) fn slot(&self, slot: SlotId) -> Option<&ChildSlot> {
        self.children.get(slot.position())
    }

    pub(crate) fn slot_mut(&mut self, slot: SlotId) -> Option<&mut ChildSlot> {
        self.children.get_mut(slot.position())
    }

    /// All children, slot by slot.
    pub(crate) fn child_ids(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.children.iter().flat_map(|slot| slot.elements().iter().copied())
    }

    pub(crate) fn reference(&self, field: ReferenceFieldId) -> Option<ElementId> {
        self.references.get(field.0 as usize).copied().flatten()
    }

    pub(crate) fn forward_references(&self) -> impl Iterator<Item = ElementId> + '_ {
        self.references.iter().filter_map(|target| *target)
    }

    pub(crate) fn is_attached_to(&self, db: DatabaseId) -> bool {
        self.attached_to == Some(db)
    }
}
