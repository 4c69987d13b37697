//! Element classes and the children-list registry.
//!
//! Every element kind has an [`ElementClass`] describing its ordered child
//! slots and its named reference fields. Child slots are numbered from 1 in
//! declaration order, so an element can record "the slot I live in" in three
//! bits of its flags and find its containing list by asking the parent's
//! class for that slot id.
//!
//! The [`Schema`] is immutable once handed to a database; databases share it
//! through an `Arc`, and external databases must have been built against the
//! same schema as the compiled one.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::id::{KindId, ReferenceFieldId, SlotId};

/// Whether a child slot holds at most one element or an ordered list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotMultiplicity {
    Single,
    List,
}

/// Declaration of one child slot as written in a class description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSlotSpec {
    pub name: String,
    pub multiplicity: SlotMultiplicity,
}

impl ChildSlotSpec {
    pub fn single(name: &str) -> Self {
        ChildSlotSpec {
            name: name.to_string(),
            multiplicity: SlotMultiplicity::Single,
        }
    }

    pub fn list(name: &str) -> Self {
        ChildSlotSpec {
            name: name.to_string(),
            multiplicity: SlotMultiplicity::List,
        }
    }
}

/// Description of an element class before registration.
///
/// This is the shape accepted by [`Schema::from_json`]:
///
/// ```json
/// { "name": "call",
///   "child_slots": [ { "name": "arguments", "multiplicity": "list" } ],
///   "references": [ "callee" ] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ElementClassSpec {
    pub name: String,
    #[serde(default)]
    pub child_slots: Vec<ChildSlotSpec>,
    #[serde(default)]
    pub references: Vec<String>,
}

impl ElementClassSpec {
    pub fn new(name: &str) -> Self {
        ElementClassSpec {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_slot(mut self, slot: ChildSlotSpec) -> Self {
        self.child_slots.push(slot);
        self
    }

    pub fn with_reference(mut self, field: &str) -> Self {
        self.references.push(field.to_string());
        self
    }
}

/// A registered child slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSlotDef {
    pub id: SlotId,
    pub name: String,
    pub multiplicity: SlotMultiplicity,
}

/// A registered element class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementClass {
    id: KindId,
    name: String,
    child_slots: Vec<ChildSlotDef>,
    references: Vec<String>,
}

impl ElementClass {
    pub fn id(&self) -> KindId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Child slots in slot-id order (slot `n` is at position `n - 1`).
    pub fn child_slots(&self) -> &[ChildSlotDef] {
        &self.child_slots
    }

    pub fn child_slot(&self, id: SlotId) -> Option<&ChildSlotDef> {
        self.child_slots.get(id.position())
    }

    pub fn child_slot_by_name(&self, name: &str) -> Option<&ChildSlotDef> {
        self.child_slots.iter().find(|slot| slot.name == name)
    }

    pub fn reference_fields(&self) -> &[String] {
        &self.references
    }

    pub fn reference_field(&self, name: &str) -> Option<ReferenceFieldId> {
        self.references
            .iter()
            .position(|field| field == name)
            .map(|pos| ReferenceFieldId(pos as u8))
    }
}

/// Relationship key for a declared reference field: "elements of class
/// `kind` whose field `field` points at me".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReferenceKey {
    pub kind: KindId,
    pub field: ReferenceFieldId,
}

/// Registry of all element classes, providing kind identity via [`KindId`].
#[derive(Debug, Clone, Default)]
pub struct Schema {
    /// Classes indexed by KindId.0
    classes: Vec<ElementClass>,
    /// Name lookup, in registration order
    by_name: IndexMap<String, KindId>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a schema from class descriptions, assigning kind ids in order.
    pub fn from_specs(specs: impl IntoIterator<Item = ElementClassSpec>) -> Result<Self, StoreError> {
        let mut schema = Schema::new();
        for spec in specs {
            schema.register(spec)?;
        }
        Ok(schema)
    }

    /// Parses a JSON array of [`ElementClassSpec`]s.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let specs: Vec<ElementClassSpec> = serde_json::from_str(json)?;
        Self::from_specs(specs)
    }

    /// Registers a class and returns its new [`KindId`].
    ///
    /// Returns [`StoreError::DuplicateClass`] if the name is taken and
    /// [`StoreError::TooManyChildSlots`] if the class declares more slots than
    /// the 3-bit containing-slot field can address.
    pub fn register(&mut self, spec: ElementClassSpec) -> Result<KindId, StoreError> {
        if self.by_name.contains_key(&spec.name) {
            return Err(StoreError::DuplicateClass { name: spec.name });
        }
        if spec.child_slots.len() > SlotId::MAX as usize {
            return Err(StoreError::TooManyChildSlots {
                count: spec.child_slots.len(),
                name: spec.name,
            });
        }

        let id = KindId(self.classes.len() as u16);
        let child_slots = spec
            .child_slots
            .into_iter()
            .zip(1u8..)
            .filter_map(|(slot, raw)| {
                SlotId::new(raw).map(|id| ChildSlotDef {
                    id,
                    name: slot.name,
                    multiplicity: slot.multiplicity,
                })
            })
            .collect();

        self.by_name.insert(spec.name.clone(), id);
        self.classes.push(ElementClass {
            id,
            name: spec.name,
            child_slots,
            references: spec.references,
        });
        Ok(id)
    }

    pub fn class(&self, kind: KindId) -> Option<&ElementClass> {
        self.classes.get(kind.0 as usize)
    }

    pub(crate) fn require_class(&self, kind: KindId) -> Result<&ElementClass, StoreError> {
        self.class(kind).ok_or(StoreError::UnknownKind { kind })
    }

    pub fn kind_by_name(&self, name: &str) -> Option<KindId> {
        self.by_name.get(name).copied()
    }

    /// Looks up the child slot `slot` of class `class`.
    pub fn slot(&self, class: &str, slot: &str) -> Option<SlotId> {
        let kind = self.kind_by_name(class)?;
        self.class(kind)?.child_slot_by_name(slot).map(|def| def.id)
    }

    /// Looks up the relationship key for reference field `field` of class `class`.
    pub fn reference_key(&self, class: &str, field: &str) -> Option<ReferenceKey> {
        let kind = self.kind_by_name(class)?;
        let field = self.class(kind)?.reference_field(field)?;
        Some(ReferenceKey { kind, field })
    }

    pub fn classes(&self) -> impl Iterator<Item = &ElementClass> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
