//! Store error types for irgraph-core.
//!
//! Uses `thiserror` for structured, matchable error variants. Every variant is
//! a programmer-error-class failure local to one lowering pass: nothing in the
//! store performs I/O, so nothing here is transient or retryable.

use thiserror::Error;

use crate::id::{DatabaseId, ElementId, KindId, SlotId};

/// Errors produced by the irgraph-core crate.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Re-parenting an anchored/external element, targeting a slot the parent
    /// does not define, or creating a cycle.
    #[error("illegal move of element {element}: {reason}")]
    IllegalMove { element: ElementId, reason: String },

    /// Mutating an element owned by a frozen (external) database.
    #[error("illegal mutation of element {element}: {reason}")]
    IllegalMutation { element: ElementId, reason: String },

    /// Reading or writing through a temporary token whose phase has ended.
    #[error("the property token can only be used within the phase '{phase}'")]
    InvalidToken { phase: String },

    /// A back-reference query on an element not attached to its database.
    #[error("element {element} is not attached to any database")]
    DetachedElement { element: ElementId },

    /// An element claims a containing slot its parent's class does not define.
    #[error("element {parent} (kind {kind}) does not have a children list with id {slot}")]
    UnknownChildSlot {
        parent: ElementId,
        kind: KindId,
        slot: u8,
    },

    /// A kind id that is not registered in the schema.
    #[error("unknown element kind: {kind}")]
    UnknownKind { kind: KindId },

    /// An element id whose arena slot does not exist in its database.
    #[error("element not found: {element}")]
    ElementNotFound { element: ElementId },

    /// An element id owned by a different database than the one queried.
    #[error("element {element} belongs to {owner}, not {queried}")]
    ForeignElement {
        element: ElementId,
        owner: DatabaseId,
        queried: DatabaseId,
    },

    /// A reference field that the element's class does not declare.
    #[error("element class '{class}' has no reference field '{field}'")]
    UnknownReferenceField { class: String, field: String },

    /// Registering an element class whose name is already taken.
    #[error("duplicate element class name: '{name}'")]
    DuplicateClass { name: String },

    /// An element class declaring more child slots than the flags can encode.
    #[error("element class '{name}' declares {count} child slots; at most {max} are supported", max = SlotId::MAX)]
    TooManyChildSlots { name: String, count: usize },

    /// An external database built against a different schema.
    #[error("database {db} was built against a different schema")]
    SchemaMismatch { db: DatabaseId },

    /// Registering the same external database twice.
    #[error("database {db} is already registered")]
    DuplicateDatabase { db: DatabaseId },

    /// A stored property value whose type differs from the token's type.
    #[error("dynamic property '{key}' holds a value of a different type")]
    PropertyTypeMismatch { key: String },

    /// A store invariant was violated.
    #[error("store inconsistency: {reason}")]
    Inconsistency { reason: String },

    /// A JSON schema description failed to parse.
    #[error("schema description error: {0}")]
    SchemaFormat(#[from] serde_json::Error),
}
