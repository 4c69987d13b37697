pub mod id;
pub mod error;
pub mod flags;
pub mod schema;
pub mod property;
pub mod backref;
pub mod element;
mod index;
pub mod config;
pub mod database;
pub mod external;
pub mod view;

// Re-export commonly used types
pub use id::{DatabaseId, ElementId, KindId, ReferenceFieldId, SlotId};
pub use error::StoreError;
pub use flags::ElementFlags;
pub use schema::{ChildSlotSpec, ElementClass, ElementClassSpec, ReferenceKey, Schema, SlotMultiplicity};
pub use property::{DynamicPropertyKey, PhaseLifetime, PropertyToken, PropertyValue, TemporaryToken};
pub use backref::BackReferenceKey;
pub use element::{Element, Parent};
pub use config::DatabaseConfig;
pub use database::Database;
pub use external::{ExternalDatabase, ExternalModules};
pub use view::{GraphView, ViewEdge, ViewNode};
