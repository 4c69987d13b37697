//! Read-only databases of already-compiled dependency units.
//!
//! A local [`Database`] becomes external through [`Database::freeze`]:
//! movements are reconciled and forward references indexed one last time,
//! then the database is moved behind an `Arc`. Nothing can mutate it after
//! that, so it is shared freely across threads and all of its queries take
//! `&self`.

use std::sync::Arc;

use crate::backref::BackReferenceKey;
use crate::database::Database;
use crate::error::StoreError;
use crate::id::{DatabaseId, ElementId, KindId};
use crate::property::{PropertyToken, PropertyValue};
use crate::schema::Schema;

/// A frozen, shareable database.
#[derive(Debug, Clone)]
pub struct ExternalDatabase {
    inner: Arc<Database>,
}

impl ExternalDatabase {
    pub(crate) fn new(database: Database) -> Self {
        ExternalDatabase {
            inner: Arc::new(database),
        }
    }

    pub fn id(&self) -> DatabaseId {
        self.inner.id()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.inner.schema()
    }

    /// The frozen database, for read-only traversal.
    pub fn database(&self) -> &Database {
        &self.inner
    }

    pub fn get_elements_with_index(&self, kind: KindId) -> impl Iterator<Item = ElementId> + Clone + '_ {
        self.inner.indexed_elements(kind)
    }

    pub fn is_ancestor_of(&self, ancestor: ElementId, descendant: ElementId) -> Result<bool, StoreError> {
        if ancestor.db != descendant.db {
            return Ok(false);
        }
        self.inner.walk_is_ancestor(ancestor, descendant)
    }

    pub fn containing_database(&self, element: ElementId) -> Result<Option<DatabaseId>, StoreError> {
        self.inner.element(element).map(|e| e.attached_to)
    }

    pub fn get_back_references<K: BackReferenceKey + ?Sized>(
        &self,
        target: ElementId,
        key: &K,
    ) -> Result<Vec<ElementId>, StoreError> {
        self.inner.collect_back_references(target, key)
    }

    pub fn peek_property<T: PropertyValue>(
        &self,
        element: ElementId,
        token: &impl PropertyToken<T>,
    ) -> Result<Option<&T>, StoreError> {
        self.inner.peek_property(element, token)
    }
}

/// The external databases visible to one compilation unit.
#[derive(Debug, Clone)]
pub struct ExternalModules {
    schema: Arc<Schema>,
    modules: Vec<ExternalDatabase>,
}

impl ExternalModules {
    pub fn new(schema: Arc<Schema>) -> Self {
        ExternalModules {
            schema,
            modules: Vec::new(),
        }
    }

    /// Adds an external database. It must share this unit's schema.
    pub fn register(&mut self, module: ExternalDatabase) -> Result<(), StoreError> {
        if !Arc::ptr_eq(&self.schema, module.schema()) {
            return Err(StoreError::SchemaMismatch { db: module.id() });
        }
        if self.get(module.id()).is_some() {
            return Err(StoreError::DuplicateDatabase { db: module.id() });
        }
        tracing::debug!(db = %module.id(), name = module.name(), "registered external module");
        self.modules.push(module);
        Ok(())
    }

    pub fn get(&self, db: DatabaseId) -> Option<&ExternalDatabase> {
        self.modules.iter().find(|module| module.id() == db)
    }

    /// The external database owning `element`, as seen from database `queried`.
    pub(crate) fn owner_of(&self, element: ElementId, queried: DatabaseId) -> Result<&ExternalDatabase, StoreError> {
        self.get(element.db).ok_or(StoreError::ForeignElement {
            element,
            owner: element.db,
            queried,
        })
    }

    /// Indexed elements of `kind` across every module, in registration order.
    pub fn get_elements_with_index(&self, kind: KindId) -> impl Iterator<Item = ElementId> + Clone + '_ {
        self.modules
            .iter()
            .flat_map(move |module| module.get_elements_with_index(kind))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExternalDatabase> {
        self.modules.iter()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
