//! Database: the root container of one compilation unit.
//!
//! [`Database`] owns every local element in an arena addressed by
//! [`ElementId`], the per-kind index of the unit, and the external databases
//! the unit may read from. All mutations go through `Database` methods.
//!
//! # Lazy reconciliation
//!
//! Tree edits only rewrite parent/child links and push the moved element
//! into the pending-movements buffer. Each element's cached containing
//! database and its kind-index membership are brought up to date in one
//! batch by [`Database::realize_tree_movements`], which every query that
//! depends on them calls first. Likewise, [`Database::set_reference`] only
//! queues the referring element; its back-references are registered on the
//! targets right before the next back-reference query.
//!
//! A database is mutated by one thread at a time through `&mut self`. To
//! share it with other units, [`Database::freeze`] it.
//!
//! # Costs
//!
//! Back-references onto elements of external databases live in a side table
//! keyed by the foreign target. An entry is dropped only when its last
//! referrer is removed with [`Database::remove_back_reference`]; referrers
//! that merely stop pointing at the target are filtered at query time and
//! keep the entry alive for the life of the unit. Leaving the kind index is
//! linear in the size of the kind's bucket, since the bucket keeps indexing
//! order.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use smallvec::SmallVec;

use crate::backref::{BackReferenceKey, BackReferences};
use crate::config::DatabaseConfig;
use crate::element::{ChildSlot, Element, Parent};
use crate::error::StoreError;
use crate::external::{ExternalDatabase, ExternalModules};
use crate::flags::ElementFlags;
use crate::id::{DatabaseId, ElementId, KindId, SlotId};
use crate::index::KindIndex;
use crate::property::{PropertyToken, PropertyValue};
use crate::schema::{ReferenceKey, Schema};

/// The element store of one compilation unit.
#[derive(Debug)]
pub struct Database {
    id: DatabaseId,
    config: DatabaseConfig,
    schema: Arc<Schema>,
    /// Element arena indexed by `ElementId::index`
    elements: Vec<Element>,
    /// Elements whose parent is the database itself
    roots: Vec<ElementId>,
    kind_index: KindIndex,
    /// Moved elements with the parent they had when first queued
    moved_elements: Vec<(ElementId, Option<Parent>)>,
    /// Elements whose forward references changed since the last indexing
    forward_reference_queue: Vec<ElementId>,
    /// Back-references onto elements of external databases
    foreign_back_references: HashMap<ElementId, BackReferences>,
    externals: ExternalModules,
}

impl Database {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self::with_config(schema, DatabaseConfig::default())
    }

    pub fn with_config(schema: Arc<Schema>, config: DatabaseConfig) -> Self {
        Database {
            id: DatabaseId::fresh(),
            config,
            externals: ExternalModules::new(schema.clone()),
            schema,
            elements: Vec::new(),
            roots: Vec::new(),
            kind_index: KindIndex::default(),
            moved_elements: Vec::new(),
            forward_reference_queue: Vec::new(),
            foreign_back_references: HashMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Read-only accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> DatabaseId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Number of elements ever created in this database.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Top-level elements, in attachment order.
    pub fn roots(&self) -> &[ElementId] {
        &self.roots
    }

    /// Number of movements waiting for [`Database::realize_tree_movements`].
    pub fn pending_movements(&self) -> usize {
        self.moved_elements.len()
    }

    pub fn external_modules(&self) -> &ExternalModules {
        &self.externals
    }

    /// Returns a local element.
    pub fn element(&self, id: ElementId) -> Result<&Element, StoreError> {
        let index = self.local_index(id)?;
        Ok(&self.elements[index])
    }

    /// Returns a local element or one owned by a registered external database.
    pub fn resolve(&self, id: ElementId) -> Result<&Element, StoreError> {
        if id.db == self.id {
            self.element(id)
        } else {
            self.externals.owner_of(id, self.id)?.database().element(id)
        }
    }

    pub fn kind(&self, element: ElementId) -> Result<KindId, StoreError> {
        self.resolve(element).map(Element::kind)
    }

    /// Raw structural parent; does not need reconciliation.
    pub fn parent(&self, element: ElementId) -> Result<Option<Parent>, StoreError> {
        self.resolve(element).map(Element::parent)
    }

    /// Children currently held in `slot` of `parent`.
    pub fn children(&self, parent: ElementId, slot: SlotId) -> Result<&[ElementId], StoreError> {
        let element = self.resolve(parent)?;
        element
            .slot(slot)
            .map(ChildSlot::elements)
            .ok_or(StoreError::UnknownChildSlot {
                parent,
                kind: element.kind,
                slot: slot.get(),
            })
    }

    /// The child list of the parent that holds `element`, or `None` for a
    /// top-level or detached element.
    pub fn containing_list(&self, element: ElementId) -> Result<Option<&[ElementId]>, StoreError> {
        let e = self.resolve(element)?;
        match (e.parent, e.containing_slot()) {
            (Some(Parent::Element(parent)), Some(slot)) => self.children(parent, slot).map(Some),
            _ => Ok(None),
        }
    }

    /// Current forward pointer of `element` through `key`; `None` when unset
    /// or when `element` is not of `key`'s kind.
    pub fn reference(&self, element: ElementId, key: ReferenceKey) -> Option<ElementId> {
        self.resolve(element)
            .ok()
            .filter(|e| e.kind == key.kind)
            .and_then(|e| e.reference(key.field))
    }

    // -----------------------------------------------------------------------
    // Element creation and tree edits
    // -----------------------------------------------------------------------

    /// Creates a detached element of the given kind.
    pub fn create_element(&mut self, kind: KindId) -> Result<ElementId, StoreError> {
        let class = self.schema.require_class(kind)?;
        let id = ElementId::new(self.id, self.elements.len());
        self.elements.push(Element::new(class));
        tracing::trace!(element = %id, class = class.name(), "created element");
        Ok(id)
    }

    /// Creates an element with a permanent parent, the way deserialized
    /// elements are loaded. The element can never be moved afterwards.
    pub fn load_anchored_element(
        &mut self,
        kind: KindId,
        parent: Parent,
        slot: Option<SlotId>,
    ) -> Result<ElementId, StoreError> {
        let element = self.create_element(kind)?;
        match (parent, slot) {
            (Parent::Database, _) => self.move_to_root(element)?,
            (Parent::Element(parent), Some(slot)) => self.move_to(element, parent, slot)?,
            (Parent::Element(parent), None) => {
                return Err(StoreError::IllegalMove {
                    element,
                    reason: format!("no child slot given for anchoring under {}", parent),
                })
            }
        }
        self.elements[element.index as usize].anchored = true;
        Ok(element)
    }

    /// Moves `element` into child slot `slot` of `parent`.
    ///
    /// A list slot appends the element. A single-child slot detaches its
    /// previous occupant. The move is reconciled lazily.
    pub fn move_to(&mut self, element: ElementId, parent: ElementId, slot: SlotId) -> Result<(), StoreError> {
        let index = self.require_movable(element)?;
        self.check_target(element, parent, slot)?;

        let old_parent = self.unlink(element);
        let evicted = match self.elements[parent.index as usize].slot_mut(slot) {
            Some(ChildSlot::List(children)) => {
                children.push(element);
                None
            }
            Some(ChildSlot::Single(occupant)) => occupant.replace(element),
            None => None,
        };
        if let Some(evicted) = evicted {
            let previous = self.elements[evicted.index as usize].parent;
            self.clear_position(evicted);
            self.note_moved(evicted, previous);
        }

        let e = &mut self.elements[index];
        e.parent = Some(Parent::Element(parent));
        e.flags.set_containing_slot(Some(slot));
        self.note_moved(element, old_parent);
        tracing::trace!(element = %element, parent = %parent, slot = %slot, "moved element");
        Ok(())
    }

    /// Makes `element` a top-level element of this database.
    pub fn move_to_root(&mut self, element: ElementId) -> Result<(), StoreError> {
        let index = self.require_movable(element)?;
        let old_parent = self.unlink(element);
        self.roots.push(element);
        self.elements[index].parent = Some(Parent::Database);
        self.note_moved(element, old_parent);
        tracing::trace!(element = %element, "moved element to root");
        Ok(())
    }

    /// Removes `element` from its parent. Its subtree stays intact.
    pub fn detach(&mut self, element: ElementId) -> Result<(), StoreError> {
        self.require_movable(element)?;
        let old_parent = self.unlink(element);
        if old_parent.is_some() {
            self.note_moved(element, old_parent);
            tracing::trace!(element = %element, "detached element");
        }
        Ok(())
    }

    /// Puts `new` at exactly the position of `old` and detaches `old`.
    pub fn replace(&mut self, old: ElementId, new: ElementId) -> Result<(), StoreError> {
        if old == new {
            return Ok(());
        }
        let old_index = self.require_movable(old)?;
        let new_index = self.require_movable(new)?;

        let parent = self.elements[old_index].parent.ok_or_else(|| StoreError::IllegalMove {
            element: old,
            reason: "element has no parent to be replaced in".to_string(),
        })?;
        let slot = self.elements[old_index].containing_slot();
        if let Parent::Element(p) = parent {
            if self.is_self_or_ancestor(new, p) {
                return Err(StoreError::IllegalMove {
                    element: new,
                    reason: format!("replacing {} would make it its own ancestor", old),
                });
            }
        }

        let new_old_parent = self.unlink(new);
        match parent {
            Parent::Database => {
                if let Some(root) = self.roots.iter_mut().find(|root| **root == old) {
                    *root = new;
                }
            }
            Parent::Element(p) => {
                if let Some(slot) = slot {
                    if let Some(children) = self.elements[p.index as usize].slot_mut(slot) {
                        children.substitute(old, new);
                    }
                }
            }
        }

        let n = &mut self.elements[new_index];
        n.parent = Some(parent);
        n.flags.set_containing_slot(slot);
        self.clear_position(old);

        self.note_moved(new, new_old_parent);
        self.note_moved(old, Some(parent));
        tracing::trace!(old = %old, new = %new, "replaced element");
        Ok(())
    }

    /// Requests (or withdraws) kind-index membership for `element`. The
    /// element enters the index once it is attached to this database.
    pub fn set_indexing(&mut self, element: ElementId, requested: bool) -> Result<(), StoreError> {
        let index = self.require_mutable(element)?;
        let e = &mut self.elements[index];
        e.flags.set(ElementFlags::INDEXING_REQUESTED, requested);
        let parent = e.parent;
        self.note_moved(element, parent);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Applies every pending movement: refreshes the cached containing
    /// database of each moved subtree and the kind-index membership of every
    /// element whose attachment changed. A no-op when nothing moved.
    pub fn realize_tree_movements(&mut self) -> Result<(), StoreError> {
        if self.moved_elements.is_empty() {
            return Ok(());
        }

        let batch = std::mem::take(&mut self.moved_elements);
        let mut changed = 0;
        for (element, old_parent) in &batch {
            self.elements[element.index as usize]
                .flags
                .remove(ElementFlags::IN_MOVED_BUFFER);
            let attached = self.resolve_attachment(*element);
            tracing::trace!(element = %element, ?old_parent, ?attached, "realizing movement");
            changed += self.propagate_attachment(*element, attached);
        }

        tracing::debug!(
            db = %self.id,
            name = %self.config.name,
            moved = batch.len(),
            changed,
            "realized tree movements"
        );

        if self.config.verify_on_realize {
            self.verify_consistency()?;
        }
        Ok(())
    }

    /// Containing database of `element` after reconciliation; `None` when
    /// the element is not attached to any database.
    pub fn containing_database(&mut self, element: ElementId) -> Result<Option<DatabaseId>, StoreError> {
        if element.db != self.id {
            return self.externals.owner_of(element, self.id)?.containing_database(element);
        }
        self.realize_tree_movements()?;
        Ok(self.element(element)?.attached_to)
    }

    /// Whether `ancestor` is reached by following the parent links of
    /// `descendant`. Always `false` across databases.
    pub fn is_ancestor_of(&mut self, ancestor: ElementId, descendant: ElementId) -> Result<bool, StoreError> {
        if ancestor.db != descendant.db {
            return Ok(false);
        }
        if ancestor.db != self.id {
            return self
                .externals
                .owner_of(ancestor, self.id)?
                .is_ancestor_of(ancestor, descendant);
        }
        self.realize_tree_movements()?;
        self.walk_is_ancestor(ancestor, descendant)
    }

    /// Every indexed element of `kind`, local only.
    ///
    /// The iterator is restartable by cloning it.
    pub fn get_elements_with_index(
        &mut self,
        kind: KindId,
    ) -> Result<impl Iterator<Item = ElementId> + Clone + '_, StoreError> {
        self.schema.require_class(kind)?;
        self.realize_tree_movements()?;
        Ok(self.kind_index.iter(kind))
    }

    /// Every indexed element of `kind`: local ones first, then those of the
    /// external modules in registration order.
    pub fn get_elements_with_index_including_external(
        &mut self,
        kind: KindId,
    ) -> Result<impl Iterator<Item = ElementId> + Clone + '_, StoreError> {
        self.schema.require_class(kind)?;
        self.realize_tree_movements()?;
        Ok(self
            .kind_index
            .iter(kind)
            .chain(self.externals.get_elements_with_index(kind)))
    }

    // -----------------------------------------------------------------------
    // Forward and back references
    // -----------------------------------------------------------------------

    /// Sets the forward pointer of `element` through `key`, returning the
    /// previous target. The back-reference on the new target is registered
    /// lazily, before the next back-reference query.
    pub fn set_reference(
        &mut self,
        element: ElementId,
        key: ReferenceKey,
        target: Option<ElementId>,
    ) -> Result<Option<ElementId>, StoreError> {
        let index = self.require_mutable(element)?;
        let field = key.field.0 as usize;
        let kind = self.elements[index].kind;
        if kind != key.kind || field >= self.elements[index].references.len() {
            return Err(self.unknown_reference_field(kind, key));
        }
        if let Some(target) = target {
            self.resolve(target)?;
        }

        let e = &mut self.elements[index];
        let previous = std::mem::replace(&mut e.references[field], target);
        if previous != target && e.flags.contains(ElementFlags::HAS_VALID_FORWARD_REFERENCES) {
            e.flags.remove(ElementFlags::HAS_VALID_FORWARD_REFERENCES);
            self.forward_reference_queue.push(element);
        }
        Ok(previous)
    }

    /// Records `referrer` as pointing at `target`.
    ///
    /// Registering twice is harmless. Nothing ever needs to un-register: a
    /// query drops referrers that no longer point back.
    pub fn register_back_reference(&mut self, target: ElementId, referrer: ElementId) -> Result<(), StoreError> {
        if referrer.db != self.id {
            return Err(StoreError::IllegalMutation {
                element: referrer,
                reason: "back-references can only be registered from local elements".to_string(),
            });
        }
        self.local_index(referrer)?;
        if target.db != self.id {
            self.resolve(target)?;
        } else {
            self.local_index(target)?;
        }
        self.record_back_reference(target, referrer);
        Ok(())
    }

    /// Removes `referrer` from the back-references of `target` by swapping the
    /// last registered referrer into its place.
    pub fn remove_back_reference(&mut self, target: ElementId, referrer: ElementId) -> Result<bool, StoreError> {
        if target.db == self.id {
            let index = self.local_index(target)?;
            Ok(self.elements[index].back_references.remove(referrer))
        } else {
            let Some(refs) = self.foreign_back_references.get_mut(&target) else {
                return Ok(false);
            };
            let removed = refs.remove(referrer);
            if refs.is_empty() {
                self.foreign_back_references.remove(&target);
            }
            Ok(removed)
        }
    }

    /// Registered referrers of `target` whose forward pointer, read through
    /// `key`, still resolves to `target` and which are still attached to a
    /// database.
    pub fn get_back_references<K: BackReferenceKey + ?Sized>(
        &mut self,
        target: ElementId,
        key: &K,
    ) -> Result<Vec<ElementId>, StoreError> {
        self.realize_tree_movements()?;
        self.index_forward_references();
        self.collect_back_references(target, key)
    }

    // -----------------------------------------------------------------------
    // Dynamic properties
    // -----------------------------------------------------------------------

    /// Reads a dynamic property. Stale temporary entries met on the way are
    /// compacted out of the element's map.
    pub fn get_property<T: PropertyValue>(
        &mut self,
        element: ElementId,
        token: &impl PropertyToken<T>,
    ) -> Result<Option<&T>, StoreError> {
        token.require_valid()?;
        if element.db != self.id {
            return self.peek_property(element, token);
        }
        let index = self.local_index(element)?;
        Ok(self.elements[index].properties.get(token))
    }

    /// Reads a dynamic property without compacting anything.
    pub fn peek_property<T: PropertyValue>(
        &self,
        element: ElementId,
        token: &impl PropertyToken<T>,
    ) -> Result<Option<&T>, StoreError> {
        token.require_valid()?;
        Ok(self.resolve(element)?.properties.peek(token))
    }

    /// Stores `value`, or removes the property for `None`. Returns the
    /// previous value.
    pub fn set_property<T: PropertyValue>(
        &mut self,
        element: ElementId,
        token: &impl PropertyToken<T>,
        value: Option<T>,
    ) -> Result<Option<T>, StoreError> {
        token.require_valid()?;
        let index = self.require_mutable(element)?;
        Ok(self.elements[index].properties.set(token, value))
    }

    /// Returns the property, computing and storing it first when absent.
    pub fn get_or_compute_property<T: PropertyValue>(
        &mut self,
        element: ElementId,
        token: &impl PropertyToken<T>,
        compute: impl FnOnce() -> T,
    ) -> Result<&T, StoreError> {
        token.require_valid()?;
        if element.db != self.id {
            return match self.peek_property(element, token)? {
                Some(value) => Ok(value),
                None => Err(StoreError::IllegalMutation {
                    element,
                    reason: format!("cannot compute property '{}' on an external element", token.name()),
                }),
            };
        }
        let index = self.local_index(element)?;
        self.elements[index].properties.get_or_insert_with(token, compute)
    }

    /// Number of property entries stored on `element`, stale ones included
    /// until a read compacts them.
    pub fn property_count(&self, element: ElementId) -> Result<usize, StoreError> {
        Ok(self.resolve(element)?.properties.len())
    }

    /// Replaces every dynamic property of `to` with a copy of the live
    /// properties of `from`. `from` may belong to an external database.
    pub fn copy_properties(&mut self, from: ElementId, to: ElementId) -> Result<(), StoreError> {
        let index = self.require_mutable(to)?;
        let copied = self.resolve(from)?.properties.copy_live();
        self.elements[index].properties = copied;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // External modules and freezing
    // -----------------------------------------------------------------------

    pub fn register_external_module(&mut self, module: ExternalDatabase) -> Result<(), StoreError> {
        self.externals.register(module)
    }

    /// Reconciles everything one last time and turns this database into a
    /// read-only external database.
    pub fn freeze(mut self) -> Result<ExternalDatabase, StoreError> {
        self.realize_tree_movements()?;
        self.index_forward_references();
        tracing::debug!(
            db = %self.id,
            name = %self.config.name,
            elements = self.elements.len(),
            indexed = self.kind_index.len(),
            "froze database"
        );
        Ok(ExternalDatabase::new(self))
    }

    // -----------------------------------------------------------------------
    // Consistency verification
    // -----------------------------------------------------------------------

    /// Checks the store invariants:
    ///
    /// - every parented element sits in exactly the child slot it records,
    ///   and every child names its holder as parent;
    /// - the kind index holds exactly the elements flagged as indexed;
    /// - the parent links form a forest;
    /// - with no movements pending, every cached containing database and
    ///   index membership matches the tree.
    pub fn verify_consistency(&self) -> Result<(), StoreError> {
        let mut tree = DiGraphMap::<ElementId, ()>::new();

        for (index, element) in self.elements.iter().enumerate() {
            let id = ElementId::new(self.id, index);
            tree.add_node(id);
            match element.parent {
                Some(Parent::Element(parent)) => {
                    let slot = element.containing_slot().ok_or_else(|| inconsistency(format!(
                        "{} has parent {} but no containing slot",
                        id, parent
                    )))?;
                    let holder = self.element(parent)?;
                    let list = holder.slot(slot).ok_or(StoreError::UnknownChildSlot {
                        parent,
                        kind: holder.kind,
                        slot: slot.get(),
                    })?;
                    let occurrences = list.elements().iter().filter(|c| **c == id).count();
                    if occurrences != 1 {
                        return Err(inconsistency(format!(
                            "{} appears {} times in slot {} of its parent {}",
                            id, occurrences, slot, parent
                        )));
                    }
                    tree.add_edge(parent, id, ());
                }
                Some(Parent::Database) => {
                    if self.roots.iter().filter(|r| **r == id).count() != 1 {
                        return Err(inconsistency(format!("{} is not a root exactly once", id)));
                    }
                }
                None => {
                    if element.containing_slot().is_some() {
                        return Err(inconsistency(format!("detached {} records a containing slot", id)));
                    }
                }
            }

            for child in element.child_ids() {
                let c = self.element(child)?;
                if c.parent != Some(Parent::Element(id)) {
                    return Err(inconsistency(format!("{} holds {} which names another parent", id, child)));
                }
            }

            let flagged = element.flags.contains(ElementFlags::IN_KIND_INDEX);
            if flagged != self.kind_index.contains(element.kind, id) {
                return Err(inconsistency(format!("index membership of {} disagrees with its flag", id)));
            }
        }

        for root in &self.roots {
            if self.element(*root)?.parent != Some(Parent::Database) {
                return Err(inconsistency(format!("root {} names another parent", root)));
            }
        }

        for (kind, id) in self.kind_index.entries() {
            let element = self.element(id)?;
            if element.kind != kind || !element.flags.contains(ElementFlags::IN_KIND_INDEX) {
                return Err(inconsistency(format!("kind index entry {} is not flagged as indexed", id)));
            }
        }

        if is_cyclic_directed(&tree) {
            return Err(inconsistency("parent links contain a cycle".to_string()));
        }

        if self.moved_elements.is_empty() {
            for (index, element) in self.elements.iter().enumerate() {
                let id = ElementId::new(self.id, index);
                if element.attached_to != self.resolve_attachment(id) {
                    return Err(inconsistency(format!("{} has a stale containing database", id)));
                }
                let wanted = element.flags.contains(ElementFlags::INDEXING_REQUESTED)
                    && element.is_attached_to(self.id);
                if wanted != element.flags.contains(ElementFlags::IN_KIND_INDEX) {
                    return Err(inconsistency(format!("{} is not indexed as requested", id)));
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn local_index(&self, id: ElementId) -> Result<usize, StoreError> {
        if id.db != self.id {
            return Err(StoreError::ForeignElement {
                element: id,
                owner: id.db,
                queried: self.id,
            });
        }
        let index = id.index as usize;
        if index < self.elements.len() {
            Ok(index)
        } else {
            Err(StoreError::ElementNotFound { element: id })
        }
    }

    fn require_movable(&self, element: ElementId) -> Result<usize, StoreError> {
        if element.db != self.id {
            return Err(StoreError::IllegalMove {
                element,
                reason: format!("element belongs to external database {}", element.db),
            });
        }
        let index = self.local_index(element)?;
        if self.elements[index].anchored {
            return Err(StoreError::IllegalMove {
                element,
                reason: "element is anchored to the parent it was loaded with".to_string(),
            });
        }
        Ok(index)
    }

    fn require_mutable(&self, element: ElementId) -> Result<usize, StoreError> {
        if element.db != self.id {
            return Err(StoreError::IllegalMutation {
                element,
                reason: format!("element belongs to external database {}", element.db),
            });
        }
        self.local_index(element)
    }

    /// Validates that `element` may be placed into `slot` of `parent`.
    fn check_target(&self, element: ElementId, parent: ElementId, slot: SlotId) -> Result<(), StoreError> {
        if parent.db != self.id {
            return Err(StoreError::IllegalMove {
                element,
                reason: format!("cannot attach under {} of another database", parent),
            });
        }
        let holder = self.element(parent)?;
        let class = self.schema.require_class(holder.kind)?;
        let Some(children) = holder.slot(slot) else {
            return Err(StoreError::IllegalMove {
                element,
                reason: format!("class '{}' does not define child slot {}", class.name(), slot),
            });
        };
        if let ChildSlot::Single(Some(occupant)) = children {
            if *occupant != element && self.elements[occupant.index as usize].anchored {
                return Err(StoreError::IllegalMove {
                    element,
                    reason: format!("slot {} of {} holds anchored element {}", slot, parent, occupant),
                });
            }
        }
        if self.is_self_or_ancestor(element, parent) {
            return Err(StoreError::IllegalMove {
                element,
                reason: format!("moving under {} would create a cycle", parent),
            });
        }
        Ok(())
    }

    /// Whether `candidate` is `element` or one of its raw ancestors.
    fn is_self_or_ancestor(&self, candidate: ElementId, element: ElementId) -> bool {
        let mut current = Some(element);
        while let Some(id) = current {
            if id == candidate {
                return true;
            }
            current = self
                .elements
                .get(id.index as usize)
                .and_then(|e| e.parent)
                .and_then(Parent::element);
        }
        false
    }

    /// Removes `element` from its holder's child slot or the root list and
    /// returns the parent it had.
    fn unlink(&mut self, element: ElementId) -> Option<Parent> {
        let index = element.index as usize;
        let old_parent = self.elements[index].parent;
        let slot = self.elements[index].containing_slot();
        match (old_parent, slot) {
            (Some(Parent::Database), _) => self.roots.retain(|root| *root != element),
            (Some(Parent::Element(parent)), Some(slot)) => {
                if let Some(children) = self.elements[parent.index as usize].slot_mut(slot) {
                    children.remove(element);
                }
            }
            _ => {}
        }
        self.clear_position(element);
        old_parent
    }

    fn clear_position(&mut self, element: ElementId) {
        let e = &mut self.elements[element.index as usize];
        e.parent = None;
        e.flags.set_containing_slot(None);
    }

    fn note_moved(&mut self, element: ElementId, old_parent: Option<Parent>) {
        let flags = &mut self.elements[element.index as usize].flags;
        if !flags.contains(ElementFlags::IN_MOVED_BUFFER) {
            flags.insert(ElementFlags::IN_MOVED_BUFFER);
            self.moved_elements.push((element, old_parent));
        }
    }

    /// Follows raw parent links up to the database root.
    fn resolve_attachment(&self, element: ElementId) -> Option<DatabaseId> {
        let mut current = element;
        loop {
            match self.elements.get(current.index as usize)?.parent? {
                Parent::Database => return Some(self.id),
                Parent::Element(parent) => current = parent,
            }
        }
    }

    /// Pushes `attached` down the subtree of `root` in document pre-order,
    /// stopping at elements that already carry it, so newly indexed
    /// elements enter the kind index in tree order. Returns the number of
    /// elements updated.
    fn propagate_attachment(&mut self, root: ElementId, attached: Option<DatabaseId>) -> usize {
        let mut updated = 0;
        let mut stack: SmallVec<[ElementId; 16]> = SmallVec::new();
        stack.push(root);
        while let Some(id) = stack.pop() {
            let Some(element) = self.elements.get_mut(id.index as usize) else {
                continue;
            };
            let changed = element.attached_to != attached;
            if !changed && id != root {
                continue;
            }
            if changed {
                element.attached_to = attached;
                updated += 1;
            }
            let children: SmallVec<[ElementId; 8]> = element.child_ids().collect();
            stack.extend(children.into_iter().rev());
            self.sync_index_membership(id);
        }
        updated
    }

    fn sync_index_membership(&mut self, id: ElementId) {
        let element = &mut self.elements[id.index as usize];
        let wanted = element.flags.contains(ElementFlags::INDEXING_REQUESTED) && element.attached_to == Some(self.id);
        let present = element.flags.contains(ElementFlags::IN_KIND_INDEX);
        if wanted && !present {
            self.kind_index.insert(element.kind, id);
            element.flags.insert(ElementFlags::IN_KIND_INDEX);
        } else if !wanted && present {
            self.kind_index.remove(element.kind, id);
            element.flags.remove(ElementFlags::IN_KIND_INDEX);
        }
    }

    /// Registers pending forward references as back-references on their
    /// targets.
    fn index_forward_references(&mut self) {
        if self.forward_reference_queue.is_empty() {
            return;
        }
        let queue = std::mem::take(&mut self.forward_reference_queue);
        let mut registered = 0;
        for element in queue {
            let Some(e) = self.elements.get_mut(element.index as usize) else {
                continue;
            };
            if e.flags.contains(ElementFlags::HAS_VALID_FORWARD_REFERENCES) {
                continue;
            }
            e.flags.insert(ElementFlags::HAS_VALID_FORWARD_REFERENCES);
            let targets: SmallVec<[ElementId; 2]> = e.forward_references().collect();
            for target in targets {
                self.record_back_reference(target, element);
                registered += 1;
            }
        }
        tracing::trace!(db = %self.id, registered, "indexed forward references");
    }

    fn record_back_reference(&mut self, target: ElementId, referrer: ElementId) {
        let referrer_index = referrer.index as usize;
        let maybe_present = self.elements[referrer_index]
            .flags
            .contains(ElementFlags::REGISTERED_AS_BACK_REFERENCE);
        let storage = if target.db == self.id {
            match self.elements.get_mut(target.index as usize) {
                Some(t) => &mut t.back_references,
                None => return,
            }
        } else {
            self.foreign_back_references.entry(target).or_default()
        };
        storage.register(referrer, maybe_present);
        self.elements[referrer_index]
            .flags
            .insert(ElementFlags::REGISTERED_AS_BACK_REFERENCE);
    }

    /// Back-reference query over already reconciled state.
    pub(crate) fn collect_back_references<K: BackReferenceKey + ?Sized>(
        &self,
        target: ElementId,
        key: &K,
    ) -> Result<Vec<ElementId>, StoreError> {
        let mut results = Vec::new();
        if target.db == self.id {
            let element = self.element(target)?;
            if !element.is_attached_to(self.id) {
                return Err(StoreError::DetachedElement { element: target });
            }
            self.retain_live_referrers(target, element.back_references.iter(), key, &mut results);
        } else {
            let owner = self.externals.owner_of(target, self.id)?;
            results.extend(owner.get_back_references(target, key)?);
            if let Some(local) = self.foreign_back_references.get(&target) {
                self.retain_live_referrers(target, local.iter(), key, &mut results);
            }
        }
        Ok(results)
    }

    fn retain_live_referrers<K: BackReferenceKey + ?Sized>(
        &self,
        target: ElementId,
        candidates: impl Iterator<Item = ElementId>,
        key: &K,
        results: &mut Vec<ElementId>,
    ) {
        for referrer in candidates {
            let Ok(element) = self.element(referrer) else {
                continue;
            };
            let live = element.flags.contains(ElementFlags::REGISTERED_AS_BACK_REFERENCE)
                && key.forward_reference(self, referrer) == Some(target)
                && element.is_attached_to(self.id);
            if live {
                results.push(referrer);
            }
        }
    }

    pub(crate) fn walk_is_ancestor(&self, ancestor: ElementId, descendant: ElementId) -> Result<bool, StoreError> {
        let a = self.element(ancestor)?;
        let d = self.element(descendant)?;
        if a.attached_to != d.attached_to {
            return Ok(false);
        }
        let mut current = d.parent;
        while let Some(Parent::Element(parent)) = current {
            if parent == ancestor {
                return Ok(true);
            }
            current = self.element(parent)?.parent;
        }
        Ok(false)
    }

    pub(crate) fn indexed_elements(&self, kind: KindId) -> impl Iterator<Item = ElementId> + Clone + '_ {
        self.kind_index.iter(kind)
    }

    fn unknown_reference_field(&self, kind: KindId, key: ReferenceKey) -> StoreError {
        let class = self
            .schema
            .class(kind)
            .map_or_else(|| kind.to_string(), |c| c.name().to_string());
        let field = self
            .schema
            .class(key.kind)
            .and_then(|c| c.reference_fields().get(key.field.0 as usize))
            .cloned()
            .unwrap_or_else(|| format!("#{}", key.field.0));
        StoreError::UnknownReferenceField { class, field }
    }
}

fn inconsistency(reason: String) -> StoreError {
    StoreError::Inconsistency { reason }
}
