//! Dynamic properties: typed, identity-keyed extension slots on elements.
//!
//! A [`DynamicPropertyKey<T>`] is a process-wide unique identity carrying the
//! value type `T`, so two passes can never collide even when they pick the
//! same display name. A [`TemporaryToken<T>`] binds a key to a
//! [`PhaseLifetime`]; once the phase ends the token is invalid, its stored
//! entries read as absent and are compacted out of the element's map the
//! next time a scan passes over them.
//!
//! # Storage
//!
//! [`PropertyMap`] is a flat list of (key, value) entries scanned linearly.
//! Elements carry 0-3 properties in practice, which makes a per-element hash
//! map a poor trade. The first allocation holds two entries and capacity
//! doubles when full.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::StoreError;

static NEXT_PROPERTY_KEY: AtomicU32 = AtomicU32::new(0);

/// Untyped identity of a dynamic property key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyKeyId(u32);

/// A permanent dynamic property key for values of type `T`.
pub struct DynamicPropertyKey<T> {
    id: PropertyKeyId,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DynamicPropertyKey<T> {
    /// Allocates a new key. Every call yields a distinct identity.
    pub fn new(name: &'static str) -> Self {
        DynamicPropertyKey {
            id: PropertyKeyId(NEXT_PROPERTY_KEY.fetch_add(1, Ordering::Relaxed)),
            name,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> PropertyKeyId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for DynamicPropertyKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DynamicPropertyKey<T> {}

impl<T> fmt::Debug for DynamicPropertyKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicPropertyKey")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug)]
struct LifetimeState {
    phase: String,
    valid: AtomicBool,
}

/// Validity of temporary tokens acquired during one phase execution.
///
/// Cloning shares the same state: ending any clone ends them all.
#[derive(Debug, Clone)]
pub struct PhaseLifetime {
    state: Arc<LifetimeState>,
}

impl PhaseLifetime {
    pub fn begin(phase: impl Into<String>) -> Self {
        PhaseLifetime {
            state: Arc::new(LifetimeState {
                phase: phase.into(),
                valid: AtomicBool::new(true),
            }),
        }
    }

    pub fn phase(&self) -> &str {
        &self.state.phase
    }

    pub fn is_valid(&self) -> bool {
        self.state.valid.load(Ordering::Acquire)
    }

    /// Invalidates every token acquired from this lifetime.
    pub fn end(&self) {
        self.state.valid.store(false, Ordering::Release);
    }

    /// Binds `key` to this lifetime.
    pub fn token<T>(&self, key: &DynamicPropertyKey<T>) -> TemporaryToken<T> {
        TemporaryToken {
            key: key.id,
            name: key.name,
            lifetime: self.clone(),
            _marker: PhantomData,
        }
    }

    fn same_as(&self, other: &PhaseLifetime) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// A dynamic property key scoped to one phase execution.
pub struct TemporaryToken<T> {
    key: PropertyKeyId,
    name: &'static str,
    lifetime: PhaseLifetime,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TemporaryToken<T> {
    pub fn is_valid(&self) -> bool {
        self.lifetime.is_valid()
    }
}

impl<T> Clone for TemporaryToken<T> {
    fn clone(&self) -> Self {
        TemporaryToken {
            key: self.key,
            name: self.name,
            lifetime: self.lifetime.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TemporaryToken<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryToken")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("phase", &self.lifetime.phase())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Access token for dynamic properties holding values of type `T`.
pub trait PropertyToken<T> {
    fn key(&self) -> PropertyKeyId;

    fn name(&self) -> &'static str;

    /// The lifetime the token is scoped to; `None` for permanent keys.
    fn lifetime(&self) -> Option<&PhaseLifetime>;

    fn require_valid(&self) -> Result<(), StoreError> {
        match self.lifetime() {
            Some(lifetime) if !lifetime.is_valid() => Err(StoreError::InvalidToken {
                phase: lifetime.phase().to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl<T> PropertyToken<T> for DynamicPropertyKey<T> {
    fn key(&self) -> PropertyKeyId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn lifetime(&self) -> Option<&PhaseLifetime> {
        None
    }
}

impl<T> PropertyToken<T> for TemporaryToken<T> {
    fn key(&self) -> PropertyKeyId {
        self.key
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn lifetime(&self) -> Option<&PhaseLifetime> {
        Some(&self.lifetime)
    }
}

/// Bound for values stored as dynamic properties. `Clone` lets an element's
/// properties be copied onto another element.
pub trait PropertyValue: Any + Clone + Send + Sync {}

impl<T: Any + Clone + Send + Sync> PropertyValue for T {}

/// Type-erased stored value.
trait StoredValue: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    fn clone_boxed(&self) -> Box<dyn StoredValue>;
}

impl<T: PropertyValue> StoredValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn clone_boxed(&self) -> Box<dyn StoredValue> {
        Box::new(self.clone())
    }
}

struct PropertyEntry {
    key: PropertyKeyId,
    lifetime: Option<PhaseLifetime>,
    value: Box<dyn StoredValue>,
}

impl PropertyEntry {
    fn value<T: PropertyValue>(&self) -> Option<&T> {
        (*self.value).as_any().downcast_ref::<T>()
    }

    fn duplicate(&self) -> PropertyEntry {
        PropertyEntry {
            key: self.key,
            lifetime: self.lifetime.clone(),
            value: self.value.clone_boxed(),
        }
    }

    fn is_stale(&self) -> bool {
        self.lifetime.as_ref().is_some_and(|lifetime| !lifetime.is_valid())
    }

    fn matches(&self, key: PropertyKeyId, lifetime: Option<&PhaseLifetime>) -> bool {
        self.key == key
            && match (&self.lifetime, lifetime) {
                (None, None) => true,
                (Some(a), Some(b)) => a.same_as(b),
                _ => false,
            }
    }
}

/// Per-element property storage.
#[derive(Default)]
pub(crate) struct PropertyMap {
    entries: Option<Vec<PropertyEntry>>,
}

impl PropertyMap {
    const INITIAL_CAPACITY: usize = 2;

    /// Returns the entry index for the token, pruning stale temporary entries
    /// encountered on the way.
    fn find<T>(entries: &mut Vec<PropertyEntry>, token: &impl PropertyToken<T>) -> Option<usize> {
        let key = token.key();
        let lifetime = token.lifetime();
        let mut pruned = false;
        let mut i = 0;
        while i < entries.len() {
            if entries[i].matches(key, lifetime) {
                return Some(i);
            }
            if !pruned && entries[i].is_stale() {
                // Every stale entry from here on goes in one compaction pass;
                // entries before `i` were already checked.
                pruned = true;
                entries.retain(|entry| !entry.is_stale());
                continue;
            }
            i += 1;
        }
        None
    }

    fn push(&mut self, entry: PropertyEntry) -> &mut PropertyEntry {
        let entries = self
            .entries
            .get_or_insert_with(|| Vec::with_capacity(Self::INITIAL_CAPACITY));
        if entries.len() == entries.capacity() {
            entries.reserve_exact(entries.capacity().max(Self::INITIAL_CAPACITY));
        }
        entries.push(entry);
        let last = entries.len() - 1;
        &mut entries[last]
    }

    pub(crate) fn get<T: PropertyValue>(&mut self, token: &impl PropertyToken<T>) -> Option<&T> {
        let entries = self.entries.as_mut()?;
        let index = Self::find::<T>(entries, token)?;
        entries[index].value()
    }

    /// Read-only lookup: skips stale entries without compacting them.
    pub(crate) fn peek<T: PropertyValue>(&self, token: &impl PropertyToken<T>) -> Option<&T> {
        let key = token.key();
        let lifetime = token.lifetime();
        self.entries
            .as_ref()?
            .iter()
            .find(|entry| !entry.is_stale() && entry.matches(key, lifetime))
            .and_then(PropertyEntry::value::<T>)
    }

    /// Stores `value` (or removes the entry for `None`), returning the
    /// previous value.
    pub(crate) fn set<T: PropertyValue>(
        &mut self,
        token: &impl PropertyToken<T>,
        value: Option<T>,
    ) -> Option<T> {
        let found = match self.entries.as_mut() {
            Some(entries) => Self::find::<T>(entries, token),
            // A later read of an absent map yields None anyway.
            None if value.is_none() => return None,
            None => None,
        };

        match (found, value) {
            (Some(index), Some(value)) => {
                let entries = self.entries.as_mut()?;
                let previous = std::mem::replace(&mut entries[index].value, Box::new(value));
                previous.into_any().downcast::<T>().ok().map(|boxed| *boxed)
            }
            (Some(index), None) => {
                let entries = self.entries.as_mut()?;
                let removed = entries.remove(index);
                removed.value.into_any().downcast::<T>().ok().map(|boxed| *boxed)
            }
            (None, Some(value)) => {
                self.push(PropertyEntry {
                    key: token.key(),
                    lifetime: token.lifetime().cloned(),
                    value: Box::new(value),
                });
                None
            }
            (None, None) => None,
        }
    }

    /// Returns the stored value, computing and storing it first if absent.
    /// `compute` runs at most once.
    pub(crate) fn get_or_insert_with<T: PropertyValue>(
        &mut self,
        token: &impl PropertyToken<T>,
        compute: impl FnOnce() -> T,
    ) -> Result<&T, StoreError> {
        let found = self
            .entries
            .as_mut()
            .and_then(|entries| Self::find::<T>(entries, token));
        if found.is_none() {
            self.push(PropertyEntry {
                key: token.key(),
                lifetime: token.lifetime().cloned(),
                value: Box::new(compute()),
            });
        }

        self.entries
            .as_ref()
            .and_then(|entries| match found {
                Some(index) => entries.get(index),
                None => entries.last(),
            })
            .and_then(PropertyEntry::value::<T>)
            .ok_or_else(|| StoreError::PropertyTypeMismatch {
                key: token.name().to_string(),
            })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, Vec::len)
    }

    /// A copy holding every live entry. Stale temporary entries are left
    /// behind.
    pub(crate) fn copy_live(&self) -> PropertyMap {
        let entries: Vec<_> = self
            .entries
            .iter()
            .flatten()
            .filter(|entry| !entry.is_stale())
            .map(PropertyEntry::duplicate)
            .collect();
        PropertyMap {
            entries: (!entries.is_empty()).then_some(entries),
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.entries.as_ref().map_or(0, Vec::capacity)
    }
}

impl fmt::Debug for PropertyMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<_> = self
            .entries
            .iter()
            .flatten()
            .map(|entry| (entry.key, entry.is_stale()))
            .collect();
        f.debug_struct("PropertyMap").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique_even_with_equal_names() {
        let a = DynamicPropertyKey::<u32>::new("visited");
        let b = DynamicPropertyKey::<u32>::new("visited");
        assert_ne!(a.id(), b.id());

        let mut map = PropertyMap::default();
        map.set(&a, Some(1));
        assert_eq!(map.get(&b), None);
        assert_eq!(map.get(&a), Some(&1));
    }

    #[test]
    fn set_get_and_remove() {
        let key = DynamicPropertyKey::<String>::new("label");
        let mut map = PropertyMap::default();

        assert_eq!(map.set(&key, Some("a".to_string())), None);
        assert_eq!(map.get(&key).map(String::as_str), Some("a"));
        assert_eq!(map.set(&key, Some("b".to_string())), Some("a".to_string()));
        assert_eq!(map.set(&key, None), Some("b".to_string()));
        assert_eq!(map.get(&key), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn setting_absent_on_empty_map_allocates_nothing() {
        let key = DynamicPropertyKey::<u8>::new("k");
        let mut map = PropertyMap::default();
        map.set(&key, None);
        assert_eq!(map.capacity(), 0);
    }

    #[test]
    fn capacity_starts_at_two_and_doubles() {
        let keys: Vec<_> = (0..5).map(|_| DynamicPropertyKey::<usize>::new("k")).collect();
        let mut map = PropertyMap::default();

        map.set(&keys[0], Some(0));
        assert!(map.capacity() >= 2);
        let initial = map.capacity();
        map.set(&keys[1], Some(1));
        assert_eq!(map.capacity(), initial);
        map.set(&keys[2], Some(2));
        assert!(map.capacity() >= initial * 2);

        for (i, key) in keys.iter().enumerate().skip(3) {
            map.set(key, Some(i));
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(map.get(key), Some(&i));
        }
    }

    #[test]
    fn ended_phase_token_is_rejected() {
        let key = DynamicPropertyKey::<u32>::new("k");
        let lifetime = PhaseLifetime::begin("inline");
        let token = lifetime.token(&key);
        assert!(token.require_valid().is_ok());

        lifetime.end();
        match token.require_valid() {
            Err(StoreError::InvalidToken { phase }) => assert_eq!(phase, "inline"),
            other => panic!("expected InvalidToken, got {:?}", other),
        }
    }

    #[test]
    fn stale_entries_are_pruned_by_a_read() {
        let key = DynamicPropertyKey::<u32>::new("k");
        let other = DynamicPropertyKey::<u32>::new("other");
        let p1 = PhaseLifetime::begin("p1");
        let p2 = PhaseLifetime::begin("p2");

        let mut map = PropertyMap::default();
        map.set(&p1.token(&key), Some(1));
        map.set(&p2.token(&key), Some(2));
        map.set(&other, Some(3));
        assert_eq!(map.len(), 3);

        p1.end();
        assert_eq!(map.get(&other), Some(&3));
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&p2.token(&key)), Some(&2));
    }

    #[test]
    fn fresh_lifetime_does_not_observe_previous_phase_value() {
        let key = DynamicPropertyKey::<u32>::new("k");
        let p1 = PhaseLifetime::begin("p");
        let mut map = PropertyMap::default();
        map.set(&p1.token(&key), Some(7));
        p1.end();

        let p2 = PhaseLifetime::begin("p");
        let fresh = p2.token(&key);
        assert_eq!(map.peek(&fresh), None);
        assert_eq!(map.get(&fresh), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn peek_skips_stale_without_compacting() {
        let key = DynamicPropertyKey::<u32>::new("k");
        let stable = DynamicPropertyKey::<u32>::new("stable");
        let p = PhaseLifetime::begin("p");
        let mut map = PropertyMap::default();
        map.set(&p.token(&key), Some(1));
        map.set(&stable, Some(2));
        p.end();

        assert_eq!(map.peek(&stable), Some(&2));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn get_or_insert_with_computes_once() {
        let key = DynamicPropertyKey::<Vec<u32>>::new("k");
        let mut map = PropertyMap::default();
        let mut calls = 0;

        let value = map
            .get_or_insert_with(&key, || {
                calls += 1;
                vec![1, 2]
            })
            .unwrap()
            .clone();
        assert_eq!(value, vec![1, 2]);

        let again = map
            .get_or_insert_with(&key, || {
                calls += 1;
                vec![9]
            })
            .unwrap();
        assert_eq!(again, &vec![1, 2]);
        assert_eq!(calls, 1);
    }

    #[test]
    fn permanent_and_temporary_entries_with_same_key_are_distinct() {
        let key = DynamicPropertyKey::<u32>::new("k");
        let p = PhaseLifetime::begin("p");
        let mut map = PropertyMap::default();

        map.set(&key, Some(1));
        map.set(&p.token(&key), Some(2));
        assert_eq!(map.get(&key), Some(&1));
        assert_eq!(map.get(&p.token(&key)), Some(&2));
    }
}
