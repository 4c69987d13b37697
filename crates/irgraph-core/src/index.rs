//! Per-kind element index of one database.

use indexmap::{IndexMap, IndexSet};

use crate::id::{ElementId, KindId};

/// "All indexed elements of kind K", in indexing order.
#[derive(Debug, Default, Clone)]
pub(crate) struct KindIndex {
    buckets: IndexMap<KindId, IndexSet<ElementId>>,
}

impl KindIndex {
    pub(crate) fn insert(&mut self, kind: KindId, element: ElementId) -> bool {
        self.buckets.entry(kind).or_default().insert(element)
    }

    /// Keeps the remaining elements in indexing order, at linear cost.
    pub(crate) fn remove(&mut self, kind: KindId, element: ElementId) -> bool {
        self.buckets
            .get_mut(&kind)
            .is_some_and(|bucket| bucket.shift_remove(&element))
    }

    pub(crate) fn contains(&self, kind: KindId, element: ElementId) -> bool {
        self.buckets
            .get(&kind)
            .is_some_and(|bucket| bucket.contains(&element))
    }

    /// Restartable: cloning the iterator starts a second pass.
    pub(crate) fn iter(&self, kind: KindId) -> impl Iterator<Item = ElementId> + Clone + '_ {
        self.buckets
            .get(&kind)
            .into_iter()
            .flat_map(|bucket| bucket.iter().copied())
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.values().map(IndexSet::len).sum()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (KindId, ElementId)> + '_ {
        self.buckets
            .iter()
            .flat_map(|(kind, bucket)| bucket.iter().map(move |element| (*kind, *element)))
    }
}
