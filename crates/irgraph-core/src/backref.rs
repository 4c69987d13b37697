//! Back-reference storage and relationship keys.
//!
//! Each element keeps the set of elements that have been registered as
//! pointing at it. Registration is append-only: nothing un-registers an
//! element when its forward pointer changes. Instead a query re-reads the
//! forward pointer of every candidate through a [`BackReferenceKey`] and
//! drops the ones that no longer point back.
//!
//! Storage is adaptive: empty, a single referrer, or a slot array that grows
//! 2, 3, 4, 6, 9, 13, ... Filled slots are always a prefix of the array.

use crate::database::Database;
use crate::id::ElementId;
use crate::schema::ReferenceKey;

/// Reads a relationship's forward pointer off a candidate referrer.
pub trait BackReferenceKey {
    /// The element `referrer` currently points at through this relationship.
    fn forward_reference(&self, db: &Database, referrer: ElementId) -> Option<ElementId>;
}

impl<F> BackReferenceKey for F
where
    F: Fn(&Database, ElementId) -> Option<ElementId>,
{
    fn forward_reference(&self, db: &Database, referrer: ElementId) -> Option<ElementId> {
        self(db, referrer)
    }
}

impl BackReferenceKey for ReferenceKey {
    fn forward_reference(&self, db: &Database, referrer: ElementId) -> Option<ElementId> {
        db.reference(referrer, *self)
    }
}

/// Fixed-point fraction of filled slots, in 255ths.
///
/// Always rounds down, so `lower_bound` never overshoots the real count and
/// a forward scan from it finds the first free slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FillEstimate(u8);

impl FillEstimate {
    const SCALE: usize = u8::MAX as usize;

    pub(crate) fn new(filled: usize, capacity: usize) -> Self {
        if capacity == 0 {
            return FillEstimate(0);
        }
        FillEstimate((filled.min(capacity) * Self::SCALE / capacity) as u8)
    }

    pub(crate) fn lower_bound(self, capacity: usize) -> usize {
        self.0 as usize * capacity / Self::SCALE
    }
}

#[derive(Debug, Default)]
pub(crate) enum BackReferences {
    #[default]
    Empty,
    Single(ElementId),
    Many {
        slots: Box<[Option<ElementId>]>,
        fill: FillEstimate,
    },
}

impl BackReferences {
    const FIRST_ARRAY_CAPACITY: usize = 2;

    /// Adds `referrer` unless it is already present.
    ///
    /// `maybe_present` is false when the referrer has never been registered
    /// anywhere, which lets the array case skip the duplicate scan.
    pub(crate) fn register(&mut self, referrer: ElementId, maybe_present: bool) -> bool {
        match self {
            BackReferences::Empty => {
                *self = BackReferences::Single(referrer);
                true
            }
            BackReferences::Single(existing) => {
                if *existing == referrer {
                    return false;
                }
                let mut slots = vec![None; Self::FIRST_ARRAY_CAPACITY].into_boxed_slice();
                slots[0] = Some(*existing);
                slots[1] = Some(referrer);
                *self = BackReferences::Many {
                    fill: FillEstimate::new(2, slots.len()),
                    slots,
                };
                true
            }
            BackReferences::Many { slots, fill } => {
                let count = if maybe_present {
                    match Self::scan_for(slots, referrer) {
                        Ok(_) => return false,
                        Err(count) => count,
                    }
                } else {
                    Self::count(slots, *fill)
                };

                if count == slots.len() {
                    let grown = slots.len() * 3 / 2;
                    let mut bigger = vec![None; grown].into_boxed_slice();
                    bigger[..slots.len()].copy_from_slice(slots);
                    *slots = bigger;
                }
                slots[count] = Some(referrer);
                *fill = FillEstimate::new(count + 1, slots.len());
                true
            }
        }
    }

    /// Removes the referrer at `index` by moving the last one into its place.
    pub(crate) fn remove_at(&mut self, index: usize) -> Option<ElementId> {
        match self {
            BackReferences::Empty => None,
            BackReferences::Single(existing) => {
                if index != 0 {
                    return None;
                }
                let removed = *existing;
                *self = BackReferences::Empty;
                Some(removed)
            }
            BackReferences::Many { slots, fill } => {
                let count = Self::count(slots, *fill);
                if index >= count {
                    return None;
                }
                let last = count - 1;
                let removed = slots[index];
                slots[index] = slots[last];
                slots[last] = None;
                *fill = FillEstimate::new(last, slots.len());
                removed
            }
        }
    }

    pub(crate) fn remove(&mut self, referrer: ElementId) -> bool {
        let found = self.iter().position(|candidate| candidate == referrer);
        match found {
            Some(index) => self.remove_at(index).is_some(),
            None => false,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = ElementId> + '_ {
        let slice: &[Option<ElementId>] = match self {
            BackReferences::Empty => &[],
            BackReferences::Single(_) => &[],
            BackReferences::Many { slots, .. } => slots,
        };
        let single = match self {
            BackReferences::Single(existing) => Some(*existing),
            _ => None,
        };
        single
            .into_iter()
            .chain(slice.iter().map_while(|slot| *slot))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        match self {
            BackReferences::Empty => 0,
            BackReferences::Single(_) => 1,
            BackReferences::Many { slots, fill } => Self::count(slots, *fill),
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        match self {
            BackReferences::Empty => 0,
            BackReferences::Single(_) => 1,
            BackReferences::Many { slots, .. } => slots.len(),
        }
    }

    /// Number of filled slots, starting the scan at the estimated fill.
    fn count(slots: &[Option<ElementId>], fill: FillEstimate) -> usize {
        let start = fill.lower_bound(slots.len());
        if start == slots.len() {
            return start;
        }
        slots[start..]
            .iter()
            .position(Option::is_none)
            .map_or(slots.len(), |offset| start + offset)
    }

    /// `Ok(index)` if `referrer` is present, otherwise `Err(count)`.
    fn scan_for(slots: &[Option<ElementId>], referrer: ElementId) -> Result<usize, usize> {
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                None => return Err(i),
                Some(existing) if *existing == referrer => return Ok(i),
                Some(_) => {}
            }
        }
        Err(slots.len())
    }
}
