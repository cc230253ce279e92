//! Two-phase set: an add set paired with a remove set.
//!
//! An element is present iff it was added and never removed. Removal is
//! permanent, so a revoked element can never come back, regardless of the
//! order in which adds and removes are observed.

use crate::gset::GSet;
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoPhaseSet<T: Ord + Clone> {
    added: GSet<T>,
    removed: GSet<T>,
}

impl<T: Ord + Clone> TwoPhaseSet<T> {
    pub fn new() -> Self {
        Self {
            added: GSet::new(),
            removed: GSet::new(),
        }
    }

    pub fn add(&mut self, value: T) {
        self.added.insert(value);
    }

    /// Tombstone an element. Removing something never added still blocks
    /// any later add, since removes may be observed before their adds.
    pub fn remove(&mut self, value: T) {
        self.removed.insert(value);
    }

    pub fn contains(&self, value: &T) -> bool {
        self.added.contains(value) && !self.removed.contains(value)
    }

    /// Whether the element has ever been removed.
    pub fn is_removed(&self, value: &T) -> bool {
        self.removed.contains(value)
    }

    /// Live elements in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.added.iter().filter(|v| !self.removed.contains(v))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<T: Ord + Clone> Default for TwoPhaseSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone> Lattice for TwoPhaseSet<T> {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        Self {
            added: self.added.join(&other.added),
            removed: self.removed.join(&other.removed),
        }
    }
}
