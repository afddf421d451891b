// rust/reshard-core/src/engine/release.rs

//! Reference counting of source tensors by the work that still needs them.

use std::collections::{BTreeMap, BTreeSet};

/// Maps each source to the targets still waiting on it.
///
/// A source is released once every target it was tracked against has been
/// completed.
#[derive(Debug, Clone)]
pub struct ReleaseTracker<S, T> {
    pending: BTreeMap<S, BTreeSet<T>>,
}

impl<S: Ord + Clone, T: Ord + Clone> Default for ReleaseTracker<S, T> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }
}

impl<S: Ord + Clone, T: Ord + Clone> ReleaseTracker<S, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `target` needs `source`.
    pub fn track(&mut self, source: S, target: T) {
        self.pending.entry(source).or_default().insert(target);
    }

    /// Marks `target` done and returns the sources nobody needs anymore.
    pub fn complete(&mut self, target: &T) -> Vec<S> {
        let mut released = Vec::new();
        self.pending.retain(|source, targets| {
            if targets.remove(target) && targets.is_empty() {
                released.push(source.clone());
                return false;
            }
            true
        });
        released
    }

    /// Number of targets still waiting on `source`.
    pub fn pending(&self, source: &S) -> usize {
        self.pending.get(source).map_or(0, BTreeSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}
