use std::collections::BTreeSet;
use std::sync::Arc;

/// Added and removed ids of one entity set, copy-on-write.
///
/// Cloning is two reference-count bumps; a writer touching a shared set copies
/// it first, so a clone taken by a cursor never changes underneath it.
#[derive(Clone, Debug)]
pub struct DiffSet<T: Ord + Clone> {
    added: Arc<BTreeSet<T>>,
    removed: Arc<BTreeSet<T>>,
}

impl<T: Ord + Clone> Default for DiffSet<T> {
    fn default() -> Self {
        Self {
            added: Arc::new(BTreeSet::new()),
            removed: Arc::new(BTreeSet::new()),
        }
    }
}

impl<T: Ord + Clone> DiffSet<T> {
    /// Marks `item` added. Re-adding a removed item cancels the removal.
    pub fn add(&mut self, item: T) {
        if self.removed.contains(&item) {
            Arc::make_mut(&mut self.removed).remove(&item);
        } else if !self.added.contains(&item) {
            Arc::make_mut(&mut self.added).insert(item);
        }
    }

    /// Marks `item` removed. Removing an added item cancels the addition.
    pub fn remove(&mut self, item: T) {
        if self.added.contains(&item) {
            Arc::make_mut(&mut self.added).remove(&item);
        } else if !self.removed.contains(&item) {
            Arc::make_mut(&mut self.removed).insert(item);
        }
    }

    /// Forgets any change recorded for `item`.
    pub fn forget(&mut self, item: &T) {
        if self.added.contains(item) {
            Arc::make_mut(&mut self.added).remove(item);
        }
        if self.removed.contains(item) {
            Arc::make_mut(&mut self.removed).remove(item);
        }
    }

    /// Whether `item` was added.
    pub fn is_added(&self, item: &T) -> bool {
        self.added.contains(item)
    }

    /// Whether `item` was removed.
    pub fn is_removed(&self, item: &T) -> bool {
        self.removed.contains(item)
    }

    /// Added items, ascending.
    pub fn added(&self) -> &Arc<BTreeSet<T>> {
        &self.added
    }

    /// Removed items, ascending.
    pub fn removed(&self) -> &Arc<BTreeSet<T>> {
        &self.removed
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Frozen view for a cursor.
    pub fn snapshot(&self) -> DiffSnapshot<T> {
        DiffSnapshot {
            added: Arc::clone(&self.added),
            removed: Arc::clone(&self.removed),
        }
    }

    /// Applies the diff to a sorted base set.
    pub fn apply_to(&self, base: impl IntoIterator<Item = T>) -> Vec<T> {
        let mut out: Vec<T> = base
            .into_iter()
            .filter(|item| !self.removed.contains(item))
            .collect();
        for item in self.added.iter() {
            if let Err(pos) = out.binary_search(item) {
                out.insert(pos, item.clone());
            }
        }
        out
    }
}

/// Immutable added/removed view captured once per scan.
#[derive(Clone, Debug)]
pub struct DiffSnapshot<T: Ord + Clone> {
    added: Arc<BTreeSet<T>>,
    removed: Arc<BTreeSet<T>>,
}

impl<T: Ord + Clone> Default for DiffSnapshot<T> {
    fn default() -> Self {
        Self {
            added: Arc::new(BTreeSet::new()),
            removed: Arc::new(BTreeSet::new()),
        }
    }
}

impl<T: Ord + Clone> DiffSnapshot<T> {
    /// Builds a snapshot from explicit sets.
    pub fn from_sets(added: BTreeSet<T>, removed: BTreeSet<T>) -> Self {
        Self {
            added: Arc::new(added),
            removed: Arc::new(removed),
        }
    }

    /// Frozen added set.
    pub fn added(&self) -> &Arc<BTreeSet<T>> {
        &self.added
    }

    /// Frozen removed set.
    pub fn removed(&self) -> &Arc<BTreeSet<T>> {
        &self.removed
    }

    /// Whether `item` was added.
    pub fn is_added(&self, item: &T) -> bool {
        self.added.contains(item)
    }

    /// Whether `item` was removed.
    pub fn is_removed(&self, item: &T) -> bool {
        self.removed.contains(item)
    }

    /// Whether the snapshot holds no change.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
