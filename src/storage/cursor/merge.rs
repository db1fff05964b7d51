use crate::storage::index::{IndexOrder, ValueKey};

#[derive(Clone, Debug)]
enum Slot<K> {
    Pending,
    Ready(K),
    Exhausted,
}

impl<K> Slot<K> {
    fn from_option(value: Option<K>) -> Self {
        match value {
            Some(value) => Slot::Ready(value),
            None => Slot::Exhausted,
        }
    }
}

/// Which input a merged key came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MergeSide {
    /// The committed index.
    Store,
    /// Transaction state.
    Added,
}

/// Two-way merge of already sorted inputs: committed index hits and entities
/// added by the transaction.
///
/// The caller refills whichever input [`needs_store`](Self::needs_store) or
/// [`needs_added`](Self::needs_added) reports before each [`next`](Self::next);
/// passing `None` marks that input exhausted. Equal keys emit the store side
/// first.
#[derive(Clone, Debug)]
pub struct MergeJoin<K: Ord> {
    descending: bool,
    store: Slot<K>,
    added: Slot<K>,
}

/// Merge over entity ids, used by ordered token index scans.
pub type PrimitiveSortedMergeJoin = MergeJoin<u64>;

/// Merge over `(values, entity)` keys, used by ordered value index seeks.
pub type SortedMergeJoin = MergeJoin<ValueKey>;

impl<K: Ord> MergeJoin<K> {
    /// Creates a join emitting in `order`; an unordered request merges ascending.
    pub fn new(order: IndexOrder) -> Self {
        Self {
            descending: matches!(order, IndexOrder::Descending),
            store: Slot::Pending,
            added: Slot::Pending,
        }
    }

    /// Resets both inputs for a new scan.
    pub fn initialize(&mut self, order: IndexOrder) {
        *self = Self::new(order);
    }

    /// Whether the store input must be refilled before the next emission.
    pub fn needs_store(&self) -> bool {
        matches!(self.store, Slot::Pending)
    }

    /// Whether the added input must be refilled before the next emission.
    pub fn needs_added(&self) -> bool {
        matches!(self.added, Slot::Pending)
    }

    /// Supplies the next store key, `None` once the store is exhausted.
    pub fn set_store(&mut self, key: Option<K>) {
        debug_assert!(self.needs_store(), "store slot already filled");
        self.store = Slot::from_option(key);
    }

    /// Supplies the next added key, `None` once the added set is exhausted.
    pub fn set_added(&mut self, key: Option<K>) {
        debug_assert!(self.needs_added(), "added slot already filled");
        self.added = Slot::from_option(key);
    }

    /// Emits the next key in order, or `None` when both inputs are exhausted or
    /// one still awaits a refill.
    pub fn next(&mut self) -> Option<(K, MergeSide)> {
        let take_store = match (&self.store, &self.added) {
            (Slot::Pending, _) | (_, Slot::Pending) => return None,
            (Slot::Exhausted, Slot::Exhausted) => return None,
            (Slot::Ready(_), Slot::Exhausted) => true,
            (Slot::Exhausted, Slot::Ready(_)) => false,
            (Slot::Ready(store), Slot::Ready(added)) => {
                if self.descending {
                    store >= added
                } else {
                    store <= added
                }
            }
        };
        if take_store {
            match std::mem::replace(&mut self.store, Slot::Pending) {
                Slot::Ready(key) => Some((key, MergeSide::Store)),
                _ => None,
            }
        } else {
            match std::mem::replace(&mut self.added, Slot::Pending) {
                Slot::Ready(key) => Some((key, MergeSide::Added)),
                _ => None,
            }
        }
    }

    /// Whether both inputs are exhausted.
    pub fn is_done(&self) -> bool {
        matches!((&self.store, &self.added), (Slot::Exhausted, Slot::Exhausted))
    }
}
