use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::types::{EntityKind, Result};

use super::descriptor::IndexOrder;

/// Streaming interface over entity ids produced by an index.
pub trait EntityStream: Send {
    /// Pushes up to `max` ids into `out`, returning `true` while more may follow.
    fn next_batch(&mut self, out: &mut Vec<u64>, max: usize) -> Result<bool>;

    /// Convenience helper to fetch the next id, if any.
    fn next_entity(&mut self) -> Result<Option<u64>> {
        let mut buf = Vec::with_capacity(1);
        loop {
            buf.clear();
            let has_more = self.next_batch(&mut buf, 1)?;
            if let Some(id) = buf.pop() {
                return Ok(Some(id));
            }
            if !has_more {
                return Ok(None);
            }
        }
    }

    /// Releases any state held by the stream.
    fn close(&mut self) {}
}

/// A stream that yields nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyEntityStream;

impl EntityStream for EmptyEntityStream {
    fn next_batch(&mut self, _out: &mut Vec<u64>, _max: usize) -> Result<bool> {
        Ok(false)
    }
}

/// Committed token (label or edge type) memberships, keyed `(token, entity)`.
pub struct TokenIndex {
    kind: EntityKind,
    entries: RwLock<BTreeSet<(u32, u64)>>,
    counts: RwLock<FxHashMap<u32, u64>>,
}

impl TokenIndex {
    /// Creates an empty index for `kind`.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            entries: RwLock::new(BTreeSet::new()),
            counts: RwLock::new(FxHashMap::default()),
        }
    }

    /// Entity kind the index tracks.
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Records that `entity` carries `token`.
    pub fn insert(&self, token: u32, entity: u64) {
        if self.entries.write().insert((token, entity)) {
            *self.counts.write().entry(token).or_default() += 1;
        }
    }

    /// Drops the membership of `entity` in `token`.
    pub fn remove(&self, token: u32, entity: u64) {
        if self.entries.write().remove(&(token, entity)) {
            let mut counts = self.counts.write();
            if let Some(count) = counts.get_mut(&token) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Whether `entity` is indexed under `token`.
    pub fn contains(&self, token: u32, entity: u64) -> bool {
        self.entries.read().contains(&(token, entity))
    }

    /// Committed entity count for `token`.
    pub fn count(&self, token: u32) -> u64 {
        self.counts.read().get(&token).copied().unwrap_or(0)
    }

    /// Entity ids that split `token`'s entries into `partitions` runs whose
    /// sizes differ by at most one.
    ///
    /// Returns the exclusive upper id of every partition but the last; the last
    /// partition is open ended. With fewer entries than partitions some runs
    /// are empty.
    pub fn split_points(&self, token: u32, partitions: usize) -> Vec<u64> {
        if partitions <= 1 {
            return Vec::new();
        }
        let entries = self.entries.read();
        let members = entries.range((token, 0)..=(token, u64::MAX));
        let total = members.clone().count();
        if total == 0 {
            return vec![0; partitions - 1];
        }
        let mut points = Vec::with_capacity(partitions - 1);
        for (pos, (_, id)) in members.enumerate() {
            // Cut `i` starts at entry `i * total / partitions`.
            while points.len() + 1 < partitions && (points.len() + 1) * total / partitions == pos {
                points.push(*id);
            }
            if points.len() + 1 == partitions {
                break;
            }
        }
        points
    }

    /// Opens a stream over `token` restricted to ids in `[start, end)`.
    pub fn stream(
        self: &Arc<Self>,
        token: u32,
        order: IndexOrder,
        start: u64,
        end: Option<u64>,
    ) -> TokenStream {
        TokenStream {
            index: Arc::clone(self),
            token,
            descending: matches!(order, IndexOrder::Descending),
            start,
            end,
            last: None,
            done: false,
        }
    }
}

/// Pull stream over one token of a [`TokenIndex`].
///
/// Every step re-seeks past the last id it produced so concurrent inserts are
/// tolerated without holding the index lock between steps.
pub struct TokenStream {
    index: Arc<TokenIndex>,
    token: u32,
    descending: bool,
    start: u64,
    end: Option<u64>,
    last: Option<u64>,
    done: bool,
}

impl TokenStream {
    /// Token the stream covers.
    pub fn token(&self) -> u32 {
        self.token
    }

    fn step(&mut self, entries: &BTreeSet<(u32, u64)>) -> Option<u64> {
        let token = self.token;
        let upper = match self.end {
            Some(end) if end <= self.start => return None,
            Some(end) => Bound::Excluded((token, end)),
            None => Bound::Included((token, u64::MAX)),
        };
        let found = if self.descending {
            let upper = match self.last {
                Some(last) => Bound::Excluded((token, last)),
                None => upper,
            };
            entries
                .range((Bound::Included((token, self.start)), upper))
                .next_back()
        } else {
            let lower = match self.last {
                Some(last) => Bound::Excluded((token, last)),
                None => Bound::Included((token, self.start)),
            };
            entries.range((lower, upper)).next()
        };
        found.map(|(_, id)| *id)
    }
}

impl EntityStream for TokenStream {
    fn next_batch(&mut self, out: &mut Vec<u64>, max: usize) -> Result<bool> {
        if self.done {
            return Ok(false);
        }
        let index = Arc::clone(&self.index);
        let entries = index.entries.read();
        for _ in 0..max {
            match self.step(&entries) {
                Some(id) => {
                    self.last = Some(id);
                    out.push(id);
                }
                None => {
                    self.done = true;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn close(&mut self) {
        self.done = true;
    }
}
