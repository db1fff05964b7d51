//! Pull-based index hit streams and the decorator chain layered over them.
//!
//! A progressor produces hits by calling back into an [`EntityValueClient`]
//! supplied on every `next`; a hit the client rejects is skipped and the
//! progressor keeps pulling. Filters are [`IndexSeekClient`]s that, on
//! `initialize`, wrap the progressor they were handed and pass the wrapped one on
//! to their target, so every hit routes through them before it reaches the
//! consuming cursor.

use crate::types::{IndexValue, Result, SombraError};

use super::descriptor::{IndexDescriptor, IndexQueryConstraints, PropertyPredicate};

/// Receiver of index hits.
pub trait EntityValueClient {
    /// Offers one hit. Returning `false` rejects it.
    fn accept_entity(&mut self, reference: u64, score: f32, values: &mut [IndexValue])
        -> Result<bool>;

    /// Whether the client reads values; progressors may skip reporting them
    /// otherwise.
    fn needs_values(&self) -> bool;
}

/// Pull side of an index hit stream.
pub trait IndexProgressor: Send {
    /// Produces hits until `client` accepts one. Returns `false` when exhausted.
    fn next(&mut self, client: &mut dyn EntityValueClient) -> Result<bool>;

    /// Releases the progressor and whatever it wraps.
    fn close(&mut self);
}

/// Entry point an index calls once a query has been validated.
pub trait IndexSeekClient {
    /// Hands the progressor for a query to its consumer.
    fn initialize(
        &mut self,
        descriptor: &IndexDescriptor,
        progressor: Box<dyn IndexProgressor>,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
    ) -> Result<()>;
}

/// Progressor over nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyProgressor;

impl IndexProgressor for EmptyProgressor {
    fn next(&mut self, _client: &mut dyn EntityValueClient) -> Result<bool> {
        Ok(false)
    }

    fn close(&mut self) {}
}

/// Policy applied by one link of the chain.
pub trait AcceptPolicy: Send {
    /// Called once with the query before the first hit.
    fn initialize(
        &mut self,
        _descriptor: &IndexDescriptor,
        _query: &[PropertyPredicate],
        _constraints: &IndexQueryConstraints,
    ) -> Result<()> {
        Ok(())
    }

    /// Inspects or rewrites a hit. `false` rejects it.
    fn accept(&mut self, reference: u64, values: &mut [IndexValue]) -> Result<bool>;

    /// Whether the policy needs the index to report values.
    fn needs_values(&self) -> bool {
        false
    }

    /// Closes scratch cursors owned by the policy.
    fn close(&mut self);
}

/// Chain link in its client role: wraps the progressor it is initialized with.
///
/// A link built without a policy forwards the progressor unchanged.
pub struct FilterClient<'t, P: AcceptPolicy + 'static> {
    target: &'t mut dyn IndexSeekClient,
    policy: Option<P>,
    initialized: bool,
}

impl<'t, P: AcceptPolicy + 'static> FilterClient<'t, P> {
    /// Creates a link that forwards to `target`.
    pub fn new(target: &'t mut dyn IndexSeekClient, policy: P) -> Self {
        Self::optional(target, Some(policy))
    }

    /// Creates a link that applies `policy` only when present.
    pub fn optional(target: &'t mut dyn IndexSeekClient, policy: Option<P>) -> Self {
        Self {
            target,
            policy,
            initialized: false,
        }
    }
}

impl<P: AcceptPolicy + 'static> IndexSeekClient for FilterClient<'_, P> {
    fn initialize(
        &mut self,
        descriptor: &IndexDescriptor,
        progressor: Box<dyn IndexProgressor>,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
    ) -> Result<()> {
        if self.initialized {
            let mut progressor = progressor;
            progressor.close();
            return Err(SombraError::Usage("filter initialized twice"));
        }
        self.initialized = true;
        let mut policy = match self.policy.take() {
            Some(policy) => policy,
            None => {
                return self
                    .target
                    .initialize(descriptor, progressor, query, constraints)
            }
        };
        if let Err(err) = policy.initialize(descriptor, query, &constraints) {
            policy.close();
            let mut progressor = progressor;
            progressor.close();
            return Err(err);
        }
        let wrapped = FilteredProgressor {
            inner: progressor,
            policy,
            closed: false,
        };
        self.target
            .initialize(descriptor, Box::new(wrapped), query, constraints)
    }
}

impl<P: AcceptPolicy + 'static> Drop for FilterClient<'_, P> {
    fn drop(&mut self) {
        // Never initialized: the policy still owns its scratch cursors.
        if let Some(mut policy) = self.policy.take() {
            policy.close();
        }
    }
}

/// Chain link in its progressor role.
pub struct FilteredProgressor<P: AcceptPolicy> {
    inner: Box<dyn IndexProgressor>,
    policy: P,
    closed: bool,
}

impl<P: AcceptPolicy> IndexProgressor for FilteredProgressor<P> {
    fn next(&mut self, client: &mut dyn EntityValueClient) -> Result<bool> {
        if self.closed {
            return Ok(false);
        }
        let mut adapter = PolicyClient {
            policy: &mut self.policy,
            target: client,
        };
        self.inner.next(&mut adapter)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.policy.close();
        self.inner.close();
    }
}

struct PolicyClient<'a, P: AcceptPolicy> {
    policy: &'a mut P,
    target: &'a mut dyn EntityValueClient,
}

impl<P: AcceptPolicy> EntityValueClient for PolicyClient<'_, P> {
    fn accept_entity(
        &mut self,
        reference: u64,
        score: f32,
        values: &mut [IndexValue],
    ) -> Result<bool> {
        if !self.policy.accept(reference, values)? {
            return Ok(false);
        }
        self.target.accept_entity(reference, score, values)
    }

    fn needs_values(&self) -> bool {
        self.policy.needs_values() || self.target.needs_values()
    }
}
