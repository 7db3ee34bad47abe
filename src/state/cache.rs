//! Per-resource access state cache.

use std::collections::HashMap;

use super::{AccessState, BarrierDescriptor, ResourceKey, TrackedResource};
use crate::command::CommandList;

/// Last known access state of every tracked resource.
///
/// Resources never seen before are in [`AccessState::UNDEFINED`]. The cache
/// holds no lock; callers serialize access through `&mut self`.
#[derive(Debug, Default)]
pub struct StateCache {
    states: HashMap<ResourceKey, AccessState>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, `UNDEFINED` if the resource was never set.
    pub fn get(&self, resource: impl TrackedResource) -> AccessState {
        self.states
            .get(&resource.resource_key())
            .copied()
            .unwrap_or(AccessState::UNDEFINED)
    }

    /// Overwrite the state unconditionally.
    pub fn set(&mut self, resource: impl TrackedResource, state: AccessState) {
        self.states.insert(resource.resource_key(), state);
    }

    /// Barrier that moves `resource` from its cached state to `required`.
    ///
    /// Pure: the cache is not updated. Callers that record the barrier
    /// follow up with [`set`](Self::set), or use [`transition`](Self::transition).
    pub fn compute_barrier(&self, resource: impl TrackedResource, required: AccessState) -> BarrierDescriptor {
        BarrierDescriptor {
            resource: resource.resource_key(),
            src: self.get(&resource),
            dst: required,
            range: resource.subresource_range(),
        }
    }

    /// Compute, record unless redundant, then update the cache.
    ///
    /// Returns whether a barrier was recorded.
    pub fn transition(&mut self, cmd: &mut CommandList, resource: impl TrackedResource, required: AccessState) -> bool {
        let barrier = self.compute_barrier(&resource, required);
        self.set(&resource, required);
        if barrier.is_redundant() {
            return false;
        }
        tracing::trace!(resource = ?barrier.resource, src = ?barrier.src.layout, dst = ?barrier.dst.layout, "barrier");
        cmd.barrier(barrier);
        true
    }

    /// Drop the entry of a destroyed resource.
    pub fn forget(&mut self, resource: impl TrackedResource) -> Option<AccessState> {
        self.states.remove(&resource.resource_key())
    }

    /// Forget everything; used after device loss.
    pub fn invalidate_all(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
