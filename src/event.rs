// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! World lifecycle events and their synchronous subscription bus.
//!
//! Unlike the teacher's open `Event: Any` trait (any `TypeId` could register
//! a queue), this event set is closed: a `World` only ever emits the
//! variants of [`WorldEvent`], so the bus keys subscriptions by the enum's
//! discriminant ([`WorldEventKind`]) instead of `TypeId`.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::archetype::{ArchetypeId, ArchetypeMask};
use crate::command::CommandBufferId;
use crate::component::ComponentId;
use crate::entity::{DenseHandle, SparseHandle};

#[derive(Debug, Clone)]
pub enum WorldEvent {
    DenseEntityCreated {
        handle: DenseHandle,
    },
    DenseEntityDestroyed {
        handle: DenseHandle,
        last_packed_id: u64,
    },
    DenseComponentAdded {
        handle: DenseHandle,
        component_ids: SmallVec<[ComponentId; 8]>,
    },
    DenseComponentRemoved {
        handle: DenseHandle,
        component_ids: SmallVec<[ComponentId; 8]>,
    },
    DenseEntityMigrated {
        handle: DenseHandle,
        old_packed_id: u64,
        last_packed_id: u64,
        old_arch: ArchetypeId,
        new_arch: ArchetypeId,
    },
    SparseEntityCreated {
        handle: SparseHandle,
    },
    SparseEntityDestroyed {
        handle: SparseHandle,
    },
    SparseComponentAdded {
        handle: SparseHandle,
        component_ids: SmallVec<[ComponentId; 8]>,
    },
    SparseComponentRemoved {
        handle: SparseHandle,
        component_ids: SmallVec<[ComponentId; 8]>,
    },
    Densified {
        old_sparse: SparseHandle,
        new_dense: DenseHandle,
    },
    Sparsified {
        old_dense: DenseHandle,
        new_sparse: SparseHandle,
    },
    ArchetypeCreated {
        id: ArchetypeId,
        mask: ArchetypeMask,
        component_ids: SmallVec<[ComponentId; 8]>,
    },
    CommandBufferFlushed {
        buffer_id: CommandBufferId,
        entities_processed: u32,
        operation_count: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorldEventKind {
    DenseEntityCreated,
    DenseEntityDestroyed,
    DenseComponentAdded,
    DenseComponentRemoved,
    DenseEntityMigrated,
    SparseEntityCreated,
    SparseEntityDestroyed,
    SparseComponentAdded,
    SparseComponentRemoved,
    Densified,
    Sparsified,
    ArchetypeCreated,
    CommandBufferFlushed,
}

impl WorldEvent {
    pub fn kind(&self) -> WorldEventKind {
        match self {
            WorldEvent::DenseEntityCreated { .. } => WorldEventKind::DenseEntityCreated,
            WorldEvent::DenseEntityDestroyed { .. } => WorldEventKind::DenseEntityDestroyed,
            WorldEvent::DenseComponentAdded { .. } => WorldEventKind::DenseComponentAdded,
            WorldEvent::DenseComponentRemoved { .. } => WorldEventKind::DenseComponentRemoved,
            WorldEvent::DenseEntityMigrated { .. } => WorldEventKind::DenseEntityMigrated,
            WorldEvent::SparseEntityCreated { .. } => WorldEventKind::SparseEntityCreated,
            WorldEvent::SparseEntityDestroyed { .. } => WorldEventKind::SparseEntityDestroyed,
            WorldEvent::SparseComponentAdded { .. } => WorldEventKind::SparseComponentAdded,
            WorldEvent::SparseComponentRemoved { .. } => WorldEventKind::SparseComponentRemoved,
            WorldEvent::Densified { .. } => WorldEventKind::Densified,
            WorldEvent::Sparsified { .. } => WorldEventKind::Sparsified,
            WorldEvent::ArchetypeCreated { .. } => WorldEventKind::ArchetypeCreated,
            WorldEvent::CommandBufferFlushed { .. } => WorldEventKind::CommandBufferFlushed,
        }
    }
}

pub type SubscriptionId = u64;

type Callback = Box<dyn Fn(&WorldEvent) + Send + Sync>;

/// Synchronous, same-thread dispatcher keyed by [`WorldEventKind`].
///
/// Subscribers must not mutate World structure from inside a callback; the
/// bus has no reentrancy guard, matching the "undefined behavior" contract.
#[derive(Default)]
pub struct EventBus {
    subscribers: FxHashMap<WorldEventKind, Vec<(SubscriptionId, Callback)>>,
    next_id: SubscriptionId,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        kind: WorldEventKind,
        callback: impl Fn(&WorldEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers
            .entry(kind)
            .or_default()
            .push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for bucket in self.subscribers.values_mut() {
            if let Some(pos) = bucket.iter().position(|(sid, _)| *sid == id) {
                bucket.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn publish(&self, event: &WorldEvent) {
        if let Some(bucket) = self.subscribers.get(&event.kind()) {
            for (_, callback) in bucket {
                callback(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn subscribe_and_publish() {
        let mut bus = EventBus::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();
        bus.subscribe(WorldEventKind::DenseEntityCreated, move |_| {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&WorldEvent::DenseEntityCreated {
            handle: DenseHandle { widx: 0, gen: 0 },
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut bus = EventBus::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();
        let id = bus.subscribe(WorldEventKind::DenseEntityCreated, move |_| {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(bus.unsubscribe(id));
        bus.publish(&WorldEvent::DenseEntityCreated {
            handle: DenseHandle { widx: 0, gen: 0 },
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn events_are_scoped_by_kind() {
        let mut bus = EventBus::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();
        bus.subscribe(WorldEventKind::CommandBufferFlushed, move |_| {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(&WorldEvent::DenseEntityCreated {
            handle: DenseHandle { widx: 0, gen: 0 },
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
