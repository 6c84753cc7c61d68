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

//! Fragment ECS - a block-structured, archetype-indexed entity component store.
//!
//! The store keeps components in per-type Fragment Vectors (structure-of-arrays
//! blocks with a two-level occupancy bitmap), groups entities into archetype
//! partitions for cache-dense iteration, and also supports a sparse path for
//! entities whose component set changes too often to justify migration.

pub mod archetype;
pub mod bitset;
pub mod command;
pub mod component;
pub mod constants;
pub mod entity;
pub mod error;
pub mod event;
pub mod fragment;
pub mod lock;
pub mod partition;
pub mod query;
pub mod sparse;
pub mod world;

pub use archetype::{ArchetypeGraph, ArchetypeId, ArchetypeMask, ArchetypeNode};
pub use bitset::{HiBitset, SparseHiBitset};
pub use command::{CommandBuffer, CommandBufferId};
pub use component::{Bundle, Component, ComponentId, ComponentRegistry};
pub use entity::{DenseHandle, EntityRecord, SparseHandle, SparseRecord};
pub use error::{EcsError, Result};
pub use event::{EventBus, SubscriptionId, WorldEvent, WorldEventKind};
pub use fragment::FragmentVector;
pub use lock::{LockMode, LockPath, LockTree};
pub use partition::{Partition, Zone};
pub use query::{CachedQuery, DenseMatch, QueryBuilder, QueryFilter, QuerySignature, SparseMatch};
pub use sparse::SparseAllocator;
pub use world::World;
