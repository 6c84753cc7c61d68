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

//! Deferred structural mutations, batched by `(op, archetype, target)` and
//! flushed in one sweep.
//!
//! Buckets live in a direct-addressed open-addressing table keyed by a
//! 32-bit signature `(op: 4, archetype: 16, flags: 10)`. A generation stamp
//! on each bucket makes a flush-less reset (a new recording frame with
//! nothing left over from the last) an O(1) counter bump: a bucket whose
//! stamp doesn't match the buffer's current generation is treated as empty
//! and reinitialized the next time something is recorded into it.

use bumpalo::Bump;
use smallvec::SmallVec;

use crate::archetype::ArchetypeId;
use crate::constants::MAP_CAPACITY;
use crate::entity::DenseHandle;
use crate::world::World;

pub type CommandBufferId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Delete,
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BucketKey {
    op: Op,
    archetype: ArchetypeId,
    target: ArchetypeId,
}

impl BucketKey {
    /// Hash used only to pick a probe start; full equality is re-checked on
    /// the stored key, so truncation here only affects collision rate.
    fn signature(&self) -> u32 {
        let op_bits: u32 = match self.op {
            Op::Delete => 0,
            Op::Migrate => 1,
        };
        let arch_bits = self.archetype & 0xFFFF;
        let flag_bits = self.target & 0x3FF;
        (op_bits << 28) | (arch_bits << 10) | flag_bits
    }
}

struct Bucket {
    key: BucketKey,
    generation: u32,
    payload: Vec<DenseHandle>,
}

/// A per-producer deferred-mutation queue.
pub struct CommandBuffer {
    id: CommandBufferId,
    table: Vec<Option<Bucket>>,
    generation: u32,
}

impl CommandBuffer {
    pub fn new(id: CommandBufferId) -> Self {
        let mut table = Vec::with_capacity(MAP_CAPACITY);
        table.resize_with(MAP_CAPACITY, || None);
        Self {
            id,
            table,
            generation: 1,
        }
    }

    pub fn id(&self) -> CommandBufferId {
        self.id
    }

    fn find_or_create(&mut self, key: BucketKey) -> &mut Bucket {
        let start = (key.signature() as usize) & (MAP_CAPACITY - 1);
        let mut idx = start;
        loop {
            let occupied_matches = matches!(
                &self.table[idx],
                Some(b) if b.generation == self.generation && b.key == key
            );
            if occupied_matches {
                break;
            }
            let reusable = match &self.table[idx] {
                None => true,
                Some(b) => b.generation != self.generation,
            };
            if reusable {
                self.table[idx] = Some(Bucket {
                    key,
                    generation: self.generation,
                    payload: Vec::new(),
                });
                break;
            }
            idx = (idx + 1) & (MAP_CAPACITY - 1);
            assert_ne!(idx, start, "command buffer table is full");
        }
        self.table[idx].as_mut().unwrap()
    }

    /// Record a deferred delete of `handle`, currently in `archetype`.
    pub fn delete(&mut self, handle: DenseHandle, archetype: ArchetypeId) {
        let key = BucketKey {
            op: Op::Delete,
            archetype,
            target: 0,
        };
        self.find_or_create(key).payload.push(handle);
    }

    /// Record a deferred migration of `handle` from `archetype` to `target`.
    pub fn migrate(&mut self, handle: DenseHandle, archetype: ArchetypeId, target: ArchetypeId) {
        let key = BucketKey {
            op: Op::Migrate,
            archetype,
            target,
        };
        self.find_or_create(key).payload.push(handle);
    }

    pub fn is_empty(&self) -> bool {
        self.table
            .iter()
            .flatten()
            .all(|b| b.generation != self.generation || b.payload.is_empty())
    }

    /// Apply every recorded command against `world`, then advance to the
    /// next recording generation. Returns `(entities_processed,
    /// operation_count)` for the `CommandBufferFlushed` event.
    pub fn flush(&mut self, world: &mut World) -> (u32, u32) {
        let arena = Bump::new();
        let mut entities_processed = 0u32;
        let mut operation_count = 0u32;
        for bucket in self.table.iter_mut().flatten() {
            if bucket.generation != self.generation || bucket.payload.is_empty() {
                continue;
            }
            operation_count += 1;
            let mut scratch = bumpalo::collections::Vec::with_capacity_in(bucket.payload.len(), &arena);
            scratch.extend(bucket.payload.iter().copied());
            let handles = scratch.into_bump_slice();
            match bucket.key.op {
                Op::Delete => {
                    entities_processed += world.delete_batch(handles) as u32;
                }
                Op::Migrate => {
                    let cids: SmallVec<[u16; 8]> = world
                        .archetype_graph()
                        .node(bucket.key.target)
                        .mask
                        .components();
                    entities_processed += world.migrate_batch(handles, bucket.key.target, &cids) as u32;
                }
            }
            bucket.payload.clear();
        }
        self.generation += 1;
        (entities_processed, operation_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_and_migrate_land_in_distinct_buckets() {
        let mut cb = CommandBuffer::new(0);
        let h = DenseHandle { widx: 0, gen: 0 };
        cb.delete(h, 1);
        cb.migrate(h, 1, 2);
        let key_delete = BucketKey {
            op: Op::Delete,
            archetype: 1,
            target: 0,
        };
        let key_migrate = BucketKey {
            op: Op::Migrate,
            archetype: 1,
            target: 2,
        };
        assert_ne!(key_delete.signature(), key_migrate.signature());
    }

    #[test]
    fn is_empty_reflects_current_generation() {
        let mut cb = CommandBuffer::new(0);
        assert!(cb.is_empty());
        cb.delete(DenseHandle { widx: 0, gen: 0 }, 1);
        assert!(!cb.is_empty());
    }
}
