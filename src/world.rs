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

//! The store's single entry point: entity lifecycle, structural mutation,
//! and query dispatch over the archetype graph.
//!
//! `World` is where the otherwise-independent subsystems — the component
//! registry, the archetype graph, the dense partition allocator, the sparse
//! allocator, and the command buffers — meet. None of those modules know
//! about each other; `World` is the only thing that holds all of them at
//! once, which is why the allocate/swap-remove/migrate algorithms described
//! against `Partition` in [`crate::partition`] are implemented here instead.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

#[cfg(feature = "profiling")]
use tracing::{instrument, trace};

use crate::archetype::{ArchetypeGraph, ArchetypeId, ArchetypeMask};
use crate::command::{CommandBuffer, CommandBufferId};
use crate::component::{Bundle, Component, ComponentId, ComponentRegistry};
use crate::constants::{pack_id, MAX_COMPONENTS};
use crate::entity::{DenseHandle, EntityRecord, SparseHandle, SparseRecord};
use crate::error::{EcsError, Result};
use crate::event::{EventBus, SubscriptionId, WorldEvent, WorldEventKind};
use crate::query::{self, CachedQuery, DenseMatch, QuerySignature, SparseMatch};
use crate::sparse::SparseAllocator;

/// The entity-component store.
///
/// `registry` is `pub(crate)` rather than private: the generated [`Bundle`]
/// impls write component values directly into it during `spawn`, and giving
/// them a private-but-crate-visible field avoids routing every bundle write
/// through an extra indirection layer.
pub struct World {
    pub(crate) registry: ComponentRegistry,
    graph: ArchetypeGraph,

    entities: Vec<EntityRecord>,
    generations: Vec<u32>,
    dense_free_list: Vec<u32>,
    /// `packed_id -> widx`. Sound globally (not per-archetype) because block
    /// indices are drawn from one counter shared by every archetype, so a
    /// packed id never refers to more than one physical slot across the
    /// whole store.
    location: FxHashMap<u64, u32>,
    block_count: u32,

    sparse: SparseAllocator,
    sparse_records: Vec<SparseRecord>,

    command_buffers: Vec<Option<CommandBuffer>>,
    events: EventBus,
}

impl World {
    pub fn new() -> Self {
        Self {
            registry: ComponentRegistry::new(),
            graph: ArchetypeGraph::new(),
            entities: Vec::new(),
            generations: Vec::new(),
            dense_free_list: Vec::new(),
            location: FxHashMap::default(),
            block_count: 0,
            sparse: SparseAllocator::new(),
            sparse_records: Vec::new(),
            command_buffers: Vec::new(),
            events: EventBus::new(),
        }
    }

    // ---- registration -----------------------------------------------------

    /// Register `T`, failing if doing so would exceed `MAX_COMPONENTS`.
    /// Idempotent for an already-registered type, matching
    /// [`ComponentRegistry::register`].
    pub fn register_component<T: Component>(
        &mut self,
        change_tracking: bool,
        name: &'static str,
    ) -> Result<ComponentId> {
        if self.registry.id_of::<T>().is_none() && self.registry.len() >= MAX_COMPONENTS {
            return Err(EcsError::ComponentLimitExceeded);
        }
        Ok(self.registry.register::<T>(change_tracking, name))
    }

    /// Read-only access to the archetype graph, used by [`CommandBuffer`] to
    /// resolve a bucketed migration's target component set.
    pub fn archetype_graph(&self) -> &ArchetypeGraph {
        &self.graph
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len() - self.dense_free_list.len()
    }

    pub fn archetype_count(&self) -> usize {
        self.graph.len()
    }

    pub fn archetype_population(&self, archetype_id: ArchetypeId) -> usize {
        self.graph
            .node(archetype_id)
            .partition
            .as_ref()
            .map_or(0, |p| p.len())
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    // ---- events -------------------------------------------------------------

    pub fn subscribe(
        &mut self,
        kind: WorldEventKind,
        callback: impl Fn(&WorldEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.events.subscribe(kind, callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    fn emit(&self, event: WorldEvent) {
        self.events.publish(&event);
    }

    // ---- internal: archetype / handle bookkeeping --------------------------

    fn mask_of(&self, cids: &[ComponentId]) -> Result<ArchetypeMask> {
        let mut mask = ArchetypeMask::empty();
        for &cid in cids {
            if cid as usize >= self.registry.len() {
                return Err(EcsError::UnknownComponent(cid));
            }
            mask.set_bit(cid);
        }
        Ok(mask)
    }

    /// Resolves `mask` to a node, emitting `ArchetypeCreated` the first time
    /// this exact component set is seen.
    fn node_for_mask(&mut self, mask: ArchetypeMask) -> ArchetypeId {
        let existed = self.graph.contains(mask);
        let id = self.graph.find_fast(mask);
        if !existed {
            self.emit(WorldEvent::ArchetypeCreated {
                id,
                mask,
                component_ids: mask.components(),
            });
        }
        id
    }

    fn transition_add(&mut self, node: ArchetypeId, cid: ComponentId) -> ArchetypeId {
        let before = self.graph.len() as ArchetypeId;
        let next = self.graph.add_component(node, cid);
        self.announce_new_nodes(before);
        next
    }

    fn transition_remove(&mut self, node: ArchetypeId, cid: ComponentId) -> ArchetypeId {
        let before = self.graph.len() as ArchetypeId;
        let next = self.graph.remove_component(node, cid);
        self.announce_new_nodes(before);
        next
    }

    fn announce_new_nodes(&mut self, before: ArchetypeId) {
        let after = self.graph.len() as ArchetypeId;
        for id in before..after {
            let mask = self.graph.node(id).mask;
            self.emit(WorldEvent::ArchetypeCreated {
                id,
                mask,
                component_ids: mask.components(),
            });
        }
    }

    fn check_handle(&self, handle: DenseHandle) -> Result<u32> {
        match self.generations.get(handle.widx as usize) {
            Some(&gen) if gen == handle.gen => {
                if (handle.widx as usize) < self.entities.len() {
                    Ok(handle.widx)
                } else {
                    Err(EcsError::InvalidEntity)
                }
            }
            Some(_) => Err(EcsError::StaleHandle),
            None => Err(EcsError::InvalidEntity),
        }
    }

    fn check_sparse_handle(&self, handle: SparseHandle) -> Result<usize> {
        let id = handle.id as usize;
        match self.sparse_records.get(id) {
            Some(_) if self.sparse.generation(handle.id) == handle.gen => Ok(id),
            Some(_) => Err(EcsError::StaleHandle),
            None => Err(EcsError::InvalidEntity),
        }
    }

    fn alloc_widx(&mut self, packed_id: u64, node: ArchetypeId) -> u32 {
        if let Some(widx) = self.dense_free_list.pop() {
            self.entities[widx as usize] = EntityRecord::new(packed_id, node, widx);
            widx
        } else {
            let widx = self.entities.len() as u32;
            self.entities.push(EntityRecord::new(packed_id, node, widx));
            self.generations.push(0);
            widx
        }
    }

    fn recycle_widx(&mut self, widx: u32) {
        self.generations[widx as usize] = self.generations[widx as usize].wrapping_add(1);
        self.dense_free_list.push(widx);
    }

    // ---- internal: dense partition allocator -------------------------------

    /// Ensures the node's fill zone has room, growing it with a fresh block
    /// (drawn from the world-wide `block_count`) if not.
    fn ensure_capacity(&mut self, node_id: ArchetypeId) {
        let needs_zone = {
            let node = self.graph.node(node_id);
            node.partition.is_none() || node.partition.as_ref().unwrap().needs_new_zone()
        };
        if !needs_zone {
            return;
        }
        let mask = self.graph.node(node_id).mask;
        let block_idx = self.block_count;
        self.block_count += 1;
        for cid in mask.components() {
            self.registry.erased_mut(cid).new_block_at(block_idx);
        }
        self.graph.node_mut(node_id).partition_mut().push_zone(block_idx);
        #[cfg(feature = "profiling")]
        trace!(archetype = node_id, block_idx, "grew dense partition by one block");
    }

    fn reserve_slot(&mut self, node_id: ArchetypeId) -> (u32, u32) {
        self.ensure_capacity(node_id);
        self.graph.node_mut(node_id).partition_mut().reserve_one()
    }

    /// Reserves `n` slots in `node`, crossing zone/block boundaries as
    /// needed. Returns one `(block_index, slot)` pair per reserved entity, in
    /// allocation order.
    fn allocate_batch(&mut self, node_id: ArchetypeId, n: usize) -> Vec<(u32, u32)> {
        let mut out = Vec::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            self.ensure_capacity(node_id);
            let (block_index, start, take) = {
                let partition = self.graph.node_mut(node_id).partition_mut();
                let zone = partition.zones[partition.fill_index];
                let take = remaining.min(zone.remaining() as usize) as u32;
                partition.zones[partition.fill_index].end += take;
                if partition.zones[partition.fill_index].is_full() {
                    partition.fill_index += 1;
                }
                (zone.block_index, zone.end, take)
            };
            for slot in start..start + take {
                out.push((block_index, slot));
            }
            remaining -= take as usize;
        }
        out
    }

    /// Swap-removes `target_packed` out of `node_id`'s partition: overrides
    /// it with the last live slot's data (unless it already is the last live
    /// slot), deactivates the vacated slot in every column of the archetype,
    /// and shrinks the partition by one. Returns the packed id that was
    /// vacated (`target_packed` itself if no swap was needed).
    fn swap_remove_dense(&mut self, node_id: ArchetypeId, target_packed: u64) -> u64 {
        let mask = self.graph.node(node_id).mask;
        let lid_packed = {
            let partition = self.graph.node_mut(node_id).partition_mut();
            let (lb, lo) = partition
                .last_live_packed()
                .expect("swap-remove against an empty partition");
            pack_id(lb, lo)
        };
        if lid_packed != target_packed {
            for cid in mask.components() {
                self.registry.erased_mut(cid).override_slot(target_packed, lid_packed);
            }
        }
        for cid in mask.components() {
            self.registry.erased_mut(cid).deactivate_bit(lid_packed);
        }
        self.graph.node_mut(node_id).partition_mut().pop_one();
        lid_packed
    }

    /// Repairs the handle table after a swap-remove vacated `vacated` and
    /// the entity that used to live there now (if it moved) lives at
    /// `reused`. Shared by single-entity delete and migrate.
    fn repair_after_swap_remove(&mut self, vacated: u64, reused: u64) {
        if vacated != reused {
            if let Some(other_widx) = self.location.remove(&vacated) {
                self.entities[other_widx as usize].packed_id = reused;
                self.location.insert(reused, other_widx);
            }
        } else {
            self.location.remove(&reused);
        }
    }

    // ---- dense entity lifecycle --------------------------------------------

    /// Create one dense entity carrying `cids`. Component values are not
    /// initialized; call `set` (or use [`World::spawn`] with a [`Bundle`])
    /// to populate them.
    #[cfg_attr(feature = "profiling", instrument(skip(self)))]
    pub fn create_entity(&mut self, cids: &[ComponentId]) -> Result<DenseHandle> {
        let mask = self.mask_of(cids)?;
        let node_id = self.node_for_mask(mask);
        let (block, slot) = self.reserve_slot(node_id);
        let packed = pack_id(block, slot);
        for cid in cids {
            self.registry.erased_mut(*cid).activate_bit(packed);
        }
        let widx = self.alloc_widx(packed, node_id);
        self.location.insert(packed, widx);
        let handle = DenseHandle {
            widx,
            gen: self.generations[widx as usize],
        };
        self.emit(WorldEvent::DenseEntityCreated { handle });
        Ok(handle)
    }

    /// Create `n` dense entities carrying `cids` in one batched allocation.
    pub fn create_entities(&mut self, n: usize, cids: &[ComponentId]) -> Result<Vec<DenseHandle>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mask = self.mask_of(cids)?;
        let node_id = self.node_for_mask(mask);
        let slots = self.allocate_batch(node_id, n);
        let mut handles = Vec::with_capacity(n);
        for (block, slot) in slots {
            let packed = pack_id(block, slot);
            for cid in cids {
                self.registry.erased_mut(*cid).activate_bit(packed);
            }
            let widx = self.alloc_widx(packed, node_id);
            self.location.insert(packed, widx);
            let handle = DenseHandle {
                widx,
                gen: self.generations[widx as usize],
            };
            self.emit(WorldEvent::DenseEntityCreated { handle });
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Create an entity from a [`Bundle`], registering its component types
    /// if needed and writing its values in.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> DenseHandle {
        let cids = B::component_ids(&mut self.registry);
        let handle = self
            .create_entity(&cids)
            .expect("bundle components were just registered, so their ids are valid");
        let packed = self.entities[handle.widx as usize].packed_id;
        bundle.write_into(self, packed);
        handle
    }

    pub fn delete_entity(&mut self, handle: DenseHandle) -> Result<()> {
        let widx = self.check_handle(handle)?;
        let rec = self.entities[widx as usize];
        let lid_packed = self.swap_remove_dense(rec.archetype_id, rec.packed_id);
        self.repair_after_swap_remove(lid_packed, rec.packed_id);
        self.recycle_widx(widx);
        self.emit(WorldEvent::DenseEntityDestroyed {
            handle,
            last_packed_id: lid_packed,
        });
        Ok(())
    }

    /// Delete every handle in `handles`, skipping any that are already
    /// stale. Returns the number actually deleted.
    pub fn delete_batch(&mut self, handles: &[DenseHandle]) -> usize {
        let mut count = 0;
        for &handle in handles {
            if self.delete_entity(handle).is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Moves `handle` from its current archetype to the one named by
    /// `target_node`. A no-op (not an error) if it is already there.
    fn migrate_entity(&mut self, handle: DenseHandle, target_node: ArchetypeId) -> Result<()> {
        let widx = self.check_handle(handle)?;
        let rec = self.entities[widx as usize];
        if rec.archetype_id == target_node {
            return Ok(());
        }
        let src_mask = self.graph.node(rec.archetype_id).mask;
        let target_mask = self.graph.node(target_node).mask;

        let (block, slot) = self.reserve_slot(target_node);
        let new_packed = pack_id(block, slot);

        // Copy the intersection before the swap-remove below can overwrite
        // the source slot with a different entity's data.
        for cid in src_mask.and(&target_mask).components() {
            self.registry.erased_mut(cid).override_slot(new_packed, rec.packed_id);
        }

        let lid_packed = self.swap_remove_dense(rec.archetype_id, rec.packed_id);
        self.repair_after_swap_remove(lid_packed, rec.packed_id);

        self.entities[widx as usize] = EntityRecord::new(new_packed, target_node, widx);
        self.location.insert(new_packed, widx);

        self.emit(WorldEvent::DenseEntityMigrated {
            handle,
            old_packed_id: rec.packed_id,
            last_packed_id: lid_packed,
            old_arch: rec.archetype_id,
            new_arch: target_node,
        });
        Ok(())
    }

    /// Batched migration of `handles` (assumed to share one source
    /// archetype, as the command buffer's bucketing guarantees) onto
    /// `target`. Returns the number of handles actually migrated.
    #[cfg_attr(feature = "profiling", instrument(skip(self, handles, target_cids)))]
    pub fn migrate_batch(
        &mut self,
        handles: &[DenseHandle],
        target: ArchetypeId,
        target_cids: &[ComponentId],
    ) -> usize {
        if handles.is_empty() {
            return 0;
        }
        let mut resolved = Vec::with_capacity(handles.len());
        let mut src_node = None;
        for &handle in handles {
            if let Ok(widx) = self.check_handle(handle) {
                let rec = self.entities[widx as usize];
                src_node.get_or_insert(rec.archetype_id);
                resolved.push((widx, rec.packed_id));
            }
        }
        let Some(src_node) = src_node else {
            return 0;
        };
        if src_node == target {
            return 0;
        }

        let src_mask = self.graph.node(src_node).mask;
        let mut target_mask = ArchetypeMask::empty();
        for &cid in target_cids {
            target_mask.set_bit(cid);
        }
        let common = src_mask.and(&target_mask);

        let dest_slots = self.allocate_batch(target, resolved.len());
        let pairs: Vec<(u64, u64)> = resolved
            .iter()
            .zip(dest_slots.iter())
            .map(|(&(_, src_packed), &(b, s))| (pack_id(b, s), src_packed))
            .collect();
        for cid in common.components() {
            self.registry.erased_mut(cid).override_batch(&pairs);
        }

        // Remove sources one at a time, re-reading each entity's *current*
        // packed id (an earlier removal in this same loop may have just
        // relocated it via swap-remove).
        for &(widx, _) in &resolved {
            let current_packed = self.entities[widx as usize].packed_id;
            let lid_packed = self.swap_remove_dense(src_node, current_packed);
            self.repair_after_swap_remove(lid_packed, current_packed);
        }

        for (i, &(widx, old_packed)) in resolved.iter().enumerate() {
            let (b, s) = dest_slots[i];
            let new_packed = pack_id(b, s);
            self.entities[widx as usize] = EntityRecord::new(new_packed, target, widx);
            self.location.insert(new_packed, widx);
            let handle = DenseHandle {
                widx,
                gen: self.generations[widx as usize],
            };
            self.emit(WorldEvent::DenseEntityMigrated {
                handle,
                old_packed_id: old_packed,
                last_packed_id: old_packed,
                old_arch: src_node,
                new_arch: target,
            });
        }
        resolved.len()
    }

    pub fn add_component(&mut self, handle: DenseHandle, cids: &[ComponentId]) -> Result<()> {
        let widx = self.check_handle(handle)?;
        let src_node = self.entities[widx as usize].archetype_id;
        let mut target_node = src_node;
        for &cid in cids {
            target_node = self.transition_add(target_node, cid);
        }
        if target_node == src_node {
            return Ok(());
        }
        self.migrate_entity(handle, target_node)?;
        self.emit(WorldEvent::DenseComponentAdded {
            handle,
            component_ids: cids.iter().copied().collect(),
        });
        Ok(())
    }

    pub fn remove_component(&mut self, handle: DenseHandle, cids: &[ComponentId]) -> Result<()> {
        let widx = self.check_handle(handle)?;
        let src_node = self.entities[widx as usize].archetype_id;
        let mut target_node = src_node;
        for &cid in cids {
            target_node = self.transition_remove(target_node, cid);
        }
        if target_node == src_node {
            return Ok(());
        }
        self.migrate_entity(handle, target_node)?;
        self.emit(WorldEvent::DenseComponentRemoved {
            handle,
            component_ids: cids.iter().copied().collect(),
        });
        Ok(())
    }

    // ---- sparse entity lifecycle --------------------------------------------

    fn sparse_record_mut(&mut self, id: usize) -> &mut SparseRecord {
        if id >= self.sparse_records.len() {
            self.sparse_records.resize(
                id + 1,
                SparseRecord {
                    id: 0,
                    mask: ArchetypeMask::empty(),
                },
            );
        }
        &mut self.sparse_records[id]
    }

    pub fn create_sparse_entity(&mut self, cids: &[ComponentId]) -> Result<SparseHandle> {
        let mask = self.mask_of(cids)?;
        let id = self.sparse.allocate();
        for &cid in cids {
            self.registry.erased_mut(cid).activate_sparse_bit(id);
        }
        *self.sparse_record_mut(id as usize) = SparseRecord { id, mask };
        let handle = SparseHandle {
            id,
            gen: self.sparse.generation(id),
            mask,
        };
        self.emit(WorldEvent::SparseEntityCreated { handle });
        Ok(handle)
    }

    pub fn delete_sparse_entity(&mut self, handle: SparseHandle) -> Result<()> {
        let id = self.check_sparse_handle(handle)?;
        let mask = self.sparse_records[id].mask;
        for cid in mask.components() {
            self.registry.erased_mut(cid).deactivate_sparse_bit(id as u32);
        }
        self.sparse.deallocate(id as u32);
        self.sparse_records[id] = SparseRecord {
            id: id as u32,
            mask: ArchetypeMask::empty(),
        };
        self.emit(WorldEvent::SparseEntityDestroyed { handle });
        Ok(())
    }

    pub fn add_component_sparse(
        &mut self,
        handle: SparseHandle,
        cids: &[ComponentId],
    ) -> Result<SparseHandle> {
        let id = self.check_sparse_handle(handle)?;
        let mut mask = self.sparse_records[id].mask;
        let mut added: SmallVec<[ComponentId; 8]> = SmallVec::new();
        for &cid in cids {
            if cid as usize >= self.registry.len() {
                return Err(EcsError::UnknownComponent(cid));
            }
            if !mask.has(cid) {
                mask.set_bit(cid);
                self.registry.erased_mut(cid).activate_sparse_bit(handle.id);
                added.push(cid);
            }
        }
        self.sparse_records[id].mask = mask;
        let new_handle = SparseHandle {
            id: handle.id,
            gen: handle.gen,
            mask,
        };
        if !added.is_empty() {
            self.emit(WorldEvent::SparseComponentAdded {
                handle: new_handle,
                component_ids: added,
            });
        }
        Ok(new_handle)
    }

    pub fn remove_component_sparse(
        &mut self,
        handle: SparseHandle,
        cids: &[ComponentId],
    ) -> Result<SparseHandle> {
        let id = self.check_sparse_handle(handle)?;
        let mut mask = self.sparse_records[id].mask;
        let mut removed: SmallVec<[ComponentId; 8]> = SmallVec::new();
        for &cid in cids {
            if mask.has(cid) {
                mask.unset_bit(cid);
                self.registry.erased_mut(cid).deactivate_sparse_bit(handle.id);
                removed.push(cid);
            }
        }
        self.sparse_records[id].mask = mask;
        let new_handle = SparseHandle {
            id: handle.id,
            gen: handle.gen,
            mask,
        };
        if !removed.is_empty() {
            self.emit(WorldEvent::SparseComponentRemoved {
                handle: new_handle,
                component_ids: removed,
            });
        }
        Ok(new_handle)
    }

    // ---- dense <-> sparse conversion ----------------------------------------

    pub fn make_dense(&mut self, handle: SparseHandle) -> Result<DenseHandle> {
        let id = self.check_sparse_handle(handle)?;
        let mask = self.sparse_records[id].mask;
        let node_id = self.node_for_mask(mask);
        let (block, slot) = self.reserve_slot(node_id);
        let dst_packed = pack_id(block, slot);
        for cid in mask.components() {
            self.registry.erased_mut(cid).densify(handle.id, dst_packed);
        }
        self.sparse.deallocate(handle.id);
        self.sparse_records[id] = SparseRecord {
            id: handle.id,
            mask: ArchetypeMask::empty(),
        };
        let widx = self.alloc_widx(dst_packed, node_id);
        self.location.insert(dst_packed, widx);
        let new_handle = DenseHandle {
            widx,
            gen: self.generations[widx as usize],
        };
        self.emit(WorldEvent::Densified {
            old_sparse: handle,
            new_dense: new_handle,
        });
        Ok(new_handle)
    }

    pub fn make_sparse(&mut self, handle: DenseHandle) -> Result<SparseHandle> {
        let widx = self.check_handle(handle)?;
        let rec = self.entities[widx as usize];
        let mask = self.graph.node(rec.archetype_id).mask;

        let sid = self.sparse.allocate();
        for cid in mask.components() {
            self.registry.erased_mut(cid).sparsify(sid, rec.packed_id);
        }

        let lid_packed = self.swap_remove_dense(rec.archetype_id, rec.packed_id);
        self.repair_after_swap_remove(lid_packed, rec.packed_id);
        self.recycle_widx(widx);

        *self.sparse_record_mut(sid as usize) = SparseRecord { id: sid, mask };
        let new_handle = SparseHandle {
            id: sid,
            gen: self.sparse.generation(sid),
            mask,
        };
        self.emit(WorldEvent::Sparsified {
            old_dense: handle,
            new_sparse: new_handle,
        });
        Ok(new_handle)
    }

    // ---- command buffers ------------------------------------------------

    pub fn create_command_buffer(&mut self) -> CommandBufferId {
        let id = self.command_buffers.len() as CommandBufferId;
        self.command_buffers.push(Some(CommandBuffer::new(id)));
        id
    }

    pub fn delete_entity_defer(&mut self, handle: DenseHandle, buffer_id: CommandBufferId) -> Result<()> {
        let widx = self.check_handle(handle)?;
        let archetype = self.entities[widx as usize].archetype_id;
        let buffer = self
            .command_buffers
            .get_mut(buffer_id as usize)
            .and_then(|b| b.as_mut())
            .ok_or(EcsError::UnknownCommandBuffer(buffer_id))?;
        buffer.delete(handle, archetype);
        Ok(())
    }

    pub fn migrate_entity_defer(
        &mut self,
        handle: DenseHandle,
        cids: &[ComponentId],
        buffer_id: CommandBufferId,
    ) -> Result<()> {
        let widx = self.check_handle(handle)?;
        let src_node = self.entities[widx as usize].archetype_id;
        let mut target_node = src_node;
        for &cid in cids {
            target_node = self.transition_add(target_node, cid);
        }
        let buffer = self
            .command_buffers
            .get_mut(buffer_id as usize)
            .and_then(|b| b.as_mut())
            .ok_or(EcsError::UnknownCommandBuffer(buffer_id))?;
        buffer.migrate(handle, src_node, target_node);
        Ok(())
    }

    /// Apply every command recorded against `buffer_id` and advance its
    /// recording generation.
    pub fn flush(&mut self, buffer_id: CommandBufferId) -> Result<()> {
        let mut cb = self
            .command_buffers
            .get_mut(buffer_id as usize)
            .ok_or(EcsError::UnknownCommandBuffer(buffer_id))?
            .take()
            .ok_or(EcsError::UnknownCommandBuffer(buffer_id))?;
        let (entities_processed, operation_count) = cb.flush(self);
        self.command_buffers[buffer_id as usize] = Some(cb);
        self.emit(WorldEvent::CommandBufferFlushed {
            buffer_id,
            entities_processed,
            operation_count,
        });
        Ok(())
    }

    // ---- component access ---------------------------------------------------

    pub fn get<T: Component>(&self, handle: DenseHandle, cid: ComponentId) -> Result<Option<&T>> {
        let widx = self.check_handle(handle)?;
        let packed = self.entities[widx as usize].packed_id;
        Ok(self.registry.column::<T>(cid).get(packed))
    }

    pub fn get_mut<T: Component>(&mut self, handle: DenseHandle, cid: ComponentId) -> Result<Option<&mut T>> {
        let widx = self.check_handle(handle)?;
        let packed = self.entities[widx as usize].packed_id;
        Ok(self.registry.column_mut::<T>(cid).get_mut(packed))
    }

    pub fn set<T: Component>(&mut self, handle: DenseHandle, cid: ComponentId, value: T) -> Result<()> {
        let widx = self.check_handle(handle)?;
        let packed = self.entities[widx as usize].packed_id;
        self.registry.column_mut::<T>(cid).set(packed, value);
        Ok(())
    }

    pub fn get_sparse<T: Component>(&self, handle: SparseHandle) -> Result<Option<&T>> {
        self.check_sparse_handle(handle)?;
        let cid = self
            .registry
            .id_of::<T>()
            .ok_or(EcsError::UnknownComponent(0))?;
        Ok(self.registry.column::<T>(cid).get_sparse(handle.id))
    }

    pub fn set_sparse<T: Component>(&mut self, handle: SparseHandle, cid: ComponentId, value: T) -> Result<()> {
        self.check_sparse_handle(handle)?;
        self.registry.column_mut::<T>(cid).set_sparse(handle.id, value);
        Ok(())
    }

    // ---- queries --------------------------------------------------------

    pub fn dense_query<'a>(&'a self, sig: &'a QuerySignature) -> impl Iterator<Item = DenseMatch> + 'a {
        query::dense_iter(&self.graph, &self.registry, sig)
    }

    pub fn sparse_query<'a>(&'a self, sig: &'a QuerySignature) -> Box<dyn Iterator<Item = SparseMatch> + 'a> {
        query::sparse_iter(&self.registry, sig)
    }

    pub fn count(&self, sig: &QuerySignature) -> usize {
        query::count(&self.graph, &self.registry, sig)
    }

    /// Refresh a [`CachedQuery`] against the current archetype graph,
    /// scanning only nodes created since its last refresh.
    pub fn refresh_cached_query(&self, cached: &mut CachedQuery) {
        cached.refresh(&self.graph);
    }

    /// Clear every change-tracking bit across every registered column. Call
    /// once per frame/tick boundary, after `Modified[..]` queries for that
    /// boundary have run.
    pub fn clear_all_changes(&mut self) {
        for cid in 0..self.registry.len() as ComponentId {
            self.registry.erased_mut(cid).clear_changes();
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos {
        x: i64,
        y: i64,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Vel {
        dx: i64,
        dy: i64,
    }

    #[test]
    fn create_and_read_entity() {
        let mut w = World::new();
        let pos = w.register_component::<Pos>(false, "Pos").unwrap();
        let h = w.create_entity(&[pos]).unwrap();
        w.set(h, pos, Pos { x: 1, y: 2 }).unwrap();
        assert_eq!(w.get::<Pos>(h, pos).unwrap(), Some(&Pos { x: 1, y: 2 }));
        assert_eq!(w.entity_count(), 1);
    }

    #[test]
    fn delete_recycles_widx_and_bumps_generation() {
        let mut w = World::new();
        let pos = w.register_component::<Pos>(false, "Pos").unwrap();
        let a = w.create_entity(&[pos]).unwrap();
        w.delete_entity(a).unwrap();
        assert_eq!(w.entity_count(), 0);
        assert_eq!(w.get::<Pos>(a, pos), Err(EcsError::StaleHandle));
        let b = w.create_entity(&[pos]).unwrap();
        assert_eq!(b.widx, a.widx);
        assert_ne!(b.gen, a.gen);
    }

    #[test]
    fn swap_remove_preserves_remaining_entity_data() {
        let mut w = World::new();
        let pos = w.register_component::<Pos>(false, "Pos").unwrap();
        let a = w.create_entity(&[pos]).unwrap();
        let b = w.create_entity(&[pos]).unwrap();
        w.set(a, pos, Pos { x: 1, y: 1 }).unwrap();
        w.set(b, pos, Pos { x: 2, y: 2 }).unwrap();
        w.delete_entity(a).unwrap();
        assert_eq!(w.get::<Pos>(b, pos).unwrap(), Some(&Pos { x: 2, y: 2 }));
    }

    #[test]
    fn add_component_migrates_and_preserves_shared_fields() {
        let mut w = World::new();
        let pos = w.register_component::<Pos>(false, "Pos").unwrap();
        let vel = w.register_component::<Vel>(false, "Vel").unwrap();
        let h = w.create_entity(&[pos]).unwrap();
        w.set(h, pos, Pos { x: 5, y: 6 }).unwrap();
        w.add_component(h, &[vel]).unwrap();
        w.set(h, vel, Vel { dx: 1, dy: 0 }).unwrap();
        assert_eq!(w.get::<Pos>(h, pos).unwrap(), Some(&Pos { x: 5, y: 6 }));
        assert_eq!(w.get::<Vel>(h, vel).unwrap(), Some(&Vel { dx: 1, dy: 0 }));
    }

    #[test]
    fn add_component_already_present_is_a_silent_no_op() {
        let mut w = World::new();
        let pos = w.register_component::<Pos>(false, "Pos").unwrap();
        let h = w.create_entity(&[pos]).unwrap();
        assert!(w.add_component(h, &[pos]).is_ok());
    }

    #[test]
    fn sparse_roundtrip_add_remove() {
        let mut w = World::new();
        let pos = w.register_component::<Pos>(false, "Pos").unwrap();
        let h = w.create_sparse_entity(&[pos]).unwrap();
        w.set_sparse(h, pos, Pos { x: 9, y: 9 }).unwrap();
        assert_eq!(w.get_sparse::<Pos>(h).unwrap(), Some(&Pos { x: 9, y: 9 }));
        w.delete_sparse_entity(h).unwrap();
        assert_eq!(w.get_sparse::<Pos>(h), Err(EcsError::StaleHandle));
    }

    #[test]
    fn make_dense_then_make_sparse_preserves_value() {
        let mut w = World::new();
        let pos = w.register_component::<Pos>(false, "Pos").unwrap();
        let sparse = w.create_sparse_entity(&[pos]).unwrap();
        w.set_sparse(sparse, pos, Pos { x: 3, y: 4 }).unwrap();
        let dense = w.make_dense(sparse).unwrap();
        assert_eq!(w.get::<Pos>(dense, pos).unwrap(), Some(&Pos { x: 3, y: 4 }));
        let back = w.make_sparse(dense).unwrap();
        assert_eq!(w.get_sparse::<Pos>(back).unwrap(), Some(&Pos { x: 3, y: 4 }));
    }

    #[test]
    fn batch_migrate_preserves_all_values() {
        let mut w = World::new();
        let pos = w.register_component::<Pos>(false, "Pos").unwrap();
        let vel = w.register_component::<Vel>(false, "Vel").unwrap();
        let handles = w.create_entities(4, &[pos]).unwrap();
        for (i, &h) in handles.iter().enumerate() {
            w.set(h, pos, Pos { x: i as i64, y: 0 }).unwrap();
        }
        for &h in &handles {
            w.add_component(h, &[vel]).unwrap();
        }
        for (i, &h) in handles.iter().enumerate() {
            assert_eq!(w.get::<Pos>(h, pos).unwrap(), Some(&Pos { x: i as i64, y: 0 }));
        }
    }

    #[test]
    fn deferred_delete_flushes_via_command_buffer() {
        let mut w = World::new();
        let pos = w.register_component::<Pos>(false, "Pos").unwrap();
        let h = w.create_entity(&[pos]).unwrap();
        let cb = w.create_command_buffer();
        w.delete_entity_defer(h, cb).unwrap();
        assert_eq!(w.entity_count(), 1);
        let processed = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let processed2 = processed.clone();
        w.subscribe(WorldEventKind::CommandBufferFlushed, move |ev| {
            if let WorldEvent::CommandBufferFlushed { entities_processed, .. } = ev {
                processed2.store(*entities_processed, std::sync::atomic::Ordering::SeqCst);
            }
        });
        w.flush(cb).unwrap();
        assert_eq!(w.entity_count(), 0);
        assert_eq!(processed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn dense_and_sparse_queries_see_matching_entities() {
        let mut w = World::new();
        let pos = w.register_component::<Pos>(false, "Pos").unwrap();
        w.create_entity(&[pos]).unwrap();
        w.create_sparse_entity(&[pos]).unwrap();
        let sig = crate::query::QueryBuilder::new().include(pos).build();
        assert_eq!(w.count(&sig), 2);
    }
}
