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

//! Block-structured column storage for a single component type.
//!
//! A [`FragmentVector<T>`] owns every live `T` value across every archetype,
//! addressed through two independent views over the same block storage: a
//! dense view (blocks indexed by the partition allocator) and a sparse view
//! (blocks indexed by `id / BLK_SIZE`). Both views share the occupancy/change
//! bitmap machinery from [`crate::bitset`].

use rustc_hash::FxHashMap;

use crate::bitset::{HiBitset, SparseHiBitset};
use crate::constants::{split_slot, unpack_id, BLK_SIZE};

type ReadHook<T> = Box<dyn Fn(&T) -> T + Send + Sync>;
type WriteHook<T> = Box<dyn Fn(T) -> T + Send + Sync>;

/// One `BLK_SIZE`-slot run of a component's dense or sparse storage.
type Block<T> = Box<[Option<T>]>;

fn new_block<T>() -> Block<T> {
    let mut v = Vec::with_capacity(BLK_SIZE);
    v.resize_with(BLK_SIZE, || None);
    v.into_boxed_slice()
}

/// Owns all storage for one component type, across every archetype and both
/// the dense and sparse views.
pub struct FragmentVector<T> {
    dense_blocks: Vec<Block<T>>,
    dense_occupancy: HiBitset,
    dense_change: Option<HiBitset>,

    sparse_blocks: FxHashMap<u32, Block<T>>,
    sparse_occupancy: SparseHiBitset,
    sparse_change: Option<SparseHiBitset>,

    read_hook: Option<ReadHook<T>>,
    write_hook: Option<WriteHook<T>>,
}

impl<T> FragmentVector<T> {
    pub fn new(change_tracking: bool) -> Self {
        Self {
            dense_blocks: Vec::new(),
            dense_occupancy: HiBitset::new(),
            dense_change: change_tracking.then(HiBitset::new),
            sparse_blocks: FxHashMap::default(),
            sparse_occupancy: SparseHiBitset::new(),
            sparse_change: change_tracking.then(SparseHiBitset::new),
            read_hook: None,
            write_hook: None,
        }
    }

    pub fn with_hooks(
        change_tracking: bool,
        read_hook: Option<ReadHook<T>>,
        write_hook: Option<WriteHook<T>>,
    ) -> Self {
        let mut fv = Self::new(change_tracking);
        fv.read_hook = read_hook;
        fv.write_hook = write_hook;
        fv
    }

    pub fn is_change_tracked(&self) -> bool {
        self.dense_change.is_some()
    }

    // ---- dense view -----------------------------------------------------

    pub fn new_block_at(&mut self, block_idx: u32) {
        let idx = block_idx as usize;
        if idx >= self.dense_blocks.len() {
            self.dense_blocks.resize_with(idx + 1, new_block::<T>);
        }
    }

    pub fn resize(&mut self, n_blocks: u32) {
        let n = n_blocks as usize;
        if n > self.dense_blocks.len() {
            self.dense_blocks.resize_with(n, new_block::<T>);
        }
    }

    pub fn dense_block_count(&self) -> u32 {
        self.dense_blocks.len() as u32
    }

    fn dense_slot(&self, packed_id: u64) -> (u32, u32) {
        unpack_id(packed_id)
    }

    pub fn get(&self, packed_id: u64) -> Option<&T> {
        let (block, offset) = self.dense_slot(packed_id);
        self.dense_blocks
            .get(block as usize)
            .and_then(|b| b[offset as usize].as_ref())
    }

    pub fn set(&mut self, packed_id: u64, value: T) {
        let (block, offset) = self.dense_slot(packed_id);
        let value = match &self.write_hook {
            Some(hook) => hook(value),
            None => value,
        };
        self.dense_blocks[block as usize][offset as usize] = Some(value);
        self.activate_bit(packed_id);
        self.mark_dense_changed(packed_id);
    }

    pub fn get_tracked(&self, packed_id: u64) -> Option<T>
    where
        T: Clone,
    {
        self.get(packed_id).map(|v| match &self.read_hook {
            Some(hook) => hook(v),
            None => v.clone(),
        })
    }

    pub fn get_mut(&mut self, packed_id: u64) -> Option<&mut T> {
        let (block, offset) = self.dense_slot(packed_id);
        self.mark_dense_changed(packed_id);
        self.dense_blocks
            .get_mut(block as usize)
            .and_then(|b| b[offset as usize].as_mut())
    }

    /// Field-wise copy of the value at `src_packed_id` onto `dst_packed_id`;
    /// used by swap-remove and single-entity migration.
    pub fn override_slot(&mut self, dst_packed_id: u64, src_packed_id: u64)
    where
        T: Clone,
    {
        let src_val = self.get(src_packed_id).cloned();
        let (db, doff) = self.dense_slot(dst_packed_id);
        self.dense_blocks[db as usize][doff as usize] = src_val;
        match src_val_is_some(&self.dense_blocks[db as usize][doff as usize]) {
            true => self.activate_bit(dst_packed_id),
            false => self.deactivate_bit(dst_packed_id),
        }
    }

    /// Batch form of [`Self::override_slot`]: copies `src[i] -> dst[i]` for
    /// every pair. Handle-table repair for the batch happens one level up,
    /// in the partition allocator, so this stays a pure data operation.
    pub fn override_batch(&mut self, pairs: &[(u64, u64)])
    where
        T: Clone,
    {
        for &(dst, src) in pairs {
            self.override_slot(dst, src);
        }
    }

    pub fn activate_bit(&mut self, packed_id: u64) {
        let idx = Self::dense_flat_index(packed_id);
        self.dense_occupancy.set(idx);
    }

    pub fn deactivate_bit(&mut self, packed_id: u64) {
        let idx = Self::dense_flat_index(packed_id);
        self.dense_occupancy.unset(idx);
        let (block, offset) = self.dense_slot(packed_id);
        self.dense_blocks[block as usize][offset as usize] = None;
    }

    fn dense_flat_index(packed_id: u64) -> usize {
        let (block, offset) = unpack_id(packed_id);
        block as usize * BLK_SIZE + offset as usize
    }

    fn mark_dense_changed(&mut self, packed_id: u64) {
        if let Some(change) = &mut self.dense_change {
            change.set(Self::dense_flat_index(packed_id));
        }
    }

    /// The occupancy words covering `block_idx`, i.e. the `BLK_SIZE / 64`
    /// layer-0 words at `[block_idx * BLK_SIZE/64, ...)`.
    pub fn get_block_mask(&self, block_idx: u32) -> Vec<u64> {
        let words_per_block = BLK_SIZE / 64;
        let base = block_idx as usize * words_per_block;
        (0..words_per_block)
            .map(|i| self.dense_occupancy.word(base + i))
            .collect()
    }

    pub fn get_change_mask(&self, block_idx: u32) -> Option<Vec<u64>> {
        self.dense_change.as_ref().map(|change| {
            let words_per_block = BLK_SIZE / 64;
            let base = block_idx as usize * words_per_block;
            (0..words_per_block).map(|i| change.word(base + i)).collect()
        })
    }

    pub fn clear_changes(&mut self) {
        if let Some(change) = &mut self.dense_change {
            change.clear();
        }
        if let Some(change) = &mut self.sparse_change {
            change.clear();
        }
    }

    pub fn dense_occupancy(&self) -> &HiBitset {
        &self.dense_occupancy
    }

    pub fn dense_change(&self) -> Option<&HiBitset> {
        self.dense_change.as_ref()
    }

    // ---- sparse view ------------------------------------------------------

    fn sparse_base(id: u32) -> u32 {
        (id as usize / BLK_SIZE) as u32
    }

    pub fn new_sparse_block(&mut self, id_base: u32, initial_mask: u64) {
        let block = self
            .sparse_blocks
            .entry(id_base)
            .or_insert_with(new_block::<T>);
        let _ = (block, initial_mask);
    }

    pub fn new_sparse_blocks(&mut self, bases: &[u32]) {
        for &base in bases {
            self.new_sparse_block(base, 0);
        }
    }

    pub fn set_sparse(&mut self, id: u32, value: T) {
        let base = Self::sparse_base(id);
        self.new_sparse_block(base, 0);
        let offset = id as usize % BLK_SIZE;
        let value = match &self.write_hook {
            Some(hook) => hook(value),
            None => value,
        };
        self.sparse_blocks.get_mut(&base).unwrap()[offset] = Some(value);
        self.activate_sparse_bit(id);
        self.mark_sparse_changed(id);
    }

    pub fn get_sparse(&self, id: u32) -> Option<&T> {
        let base = Self::sparse_base(id);
        let offset = id as usize % BLK_SIZE;
        self.sparse_blocks.get(&base).and_then(|b| b[offset].as_ref())
    }

    pub fn get_sparse_mut(&mut self, id: u32) -> Option<&mut T> {
        let base = Self::sparse_base(id);
        let offset = id as usize % BLK_SIZE;
        self.mark_sparse_changed(id);
        self.sparse_blocks
            .get_mut(&base)
            .and_then(|b| b[offset].as_mut())
    }

    /// Marks slot `id` occupied. Mirrors [`Self::activate_bit`]: activation
    /// alone never marks a change, so a freshly created entity doesn't match
    /// a `Modified` query before anything writes to it.
    pub fn activate_sparse_bit(&mut self, id: u32) {
        self.sparse_occupancy.set(id as usize);
    }

    fn mark_sparse_changed(&mut self, id: u32) {
        if let Some(change) = &mut self.sparse_change {
            change.set(id as usize);
        }
    }

    pub fn activate_sparse_bits(&mut self, ids: &[u32]) {
        for &id in ids {
            self.activate_sparse_bit(id);
        }
    }

    pub fn deactivate_sparse_bit(&mut self, id: u32) {
        self.sparse_occupancy.unset(id as usize);
        let base = Self::sparse_base(id);
        let offset = id as usize % BLK_SIZE;
        if let Some(block) = self.sparse_blocks.get_mut(&base) {
            block[offset] = None;
        }
    }

    pub fn deactivate_sparse_bits(&mut self, ids: &[u32]) {
        for &id in ids {
            self.deactivate_sparse_bit(id);
        }
    }

    pub fn get_sparse_mask(&self) -> &SparseHiBitset {
        &self.sparse_occupancy
    }

    pub fn get_sparse_change_mask(&self) -> Option<&SparseHiBitset> {
        self.sparse_change.as_ref()
    }

    /// Moves the value at sparse slot `id` into dense slot `dst_packed_id`,
    /// vacating the sparse slot. A no-op if `id` holds nothing (the caller's
    /// archetype didn't carry this component).
    pub fn densify(&mut self, id: u32, dst_packed_id: u64) {
        let base = Self::sparse_base(id);
        let offset = id as usize % BLK_SIZE;
        let taken = self
            .sparse_blocks
            .get_mut(&base)
            .and_then(|b| b[offset].take());
        self.deactivate_sparse_bit(id);
        if let Some(value) = taken {
            self.set(dst_packed_id, value);
        }
    }

    /// Moves the value at dense slot `src_packed_id` into sparse slot `id`,
    /// vacating the dense slot. A no-op if the dense slot holds nothing.
    pub fn sparsify(&mut self, id: u32, src_packed_id: u64) {
        let (block, offset) = self.dense_slot(src_packed_id);
        let taken = self
            .dense_blocks
            .get_mut(block as usize)
            .and_then(|b| b[offset as usize].take());
        self.deactivate_bit(src_packed_id);
        if let Some(value) = taken {
            self.set_sparse(id, value);
        }
    }
}

fn src_val_is_some<T>(slot: &Option<T>) -> bool {
    slot.is_some()
}
