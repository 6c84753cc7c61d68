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

//! The component trait, the type-erased column registry, and `Bundle`
//! tuples for multi-component spawn calls.
//!
//! The registry never inspects a component's field layout. Every
//! layout-specific operation — block growth, slot override, occupancy bits —
//! lives behind the [`ErasedColumn`] trait object, which is this crate's
//! realization of "the registry only ever needs opaque function pointers":
//! a trait object's vtable *is* a struct of function pointers, generated for
//! `FragmentVector<T>` by the compiler at the `register::<T>` call site
//! rather than by a proc-macro.

use std::any::{Any, TypeId};

use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

use crate::bitset::SparseHiBitset;
use crate::fragment::FragmentVector;

/// Dense integer in `[0, MAX_COMPONENTS)`, assigned by registration order.
pub type ComponentId = u16;

/// Maximum number of components a `Bundle` tuple may carry.
pub const MAX_BUNDLE_COMPONENTS: usize = 8;

/// Marker trait for registrable component types.
pub trait Component: 'static + Send + Sync + Clone {}

impl<T: 'static + Send + Sync + Clone> Component for T {}

/// Describes how a component's fields would be split across parallel arrays.
///
/// The registry itself never reads this — it exists so a caller can declare
/// an explicit SoA decomposition for tooling (e.g. codegen, introspection)
/// without the registry needing compile-time reflection to discover it.
#[derive(Debug, Clone, Default)]
pub struct SoaLayout {
    pub fields: Vec<(&'static str, &'static str)>,
}

impl SoaLayout {
    pub fn opaque() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: &'static str, ty: &'static str) -> Self {
        self.fields.push((name, ty));
        self
    }
}

/// Type-erased per-op thunk table over one component's [`FragmentVector`].
///
/// Implemented generically for every `FragmentVector<T>`; the registry only
/// ever holds `Box<dyn ErasedColumn>`.
pub trait ErasedColumn: Send + Sync {
    fn new_block_at(&mut self, block_idx: u32);
    fn resize(&mut self, n_blocks: u32);
    fn new_sparse_block(&mut self, id_base: u32, initial_mask: u64);
    fn new_sparse_blocks(&mut self, bases: &[u32]);
    fn override_slot(&mut self, dst_packed_id: u64, src_packed_id: u64);
    fn override_batch(&mut self, pairs: &[(u64, u64)]);
    fn activate_bit(&mut self, packed_id: u64);
    fn deactivate_bit(&mut self, packed_id: u64);
    fn activate_sparse_bit(&mut self, id: u32);
    fn activate_sparse_bits(&mut self, ids: &[u32]);
    fn deactivate_sparse_bit(&mut self, id: u32);
    fn deactivate_sparse_bits(&mut self, ids: &[u32]);
    fn get_block_mask(&self, block_idx: u32) -> Vec<u64>;
    fn get_change_mask(&self, block_idx: u32) -> Option<Vec<u64>>;
    fn get_sparse_mask(&self) -> &SparseHiBitset;
    fn get_sparse_change_mask(&self) -> Option<&SparseHiBitset>;
    fn clear_changes(&mut self);
    fn is_change_tracked(&self) -> bool;
    fn dense_block_count(&self) -> u32;
    fn densify(&mut self, id: u32, dst_packed_id: u64);
    fn sparsify(&mut self, id: u32, src_packed_id: u64);

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Component> ErasedColumn for FragmentVector<T> {
    fn new_block_at(&mut self, block_idx: u32) {
        FragmentVector::new_block_at(self, block_idx)
    }

    fn resize(&mut self, n_blocks: u32) {
        FragmentVector::resize(self, n_blocks)
    }

    fn new_sparse_block(&mut self, id_base: u32, initial_mask: u64) {
        FragmentVector::new_sparse_block(self, id_base, initial_mask)
    }

    fn new_sparse_blocks(&mut self, bases: &[u32]) {
        FragmentVector::new_sparse_blocks(self, bases)
    }

    fn override_slot(&mut self, dst_packed_id: u64, src_packed_id: u64) {
        FragmentVector::override_slot(self, dst_packed_id, src_packed_id)
    }

    fn override_batch(&mut self, pairs: &[(u64, u64)]) {
        FragmentVector::override_batch(self, pairs)
    }

    fn activate_bit(&mut self, packed_id: u64) {
        FragmentVector::activate_bit(self, packed_id)
    }

    fn deactivate_bit(&mut self, packed_id: u64) {
        FragmentVector::deactivate_bit(self, packed_id)
    }

    fn activate_sparse_bit(&mut self, id: u32) {
        FragmentVector::activate_sparse_bit(self, id)
    }

    fn activate_sparse_bits(&mut self, ids: &[u32]) {
        FragmentVector::activate_sparse_bits(self, ids)
    }

    fn deactivate_sparse_bit(&mut self, id: u32) {
        FragmentVector::deactivate_sparse_bit(self, id)
    }

    fn deactivate_sparse_bits(&mut self, ids: &[u32]) {
        FragmentVector::deactivate_sparse_bits(self, ids)
    }

    fn get_block_mask(&self, block_idx: u32) -> Vec<u64> {
        FragmentVector::get_block_mask(self, block_idx)
    }

    fn get_change_mask(&self, block_idx: u32) -> Option<Vec<u64>> {
        FragmentVector::get_change_mask(self, block_idx)
    }

    fn get_sparse_mask(&self) -> &SparseHiBitset {
        FragmentVector::get_sparse_mask(self)
    }

    fn get_sparse_change_mask(&self) -> Option<&SparseHiBitset> {
        FragmentVector::get_sparse_change_mask(self)
    }

    fn clear_changes(&mut self) {
        FragmentVector::clear_changes(self)
    }

    fn is_change_tracked(&self) -> bool {
        FragmentVector::is_change_tracked(self)
    }

    fn dense_block_count(&self) -> u32 {
        FragmentVector::dense_block_count(self)
    }

    fn densify(&mut self, id: u32, dst_packed_id: u64) {
        FragmentVector::densify(self, id, dst_packed_id)
    }

    fn sparsify(&mut self, id: u32, src_packed_id: u64) {
        FragmentVector::sparsify(self, id, src_packed_id)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Registration-order record: stable integer id, stable name, erased column.
pub struct ComponentRegistry {
    columns: Vec<Box<dyn ErasedColumn>>,
    ids_by_type: FxHashMap<TypeId, ComponentId>,
    ids_by_name: FxHashMap<&'static str, ComponentId>,
    names: Vec<&'static str>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            ids_by_type: FxHashMap::default(),
            ids_by_name: FxHashMap::default(),
            names: Vec::new(),
        }
    }

    /// Register `T`, assigning the next free component id. Returns the
    /// existing id if `T` is already registered (idempotent, matching the
    /// "duplicate registration" contract-violation in the teacher's lineage
    /// being relaxed to idempotence here since nothing observable differs).
    pub fn register<T: Component>(&mut self, change_tracking: bool, name: &'static str) -> ComponentId {
        let ty = TypeId::of::<T>();
        if let Some(&id) = self.ids_by_type.get(&ty) {
            return id;
        }
        let id = self.columns.len() as ComponentId;
        self.columns
            .push(Box::new(FragmentVector::<T>::new(change_tracking)));
        self.ids_by_type.insert(ty, id);
        self.ids_by_name.insert(name, id);
        self.names.push(name);
        id
    }

    pub fn id_of<T: Component>(&self) -> Option<ComponentId> {
        self.ids_by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn id_by_name(&self, name: &str) -> Option<ComponentId> {
        self.ids_by_name.get(name).copied()
    }

    pub fn name_of(&self, id: ComponentId) -> &'static str {
        self.names[id as usize]
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column<T: Component>(&self, id: ComponentId) -> &FragmentVector<T> {
        self.columns[id as usize]
            .as_any()
            .downcast_ref()
            .expect("component id resolves to a mismatched column type")
    }

    pub fn column_mut<T: Component>(&mut self, id: ComponentId) -> &mut FragmentVector<T> {
        self.columns[id as usize]
            .as_any_mut()
            .downcast_mut()
            .expect("component id resolves to a mismatched column type")
    }

    pub fn erased(&self, id: ComponentId) -> &dyn ErasedColumn {
        self.columns[id as usize].as_ref()
    }

    pub fn erased_mut(&mut self, id: ComponentId) -> &mut dyn ErasedColumn {
        self.columns[id as usize].as_mut()
    }

    pub fn erased_pair_mut(
        &mut self,
        a: ComponentId,
        b: ComponentId,
    ) -> (&mut dyn ErasedColumn, &mut dyn ErasedColumn) {
        assert_ne!(a, b, "erased_pair_mut requires distinct component ids");
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (left, right) = self.columns.split_at_mut(hi as usize);
        let lo_ref = left[lo as usize].as_mut();
        let hi_ref = right[0].as_mut();
        if a < b {
            (lo_ref, hi_ref)
        } else {
            (hi_ref, lo_ref)
        }
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A group of component types spawned together via `World::create_entity`.
pub trait Bundle: Send + Sync + 'static {
    fn component_ids(registry: &mut ComponentRegistry) -> SmallVec<[ComponentId; MAX_BUNDLE_COMPONENTS]>
    where
        Self: Sized;

    fn write_into(self, world: &mut crate::world::World, packed_id: u64)
    where
        Self: Sized;
}

macro_rules! impl_bundle {
    ($($T:ident),* $(,)?) => {
        impl<$($T: Component),*> Bundle for ($($T,)*) {
            fn component_ids(registry: &mut ComponentRegistry) -> SmallVec<[ComponentId; MAX_BUNDLE_COMPONENTS]> {
                // `type_name` rather than a positional letter: a bundle's
                // tuple position carries no naming information, and reusing
                // "A"/"B"/... across distinct types would collide in
                // `ids_by_name` the moment two bundles share a position.
                smallvec![$(registry.register::<$T>(false, std::any::type_name::<$T>())),*]
            }

            #[allow(non_snake_case)]
            fn write_into(self, world: &mut crate::world::World, packed_id: u64) {
                let ($($T,)*) = self;
                $(
                    let id = world.registry.id_of::<$T>().expect("registered by component_ids");
                    world.registry.column_mut::<$T>(id).set(packed_id, $T);
                )*
            }
        }
    };
}

impl_bundle!(A);
impl_bundle!(A, B);
impl_bundle!(A, B, C);
impl_bundle!(A, B, C, D);
impl_bundle!(A, B, C, D, E);
impl_bundle!(A, B, C, D, E, F);
impl_bundle!(A, B, C, D, E, F, G);
impl_bundle!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos {
        x: i64,
        y: i64,
    }

    #[test]
    fn register_is_idempotent() {
        let mut reg = ComponentRegistry::new();
        let a = reg.register::<Pos>(false, "Pos");
        let b = reg.register::<Pos>(false, "Pos");
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn column_roundtrip() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Pos>(false, "Pos");
        let packed = crate::constants::pack_id(0, 0);
        reg.column_mut::<Pos>(id).new_block_at(0);
        reg.column_mut::<Pos>(id).set(packed, Pos { x: 1, y: 2 });
        assert_eq!(reg.column::<Pos>(id).get(packed), Some(&Pos { x: 1, y: 2 }));
    }
}
