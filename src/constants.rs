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

//! Tunable constants for the store.
//!
//! These are compile-time constants rather than a runtime configuration
//! surface: the core has no persisted configuration format (see the crate's
//! design notes on scope), so changing any of these means rebuilding.

/// Number of slots per fragment block. Must be a power of two.
///
/// `BLK_SHIFT`/`BLK_MASK` below are derived from this value and assume the
/// power-of-two invariant; nothing in the store re-validates it at runtime.
pub const BLK_SIZE: usize = 4096;

/// `log2(BLK_SIZE)`, used to turn a slot index into `(block, offset)` with a
/// shift instead of a division.
pub const BLK_SHIFT: u32 = BLK_SIZE.trailing_zeros();

/// Mask for the low bits of a slot index, i.e. `BLK_SIZE - 1`.
pub const BLK_MASK: usize = BLK_SIZE - 1;

/// Upper bound on distinct registered component types.
///
/// Archetype masks are fixed-width bitmasks of `MAX_COMPONENTS` bits; this
/// value governs both the mask word count and the size of the graph's
/// adjacency arrays.
pub const MAX_COMPONENTS: usize = 256;

/// Bits per bitset word.
pub const WORD_BITS: usize = 64;

/// Number of `u64` words needed to hold `MAX_COMPONENTS` bits.
pub const MAX_COMPONENT_LAYER: usize = MAX_COMPONENTS / WORD_BITS;

/// Number of buckets in a command buffer's open-addressed dispatch table.
///
/// Must be a power of two so that `hash & (MAP_CAPACITY - 1)` is a valid
/// bucket index without a modulo.
pub const MAP_CAPACITY: usize = 16384;

const _: () = assert!(BLK_SIZE.is_power_of_two());
const _: () = assert!(MAX_COMPONENTS % WORD_BITS == 0);
const _: () = assert!(MAP_CAPACITY.is_power_of_two());

/// Split a dense slot index into `(block_index, offset_in_block)`.
#[inline]
pub const fn split_slot(slot: usize) -> (usize, usize) {
    (slot >> BLK_SHIFT, slot & BLK_MASK)
}

/// Recombine a `(block_index, offset_in_block)` pair into a flat slot index.
#[inline]
pub const fn join_slot(block_index: usize, offset: usize) -> usize {
    (block_index << BLK_SHIFT) | offset
}

/// Pack a `(block_index, slot_in_block)` pair into the 64-bit addressing
/// scheme used throughout the store: `(block_index << 32) | slot_in_block`.
#[inline]
pub const fn pack_id(block_index: u32, slot_in_block: u32) -> u64 {
    ((block_index as u64) << 32) | (slot_in_block as u64)
}

/// Inverse of [`pack_id`]: `(block_index, slot_in_block)`.
#[inline]
pub const fn unpack_id(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_join_roundtrip() {
        for slot in [0usize, 1, BLK_SIZE - 1, BLK_SIZE, BLK_SIZE * 3 + 17] {
            let (b, o) = split_slot(slot);
            assert_eq!(join_slot(b, o), slot);
        }
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let packed = pack_id(7, 4095);
        assert_eq!(unpack_id(packed), (7, 4095));
    }
}
