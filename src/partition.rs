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

//! Zones and partitions: the dense-packing bookkeeping for one archetype.
//!
//! The allocate/swap-remove/migrate *operations* over a [`Partition`] live on
//! [`crate::world::World`] (they need the component registry and the entity
//! handle table in the same breath as the zone list), but the data shape
//! itself — zones packed from `start` upward, exactly one partially-filled
//! zone at `fill_index` — is self-contained and lives here.

use smallvec::SmallVec;

use crate::constants::BLK_SIZE;

/// A contiguous `(block, [start, end))` sub-range of entity slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    pub block_index: u32,
    pub start: u32,
    pub end: u32,
}

impl Zone {
    pub fn new(block_index: u32, start: u32) -> Self {
        Self {
            block_index,
            start,
            end: start,
        }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn is_full(&self) -> bool {
        self.end == BLK_SIZE as u32
    }

    pub fn remaining(&self) -> u32 {
        BLK_SIZE as u32 - self.end
    }
}

/// The set of zones storing one archetype's dense entities.
#[derive(Debug, Default)]
pub struct Partition {
    pub zones: SmallVec<[Zone; 4]>,
    /// Index into `zones` of the currently-filling zone; equals
    /// `zones.len()` when every zone so far is full and a new one is needed.
    pub fill_index: usize,
}

impl Partition {
    pub fn new() -> Self {
        Self {
            zones: SmallVec::new(),
            fill_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.zones.iter().map(|z| z.len() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fill_zone(&self) -> Option<&Zone> {
        self.zones.get(self.fill_index)
    }

    pub fn fill_zone_mut(&mut self) -> Option<&mut Zone> {
        self.zones.get_mut(self.fill_index)
    }

    pub fn needs_new_zone(&self) -> bool {
        self.fill_index >= self.zones.len()
    }

    /// Push a new zone bound to `block_index`, becoming the fill zone.
    pub fn push_zone(&mut self, block_index: u32) {
        debug_assert_eq!(self.fill_index, self.zones.len());
        self.zones.push(Zone::new(block_index, 0));
    }

    /// Reserve the next slot in the fill zone, advancing `fill_index` if the
    /// zone becomes full. Returns `(block_index, slot_in_block)`.
    pub fn reserve_one(&mut self) -> (u32, u32) {
        let zone = self.zones[self.fill_index];
        let slot = zone.end;
        self.zones[self.fill_index].end += 1;
        if self.zones[self.fill_index].is_full() {
            self.fill_index += 1;
        }
        (zone.block_index, slot)
    }

    /// The packed id of the last live slot in the fill zone, i.e. the entity
    /// a swap-remove would relocate.
    pub fn last_live_packed(&self) -> Option<(u32, u32)> {
        let zone = self.zones.get(self.fill_index)?;
        if zone.is_empty() {
            // Fill zone just advanced past a freshly-filled predecessor.
            let prev = self.fill_index.checked_sub(1)?;
            let z = self.zones.get(prev)?;
            if z.is_empty() {
                return None;
            }
            return Some((z.block_index, z.end - 1));
        }
        Some((zone.block_index, zone.end - 1))
    }

    /// Shrink the fill zone by one, i.e. undo the last `reserve_one`.
    pub fn pop_one(&mut self) {
        if self.zones[self.fill_index].is_empty() {
            self.fill_index -= 1;
        }
        debug_assert!(self.zones[self.fill_index].end > self.zones[self.fill_index].start);
        self.zones[self.fill_index].end -= 1;
    }

    #[cfg(test)]
    pub(crate) fn invariant_holds(&self) -> bool {
        for (i, z) in self.zones.iter().enumerate() {
            if i < self.fill_index && !z.is_full() {
                return false;
            }
            if i == self.fill_index && z.is_full() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_fills_zone_then_advances() {
        let mut p = Partition::new();
        p.push_zone(0);
        for _ in 0..BLK_SIZE {
            p.reserve_one();
        }
        assert_eq!(p.fill_index, 1);
        assert!(p.invariant_holds());
    }

    #[test]
    fn pop_one_undoes_reserve() {
        let mut p = Partition::new();
        p.push_zone(0);
        p.reserve_one();
        p.reserve_one();
        p.pop_one();
        assert_eq!(p.len(), 1);
        assert!(p.invariant_holds());
    }

    #[test]
    fn pop_one_crosses_zone_boundary() {
        let mut p = Partition::new();
        p.push_zone(0);
        for _ in 0..BLK_SIZE {
            p.reserve_one();
        }
        p.push_zone(1);
        p.reserve_one();
        p.pop_one();
        // The fill zone now holds zero entries but stays the fill zone: an
        // empty zone at fill_index is exactly the invariant's allowance for
        // "the one zone currently being filled".
        assert_eq!(p.fill_index, 1);
        assert_eq!(p.zones[1].len(), 0);
        assert!(p.zones[0].is_full());
        assert!(p.invariant_holds());

        // Popping again must cross back into the previous zone, since the
        // fill zone itself has nothing left to give up.
        p.pop_one();
        assert_eq!(p.fill_index, 0);
        assert_eq!(p.zones[0].len(), BLK_SIZE - 1);
        assert!(p.invariant_holds());
    }
}
