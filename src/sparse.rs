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

//! Free-list-based id issuance for sparsely-stored entities.
//!
//! Ids are drawn densely from `[0, max_index)`; the id space grows in
//! `WORD_BITS`-sized increments rather than one at a time, so a run of
//! allocations only pays the growth cost once per 64 ids. Generations are
//! tracked per id so a [`crate::entity::SparseHandle`] becomes stale the
//! instant its id is recycled.

use crate::constants::WORD_BITS;

#[derive(Debug, Default)]
pub struct SparseAllocator {
    free_list: Vec<u32>,
    max_index: u32,
    generations: Vec<u32>,
}

impl SparseAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_index(&self) -> u32 {
        self.max_index
    }

    pub fn generation(&self, id: u32) -> u32 {
        self.generations[id as usize]
    }

    fn grow_one_word(&mut self) -> u32 {
        let base = self.max_index;
        let word_bits = WORD_BITS as u32;
        self.generations
            .resize((self.max_index + word_bits) as usize, 0);
        self.max_index += word_bits;
        // Push the tail ids (all but the one about to be issued) onto the
        // free list in descending order so ids are handed out ascending.
        for id in (base + 1..base + word_bits).rev() {
            self.free_list.push(id);
        }
        base
    }

    /// Allocate a single id.
    pub fn allocate(&mut self) -> u32 {
        if let Some(id) = self.free_list.pop() {
            return id;
        }
        self.grow_one_word()
    }

    /// Allocate `n` ids, preferring the free list, then emitting whole fresh
    /// words and pushing the unused tail back onto the free list.
    pub fn allocate_batch(&mut self, n: usize) -> Vec<u32> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n && !self.free_list.is_empty() {
            out.push(self.free_list.pop().unwrap());
        }
        while out.len() < n {
            let remaining = n - out.len();
            let word_bits = WORD_BITS;
            let base = self.max_index;
            self.generations
                .resize((self.max_index as usize) + word_bits, 0);
            self.max_index += word_bits as u32;
            let take = remaining.min(word_bits);
            for i in 0..take {
                out.push(base + i as u32);
            }
            for i in take..word_bits {
                self.free_list.push(base + i as u32);
            }
        }
        out
    }

    /// Recycle `id`: push onto the free list and bump its generation so any
    /// outstanding handle referencing it becomes stale.
    pub fn deallocate(&mut self, id: u32) {
        self.generations[id as usize] = self.generations[id as usize].wrapping_add(1);
        self.free_list.push(id);
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_grows_by_word() {
        let mut a = SparseAllocator::new();
        let id = a.allocate();
        assert_eq!(id, 0);
        assert_eq!(a.max_index(), WORD_BITS as u32);
        assert_eq!(a.free_count(), WORD_BITS - 1);
    }

    #[test]
    fn allocate_reuses_free_list_before_growing() {
        let mut a = SparseAllocator::new();
        let first = a.allocate();
        a.deallocate(first);
        let reused = a.allocate();
        assert_eq!(reused, first);
        assert_eq!(a.max_index(), WORD_BITS as u32);
    }

    #[test]
    fn deallocate_bumps_generation() {
        let mut a = SparseAllocator::new();
        let id = a.allocate();
        let gen0 = a.generation(id);
        a.deallocate(id);
        a.allocate();
        assert_ne!(a.generation(id), gen0);
    }

    #[test]
    fn allocate_batch_spans_multiple_words() {
        let mut a = SparseAllocator::new();
        let batch = a.allocate_batch(WORD_BITS + 5);
        assert_eq!(batch.len(), WORD_BITS + 5);
        assert_eq!(a.max_index(), (WORD_BITS * 2) as u32);
    }

    #[test]
    fn allocate_batch_prefers_free_list() {
        let mut a = SparseAllocator::new();
        let id = a.allocate();
        a.deallocate(id);
        let batch = a.allocate_batch(1);
        assert_eq!(batch, vec![id]);
    }
}
