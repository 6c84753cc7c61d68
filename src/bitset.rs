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

//! Hierarchical two-level bitmaps.
//!
//! Both variants expose the same semantics: `layer1` word `w` has bit `b`
//! set iff `layer0` word `w*64+b` is non-zero. That invariant lets
//! `items()`/`block_iter()` skip whole 64-bit ranges of zero words with a
//! single trailing-zero count on `layer1` instead of scanning `layer0`
//! linearly, which is what makes occupancy iteration over mostly-empty
//! fragment vectors cheap.

use rustc_hash::FxHashMap;

const WORD_BITS: usize = 64;

#[inline]
fn word_bit(index: usize) -> (usize, u32) {
    (index / WORD_BITS, (index % WORD_BITS) as u32)
}

/// Dense two-level bitmap backed by two flat `Vec<u64>` arrays.
///
/// Grows on `set`; never shrinks, matching the store's "blocks are never
/// freed" stability guarantee for occupancy tracking.
#[derive(Debug, Clone, Default)]
pub struct HiBitset {
    layer0: Vec<u64>,
    layer1: Vec<u64>,
}

impl HiBitset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bits: usize) -> Self {
        let words = bits.div_ceil(WORD_BITS);
        let hi_words = words.div_ceil(WORD_BITS);
        Self {
            layer0: vec![0; words],
            layer1: vec![0; hi_words],
        }
    }

    /// Number of layer-0 words currently allocated.
    pub fn word_len(&self) -> usize {
        self.layer0.len()
    }

    fn ensure_word(&mut self, word_idx: usize) {
        if word_idx >= self.layer0.len() {
            self.layer0.resize(word_idx + 1, 0);
            let hi_len = self.layer0.len().div_ceil(WORD_BITS);
            if hi_len > self.layer1.len() {
                self.layer1.resize(hi_len, 0);
            }
        }
    }

    #[inline]
    fn set_layer1(&mut self, word_idx: usize, word_nonzero: bool) {
        let (hw, hb) = word_bit(word_idx);
        if hw >= self.layer1.len() {
            self.layer1.resize(hw + 1, 0);
        }
        if word_nonzero {
            self.layer1[hw] |= 1u64 << hb;
        } else {
            self.layer1[hw] &= !(1u64 << hb);
        }
    }

    pub fn set(&mut self, index: usize) {
        let (w, b) = word_bit(index);
        self.ensure_word(w);
        self.layer0[w] |= 1u64 << b;
        self.set_layer1(w, true);
    }

    pub fn unset(&mut self, index: usize) {
        let (w, b) = word_bit(index);
        if w >= self.layer0.len() {
            return;
        }
        self.layer0[w] &= !(1u64 << b);
        if self.layer0[w] == 0 {
            self.set_layer1(w, false);
        }
    }

    pub fn get(&self, index: usize) -> bool {
        let (w, b) = word_bit(index);
        self.layer0
            .get(w)
            .map(|word| (word & (1u64 << b)) != 0)
            .unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.layer0.iter_mut().for_each(|w| *w = 0);
        self.layer1.iter_mut().for_each(|w| *w = 0);
    }

    pub fn is_empty(&self) -> bool {
        self.layer1.iter().all(|&w| w == 0)
    }

    /// Number of set bits.
    pub fn card(&self) -> usize {
        self.layer0.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Word at `word_idx`, or `0` if never allocated.
    pub fn word(&self, word_idx: usize) -> u64 {
        self.layer0.get(word_idx).copied().unwrap_or(0)
    }

    fn combine(&self, other: &Self, f: impl Fn(u64, u64) -> u64) -> Self {
        let len = self.layer0.len().max(other.layer0.len());
        let mut out = Self::with_capacity(len * WORD_BITS);
        for i in 0..len {
            let combined = f(self.word(i), other.word(i));
            out.layer0[i] = combined;
            out.set_layer1(i, combined != 0);
        }
        out
    }

    pub fn and(&self, other: &Self) -> Self {
        self.combine(other, |a, b| a & b)
    }

    pub fn or(&self, other: &Self) -> Self {
        self.combine(other, |a, b| a | b)
    }

    pub fn xor(&self, other: &Self) -> Self {
        self.combine(other, |a, b| a ^ b)
    }

    /// Bitwise complement, restricted to the currently-allocated word range
    /// of `self` (there is no implicit universe beyond that).
    pub fn not(&self) -> Self {
        let mut out = Self::with_capacity(self.layer0.len() * WORD_BITS);
        for (i, &w) in self.layer0.iter().enumerate() {
            let inv = !w;
            out.layer0[i] = inv;
            out.set_layer1(i, inv != 0);
        }
        out
    }

    pub fn and_assign(&mut self, other: &Self) {
        let len = self.layer0.len();
        for i in 0..len {
            let v = self.layer0[i] & other.word(i);
            self.layer0[i] = v;
            self.set_layer1(i, v != 0);
        }
    }

    pub fn or_assign(&mut self, other: &Self) {
        let len = other.layer0.len();
        self.ensure_word(len.saturating_sub(1));
        for i in 0..len.max(self.layer0.len()) {
            let v = self.word(i) | other.word(i);
            if i < self.layer0.len() {
                self.layer0[i] = v;
            }
            self.set_layer1(i, v != 0);
        }
    }

    /// Iterator over indices of non-zero layer-0 words ("blocks").
    pub fn block_iter(&self) -> BlockIter<'_> {
        BlockIter {
            bitset: self,
            hi_word_idx: 0,
            hi_word: self.layer1.first().copied().unwrap_or(0),
        }
    }

    /// Iterator over set-bit indices, using trailing-zero count on both
    /// layers so fully-zero words are skipped in one step.
    pub fn items(&self) -> ItemIter<'_> {
        ItemIter {
            blocks: self.block_iter(),
            word_idx: None,
            word: 0,
        }
    }
}

pub struct BlockIter<'a> {
    bitset: &'a HiBitset,
    hi_word_idx: usize,
    hi_word: u64,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.hi_word != 0 {
                let bit = self.hi_word.trailing_zeros();
                self.hi_word &= self.hi_word - 1;
                return Some(self.hi_word_idx * WORD_BITS + bit as usize);
            }
            self.hi_word_idx += 1;
            self.hi_word = *self.bitset.layer1.get(self.hi_word_idx)?;
        }
    }
}

pub struct ItemIter<'a> {
    blocks: BlockIter<'a>,
    word_idx: Option<usize>,
    word: u64,
}

impl<'a> Iterator for ItemIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.word != 0 {
                let bit = self.word.trailing_zeros();
                self.word &= self.word - 1;
                return Some(self.word_idx.unwrap() * WORD_BITS + bit as usize);
            }
            let next_block = self.blocks.next()?;
            self.word_idx = Some(next_block);
            self.word = self.blocks.bitset.word(next_block);
        }
    }
}

/// Sparse two-level bitmap: only non-zero layer-0 words are stored, packed
/// densely with a hash-map index from word index to storage position.
///
/// Used for sparse-entity occupancy where the id space can be much larger
/// than the live population, so a dense `Vec<u64>` per component would waste
/// memory proportional to `max_index` rather than population size.
#[derive(Debug, Clone, Default)]
pub struct SparseHiBitset {
    /// `dense[pos] = (word_idx, word)`.
    dense: Vec<(usize, u64)>,
    /// `word_idx -> pos` in `dense`.
    index: FxHashMap<usize, usize>,
}

impl SparseHiBitset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, bit_index: usize) {
        let (w, b) = word_bit(bit_index);
        match self.index.get(&w) {
            Some(&pos) => self.dense[pos].1 |= 1u64 << b,
            None => {
                let pos = self.dense.len();
                self.dense.push((w, 1u64 << b));
                self.index.insert(w, pos);
            }
        }
    }

    pub fn unset(&mut self, bit_index: usize) {
        let (w, b) = word_bit(bit_index);
        if let Some(&pos) = self.index.get(&w) {
            self.dense[pos].1 &= !(1u64 << b);
            if self.dense[pos].1 == 0 {
                self.swap_remove_pos(pos);
            }
        }
    }

    fn swap_remove_pos(&mut self, pos: usize) {
        let (word_idx, _) = self.dense[pos];
        self.index.remove(&word_idx);
        let last = self.dense.len() - 1;
        if pos != last {
            self.dense.swap(pos, last);
            let (moved_word, _) = self.dense[pos];
            self.index.insert(moved_word, pos);
        }
        self.dense.pop();
    }

    pub fn get(&self, bit_index: usize) -> bool {
        let (w, b) = word_bit(bit_index);
        self.index
            .get(&w)
            .map(|&pos| (self.dense[pos].1 & (1u64 << b)) != 0)
            .unwrap_or(false)
    }

    pub fn word(&self, word_idx: usize) -> u64 {
        self.index
            .get(&word_idx)
            .map(|&pos| self.dense[pos].1)
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.dense.clear();
        self.index.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    pub fn card(&self) -> usize {
        self.dense.iter().map(|(_, w)| w.count_ones() as usize).sum()
    }

    fn combine(&self, other: &Self, f: impl Fn(u64, u64) -> u64, union: bool) -> Self {
        let mut out = Self::new();
        if union {
            let mut word_idxs: Vec<usize> = self
                .dense
                .iter()
                .map(|(w, _)| *w)
                .chain(other.dense.iter().map(|(w, _)| *w))
                .collect();
            word_idxs.sort_unstable();
            word_idxs.dedup();
            for w in word_idxs {
                let combined = f(self.word(w), other.word(w));
                if combined != 0 {
                    out.dense.push((w, combined));
                    out.index.insert(w, out.dense.len() - 1);
                }
            }
        } else {
            for &(w, word) in &self.dense {
                let combined = f(word, other.word(w));
                if combined != 0 {
                    out.dense.push((w, combined));
                    out.index.insert(w, out.dense.len() - 1);
                }
            }
        }
        out
    }

    pub fn and(&self, other: &Self) -> Self {
        self.combine(other, |a, b| a & b, false)
    }

    pub fn or(&self, other: &Self) -> Self {
        self.combine(other, |a, b| a | b, true)
    }

    pub fn xor(&self, other: &Self) -> Self {
        self.combine(other, |a, b| a ^ b, true)
    }

    /// Iterator over `(word_idx, word)` for every non-zero word.
    pub fn block_iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.dense.iter().copied()
    }

    /// Iterator over set-bit indices.
    pub fn items(&self) -> impl Iterator<Item = usize> + '_ {
        self.dense.iter().flat_map(|&(w, word)| {
            let mut word = word;
            std::iter::from_fn(move || {
                if word == 0 {
                    None
                } else {
                    let bit = word.trailing_zeros();
                    word &= word - 1;
                    Some(w * WORD_BITS + bit as usize)
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_unset_get() {
        let mut bs = HiBitset::new();
        assert!(!bs.get(130));
        bs.set(130);
        assert!(bs.get(130));
        bs.unset(130);
        assert!(!bs.get(130));
    }

    #[test]
    fn card_matches_items_len() {
        let mut bs = HiBitset::new();
        for i in [0, 63, 64, 65, 500, 4095, 4096] {
            bs.set(i);
        }
        assert_eq!(bs.card(), bs.items().count());
        assert_eq!(bs.card(), 7);
    }

    #[test]
    fn and_or_card_law() {
        let mut a = HiBitset::new();
        let mut b = HiBitset::new();
        for i in [1, 2, 3, 64, 65] {
            a.set(i);
        }
        for i in [2, 3, 4, 65, 200] {
            b.set(i);
        }
        let and_card = a.and(&b).card();
        let or_card = a.or(&b).card();
        assert_eq!(and_card + or_card, a.card() + b.card());
    }

    #[test]
    fn xor_self_is_empty() {
        let mut a = HiBitset::new();
        a.set(7);
        a.set(900);
        assert!(a.xor(&a).is_empty());
    }

    #[test]
    fn double_not_restores_within_capacity() {
        let mut a = HiBitset::new();
        a.set(5);
        a.set(70);
        let restored = a.not().not();
        assert_eq!(
            restored.items().collect::<Vec<_>>(),
            a.items().collect::<Vec<_>>()
        );
    }

    #[test]
    fn layer1_invariant_after_unset_to_zero() {
        let mut a = HiBitset::new();
        a.set(10);
        a.unset(10);
        assert!(a.is_empty());
        assert!(a.block_iter().next().is_none());
    }

    #[test]
    fn sparse_matches_dense_semantics() {
        let mut sparse = SparseHiBitset::new();
        let mut dense = HiBitset::new();
        for i in [3usize, 64, 200, 1_000_000] {
            sparse.set(i);
            dense.set(i);
        }
        let mut sparse_items: Vec<_> = sparse.items().collect();
        let mut dense_items: Vec<_> = dense.items().collect();
        sparse_items.sort_unstable();
        dense_items.sort_unstable();
        assert_eq!(sparse_items, dense_items);
        assert_eq!(sparse.card(), dense.card());
    }

    #[test]
    fn sparse_reclaims_on_zero() {
        let mut s = SparseHiBitset::new();
        s.set(5);
        s.set(70);
        assert_eq!(s.dense.len(), 2);
        s.unset(5);
        assert_eq!(s.dense.len(), 1);
        assert!(!s.get(5));
        assert!(s.get(70));
    }
}
