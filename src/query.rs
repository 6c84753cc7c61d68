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

//! Signature matching, change-tracking refinement, and filter composition
//! over the archetype graph.
//!
//! A [`QuerySignature`] never touches storage directly — it is built once
//! (by hand, by [`QueryBuilder`], or by parsing the small DSL in
//! [`QuerySignature::parse`]) and then handed to [`dense_iter`]/
//! [`sparse_iter`], which walk [`crate::archetype::ArchetypeGraph`] and
//! [`crate::component::ComponentRegistry`] to produce block/range matches.

use smallvec::SmallVec;

use crate::archetype::{ArchetypeGraph, ArchetypeId, ArchetypeMask};
use crate::bitset::{HiBitset, SparseHiBitset};
use crate::component::{ComponentId, ComponentRegistry};
use crate::constants::BLK_SIZE;

/// A user-supplied predicate bitset, composable with `and`/`or`/`not`.
///
/// Dense bits are keyed by `block_index * BLK_SIZE + slot`; sparse bits are
/// keyed directly by entity id.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub dense: HiBitset,
    pub sparse: SparseHiBitset,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dense(&mut self, block_index: u32, slot: u32) {
        self.dense.set(block_index as usize * BLK_SIZE + slot as usize);
    }

    pub fn set_sparse(&mut self, id: u32) {
        self.sparse.set(id as usize);
    }

    pub fn and(&self, other: &Self) -> Self {
        Self {
            dense: self.dense.and(&other.dense),
            sparse: self.sparse.and(&other.sparse),
        }
    }

    pub fn or(&self, other: &Self) -> Self {
        Self {
            dense: self.dense.or(&other.dense),
            sparse: self.sparse.or(&other.sparse),
        }
    }

    pub fn not(&self) -> Self {
        Self {
            dense: self.dense.not(),
            sparse: SparseHiBitset::new(), // complement of a sparse set has no finite representation
        }
    }

    /// The dense layer's occupancy word covering `block_index`'s `word_in_block`-th word.
    fn dense_block_word(&self, block_index: u32, word_in_block: usize) -> u64 {
        let words_per_block = BLK_SIZE / 64;
        self.dense.word(block_index as usize * words_per_block + word_in_block)
    }
}

/// A compiled query: which components must be present/absent, which must
/// have changed (or not) since the last `clear_changes`, and any number of
/// user [`QueryFilter`]s, ANDed together.
#[derive(Debug, Clone, Default)]
pub struct QuerySignature {
    pub include: ArchetypeMask,
    pub exclude: ArchetypeMask,
    pub modified: SmallVec<[ComponentId; 4]>,
    pub not_modified: SmallVec<[ComponentId; 4]>,
    pub filters: Vec<QueryFilter>,
}

impl QuerySignature {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(sig.include & arch) == sig.include && (arch & sig.exclude) == 0`.
    pub fn matches_archetype(&self, mask: ArchetypeMask) -> bool {
        self.include.and(&mask).popcount() == self.include.popcount()
            && mask.and(&self.exclude).popcount() == 0
    }

    pub fn has_refinement(&self) -> bool {
        !self.modified.is_empty() || !self.not_modified.is_empty() || !self.filters.is_empty()
    }

    /// Parse the query DSL: `Pos and Vel and not Dead and Modified[Pos] and
    /// not Modified[Vel]`. Component names are resolved against `registry`
    /// at construction time; nothing is re-parsed per iteration.
    pub fn parse(expr: &str, registry: &ComponentRegistry) -> Option<Self> {
        let mut sig = Self::new();
        for raw_term in expr.split("and") {
            let term = raw_term.trim();
            if term.is_empty() {
                continue;
            }
            let (negated, rest) = match term.strip_prefix("not ") {
                Some(r) => (true, r.trim()),
                None => (false, term),
            };
            if let Some(inner) = rest
                .strip_prefix("Modified[")
                .and_then(|s| s.strip_suffix(']'))
            {
                let id = registry.id_by_name(inner.trim())?;
                if negated {
                    sig.not_modified.push(id);
                } else {
                    sig.modified.push(id);
                }
                continue;
            }
            let id = registry.id_by_name(rest)?;
            if negated {
                sig.exclude.set_bit(id);
            } else {
                sig.include.set_bit(id);
            }
        }
        Some(sig)
    }
}

/// Fluent builder for [`QuerySignature`]; every DSL construct has a
/// programmatic equivalent here.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    sig: QuerySignature,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, cid: ComponentId) -> Self {
        self.sig.include.set_bit(cid);
        self
    }

    pub fn exclude(mut self, cid: ComponentId) -> Self {
        self.sig.exclude.set_bit(cid);
        self
    }

    pub fn modified(mut self, cid: ComponentId) -> Self {
        self.sig.modified.push(cid);
        self
    }

    pub fn not_modified(mut self, cid: ComponentId) -> Self {
        self.sig.not_modified.push(cid);
        self
    }

    pub fn filter(mut self, filter: QueryFilter) -> Self {
        self.sig.filters.push(filter);
        self
    }

    pub fn build(self) -> QuerySignature {
        self.sig
    }
}

/// One matched dense sub-range: `[start, end)` of `block_index` in
/// `archetype`'s partition, plus an optional refinement mask (present only
/// when change-tracking or a user filter constrains the match).
#[derive(Debug, Clone)]
pub struct DenseMatch {
    pub archetype: ArchetypeId,
    pub block_index: u32,
    pub start: u32,
    pub end: u32,
    pub refinement: Option<Vec<u64>>,
}

impl DenseMatch {
    /// Iterate the live slots of this match, honoring the refinement mask
    /// (trailing-zero walk) when present, or the full `[start, end)` range
    /// otherwise.
    pub fn slots(&self) -> SlotIter<'_> {
        match &self.refinement {
            Some(mask) => SlotIter::Masked {
                mask,
                start: self.start,
                end: self.end,
                word_idx: 0,
                word: mask.first().copied().unwrap_or(0),
            },
            None => SlotIter::Range {
                next: self.start,
                end: self.end,
            },
        }
    }

    pub fn popcount(&self) -> u32 {
        match &self.refinement {
            // The mask is already clipped to `[start, end)` at construction,
            // so a raw popcount agrees with what `slots()` walks.
            Some(mask) => mask.iter().map(|w| w.count_ones()).sum(),
            None => self.end - self.start,
        }
    }
}

pub enum SlotIter<'a> {
    Range { next: u32, end: u32 },
    Masked {
        mask: &'a [u64],
        start: u32,
        end: u32,
        word_idx: usize,
        word: u64,
    },
}

impl<'a> Iterator for SlotIter<'a> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        match self {
            SlotIter::Range { next, end } => {
                if *next >= *end {
                    None
                } else {
                    let v = *next;
                    *next += 1;
                    Some(v)
                }
            }
            SlotIter::Masked {
                mask,
                start,
                end,
                word_idx,
                word,
            } => loop {
                if *word != 0 {
                    let bit = word.trailing_zeros();
                    *word &= *word - 1;
                    let slot = (*word_idx as u32) * 64 + bit;
                    if slot >= *start && slot < *end {
                        return Some(slot);
                    }
                    continue;
                }
                *word_idx += 1;
                *word = *mask.get(*word_idx)?;
            },
        }
    }
}

/// One matched sparse word: entity ids `[word_idx*64, word_idx*64+64)`
/// restricted to the bits set in `word`.
#[derive(Debug, Clone, Copy)]
pub struct SparseMatch {
    pub word_idx: usize,
    pub word: u64,
}

impl SparseMatch {
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        let mut w = self.word;
        let base = (self.word_idx as u32) * 64;
        std::iter::from_fn(move || {
            if w == 0 {
                None
            } else {
                let bit = w.trailing_zeros();
                w &= w - 1;
                Some(base + bit)
            }
        })
    }
}

/// Bits `[start, end)` set, all others clear, across `words_per_block` words.
/// Used to clip a refinement mask to a zone's live range: `modified`/include
/// masks already exclude empty slots, but `not_modified` and filter-only
/// masks start from all-ones and would otherwise count phantom entities
/// past the zone's fill line.
fn live_range_mask(start: u32, end: u32, words_per_block: usize) -> Vec<u64> {
    let mut mask = vec![0u64; words_per_block];
    if end <= start {
        return mask;
    }
    let (start, end) = (start as usize, end as usize);
    for (w, word) in mask.iter_mut().enumerate() {
        let word_start = w * 64;
        let word_end = word_start + 64;
        if word_end <= start || word_start >= end {
            continue;
        }
        let lo = start.saturating_sub(word_start);
        let hi = (end - word_start).min(64);
        *word = if hi == 64 {
            !0u64 << lo
        } else {
            ((1u64 << hi) - 1) ^ ((1u64 << lo) - 1)
        };
    }
    mask
}

fn refinement_for_block(
    sig: &QuerySignature,
    registry: &ComponentRegistry,
    block_index: u32,
    start: u32,
    end: u32,
) -> Option<Vec<u64>> {
    if !sig.has_refinement() {
        return None;
    }
    let words_per_block = BLK_SIZE / 64;
    let mut out = live_range_mask(start, end, words_per_block);
    for &cid in &sig.modified {
        let mask = registry
            .erased(cid)
            .get_change_mask(block_index)
            .unwrap_or_else(|| vec![0u64; words_per_block]);
        for i in 0..words_per_block {
            out[i] &= mask[i];
        }
    }
    for &cid in &sig.not_modified {
        let mask = registry
            .erased(cid)
            .get_change_mask(block_index)
            .unwrap_or_else(|| vec![0u64; words_per_block]);
        for i in 0..words_per_block {
            out[i] &= !mask[i];
        }
    }
    for filter in &sig.filters {
        for i in 0..words_per_block {
            out[i] &= filter.dense_block_word(block_index, i);
        }
    }
    Some(out)
}

/// Walk every archetype node matching `sig` and yield its zone ranges,
/// refined by change-tracking/user filters when `sig` requires it.
pub fn dense_iter<'a>(
    graph: &'a ArchetypeGraph,
    registry: &'a ComponentRegistry,
    sig: &'a QuerySignature,
) -> impl Iterator<Item = DenseMatch> + 'a {
    (0..graph.len() as ArchetypeId).flat_map(move |aid| {
        let node = graph.node(aid);
        let matches = node.partition.is_some() && sig.matches_archetype(node.mask);
        let zones: SmallVec<[_; 4]> = if matches {
            node.partition.as_ref().unwrap().zones.clone()
        } else {
            SmallVec::new()
        };
        zones.into_iter().map(move |zone| DenseMatch {
            archetype: aid,
            block_index: zone.block_index,
            start: zone.start,
            end: zone.end,
            refinement: refinement_for_block(sig, registry, zone.block_index, zone.start, zone.end),
        })
    })
}

/// Intersect/subtract/refine sparse occupancy bitsets and yield the
/// resulting non-zero words.
pub fn sparse_iter<'a>(
    registry: &'a ComponentRegistry,
    sig: &'a QuerySignature,
) -> Box<dyn Iterator<Item = SparseMatch> + 'a> {
    if sig.include.components().is_empty() {
        return Box::new(std::iter::empty());
    }
    let mut acc: Option<SparseHiBitset> = None;
    for cid in sig.include.components() {
        let mask = registry.erased(cid).get_sparse_mask();
        acc = Some(match acc {
            None => mask.clone(),
            Some(a) => a.and(mask),
        });
    }
    let mut acc = acc.unwrap_or_default();
    for cid in sig.exclude.components() {
        let mask = registry.erased(cid).get_sparse_mask();
        let excluded: Vec<usize> = mask.items().collect();
        for id in excluded {
            acc.unset(id);
        }
    }
    for &cid in &sig.modified {
        if let Some(change) = registry.erased(cid).get_sparse_change_mask() {
            acc = acc.and(change);
        }
    }
    for &cid in &sig.not_modified {
        if let Some(change) = registry.erased(cid).get_sparse_change_mask() {
            let items: Vec<usize> = change.items().collect();
            for id in items {
                acc.unset(id);
            }
        }
    }
    for filter in &sig.filters {
        acc = acc.and(&filter.sparse);
    }
    Box::new(
        acc.block_iter()
            .collect::<Vec<_>>()
            .into_iter()
            .map(|(word_idx, word)| SparseMatch { word_idx, word }),
    )
}

/// Sum of yielded mask-popcounts across dense and sparse matches.
pub fn count(graph: &ArchetypeGraph, registry: &ComponentRegistry, sig: &QuerySignature) -> usize {
    let dense: usize = dense_iter(graph, registry, sig).map(|m| m.popcount() as usize).sum();
    let sparse: usize = sparse_iter(registry, sig).map(|m| m.word.count_ones() as usize).sum();
    dense + sparse
}

/// A pre-resolved query: caches the matching archetype ids (dense) so
/// subsequent iterations skip the `0..graph.len()` scan. Invalidated by
/// calling [`CachedQuery::refresh`] after structural changes that might
/// introduce newly-matching archetypes.
pub struct CachedQuery {
    pub signature: QuerySignature,
    matching_archetypes: Vec<ArchetypeId>,
    resolved_through: usize,
}

impl CachedQuery {
    pub fn new(signature: QuerySignature) -> Self {
        Self {
            signature,
            matching_archetypes: Vec::new(),
            resolved_through: 0,
        }
    }

    /// Scan any archetype nodes created since the last refresh and append
    /// the ones that match. Nodes are never removed, so already-resolved
    /// entries never need to be revisited.
    pub fn refresh(&mut self, graph: &ArchetypeGraph) {
        for aid in self.resolved_through as ArchetypeId..graph.len() as ArchetypeId {
            let node = graph.node(aid);
            if node.partition.is_some() && self.signature.matches_archetype(node.mask) {
                self.matching_archetypes.push(aid);
            }
        }
        self.resolved_through = graph.len();
    }

    pub fn matching_archetypes(&self) -> &[ArchetypeId] {
        &self.matching_archetypes
    }

    pub fn dense_iter<'a>(&'a self, graph: &'a ArchetypeGraph, registry: &'a ComponentRegistry) -> impl Iterator<Item = DenseMatch> + 'a {
        self.matching_archetypes.iter().flat_map(move |&aid| {
            let node = graph.node(aid);
            let zones: SmallVec<[_; 4]> = node
                .partition
                .as_ref()
                .map(|p| p.zones.clone())
                .unwrap_or_default();
            zones.into_iter().map(move |zone| DenseMatch {
                archetype: aid,
                block_index: zone.block_index,
                start: zone.start,
                end: zone.end,
                refinement: refinement_for_block(
                    &self.signature,
                    registry,
                    zone.block_index,
                    zone.start,
                    zone.end,
                ),
            })
        })
    }
}

#[cfg(feature = "parallel")]
pub mod parallel {
    //! Parallel fan-out over disjoint archetype nodes (§5): nodes never
    //! share storage, so handing one node's zone list per `rayon` task needs
    //! no cross-node locking. Within a node, zones still run in submission
    //! order relative to each other.
    use super::DenseMatch;
    use rayon::prelude::*;

    /// Run `f` over every match in `matches`, fanned out across the
    /// `rayon` global pool. `f` must be `Sync` since it may run on multiple
    /// threads concurrently for disjoint matches.
    pub fn par_for_each_dense<F>(matches: &[DenseMatch], f: F)
    where
        F: Fn(&DenseMatch) + Sync + Send,
    {
        matches.par_iter().for_each(|m| f(m));
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
        x: i64,
        y: i64,
    }

    #[test]
    fn matches_archetype_respects_include_and_exclude() {
        let mut registry = ComponentRegistry::new();
        let pos = registry.register::<Pos>(false, "Pos");
        let vel = registry.register::<Vel>(false, "Vel");

        let sig = QueryBuilder::new().include(pos).exclude(vel).build();
        let mut mask = ArchetypeMask::empty().with(pos);
        assert!(sig.matches_archetype(mask));
        mask.set_bit(vel);
        assert!(!sig.matches_archetype(mask));
    }

    #[test]
    fn dsl_parses_include_exclude_and_modified() {
        let mut registry = ComponentRegistry::new();
        let pos = registry.register::<Pos>(false, "Pos");
        let vel = registry.register::<Vel>(true, "Vel");

        let sig = QuerySignature::parse("Pos and not Vel", &registry).unwrap();
        assert!(sig.include.has(pos));
        assert!(sig.exclude.has(vel));

        let sig2 = QuerySignature::parse("Modified[Vel]", &registry).unwrap();
        assert_eq!(sig2.modified.as_slice(), &[vel]);
    }

    #[test]
    fn query_filter_and_restricts_dense_bits() {
        let mut a = QueryFilter::new();
        a.set_dense(0, 3);
        a.set_dense(0, 5);
        let mut b = QueryFilter::new();
        b.set_dense(0, 5);
        let combined = a.and(&b);
        assert!(combined.dense.get(5));
        assert!(!combined.dense.get(3));
    }

    #[test]
    fn dense_match_slots_respects_refinement() {
        let m = DenseMatch {
            archetype: 0,
            block_index: 0,
            start: 0,
            end: 10,
            refinement: Some(vec![0b0000_0101]), // bits 0 and 2
        };
        let slots: Vec<u32> = m.slots().collect();
        assert_eq!(slots, vec![0, 2]);
        assert_eq!(m.popcount(), 2);
    }

    #[test]
    fn dense_match_without_refinement_yields_full_range() {
        let m = DenseMatch {
            archetype: 0,
            block_index: 0,
            start: 3,
            end: 6,
            refinement: None,
        };
        assert_eq!(m.slots().collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn live_range_mask_clips_to_start_end() {
        let words_per_block = BLK_SIZE / 64;
        let mask = live_range_mask(0, 2, words_per_block);
        assert_eq!(mask[0], 0b11);
        assert_eq!(mask[1..], vec![0u64; words_per_block - 1]);
        assert_eq!(mask.iter().map(|w| w.count_ones()).sum::<u32>(), 2);
    }

    #[test]
    fn refinement_for_not_modified_does_not_count_past_zone_end() {
        let mut registry = ComponentRegistry::new();
        let pos = registry.register::<Pos>(false, "Pos");
        let vel = registry.register::<Vel>(true, "Vel");

        let sig = QueryBuilder::new().include(pos).not_modified(vel).build();
        // A zone with only 2 live slots out of a full BLK_SIZE block: an
        // unclipped all-ones refinement would count BLK_SIZE - 2 phantom
        // entries past the fill line.
        let refinement = refinement_for_block(&sig, &registry, 0, 0, 2);
        let m = DenseMatch {
            archetype: 0,
            block_index: 0,
            start: 0,
            end: 2,
            refinement,
        };
        assert_eq!(m.popcount(), 2);
        assert_eq!(m.slots().count() as u32, 2);
    }

    #[test]
    fn sparse_match_ids_decode_word() {
        let m = SparseMatch {
            word_idx: 1,
            word: 0b101,
        };
        assert_eq!(m.ids().collect::<Vec<_>>(), vec![64, 66]);
    }
}
