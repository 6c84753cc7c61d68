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

//! Entity handles and location records.
//!
//! Handles are stable indices plus a generation counter rather than raw
//! pointers: `world.entities[widx]` is only trusted once
//! `world.generations[widx] == handle.gen` holds. This is the systems-language
//! substitute for a pointer into a stable `entities` array (see the crate's
//! design notes on handle representation).

use crate::archetype::{ArchetypeId, ArchetypeMask};
use crate::component::ComponentId;

/// A handle to a densely-stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DenseHandle {
    pub widx: u32,
    pub gen: u32,
}

/// A handle to a sparsely-stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SparseHandle {
    pub id: u32,
    pub gen: u32,
    pub mask: ArchetypeMask,
}

/// A stable World slot describing where a dense entity currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityRecord {
    /// `(block_index << 32) | slot_in_block`.
    pub packed_id: u64,
    pub archetype_id: ArchetypeId,
    /// Index of this record in `World::entities`; kept alongside the record
    /// so a relocation can patch the handle table without recomputing it.
    pub widx: u32,
}

impl EntityRecord {
    pub fn new(packed_id: u64, archetype_id: ArchetypeId, widx: u32) -> Self {
        Self {
            packed_id,
            archetype_id,
            widx,
        }
    }
}

/// A stable World slot describing a sparsely-stored entity's live components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseRecord {
    pub id: u32,
    pub mask: ArchetypeMask,
}

impl SparseRecord {
    pub fn has(&self, cid: ComponentId) -> bool {
        self.mask.has(cid)
    }
}
