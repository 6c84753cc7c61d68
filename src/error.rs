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

//! Error taxonomy for the store's public boundary.
//!
//! Three of the four categories the design distinguishes end up here:
//! contract violations (stale handle, unknown component, out-of-range
//! archetype) and resource exhaustion (too many registered components) are
//! returned as `EcsError`, not panicked, because both are reachable through
//! ordinary caller misuse rather than a broken store invariant. Logical
//! no-ops (double-add, double-remove, migrate-to-self) are not errors at all
//! — they succeed silently at the call site and never reach this type.
//! Invariant breaches inside the allocator (`None` partition where the
//! bookkeeping guarantees `Some`, an out-of-range block index) are
//! `debug_assert!`/`panic!` instead: past that point the store's own data is
//! already corrupt, and returning `Result` would just relocate the crash.

use std::fmt;

/// Errors surfaced at the `World` API boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// `handle.gen` did not match the current generation of its slot.
    StaleHandle,

    /// A dense handle's `widx` does not resolve to a live entity record.
    InvalidEntity,

    /// A component id outside `[0, registry.len())` was used.
    UnknownComponent(u16),

    /// An archetype id outside `[0, graph.len())` was used.
    ArchetypeOutOfRange(u32),

    /// `register_component` would exceed `MAX_COMPONENTS`.
    ComponentLimitExceeded,

    /// A command buffer id outside the range handed out by
    /// `World::create_command_buffer` was used.
    UnknownCommandBuffer(u32),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::StaleHandle => write!(f, "stale handle: generation mismatch"),
            EcsError::InvalidEntity => write!(f, "handle does not resolve to a live entity"),
            EcsError::UnknownComponent(id) => write!(f, "unknown component id {id}"),
            EcsError::ArchetypeOutOfRange(id) => write!(f, "archetype id {id} out of range"),
            EcsError::ComponentLimitExceeded => {
                write!(f, "component registration would exceed MAX_COMPONENTS")
            }
            EcsError::UnknownCommandBuffer(id) => write!(f, "unknown command buffer id {id}"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias used throughout the public API.
pub type Result<T> = std::result::Result<T, EcsError>;
