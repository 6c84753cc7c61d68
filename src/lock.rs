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

//! External collaborator: a per-field read/write lock tree.
//!
//! The store itself never blocks — this module is the boundary contract a
//! host application attaches over a [`crate::component::ComponentRegistry`]
//! column when it needs finer-grained discipline than "the whole world is
//! mutably borrowed". It is deliberately out of the kernel's data path: no
//! query or migration path takes a lock from here.
//!
//! Nodes are addressed by `(ComponentId, field_name)` path segments and form
//! a tree so that locking a parent conceptually covers its children. Multi-
//! path batch acquisition sorts paths by address before taking any lock, so
//! two callers racing to acquire the same set of paths always take them in
//! the same order and cannot deadlock.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::component::ComponentId;

/// Read or write intent for a single path acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

/// A dotted path identifying a node in the tree: the owning component,
/// followed by zero or more nested field names (`Position.x`, `Transform`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockPath {
    pub component: ComponentId,
    pub fields: Vec<&'static str>,
}

impl LockPath {
    pub fn root(component: ComponentId) -> Self {
        LockPath {
            component,
            fields: Vec::new(),
        }
    }

    pub fn field(component: ComponentId, field: &'static str) -> Self {
        LockPath {
            component,
            fields: vec![field],
        }
    }

    fn child(&self, field: &'static str) -> Self {
        let mut fields = self.fields.clone();
        fields.push(field);
        LockPath {
            component: self.component,
            fields,
        }
    }

    /// A stable total order over paths, used to sort a batch acquisition so
    /// that any two callers take shared locks in the same order.
    fn sort_key(&self) -> (u16, &[&'static str]) {
        (self.component, &self.fields)
    }
}

impl PartialOrd for LockPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LockPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

struct LockNode {
    lock: RwLock<()>,
    children: RwLock<FxHashMap<&'static str, Arc<LockNode>>>,
}

impl LockNode {
    fn new() -> Self {
        LockNode {
            lock: RwLock::new(()),
            children: RwLock::new(FxHashMap::default()),
        }
    }
}

/// A forest of per-component lock trees.
///
/// `attach` registers a column (and, lazily, any nested field path reached
/// through it); `with_read_lock`/`with_write_lock` acquire a single path for
/// the duration of a closure, and `with_locks` acquires a whole batch of
/// paths in address order, releasing them in reverse when the closure
/// returns.
pub struct LockTree {
    roots: FxHashMap<ComponentId, Arc<LockNode>>,
}

impl LockTree {
    pub fn new() -> Self {
        LockTree {
            roots: FxHashMap::default(),
        }
    }

    /// Registers `column` as a lockable root, or a nested field path under
    /// it if `field_name` is given. Idempotent either way.
    pub fn attach(&mut self, column: ComponentId, field_name: Option<&'static str>) {
        let root = self
            .roots
            .entry(column)
            .or_insert_with(|| Arc::new(LockNode::new()))
            .clone();
        if let Some(name) = field_name {
            root.children
                .write()
                .entry(name)
                .or_insert_with(|| Arc::new(LockNode::new()));
        }
    }

    fn resolve(&self, path: &LockPath) -> Option<Arc<LockNode>> {
        let mut node = self.roots.get(&path.component)?.clone();
        for field in &path.fields {
            let next = node.children.read().get(field)?.clone();
            node = next;
        }
        Some(node)
    }

    /// Acquires a single path for read, runs `f`, then releases.
    pub fn with_read_lock<R>(&self, path: &LockPath, f: impl FnOnce() -> R) -> Option<R> {
        let node = self.resolve(path)?;
        let _guard = node.lock.read();
        Some(f())
    }

    /// Acquires a single path for write, runs `f`, then releases.
    pub fn with_write_lock<R>(&self, path: &LockPath, f: impl FnOnce() -> R) -> Option<R> {
        let node = self.resolve(path)?;
        let _guard = node.lock.write();
        Some(f())
    }

    /// Acquires a batch of `(path, mode)` pairs, sorted by address, then runs
    /// `f`. Sorting before acquiring is what makes two overlapping batches
    /// lock-order safe against each other.
    pub fn with_locks<R>(&self, paths: &[(LockPath, LockMode)], f: impl FnOnce() -> R) -> Option<R> {
        let mut ordered: Vec<&(LockPath, LockMode)> = paths.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));

        let mut nodes = Vec::with_capacity(ordered.len());
        for (path, mode) in &ordered {
            nodes.push((self.resolve(path)?, *mode));
        }

        // Hold every guard for the duration of the closure; drop order at
        // scope end releases them in reverse acquisition order.
        let mut guards: Vec<LockGuardEither<'_>> = Vec::with_capacity(nodes.len());
        for (node, mode) in &nodes {
            guards.push(match mode {
                LockMode::Read => LockGuardEither::Read(node.lock.read()),
                LockMode::Write => LockGuardEither::Write(node.lock.write()),
            });
        }
        let result = f();
        drop(guards);
        Some(result)
    }
}

impl Default for LockTree {
    fn default() -> Self {
        Self::new()
    }
}

enum LockGuardEither<'a> {
    Read(parking_lot::RwLockReadGuard<'a, ()>),
    Write(parking_lot::RwLockWriteGuard<'a, ()>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_and_read_lock_root() {
        let mut tree = LockTree::new();
        tree.attach(0, None);
        let path = LockPath::root(0);
        let ran = tree.with_read_lock(&path, || 42);
        assert_eq!(ran, Some(42));
    }

    #[test]
    fn missing_path_resolves_to_none() {
        let tree = LockTree::new();
        let path = LockPath::root(7);
        assert_eq!(tree.with_read_lock(&path, || ()), None);
    }

    #[test]
    fn batch_lock_sorts_by_address_before_acquiring() {
        let mut tree = LockTree::new();
        tree.attach(2, None);
        tree.attach(1, None);
        let paths = vec![
            (LockPath::root(2), LockMode::Write),
            (LockPath::root(1), LockMode::Read),
        ];
        let ran = tree.with_locks(&paths, || 7);
        assert_eq!(ran, Some(7));
    }

    #[test]
    fn concurrent_readers_do_not_block_each_other() {
        let mut tree = LockTree::new();
        tree.attach(0, None);
        let path = LockPath::root(0);
        let a = tree.with_read_lock(&path, || tree.with_read_lock(&path, || 1));
        assert_eq!(a, Some(Some(1)));
    }
}
