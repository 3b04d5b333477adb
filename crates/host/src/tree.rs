//! Test entity tree
//!
//! One tree per workspace. Entities live in a map keyed by stable id; parents
//! own their children by id and children point back at their parent. Top-level
//! items are the workspace root and any synthetic error nodes.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Tree handle shared between the reconciler and the UI layer
pub type SharedTestTree = Arc<Mutex<TestTree>>;

/// Kind of entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Workspace,
    Folder,
    File,
    Suite,
    Function,
    Case,
    Error,
}

impl EntityKind {
    /// Whether the entity can be run on its own
    pub fn is_leaf(&self) -> bool {
        matches!(self, EntityKind::Case)
    }
}

/// Zero-based line range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

impl LineRange {
    /// Range covering the one-based line `line`
    pub fn for_line(line: u32) -> Option<Self> {
        line.checked_sub(1).map(|start| Self { start, end: line })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub path: PathBuf,
    pub range: Option<LineRange>,
}

/// A node in the test tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestEntity {
    pub id: String,
    pub raw_id: String,
    pub run_id: Option<String>,
    pub kind: EntityKind,
    pub label: String,
    pub location: Option<SourceLocation>,
    pub parent: Option<String>,
    pub children: Vec<String>,
    /// Error text, for error nodes
    pub error: Option<String>,
}

impl TestEntity {
    pub fn new(id: impl Into<String>, kind: EntityKind, label: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            raw_id: id.clone(),
            id,
            run_id: None,
            kind,
            label: label.into(),
            location: None,
            parent: None,
            children: Vec::new(),
            error: None,
        }
    }
}

/// Per-workspace test tree
#[derive(Debug, Default)]
pub struct TestTree {
    entities: HashMap<String, TestEntity>,
    roots: Vec<String>,
    run_to_entity: HashMap<String, String>,
    entity_to_run: HashMap<String, String>,
    generation: u64,
}

impl TestTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedTestTree {
        Arc::new(Mutex::new(self))
    }

    pub fn get(&self, id: &str) -> Option<&TestEntity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Top-level ids in display order
    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    /// Bumped on every mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn children(&self, id: &str) -> impl Iterator<Item = &TestEntity> {
        self.entities
            .get(id)
            .into_iter()
            .flat_map(|e| e.children.iter())
            .filter_map(|child| self.entities.get(child))
    }

    pub fn entities(&self) -> impl Iterator<Item = &TestEntity> {
        self.entities.values()
    }

    /// Insert `entity` under its parent (or at the top level). Replaces an
    /// entity with the same id.
    pub fn insert(&mut self, entity: TestEntity) {
        if self.entities.contains_key(&entity.id) {
            self.remove(&entity.id);
        }
        match entity.parent.as_deref() {
            Some(parent) => match self.entities.get_mut(parent) {
                Some(p) => p.children.push(entity.id.clone()),
                None => {
                    warn!("Parent {} of {} not in tree; inserting at top level", parent, entity.id);
                    self.roots.push(entity.id.clone());
                }
            },
            None => self.roots.push(entity.id.clone()),
        }
        self.entities.insert(entity.id.clone(), entity);
        self.generation += 1;
    }

    /// Apply `f` to an entity in place
    pub fn update<F: FnOnce(&mut TestEntity)>(&mut self, id: &str, f: F) -> bool {
        match self.entities.get_mut(id) {
            Some(entity) => {
                f(entity);
                self.generation += 1;
                true
            }
            None => false,
        }
    }

    /// Replace the display order of a parent's children. Ids not currently
    /// children are ignored.
    pub fn reorder_children(&mut self, parent: &str, order: &[String]) {
        if let Some(p) = self.entities.get_mut(parent) {
            let current: HashSet<&String> = p.children.iter().collect();
            let reordered: Vec<String> = order
                .iter()
                .filter(|id| current.contains(id))
                .cloned()
                .collect();
            if reordered != p.children {
                p.children = reordered;
                self.generation += 1;
            }
        }
    }

    /// Remove an entity and its whole subtree. Returns the number removed.
    pub fn remove(&mut self, id: &str) -> usize {
        let Some(entity) = self.entities.remove(id) else {
            return 0;
        };
        match entity.parent.as_deref() {
            Some(parent) => {
                if let Some(p) = self.entities.get_mut(parent) {
                    p.children.retain(|c| c != id);
                }
            }
            None => self.roots.retain(|r| r != id),
        }
        if let Some(run_id) = self.entity_to_run.remove(id) {
            self.run_to_entity.remove(&run_id);
        }

        let mut removed = 1;
        let mut stack = entity.children;
        while let Some(child) = stack.pop() {
            if let Some(e) = self.entities.remove(&child) {
                if let Some(run_id) = self.entity_to_run.remove(&child) {
                    self.run_to_entity.remove(&run_id);
                }
                stack.extend(e.children);
                removed += 1;
            }
        }
        self.generation += 1;
        removed
    }

    // ========================================================================
    // Run id index
    // ========================================================================

    pub fn clear_run_ids(&mut self) {
        self.run_to_entity.clear();
        self.entity_to_run.clear();
    }

    /// Map `run_id` to `entity_id`. Refuses to break the one-to-one mapping.
    pub fn register_run_id(&mut self, run_id: &str, entity_id: &str) -> bool {
        if self.run_to_entity.contains_key(run_id) || self.entity_to_run.contains_key(entity_id) {
            return false;
        }
        self.run_to_entity
            .insert(run_id.to_string(), entity_id.to_string());
        self.entity_to_run
            .insert(entity_id.to_string(), run_id.to_string());
        true
    }

    pub fn entity_for_run_id(&self, run_id: &str) -> Option<&TestEntity> {
        self.run_to_entity
            .get(run_id)
            .and_then(|id| self.entities.get(id))
    }

    pub fn run_id_for(&self, entity_id: &str) -> Option<&str> {
        self.entity_to_run.get(entity_id).map(String::as_str)
    }

    /// Expand `ids` to the leaf cases beneath them, without duplicates, in
    /// tree order.
    pub fn leaves_under(&self, ids: &[String]) -> Vec<&TestEntity> {
        let mut seen = HashSet::new();
        let mut leaves = Vec::new();
        for id in ids {
            let mut stack = vec![id.as_str()];
            while let Some(current) = stack.pop() {
                let Some(entity) = self.entities.get(current) else {
                    continue;
                };
                if entity.kind.is_leaf() {
                    if seen.insert(entity.id.as_str()) {
                        leaves.push(entity);
                    }
                } else {
                    stack.extend(entity.children.iter().rev().map(String::as_str));
                }
            }
        }
        leaves
    }

    /// Indented text rendering, one entity per line
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack: Vec<(&str, usize)> = self.roots.iter().rev().map(|r| (r.as_str(), 0)).collect();
        while let Some((id, depth)) = stack.pop() {
            let Some(entity) = self.entities.get(id) else {
                continue;
            };
            out.push_str(&"  ".repeat(depth));
            out.push_str(&entity.label);
            if let Some(range) = entity.location.as_ref().and_then(|l| l.range) {
                out.push_str(&format!(" (line {})", range.end));
            }
            if let Some(error) = &entity.error {
                out.push_str(&format!(": {}", error.lines().next().unwrap_or_default()));
            }
            out.push('\n');
            stack.extend(entity.children.iter().rev().map(|c| (c.as_str(), depth + 1)));
        }
        out
    }
}
