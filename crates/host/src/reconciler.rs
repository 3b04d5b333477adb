//! Discovery reconciliation
//!
//! Turns a raw discovery tree into entity tree mutations. Entities are matched
//! by stable id (derived from the runner's raw id, never the label), updated
//! in place when the kind is unchanged, created when new, and pruned with
//! their subtree when the payload no longer mentions them.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use testbridge_common::protocol::{LineNo, RawTestCase, RawTestNode};
use testbridge_common::TestProvider;
use tracing::{debug, warn};

use crate::tree::{EntityKind, LineRange, SourceLocation, TestEntity, TestTree};

/// Counts of what a reconciliation changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Id of the workspace root entity
pub fn workspace_root_id(workspace: &Path) -> String {
    workspace.to_string_lossy().into_owned()
}

/// Id of the synthetic discovery error node for `workspace`
pub fn discovery_error_id(workspace: &Path) -> String {
    format!("DiscoveryError:{}", workspace.display())
}

/// Id of the synthetic execution error node for `workspace`
pub fn execution_error_id(workspace: &Path) -> String {
    format!("ExecutionError:{}", workspace.display())
}

fn workspace_label(workspace: &Path) -> String {
    workspace
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| workspace.display().to_string())
}

/// Create the workspace root if it does not exist yet
pub fn ensure_workspace_root(tree: &mut TestTree, workspace: &Path) -> String {
    let id = workspace_root_id(workspace);
    if !tree.contains(&id) {
        let mut root = TestEntity::new(&id, EntityKind::Workspace, workspace_label(workspace));
        root.location = Some(SourceLocation {
            path: workspace.to_path_buf(),
            range: None,
        });
        tree.insert(root);
        debug!("Created workspace root {}", id);
    }
    id
}

/// Reconcile a successful discovery tree rooted at `workspace`.
///
/// The raw root node maps onto the workspace root entity. The run id index is
/// rebuilt from scratch.
pub fn reconcile_discovery(
    tree: &mut TestTree,
    workspace: &Path,
    raw_root: &RawTestNode,
) -> ReconcileStats {
    let mut stats = ReconcileStats::default();
    if !tree.contains(&workspace_root_id(workspace)) {
        stats.created += 1;
    }
    let root_id = ensure_workspace_root(tree, workspace);

    if let RawTestNode::Folder(folder) = raw_root {
        if !folder.name.is_empty()
            && tree.get(&root_id).map(|r| r.label != folder.name).unwrap_or(false)
        {
            tree.update(&root_id, |r| r.label = folder.name.clone());
        }
    }

    tree.clear_run_ids();

    let children: &[RawTestNode] = match raw_root {
        RawTestNode::Test(_) => std::slice::from_ref(raw_root),
        _ => raw_root.children(),
    };
    let mut seen = HashSet::new();
    reconcile_children(tree, &root_id, children, &mut seen, &mut stats);

    debug!(
        "Reconciled {}: {} created, {} updated, {} removed",
        root_id, stats.created, stats.updated, stats.removed
    );
    stats
}

fn reconcile_children(
    tree: &mut TestTree,
    parent_id: &str,
    raw_children: &[RawTestNode],
    seen: &mut HashSet<String>,
    stats: &mut ReconcileStats,
) {
    let mut order = Vec::with_capacity(raw_children.len());

    for raw in raw_children {
        let id = raw.id().to_string();
        if !seen.insert(id.clone()) {
            warn!("Duplicate test id {} in discovery payload; keeping the first", id);
            continue;
        }

        let desired = entity_from_raw(raw, parent_id);
        match tree.get(&id) {
            Some(existing) if existing.kind == desired.kind && existing.parent == desired.parent => {
                if existing.label != desired.label
                    || existing.location != desired.location
                    || existing.run_id != desired.run_id
                {
                    tree.update(&id, |e| {
                        e.label = desired.label.clone();
                        e.location = desired.location.clone();
                        e.run_id = desired.run_id.clone();
                    });
                    stats.updated += 1;
                }
            }
            Some(_) => {
                // Same id, different kind or parent: a different entity now
                stats.removed += tree.remove(&id);
                tree.insert(desired.clone());
                stats.created += 1;
            }
            None => {
                tree.insert(desired.clone());
                stats.created += 1;
            }
        }

        if let Some(run_id) = &desired.run_id {
            if !tree.register_run_id(run_id, &id) {
                warn!("Run id {} maps to more than one test; ignoring {}", run_id, id);
            }
        }

        reconcile_children(tree, &id, raw.children(), seen, stats);
        order.push(id);
    }

    let keep: HashSet<&String> = order.iter().collect();
    let stale: Vec<String> = tree
        .get(parent_id)
        .map(|p| {
            p.children
                .iter()
                .filter(|c| !keep.contains(c))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    for id in stale {
        debug!("Pruning {}", id);
        stats.removed += tree.remove(&id);
    }

    tree.reorder_children(parent_id, &order);
}

fn entity_from_raw(raw: &RawTestNode, parent_id: &str) -> TestEntity {
    let kind = match raw {
        RawTestNode::Folder(_) => EntityKind::Folder,
        RawTestNode::File(_) => EntityKind::File,
        RawTestNode::Class(_) => EntityKind::Suite,
        RawTestNode::Function(_) => EntityKind::Function,
        RawTestNode::Test(_) => EntityKind::Case,
    };
    let mut entity = TestEntity::new(raw.id(), kind, raw.name());
    entity.parent = Some(parent_id.to_string());

    entity.location = match raw {
        RawTestNode::Test(case) => Some(case_location(case)),
        RawTestNode::Class(c) | RawTestNode::Function(c) => Some(SourceLocation {
            path: file_part(&c.path),
            range: c.lineno.as_ref().and_then(LineNo::line).and_then(LineRange::for_line),
        }),
        RawTestNode::Folder(c) | RawTestNode::File(c) => Some(SourceLocation {
            path: PathBuf::from(&c.path),
            range: None,
        }),
    };
    if let RawTestNode::Test(case) = raw {
        entity.run_id = Some(case.run_id().to_string());
    }
    entity
}

/// pytest node paths may carry `::name` suffixes
fn file_part(path: &str) -> PathBuf {
    PathBuf::from(path.split("::").next().unwrap_or(path))
}

fn case_location(case: &RawTestCase) -> SourceLocation {
    let mut path = file_part(&case.path);
    let mut line = case.lineno.as_ref().and_then(LineNo::line);

    if line.is_none() {
        if let Some((file, parsed)) = case.source.as_deref().and_then(parse_source) {
            path = PathBuf::from(file);
            line = Some(parsed);
        }
    }

    SourceLocation {
        path,
        range: line.and_then(LineRange::for_line),
    }
}

/// Parse `path/to/file.py:12`. Anything else yields `None`.
pub fn parse_source(source: &str) -> Option<(&str, u32)> {
    let (file, line) = source.rsplit_once(':')?;
    let line = line.trim().parse::<u32>().ok()?;
    if file.is_empty() || line == 0 {
        return None;
    }
    Some((file, line))
}

// ============================================================================
// Error nodes
// ============================================================================

static MISSING_MODULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"No module named ['"]?([A-Za-z0-9_.]+)['"]?"#).expect("valid regex")
});

/// Missing dependency named in an error text, if any
pub fn missing_module(text: &str) -> Option<String> {
    MISSING_MODULE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Label for an error node; names the missing module when the error text
/// points at one.
pub fn error_label(base: &str, workspace: &Path, error: &str) -> String {
    let label = format!("{} [{}]", base, workspace_label(workspace));
    match missing_module(error) {
        Some(module) => format!("{}: missing module '{}'", label, module),
        None if error.contains("ModuleNotFoundError") || error.contains("ImportError") => {
            format!("{}: import error", label)
        }
        None => label,
    }
}

/// Label prefix for discovery errors, by framework
pub fn discovery_error_base(provider: TestProvider, cancelled: bool) -> String {
    let suffix = if cancelled { "Canceled" } else { "Error" };
    format!("{} Discovery {}", provider.display_name(), suffix)
}

/// Label prefix for execution errors, by framework
pub fn execution_error_base(provider: TestProvider, cancelled: bool) -> String {
    let suffix = if cancelled { "Canceled" } else { "Error" };
    format!("{} Execution {}", provider.display_name(), suffix)
}

/// Create or update a top-level error node
pub fn upsert_error_node(tree: &mut TestTree, id: &str, label: String, error: String) {
    if tree.contains(id) {
        tree.update(id, |node| {
            node.label = label;
            node.error = Some(error);
        });
    } else {
        let mut node = TestEntity::new(id, EntityKind::Error, label);
        node.error = Some(error);
        tree.insert(node);
    }
}

/// Upsert the discovery error node for a failed discovery
pub fn record_discovery_error(
    tree: &mut TestTree,
    workspace: &Path,
    provider: TestProvider,
    errors: &[String],
) {
    let text = errors.join("\r\n\r\n");
    let label = error_label(&discovery_error_base(provider, false), workspace, &text);
    upsert_error_node(tree, &discovery_error_id(workspace), label, text);
}
