//! Module cache invalidation for the dynamic namespace.
use serde::Serialize;

use super::module::Importer;
use crate::tools::ToolSet;

/// Evicts the namespace root and drops every finder's listing cache.
pub fn invalidate_namespace_root(importer: &Importer, root: &str) -> bool {
    let evicted = importer.evict(root);
    importer.invalidate_caches();
    tracing::debug!(root, evicted, "namespace root invalidated");
    evicted
}

/// Evicts an entry module, its `scripts` variant and all their descendants.
pub fn invalidate_entry(importer: &Importer, entry: &str) -> Vec<String> {
    let mut evicted = importer.evict_tree(entry);
    evicted.extend(importer.evict_tree(&format!("{entry}.scripts")));
    if !evicted.is_empty() {
        tracing::debug!(entry, modules = ?evicted, "entry modules evicted");
    }
    evicted
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub generation: u64,
    pub tool_count: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub issues: usize,
}

impl ReloadSummary {
    pub fn describe(&self) -> String {
        let mut text = format!(
            "generation {}, {} tools loaded",
            self.generation, self.tool_count
        );
        if !self.added.is_empty() {
            text.push_str(&format!(", new: {}", self.added.join(", ")));
        }
        if !self.removed.is_empty() {
            text.push_str(&format!(", removed: {}", self.removed.join(", ")));
        }
        if self.issues > 0 {
            text.push_str(&format!(", {} load issues", self.issues));
        }
        text
    }
}

/// Tool names present only in `after`, and only in `before`.
pub fn diff_tool_names(before: &ToolSet, after: &ToolSet) -> (Vec<String>, Vec<String>) {
    let added = after
        .names()
        .into_iter()
        .filter(|name| before.get(name).is_none())
        .collect();
    let removed = before
        .names()
        .into_iter()
        .filter(|name| after.get(name).is_none())
        .collect();
    (added, removed)
}
