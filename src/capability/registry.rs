//! Capability discovery across namespaces.
//!
//! Each namespace root is imported, its immediate sub-packages are treated as
//! capabilities, and every capability's entry module (declared in `skill.md`
//! or `<namespace>.<package>.scripts` by default) is inspected for tools.
//! Nothing in here is fatal: broken namespaces, manifests and modules are
//! recorded as [`LoadIssue`]s and skipped.
use std::sync::Arc;

use serde::Serialize;

use super::manifest::{MANIFEST_FILE_NAME, parse_entry};
use super::module::{Importer, Member, Module};
use super::reload::{invalidate_entry, invalidate_namespace_root};
use crate::tools::{ToolOrigin, ToolSet};

const SCRIPTS_SEGMENT: &str = "scripts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceKind {
    /// Modules are loaded once per process and never evicted. The root
    /// listing is re-read so newly installed packages still appear.
    Static,
    /// Evicted and re-imported on every build.
    Dynamic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Namespace {
    pub name: String,
    pub kind: NamespaceKind,
}

impl Namespace {
    pub fn fixed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NamespaceKind::Static,
        }
    }

    pub fn dynamic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NamespaceKind::Dynamic,
        }
    }

    fn is_scripts_target(&self) -> bool {
        self.name.rsplit('.').next() == Some(SCRIPTS_SEGMENT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub namespace: String,
    pub package: String,
    pub declared_entry: Option<String>,
    pub entry: String,
    pub tools: Vec<String>,
}

pub fn default_entry(namespace: &str, package: &str) -> String {
    format!("{namespace}.{package}.{SCRIPTS_SEGMENT}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStage {
    Namespace,
    Entry,
    Module,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadIssue {
    pub namespace: String,
    pub stage: LoadStage,
    pub module: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub tools: ToolSet,
    pub capabilities: Vec<Capability>,
    pub issues: Vec<LoadIssue>,
    /// Tool names that replaced an earlier tool of the same name.
    pub overridden: Vec<String>,
}

impl LoadReport {
    pub fn namespace_failed(&self, namespace: &str) -> Option<&LoadIssue> {
        self.issues
            .iter()
            .find(|issue| issue.stage == LoadStage::Namespace && issue.namespace == namespace)
    }
}

pub struct Registry {
    importer: Arc<Importer>,
    namespaces: Vec<Namespace>,
}

impl Registry {
    pub fn new(importer: Arc<Importer>, namespaces: Vec<Namespace>) -> Self {
        Self {
            importer,
            namespaces,
        }
    }

    pub fn importer(&self) -> &Arc<Importer> {
        &self.importer
    }

    pub fn namespaces(&self) -> &[Namespace] {
        &self.namespaces
    }

    /// Builds the merged tool set, namespaces in order, last write wins.
    pub fn build(&self) -> LoadReport {
        let mut report = LoadReport::default();
        for namespace in &self.namespaces {
            self.load_namespace(namespace, &mut report);
        }
        tracing::debug!(
            tools = report.tools.len(),
            capabilities = report.capabilities.len(),
            issues = report.issues.len(),
            "registry built"
        );
        report
    }

    fn load_namespace(&self, namespace: &Namespace, report: &mut LoadReport) {
        let root = match namespace.kind {
            NamespaceKind::Dynamic => {
                invalidate_namespace_root(&self.importer, &namespace.name);
                self.importer.import(&namespace.name)
            }
            NamespaceKind::Static => self.importer.rescan(&namespace.name),
        };
        let root = match root {
            Ok(root) => root,
            Err(err) => {
                tracing::warn!(namespace = %namespace.name, error = %format!("{err:#}"), "namespace import failed; skipping");
                report.issues.push(LoadIssue {
                    namespace: namespace.name.clone(),
                    stage: LoadStage::Namespace,
                    module: namespace.name.clone(),
                    error: format!("{err:#}"),
                });
                return;
            }
        };

        if namespace.is_scripts_target() {
            let package = namespace
                .name
                .rsplit('.')
                .nth(1)
                .unwrap_or(namespace.name.as_str())
                .to_string();
            let tools = self.collect_from_module_tree(namespace, &root, report);
            report.capabilities.push(Capability {
                namespace: namespace.name.clone(),
                package,
                declared_entry: None,
                entry: namespace.name.clone(),
                tools,
            });
            return;
        }

        for package in root.subpackages() {
            let declared_entry = root
                .location
                .as_ref()
                .and_then(|dir| parse_entry(&dir.join(&package.name).join(MANIFEST_FILE_NAME)));
            let entry = declared_entry
                .clone()
                .unwrap_or_else(|| default_entry(&namespace.name, &package.name));
            let tools = self.load_entry(namespace, &entry, report);
            report.capabilities.push(Capability {
                namespace: namespace.name.clone(),
                package: package.name.clone(),
                declared_entry,
                entry,
                tools,
            });
        }
    }

    fn load_entry(&self, namespace: &Namespace, entry: &str, report: &mut LoadReport) -> Vec<String> {
        if namespace.kind == NamespaceKind::Dynamic {
            invalidate_entry(&self.importer, entry);
        }
        match self.importer.import(entry) {
            Ok(module) => self.collect_from_module_tree(namespace, &module, report),
            Err(err) => {
                tracing::warn!(namespace = %namespace.name, entry, error = %format!("{err:#}"), "capability entry import failed; skipping");
                report.issues.push(LoadIssue {
                    namespace: namespace.name.clone(),
                    stage: LoadStage::Entry,
                    module: entry.to_string(),
                    error: format!("{err:#}"),
                });
                Vec::new()
            }
        }
    }

    /// A package yields its immediate children; a module is inspected alone.
    fn collect_from_module_tree(
        &self,
        namespace: &Namespace,
        module: &Module,
        report: &mut LoadReport,
    ) -> Vec<String> {
        if !module.is_package() {
            return collect_members(namespace, module, report);
        }

        let mut names = Vec::new();
        for child in &module.children {
            let path = module.child_path(&child.name);
            match self.importer.import(&path) {
                Ok(submodule) => names.extend(collect_members(namespace, &submodule, report)),
                Err(err) => {
                    tracing::warn!(namespace = %namespace.name, module = %path, error = %format!("{err:#}"), "capability module import failed; skipping");
                    report.issues.push(LoadIssue {
                        namespace: namespace.name.clone(),
                        stage: LoadStage::Module,
                        module: path,
                        error: format!("{err:#}"),
                    });
                }
            }
        }
        names
    }
}

fn collect_members(namespace: &Namespace, module: &Module, report: &mut LoadReport) -> Vec<String> {
    let mut names = Vec::new();
    for member in &module.members {
        let tool = match member {
            Member::Tool(tool) => tool.clone(),
            Member::Factory(factory) => match factory.instantiate() {
                Ok(tool) => tool,
                Err(err) => {
                    tracing::debug!(module = %module.name, factory = %factory.name, error = %err, "factory needs arguments; skipped");
                    continue;
                }
            },
        };
        let name = tool.name().to_string();
        let origin = ToolOrigin {
            namespace: namespace.name.clone(),
            module: module.name.clone(),
        };
        if let Some(previous) = report.tools.insert(tool, origin) {
            tracing::info!(
                tool = %name,
                replaced = %previous.origin.module,
                by = %module.name,
                "tool name collision; later definition wins"
            );
            report.overridden.push(name.clone());
        }
        names.push(name);
    }
    names
}
