//! Module resolution for capability namespaces.
//!
//! Capabilities are addressed by dotted module paths. A [`Finder`] turns a
//! path into a [`Module`]; the [`Importer`] asks its finders in order and keeps
//! every resolved module in a cache until it is explicitly evicted. Several
//! finders may serve the same package; their listings are merged.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};

use crate::tools::Tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Package,
    Module,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildModule {
    pub name: String,
    pub is_package: bool,
}

type Constructor = Arc<dyn Fn() -> Result<Arc<dyn Tool>> + Send + Sync>;

/// Builds a tool with no arguments. Fails when the tool needs configuration.
#[derive(Clone)]
pub struct ToolFactory {
    pub name: String,
    construct: Constructor,
}

impl ToolFactory {
    pub fn new<F>(name: impl Into<String>, construct: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Tool>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            construct: Arc::new(construct),
        }
    }

    pub fn instantiate(&self) -> Result<Arc<dyn Tool>> {
        (self.construct)()
    }
}

/// Something a module exports.
#[derive(Clone)]
pub enum Member {
    Tool(Arc<dyn Tool>),
    Factory(ToolFactory),
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Member::Tool(tool) => write!(f, "Tool({})", tool.name()),
            Member::Factory(factory) => write!(f, "Factory({})", factory.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub kind: ModuleKind,
    /// Directory of a package or file of a module, when backed by disk.
    pub location: Option<PathBuf>,
    pub children: Vec<ChildModule>,
    pub members: Vec<Member>,
}

impl Module {
    pub fn package(
        name: impl Into<String>,
        location: Option<PathBuf>,
        children: Vec<ChildModule>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: ModuleKind::Package,
            location,
            children,
            members: Vec::new(),
        }
    }

    pub fn module(name: impl Into<String>, location: Option<PathBuf>, members: Vec<Member>) -> Self {
        Self {
            name: name.into(),
            kind: ModuleKind::Module,
            location,
            children: Vec::new(),
            members,
        }
    }

    pub fn is_package(&self) -> bool {
        self.kind == ModuleKind::Package
    }

    pub fn subpackages(&self) -> impl Iterator<Item = &ChildModule> {
        self.children.iter().filter(|child| child.is_package)
    }

    pub fn child_path(&self, child: &str) -> String {
        format!("{}.{}", self.name, child)
    }

    fn merge_listing(&mut self, other: Module) {
        if self.location.is_none() {
            self.location = other.location;
        }
        for child in other.children {
            match self.children.iter_mut().find(|known| known.name == child.name) {
                Some(known) => known.is_package |= child.is_package,
                None => self.children.push(child),
            }
        }
        self.children.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// Resolves dotted module paths under the prefixes it mounts.
pub trait Finder: Send + Sync {
    fn label(&self) -> &str;

    /// `Ok(None)` when the name is not handled by this finder.
    fn find(&self, name: &str) -> Result<Option<Module>>;

    /// Drops any directory listings or other lookup state the finder caches.
    fn invalidate_caches(&self) {}
}

pub fn is_within(name: &str, root: &str) -> bool {
    name == root
        || name
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('.'))
}

pub fn validate_module_path(name: &str) -> Result<()> {
    if name.is_empty() || name.split('.').any(|segment| segment.trim().is_empty()) {
        return Err(anyhow::anyhow!("invalid module path '{name}'"));
    }
    Ok(())
}

/// Finder chain plus the module cache.
pub struct Importer {
    finders: Vec<Arc<dyn Finder>>,
    cache: Mutex<BTreeMap<String, Arc<Module>>>,
}

impl Importer {
    pub fn new(finders: Vec<Arc<dyn Finder>>) -> Self {
        Self {
            finders,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn import(&self, name: &str) -> Result<Arc<Module>> {
        validate_module_path(name)?;
        if let Some(module) = self.lock_cache().get(name) {
            return Ok(module.clone());
        }

        let module = Arc::new(self.resolve(name)?);
        let mut cache = self.lock_cache();
        Ok(cache.entry(name.to_string()).or_insert(module).clone())
    }

    /// Re-reads `name` from the finders without consulting or updating the
    /// module cache. Finder lookup state is dropped first.
    pub fn rescan(&self, name: &str) -> Result<Arc<Module>> {
        validate_module_path(name)?;
        self.invalidate_caches();
        self.resolve(name).map(Arc::new)
    }

    /// First module wins; packages found by later finders are merged into it.
    fn resolve(&self, name: &str) -> Result<Module> {
        let mut resolved: Option<Module> = None;
        for finder in &self.finders {
            let found = finder
                .find(name)
                .with_context(|| format!("failed to import module '{name}' ({})", finder.label()))?;
            let Some(module) = found else {
                continue;
            };
            tracing::debug!(module = name, finder = finder.label(), "module resolved");
            match resolved.as_mut() {
                None if !module.is_package() => return Ok(module),
                None => resolved = Some(module),
                Some(package) if module.is_package() => package.merge_listing(module),
                Some(_) => {
                    tracing::debug!(module = name, finder = finder.label(), "module shadowed by package");
                }
            }
        }

        resolved.ok_or_else(|| anyhow::anyhow!("no module named '{name}'"))
    }

    pub fn evict(&self, name: &str) -> bool {
        self.lock_cache().remove(name).is_some()
    }

    /// Evicts `root` and every module below it. Returns the evicted names.
    pub fn evict_tree(&self, root: &str) -> Vec<String> {
        let mut cache = self.lock_cache();
        let doomed = cache
            .keys()
            .filter(|name| is_within(name, root))
            .cloned()
            .collect::<Vec<_>>();
        for name in &doomed {
            cache.remove(name);
        }
        doomed
    }

    pub fn invalidate_caches(&self) {
        for finder in &self.finders {
            finder.invalidate_caches();
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<Module>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}
