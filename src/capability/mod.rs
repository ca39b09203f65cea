pub mod builtin;
pub mod manifest;
pub mod module;
pub mod registry;
pub mod reload;
pub mod script;

use std::sync::Arc;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::plan::TaskPlanStore;
use crate::tools::skill_tools::SkillToolsContext;

pub use builtin::{BuiltinContext, BuiltinFinder};
pub use module::{Finder, Importer, Member, Module, ToolFactory};
pub use registry::{Capability, LoadIssue, LoadReport, Namespace, NamespaceKind, Registry};
pub use script::ScriptFinder;

/// The static namespace (built-ins plus curated skills on disk) followed by
/// the on-disk dynamic namespace.
pub fn build_registry(cfg: &RuntimeConfig) -> Registry {
    let timeout = Duration::from_secs(cfg.tool_timeout_secs);
    let builtin = BuiltinFinder::standard(
        cfg.static_namespace.clone(),
        BuiltinContext {
            plan_store: TaskPlanStore::new(cfg.plan_path.clone()),
            skills: SkillToolsContext::from_config(cfg),
        },
    );
    let curated = ScriptFinder::new(cfg.static_namespace.clone(), cfg.skills_dir.clone(), timeout);
    let generated = ScriptFinder::new(
        cfg.dynamic_namespace.clone(),
        cfg.auto_skills_dir.clone(),
        timeout,
    );
    let importer = Importer::new(vec![
        Arc::new(builtin) as Arc<dyn Finder>,
        Arc::new(curated) as Arc<dyn Finder>,
        Arc::new(generated) as Arc<dyn Finder>,
    ]);
    Registry::new(
        Arc::new(importer),
        vec![
            Namespace::fixed(cfg.static_namespace.clone()),
            Namespace::dynamic(cfg.dynamic_namespace.clone()),
        ],
    )
}
