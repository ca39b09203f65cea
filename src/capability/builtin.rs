//! Native capability modules compiled into the binary.
//!
//! The table maps dotted module paths to member builders. Packages are not
//! registered explicitly; every proper prefix of a registered path under the
//! mount prefix resolves to a package whose children are derived from the table.
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use super::module::{ChildModule, Finder, Member, Module, ToolFactory, is_within};
use crate::plan::TaskPlanStore;
use crate::tools::Tool;
use crate::tools::plan_tools::build_plan_tools;
use crate::tools::skill_tools::{SkillToolsContext, build_skill_tools};
use crate::tools::time_tools::CurrentTimeTool;

pub const TASK_TOOLS_MODULE: &str = "system_skill.scripts.task_tools";
pub const TIME_TOOLS_MODULE: &str = "system_skill.scripts.time_tools";
pub const SKILL_TOOLS_MODULE: &str = "skillgen_skill.scripts.skill_tools";

/// State the built-in tools close over.
#[derive(Debug, Clone)]
pub struct BuiltinContext {
    pub plan_store: TaskPlanStore,
    pub skills: SkillToolsContext,
}

pub type MemberBuilder = fn(&BuiltinContext) -> Vec<Member>;

pub struct BuiltinFinder {
    label: String,
    prefix: String,
    context: BuiltinContext,
    modules: BTreeMap<String, MemberBuilder>,
}

impl BuiltinFinder {
    pub fn new(prefix: impl Into<String>, context: BuiltinContext) -> Self {
        let prefix = prefix.into();
        Self {
            label: format!("builtin:{prefix}"),
            prefix,
            context,
            modules: BTreeMap::new(),
        }
    }

    /// The task plan, clock and skill generation modules.
    pub fn standard(prefix: impl Into<String>, context: BuiltinContext) -> Self {
        Self::new(prefix, context)
            .with_module(TASK_TOOLS_MODULE, task_tools_members)
            .with_module(TIME_TOOLS_MODULE, time_tools_members)
            .with_module(SKILL_TOOLS_MODULE, skill_tools_members)
    }

    /// Registers `relative` below the mount prefix.
    pub fn with_module(mut self, relative: &str, builder: MemberBuilder) -> Self {
        self.modules
            .insert(format!("{}.{relative}", self.prefix), builder);
        self
    }

    pub fn module_paths(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    fn children_of(&self, name: &str) -> Vec<ChildModule> {
        let mut children = BTreeMap::<String, bool>::new();
        let prefix = format!("{name}.");
        for path in self.modules.keys() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            let (child, nested) = match rest.split_once('.') {
                Some((child, _)) => (child, true),
                None => (rest, false),
            };
            *children.entry(child.to_string()).or_default() |= nested;
        }
        children
            .into_iter()
            .map(|(name, is_package)| ChildModule { name, is_package })
            .collect()
    }
}

impl Finder for BuiltinFinder {
    fn label(&self) -> &str {
        &self.label
    }

    fn find(&self, name: &str) -> Result<Option<Module>> {
        if !is_within(name, &self.prefix) {
            return Ok(None);
        }
        if let Some(builder) = self.modules.get(name) {
            return Ok(Some(Module::module(name, None, builder(&self.context))));
        }
        let children = self.children_of(name);
        if children.is_empty() && name != self.prefix {
            return Ok(None);
        }
        Ok(Some(Module::package(name, None, children)))
    }
}

fn tools_as_members(tools: Vec<Arc<dyn Tool>>) -> Vec<Member> {
    tools.into_iter().map(Member::Tool).collect()
}

fn task_tools_members(ctx: &BuiltinContext) -> Vec<Member> {
    tools_as_members(build_plan_tools(ctx.plan_store.clone()))
}

fn time_tools_members(_ctx: &BuiltinContext) -> Vec<Member> {
    vec![Member::Factory(ToolFactory::new("CurrentTimeTool", || {
        Ok(Arc::new(CurrentTimeTool::new()) as Arc<dyn Tool>)
    }))]
}

fn skill_tools_members(ctx: &BuiltinContext) -> Vec<Member> {
    tools_as_members(build_skill_tools(ctx.skills.clone()))
}
