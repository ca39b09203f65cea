use std::path::{Path, PathBuf};
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{FunctionTool, Tool, tool_error_payload};
use crate::capability::manifest::{MANIFEST_FILE_NAME, Manifest, parse_entry_text, retarget_entry};
use crate::capability::registry::default_entry;
use crate::capability::script::{ScriptModuleFile, ScriptToolSpec, is_identifier};
use crate::config::RuntimeConfig;
use crate::control::RELOAD_SENTINEL;

pub const INSPECT_ENVIRONMENT: &str = "inspect_environment";
pub const SCAFFOLD_SKILL: &str = "scaffold_skill";
pub const WRITE_TOOL_CODE: &str = "write_tool_code";
pub const RELOAD_SKILLS: &str = "reload_skills";
pub const PROMOTE_SKILL: &str = "promote_skill";

const SCRIPTS_DIR: &str = "scripts";
const REFERENCES_DIR: &str = "references";
const TOOLS_MODULE_FILE: &str = "tools.toml";
const USAGE_FILE: &str = "usage.md";
const KNOWN_INTERPRETERS: &[&str] = &["python3", "python", "node", "bash", "sh", "pwsh"];

const STUB_SCRIPT: &str = r#"import json
import sys

args = json.load(sys.stdin) if not sys.stdin.isatty() else {}
print(json.dumps({"status": "error", "code": "not_implemented", "error": "tool body not written yet", "args": args}))
"#;

/// Where generated skills are written, where promoted skills go, and which
/// namespaces mount the two directories.
#[derive(Debug, Clone)]
pub struct SkillToolsContext {
    pub auto_skills_dir: PathBuf,
    pub dynamic_namespace: String,
    pub skills_dir: PathBuf,
    pub static_namespace: String,
}

impl SkillToolsContext {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            auto_skills_dir: cfg.auto_skills_dir.clone(),
            dynamic_namespace: cfg.dynamic_namespace.clone(),
            skills_dir: cfg.skills_dir.clone(),
            static_namespace: cfg.static_namespace.clone(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ScaffoldSkillArgs {
    /// Package name: a letter followed by letters, digits or underscores.
    pub skill_name: String,
    /// One-paragraph summary of what the skill does.
    pub description: String,
    /// Tools exported by the skill.
    #[serde(default)]
    pub tools: Vec<ScaffoldToolArgs>,
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Usage notes written to references/usage.md.
    #[serde(default)]
    pub usage: Option<String>,
    /// Replace an existing skill of the same name.
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ScaffoldToolArgs {
    pub name: String,
    pub description: String,
    /// Script file under scripts/. Defaults to `<name>.py`.
    #[serde(default)]
    pub script_file: Option<String>,
    /// Command line run in scripts/. Defaults to `python3 <script_file>`.
    #[serde(default)]
    pub command: Option<String>,
    /// JSON schema of the tool arguments.
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PromoteSkillArgs {
    /// Name of a generated skill in the auto skills directory.
    pub skill_name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteToolCodeArgs {
    /// Path of an existing file, absolute or relative to the auto skills directory.
    pub file_path: String,
    /// Full new file contents.
    pub code: String,
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> Result<T, Value> {
    serde_json::from_value(args).map_err(|err| {
        tool_error_payload("invalid_args", format!("invalid arguments for {tool}: {err}"))
    })
}

// ---------------------------------------------------------------------------
// inspect_environment
// ---------------------------------------------------------------------------

pub fn inspect_environment_response(ctx: &SkillToolsContext) -> Value {
    let cwd = std::env::current_dir()
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    let interpreters = KNOWN_INTERPRETERS
        .iter()
        .filter_map(|name| find_on_path(name).map(|path| json!({"name": name, "path": path.display().to_string()})))
        .collect::<Vec<_>>();

    json!({
        "status": "ok",
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "family": std::env::consts::FAMILY,
        "cwd": cwd,
        "interpreters": interpreters,
        "auto_skills_dir": ctx.auto_skills_dir.display().to_string(),
        "dynamic_namespace": ctx.dynamic_namespace,
        "installed_skills": list_skill_dirs(&ctx.auto_skills_dir),
        "curated_skills": list_skill_dirs(&ctx.skills_dir),
    })
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn list_skill_dirs(root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut names = entries
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| is_identifier(name))
        .collect::<Vec<_>>();
    names.sort();
    names
}

// ---------------------------------------------------------------------------
// scaffold_skill
// ---------------------------------------------------------------------------

fn is_skill_name(name: &str) -> bool {
    name.chars().next().is_some_and(|ch| ch.is_ascii_alphabetic()) && is_identifier(name)
}

pub fn scaffold_skill_response(ctx: &SkillToolsContext, args: Value) -> Value {
    let args = match parse_args::<ScaffoldSkillArgs>(SCAFFOLD_SKILL, args) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    if !is_skill_name(&args.skill_name) {
        return tool_error_payload(
            "invalid_args",
            format!(
                "skill_name '{}' must start with a letter and contain only letters, digits and underscores",
                args.skill_name
            ),
        );
    }
    if let Some(bad) = args.tools.iter().find(|tool| !is_skill_name(&tool.name)) {
        return tool_error_payload(
            "invalid_args",
            format!("tool name '{}' is not a valid identifier", bad.name),
        );
    }

    let skill_dir = ctx.auto_skills_dir.join(&args.skill_name);
    if skill_dir.join(MANIFEST_FILE_NAME).exists() && !args.overwrite {
        return tool_error_payload(
            "already_exists",
            format!(
                "skill '{}' already exists; pass overwrite=true to replace it",
                args.skill_name
            ),
        );
    }

    match write_skill(ctx, &skill_dir, &args) {
        Ok(files) => {
            tracing::info!(skill = %args.skill_name, files = files.len(), "skill scaffolded");
            json!({
                "status": "created",
                "skill_dir": skill_dir.display().to_string(),
                "entry": entry_for(ctx, &args.skill_name),
                "files": files,
                "next": "Fill in the scripts with write_tool_code, then call reload_skills."
            })
        }
        Err(err) => tool_error_payload("write_failed", format!("{err:#}")),
    }
}

fn entry_for(ctx: &SkillToolsContext, skill_name: &str) -> String {
    format!("{}.{skill_name}.{SCRIPTS_DIR}", ctx.dynamic_namespace)
}

fn write_skill(
    ctx: &SkillToolsContext,
    skill_dir: &Path,
    args: &ScaffoldSkillArgs,
) -> anyhow::Result<Vec<String>> {
    use anyhow::Context as _;

    let scripts_dir = skill_dir.join(SCRIPTS_DIR);
    let references_dir = skill_dir.join(REFERENCES_DIR);
    std::fs::create_dir_all(&scripts_dir)
        .with_context(|| format!("failed to create {}", scripts_dir.display()))?;
    std::fs::create_dir_all(&references_dir)
        .with_context(|| format!("failed to create {}", references_dir.display()))?;

    let mut written = Vec::new();
    let mut specs = Vec::new();
    for tool in &args.tools {
        let script_file = tool
            .script_file
            .clone()
            .unwrap_or_else(|| format!("{}.py", tool.name));
        let command = tool
            .command
            .clone()
            .unwrap_or_else(|| format!("python3 {script_file}"));
        let parameters = match &tool.parameters {
            Some(schema) => Some(
                toml::Value::try_from(schema.clone())
                    .with_context(|| format!("parameters of '{}' cannot be stored as TOML", tool.name))?,
            ),
            None => None,
        };
        specs.push(ScriptToolSpec {
            name: tool.name.clone(),
            description: tool.description.clone(),
            command,
            timeout_secs: tool.timeout_secs,
            parameters,
        });

        let script_path = scripts_dir.join(&script_file);
        if !script_path.exists() {
            std::fs::write(&script_path, STUB_SCRIPT)
                .with_context(|| format!("failed to write {}", script_path.display()))?;
            written.push(script_path.display().to_string());
        }
    }

    let module = ScriptModuleFile {
        tools: specs,
        templates: Vec::new(),
    };
    let module_path = scripts_dir.join(TOOLS_MODULE_FILE);
    let module_text = toml::to_string_pretty(&module).context("failed to render tools module")?;
    std::fs::write(&module_path, module_text)
        .with_context(|| format!("failed to write {}", module_path.display()))?;
    written.push(module_path.display().to_string());

    let usage_path = references_dir.join(USAGE_FILE);
    let usage = args
        .usage
        .clone()
        .unwrap_or_else(|| format!("# {}\n\n{}\n", args.skill_name, args.description));
    std::fs::write(&usage_path, usage)
        .with_context(|| format!("failed to write {}", usage_path.display()))?;
    written.push(usage_path.display().to_string());

    let manifest = Manifest {
        name: args.skill_name.clone(),
        version: args.version.clone().unwrap_or_else(|| "0.1.0".to_string()),
        description: args.description.clone(),
        entry: entry_for(ctx, &args.skill_name),
        tools: args
            .tools
            .iter()
            .map(|tool| (tool.name.clone(), tool.description.clone()))
            .collect(),
        platforms: args.platforms.clone(),
        references: vec![format!("{REFERENCES_DIR}/{USAGE_FILE}")],
    };
    let manifest_path = skill_dir.join(MANIFEST_FILE_NAME);
    std::fs::write(&manifest_path, manifest.render())
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;
    written.push(manifest_path.display().to_string());

    Ok(written)
}

// ---------------------------------------------------------------------------
// write_tool_code
// ---------------------------------------------------------------------------

pub fn write_tool_code_response(ctx: &SkillToolsContext, args: Value) -> Value {
    let args = match parse_args::<WriteToolCodeArgs>(WRITE_TOOL_CODE, args) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    let requested = PathBuf::from(&args.file_path);
    let path = if requested.is_absolute() {
        requested
    } else {
        ctx.auto_skills_dir.join(requested)
    };
    if !path.is_file() {
        return tool_error_payload(
            "not_found",
            format!(
                "file '{}' does not exist; create it with scaffold_skill first",
                path.display()
            ),
        );
    }
    match std::fs::write(&path, &args.code) {
        Ok(()) => json!({
            "status": "written",
            "path": path.display().to_string(),
            "bytes": args.code.len()
        }),
        Err(err) => tool_error_payload(
            "write_failed",
            format!("failed to write '{}': {err}", path.display()),
        ),
    }
}

// ---------------------------------------------------------------------------
// promote_skill
// ---------------------------------------------------------------------------

/// Moves a generated skill into the curated directory of the static
/// namespace. The existing destination is never replaced.
pub fn promote_skill_response(ctx: &SkillToolsContext, args: Value) -> Value {
    let args = match parse_args::<PromoteSkillArgs>(PROMOTE_SKILL, args) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    if !is_skill_name(&args.skill_name) {
        return tool_error_payload(
            "invalid_args",
            format!("skill_name '{}' is not a valid skill name", args.skill_name),
        );
    }

    let source = ctx.auto_skills_dir.join(&args.skill_name);
    if !source.is_dir() {
        return tool_error_payload(
            "not_found",
            format!(
                "no generated skill named '{}' in {}",
                args.skill_name,
                ctx.auto_skills_dir.display()
            ),
        );
    }
    let target = ctx.skills_dir.join(&args.skill_name);
    if target.exists() {
        return tool_error_payload(
            "already_exists",
            format!(
                "a curated skill named '{}' already exists at {}",
                args.skill_name,
                target.display()
            ),
        );
    }

    match move_skill(ctx, &args.skill_name, &source, &target) {
        Ok(entry) => {
            tracing::info!(skill = %args.skill_name, entry = %entry, "skill promoted");
            json!({
                "status": "promoted",
                "skill": args.skill_name,
                "from": source.display().to_string(),
                "to": target.display().to_string(),
                "entry": entry,
                "next": "Call reload_skills to load it from the static namespace. \
                         Later edits to a promoted skill take effect after a restart."
            })
        }
        Err(err) => tool_error_payload("promote_failed", format!("{err:#}")),
    }
}

/// Returns the entry module the promoted skill loads from.
fn move_skill(
    ctx: &SkillToolsContext,
    skill_name: &str,
    source: &Path,
    target: &Path,
) -> anyhow::Result<String> {
    use anyhow::Context as _;

    std::fs::create_dir_all(&ctx.skills_dir)
        .with_context(|| format!("failed to create {}", ctx.skills_dir.display()))?;
    std::fs::rename(source, target).with_context(|| {
        format!("failed to move {} to {}", source.display(), target.display())
    })?;

    let fallback = default_entry(&ctx.static_namespace, skill_name);
    let manifest_path = target.join(MANIFEST_FILE_NAME);
    if !manifest_path.is_file() {
        return Ok(fallback);
    }
    let content = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let from = format!("{}.{skill_name}", ctx.dynamic_namespace);
    let to = format!("{}.{skill_name}", ctx.static_namespace);
    let Some(updated) = retarget_entry(&content, &from, &to) else {
        return Ok(parse_entry_text(&content).unwrap_or(fallback));
    };
    std::fs::write(&manifest_path, &updated)
        .with_context(|| format!("failed to write {}", manifest_path.display()))?;
    Ok(parse_entry_text(&updated).unwrap_or(fallback))
}

// ---------------------------------------------------------------------------
// reload_skills
// ---------------------------------------------------------------------------

pub fn reload_skills_response() -> Value {
    json!({
        "status": "reload_requested",
        "signal": RELOAD_SENTINEL,
        "message": "Skill reload requested. This turn ends now; continue once the reload notice arrives."
    })
}

pub fn build_skill_tools(ctx: SkillToolsContext) -> Vec<Arc<dyn Tool>> {
    let inspect_ctx = ctx.clone();
    let inspect = FunctionTool::new(
        INSPECT_ENVIRONMENT,
        "Report the host OS, available interpreters and already installed generated skills.\n\
         Call it before writing a new skill.",
        move |_args| {
            let ctx = inspect_ctx.clone();
            async move { Ok(inspect_environment_response(&ctx)) }
        },
    );

    let scaffold_ctx = ctx.clone();
    let scaffold = FunctionTool::new(
        SCAFFOLD_SKILL,
        "Create a new skill package with a manifest, a tools module and stub scripts.\n\
         The skill becomes callable after its scripts are written and reload_skills runs.",
        move |args| {
            let ctx = scaffold_ctx.clone();
            async move { Ok(scaffold_skill_response(&ctx, args)) }
        },
    )
    .with_schema::<ScaffoldSkillArgs>();

    let write_ctx = ctx.clone();
    let write = FunctionTool::new(
        WRITE_TOOL_CODE,
        "Overwrite an existing script file of a generated skill with new code.",
        move |args| {
            let ctx = write_ctx.clone();
            async move { Ok(write_tool_code_response(&ctx, args)) }
        },
    )
    .with_schema::<WriteToolCodeArgs>();

    let promote = FunctionTool::new(
        PROMOTE_SKILL,
        "Move a finished generated skill into the curated skills directory.\n\
         Its manifest entry is rewritten to the static namespace; call reload_skills afterwards.",
        move |args| {
            let ctx = ctx.clone();
            async move { Ok(promote_skill_response(&ctx, args)) }
        },
    )
    .with_schema::<PromoteSkillArgs>();

    let reload = FunctionTool::new(
        RELOAD_SKILLS,
        "Reload generated skills so new or edited tools become callable.\n\
         Ends the current turn immediately; do not call other tools after it.",
        |_args| async move { Ok(reload_skills_response()) },
    );

    vec![
        Arc::new(inspect),
        Arc::new(scaffold),
        Arc::new(write),
        Arc::new(promote),
        Arc::new(reload),
    ]
}
