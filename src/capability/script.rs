//! Filesystem-backed script modules.
//!
//! A [`ScriptFinder`] mounts a directory under a namespace prefix. Directories
//! are packages and `<name>.toml` files are modules declaring `[[tool]]` and
//! `[[template]]` entries. Script tools run an external command with the call
//! arguments as JSON on stdin and in `SKILLHOST_TOOL_ARGS`.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;

use super::module::{ChildModule, Finder, Member, Module, ToolFactory, is_within};
use crate::tools::{Tool, empty_object_schema};

pub const SCRIPT_MODULE_EXTENSION: &str = "toml";
pub const TOOL_ARGS_ENV: &str = "SKILLHOST_TOOL_ARGS";
pub const SCRIPT_MAX_OUTPUT_CHARS: usize = 20_000;

// ---------------------------------------------------------------------------
// Module file format
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptModuleFile {
    #[serde(default, rename = "tool", skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ScriptToolSpec>,
    #[serde(default, rename = "template", skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<ScriptTemplateSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptToolSpec {
    pub name: String,
    pub description: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptTemplateSpec {
    pub name: String,
    pub description: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<toml::Value>,
    #[serde(default)]
    pub params: BTreeMap<String, TemplateParam>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateParam {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

pub fn parse_script_module(content: &str) -> Result<ScriptModuleFile> {
    toml::from_str::<ScriptModuleFile>(content).context("invalid script module")
}

impl ScriptTemplateSpec {
    /// Fills `{param}` placeholders from defaults. Fails when a parameter has no default.
    pub fn instantiate(&self) -> Result<ScriptToolSpec> {
        let mut command = self.command.clone();
        for (key, param) in &self.params {
            let value = param.default.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "template '{}' requires constructor argument '{key}'",
                    self.name
                )
            })?;
            command = command.replace(&format!("{{{key}}}"), value);
        }
        Ok(ScriptToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            command,
            timeout_secs: self.timeout_secs,
            parameters: self.parameters.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Finder
// ---------------------------------------------------------------------------

pub struct ScriptFinder {
    label: String,
    prefix: String,
    root: PathBuf,
    default_timeout: Duration,
    listings: Mutex<HashMap<PathBuf, Vec<ChildModule>>>,
}

impl ScriptFinder {
    pub fn new(prefix: impl Into<String>, root: impl Into<PathBuf>, default_timeout: Duration) -> Self {
        let prefix = prefix.into();
        Self {
            label: format!("script:{prefix}"),
            prefix,
            root: root.into(),
            default_timeout,
            listings: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let mut path = self.root.clone();
        if let Some(rest) = name.strip_prefix(&self.prefix) {
            for segment in rest.split('.').filter(|segment| !segment.is_empty()) {
                path.push(segment);
            }
        }
        path
    }

    fn list_children(&self, dir: &Path) -> Result<Vec<ChildModule>> {
        let mut listings = self.listings.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(children) = listings.get(dir) {
            return Ok(children.clone());
        }
        let children = scan_directory(dir)?;
        listings.insert(dir.to_path_buf(), children.clone());
        Ok(children)
    }

    fn load_module(&self, name: &str, file: &Path) -> Result<Module> {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read script module '{}'", file.display()))?;
        let parsed = parse_script_module(&content)
            .with_context(|| format!("failed to parse script module '{}'", file.display()))?;
        let workdir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let mut members = Vec::new();
        for spec in parsed.tools {
            members.push(Member::Tool(Arc::new(ScriptTool::new(
                spec,
                workdir.clone(),
                self.default_timeout,
            ))));
        }
        for template in parsed.templates {
            let workdir = workdir.clone();
            let default_timeout = self.default_timeout;
            let factory_name = template.name.clone();
            members.push(Member::Factory(ToolFactory::new(factory_name, move || {
                let spec = template.instantiate()?;
                Ok(Arc::new(ScriptTool::new(spec, workdir.clone(), default_timeout)) as Arc<dyn Tool>)
            })));
        }

        Ok(Module::module(name, Some(file.to_path_buf()), members))
    }
}

impl Finder for ScriptFinder {
    fn label(&self) -> &str {
        &self.label
    }

    fn find(&self, name: &str) -> Result<Option<Module>> {
        if !is_within(name, &self.prefix) {
            return Ok(None);
        }

        let path = self.path_for(name);
        if path.is_dir() {
            let children = self.list_children(&path)?;
            return Ok(Some(Module::package(name, Some(path), children)));
        }

        let file = path.with_extension(SCRIPT_MODULE_EXTENSION);
        if file.is_file() {
            return self.load_module(name, &file).map(Some);
        }

        Ok(None)
    }

    fn invalidate_caches(&self) {
        self.listings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Sorted immediate children; a package shadows a module file of the same name.
fn scan_directory(dir: &Path) -> Result<Vec<ChildModule>> {
    let mut children = BTreeMap::<String, bool>::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list package directory '{}'", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in '{}'", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if is_identifier(name) && !name.starts_with("__") {
                children.insert(name.to_string(), true);
            }
        } else if path.extension().and_then(|ext| ext.to_str()) == Some(SCRIPT_MODULE_EXTENSION) {
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if is_identifier(stem) {
                children.entry(stem.to_string()).or_insert(false);
            }
        }
    }
    Ok(children
        .into_iter()
        .map(|(name, is_package)| ChildModule { name, is_package })
        .collect())
}

// ---------------------------------------------------------------------------
// Script tools
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScriptTool {
    name: String,
    description: String,
    command: String,
    parameters: Value,
    workdir: PathBuf,
    timeout: Duration,
}

impl ScriptTool {
    pub fn new(spec: ScriptToolSpec, workdir: PathBuf, default_timeout: Duration) -> Self {
        let parameters = spec
            .parameters
            .as_ref()
            .and_then(|value| serde_json::to_value(value).ok())
            .unwrap_or_else(empty_object_schema);
        Self {
            name: spec.name,
            description: spec.description,
            command: spec.command,
            parameters,
            workdir,
            timeout: spec
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Tool for ScriptTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn call(&self, args: Value) -> Result<Value> {
        Ok(run_script(&self.command, &self.workdir, &args, self.timeout).await)
    }
}

pub fn script_error_payload(command: &str, code: &str, message: impl Into<String>) -> Value {
    json!({
        "status": "error",
        "kind": "script",
        "code": code,
        "error": message.into(),
        "command": command
    })
}

pub fn truncate_text(text: &str, max_chars: usize) -> (String, bool) {
    let mut iter = text.chars();
    let truncated = iter.by_ref().take(max_chars).collect::<String>();
    if iter.next().is_some() {
        (truncated, true)
    } else {
        (text.to_string(), false)
    }
}

pub async fn run_script(command: &str, workdir: &Path, args: &Value, timeout: Duration) -> Value {
    let Some(parts) = shlex::split(command) else {
        return script_error_payload(command, "invalid_command", "command has unbalanced quotes");
    };
    let Some((program, program_args)) = parts.split_first() else {
        return script_error_payload(command, "invalid_command", "command is empty");
    };

    let args_json = args.to_string();
    let spawned = tokio::process::Command::new(program)
        .args(program_args)
        .current_dir(workdir)
        .env(TOOL_ARGS_ENV, &args_json)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            return script_error_payload(command, "spawn_failed", format!("failed to launch: {err}"));
        }
    };

    if let Some(mut stdin) = child.stdin.take()
        && let Err(err) = stdin.write_all(args_json.as_bytes()).await
    {
        tracing::debug!(command, error = %err, "script closed stdin early");
    }

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return script_error_payload(command, "io_error", format!("failed to collect output: {err}"));
        }
        Err(_) => {
            return script_error_payload(
                command,
                "timeout",
                format!("command timed out after {}s", timeout.as_secs()),
            );
        }
    };

    let stdout_text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr_text = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let (stderr, stderr_truncated) = truncate_text(&stderr_text, SCRIPT_MAX_OUTPUT_CHARS);

    if !output.status.success() {
        let (stdout, stdout_truncated) = truncate_text(&stdout_text, SCRIPT_MAX_OUTPUT_CHARS);
        return json!({
            "status": "error",
            "kind": "script",
            "code": "command_failed",
            "error": format!("command exited with non-zero status: {}", output.status),
            "command": command,
            "exit_code": output.status.code().unwrap_or(-1),
            "stdout": stdout,
            "stderr": stderr,
            "stdout_truncated": stdout_truncated,
            "stderr_truncated": stderr_truncated
        });
    }

    if let Ok(parsed) = serde_json::from_str::<Value>(&stdout_text)
        && (parsed.is_object() || parsed.is_array())
    {
        return parsed;
    }

    let (stdout, stdout_truncated) = truncate_text(&stdout_text, SCRIPT_MAX_OUTPUT_CHARS);
    json!({
        "status": "ok",
        "output": stdout,
        "stderr": stderr,
        "output_truncated": stdout_truncated
    })
}
