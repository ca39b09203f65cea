use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};

use crate::bus::{Broadcaster, InboundMessage, InputQueue, InputReceiver, InputSource};
use crate::capability::manifest::parse_entry;
use crate::capability::registry::LoadStage;
use crate::capability::{NamespaceKind, build_registry};
use crate::cli::*;
use crate::config::*;
use crate::control::*;
use crate::error::*;
use crate::history::{History, SUMMARY_HEADER};
use crate::model::{ChatModel, Message, ModelReply, ModelRequest, Role, ToolCall};
use crate::plan::TaskPlanStore;
use crate::provider::*;
use crate::runner::AgentRunner;
use crate::runtime::AgentRuntime;
use crate::server::*;
use crate::session::*;
use crate::telemetry::*;
use crate::tools::plan_tools::{
    append_task_step_response, mark_task_completed_response, read_task_plan_response,
};
use crate::tools::skill_tools::{
    SkillToolsContext, build_skill_tools, promote_skill_response, scaffold_skill_response,
    write_tool_code_response,
};
use crate::tools::time_tools::CURRENT_TIME_TOOL_NAME;
use crate::tools::{FunctionTool, Tool, ToolOrigin, ToolSet};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn base_cfg(root: &Path) -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: root.join("config.toml").to_string_lossy().to_string(),
        provider: Provider::Auto,
        model: None,
        temperature: 0.7,
        show_sensitive_config: false,
        static_namespace: STATIC_NAMESPACE.to_string(),
        dynamic_namespace: DYNAMIC_NAMESPACE.to_string(),
        auto_skills_dir: root.join("auto_skills"),
        skills_dir: root.join("skills"),
        plan_path: root.join("current_task_plan.json"),
        max_auto_steps: 30,
        max_tool_rounds: 10,
        tool_timeout_secs: 30,
        compact_threshold: 24,
        compact_keep_recent: 8,
        telemetry_enabled: false,
        telemetry_path: root.join("events.jsonl").to_string_lossy().to_string(),
    }
}

fn test_cli(config_path: &str, profile: &str) -> Cli {
    Cli {
        provider: Provider::Auto,
        model: None,
        profile: profile.to_string(),
        config_path: config_path.to_string(),
        show_sensitive_config: false,
        auto_skills_dir: None,
        skills_dir: None,
        plan_path: None,
        max_auto_steps: None,
        max_tool_rounds: None,
        tool_timeout_secs: None,
        compact_threshold: None,
        compact_keep_recent: None,
        temperature: None,
        telemetry_enabled: None,
        telemetry_path: None,
        log_filter: "warn".to_string(),
        command: None,
    }
}

fn write_module(root: &Path, skill: &str, module: &str, body: &str) {
    let scripts = root.join(skill).join("scripts");
    std::fs::create_dir_all(&scripts).expect("skill directory should create");
    std::fs::write(scripts.join(format!("{module}.toml")), body).expect("module should write");
}

fn single_tool_module(name: &str, description: &str) -> String {
    format!("[[tool]]\nname = \"{name}\"\ndescription = \"{description}\"\ncommand = \"echo {name}\"\n")
}

/// Replays canned replies and records every request it receives.
#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<VecDeque<Result<ModelReply, String>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    fn with_replies(replies: Vec<ModelReply>) -> Arc<Self> {
        let model = Self::default();
        model.push_all(replies);
        Arc::new(model)
    }

    fn push_all(&self, replies: Vec<ModelReply>) {
        let mut queue = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        queue.extend(replies.into_iter().map(Ok));
    }

    fn push_error(&self, message: &str) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(message.to_string()));
    }

    fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn last_user_input(&self, index: usize) -> String {
        let requests = self.requests();
        requests[index]
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted/test"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let next = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Err(anyhow::anyhow!("scripted model has no replies left")),
        }
    }
}

/// Hands out the shared scripted model; providers listed in `failing` have no credentials.
struct StubResolver {
    model: Arc<ScriptedModel>,
    failing: Mutex<Vec<Provider>>,
}

impl StubResolver {
    fn new(model: Arc<ScriptedModel>) -> Arc<Self> {
        Arc::new(Self {
            model,
            failing: Mutex::new(Vec::new()),
        })
    }

    fn fail_for(&self, provider: Provider) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(provider);
    }
}

impl ModelResolver for StubResolver {
    fn resolve(&self, cfg: &RuntimeConfig) -> Result<(Arc<dyn ChatModel>, Provider, String)> {
        let provider = match cfg.provider {
            Provider::Auto => Provider::Deepseek,
            provider => provider,
        };
        let failing = self.failing.lock().unwrap_or_else(|e| e.into_inner());
        if failing.contains(&provider) {
            return Err(anyhow::anyhow!(
                "NVIDIA_API_KEY is required for provider '{provider}'"
            ));
        }
        let model_name = cfg
            .model
            .clone()
            .unwrap_or_else(|| format!("{}-scripted", provider.id()));
        Ok((self.model.clone() as Arc<dyn ChatModel>, provider, model_name))
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(&'static str, String)>>,
}

impl RecordingSink {
    fn of_kind(&self, kind: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(event_kind, _)| *event_kind == kind)
            .map(|(_, text)| text.clone())
            .collect()
    }

    fn record(&self, kind: &'static str, text: &str) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((kind, text.to_string()));
    }
}

impl OutputSink for RecordingSink {
    fn agent(&self, text: &str) {
        self.record("agent", text);
    }

    fn notice(&self, text: &str) {
        self.record("notice", text);
    }

    fn error(&self, text: &str) {
        self.record("error", text);
    }
}

struct Harness {
    dir: TempDir,
    cfg: RuntimeConfig,
    model: Arc<ScriptedModel>,
    resolver: Arc<StubResolver>,
    runtime: Arc<AgentRuntime>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new(replies: Vec<ModelReply>) -> Self {
        Self::with_cfg(replies, |_| {})
    }

    fn with_cfg(replies: Vec<ModelReply>, tweak: impl FnOnce(&mut RuntimeConfig)) -> Self {
        let dir = tempdir().expect("temp directory should create");
        let mut cfg = base_cfg(dir.path());
        tweak(&mut cfg);
        std::fs::create_dir_all(&cfg.auto_skills_dir).expect("auto skills dir should create");
        let model = ScriptedModel::with_replies(replies);
        let resolver = StubResolver::new(model.clone());
        let runtime = AgentRuntime::build(
            &cfg,
            build_registry(&cfg),
            resolver.clone(),
            TelemetrySink::disabled(),
        )
        .expect("runtime should build");
        Self {
            dir,
            cfg,
            model,
            resolver,
            runtime: Arc::new(runtime),
            sink: Arc::new(RecordingSink::default()),
        }
    }

    fn session(&self) -> Session {
        Session::new(
            self.cfg.clone(),
            self.runtime.clone(),
            TelemetrySink::disabled(),
            self.sink.clone(),
        )
    }

    fn server_state(&self) -> (Arc<ServerState>, InputReceiver) {
        let (inputs, receiver) = InputQueue::new();
        let state = ServerState {
            runtime: self.runtime.clone(),
            inputs,
            broadcaster: Broadcaster::new(),
            telemetry: TelemetrySink::disabled(),
            profile: "default".to_string(),
            auth_token: None,
        };
        (Arc::new(state), receiver)
    }
}

fn call(id: &str, name: &str, arguments: Value) -> ModelReply {
    ModelReply {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }],
    }
}

fn noop_tool(name: &str) -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(name, "noop tool", |_args| async move {
        Ok(json!({ "ok": true }))
    }))
}

fn test_runner(model: Arc<ScriptedModel>, tools: Vec<Arc<dyn Tool>>, max_rounds: usize) -> AgentRunner {
    let mut set = ToolSet::new();
    for tool in tools {
        set.insert(
            tool,
            ToolOrigin {
                namespace: "test".to_string(),
                module: "test.tools".to_string(),
            },
        );
    }
    AgentRunner::new(
        model,
        Arc::new(set),
        "system".to_string(),
        max_rounds,
        Duration::from_millis(200),
        TelemetrySink::disabled(),
    )
}

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

#[test]
fn runtime_config_uses_selected_profile_defaults() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[profiles.dev]
provider = "qwen"
model = "qwen-max"
auto_skills_dir = "work/auto_skills"
skills_dir = "work/skills"
max_auto_steps = 12
compact_threshold = 10
compact_keep_recent = 4
telemetry_enabled = false
"#,
    )
    .expect("config should write");

    let cli = test_cli(path.to_string_lossy().as_ref(), "dev");
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.profile, "dev");
    assert_eq!(cfg.provider, Provider::Qwen);
    assert_eq!(cfg.model.as_deref(), Some("qwen-max"));
    assert_eq!(cfg.auto_skills_dir, Path::new("work/auto_skills"));
    assert_eq!(cfg.skills_dir, Path::new("work/skills"));
    assert_eq!(cfg.max_auto_steps, 12);
    assert_eq!(cfg.max_tool_rounds, 100);
    assert_eq!(cfg.compact_threshold, 10);
    assert_eq!(cfg.compact_keep_recent, 4);
    assert!(!cfg.telemetry_enabled);
    assert_eq!(cfg.static_namespace, "skills");
    assert_eq!(cfg.dynamic_namespace, "auto_skills");
}

#[test]
fn runtime_config_cli_overrides_profile_values() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[profiles.default]\nprovider = \"qwen\"\nmax_auto_steps = 5\n",
    )
    .expect("config should write");

    let mut cli = test_cli(path.to_string_lossy().as_ref(), "default");
    cli.provider = Provider::NimGlm47;
    cli.max_auto_steps = Some(0);
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.provider, Provider::NimGlm47);
    assert_eq!(cfg.max_auto_steps, 1, "auto-step cap never drops below one");
}

#[test]
fn runtime_config_reports_missing_profile() {
    let cli = test_cli("/definitely/not/here.toml", "staging");
    let err = resolve_runtime_config(&cli, &ProfilesFile::default())
        .expect_err("unknown profile should fail");
    assert!(err.to_string().contains("No profiles are defined yet"));
    assert_eq!(categorize_error(&err), ErrorCategory::Input);
}

#[test]
fn unknown_profile_fields_are_rejected() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[profiles.dev]\nsession_backend = \"sqlite\"\n")
        .expect("config should write");
    assert!(load_profiles(path.to_string_lossy().as_ref()).is_err());
}

#[test]
fn error_taxonomy_distinguishes_provider_capability_and_plan() {
    let provider_err = anyhow::anyhow!("DEEPSEEK_API_KEY is required");
    let capability_err =
        anyhow::anyhow!("capability namespace 'auto_skills' could not be re-imported");
    let plan_err = anyhow::anyhow!("failed to parse task plan 'plan.json'");
    let server_err = anyhow::anyhow!("failed to bind server listener");

    assert_eq!(categorize_error(&provider_err), ErrorCategory::Provider);
    assert_eq!(categorize_error(&capability_err), ErrorCategory::Capability);
    assert_eq!(categorize_error(&plan_err), ErrorCategory::Plan);
    assert_eq!(categorize_error(&server_err), ErrorCategory::Server);
}

#[test]
fn cli_errors_redact_keys_unless_sensitive_output_is_enabled() {
    let err = anyhow::anyhow!("request rejected for key sk-1234567890abcdef with Bearer abc123");
    let redacted = format_cli_error(&err, false);
    assert!(!redacted.contains("sk-1234567890abcdef"));
    assert!(!redacted.contains("abc123"));
    assert!(redacted.contains("[REDACTED]"));

    let raw = format_cli_error(&err, true);
    assert!(raw.contains("sk-1234567890abcdef"));
}

#[test]
fn provider_names_accept_dashes_and_case() {
    assert_eq!(
        parse_provider_name("NIM-GLM47").expect("provider should parse"),
        Provider::NimGlm47
    );
    assert_eq!(
        parse_provider_name("deepseek").expect("provider should parse"),
        Provider::Deepseek
    );
    assert!(parse_provider_name("gemini").is_err());
}

#[test]
fn telemetry_summary_counts_session_and_reload_events() {
    let lines = vec![
        json!({"ts_unix_ms": 1000, "event": "session.turn", "run_id": "run-a", "command": "run"})
            .to_string(),
        json!({"ts_unix_ms": 1100, "event": "capability.reload.succeeded", "run_id": "run-a", "command": "run"})
            .to_string(),
        json!({"ts_unix_ms": 1200, "event": "session.turn", "run_id": "run-a", "command": "run"})
            .to_string(),
        json!({"ts_unix_ms": 1300, "event": "session.state_ambiguous", "run_id": "run-a", "command": "run"})
            .to_string(),
        json!({"ts_unix_ms": 1400, "event": "provider.switch_failed", "run_id": "run-b", "command": "ask"})
            .to_string(),
        json!({"ts_unix_ms": 1500, "event": "tool.failed", "run_id": "run-b", "command": "ask", "tool": "x"})
            .to_string(),
        "invalid-json-line".to_string(),
    ];

    let summary = summarize_telemetry_lines(lines.clone(), 100);
    assert_eq!(summary.total_lines, 7);
    assert_eq!(summary.parsed_events, 6);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.runs.len(), 2);
    assert_eq!(summary.turns.total, 2);
    assert_eq!(summary.turns.ambiguous_state, 1);
    assert_eq!(summary.reloads, Outcomes { ok: 1, failed: 0 });
    assert_eq!(summary.provider_switches.failed, 1);
    assert_eq!(summary.tool_calls.failed, 1);
    assert_eq!(summary.busiest_commands(5), vec![("run", 4), ("ask", 2)]);
    assert_eq!(summary.last_event_ts_unix_ms, Some(1500));

    let newest = summarize_telemetry_lines(lines, 3);
    assert_eq!(newest.parsed_events, 2);
    assert_eq!(newest.runs.len(), 1);
    assert_eq!(newest.turns.total, 0);
}

#[test]
fn telemetry_sink_appends_json_lines() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg(dir.path());
    cfg.telemetry_enabled = true;
    let sink = TelemetrySink::new(&cfg, "ask".to_string());
    sink.emit("session.turn", json!({ "step": 1 }));
    sink.emit("session.turn", json!({ "step": 2 }));

    let content = std::fs::read_to_string(&cfg.telemetry_path).expect("telemetry should exist");
    let lines = content.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 2);
    let first: Value = serde_json::from_str(lines[0]).expect("line should be json");
    assert_eq!(first["event"], "session.turn");
    assert_eq!(first["command"], "ask");
    assert_eq!(first["step"], 1);
    assert!(first["run_id"].as_str().is_some_and(|id| id.starts_with("run-")));
}

#[test]
fn disabled_telemetry_sink_writes_nothing() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path());
    let sink = TelemetrySink::new(&cfg, "ask".to_string());
    sink.emit("session.turn", json!({ "step": 1 }));
    TelemetrySink::disabled().emit("session.turn", json!(null));
    assert!(!std::path::Path::new(&cfg.telemetry_path).exists());
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[test]
fn registry_loads_builtin_capabilities_with_default_entries() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path());
    std::fs::create_dir_all(&cfg.auto_skills_dir).expect("auto skills dir should create");

    let report = build_registry(&cfg).build();
    assert!(report.issues.is_empty(), "issues: {:?}", report.issues);
    for name in [
        "create_task_plan",
        "read_task_plan",
        "mark_task_completed",
        "append_task_step",
        CURRENT_TIME_TOOL_NAME,
        "scaffold_skill",
        "promote_skill",
        "reload_skills",
    ] {
        assert!(report.tools.get(name).is_some(), "missing builtin tool {name}");
    }
    let system = report
        .capabilities
        .iter()
        .find(|capability| capability.package == "system_skill")
        .expect("system skill should load");
    assert_eq!(system.declared_entry, None);
    assert_eq!(system.entry, "skills.system_skill.scripts");
}

#[test]
fn dynamic_tool_overrides_builtin_of_the_same_name() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path());
    write_module(
        &cfg.auto_skills_dir,
        "clock_skill",
        "tools",
        &single_tool_module(CURRENT_TIME_TOOL_NAME, "Disk clock"),
    );

    let report = build_registry(&cfg).build();
    let entry = report
        .tools
        .entry(CURRENT_TIME_TOOL_NAME)
        .expect("tool should exist");
    assert_eq!(entry.tool.description(), "Disk clock");
    assert_eq!(entry.origin.namespace, "auto_skills");
    assert_eq!(entry.origin.module, "auto_skills.clock_skill.scripts.tools");
    assert_eq!(report.overridden, vec![CURRENT_TIME_TOOL_NAME.to_string()]);
    assert_eq!(
        report
            .tools
            .names()
            .iter()
            .filter(|name| name.as_str() == CURRENT_TIME_TOOL_NAME)
            .count(),
        1
    );
}

#[test]
fn manifest_entry_redirects_capability_loading() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path());
    let skill_dir = cfg.auto_skills_dir.join("excel_skill");
    std::fs::create_dir_all(skill_dir.join("lib")).expect("lib dir should create");
    std::fs::write(
        skill_dir.join("skill.md"),
        "## Name\nexcel_skill\n\n## Entry\nauto_skills.excel_skill.lib\n",
    )
    .expect("manifest should write");
    std::fs::write(
        skill_dir.join("lib").join("io.toml"),
        single_tool_module("read_sheet", "Read a sheet"),
    )
    .expect("module should write");
    write_module(
        &cfg.auto_skills_dir,
        "excel_skill",
        "ignored",
        &single_tool_module("never_loaded", "Not the declared entry"),
    );

    let report = build_registry(&cfg).build();
    let capability = report
        .capabilities
        .iter()
        .find(|capability| capability.package == "excel_skill")
        .expect("capability should be recorded");
    assert_eq!(
        capability.declared_entry.as_deref(),
        Some("auto_skills.excel_skill.lib")
    );
    assert_eq!(capability.tools, vec!["read_sheet".to_string()]);
    assert!(report.tools.get("never_loaded").is_none());
}

#[test]
fn missing_dynamic_namespace_is_skipped() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path());

    let report = build_registry(&cfg).build();
    let issue = report
        .namespace_failed("auto_skills")
        .expect("namespace failure should be recorded");
    assert_eq!(issue.stage, LoadStage::Namespace);
    assert!(report.tools.get("create_task_plan").is_some());
}

#[test]
fn broken_modules_are_skipped_without_losing_siblings() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path());
    write_module(&cfg.auto_skills_dir, "broken_skill", "tools", "[[tool]\nname = ");
    write_module(
        &cfg.auto_skills_dir,
        "good_skill",
        "tools",
        &single_tool_module("good_tool", "Works"),
    );
    std::fs::create_dir_all(cfg.auto_skills_dir.join("empty_skill"))
        .expect("empty skill dir should create");

    let report = build_registry(&cfg).build();
    assert!(report.tools.get("good_tool").is_some());
    assert!(report.issues.iter().any(|issue| issue.stage == LoadStage::Module
        && issue.module == "auto_skills.broken_skill.scripts.tools"));
    assert!(report.issues.iter().any(|issue| issue.stage == LoadStage::Entry
        && issue.module == "auto_skills.empty_skill.scripts"));
}

#[test]
fn templates_without_defaults_are_not_registered() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path());
    write_module(
        &cfg.auto_skills_dir,
        "writer_skill",
        "tools",
        r#"
[[tool]]
name = "reader"
description = "Read"
command = "echo read"

[[template]]
name = "writer"
description = "Write"
command = "echo {target}"
[template.params]
target = {}

[[template]]
name = "default_writer"
description = "Write to the default target"
command = "echo {target}"
[template.params]
target = { default = "out.txt" }
"#,
    );

    let report = build_registry(&cfg).build();
    assert!(report.tools.get("reader").is_some());
    assert!(report.tools.get("default_writer").is_some());
    assert!(report.tools.get("writer").is_none());
    assert!(report.issues.is_empty(), "issues: {:?}", report.issues);
}

#[cfg(unix)]
#[tokio::test]
async fn script_tools_return_command_output() {
    let dir = tempdir().expect("temp directory should create");
    let cfg = base_cfg(dir.path());
    write_module(
        &cfg.auto_skills_dir,
        "echo_skill",
        "tools",
        &single_tool_module("say_hello", "Say hello"),
    );

    let report = build_registry(&cfg).build();
    let tool = report.tools.get("say_hello").expect("tool should load");
    let result = tool.call(json!({})).await.expect("script should run");
    assert_eq!(result["status"], "ok");
    assert_eq!(result["output"], "say_hello");
}

// ---------------------------------------------------------------------------
// Reload
// ---------------------------------------------------------------------------

#[test]
fn reload_picks_up_new_and_changed_skills() {
    let harness = Harness::new(Vec::new());
    write_module(
        &harness.cfg.auto_skills_dir,
        "notes_skill",
        "tools",
        &single_tool_module("take_note", "First version"),
    );

    let summary = harness.runtime.reload(&harness.cfg).expect("reload should succeed");
    assert_eq!(summary.generation, 2);
    assert_eq!(summary.added, vec!["take_note".to_string()]);
    let generation = harness.runtime.current();
    assert_eq!(generation.id, 2);
    assert!(generation.runner.system_prompt().contains("take_note"));

    write_module(
        &harness.cfg.auto_skills_dir,
        "notes_skill",
        "tools",
        &single_tool_module("take_note", "Second version"),
    );
    harness.runtime.reload(&harness.cfg).expect("reload should succeed");
    let tool = harness
        .runtime
        .current()
        .tools
        .get("take_note")
        .cloned()
        .expect("tool should still exist");
    assert_eq!(tool.description(), "Second version");
}

#[test]
fn reload_reports_removed_skills() {
    let harness = Harness::new(Vec::new());
    write_module(
        &harness.cfg.auto_skills_dir,
        "temp_skill",
        "tools",
        &single_tool_module("short_lived", "Gone soon"),
    );
    harness.runtime.reload(&harness.cfg).expect("reload should succeed");
    std::fs::remove_dir_all(harness.cfg.auto_skills_dir.join("temp_skill"))
        .expect("skill should delete");

    let summary = harness.runtime.reload(&harness.cfg).expect("reload should succeed");
    assert_eq!(summary.removed, vec!["short_lived".to_string()]);
    assert!(harness.runtime.current().tools.get("short_lived").is_none());
}

#[test]
fn reload_keeps_static_modules_cached() {
    let harness = Harness::new(Vec::new());
    write_module(
        &harness.cfg.auto_skills_dir,
        "notes_skill",
        "tools",
        &single_tool_module("take_note", "Notes"),
    );
    harness.runtime.reload(&harness.cfg).expect("reload should succeed");

    let importer = harness.runtime.registry().importer().clone();
    let static_before = importer
        .import("skills.system_skill.scripts.task_tools")
        .expect("static module should import");
    let dynamic_before = importer
        .import("auto_skills.notes_skill.scripts.tools")
        .expect("dynamic module should import");

    harness.runtime.reload(&harness.cfg).expect("reload should succeed");

    let static_after = importer
        .import("skills.system_skill.scripts.task_tools")
        .expect("static module should import");
    let dynamic_after = importer
        .import("auto_skills.notes_skill.scripts.tools")
        .expect("dynamic module should import");
    assert!(Arc::ptr_eq(&static_before, &static_after));
    assert!(!Arc::ptr_eq(&dynamic_before, &dynamic_after));
    assert!(
        harness
            .runtime
            .registry()
            .namespaces()
            .iter()
            .any(|namespace| namespace.kind == NamespaceKind::Static)
    );
}

fn origin_namespace(harness: &Harness, tool: &str) -> Option<String> {
    harness
        .runtime
        .current()
        .tools
        .entry(tool)
        .map(|entry| entry.origin.namespace.clone())
}

#[test]
fn promoted_skill_loads_from_the_static_namespace_and_stays_cached() {
    let harness = Harness::new(Vec::new());
    let ctx = SkillToolsContext::from_config(&harness.cfg);
    let created = scaffold_skill_response(
        &ctx,
        json!({
            "skill_name": "notes_skill",
            "description": "Notes",
            "tools": [{ "name": "take_note", "description": "First version", "command": "echo note" }]
        }),
    );
    assert_eq!(created["status"], "created", "payload: {created}");
    harness.runtime.reload(&harness.cfg).expect("reload should succeed");
    assert_eq!(origin_namespace(&harness, "take_note").as_deref(), Some("auto_skills"));

    let promoted = promote_skill_response(&ctx, json!({ "skill_name": "notes_skill" }));
    assert_eq!(promoted["status"], "promoted", "payload: {promoted}");
    let summary = harness.runtime.reload(&harness.cfg).expect("reload should succeed");
    assert!(summary.added.is_empty(), "added: {:?}", summary.added);
    assert!(summary.removed.is_empty(), "removed: {:?}", summary.removed);
    assert_eq!(origin_namespace(&harness, "take_note").as_deref(), Some("skills"));
    let generation = harness.runtime.current();
    let capability = generation
        .capabilities
        .iter()
        .find(|capability| capability.package == "notes_skill")
        .expect("promoted capability should load");
    assert_eq!(capability.namespace, "skills");
    assert_eq!(
        capability.declared_entry.as_deref(),
        Some("skills.notes_skill.scripts")
    );

    write_module(
        &harness.cfg.skills_dir,
        "notes_skill",
        "tools",
        &single_tool_module("take_note", "Second version"),
    );
    harness.runtime.reload(&harness.cfg).expect("reload should succeed");
    let tool = harness
        .runtime
        .current()
        .tools
        .get("take_note")
        .cloned()
        .expect("promoted tool should stay loaded");
    assert_eq!(tool.description(), "First version");
}

#[test]
fn failed_reload_keeps_previous_generation() {
    let harness = Harness::new(Vec::new());
    let before = harness.runtime.current();
    std::fs::remove_dir_all(&harness.cfg.auto_skills_dir).expect("auto skills dir should delete");

    let err = harness
        .runtime
        .reload(&harness.cfg)
        .expect_err("missing dynamic namespace should fail the reload");
    assert_eq!(categorize_error(&err), ErrorCategory::Capability);
    let after = harness.runtime.current();
    assert!(Arc::ptr_eq(&before, &after));
}

#[test]
fn reload_with_unresolvable_model_keeps_previous_generation() {
    let harness = Harness::new(Vec::new());
    let mut cfg = harness.cfg.clone();
    cfg.provider = Provider::NimMinimaxM2;
    harness.resolver.fail_for(Provider::NimMinimaxM2);

    assert!(harness.runtime.reload(&cfg).is_err());
    assert_eq!(harness.runtime.current().id, 1);
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runner_reports_unknown_tools_to_the_model() {
    let model = ScriptedModel::with_replies(vec![
        call("c1", "does_not_exist", json!({})),
        ModelReply::text("Recovered.\nSTATE: DONE"),
    ]);
    let runner = test_runner(model.clone(), vec![noop_tool("known")], 4);

    let output = runner
        .invoke("do it", &History::new())
        .await
        .expect("turn should finish");
    assert_eq!(output.text, "Recovered.\nSTATE: DONE");
    assert_eq!(output.tool_calls, 1);

    let second = &model.requests()[1];
    let tool_message = second
        .messages
        .iter()
        .find(|message| message.role == Role::Tool)
        .expect("tool result should be sent back");
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("c1"));
    assert!(tool_message.content.contains("unknown_tool"));
}

#[tokio::test]
async fn runner_stops_after_tool_round_limit() {
    let model = ScriptedModel::with_replies(vec![
        call("c1", "known", json!({})),
        call("c2", "known", json!({})),
        call("c3", "known", json!({})),
    ]);
    let runner = test_runner(model, vec![noop_tool("known")], 2);

    let err = runner
        .invoke("loop forever", &History::new())
        .await
        .expect_err("round limit should stop the turn");
    assert!(err.to_string().contains("2 tool rounds"));
}

#[tokio::test]
async fn runner_ends_the_turn_when_a_tool_requests_a_reload() {
    let dir = tempdir().expect("temp directory should create");
    let model = ScriptedModel::with_replies(vec![
        call("c1", "reload_skills", json!({})),
        ModelReply::text("should not be requested"),
    ]);
    let tools = build_skill_tools(SkillToolsContext {
        auto_skills_dir: dir.path().to_path_buf(),
        dynamic_namespace: DYNAMIC_NAMESPACE.to_string(),
        skills_dir: dir.path().join("curated"),
        static_namespace: STATIC_NAMESPACE.to_string(),
    });
    let runner = test_runner(model.clone(), tools, 4);

    let output = runner
        .invoke("install it", &History::new())
        .await
        .expect("turn should finish");
    assert_eq!(model.requests().len(), 1);
    assert_eq!(output.tool_calls, 1);
    assert!(output.text.ends_with(&format!("\n{RELOAD_SENTINEL}")));
    assert!(output.text.starts_with("Skill reload requested."));
}

#[tokio::test]
async fn runner_skips_calls_queued_after_a_reload_request() {
    let dir = tempdir().expect("temp directory should create");
    let calls = Arc::new(Mutex::new(0usize));
    let counted = calls.clone();
    let counting: Arc<dyn Tool> = Arc::new(FunctionTool::new("say_hello", "counts", move |_args| {
        let counted = counted.clone();
        async move {
            *counted.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            Ok(json!({ "ok": true }))
        }
    }));
    let mut tools = build_skill_tools(SkillToolsContext {
        auto_skills_dir: dir.path().to_path_buf(),
        dynamic_namespace: DYNAMIC_NAMESPACE.to_string(),
        skills_dir: dir.path().join("curated"),
        static_namespace: STATIC_NAMESPACE.to_string(),
    });
    tools.push(counting);
    let model = ScriptedModel::with_replies(vec![ModelReply {
        content: "Reloading, then greeting.".to_string(),
        tool_calls: vec![
            ToolCall {
                id: "c1".to_string(),
                name: "reload_skills".to_string(),
                arguments: json!({}),
            },
            ToolCall {
                id: "c2".to_string(),
                name: "say_hello".to_string(),
                arguments: json!({}),
            },
        ],
    }]);
    let runner = test_runner(model.clone(), tools, 4);

    let output = runner
        .invoke("install and greet", &History::new())
        .await
        .expect("turn should finish");
    assert_eq!(
        output.text,
        format!("Reloading, then greeting.\n{RELOAD_SENTINEL}")
    );
    assert_eq!(output.tool_calls, 1);
    assert_eq!(*calls.lock().unwrap_or_else(|e| e.into_inner()), 0);
    assert_eq!(model.requests().len(), 1);
}

#[tokio::test]
async fn runner_times_out_slow_tools() {
    let slow: Arc<dyn Tool> = Arc::new(FunctionTool::new("slow", "sleeps", |_args| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(json!({ "ok": true }))
    }));
    let model = ScriptedModel::with_replies(vec![
        call("c1", "slow", json!({})),
        ModelReply::text("Gave up.\nSTATE: DONE"),
    ]);
    let runner = test_runner(model.clone(), vec![slow], 4);

    runner
        .invoke("wait", &History::new())
        .await
        .expect("turn should finish");
    let tool_message = model.requests()[1]
        .messages
        .iter()
        .find(|message| message.role == Role::Tool)
        .cloned()
        .expect("tool result should be sent back");
    assert!(tool_message.content.contains("timeout"));
}

#[tokio::test]
async fn runner_sends_history_between_system_prompt_and_input() {
    let model = ScriptedModel::with_replies(vec![ModelReply::text("ok\nSTATE: DONE")]);
    let runner = test_runner(model.clone(), Vec::new(), 1);
    let mut history = History::new();
    history.push("earlier question", "earlier answer\nSTATE: DONE");

    runner.invoke("now", &history).await.expect("turn should finish");
    let messages = model.requests()[0].messages.clone();
    assert_eq!(
        messages,
        vec![
            Message::system("system"),
            Message::user("earlier question"),
            Message::assistant("earlier answer\nSTATE: DONE"),
            Message::user("now"),
        ]
    );
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn done_reply_is_shown_without_marker_and_recorded_once() {
    let harness = Harness::new(vec![ModelReply::text("Done.\nSTATE: DONE")]);
    let mut session = harness.session();

    assert_eq!(session.handle_input("hello").await, InputOutcome::Idle);
    assert_eq!(harness.sink.of_kind("agent"), vec!["Done.".to_string()]);
    assert_eq!(session.history().len(), 1);
    assert_eq!(session.history().turns()[0].user, "hello");
    assert_eq!(session.history().turns()[0].assistant, "Done.\nSTATE: DONE");
    assert_eq!(session.last_run().invocations, 1);
    assert_eq!(session.last_run().final_state, Some(LoopState::Done));
}

#[tokio::test]
async fn continue_marker_reinvokes_with_synthetic_input() {
    let harness = Harness::new(vec![
        ModelReply::text("Step one done.\nSTATE: CONTINUE"),
        ModelReply::text("All done.\nSTATE: DONE"),
    ]);
    let mut session = harness.session();

    session.handle_input("two steps please").await;
    assert_eq!(session.last_run().invocations, 2);
    assert_eq!(harness.model.last_user_input(1), CONTINUE_INPUT);
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn reload_sentinel_triggers_one_reload_and_reinvocation() {
    let harness = Harness::new(vec![
        ModelReply::text(format!("Skill written.\n{RELOAD_SENTINEL}")),
        ModelReply::text("Skill is available.\nSTATE: DONE"),
    ]);
    let mut session = harness.session();

    session.handle_input("build a skill").await;
    let stats = session.last_run().clone();
    assert_eq!(stats.reloads, 1);
    assert_eq!(stats.invocations, 2);
    assert_eq!(harness.runtime.current().id, 2);
    assert_eq!(harness.model.last_user_input(1), RELOAD_COMPLETE_INPUT);
    assert_eq!(
        harness.sink.of_kind("agent"),
        vec!["Skill written.".to_string(), "Skill is available.".to_string()]
    );
    assert!(
        session
            .history()
            .turns()
            .iter()
            .all(|turn| !turn.assistant.contains(RELOAD_SENTINEL))
    );
}

#[tokio::test]
async fn reload_sentinel_is_honoured_alongside_done() {
    let harness = Harness::new(vec![
        ModelReply::text(format!("Installed.\n{RELOAD_SENTINEL}\nSTATE: DONE")),
        ModelReply::text("Confirmed.\nSTATE: DONE"),
    ]);
    let mut session = harness.session();

    session.handle_input("install").await;
    assert_eq!(session.last_run().reloads, 1);
    assert_eq!(session.last_run().invocations, 2);
    assert_eq!(session.history().turns()[0].assistant, "Installed.\nSTATE: DONE");
}

#[tokio::test]
async fn failed_reload_falls_through_to_the_reply_state() {
    let harness = Harness::new(vec![ModelReply::text(format!(
        "Installed.\n{RELOAD_SENTINEL}\nSTATE: DONE"
    ))]);
    std::fs::remove_dir_all(&harness.cfg.auto_skills_dir).expect("auto skills dir should delete");
    let mut session = harness.session();

    session.handle_input("install").await;
    let stats = session.last_run();
    assert_eq!(stats.reloads, 0);
    assert_eq!(stats.reload_failures, 1);
    assert_eq!(stats.invocations, 1);
    assert_eq!(harness.runtime.current().id, 1);
    assert_eq!(harness.sink.of_kind("error").len(), 1);
}

#[tokio::test]
async fn auto_continuation_is_capped() {
    let replies = (0..5)
        .map(|step| ModelReply::text(format!("Working on {step}.\nSTATE: CONTINUE")))
        .collect();
    let harness = Harness::with_cfg(replies, |cfg| cfg.max_auto_steps = 3);
    let mut session = harness.session();

    session.handle_input("never finishes").await;
    let stats = session.last_run();
    assert_eq!(stats.invocations, 3);
    assert!(stats.capped);
    assert_eq!(harness.model.requests().len(), 3);
    assert!(
        harness
            .sink
            .of_kind("notice")
            .iter()
            .any(|notice| notice.contains("auto-step limit (3)"))
    );
}

#[tokio::test]
async fn missing_state_marker_ends_the_run() {
    let harness = Harness::new(vec![
        ModelReply::text("I think that is everything."),
        ModelReply::text("should not be requested"),
    ]);
    let mut session = harness.session();

    session.handle_input("task").await;
    assert_eq!(session.last_run().invocations, 1);
    assert_eq!(
        session.last_run().final_state,
        Some(LoopState::AmbiguousTerminal)
    );
    assert_eq!(
        harness.sink.of_kind("agent"),
        vec!["I think that is everything.".to_string()]
    );
}

#[tokio::test]
async fn backend_failure_returns_to_idle() {
    let harness = Harness::new(Vec::new());
    harness.model.push_error("upstream returned 502");
    harness
        .model
        .push_all(vec![ModelReply::text("Back online.\nSTATE: DONE")]);
    let mut session = harness.session();

    assert_eq!(session.handle_input("first").await, InputOutcome::Idle);
    assert!(session.last_run().failed);
    assert!(session.history().is_empty());
    assert!(harness.sink.of_kind("error")[0].contains("upstream returned 502"));

    session.handle_input("second").await;
    assert!(!session.last_run().failed);
    assert_eq!(session.history().len(), 1);
}

#[tokio::test]
async fn exit_and_blank_inputs_do_not_invoke_the_model() {
    let harness = Harness::new(Vec::new());
    let mut session = harness.session();

    assert_eq!(session.handle_input("   ").await, InputOutcome::Idle);
    assert_eq!(session.handle_input("QUIT").await, InputOutcome::Exit);
    assert!(harness.model.requests().is_empty());
}

#[tokio::test]
async fn provider_switch_clears_history_on_success() {
    let harness = Harness::new(vec![ModelReply::text("Hi.\nSTATE: DONE")]);
    let mut session = harness.session();
    session.handle_input("hello").await;
    assert_eq!(session.history().len(), 1);

    session
        .handle_input(&switch_provider_input(Provider::Qwen))
        .await;
    let generation = harness.runtime.current();
    assert_eq!(generation.provider, Provider::Qwen);
    assert_eq!(generation.model_name, "qwen-scripted");
    assert_eq!(generation.id, 2);
    assert!(session.history().is_empty());
    assert_eq!(session.config().provider, Provider::Qwen);
}

#[tokio::test]
async fn provider_switch_failure_rolls_back() {
    let harness = Harness::with_cfg(vec![ModelReply::text("Hi.\nSTATE: DONE")], |cfg| {
        cfg.model = Some("deepseek-chat".to_string());
    });
    harness.resolver.fail_for(Provider::NimGlm47);
    let mut session = harness.session();
    session.handle_input("hello").await;

    session
        .handle_input(&switch_provider_input(Provider::NimGlm47))
        .await;
    assert_eq!(harness.runtime.current().id, 1);
    assert_eq!(harness.runtime.current().provider, Provider::Deepseek);
    assert_eq!(session.config().provider, Provider::Auto);
    assert_eq!(session.config().model.as_deref(), Some("deepseek-chat"));
    assert_eq!(session.history().len(), 1);
    assert!(harness.sink.of_kind("error")[0].contains("NVIDIA_API_KEY"));
}

#[tokio::test]
async fn unknown_provider_switch_is_rejected() {
    let harness = Harness::new(Vec::new());
    let mut session = harness.session();

    session.handle_input("__SET_MODEL__:gemini").await;
    assert_eq!(harness.runtime.current().id, 1);
    assert!(harness.sink.of_kind("error")[0].contains("Provider switch rejected"));
}

fn summary_messages(request: &ModelRequest) -> Vec<String> {
    request
        .messages
        .iter()
        .filter(|message| message.role == Role::System && message.content.starts_with(SUMMARY_HEADER))
        .map(|message| message.content.clone())
        .collect()
}

#[tokio::test]
async fn session_compacts_history_before_the_model_call() {
    let harness = Harness::with_cfg(
        vec![
            ModelReply::text("a1\nSTATE: DONE"),
            ModelReply::text("a2\nSTATE: DONE"),
            ModelReply::text("a3\nSTATE: DONE"),
            ModelReply::text("SUMMARY-1"),
            ModelReply::text("a4\nSTATE: DONE"),
            ModelReply::text("a5\nSTATE: DONE"),
            ModelReply::text("SUMMARY-2"),
            ModelReply::text("a6\nSTATE: DONE"),
        ],
        |cfg| {
            cfg.compact_threshold = 2;
            cfg.compact_keep_recent = 1;
        },
    );
    let mut session = harness.session();

    for input in ["i1", "i2", "i3", "i4"] {
        session.handle_input(input).await;
    }
    assert_eq!(session.last_run().compactions, 1);
    assert_eq!(session.history().summary(), Some("SUMMARY-1"));

    for input in ["i5", "i6"] {
        session.handle_input(input).await;
    }
    assert_eq!(session.history().summary(), Some("SUMMARY-2"));
    assert_eq!(session.history().len(), 2);

    let requests = harness.model.requests();
    assert_eq!(requests.len(), 8);
    // Summarization calls carry no tools and run right before the turn they shrink.
    assert!(requests[3].tools.is_empty());
    assert!(requests[6].tools.is_empty());
    assert!(requests[6].messages[1].content.contains("SUMMARY-1"));
    assert_eq!(harness.model.last_user_input(4), "i4");

    let after_first = summary_messages(&requests[4]);
    assert_eq!(after_first.len(), 1);
    assert!(after_first[0].contains("SUMMARY-1"));
    let last = summary_messages(&requests[7]);
    assert_eq!(last.len(), 1);
    assert!(last[0].contains("SUMMARY-2"));
    assert!(!last[0].contains("SUMMARY-1"));
}

#[tokio::test]
async fn failed_compaction_is_not_retried_within_a_run() {
    let harness = Harness::with_cfg(
        vec![
            ModelReply::text("a1\nSTATE: DONE"),
            ModelReply::text("a2\nSTATE: DONE"),
            ModelReply::text("a3\nSTATE: DONE"),
        ],
        |cfg| {
            cfg.compact_threshold = 2;
            cfg.compact_keep_recent = 1;
        },
    );
    harness.model.push_error("summarizer unavailable");
    harness.model.push_all(vec![
        ModelReply::text("step one\nSTATE: CONTINUE"),
        ModelReply::text("step two\nSTATE: CONTINUE"),
        ModelReply::text("finished\nSTATE: DONE"),
    ]);
    let mut session = harness.session();

    for input in ["i1", "i2", "i3", "long task"] {
        session.handle_input(input).await;
    }
    let stats = session.last_run();
    assert_eq!(stats.compaction_failures, 1);
    assert_eq!(stats.compactions, 0);
    assert_eq!(stats.invocations, 3);
    assert!(!stats.failed);
    assert_eq!(harness.model.requests().len(), 7);
    assert!(session.history().summary().is_none());
    assert_eq!(session.history().len(), 6);
}

#[cfg(unix)]
#[tokio::test]
async fn scaffolded_skill_is_usable_after_reload() {
    let harness = Harness::new(vec![
        call(
            "c1",
            "scaffold_skill",
            json!({
                "skill_name": "greeting_skill",
                "description": "Greets people",
                "tools": [{
                    "name": "say_hello",
                    "description": "Say hello",
                    "command": "echo hello"
                }]
            }),
        ),
        call("c2", "reload_skills", json!({})),
        call("c3", "say_hello", json!({})),
        ModelReply::text("Said hello.\nSTATE: DONE"),
    ]);
    let mut session = harness.session();

    session.handle_input("make a greeting skill").await;
    assert_eq!(session.last_run().reloads, 1);
    assert_eq!(session.last_run().invocations, 2);
    let generation = harness.runtime.current();
    assert!(generation.tools.get("say_hello").is_some());

    let requests = harness.model.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(harness.model.last_user_input(2), RELOAD_COMPLETE_INPUT);
    assert!(requests[2].tools.iter().any(|spec| spec.name == "say_hello"));
    let tool_results = requests
        .iter()
        .flat_map(|request| request.messages.iter())
        .filter(|message| message.role == Role::Tool)
        .collect::<Vec<_>>();
    assert!(
        tool_results
            .iter()
            .all(|message| !message.content.contains("unknown_tool"))
    );
    assert!(
        tool_results
            .iter()
            .any(|message| message.tool_call_id.as_deref() == Some("c3")
                && message.content.contains("hello"))
    );
    assert!(
        harness
            .dir
            .path()
            .join("auto_skills/greeting_skill/skill.md")
            .is_file()
    );
}

// ---------------------------------------------------------------------------
// Web console
// ---------------------------------------------------------------------------

#[test]
fn model_options_list_every_provider_in_order() {
    let ids = model_options()
        .iter()
        .map(|option| option.id)
        .collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec!["deepseek", "qwen", "openai", "nim_minimax_m2", "nim_glm47"]
    );
}

#[test]
fn server_auth_requires_matching_bearer_token() {
    let harness = Harness::new(Vec::new());
    let (state, _receiver) = harness.server_state();
    let mut state = Arc::unwrap_or_clone(state);
    state.auth_token = Some("secret-token".to_string());

    let mut headers = HeaderMap::new();
    assert!(check_server_auth(&state, &headers).is_err());
    headers.insert(
        axum::http::header::AUTHORIZATION,
        HeaderValue::from_static("Bearer wrong"),
    );
    assert!(check_server_auth(&state, &headers).is_err());
    headers.insert(
        axum::http::header::AUTHORIZATION,
        HeaderValue::from_static("Bearer secret-token"),
    );
    assert!(check_server_auth(&state, &headers).is_ok());
}

#[tokio::test]
async fn chat_send_rejects_empty_messages_and_enqueues_others() {
    let harness = Harness::new(Vec::new());
    let (state, mut receiver) = harness.server_state();

    let err = handle_chat_send(
        State(state.clone()),
        HeaderMap::new(),
        Json(ChatSendRequest {
            message: "   ".to_string(),
        }),
    )
    .await
    .expect_err("empty message should be rejected");
    assert_eq!(err.0, StatusCode::BAD_REQUEST);

    let Json(body) = handle_chat_send(
        State(state),
        HeaderMap::new(),
        Json(ChatSendRequest {
            message: " summarize report.xlsx ".to_string(),
        }),
    )
    .await
    .expect("message should be accepted");
    assert_eq!(body["status"], "sent");
    assert_eq!(
        receiver.recv().await,
        Some(InboundMessage {
            source: InputSource::Web,
            text: "summarize report.xlsx".to_string(),
        })
    );
}

#[tokio::test]
async fn chat_model_queues_switch_for_known_providers_only() {
    let harness = Harness::new(Vec::new());
    let (state, mut receiver) = harness.server_state();

    let err = handle_chat_model(
        State(state.clone()),
        HeaderMap::new(),
        Json(ModelSelectRequest {
            provider: "auto".to_string(),
        }),
    )
    .await
    .expect_err("auto is not a switch target");
    assert_eq!(err.0, StatusCode::BAD_REQUEST);

    let Json(body) = handle_chat_model(
        State(state),
        HeaderMap::new(),
        Json(ModelSelectRequest {
            provider: "nim-glm47".to_string(),
        }),
    )
    .await
    .expect("known provider should be accepted");
    assert_eq!(body, json!({ "status": "switching", "provider": "nim_glm47" }));
    let queued = receiver.recv().await.expect("switch should be queued");
    assert_eq!(
        parse_control_input(&queued.text),
        ControlInput::SwitchProvider(Provider::NimGlm47)
    );
}

#[tokio::test]
async fn chat_send_reports_closed_session() {
    let harness = Harness::new(Vec::new());
    let (state, receiver) = harness.server_state();
    drop(receiver);

    let err = handle_chat_send(
        State(state),
        HeaderMap::new(),
        Json(ChatSendRequest {
            message: "hello".to_string(),
        }),
    )
    .await
    .expect_err("closed queue should be reported");
    assert_eq!(err.0, StatusCode::SERVICE_UNAVAILABLE);
}

// ---------------------------------------------------------------------------
// Builtin tools
// ---------------------------------------------------------------------------

#[test]
fn marking_a_step_twice_keeps_the_first_result() {
    let dir = tempdir().expect("temp directory should create");
    let store = TaskPlanStore::new(dir.path().join("plan.json"));
    store
        .create(vec!["collect".to_string(), "report".to_string()])
        .expect("plan should create");

    let first = mark_task_completed_response(
        &store,
        json!({ "step_id": 1, "result_summary": "collected 3 files" }),
    );
    assert_eq!(first["already_completed"], false);
    let second = mark_task_completed_response(
        &store,
        json!({ "step_id": 1, "result_summary": "something else" }),
    );
    assert_eq!(second["status"], "completed");
    assert_eq!(second["already_completed"], true);

    let plan = store.load().expect("plan should load").expect("plan should exist");
    assert_eq!(plan.steps[0].result.as_deref(), Some("collected 3 files"));
    assert_eq!(plan.completed_count(), 1);

    let missing = mark_task_completed_response(&store, json!({ "step_id": 9 }));
    assert_eq!(missing["status"], "not_found");
}

#[test]
fn plan_tools_without_a_plan_report_no_plan() {
    let dir = tempdir().expect("temp directory should create");
    let store = TaskPlanStore::new(dir.path().join("plan.json"));

    let completed = mark_task_completed_response(&store, json!({ "step_id": 1 }));
    assert_eq!(completed["status"], "no_plan");
    assert_eq!(
        append_task_step_response(&store, json!({ "step_description": "extra" }))["status"],
        "no_plan"
    );
    assert_eq!(read_task_plan_response(&store)["status"], "no_plan");
}

#[test]
fn appended_steps_reopen_a_finished_plan() {
    let dir = tempdir().expect("temp directory should create");
    let store = TaskPlanStore::new(dir.path().join("plan.json"));
    store
        .create(vec!["only step".to_string()])
        .expect("plan should create");
    mark_task_completed_response(&store, json!({ "step_id": 1, "result_summary": "ok" }));
    assert_eq!(read_task_plan_response(&store)["status"], "completed");

    let appended = append_task_step_response(&store, json!({ "step_description": "follow up" }));
    assert_eq!(appended["step"]["id"], 2);
    let next = read_task_plan_response(&store);
    assert_eq!(next["status"], "in_progress");
    assert_eq!(next["current_step"]["desc"], "follow up");
    assert_eq!(next["progress"], "1/2");
}

#[test]
fn scaffold_skill_writes_a_loadable_layout() {
    let dir = tempdir().expect("temp directory should create");
    let ctx = SkillToolsContext {
        auto_skills_dir: dir.path().join("auto_skills"),
        dynamic_namespace: DYNAMIC_NAMESPACE.to_string(),
        skills_dir: dir.path().join("curated"),
        static_namespace: STATIC_NAMESPACE.to_string(),
    };
    let args = json!({
        "skill_name": "csv_skill",
        "description": "CSV helpers",
        "tools": [{
            "name": "count_rows",
            "description": "Count rows in a CSV file",
            "parameters": { "type": "object", "properties": { "path": { "type": "string" } } }
        }]
    });

    let created = scaffold_skill_response(&ctx, args.clone());
    assert_eq!(created["status"], "created", "payload: {created}");
    assert_eq!(created["entry"], "auto_skills.csv_skill.scripts");
    let skill_dir = ctx.auto_skills_dir.join("csv_skill");
    assert!(skill_dir.join("scripts/count_rows.py").is_file());
    assert!(skill_dir.join("references/usage.md").is_file());
    assert_eq!(
        parse_entry(&skill_dir.join("skill.md")).as_deref(),
        Some("auto_skills.csv_skill.scripts")
    );

    let again = scaffold_skill_response(&ctx, args);
    assert_eq!(again["code"], "already_exists");

    let dir_cfg = {
        let mut cfg = base_cfg(dir.path());
        cfg.auto_skills_dir = ctx.auto_skills_dir.clone();
        cfg
    };
    let report = build_registry(&dir_cfg).build();
    let tool = report.tools.get("count_rows").expect("scaffolded tool should load");
    assert_eq!(tool.parameters()["properties"]["path"]["type"], "string");
}

#[test]
fn promote_skill_moves_the_package_and_refuses_existing_targets() {
    let dir = tempdir().expect("temp directory should create");
    let ctx = SkillToolsContext::from_config(&base_cfg(dir.path()));
    let scaffold = json!({
        "skill_name": "csv_skill",
        "description": "CSV helpers",
        "tools": [{ "name": "count_rows", "description": "Count rows" }]
    });
    assert_eq!(scaffold_skill_response(&ctx, scaffold.clone())["status"], "created");

    let promoted = promote_skill_response(&ctx, json!({ "skill_name": "csv_skill" }));
    assert_eq!(promoted["status"], "promoted", "payload: {promoted}");
    assert_eq!(promoted["entry"], "skills.csv_skill.scripts");
    assert!(!ctx.auto_skills_dir.join("csv_skill").exists());
    assert!(ctx.skills_dir.join("csv_skill/scripts/tools.toml").is_file());
    assert_eq!(
        parse_entry(&ctx.skills_dir.join("csv_skill/skill.md")).as_deref(),
        Some("skills.csv_skill.scripts")
    );

    let missing = promote_skill_response(&ctx, json!({ "skill_name": "csv_skill" }));
    assert_eq!(missing["code"], "not_found");

    assert_eq!(scaffold_skill_response(&ctx, scaffold)["status"], "created");
    let clash = promote_skill_response(&ctx, json!({ "skill_name": "csv_skill" }));
    assert_eq!(clash["code"], "already_exists");
    assert!(ctx.auto_skills_dir.join("csv_skill/skill.md").is_file());
}

#[test]
fn scaffold_skill_rejects_invalid_names() {
    let dir = tempdir().expect("temp directory should create");
    let ctx = SkillToolsContext {
        auto_skills_dir: dir.path().to_path_buf(),
        dynamic_namespace: DYNAMIC_NAMESPACE.to_string(),
        skills_dir: dir.path().join("curated"),
        static_namespace: STATIC_NAMESPACE.to_string(),
    };
    let payload = scaffold_skill_response(
        &ctx,
        json!({ "skill_name": "9-bad", "description": "nope" }),
    );
    assert_eq!(payload["code"], "invalid_args");
}

#[test]
fn write_tool_code_only_overwrites_existing_files() {
    let dir = tempdir().expect("temp directory should create");
    let ctx = SkillToolsContext {
        auto_skills_dir: dir.path().to_path_buf(),
        dynamic_namespace: DYNAMIC_NAMESPACE.to_string(),
        skills_dir: dir.path().join("curated"),
        static_namespace: STATIC_NAMESPACE.to_string(),
    };
    let missing = write_tool_code_response(
        &ctx,
        json!({ "file_path": "ghost_skill/scripts/ghost.py", "code": "print(1)" }),
    );
    assert_eq!(missing["code"], "not_found");

    let script = dir.path().join("real_skill/scripts/real.py");
    std::fs::create_dir_all(script.parent().expect("script has a parent"))
        .expect("scripts dir should create");
    std::fs::write(&script, "pass\n").expect("stub should write");
    let written = write_tool_code_response(
        &ctx,
        json!({ "file_path": "real_skill/scripts/real.py", "code": "print('hi')\n" }),
    );
    assert_eq!(written["status"], "written");
    assert_eq!(
        std::fs::read_to_string(&script).expect("script should read"),
        "print('hi')\n"
    );
}
