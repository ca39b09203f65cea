//! Versioned capability runtime.
//!
//! A [`Generation`] is an immutable pairing of one tool set with one model
//! binding. Reloads and provider switches build a complete new generation and
//! swap the active pointer only when every step succeeded, so a failure never
//! leaves the session without a usable tool set. Callers holding an older
//! `Arc<Generation>` keep using it until they drop it.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use crate::capability::reload::{ReloadSummary, diff_tool_names};
use crate::capability::{Capability, LoadIssue, LoadReport, NamespaceKind, Registry};
use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::model::ChatModel;
use crate::prompts::build_system_prompt;
use crate::provider::ModelResolver;
use crate::runner::AgentRunner;
use crate::telemetry::TelemetrySink;
use crate::tools::ToolSet;

pub struct Generation {
    pub id: u64,
    pub tools: Arc<ToolSet>,
    pub capabilities: Vec<Capability>,
    pub issues: Vec<LoadIssue>,
    pub runner: Arc<AgentRunner>,
    pub provider: Provider,
    pub model_name: String,
}

impl Generation {
    pub fn model(&self) -> &Arc<dyn ChatModel> {
        self.runner.model()
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("tools", &self.tools)
            .field("provider", &self.provider)
            .field("model_name", &self.model_name)
            .finish()
    }
}

struct Binding {
    model: Arc<dyn ChatModel>,
    provider: Provider,
    model_name: String,
}

pub struct AgentRuntime {
    registry: Registry,
    resolver: Arc<dyn ModelResolver>,
    telemetry: TelemetrySink,
    max_tool_rounds: usize,
    tool_timeout: Duration,
    active: RwLock<Arc<Generation>>,
    last_id: AtomicU64,
}

impl AgentRuntime {
    /// Loads every namespace and binds the configured provider.
    pub fn build(
        cfg: &RuntimeConfig,
        registry: Registry,
        resolver: Arc<dyn ModelResolver>,
        telemetry: TelemetrySink,
    ) -> Result<Self> {
        let report = registry.build();
        log_report(&report, &telemetry, "startup");
        let (model, provider, model_name) = resolver.resolve(cfg)?;
        let binding = Binding {
            model,
            provider,
            model_name,
        };

        let max_tool_rounds = cfg.max_tool_rounds;
        let tool_timeout = Duration::from_secs(cfg.tool_timeout_secs);
        let first = assemble(
            1,
            report,
            binding,
            max_tool_rounds,
            tool_timeout,
            &telemetry,
        );
        tracing::info!(
            generation = first.id,
            tools = first.tools.len(),
            provider = %first.provider,
            model = %first.model_name,
            "runtime ready"
        );
        Ok(Self {
            registry,
            resolver,
            telemetry,
            max_tool_rounds,
            tool_timeout,
            active: RwLock::new(Arc::new(first)),
            last_id: AtomicU64::new(1),
        })
    }

    pub fn current(&self) -> Arc<Generation> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Rebuilds the registry (re-importing the dynamic namespace) and binds
    /// the model from `cfg` to it. The active generation is unchanged on error.
    pub fn reload(&self, cfg: &RuntimeConfig) -> Result<ReloadSummary> {
        let previous = self.current();
        let result = self.try_reload(cfg, &previous);
        match &result {
            Ok(summary) => {
                tracing::info!(summary = %summary.describe(), "capabilities reloaded");
                self.telemetry.emit(
                    "capability.reload.succeeded",
                    json!({
                        "generation": summary.generation,
                        "tools": summary.tool_count,
                        "added": summary.added,
                        "removed": summary.removed,
                        "issues": summary.issues
                    }),
                );
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), generation = previous.id, "capability reload failed; keeping previous generation");
                self.telemetry.emit(
                    "capability.reload.failed",
                    json!({ "generation": previous.id, "error": format!("{err:#}") }),
                );
            }
        }
        result
    }

    fn try_reload(&self, cfg: &RuntimeConfig, previous: &Generation) -> Result<ReloadSummary> {
        let report = self.registry.build();
        for namespace in self.registry.namespaces() {
            if namespace.kind != NamespaceKind::Dynamic {
                continue;
            }
            if let Some(issue) = report.namespace_failed(&namespace.name) {
                return Err(anyhow::anyhow!(
                    "capability namespace '{}' could not be re-imported: {}",
                    namespace.name,
                    issue.error
                ));
            }
        }
        log_report(&report, &self.telemetry, "reload");

        let (model, provider, model_name) = self.resolver.resolve(cfg)?;
        let next = assemble(
            self.next_id(),
            report,
            Binding {
                model,
                provider,
                model_name,
            },
            self.max_tool_rounds,
            self.tool_timeout,
            &self.telemetry,
        );
        let (added, removed) = diff_tool_names(&previous.tools, &next.tools);
        let summary = ReloadSummary {
            generation: next.id,
            tool_count: next.tools.len(),
            added,
            removed,
            issues: next.issues.len(),
        };
        self.swap(next);
        Ok(summary)
    }

    /// Binds a new model to the current tool set. The active generation is
    /// unchanged on error.
    pub fn rebind_model(&self, cfg: &RuntimeConfig) -> Result<Arc<Generation>> {
        let (model, provider, model_name) = self.resolver.resolve(cfg)?;
        let previous = self.current();
        let report = LoadReport {
            tools: previous.tools.as_ref().clone(),
            capabilities: previous.capabilities.clone(),
            issues: previous.issues.clone(),
            overridden: Vec::new(),
        };
        let next = assemble(
            self.next_id(),
            report,
            Binding {
                model,
                provider,
                model_name,
            },
            self.max_tool_rounds,
            self.tool_timeout,
            &self.telemetry,
        );
        Ok(self.swap(next))
    }

    fn next_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn swap(&self, next: Generation) -> Arc<Generation> {
        let next = Arc::new(next);
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = next.clone();
        tracing::debug!(generation = next.id, "generation activated");
        next
    }
}

fn assemble(
    id: u64,
    report: LoadReport,
    binding: Binding,
    max_tool_rounds: usize,
    tool_timeout: Duration,
    telemetry: &TelemetrySink,
) -> Generation {
    let tools = Arc::new(report.tools);
    let runner = AgentRunner::new(
        binding.model,
        tools.clone(),
        build_system_prompt(&tools),
        max_tool_rounds,
        tool_timeout,
        telemetry.clone(),
    );
    Generation {
        id,
        tools,
        capabilities: report.capabilities,
        issues: report.issues,
        runner: Arc::new(runner),
        provider: binding.provider,
        model_name: binding.model_name,
    }
}

fn log_report(report: &LoadReport, telemetry: &TelemetrySink, phase: &str) {
    for issue in &report.issues {
        tracing::warn!(
            namespace = %issue.namespace,
            module = %issue.module,
            error = %issue.error,
            "capability skipped"
        );
    }
    telemetry.emit(
        "capability.loaded",
        json!({
            "phase": phase,
            "tools": report.tools.len(),
            "capabilities": report.capabilities.len(),
            "issues": report.issues.len(),
            "overridden": report.overridden
        }),
    );
}
