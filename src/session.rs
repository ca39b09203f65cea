//! The orchestration loop.
//!
//! One [`Session`] consumes inputs one at a time. A user input starts an
//! auto-continuation run that keeps invoking the bound agent while it reports
//! `STATE: CONTINUE` or requests a reload, bounded by `max_auto_steps` model
//! invocations per input.
use std::sync::Arc;

use serde_json::json;

use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::control::{
    CONTINUE_INPUT, ControlInput, LoopState, RELOAD_COMPLETE_INPUT, parse_control_input,
    parse_state, strip_reload_sentinel,
};
use crate::history::{CompactionOutcome, CompactionPolicy, History, ModelSummarizer, compact_if_needed};
use crate::runtime::{AgentRuntime, Generation};
use crate::telemetry::TelemetrySink;

/// Where the session publishes what the user should see.
pub trait OutputSink: Send + Sync {
    fn agent(&self, text: &str);
    fn notice(&self, text: &str);
    fn error(&self, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    Idle,
    Exit,
}

/// What happened during the last auto-continuation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub invocations: usize,
    pub reloads: usize,
    pub reload_failures: usize,
    pub compactions: usize,
    /// At most one: compaction is not retried within a run after it fails.
    pub compaction_failures: usize,
    pub final_state: Option<LoopState>,
    pub capped: bool,
    pub failed: bool,
}

pub struct Session {
    cfg: RuntimeConfig,
    runtime: Arc<AgentRuntime>,
    history: History,
    policy: CompactionPolicy,
    telemetry: TelemetrySink,
    sink: Arc<dyn OutputSink>,
    last_run: RunStats,
}

impl Session {
    pub fn new(
        cfg: RuntimeConfig,
        runtime: Arc<AgentRuntime>,
        telemetry: TelemetrySink,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let policy = CompactionPolicy::new(cfg.compact_threshold, cfg.compact_keep_recent);
        Self {
            cfg,
            runtime,
            history: History::new(),
            policy,
            telemetry,
            sink,
            last_run: RunStats::default(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn last_run(&self) -> &RunStats {
        &self.last_run
    }

    pub fn runtime(&self) -> &Arc<AgentRuntime> {
        &self.runtime
    }

    pub async fn handle_input(&mut self, raw: &str) -> InputOutcome {
        match parse_control_input(raw) {
            ControlInput::Empty => InputOutcome::Idle,
            ControlInput::Exit => InputOutcome::Exit,
            ControlInput::SwitchProvider(provider) => {
                self.switch_provider(provider);
                InputOutcome::Idle
            }
            ControlInput::InvalidSwitch { requested, error } => {
                tracing::warn!(requested = %requested, "provider switch rejected");
                self.sink.error(&format!("Provider switch rejected: {error}"));
                InputOutcome::Idle
            }
            ControlInput::User(text) => {
                self.last_run = self.run(text).await;
                InputOutcome::Idle
            }
        }
    }

    async fn run(&mut self, input: String) -> RunStats {
        let mut stats = RunStats::default();
        let mut next_input = input;

        loop {
            if stats.invocations >= self.cfg.max_auto_steps {
                tracing::warn!(max_auto_steps = self.cfg.max_auto_steps, "auto-step limit reached");
                self.telemetry.emit(
                    "session.iteration_cap",
                    json!({ "max_auto_steps": self.cfg.max_auto_steps }),
                );
                self.sink.notice(&format!(
                    "Reached the auto-step limit ({}). Waiting for new input.",
                    self.cfg.max_auto_steps
                ));
                stats.capped = true;
                break;
            }

            let generation = self.runtime.current();
            if stats.compaction_failures == 0 {
                match self.compact(&generation).await {
                    CompactionOutcome::Compacted { .. } => stats.compactions += 1,
                    CompactionOutcome::Failed => stats.compaction_failures += 1,
                    CompactionOutcome::NotNeeded => {}
                }
            }
            stats.invocations += 1;

            let output = match generation.runner.invoke(&next_input, &self.history).await {
                Ok(output) => output,
                Err(err) => {
                    let message = format!("{err:#}");
                    tracing::warn!(error = %message, generation = generation.id, "agent turn failed");
                    self.telemetry.emit(
                        "session.failed",
                        json!({ "generation": generation.id, "error": message }),
                    );
                    self.sink.error(&format!("Agent error: {message}"));
                    stats.failed = true;
                    break;
                }
            };

            let (recorded, reload_requested) = strip_reload_sentinel(&output.text);
            let parsed = parse_state(&recorded);
            if !parsed.visible.is_empty() {
                self.sink.agent(&parsed.visible);
            }
            self.history.push(next_input.clone(), recorded);
            stats.final_state = Some(parsed.state);
            self.telemetry.emit(
                "session.turn",
                json!({
                    "generation": generation.id,
                    "step": stats.invocations,
                    "state": parsed.state.label(),
                    "tool_calls": output.tool_calls,
                    "reload_requested": reload_requested
                }),
            );

            if reload_requested {
                match self.runtime.reload(&self.cfg) {
                    Ok(summary) => {
                        stats.reloads += 1;
                        self.sink
                            .notice(&format!("Skills reloaded: {}.", summary.describe()));
                        next_input = RELOAD_COMPLETE_INPUT.to_string();
                        continue;
                    }
                    Err(err) => {
                        stats.reload_failures += 1;
                        self.sink.error(&format!(
                            "Skill reload failed, keeping the previous skills: {err:#}"
                        ));
                    }
                }
            }

            match parsed.state {
                LoopState::Done => break,
                LoopState::AmbiguousTerminal => {
                    tracing::warn!(
                        marker = parsed.marker.as_deref().unwrap_or("<missing>"),
                        "reply has no recognised STATE marker; treating as done"
                    );
                    self.telemetry.emit(
                        "session.state_ambiguous",
                        json!({
                            "generation": generation.id,
                            "marker": parsed.marker
                        }),
                    );
                    break;
                }
                LoopState::Continue => next_input = CONTINUE_INPUT.to_string(),
            }
        }

        stats
    }

    async fn compact(&mut self, generation: &Generation) -> CompactionOutcome {
        if !self.history.needs_compaction(&self.policy) {
            return CompactionOutcome::NotNeeded;
        }
        let summarizer = ModelSummarizer::new(generation.model().clone());
        let outcome = compact_if_needed(&mut self.history, &self.policy, &summarizer).await;
        match outcome {
            CompactionOutcome::Compacted { folded, kept } => {
                tracing::debug!(folded, kept, generation = generation.id, "compacted before model call");
            }
            CompactionOutcome::Failed => {
                tracing::debug!(generation = generation.id, "compaction disabled for the rest of this run");
            }
            CompactionOutcome::NotNeeded => {}
        }
        outcome
    }

    fn switch_provider(&mut self, provider: Provider) {
        let previous_provider = self.cfg.provider;
        let previous_model = self.cfg.model.take();
        self.cfg.provider = provider;

        match self.runtime.rebind_model(&self.cfg) {
            Ok(generation) => {
                self.history.clear();
                tracing::info!(provider = %generation.provider, model = %generation.model_name, "provider switched");
                self.telemetry.emit(
                    "provider.switched",
                    json!({
                        "from": previous_provider.id(),
                        "to": generation.provider.id(),
                        "model": generation.model_name
                    }),
                );
                self.sink.notice(&format!(
                    "Switched to {} ({}). Conversation history cleared.",
                    generation.provider, generation.model_name
                ));
            }
            Err(err) => {
                self.cfg.provider = previous_provider;
                self.cfg.model = previous_model;
                let active = self.runtime.current();
                tracing::warn!(requested = %provider, error = %format!("{err:#}"), "provider switch failed; rolled back");
                self.telemetry.emit(
                    "provider.switch_failed",
                    json!({ "requested": provider.id(), "error": format!("{err:#}") }),
                );
                self.sink.error(&format!(
                    "Switching to {provider} failed: {err:#}. Still using {} ({}).",
                    active.provider, active.model_name
                ));
            }
        }
    }
}
