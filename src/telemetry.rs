//! JSONL event stream for agent runs, plus the `telemetry report` reader.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::RuntimeConfig;

pub fn unix_ms_now() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Fields stamped on every line; the event payload is flattened next to them.
#[derive(Debug, Clone, Serialize)]
struct RunStamp {
    run_id: String,
    command: String,
    profile: String,
}

#[derive(Serialize)]
struct EventLine<'a> {
    ts_unix_ms: u128,
    event: &'a str,
    #[serde(flatten)]
    stamp: &'a RunStamp,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

/// Appends one JSON object per event. Write failures are logged, never returned.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    target: Option<PathBuf>,
    stamp: Arc<RunStamp>,
    write_lock: Arc<Mutex<()>>,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig, command: String) -> Self {
        let stamp = RunStamp {
            run_id: format!("run-{}-{}", unix_ms_now(), std::process::id()),
            command,
            profile: cfg.profile.clone(),
        };
        Self {
            target: cfg
                .telemetry_enabled
                .then(|| PathBuf::from(&cfg.telemetry_path)),
            stamp: Arc::new(stamp),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn disabled() -> Self {
        Self {
            target: None,
            stamp: Arc::new(RunStamp {
                run_id: String::new(),
                command: String::new(),
                profile: String::new(),
            }),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Non-object payloads are recorded under `value`.
    pub fn emit(&self, event: &str, payload: Value) {
        let Some(path) = self.target.as_deref() else {
            return;
        };
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other)]),
        };
        let line = EventLine {
            ts_unix_ms: unix_ms_now(),
            event,
            stamp: &self.stamp,
            payload,
        };
        if let Err(err) = self.append(path, &line) {
            tracing::warn!(event, path = %path.display(), error = %err, "telemetry write failed");
        }
    }

    fn append(&self, path: &Path, line: &EventLine<'_>) -> Result<()> {
        let mut encoded = serde_json::to_vec(line)
            .with_context(|| format!("failed to encode telemetry event '{}'", line.event))?;
        encoded.push(b'\n');

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create '{}'", dir.display()))?;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(&encoded))
            .with_context(|| format!("failed to append to '{}'", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Outcomes {
    pub ok: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TurnCounts {
    pub total: usize,
    pub failed: usize,
    pub ambiguous_state: usize,
    pub iteration_cap: usize,
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub runs: BTreeSet<String>,
    pub commands: BTreeMap<String, usize>,
    pub turns: TurnCounts,
    pub reloads: Outcomes,
    pub provider_switches: Outcomes,
    pub tool_calls: Outcomes,
    pub last_event_ts_unix_ms: Option<u128>,
}

impl TelemetrySummary {
    fn record(&mut self, event: &Value) {
        self.parsed_events += 1;

        if let Some(run_id) = non_empty_str(event, "run_id") {
            self.runs.insert(run_id.to_string());
        }
        if let Some(command) = non_empty_str(event, "command") {
            *self.commands.entry(command.to_string()).or_default() += 1;
        }
        if let Some(ts) = event.get("ts_unix_ms").and_then(Value::as_u64) {
            let ts = u128::from(ts);
            self.last_event_ts_unix_ms = Some(self.last_event_ts_unix_ms.map_or(ts, |t| t.max(ts)));
        }

        match non_empty_str(event, "event").unwrap_or_default() {
            "session.turn" => self.turns.total += 1,
            "session.failed" => self.turns.failed += 1,
            "session.state_ambiguous" => self.turns.ambiguous_state += 1,
            "session.iteration_cap" => self.turns.iteration_cap += 1,
            "capability.reload.succeeded" => self.reloads.ok += 1,
            "capability.reload.failed" => self.reloads.failed += 1,
            "provider.switched" => self.provider_switches.ok += 1,
            "provider.switch_failed" => self.provider_switches.failed += 1,
            "tool.succeeded" => self.tool_calls.ok += 1,
            "tool.failed" => self.tool_calls.failed += 1,
            _ => {}
        }
    }

    /// Commands by descending count, ties by name.
    pub fn busiest_commands(&self, n: usize) -> Vec<(&str, usize)> {
        let mut ranked = self
            .commands
            .iter()
            .map(|(name, count)| (name.as_str(), *count))
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked.truncate(n);
        ranked
    }
}

fn non_empty_str<'a>(event: &'a Value, key: &str) -> Option<&'a str> {
    event
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
}

/// Summarizes the newest `limit` lines (at least one).
pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary {
        total_lines: lines.len(),
        ..TelemetrySummary::default()
    };
    let skip = lines.len().saturating_sub(limit.max(1));
    for line in lines.iter().skip(skip).map(|line| line.trim()) {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(event) => summary.record(&event),
            Err(_) => summary.parse_errors += 1,
        }
    }
    summary
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))
}

pub fn run_telemetry_report(
    cfg: &RuntimeConfig,
    path_override: Option<String>,
    limit: usize,
) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.telemetry_path.clone()));
    if !path.exists() {
        println!("No telemetry file found at '{}'.", path.display());
        return Ok(());
    }

    let summary = summarize_telemetry_lines(read_lines(&path)?, limit);
    let outcomes = |label: &str, o: Outcomes| println!("{label}: ok={} failed={}", o.ok, o.failed);

    println!("Telemetry report for {}", path.display());
    println!(
        "Events: {} of {} lines ({} unparseable), {} run(s)",
        summary.parsed_events,
        summary.total_lines,
        summary.parse_errors,
        summary.runs.len()
    );
    let turns = summary.turns;
    println!(
        "Turns: total={} failed={} ambiguous_state={} iteration_cap={}",
        turns.total, turns.failed, turns.ambiguous_state, turns.iteration_cap
    );
    outcomes("Skill reloads", summary.reloads);
    outcomes("Provider switches", summary.provider_switches);
    outcomes("Tool calls", summary.tool_calls);

    let busiest = summary.busiest_commands(5);
    if !busiest.is_empty() {
        println!("Commands:");
        for (name, count) in busiest {
            println!("  {name}: {count}");
        }
    }
    if let Some(ts) = summary.last_event_ts_unix_ms {
        println!("Last event at ts_unix_ms={ts}");
    }
    Ok(())
}
