//! Persisted task plan.
//!
//! A plan is a single JSON file holding an ordered list of steps. It lives
//! outside conversation history so progress survives compaction and provider
//! switches. Completion is only ever recorded through [`TaskPlanStore::complete`].
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Plan data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: u64,
    pub desc: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl PlanStep {
    fn pending(id: u64, desc: String) -> Self {
        Self {
            id,
            desc,
            status: StepStatus::Pending,
            result: None,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub created_at: String,
    pub status: PlanStatus,
    pub steps: Vec<PlanStep>,
}

impl TaskPlan {
    pub fn new(steps: Vec<String>) -> Self {
        Self {
            created_at: timestamp_now(),
            status: PlanStatus::InProgress,
            steps: steps
                .into_iter()
                .zip(1u64..)
                .map(|(desc, id)| PlanStep::pending(id, desc))
                .collect(),
        }
    }

    pub fn completed_count(&self) -> usize {
        self.steps.iter().filter(|step| step.is_completed()).count()
    }

    pub fn next_pending(&self) -> Option<&PlanStep> {
        self.steps.iter().find(|step| !step.is_completed())
    }

    pub fn next_id(&self) -> u64 {
        self.steps.iter().map(|step| step.id).max().unwrap_or(0) + 1
    }

    fn refresh_status(&mut self) {
        self.status = if !self.steps.is_empty() && self.next_pending().is_none() {
            PlanStatus::Completed
        } else {
            PlanStatus::InProgress
        };
    }

    pub fn format_display(&self) -> String {
        let mut out = format!(
            "Task plan ({}/{} completed, created {})\n",
            self.completed_count(),
            self.steps.len(),
            self.created_at
        );
        for step in &self.steps {
            let mark = if step.is_completed() { "x" } else { " " };
            out.push_str(&format!("  [{mark}] {}: {}\n", step.id, step.desc));
            if let Some(result) = step.result.as_deref() {
                out.push_str(&format!("        result: {result}\n"));
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    NoPlan,
    Pending {
        step: PlanStep,
        completed: usize,
        total: usize,
        remaining: usize,
    },
    Finished {
        completed: usize,
        total: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompleteOutcome {
    NoPlan,
    NotFound(u64),
    Completed { id: u64, already_completed: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    NoPlan,
    Appended(PlanStep),
}

// ---------------------------------------------------------------------------
// File persistence
// ---------------------------------------------------------------------------

/// File-backed store for the single active plan. Assumes one writer.
#[derive(Debug, Clone)]
pub struct TaskPlanStore {
    path: PathBuf,
}

impl TaskPlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces any existing plan.
    pub fn create(&self, steps: Vec<String>) -> Result<TaskPlan> {
        let plan = TaskPlan::new(steps);
        self.save(&plan)?;
        Ok(plan)
    }

    pub fn read_next(&self) -> Result<NextStep> {
        let Some(plan) = self.load()? else {
            return Ok(NextStep::NoPlan);
        };
        let completed = plan.completed_count();
        let total = plan.steps.len();
        Ok(match plan.next_pending() {
            Some(step) => NextStep::Pending {
                step: step.clone(),
                completed,
                total,
                remaining: total - completed,
            },
            None => NextStep::Finished { completed, total },
        })
    }

    /// Marks one step completed. A step that is already completed keeps its
    /// first result and timestamp.
    pub fn complete(&self, step_id: u64, result_summary: &str) -> Result<CompleteOutcome> {
        let Some(mut plan) = self.load()? else {
            return Ok(CompleteOutcome::NoPlan);
        };
        let Some(step) = plan.steps.iter_mut().find(|step| step.id == step_id) else {
            return Ok(CompleteOutcome::NotFound(step_id));
        };
        if step.is_completed() {
            return Ok(CompleteOutcome::Completed {
                id: step_id,
                already_completed: true,
            });
        }

        step.status = StepStatus::Completed;
        step.result = Some(result_summary.trim().to_string()).filter(|value| !value.is_empty());
        step.completed_at = Some(timestamp_now());
        plan.refresh_status();
        self.save(&plan)?;
        Ok(CompleteOutcome::Completed {
            id: step_id,
            already_completed: false,
        })
    }

    pub fn append(&self, step_description: &str) -> Result<AppendOutcome> {
        let Some(mut plan) = self.load()? else {
            return Ok(AppendOutcome::NoPlan);
        };
        let step = PlanStep::pending(plan.next_id(), step_description.trim().to_string());
        plan.steps.push(step.clone());
        plan.refresh_status();
        self.save(&plan)?;
        Ok(AppendOutcome::Appended(step))
    }

    pub fn load(&self) -> Result<Option<TaskPlan>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read task plan '{}'", self.path.display()))?;
        let plan = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse task plan '{}'", self.path.display()))?;
        Ok(Some(plan))
    }

    /// Returns whether a plan file was removed.
    pub fn clear(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&self.path)
            .with_context(|| format!("failed to delete task plan '{}'", self.path.display()))?;
        Ok(true)
    }

    fn save(&self, plan: &TaskPlan) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("failed to create task plan directory")?;
        }
        let json = serde_json::to_string_pretty(plan).context("failed to serialize task plan")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("failed to write task plan '{}'", self.path.display()))
    }
}

fn timestamp_now() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
}
