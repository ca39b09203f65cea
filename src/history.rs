//! Conversation history with a single optional summary head.
//!
//! Compaction folds the oldest verbatim turns, together with the previous
//! summary, into one new summary produced by a dedicated model call. The
//! summary lives in its own field so two summaries can never coexist.
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::model::{ChatModel, Message, ModelRequest};

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    summary: Option<String>,
    turns: Vec<Turn>,
}

pub const SUMMARY_HEADER: &str = "[Summary of earlier conversation]";

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.turns.push(Turn {
            user: user.into(),
            assistant: assistant.into(),
        });
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.summary = None;
        self.turns.clear();
    }

    /// Chat messages for the model: the summary (as a system note) then turns.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.turns.len() * 2 + 1);
        if let Some(summary) = &self.summary {
            messages.push(Message::system(format!("{SUMMARY_HEADER}\n{summary}")));
        }
        for turn in &self.turns {
            messages.push(Message::user(turn.user.clone()));
            messages.push(Message::assistant(turn.assistant.clone()));
        }
        messages
    }

    pub fn needs_compaction(&self, policy: &CompactionPolicy) -> bool {
        self.turns.len() > policy.threshold
    }

    /// Replaces the summary and drops the folded turns.
    fn fold(&mut self, folded: usize, summary: String) {
        self.turns.drain(..folded);
        self.summary = Some(summary);
    }
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Compact once more than this many verbatim turns exist.
    pub threshold: usize,
    /// Newest turns kept verbatim after compaction.
    pub keep_recent: usize,
}

impl CompactionPolicy {
    pub fn new(threshold: usize, keep_recent: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            keep_recent: keep_recent.min(threshold),
        }
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, previous: Option<&str>, turns: &[Turn]) -> Result<String>;
}

const SUMMARY_INSTRUCTION: &str = "[SYSTEM NOTE: automated summarization request]\n\
Condense the conversation below into a factual summary for an automation agent that will \
keep working on the same task. Preserve, as bullet points:\n\
1) user constraints and preferences that still apply\n\
2) decisions that were made and why they are binding\n\
3) task progress: completed steps, current step, remaining work\n\
4) names of skills or tools created or relied on, and file paths produced\n\
Write in third person. Do not answer the user. Do not add new plans.";

pub fn render_transcript(previous: Option<&str>, turns: &[Turn]) -> String {
    let mut text = String::new();
    if let Some(previous) = previous {
        text.push_str("Earlier summary:\n");
        text.push_str(previous.trim());
        text.push_str("\n\n");
    }
    for turn in turns {
        text.push_str("User: ");
        text.push_str(turn.user.trim());
        text.push_str("\nAssistant: ");
        text.push_str(turn.assistant.trim());
        text.push_str("\n\n");
    }
    text
}

/// Summarizes with a plain, tool-less model call.
pub struct ModelSummarizer {
    model: Arc<dyn ChatModel>,
}

impl ModelSummarizer {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Summarizer for ModelSummarizer {
    async fn summarize(&self, previous: Option<&str>, turns: &[Turn]) -> Result<String> {
        let request = ModelRequest {
            messages: vec![
                Message::system(SUMMARY_INSTRUCTION),
                Message::user(format!(
                    "CONVERSATION TO SUMMARIZE:\n\n{}",
                    render_transcript(previous, turns)
                )),
            ],
            tools: Vec::new(),
        };
        let reply = self
            .model
            .complete(&request)
            .await
            .context("summarization request failed")?;
        let summary = reply.content.trim().to_string();
        if summary.is_empty() {
            return Err(anyhow::anyhow!("summarization returned empty text"));
        }
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    NotNeeded,
    Compacted { folded: usize, kept: usize },
    Failed,
}

/// Compacts in place when over threshold. A failed summary leaves `history` untouched.
pub async fn compact_if_needed(
    history: &mut History,
    policy: &CompactionPolicy,
    summarizer: &dyn Summarizer,
) -> CompactionOutcome {
    if !history.needs_compaction(policy) {
        return CompactionOutcome::NotNeeded;
    }
    let folded = history.turns.len() - policy.keep_recent;
    if folded == 0 {
        return CompactionOutcome::NotNeeded;
    }

    let result = summarizer
        .summarize(history.summary(), &history.turns[..folded])
        .await;
    match result {
        Ok(summary) => {
            history.fold(folded, summary);
            tracing::info!(folded, kept = history.turns.len(), "history compacted");
            CompactionOutcome::Compacted {
                folded,
                kept: history.turns.len(),
            }
        }
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "history compaction failed; keeping full history");
            CompactionOutcome::Failed
        }
    }
}
