//! Text-level control protocol between the model, the transports and the loop.
//!
//! The model ends each reply with `STATE: DONE` or `STATE: CONTINUE`, and may
//! embed [`RELOAD_SENTINEL`] anywhere to request a capability reload. Inputs
//! starting with [`SET_MODEL_PREFIX`] switch the model provider.
use crate::cli::Provider;
use crate::provider::parse_provider_name;

pub const RELOAD_SENTINEL: &str = "__RELOAD_SKILLS__";
pub const SET_MODEL_PREFIX: &str = "__SET_MODEL__:";
pub const STATE_PREFIX: &str = "STATE:";

pub const CONTINUE_INPUT: &str = "Continue, based on the current state, to complete the task.";
pub const RELOAD_COMPLETE_INPUT: &str = "System message: skill hot-reload complete. Confirm the \
     new skills are available and reply briefly, or continue the unfinished task.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Done,
    Continue,
    /// No marker, or a marker with an unknown value. Treated as terminal.
    AmbiguousTerminal,
}

impl LoopState {
    pub fn label(self) -> &'static str {
        match self {
            LoopState::Done => "done",
            LoopState::Continue => "continue",
            LoopState::AmbiguousTerminal => "ambiguous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOutput {
    pub state: LoopState,
    /// Output without the marker line, trimmed.
    pub visible: String,
    /// The raw value after `STATE:` when a marker line was present.
    pub marker: Option<String>,
}

/// Reads the marker from the last non-empty line.
///
/// A marker line is removed from the visible text even when its value is not
/// recognized. Without a marker line the text is returned trimmed and the
/// state is [`LoopState::AmbiguousTerminal`].
pub fn parse_state(output: &str) -> ParsedOutput {
    let lines = output.lines().collect::<Vec<_>>();
    let Some(last_index) = lines.iter().rposition(|line| !line.trim().is_empty()) else {
        return ParsedOutput {
            state: LoopState::AmbiguousTerminal,
            visible: String::new(),
            marker: None,
        };
    };

    let last = lines[last_index].trim();
    let is_marker = last
        .get(..STATE_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(STATE_PREFIX));
    if !is_marker {
        return ParsedOutput {
            state: LoopState::AmbiguousTerminal,
            visible: output.trim().to_string(),
            marker: None,
        };
    }

    let value = last[STATE_PREFIX.len()..].trim().to_ascii_uppercase();
    let state = match value.as_str() {
        "DONE" => LoopState::Done,
        "CONTINUE" => LoopState::Continue,
        _ => LoopState::AmbiguousTerminal,
    };
    ParsedOutput {
        state,
        visible: lines[..last_index].join("\n").trim().to_string(),
        marker: Some(value),
    }
}

/// Removes every occurrence of the reload sentinel.
///
/// Lines that only held the sentinel are dropped; other lines keep their text.
/// Returns the cleaned output and whether the sentinel was present.
pub fn strip_reload_sentinel(output: &str) -> (String, bool) {
    if !output.contains(RELOAD_SENTINEL) {
        return (output.to_string(), false);
    }
    let kept = output
        .lines()
        .filter_map(|line| {
            if !line.contains(RELOAD_SENTINEL) {
                return Some(line.to_string());
            }
            let stripped = line.replace(RELOAD_SENTINEL, "");
            (!stripped.trim().is_empty()).then(|| stripped.trim_end().to_string())
        })
        .collect::<Vec<_>>();
    (kept.join("\n").trim().to_string(), true)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlInput {
    Empty,
    Exit,
    SwitchProvider(Provider),
    /// A switch request naming an unknown provider.
    InvalidSwitch { requested: String, error: String },
    User(String),
}

pub fn parse_control_input(raw: &str) -> ControlInput {
    let text = raw.trim();
    if text.is_empty() {
        return ControlInput::Empty;
    }
    if text.eq_ignore_ascii_case("exit") || text.eq_ignore_ascii_case("quit") {
        return ControlInput::Exit;
    }
    if let Some(requested) = text.strip_prefix(SET_MODEL_PREFIX) {
        let requested = requested.trim();
        return match parse_provider_name(requested) {
            Ok(provider) => ControlInput::SwitchProvider(provider),
            Err(err) => ControlInput::InvalidSwitch {
                requested: requested.to_string(),
                error: format!("{err:#}"),
            },
        };
    }
    ControlInput::User(text.to_string())
}

pub fn switch_provider_input(provider: Provider) -> String {
    format!("{SET_MODEL_PREFIX}{}", provider.id())
}
