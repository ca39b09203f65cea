#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Provider,
    Capability,
    Plan,
    Input,
    Server,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Capability => "CAPABILITY",
            ErrorCategory::Plan => "PLAN",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Server => "SERVER",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Provider => {
                "Set provider credentials (for example DEEPSEEK_API_KEY) or pick another --provider."
            }
            ErrorCategory::Capability => {
                "Run skillhost skills list with RUST_LOG=debug to see which capability failed to load."
            }
            ErrorCategory::Plan => {
                "Inspect the task plan with skillhost plan show, or reset it with skillhost plan clear."
            }
            ErrorCategory::Input => "Run skillhost --help and correct command arguments.",
            ErrorCategory::Server => {
                "Check --web-host/--web-port and make sure the port is not already in use."
            }
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key")
        || msg.contains("no provider could be auto-detected")
        || msg.contains("provider")
    {
        return ErrorCategory::Provider;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("profile")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("task plan") {
        return ErrorCategory::Plan;
    }

    if msg.contains("capability")
        || msg.contains("namespace")
        || msg.contains("module")
        || msg.contains("reload")
    {
        return ErrorCategory::Capability;
    }

    if msg.contains("bind") || msg.contains("listener") || msg.contains("server") {
        return ErrorCategory::Server;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let text = format!("{err:#}");
    if show_sensitive_config {
        text
    } else {
        redact_sensitive_text(&text)
    }
}

/// Masks bearer credentials and `sk-` style API keys that backends echo back in error bodies.
pub fn redact_sensitive_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut redact_next = false;

    for (index, token) in text.split(' ').enumerate() {
        if index > 0 {
            out.push(' ');
        }
        if redact_next {
            out.push_str("[REDACTED]");
            redact_next = false;
            continue;
        }
        if token.eq_ignore_ascii_case("bearer") {
            redact_next = true;
            out.push_str(token);
            continue;
        }
        out.push_str(&redact_api_key_token(token));
    }

    out
}

pub fn redact_api_key_token(token: &str) -> String {
    let trimmed = token.trim_matches(|ch: char| matches!(ch, '"' | '\'' | ',' | ';' | '(' | ')'));
    if trimmed.len() > 12 && (trimmed.starts_with("sk-") || trimmed.starts_with("nvapi-")) {
        token.replace(trimmed, "[REDACTED]")
    } else {
        token.to_string()
    }
}
