//! `skill.md` manifests.
//!
//! The only field the loader reads is the `## Entry` section. Everything else
//! is documentation for people and for the model.
use std::path::Path;

use super::module::is_within;

pub const MANIFEST_FILE_NAME: &str = "skill.md";

/// Reads the declared entry module path from a manifest file.
///
/// Missing or unreadable files count as "not declared".
pub fn parse_entry(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_entry_text(&content),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "manifest not readable");
            None
        }
    }
}

/// Returns the first non-blank line after the `## Entry` heading, trimmed.
///
/// A heading that directly follows the entry heading means the section is
/// empty, so nothing is declared.
pub fn parse_entry_text(content: &str) -> Option<String> {
    let mut lines = content.lines();
    lines.by_ref().find(|line| is_entry_heading(line))?;
    let value = lines.map(str::trim).find(|line| !line.is_empty())?;
    // Stricter than "first non-blank line": a heading here ends an empty section.
    if value.starts_with('#') {
        return None;
    }
    Some(value.to_string())
}

/// Rewrites a declared entry below `from` to the same path below `to`.
///
/// Returns `None` when no entry is declared or it lies outside `from`.
pub fn retarget_entry(content: &str, from: &str, to: &str) -> Option<String> {
    let lines = content.lines().collect::<Vec<_>>();
    let heading = lines.iter().position(|line| is_entry_heading(line))?;
    let offset = lines[heading + 1..]
        .iter()
        .position(|line| !line.trim().is_empty())?;
    let index = heading + 1 + offset;
    let value = lines[index].trim();
    if !is_within(value, from) {
        return None;
    }

    let retargeted = format!("{to}{}", &value[from.len()..]);
    let mut out = lines
        .iter()
        .enumerate()
        .map(|(i, line)| if i == index { retargeted.as_str() } else { *line })
        .collect::<Vec<_>>()
        .join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

fn is_entry_heading(line: &str) -> bool {
    let trimmed = line.trim();
    let title = trimmed.trim_start_matches('#');
    title.len() < trimmed.len() && title.trim().eq_ignore_ascii_case("entry")
}

/// Manifest written for generated skills.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub description: String,
    pub entry: String,
    pub tools: Vec<(String, String)>,
    pub platforms: Vec<String>,
    pub references: Vec<String>,
}

impl Manifest {
    pub fn render(&self) -> String {
        let mut out = String::new();
        push_section(&mut out, "Name", &self.name);
        push_section(&mut out, "Version", &self.version);
        push_section(&mut out, "Description", &self.description);
        push_section(&mut out, "Entry", &self.entry);

        let tools = if self.tools.is_empty() {
            "- (none)".to_string()
        } else {
            self.tools
                .iter()
                .map(|(name, description)| format!("- `{name}`: {description}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        push_section(&mut out, "Tools", &tools);

        let platforms = if self.platforms.is_empty() {
            "any".to_string()
        } else {
            self.platforms.join(", ")
        };
        push_section(&mut out, "Platforms", &platforms);

        let references = self
            .references
            .iter()
            .map(|reference| format!("- {reference}"))
            .collect::<Vec<_>>()
            .join("\n");
        push_section(&mut out, "References", &references);
        out
    }
}

fn push_section(out: &mut String, title: &str, body: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str("## ");
    out.push_str(title);
    out.push('\n');
    if !body.trim().is_empty() {
        out.push_str(body.trim_end());
        out.push('\n');
    }
}
