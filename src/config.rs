use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::*;

pub const STATIC_NAMESPACE: &str = "skills";
pub const DYNAMIC_NAMESPACE: &str = "auto_skills";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub provider: Provider,
    pub model: Option<String>,
    pub temperature: f32,
    pub show_sensitive_config: bool,
    pub static_namespace: String,
    pub dynamic_namespace: String,
    pub auto_skills_dir: PathBuf,
    pub skills_dir: PathBuf,
    pub plan_path: PathBuf,
    pub max_auto_steps: usize,
    pub max_tool_rounds: usize,
    pub tool_timeout_secs: u64,
    pub compact_threshold: usize,
    pub compact_keep_recent: usize,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub auto_skills_dir: Option<String>,
    pub skills_dir: Option<String>,
    pub plan_path: Option<String>,
    pub max_auto_steps: Option<usize>,
    pub max_tool_rounds: Option<usize>,
    pub tool_timeout_secs: Option<u64>,
    pub compact_threshold: Option<usize>,
    pub compact_keep_recent: Option<usize>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check provider values and field names.",
            path.display()
        )
    })
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    let provider = if cli.provider != Provider::Auto {
        cli.provider
    } else {
        profile.provider.unwrap_or(Provider::Auto)
    };

    let compact_threshold = cli
        .compact_threshold
        .or(profile.compact_threshold)
        .unwrap_or(24)
        .max(2);
    let compact_keep_recent = cli
        .compact_keep_recent
        .or(profile.compact_keep_recent)
        .unwrap_or(8)
        .min(compact_threshold - 1);

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        provider,
        model: cli.model.clone().or(profile.model),
        temperature: cli.temperature.or(profile.temperature).unwrap_or(0.7),
        show_sensitive_config: cli.show_sensitive_config,
        static_namespace: STATIC_NAMESPACE.to_string(),
        dynamic_namespace: DYNAMIC_NAMESPACE.to_string(),
        auto_skills_dir: PathBuf::from(
            cli.auto_skills_dir
                .clone()
                .or(profile.auto_skills_dir)
                .unwrap_or_else(|| ".skillhost/auto_skills".to_string()),
        ),
        skills_dir: PathBuf::from(
            cli.skills_dir
                .clone()
                .or(profile.skills_dir)
                .unwrap_or_else(|| ".skillhost/skills".to_string()),
        ),
        plan_path: PathBuf::from(
            cli.plan_path
                .clone()
                .or(profile.plan_path)
                .unwrap_or_else(|| ".skillhost/current_task_plan.json".to_string()),
        ),
        max_auto_steps: cli
            .max_auto_steps
            .or(profile.max_auto_steps)
            .unwrap_or(30)
            .max(1),
        max_tool_rounds: cli
            .max_tool_rounds
            .or(profile.max_tool_rounds)
            .unwrap_or(100)
            .max(1),
        tool_timeout_secs: cli
            .tool_timeout_secs
            .or(profile.tool_timeout_secs)
            .unwrap_or(120)
            .max(1),
        compact_threshold,
        compact_keep_recent,
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".skillhost/telemetry/events.jsonl".to_string()),
    })
}
