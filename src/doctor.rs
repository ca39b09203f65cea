use anyhow::Result;

use crate::capability::build_registry;
use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::error::redact_api_key_token;
use crate::plan::TaskPlanStore;
use crate::provider::{PROVIDERS, detect_provider, env_present, provider_spec, resolved_endpoint};

pub fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    println!("Provider environment check:");
    let mut seen = Vec::new();
    for spec in PROVIDERS {
        if seen.contains(&spec.api_key_env) {
            continue;
        }
        seen.push(spec.api_key_env);
        let status = match std::env::var(spec.api_key_env) {
            Ok(value) if !value.trim().is_empty() => {
                if cfg.show_sensitive_config {
                    format!("set ({value})")
                } else {
                    format!("set ({})", redact_api_key_token(&value))
                }
            }
            _ => "missing".to_string(),
        };
        println!("- {}: {status}", spec.api_key_env);
    }

    match detect_provider() {
        Some(provider) => println!("Auto provider resolution: {provider}"),
        None => {
            println!("Auto provider resolution: none");
            println!("Tip: export one provider key, for example DEEPSEEK_API_KEY");
        }
    }

    let effective = match cfg.provider {
        Provider::Auto => detect_provider(),
        provider => Some(provider),
    };
    if let Some(spec) = effective.and_then(provider_spec) {
        let (base_url, model) = resolved_endpoint(spec, cfg);
        println!(
            "Model binding: provider={} model={} base_url={} credentials={}",
            spec.provider,
            model,
            base_url,
            if env_present(spec.api_key_env) { "ok" } else { "missing" }
        );
    }

    println!(
        "Loop: max_auto_steps={} max_tool_rounds={} tool_timeout_secs={} compact_threshold={} compact_keep_recent={}",
        cfg.max_auto_steps,
        cfg.max_tool_rounds,
        cfg.tool_timeout_secs,
        cfg.compact_threshold,
        cfg.compact_keep_recent
    );

    let auto_dir = &cfg.auto_skills_dir;
    println!(
        "Auto skills directory: {} ({})",
        auto_dir.display(),
        if auto_dir.is_dir() { "present" } else { "will be created on run" }
    );
    println!(
        "Curated skills directory: {} ({})",
        cfg.skills_dir.display(),
        if cfg.skills_dir.is_dir() { "present" } else { "empty; created by promote_skill" }
    );

    let report = build_registry(cfg).build();
    println!(
        "Skills: {} tools from {} capabilities, {} load issue(s)",
        report.tools.len(),
        report.capabilities.len(),
        report.issues.len()
    );
    for issue in &report.issues {
        println!("  ! {} [{}]: {}", issue.module, issue.namespace, issue.error);
    }

    match TaskPlanStore::new(cfg.plan_path.clone()).load() {
        Ok(Some(plan)) => println!(
            "Task plan: {} ({}/{} steps completed)",
            cfg.plan_path.display(),
            plan.completed_count(),
            plan.steps.len()
        ),
        Ok(None) => println!("Task plan: none ({})", cfg.plan_path.display()),
        Err(err) => println!("Task plan: unreadable ({err:#})"),
    }

    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );

    Ok(())
}
