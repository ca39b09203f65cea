use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig};

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Provider: {}", cfg.provider);
    println!(
        "Model: {}",
        cfg.model.as_deref().unwrap_or("<provider-default>")
    );
    println!("Temperature: {}", cfg.temperature);
    println!(
        "Namespaces: static={} dynamic={}",
        cfg.static_namespace, cfg.dynamic_namespace
    );
    println!("Auto skills dir: {}", cfg.auto_skills_dir.display());
    println!("Curated skills dir: {}", cfg.skills_dir.display());
    println!("Task plan path: {}", cfg.plan_path.display());
    println!("Max auto steps: {}", cfg.max_auto_steps);
    println!("Max tool rounds: {}", cfg.max_tool_rounds);
    println!("Tool timeout (secs): {}", cfg.tool_timeout_secs);
    println!(
        "Compaction: threshold={} keep_recent={}",
        cfg.compact_threshold, cfg.compact_keep_recent
    );
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    Ok(())
}
