//! Configuration view and validation commands: `buildpilot config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use buildpilot::config::{BuildpilotToml, CONFIG_FILE, Config};

    let config_path = project_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Buildpilot Configuration");
            println!("========================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                BuildpilotToml::load(&config_path)?
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using default configuration.");
                BuildpilotToml::default()
            };
            println!();

            println!("[orchestrator]");
            println!("  max_attempts = {}", toml.orchestrator.max_attempts);
            println!(
                "  capability_timeout_secs = {}",
                toml.orchestrator.capability_timeout_secs
            );
            println!("  max_output_budget = {}", toml.orchestrator.max_output_budget);
            println!("  max_tokens = {}", toml.orchestrator.max_tokens);
            println!();

            println!("[replan]");
            println!("  window = {}", toml.replan.window);
            println!("  similarity_enabled = {}", toml.replan.similarity_enabled);
            println!("  similarity_threshold = {}", toml.replan.similarity_threshold);
            println!("  min_message_length = {}", toml.replan.min_message_length);
            println!("  max_replans_per_phase = {}", toml.replan.max_replans_per_phase);
            println!("  max_replans_per_run = {}", toml.replan.max_replans_per_run);
            println!();

            println!("[stuck]");
            println!("  low_budget_threshold = {}", toml.stuck.low_budget_threshold);
            println!("  max_iterations = {}", toml.stuck.max_iterations);
            println!(
                "  max_escalations_per_phase = {}",
                toml.stuck.max_escalations_per_phase
            );
            println!(
                "  consecutive_failure_threshold = {}",
                toml.stuck.consecutive_failure_threshold
            );
            println!();

            println!("[locks]");
            println!("  ttl_secs = {}", toml.locks.ttl_secs);
            println!("  acquire_timeout_ms = {}", toml.locks.acquire_timeout_ms);
            println!("  poll_interval_ms = {}", toml.locks.poll_interval_ms);
            println!();

            println!("[routing] version {}", toml.routing.version);
            for tier in &toml.routing.tiers {
                println!(
                    "  {} -> {}{}",
                    tier.name,
                    tier.target,
                    if tier.strict_ok { "" } else { " (not for strict runs)" }
                );
            }
            println!();

            if !toml.phases.overrides.is_empty() {
                println!("[phases.overrides]");
                for (pattern, override_cfg) in &toml.phases.overrides {
                    println!("  \"{}\":", pattern);
                    if let Some(max_attempts) = override_cfg.max_attempts {
                        println!("    max_attempts = {}", max_attempts);
                    }
                    if let Some(tier) = &override_cfg.tier {
                        println!("    tier = \"{}\"", tier);
                    }
                }
                println!();
            }

            // Effective values include environment overrides.
            if project_dir.exists() {
                let config = Config::new(project_dir.to_path_buf(), None)?;
                println!("Effective values (with env overrides):");
                println!("  root = {}", config.root.display());
                println!(
                    "  generate_cmd = {}",
                    config.toml.generate_cmd().unwrap_or_else(|| "(unset)".into())
                );
                println!(
                    "  audit_cmd = {}",
                    config.toml.audit_cmd().unwrap_or_else(|| "(unset)".into())
                );
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let toml = BuildpilotToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !project_dir.exists() {
                std::fs::create_dir_all(project_dir)?;
            }

            let toml = BuildpilotToml::default();
            toml.save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [capability] generate_cmd, audit_cmd");
            println!("  - [orchestrator] max_attempts, capability_timeout_secs, max_tokens");
            println!("  - [[routing.tiers]] for the escalation ladder");
            println!("  - [phases.overrides.\"pattern-*\"] for phase-specific settings");
            println!();
        }
    }

    Ok(())
}
