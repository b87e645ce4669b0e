//! Run creation and anchor commands: `buildpilot init`, `buildpilot anchor`.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use buildpilot::anchor::IntentionAnchor;
use buildpilot::config::Config;
use buildpilot::orchestrator::HandlerRegistry;
use buildpilot::phase::Phase;
use buildpilot::store::{FileStore, PhaseStore};

use super::super::AnchorCommands;

/// One phase as written in a plan file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanEntry {
    id: String,
    goal: String,
    #[serde(default)]
    deliverables: Vec<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    phases: Vec<PlanEntry>,
}

fn load_plan(path: &Path) -> Result<PlanFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
    let plan: PlanFile = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()))?,
        _ => serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan file: {}", path.display()))?,
    };
    if plan.phases.is_empty() {
        bail!("Plan file {} lists no phases", path.display());
    }
    let mut seen = HashSet::new();
    for entry in &plan.phases {
        if entry.id.trim().is_empty() {
            bail!("Plan file {} has a phase with an empty id", path.display());
        }
        if !seen.insert(entry.id.as_str()) {
            bail!("Plan file {} repeats phase id '{}'", path.display(), entry.id);
        }
    }
    Ok(plan)
}

pub fn cmd_init(config: &Config, run_id: &str, anchor_path: &Path, plan_path: &Path) -> Result<()> {
    let anchor = IntentionAnchor::load(anchor_path)
        .with_context(|| format!("Invalid anchor: {}", anchor_path.display()))?;
    let plan = load_plan(plan_path)?;

    let phases: Vec<Phase> = plan
        .phases
        .into_iter()
        .map(|entry| {
            let settings = config.toml.phase_settings(&entry.id);
            let mut phase = Phase::new(&entry.id, run_id, &entry.goal, entry.deliverables)
                .with_max_attempts(entry.max_attempts.unwrap_or(settings.max_attempts));
            if let Some(kind) = entry.kind {
                phase = phase.with_kind(&kind);
            }
            if let Some(tier) = settings.tier {
                phase.tier = tier;
            }
            phase
        })
        .collect();
    HandlerRegistry::with_defaults().validate(&phases)?;

    let store = FileStore::new(&config.root);
    if store.run_exists(run_id) {
        bail!("Run '{}' already exists under {}", run_id, config.root.display());
    }
    store.create_run(run_id, &anchor, phases)?;

    println!();
    println!(
        "{} run {}",
        console::style("Created").green().bold(),
        console::style(run_id).bold()
    );
    println!("  anchor:  {}", &anchor.digest()[..12]);
    println!("  phases:  {}", store.list_phases(run_id)?.len());
    println!("  root:    {}", store.run_dir(run_id).display());
    println!();
    Ok(())
}

pub fn cmd_anchor_validate(path: &Path) -> Result<()> {
    let anchor = IntentionAnchor::load(path)
        .with_context(|| format!("Invalid anchor: {}", path.display()))?;
    println!("{} {}", console::style("Anchor is valid:").green(), path.display());
    println!("  north star:        {}", anchor.north_star);
    println!("  success criteria:  {}", anchor.success_criteria.len());
    println!("  safety profile:    {}", anchor.safety_profile());
    println!("  digest:            {}", anchor.digest());
    Ok(())
}

pub fn cmd_anchor(config: &Config, command: &AnchorCommands) -> Result<()> {
    match command {
        AnchorCommands::Validate { path } => cmd_anchor_validate(path),
        AnchorCommands::Show { run } => {
            let store = FileStore::new(&config.root);
            let anchor = store.load_anchor(run)?;
            println!("{}", anchor.to_json()?);
            Ok(())
        }
    }
}
