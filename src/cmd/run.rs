//! Phase execution: `buildpilot advance` and `buildpilot drive`.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;

use buildpilot::capability::CommandCapability;
use buildpilot::config::{AUDIT_CMD_ENV, Config, GENERATE_CMD_ENV};
use buildpilot::orchestrator::{
    AttemptStatus, OrchestratorSettings, PhaseOrchestrator, StepOutcome,
};
use buildpilot::store::FileStore;

/// Slack on top of the command's own timeout. The command kills its process
/// group at its limit; the outer bound only catches a wedged pipe reader.
const OUTER_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

fn build_orchestrator(config: &Config) -> Result<PhaseOrchestrator> {
    let generate_cmd = config.toml.generate_cmd().with_context(|| {
        format!(
            "No generation command configured. Set [capability] generate_cmd in buildpilot.toml or {}",
            GENERATE_CMD_ENV
        )
    })?;
    let audit_cmd = config.toml.audit_cmd().with_context(|| {
        format!(
            "No audit command configured. Set [capability] audit_cmd in buildpilot.toml or {}",
            AUDIT_CMD_ENV
        )
    })?;

    let timeout = config.capability_timeout();
    let generator =
        CommandCapability::new(generate_cmd, timeout).with_working_dir(&config.project_dir);
    let auditor = CommandCapability::new(audit_cmd, timeout).with_working_dir(&config.project_dir);

    let mut settings = OrchestratorSettings::from_config(config);
    settings.capability_timeout = timeout + OUTER_TIMEOUT_GRACE;

    Ok(PhaseOrchestrator::new(
        &config.root,
        Arc::new(FileStore::new(&config.root)),
        Arc::new(generator),
        Arc::new(auditor),
        settings,
    ))
}

fn styled_status(status: AttemptStatus) -> console::StyledObject<&'static str> {
    let s = status.as_str();
    match status {
        AttemptStatus::Complete => style(s).green().bold(),
        AttemptStatus::Failed => style(s).red().bold(),
        AttemptStatus::Blocked => style(s).magenta().bold(),
        AttemptStatus::ReplanRequested => style(s).cyan(),
        AttemptStatus::Retry => style(s).yellow(),
    }
}

fn describe(step: &StepOutcome) -> String {
    let mut line = format!(
        "attempt {}/{}  epoch {}  tier {}",
        step.counters.attempt_index,
        step.counters.max_attempts,
        step.counters.revision_epoch,
        if step.counters.tier.is_empty() {
            "-"
        } else {
            step.counters.tier.as_str()
        }
    );
    if let Some(resolution) = step.resolution {
        line.push_str(&format!("  resolution {}", resolution));
    }
    if let Some(reason) = &step.reason {
        line.push_str(&format!("  ({})", reason));
    }
    line
}

pub async fn cmd_advance(config: &Config, run_id: &str, phase_id: &str, json: bool) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    orchestrator.validate_run(run_id)?;
    let step = orchestrator.advance(run_id, phase_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&step)?);
    } else {
        println!("{} {}  {}", phase_id, styled_status(step.status), describe(&step));
    }
    Ok(())
}

pub async fn cmd_drive(config: &Config, run_id: &str, phase_id: Option<&str>) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {prefix:.bold} {msg}")
            .context("Invalid spinner template")?,
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_prefix(run_id.to_string());
    spinner.set_message("starting");

    let results = match phase_id {
        Some(phase_id) => {
            let mut report = |step: &StepOutcome| {
                spinner.println(format!(
                    "{} {}  {}",
                    phase_id,
                    styled_status(step.status),
                    describe(step)
                ));
                spinner.set_message(format!("{} {}", phase_id, step.status));
            };
            let step = orchestrator
                .drive_observed(run_id, phase_id, &mut report)
                .await;
            step.map(|s| vec![(phase_id.to_string(), s)])
        }
        None => {
            let mut report = |id: &str, step: &StepOutcome| {
                spinner.println(format!(
                    "{} {}  {}",
                    id,
                    styled_status(step.status),
                    describe(step)
                ));
                spinner.set_message(format!("{} {}", id, step.status));
            };
            orchestrator.drive_run_observed(run_id, &mut report).await
        }
    };
    spinner.finish_and_clear();
    let results = results?;

    println!();
    let complete = results
        .iter()
        .filter(|(_, s)| s.status == AttemptStatus::Complete)
        .count();
    println!(
        "{} {}/{} driven phase(s) complete",
        style("Done:").bold(),
        complete,
        results.len()
    );
    if let Some((id, last)) = results.last()
        && last.status != AttemptStatus::Complete
    {
        println!("  stopped at {} ({})", style(id).bold(), styled_status(last.status));
    }
    println!();
    Ok(())
}
