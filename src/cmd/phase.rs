//! Read-only run inspection: `buildpilot status`, `counters`, `usage`.

use anyhow::Result;
use console::style;

use buildpilot::config::Config;
use buildpilot::lock::RunLock;
use buildpilot::phase::{Phase, PhaseState};
use buildpilot::store::{FileStore, PhaseStore};
use buildpilot::usage::{BudgetLimits, aggregate, remaining_fraction};

fn styled_state(phase: &Phase) -> console::StyledObject<String> {
    let text = match &phase.failure_reason {
        Some(reason) if phase.state == PhaseState::Failed => reason.to_string(),
        _ => phase.state.to_string(),
    };
    match phase.state {
        PhaseState::Complete => style(text).green(),
        PhaseState::Failed => style(text).red(),
        PhaseState::Blocked => style(text).magenta(),
        PhaseState::Executing | PhaseState::AwaitingAudit => style(text).cyan(),
        PhaseState::Queued => style(text).dim(),
    }
}

pub fn cmd_status(config: &Config, run_id: Option<&str>) -> Result<()> {
    let store = FileStore::new(&config.root);

    let Some(run_id) = run_id else {
        let runs = store.list_runs()?;
        println!();
        if runs.is_empty() {
            println!("No runs under {}", config.root.display());
            println!("Create one with 'buildpilot init --run <id> --anchor <file> --plan <file>'.");
        } else {
            println!("Runs under {}:", config.root.display());
            for run in runs {
                let marker = if RunLock::is_locked(&config.root, &run) {
                    style(" (driving)").yellow().to_string()
                } else {
                    String::new()
                };
                println!("  {}{}", run, marker);
            }
        }
        println!();
        return Ok(());
    };

    let phases = store.list_phases(run_id)?;
    let counters = store.load_counters(run_id)?;

    println!();
    println!("Run {}", style(run_id).bold());
    if RunLock::is_locked(&config.root, run_id) {
        let holder = RunLock::last_holder(&config.root, run_id).unwrap_or_else(|| "unknown".into());
        println!("  driven by {}", style(holder).yellow());
    }
    println!(
        "  replans {}  escalations {}",
        counters.replans, counters.escalations
    );
    println!();
    println!(
        "{:<16} {:<8} {:<10} {:<6} {:<10} State",
        "Phase", "Kind", "Attempts", "Epoch", "Tier"
    );
    println!(
        "{:<16} {:<8} {:<10} {:<6} {:<10} -----",
        "----------------", "--------", "----------", "------", "----------"
    );
    for phase in &phases {
        println!(
            "{:<16} {:<8} {:<10} {:<6} {:<10} {}",
            phase.id,
            phase.kind,
            format!("{}/{}", phase.attempt_index, phase.max_attempts),
            phase.revision_epoch,
            if phase.tier.is_empty() { "-" } else { phase.tier.as_str() },
            styled_state(phase)
        );
        if let Some(last) = phase.error_history.last()
            && !phase.state.is_terminal()
        {
            println!(
                "  {} {}: {}",
                style("last error").dim(),
                last.error_type,
                last.error_details
            );
        }
    }
    println!();
    Ok(())
}

pub fn cmd_counters(config: &Config, run_id: &str) -> Result<()> {
    let store = FileStore::new(&config.root);
    // Touch the phases so an unknown run is an error rather than zeros.
    store.list_phases(run_id)?;
    let counters = store.load_counters(run_id)?;
    println!("{}", serde_json::to_string_pretty(&counters)?);
    Ok(())
}

pub fn cmd_usage(config: &Config, run_id: &str) -> Result<()> {
    let store = FileStore::new(&config.root);
    let anchor = store.load_anchor(run_id)?;
    let events = store.usage_events(run_id)?;
    let totals = aggregate(&events);
    let limits = BudgetLimits::from_anchor(&anchor.budgets, config.toml.orchestrator.max_tokens);
    let remaining = remaining_fraction(&totals, &limits);

    let limit = |value: u64| {
        if value == 0 {
            "unlimited".to_string()
        } else {
            value.to_string()
        }
    };

    println!();
    println!("Usage for run {}", style(run_id).bold());
    println!("  events:         {}", totals.event_count);
    println!(
        "  tokens:         {} / {}",
        totals.tokens_used,
        limit(limits.max_tokens)
    );
    println!(
        "  context chars:  {} / {}",
        totals.context_chars_used,
        limit(limits.max_context_chars)
    );
    println!(
        "  sot chars:      {} / {}",
        totals.sot_chars_used,
        limit(limits.max_sot_chars)
    );
    let pct = format!("{:.0}%", remaining * 100.0);
    let pct = if remaining < config.toml.stuck.low_budget_threshold {
        style(pct).red().bold()
    } else {
        style(pct).green()
    };
    println!("  remaining:      {}", pct);
    println!();
    Ok(())
}
