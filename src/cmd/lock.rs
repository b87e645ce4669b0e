//! Lease maintenance: `buildpilot lock`.
//!
//! Every invocation is its own process, so the caller names the owner
//! explicitly; renewal additionally needs the token printed at acquire time.

use anyhow::{Result, bail};
use chrono::Utc;
use console::style;
use dialoguer::Confirm;
use std::time::Duration;

use buildpilot::config::Config;
use buildpilot::lock::{Lease, LeaseManager, Owner, ReleaseOutcome, Subsystem};

use super::super::LockCommands;

pub fn cmd_lock(config: &Config, command: &LockCommands) -> Result<()> {
    let manager = LeaseManager::for_root(&config.root, config.lease_config());

    match command {
        LockCommands::Acquire {
            subsystem,
            owner,
            timeout_ms,
        } => {
            let subsystem: Subsystem = subsystem.parse()?;
            let wait = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(manager.config().acquire_timeout);
            let lease = manager.acquire(&subsystem.resource(), &Owner::new(owner.as_str()), wait)?;
            println!("{}", serde_json::to_string_pretty(&lease)?);
        }
        LockCommands::Renew {
            subsystem,
            owner,
            token,
        } => {
            let subsystem: Subsystem = subsystem.parse()?;
            let now = Utc::now();
            let claimed = Lease {
                resource: subsystem.resource(),
                owner: Owner::new(owner.as_str()),
                token: token.clone(),
                acquired_at: now,
                expires_at: now,
            };
            let renewed = manager.renew(&claimed)?;
            println!("{}", serde_json::to_string_pretty(&renewed)?);
        }
        LockCommands::Release {
            subsystem,
            owner,
            force,
        } => {
            let subsystem: Subsystem = subsystem.parse()?;
            let resource = subsystem.resource();
            let outcome = if *force {
                if !config.yes {
                    let holder = manager
                        .inspect(&resource)?
                        .map(|l| l.owner.to_string())
                        .unwrap_or_else(|| "nobody".into());
                    let confirm = Confirm::new()
                        .with_prompt(format!(
                            "Force-release {} (held by {})?",
                            subsystem, holder
                        ))
                        .default(false)
                        .interact()
                        .unwrap_or(false);
                    if !confirm {
                        println!("Release cancelled");
                        return Ok(());
                    }
                }
                manager.force_release(&resource)?
            } else {
                let Some(owner) = owner else {
                    bail!("--owner is required unless --force is given");
                };
                manager.release(&resource, &Owner::new(owner.as_str()))?
            };

            match outcome {
                ReleaseOutcome::Released => println!("{} {}", style("Released").green(), subsystem),
                ReleaseOutcome::NotHeld => println!("{} was not held", subsystem),
                ReleaseOutcome::HeldByOther { holder } => {
                    bail!("{} is held by {}, not released", subsystem, holder)
                }
            }
        }
        LockCommands::Status => {
            let leases = manager.list()?;
            if leases.is_empty() {
                println!("No leases under {}", manager.dir().display());
                return Ok(());
            }
            let now = Utc::now();
            println!("{:<22} {:<40} Expires", "Resource", "Owner");
            for lease in leases {
                let expiry = if lease.is_expired(now) {
                    style("expired".to_string()).dim()
                } else {
                    style(format!("in {}s", (lease.expires_at - now).num_seconds())).green()
                };
                println!("{:<22} {:<40} {}", lease.resource, lease.owner.as_str(), expiry);
            }
        }
    }
    Ok(())
}
