//! Multi-subsystem locking with a total order.
//!
//! Every caller acquires subsystem leases in the canonical order
//! `queue < runs < archive < docs`, whatever order it asked for, and releases
//! them in exact reverse. Two callers with overlapping sets therefore can never
//! wait on each other in a cycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::lease::{Lease, LeaseManager, Owner, ReleaseOutcome};
use crate::errors::LockError;

/// Shared run-level subsystems. Declaration order is the canonical lock order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    Queue,
    Runs,
    Archive,
    Docs,
}

impl Subsystem {
    pub const ALL: [Subsystem; 4] = [Self::Queue, Self::Runs, Self::Archive, Self::Docs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Runs => "runs",
            Self::Archive => "archive",
            Self::Docs => "docs",
        }
    }

    /// Lease resource name for this subsystem.
    pub fn resource(&self) -> String {
        format!("subsystem.{}", self.as_str())
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Subsystem {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "runs" => Ok(Self::Runs),
            "archive" => Ok(Self::Archive),
            "docs" => Ok(Self::Docs),
            _ => Err(LockError::UnknownSubsystem(s.to_string())),
        }
    }
}

/// Sort and de-duplicate a requested set into acquisition order.
pub fn canonical_order(requested: &[Subsystem]) -> Vec<Subsystem> {
    let mut ordered = requested.to_vec();
    ordered.sort();
    ordered.dedup();
    ordered
}

/// A batch of held subsystem leases, released in reverse on drop.
#[derive(Debug)]
pub struct SubsystemLocks {
    manager: LeaseManager,
    owner: Owner,
    held: Vec<(Subsystem, Lease)>,
}

impl SubsystemLocks {
    /// Acquire every requested subsystem in canonical order.
    ///
    /// If one cannot be acquired within `timeout`, the ones already held are
    /// released (best effort, in reverse) and `LockError::PartialAcquire` names
    /// them.
    pub fn acquire(
        manager: &LeaseManager,
        requested: &[Subsystem],
        owner: &Owner,
        timeout: Duration,
    ) -> Result<Self, LockError> {
        let mut locks = Self {
            manager: manager.clone(),
            owner: owner.clone(),
            held: Vec::new(),
        };

        for subsystem in canonical_order(requested) {
            match manager.acquire(&subsystem.resource(), owner, timeout) {
                Ok(lease) => {
                    tracing::debug!(subsystem = %subsystem, owner = %owner, "subsystem locked");
                    locks.held.push((subsystem, lease));
                }
                Err(err) if err.is_retryable() => {
                    let held_before: Vec<String> =
                        locks.held().iter().map(|s| s.to_string()).collect();
                    tracing::warn!(
                        failed = %subsystem,
                        held_before = ?held_before,
                        "partial subsystem acquire, rolling back"
                    );
                    locks.release_all();
                    return Err(LockError::PartialAcquire {
                        failed: subsystem.to_string(),
                        held_before,
                    });
                }
                Err(err) => {
                    locks.release_all();
                    return Err(err);
                }
            }
        }
        Ok(locks)
    }

    /// Subsystems currently held, in acquisition order.
    pub fn held(&self) -> Vec<Subsystem> {
        self.held.iter().map(|(s, _)| *s).collect()
    }

    /// Release everything held and return the release order.
    pub fn release(mut self) -> Vec<Subsystem> {
        self.release_all()
    }

    fn release_all(&mut self) -> Vec<Subsystem> {
        let mut order = Vec::with_capacity(self.held.len());
        while let Some((subsystem, lease)) = self.held.pop() {
            match self.manager.release(&lease.resource, &self.owner) {
                Ok(ReleaseOutcome::Released) => {}
                Ok(other) => {
                    tracing::warn!(subsystem = %subsystem, outcome = ?other, "subsystem lease was not ours at release");
                }
                Err(e) => {
                    tracing::warn!(subsystem = %subsystem, error = %e, "failed to release subsystem lease");
                }
            }
            order.push(subsystem);
        }
        order
    }
}

impl Drop for SubsystemLocks {
    fn drop(&mut self) {
        self.release_all();
    }
}
