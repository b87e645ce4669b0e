//! File-backed leases.
//!
//! Each resource has one lease file under the lock directory. Every
//! read-modify-write of a lease file happens under an exclusive `flock` on
//! `<dir>/.guard`, so two processes can never both observe a resource as free
//! and both claim it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::{FileGuard, write_atomic};
use crate::errors::LockError;

pub const DEFAULT_LEASE_TTL_SECS: u64 = 300;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

const GUARD_FILE: &str = ".guard";
const LEASE_SUFFIX: &str = ".lease.json";

/// Identity of a lease holder: `host:pid:task`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Owner(String);

impl Owner {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// Owner string for a task running in this process.
    pub fn current(task: &str) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self(format!("{}:{}:{}", host, std::process::id(), task))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A granted claim over a named resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource: String,
    pub owner: Owner,
    /// Unique per grant; distinguishes a re-grant to the same owner string.
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn is_held_by(&self, owner: &Owner) -> bool {
        &self.owner == owner
    }
}

/// What `release` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// No live lease existed for the resource.
    NotHeld,
    /// A live lease exists but belongs to someone else.
    HeldByOther { holder: Owner },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub acquire_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            acquire_timeout: Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Grants, renews and releases leases stored under one directory.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    dir: PathBuf,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(dir: impl Into<PathBuf>, config: LeaseConfig) -> Self {
        Self {
            dir: dir.into(),
            config,
        }
    }

    /// Manager for the shared `locks/` directory under an artifact root.
    pub fn for_root(root: &Path, config: LeaseConfig) -> Self {
        Self::new(root.join("locks"), config)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn lease_path(&self, resource: &str) -> PathBuf {
        let safe: String = resource
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}{}", safe, LEASE_SUFFIX))
    }

    fn guard(&self) -> Result<FileGuard, LockError> {
        let path = self.dir.join(GUARD_FILE);
        FileGuard::acquire(&path).map_err(|source| LockError::Io { path, source })
    }

    fn read(&self, resource: &str) -> Result<Option<Lease>, LockError> {
        let path = self.lease_path(resource);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(LockError::Io { path, source }),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| LockError::Corrupt { path, source })
    }

    fn write(&self, lease: &Lease) -> Result<(), LockError> {
        let path = self.lease_path(&lease.resource);
        let content =
            serde_json::to_vec_pretty(lease).map_err(|source| LockError::Corrupt {
                path: path.clone(),
                source,
            })?;
        write_atomic(&path, &content).map_err(|source| LockError::Io { path, source })
    }

    fn remove(&self, resource: &str) -> Result<(), LockError> {
        let path = self.lease_path(resource);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::milliseconds(self.config.ttl.as_millis() as i64)
    }

    /// Non-blocking acquisition. Fails with `LockError::Held` while any live
    /// lease exists for `resource`, including one held by `owner` itself.
    pub fn try_acquire(&self, resource: &str, owner: &Owner) -> Result<Lease, LockError> {
        let _guard = self.guard()?;
        let now = Utc::now();

        if let Some(existing) = self.read(resource)? {
            if !existing.is_expired(now) {
                return Err(LockError::Held {
                    resource: resource.to_string(),
                    holder: existing.owner.to_string(),
                });
            }
            tracing::info!(
                resource,
                previous_owner = %existing.owner,
                "re-granting expired lease"
            );
        }

        let lease = Lease {
            resource: resource.to_string(),
            owner: owner.clone(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: self.expiry_from(now),
        };
        self.write(&lease)?;
        tracing::debug!(resource, owner = %owner, "lease acquired");
        Ok(lease)
    }

    /// Poll `try_acquire` until it succeeds or `timeout` elapses.
    pub fn acquire(
        &self,
        resource: &str,
        owner: &Owner,
        timeout: Duration,
    ) -> Result<Lease, LockError> {
        let start = Instant::now();
        loop {
            match self.try_acquire(resource, owner) {
                Ok(lease) => return Ok(lease),
                Err(LockError::Held { .. }) if start.elapsed() < timeout => {
                    let left = timeout.saturating_sub(start.elapsed());
                    std::thread::sleep(self.config.poll_interval.min(left));
                }
                Err(LockError::Held { .. }) => {
                    return Err(LockError::Timeout {
                        resource: resource.to_string(),
                        waited_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Extend a lease after re-verifying that it is still ours.
    ///
    /// A lease that lapsed but was never re-granted may still be renewed. A
    /// lease that was removed or re-granted fails with `OwnershipLost`.
    pub fn renew(&self, lease: &Lease) -> Result<Lease, LockError> {
        let _guard = self.guard()?;
        let lost = |detail: String| LockError::OwnershipLost {
            resource: lease.resource.clone(),
            owner: lease.owner.to_string(),
            detail,
        };

        let current = self
            .read(&lease.resource)?
            .ok_or_else(|| lost("lease no longer exists".to_string()))?;
        if !current.is_held_by(&lease.owner) {
            return Err(lost(format!("lease re-granted to {}", current.owner)));
        }
        if current.token != lease.token {
            return Err(lost("lease re-granted under a new token".to_string()));
        }

        let now = Utc::now();
        let renewed = Lease {
            expires_at: self.expiry_from(now),
            ..current
        };
        self.write(&renewed)?;
        tracing::debug!(resource = %lease.resource, owner = %lease.owner, "lease renewed");
        Ok(renewed)
    }

    /// Release `resource` if `owner` holds it.
    pub fn release(&self, resource: &str, owner: &Owner) -> Result<ReleaseOutcome, LockError> {
        let _guard = self.guard()?;
        let Some(existing) = self.read(resource)? else {
            return Ok(ReleaseOutcome::NotHeld);
        };
        if !existing.is_held_by(owner) {
            if existing.is_expired(Utc::now()) {
                return Ok(ReleaseOutcome::NotHeld);
            }
            return Ok(ReleaseOutcome::HeldByOther {
                holder: existing.owner,
            });
        }
        self.remove(resource)?;
        tracing::debug!(resource, owner = %owner, "lease released");
        Ok(ReleaseOutcome::Released)
    }

    /// Remove any lease on `resource` regardless of owner.
    pub fn force_release(&self, resource: &str) -> Result<ReleaseOutcome, LockError> {
        let _guard = self.guard()?;
        match self.read(resource)? {
            Some(existing) => {
                self.remove(resource)?;
                tracing::warn!(resource, owner = %existing.owner, "lease force-released");
                Ok(ReleaseOutcome::Released)
            }
            None => Ok(ReleaseOutcome::NotHeld),
        }
    }

    /// Current lease record for `resource`, expired or not.
    pub fn inspect(&self, resource: &str) -> Result<Option<Lease>, LockError> {
        self.read(resource)
    }

    /// All lease records in the directory, sorted by resource.
    pub fn list(&self) -> Result<Vec<Lease>, LockError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LockError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut leases = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| LockError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            let is_lease = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(LEASE_SUFFIX));
            if !is_lease {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
            let lease: Lease = serde_json::from_str(&content)
                .map_err(|source| LockError::Corrupt { path, source })?;
            leases.push(lease);
        }
        leases.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(leases)
    }
}
