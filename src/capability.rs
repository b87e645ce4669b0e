//! External generation and audit capabilities.
//!
//! The core never generates or reviews code itself; it calls out through
//! [`GenerationCapability`] and [`AuditCapability`]. [`CommandCapability`] is
//! the default implementation: it runs a configured shell command, writes the
//! request as JSON on stdin and parses a JSON response from stdout.
//!
//! Every call is bounded by the caller's timeout, including draining the
//! pipes. On expiry, once the shell exits, or when the caller drops the call,
//! the whole process group is killed, so a hung agent cannot leave
//! grandchildren running.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::errors::CapabilityError;

/// Input to one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub run_id: String,
    pub phase_id: String,
    pub attempt_index: u32,
    pub task_description: String,
    /// Paths the generator may touch.
    pub allowed_scope: Vec<String>,
    pub max_output_budget: u64,
    /// Routing target of the phase's current tier.
    pub target: String,
}

/// A failure the generator reports about its own attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedError {
    pub error_type: String,
    #[serde(default)]
    pub details: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutput {
    #[serde(default)]
    pub artifact: String,
    #[serde(default)]
    pub touched_paths: Vec<String>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub context_chars: u64,
    #[serde(default)]
    pub error: Option<ReportedError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Approve,
    #[default]
    Revise,
    Escalate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditVerdict {
    pub approved: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub recommendation: Recommendation,
    #[serde(default)]
    pub confidence: Confidence,
    /// Optional classification of a rejection (e.g. `scope_violation`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl AuditVerdict {
    pub fn approve() -> Self {
        Self {
            approved: true,
            recommendation: Recommendation::Approve,
            confidence: Confidence::High,
            ..Default::default()
        }
    }

    pub fn reject(issues: Vec<String>) -> Self {
        Self {
            approved: false,
            issues,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditRequest<'a> {
    artifact: &'a str,
    original_task: &'a str,
}

#[async_trait]
pub trait GenerationCapability: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, CapabilityError>;
}

#[async_trait]
pub trait AuditCapability: Send + Sync {
    async fn review(
        &self,
        artifact: &str,
        original_task: &str,
    ) -> Result<AuditVerdict, CapabilityError>;
}

/// Runs `sh -c <command>` with a JSON request on stdin.
#[derive(Debug, Clone)]
pub struct CommandCapability {
    command: String,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl CommandCapability {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    async fn invoke<Req, Resp>(&self, operation: &str, request: &Req) -> Result<Resp, CapabilityError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(request)
            .map_err(|e| CapabilityError::MalformedOutput(format!("request encoding: {}", e)))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("BUILDPILOT_OPERATION", operation)
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| CapabilityError::SpawnFailed {
            command: self.command.clone(),
            source,
        })?;
        tracing::debug!(operation, command = %self.command, pid = ?child.id(), "capability spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut stdout_task = tokio::spawn(read_pipe(stdout));
        let mut stderr_task = tokio::spawn(read_pipe(stderr));

        let stdin = child.stdin.take();
        let mut stdin_task = tokio::spawn(async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&payload).await,
                None => Ok(()),
            }
        });

        // Armed until the call finishes, so a caller that drops this future
        // still takes the whole group down.
        let mut group = GroupKill::new(child.id());

        let finished = timeout(self.timeout, async {
            let status = child.wait().await.map_err(CapabilityError::Io)?;
            // Background jobs may still hold the pipes open; they go with the leader.
            group.kill();

            if let Err(e) = join_io(&mut stdin_task).await {
                // A command that ignores stdin may close it early.
                tracing::debug!(operation, error = %e, "request not fully written to stdin");
            }
            let stdout = join_io(&mut stdout_task).await.map_err(|e| {
                tracing::warn!(operation, error = %e, "failed to read capability stdout");
                CapabilityError::Io(e)
            })?;
            let stderr = join_io(&mut stderr_task).await.unwrap_or_else(|e| {
                tracing::warn!(operation, error = %e, "failed to read capability stderr");
                Vec::new()
            });
            Ok::<_, CapabilityError>((status, stdout, stderr))
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok(result) => {
                let collected = result?;
                group.disarm();
                collected
            }
            Err(_) => {
                terminate_group(&mut child).await;
                group.disarm();
                stdin_task.abort();
                stdout_task.abort();
                stderr_task.abort();
                tracing::warn!(
                    operation,
                    timeout_secs = self.timeout.as_secs(),
                    "capability timed out; process group killed"
                );
                return Err(CapabilityError::Timeout {
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !status.success() {
            return Err(CapabilityError::NonZeroExit {
                exit_code: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        let text = String::from_utf8_lossy(&stdout);
        serde_json::from_str(text.trim()).map_err(|e| {
            CapabilityError::MalformedOutput(format!("{} (stdout: {})", e, truncate(&text, 200)))
        })
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Await a pipe task, folding a panicked or cancelled task into an I/O error.
async fn join_io<T>(task: &mut JoinHandle<std::io::Result<T>>) -> std::io::Result<T> {
    task.await.map_err(std::io::Error::other)?
}

/// Sends SIGKILL to a process group when dropped, unless disarmed.
struct GroupKill {
    pgid: Option<u32>,
}

impl GroupKill {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn kill(&self) {
        #[cfg(unix)]
        {
            if let Some(pgid) = self.pgid {
                // SAFETY: killpg only sends a signal; the group id is our own child's pid.
                unsafe {
                    libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
                }
            }
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Kill the child's whole process group, then reap the child.
async fn terminate_group(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: killpg only sends a signal; the group id is our own child's pid.
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

fn truncate(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= max {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(max).collect();
        format!("{}...", head)
    }
}

#[async_trait]
impl GenerationCapability for CommandCapability {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutput, CapabilityError> {
        self.invoke("generate", request).await
    }
}

#[async_trait]
impl AuditCapability for CommandCapability {
    async fn review(
        &self,
        artifact: &str,
        original_task: &str,
    ) -> Result<AuditVerdict, CapabilityError> {
        self.invoke(
            "review",
            &AuditRequest {
                artifact,
                original_task,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request() -> GenerationRequest {
        GenerationRequest {
            run_id: "run-1".into(),
            phase_id: "p1".into(),
            attempt_index: 0,
            task_description: "do it".into(),
            allowed_scope: vec!["src/".into()],
            max_output_budget: 1000,
            target: "economy".into(),
        }
    }

    #[tokio::test]
    async fn test_generate_parses_stdout_json() {
        let cap = CommandCapability::new(
            r#"cat > /dev/null; echo '{"artifact":"diff","touched_paths":["src/a.rs"],"tokens_used":42}'"#,
            Duration::from_secs(10),
        );
        let output = cap.generate(&request()).await.unwrap();
        assert_eq!(output.artifact, "diff");
        assert_eq!(output.tokens_used, 42);
        assert!(output.error.is_none());
    }

    #[tokio::test]
    async fn test_request_is_sent_on_stdin() {
        let dir = tempdir().unwrap();
        let capture = dir.path().join("req.json");
        let cap = CommandCapability::new(
            format!(
                r#"cat > {}; echo '{{"approved":true}}'"#,
                capture.display()
            ),
            Duration::from_secs(10),
        );
        let verdict = cap.review("the diff", "the task").await.unwrap();
        assert!(verdict.approved);

        let sent: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&capture).unwrap()).unwrap();
        assert_eq!(sent["artifact"], "the diff");
        assert_eq!(sent["original_task"], "the task");
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let cap = CommandCapability::new("echo nope >&2; exit 3", Duration::from_secs(10));
        let err = cap.generate(&request()).await.unwrap_err();
        match err {
            CapabilityError::NonZeroExit { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_output() {
        let cap = CommandCapability::new("echo not-json", Duration::from_secs(10));
        let err = cap.generate(&request()).await.unwrap_err();
        assert!(matches!(err, CapabilityError::MalformedOutput(_)));
        assert_eq!(err.error_type(), "builder_error");
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("survived");
        // The grandchild would write the marker if it outlived the timeout.
        let cap = CommandCapability::new(
            format!("(sleep 2; touch {}) & sleep 30", marker.display()),
            Duration::from_millis(300),
        );
        let start = std::time::Instant::now();
        let err = cap.generate(&request()).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_job_holding_stdout_is_killed() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("survived");
        // The shell exits at once; its background job keeps stdout open.
        let cap = CommandCapability::new(
            format!(
                r#"cat > /dev/null; (sleep 3; touch {}) & echo '{{"artifact":"x"}}'"#,
                marker.display()
            ),
            Duration::from_millis(300),
        );
        let start = std::time::Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(2), cap.generate(&request())).await;
        assert!(outcome.is_ok(), "call outlived its own timeout");
        assert!(start.elapsed() < Duration::from_secs(2));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_abandoned_call_kills_process_group() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("survived");
        let cap = CommandCapability::new(
            format!("(sleep 2; touch {}) & sleep 30", marker.display()),
            Duration::from_secs(60),
        );
        let outer = tokio::time::timeout(Duration::from_millis(300), cap.generate(&request())).await;
        assert!(outer.is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn test_audit_verdict_defaults() {
        let verdict: AuditVerdict = serde_json::from_str(r#"{"approved":false}"#).unwrap();
        assert_eq!(verdict.recommendation, Recommendation::Revise);
        assert_eq!(verdict.confidence, Confidence::Medium);
        assert!(verdict.issues.is_empty());
    }
}
