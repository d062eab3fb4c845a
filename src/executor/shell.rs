use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::signals::extract_signals;
use crate::dispatch::{Artifact, ExecutionRequest, ExecutionResult, ExecutionStatus, Executor};
use crate::errors::ExecutorError;

/// Largest artifact file read back into the store.
const MAX_ARTIFACT_BYTES: u64 = 1024 * 1024;

/// Runs a shell command per step with the prompt on stdin.
///
/// Exit code 0 completes the step, any other exit code fails it, and a
/// `<blocker>` tag in stdout blocks it. The child is killed when the
/// timeout fires.
pub struct ShellExecutor {
    id: String,
    command: String,
}

impl ShellExecutor {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    async fn collect_result(
        &self,
        request: &ExecutionRequest,
        output: &std::process::Output,
    ) -> Result<ExecutionResult, ExecutorError> {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);

        let Some(code) = output.status.code() else {
            // Killed by a signal.
            return Err(ExecutorError::Crashed { code: None });
        };

        let signals = extract_signals(&stdout);
        let mut artifacts = vec![Artifact {
            kind: "log".to_string(),
            path: "stdout.log".to_string(),
            content: Some(stdout.clone()),
        }];
        for signal in &signals.artifacts {
            let Some(full) = resolve_artifact(&request.working_dir, &signal.path).await else {
                tracing::warn!(
                    step_id = request.step_run_id,
                    path = %signal.path,
                    "artifact outside the working directory ignored"
                );
                continue;
            };
            artifacts.push(Artifact {
                kind: signal.kind.clone(),
                path: signal.path.clone(),
                content: read_artifact(&full).await,
            });
        }

        let (status, error) = if signals.is_blocked() {
            (ExecutionStatus::Blocked, Some(signals.blockers.join("\n")))
        } else if code != 0 {
            let detail = if stderr.trim().is_empty() {
                stdout.trim().lines().last().unwrap_or_default().to_string()
            } else {
                stderr.trim().to_string()
            };
            (ExecutionStatus::Failed, Some(format!("exit code {code}: {detail}")))
        } else {
            (ExecutionStatus::Completed, None)
        };

        Ok(ExecutionResult {
            status,
            output: stdout,
            artifacts,
            error,
        })
    }
}

/// Resolve an artifact path reported by the command. Absolute paths, `..`
/// and symlinks leading out of `working_dir` resolve to `None`; a missing
/// file inside it still resolves so the artifact is recorded without content.
async fn resolve_artifact(working_dir: &Path, path: &str) -> Option<PathBuf> {
    let relative = Path::new(path);
    let plain = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !plain {
        return None;
    }
    let root = tokio::fs::canonicalize(working_dir).await.ok()?;
    let full = root.join(relative);
    match tokio::fs::canonicalize(&full).await {
        Ok(real) if real.starts_with(&root) => Some(real),
        Ok(_) => None,
        Err(_) => Some(full),
    }
}

async fn read_artifact(full: &Path) -> Option<String> {
    let meta = tokio::fs::metadata(full).await.ok()?;
    if !meta.is_file() || meta.len() > MAX_ARTIFACT_BYTES {
        return None;
    }
    tokio::fs::read_to_string(full).await.ok()
}

#[async_trait]
impl Executor for ShellExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecutorError> {
        tracing::debug!(
            executor = %self.id,
            step_id = request.step_run_id,
            command = %self.command,
            timeout_secs = request.timeout.as_secs(),
            "spawning executor command"
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&request.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CONVEYOR_STEP_ID", request.step_run_id.to_string())
            .env("CONVEYOR_PROTOCOL_ID", request.protocol_run_id.to_string())
            .env("CONVEYOR_STEP_NAME", &request.step_name)
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecutorError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(request.prompt.as_bytes()).await {
                Ok(()) => {}
                // The command is free to ignore its stdin.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(ExecutorError::Io(e)),
            }
        }

        let output = match timeout(request.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(ExecutorError::Io)?,
            Err(_) => {
                tracing::warn!(step_id = request.step_run_id, "executor command timed out");
                return Err(ExecutorError::Timeout(request.timeout));
            }
        };

        tracing::debug!(
            step_id = request.step_run_id,
            exit_code = output.status.code().unwrap_or(-1),
            "executor command finished"
        );
        self.collect_result(&request, &output).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn request(dir: &Path, timeout_ms: u64) -> ExecutionRequest {
        ExecutionRequest {
            step_run_id: 1,
            protocol_run_id: 1,
            step_name: "build".into(),
            prompt: "do the thing".into(),
            working_dir: dir.to_path_buf(),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_zero_exit_completes_with_stdout_log() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let exec = ShellExecutor::new("shell", "cat");
        let result = exec.execute(request(dir.path(), 5_000)).await?;
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.output, "do the thing");
        assert_eq!(result.artifacts[0].kind, "log");
        assert_eq!(result.artifacts[0].content.as_deref(), Some("do the thing"));
        Ok(())
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let exec = ShellExecutor::new("shell", "echo broken >&2; exit 3");
        let result = exec.execute(request(dir.path(), 5_000)).await?;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("exit code 3: broken"));
        Ok(())
    }

    #[tokio::test]
    async fn test_blocker_tag_blocks() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let exec = ShellExecutor::new("shell", "echo '<blocker>need API key</blocker>'");
        let result = exec.execute(request(dir.path(), 5_000)).await?;
        assert_eq!(result.status, ExecutionStatus::Blocked);
        assert_eq!(result.error.as_deref(), Some("need API key"));
        Ok(())
    }

    #[tokio::test]
    async fn test_artifact_tag_reads_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("notes.md"), "# Notes")?;
        let exec = ShellExecutor::new("shell", "echo '<artifact>notes.md</artifact>'");
        let result = exec.execute(request(dir.path(), 5_000)).await?;
        let notes = result.artifacts.iter().find(|a| a.path == "notes.md").unwrap();
        assert_eq!(notes.kind, "file");
        assert_eq!(notes.content.as_deref(), Some("# Notes"));
        Ok(())
    }

    #[tokio::test]
    async fn test_artifacts_outside_working_dir_are_dropped() -> anyhow::Result<()> {
        let root = tempdir()?;
        let work = root.path().join("work");
        std::fs::create_dir(&work)?;
        std::fs::write(root.path().join("secret.txt"), "top secret")?;
        std::os::unix::fs::symlink(root.path().join("secret.txt"), work.join("link.txt"))?;
        let outside = root.path().join("secret.txt");

        let exec = ShellExecutor::new(
            "shell",
            format!(
                "echo '<artifact>{}</artifact><artifact>../secret.txt</artifact><artifact>link.txt</artifact><artifact>later.txt</artifact>'",
                outside.display()
            ),
        );
        let result = exec.execute(request(&work, 5_000)).await?;
        let paths: Vec<&str> = result.artifacts.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, vec!["stdout.log", "later.txt"]);
        assert_eq!(result.artifacts[1].content, None);
        assert!(
            result.artifacts.iter().all(|a| a.content.as_deref() != Some("top secret"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_is_transient_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let exec = ShellExecutor::new("shell", "sleep 5");
        let err = exec.execute(request(dir.path(), 100)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)));
        assert!(err.is_transient());
        Ok(())
    }
}
