use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::SlotLimits;
use crate::constants::{
    EXEC_DEADLINE_GRACE_MS, SLOT_START_POLL_ATTEMPTS, SLOT_START_POLL_INTERVAL_MS,
    TIMEOUT_EXIT_CODE, WORKDIR,
};
use crate::core::protocol::timeout_secs;
use crate::core::traits::backend::{Backend, BackendError, Invocation, RawOutput};

#[derive(Clone, Debug)]
pub struct DockerBackend {
    binary: PathBuf,
    /// Added to an invocation's timeout before the caller tears it down.
    deadline_grace: Duration,
}

impl DockerBackend {
    pub fn new<T>(binary: T) -> Self
    where
        T: AsRef<Path>,
    {
        DockerBackend {
            binary: binary.as_ref().into(),
            deadline_grace: Duration::from_millis(EXEC_DEADLINE_GRACE_MS),
        }
    }

    pub fn with_deadline_grace(mut self, grace: Duration) -> Self {
        self.deadline_grace = grace;
        self
    }

    /// Runs the CLI to completion. Returns trimmed stdout, or trimmed stderr
    /// as the error.
    async fn docker(&self, args: &[&str]) -> Result<String, String> {
        tracing::trace!(command = ?args, "docker");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| e.to_string())?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    async fn docker_ignore_errors(&self, args: &[&str]) {
        if let Err(err) = self.docker(args).await {
            tracing::trace!(command = ?args, error = %err, "docker command failed (ignored)");
        }
    }

    async fn last_logs(&self, name: &str) -> String {
        match Command::new(&self.binary)
            .args(["logs", "--tail", "5", name])
            .output()
            .await
        {
            Ok(output) => format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )
            .trim()
            .to_string(),
            Err(err) => err.to_string(),
        }
    }
}

pub fn run_args(name: &str, image: &str, limits: &SlotLimits) -> Vec<String> {
    let mut args: Vec<String> = ["run", "-d", "--name", name, "--network", "none"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend([
        format!("--memory={}m", limits.memory_mb),
        format!("--memory-swap={}m", limits.memory_mb),
        format!("--cpus={}", limits.cpus),
        format!("--pids-limit={}", limits.pids),
        "--ulimit".to_string(),
        format!("nofile={0}:{0}", limits.open_files),
        "--ulimit".to_string(),
        format!("fsize={0}:{0}", limits.file_size_bytes),
        "--tmpfs".to_string(),
        format!("/tmp:rw,exec,nodev,nosuid,size={}m", limits.tmpfs_size_mb),
        image.to_string(),
        "sleep".to_string(),
        "infinity".to_string(),
    ]);
    args
}

pub fn exec_args(name: &str, invocation: &Invocation) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if invocation.stdin.is_some() {
        args.push("-i".to_string());
    }
    if invocation.privileged {
        args.extend(["-u".to_string(), "root".to_string()]);
    }
    args.extend([
        name.to_string(),
        "timeout".to_string(),
        "-s".to_string(),
        "KILL".to_string(),
        timeout_secs(invocation.timeout_ms).to_string(),
        "sh".to_string(),
        "-c".to_string(),
        invocation.command.clone(),
    ]);
    args
}

#[async_trait::async_trait]
impl Backend for DockerBackend {
    #[tracing::instrument(skip(self, limits))]
    async fn create_slot(
        &self,
        name: &str,
        image: &str,
        limits: &SlotLimits,
    ) -> Result<(), BackendError> {
        let failed = |msg: String| BackendError::CreateFailed {
            name: name.to_string(),
            msg,
        };

        self.docker_ignore_errors(&["rm", "-f", name]).await;

        let args = run_args(name, image, limits);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.docker(&args).await.map_err(failed)?;

        for _ in 0..SLOT_START_POLL_ATTEMPTS {
            if self.is_alive(name).await {
                tracing::debug!("Slot {} is running", name);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(SLOT_START_POLL_INTERVAL_MS)).await;
        }

        let logs = self.last_logs(name).await;
        Err(failed(format!("not running after start, logs: {logs}")))
    }

    async fn destroy_slot(&self, name: &str) {
        self.docker_ignore_errors(&["rm", "-f", name]).await;
    }

    async fn is_alive(&self, name: &str) -> bool {
        matches!(
            self.docker(&["inspect", "-f", "{{.State.Running}}", name]).await,
            Ok(state) if state == "true"
        )
    }

    #[tracing::instrument(skip(self))]
    async fn copy_in(&self, name: &str, host_dir: &Path) -> Result<(), BackendError> {
        let clear = format!("rm -rf {WORKDIR}/* {WORKDIR}/.[!.]*");
        self.docker_ignore_errors(&["exec", "-u", "root", name, "sh", "-c", clear.as_str()])
            .await;

        let source = format!("{}/.", host_dir.display());
        let target = format!("{name}:{WORKDIR}/");
        self.docker(&["cp", source.as_str(), target.as_str()])
            .await
            .map(|_| ())
            .map_err(|msg| BackendError::CopyFailed {
                name: name.to_string(),
                msg,
            })
    }

    #[tracing::instrument(skip(self, invocation), fields(command = %invocation.command))]
    async fn exec(&self, name: &str, invocation: &Invocation) -> Result<RawOutput, BackendError> {
        let failed = |msg: String| BackendError::ExecFailed {
            name: name.to_string(),
            msg,
        };

        let stdin = match invocation.stdin {
            Some(_) => Stdio::piped(),
            None => Stdio::null(),
        };
        let started = Instant::now();
        let mut child = Command::new(&self.binary)
            .args(exec_args(name, invocation))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(e.to_string()))?;

        if let (Some(input), Some(mut pipe)) = (invocation.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(err) = pipe.write_all(input.as_bytes()).await {
                    tracing::debug!("Stdin closed early: {}", err);
                }
            });
        }

        // Drained separately so whatever was written before a kill survives it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline =
            Duration::from_millis(invocation.timeout_ms).saturating_add(self.deadline_grace);
        let waited = tokio::time::timeout(deadline, child.wait()).await;
        let (exit_code, deadline_exceeded) = match waited {
            Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
            Ok(Err(err)) => return Err(failed(err.to_string())),
            Err(_) => {
                tracing::warn!("Invocation in {} exceeded {:?}, killing it", name, deadline);
                if let Err(err) = child.kill().await {
                    tracing::warn!("Failed to kill invocation in {}: {}", name, err);
                }
                (TIMEOUT_EXIT_CODE, true)
            }
        };

        Ok(RawOutput {
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
            exit_code,
            elapsed_ms: started.elapsed().as_millis() as u64,
            deadline_exceeded,
        })
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let Some(mut pipe) = pipe else {
            return buf;
        };
        if let Err(err) = pipe.read_to_end(&mut buf).await {
            tracing::debug!("Pipe closed with error after {} bytes: {}", buf.len(), err);
        }
        buf
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{BatchOutput, parse_batch_output};

    #[test]
    fn test_run_args_apply_limits() {
        let args = run_args("judge_pool_gcc_13_0_1", "gcc:13", &SlotLimits::with_memory(512));

        assert_eq!(&args[..4], ["run", "-d", "--name", "judge_pool_gcc_13_0_1"]);
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"--memory-swap=512m".to_string()));
        assert!(args.contains(&"--cpus=1".to_string()));
        assert!(args.contains(&"--pids-limit=256".to_string()));
        assert!(args.contains(&"nofile=256:256".to_string()));
        assert!(args.contains(&"fsize=67108864:67108864".to_string()));
        assert!(args.contains(&"/tmp:rw,exec,nodev,nosuid,size=64m".to_string()));
        assert_eq!(&args[args.len() - 3..], ["gcc:13", "sleep", "infinity"]);
    }

    #[test]
    fn test_exec_args_privileged_with_stdin() {
        let args = exec_args(
            "slot",
            &Invocation {
                command: "cat".to_string(),
                privileged: true,
                timeout_ms: 1500,
                stdin: Some("hi".to_string()),
            },
        );

        assert_eq!(
            args,
            ["exec", "-i", "-u", "root", "slot", "timeout", "-s", "KILL", "2", "sh", "-c", "cat"]
        );
    }

    #[test]
    fn test_exec_args_plain() {
        let args = exec_args(
            "slot",
            &Invocation {
                command: "sh /w/_runner.sh".to_string(),
                privileged: false,
                timeout_ms: 40_000,
                stdin: None,
            },
        );

        assert_eq!(
            args,
            ["exec", "slot", "timeout", "-s", "KILL", "40", "sh", "-c", "sh /w/_runner.sh"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_fails_creation() {
        let backend = DockerBackend::new("/nonexistent/docker");
        let result = backend
            .create_slot("slot", "gcc:13", &SlotLimits::with_memory(256))
            .await;

        assert!(matches!(result, Err(BackendError::CreateFailed { name, .. }) if name == "slot"));
        assert!(!backend.is_alive("slot").await);
    }

    /// Stands in for the Docker CLI: ignores its arguments and runs `body`.
    fn fake_cli(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn invocation(stdin: Option<&str>) -> Invocation {
        Invocation {
            command: "sh /w/_runner.sh".to_string(),
            privileged: true,
            timeout_ms: 0,
            stdin: stdin.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_exec_collects_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "printf out\nprintf err >&2\nexit 3");
        let backend = DockerBackend::new(cli).with_deadline_grace(Duration::from_secs(10));

        let raw = backend.exec("slot", &invocation(None)).await.unwrap();

        assert_eq!(raw.stdout, b"out");
        assert_eq!(raw.stderr, b"err");
        assert_eq!(raw.exit_code, 3);
        assert!(!raw.deadline_exceeded);
    }

    #[tokio::test]
    async fn test_exec_feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "exec cat");
        let backend = DockerBackend::new(cli).with_deadline_grace(Duration::from_secs(10));

        let raw = backend
            .exec("slot", &invocation(Some("3 4\n")))
            .await
            .unwrap();

        assert_eq!(raw.stdout, b"3 4\n");
        assert_eq!(raw.exit_code, 0);
    }

    #[tokio::test]
    async fn test_exec_deadline_keeps_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            dir.path(),
            "printf '@case 0 0 3 0 1 0\\n1\\n'\nprintf 'slow' >&2\nexec sleep 30",
        );
        let backend = DockerBackend::new(cli).with_deadline_grace(Duration::from_millis(300));

        let raw = backend.exec("slot", &invocation(None)).await.unwrap();

        assert!(raw.deadline_exceeded);
        assert_eq!(raw.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(raw.stderr, b"slow");
        assert!(raw.elapsed_ms < 10_000);

        let BatchOutput::Cases(records) = parse_batch_output(&raw.stdout, 2) else {
            panic!("Expected case records");
        };
        assert_eq!(records[0].as_ref().unwrap().stdout, "1");
        assert!(records[1].is_none());
    }
}
