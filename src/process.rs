use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// How long a worker gets to exit after SIGTERM before SIGKILL.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start nfqws: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("process cleanup errors: {0}")]
    Cleanup(String),
}

/// Supervises the fleet of nfqws worker processes, one per queue.
///
/// All operations serialize on a single internal mutex.
pub struct ProcessManager {
    binary_path: PathBuf,
    children: Mutex<Vec<Child>>,
}

impl ProcessManager {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            children: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one worker bound to `queue_num`. `--daemon --qnum=N` are
    /// prepended to the strategy-supplied arguments.
    pub async fn start(&self, queue_num: u16, args: &[String]) -> Result<(), ProcessError> {
        let mut children = self.children.lock().await;

        tracing::info!(
            queue = queue_num,
            binary = %self.binary_path.display(),
            args = %args.join(" "),
            "starting nfqws process"
        );

        let child = Command::new(&self.binary_path)
            .arg("--daemon")
            .arg(format!("--qnum={queue_num}"))
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(ProcessError::Spawn)?;

        children.push(child);
        Ok(())
    }

    /// Stop every tracked worker: SIGTERM, a bounded wait, then SIGKILL.
    /// Every child is attempted; failures are accumulated. The tracked
    /// list is cleared regardless.
    pub async fn stop_all(&self) -> Result<(), ProcessError> {
        let mut children = self.children.lock().await;
        let mut errors = Vec::new();

        for mut child in children.drain(..) {
            let Some(pid) = child.id() else {
                // Already reaped.
                continue;
            };

            tracing::info!(pid, "stopping nfqws process");

            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                tracing::warn!(pid, error = %err, "failed to signal process");
                errors.push(format!("process {pid} signal failed: {err}"));
            }

            match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(pid, %status, "nfqws process stopped");
                }
                Ok(Err(err)) => {
                    errors.push(format!("process {pid} wait failed: {err}"));
                }
                Err(_) => {
                    tracing::warn!(pid, "process did not stop in time, killing");
                    if let Err(err) = child.kill().await {
                        tracing::error!(pid, error = %err, "failed to kill process");
                        errors.push(format!("process {pid} kill failed: {err}"));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProcessError::Cleanup(errors.join("; ")))
        }
    }

    /// Number of currently tracked workers.
    pub async fn count(&self) -> usize {
        self.children.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_failure_is_reported_and_leaves_others_running() {
        let manager = ProcessManager::new("/bin/sleep");

        manager.start(0, &["30".to_string()]).await.unwrap();
        assert_eq!(manager.count().await, 1);

        let missing = ProcessManager::new("/nonexistent/nfqws");
        assert!(matches!(
            missing.start(1, &[]).await,
            Err(ProcessError::Spawn(_))
        ));
        assert_eq!(missing.count().await, 0);

        manager.stop_all().await.unwrap();
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn stop_all_is_a_noop_without_children() {
        let manager = ProcessManager::new("/bin/true");
        manager.stop_all().await.unwrap();
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn stop_all_terminates_and_clears() {
        let manager = ProcessManager::new("/bin/sleep");
        manager.start(0, &["30".to_string()]).await.unwrap();
        manager.start(1, &["30".to_string()]).await.unwrap();
        assert_eq!(manager.count().await, 2);

        manager.stop_all().await.unwrap();
        assert_eq!(manager.count().await, 0);
    }
}
