//! Multi-process worker supervision
//!
//! The supervisor re-executes the current binary once per worker. Workers
//! share the listen ports through `SO_REUSEPORT` and keep no state in common;
//! a worker that dies is replaced by a fresh one.

use crate::listener::wait_for_shutdown;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Marks a process as a worker and carries its index
pub const WORKER_ID_ENV: &str = "DOCKGATE_WORKER_ID";

/// Time a worker gets to exit after SIGTERM before it is killed
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Index of this worker, or `None` in the supervising process
pub fn worker_id() -> Option<usize> {
    std::env::var(WORKER_ID_ENV).ok()?.parse().ok()
}

pub struct Supervisor {
    program: PathBuf,
    args: Vec<OsString>,
    workers: usize,
    restart_delay: Duration,
}

impl Supervisor {
    /// Supervise `workers` copies of the running binary with its arguments
    pub fn new(workers: usize) -> anyhow::Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| anyhow::anyhow!("Cannot locate the running executable: {}", e))?;
        let args = std::env::args_os().skip(1).collect();
        Ok(Self::with_command(program, args, workers))
    }

    pub fn with_command(program: PathBuf, args: Vec<OsString>, workers: usize) -> Self {
        Self {
            program,
            args,
            workers,
            restart_delay: Duration::from_secs(1),
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Run all workers until shutdown or until every worker exited cleanly
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) {
        info!(workers = self.workers, "Starting workers");

        let mut tasks = JoinSet::new();
        for id in 0..self.workers {
            let program = self.program.clone();
            let args = self.args.clone();
            let delay = self.restart_delay;
            let shutdown_rx = shutdown_rx.clone();
            tasks.spawn(async move { supervise(id, program, args, delay, shutdown_rx).await });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker supervision task failed");
            }
        }
        info!("All workers stopped");
    }
}

async fn supervise(
    id: usize,
    program: PathBuf,
    args: Vec<OsString>,
    restart_delay: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let spawned = Command::new(&program)
            .args(&args)
            .env(WORKER_ID_ENV, id.to_string())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut child) => {
                info!(worker = id, pid = child.id().unwrap_or(0), "Worker started");
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) if status.success() => {
                            info!(worker = id, "Worker exited");
                            return;
                        }
                        Ok(status) => warn!(worker = id, ?status, "Worker died, restarting"),
                        Err(e) => warn!(worker = id, error = %e, "Failed to wait for worker, restarting"),
                    },
                    _ = wait_for_shutdown(&mut shutdown_rx) => {
                        stop_worker(id, &mut child).await;
                        return;
                    }
                }
            }
            Err(e) => error!(worker = id, program = %program.display(), error = %e, "Failed to start worker"),
        }

        tokio::select! {
            _ = tokio::time::sleep(restart_delay) => {}
            _ = wait_for_shutdown(&mut shutdown_rx) => return,
        }
    }
}

async fn stop_worker(id: usize, child: &mut Child) {
    if let Some(pid) = child.id() {
        info!(worker = id, pid, "Sending SIGTERM to worker");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, child.wait()).await {
        Ok(Ok(status)) => info!(worker = id, ?status, "Worker exited gracefully"),
        Ok(Err(e)) => warn!(worker = id, error = %e, "Error waiting for worker to exit"),
        Err(_) => {
            warn!(
                worker = id,
                grace_period_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
                "Grace period exceeded, killing worker"
            );
            let _ = child.kill().await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> (PathBuf, Vec<OsString>) {
        (PathBuf::from("/bin/sh"), vec!["-c".into(), script.into()])
    }

    fn count_lines(path: &std::path::Path) -> usize {
        std::fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_failed_worker_is_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("starts");
        let (program, args) = shell(&format!("echo \"${}\" >> {}; exit 1", WORKER_ID_ENV, log.display()));

        let (tx, rx) = watch::channel(false);
        let supervisor = Supervisor::with_command(program, args, 1).with_restart_delay(Duration::from_millis(50));
        let handle = tokio::spawn(supervisor.run(rx));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        assert!(count_lines(&log) >= 2);
        assert!(std::fs::read_to_string(&log).unwrap().lines().all(|l| l == "0"));
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("starts");
        let (program, args) = shell(&format!("echo started >> {}; exit 0", log.display()));

        let (_tx, rx) = watch::channel(false);
        let supervisor = Supervisor::with_command(program, args, 2).with_restart_delay(Duration::from_millis(50));
        tokio::time::timeout(Duration::from_secs(5), supervisor.run(rx)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count_lines(&log), 2);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_workers() {
        let (program, args) = shell("sleep 30");

        let (tx, rx) = watch::channel(false);
        let supervisor = Supervisor::with_command(program, args, 2);
        let handle = tokio::spawn(supervisor.run(rx));

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
