//! Supervisor: owns a fixed set of worker processes and replaces any that exit.
//!
//! Workers are this same binary re-executed with the `worker` subcommand.
//! There is no health checking beyond exit notification: a hung but alive
//! worker is never restarted.

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// How a worker process is started.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `<current executable> worker`
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("Cannot locate the running executable")?;
        Ok(Self::new(program, ["worker"]))
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Restart pacing. A worker that dies before `min_uptime` is considered to be
/// crash-looping; each further fast exit doubles its restart delay, up to
/// `max_delay`. A worker that ran longer restarts immediately.
#[derive(Debug, Clone, Copy)]
pub struct RestartBackoff {
    pub min_uptime: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            min_uptime: Duration::from_secs(5),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RestartBackoff {
    /// Delay before the next start after `fast_exits` consecutive fast exits.
    pub fn delay(&self, fast_exits: u32) -> Duration {
        if fast_exits == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(fast_exits - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorReport {
    pub workers: usize,
    pub restarts: u64,
}

#[derive(Debug)]
struct WorkerExit {
    slot: usize,
    pid: Option<u32>,
    status: std::io::Result<ExitStatus>,
    uptime: Duration,
}

#[derive(Debug)]
pub struct Supervisor {
    command: Arc<WorkerCommand>,
    workers: usize,
    backoff: RestartBackoff,
}

impl Supervisor {
    pub fn new(command: WorkerCommand, workers: usize) -> Self {
        Self {
            command: Arc::new(command),
            workers: workers.max(1),
            backoff: RestartBackoff::default(),
        }
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, backoff: RestartBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Starts every worker, keeps the set full until `shutdown` resolves,
    /// then kills the remaining workers.
    pub async fn run<F>(self, shutdown: F) -> Result<SupervisorReport>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Supervisor {} is running, starting {} workers",
            std::process::id(),
            self.workers
        );

        let mut running: JoinSet<WorkerExit> = JoinSet::new();
        let mut fast_exits = vec![0u32; self.workers];
        let mut restarts = 0u64;

        for slot in 0..self.workers {
            running.spawn(run_worker(Arc::clone(&self.command), slot, Duration::ZERO));
        }

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = running.join_next() => {
                    let exit = joined.context("Worker task panicked")?;
                    log_exit(&exit);

                    let slot = exit.slot;
                    if exit.uptime < self.backoff.min_uptime {
                        fast_exits[slot] = fast_exits[slot].saturating_add(1);
                    } else {
                        fast_exits[slot] = 0;
                    }
                    let delay = self.backoff.delay(fast_exits[slot]);
                    if !delay.is_zero() {
                        warn!("Worker slot {slot} is exiting quickly; restarting in {delay:?}");
                    }

                    restarts += 1;
                    running.spawn(run_worker(Arc::clone(&self.command), slot, delay));
                }
            }
        }

        info!("Supervisor stopping {} workers", running.len());
        // Aborting the tasks drops each `Child`, which kills the process.
        running.shutdown().await;

        Ok(SupervisorReport {
            workers: self.workers,
            restarts,
        })
    }
}

async fn run_worker(command: Arc<WorkerCommand>, slot: usize, delay: Duration) -> WorkerExit {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let started = Instant::now();
    let (pid, status) = match command.spawn() {
        Ok(mut child) => {
            let pid = child.id();
            info!("Worker {} started in slot {slot}", pid.unwrap_or_default());
            (pid, child.wait().await)
        }
        Err(e) => (None, Err(e)),
    };

    WorkerExit {
        slot,
        pid,
        status,
        uptime: started.elapsed(),
    }
}

fn log_exit(exit: &WorkerExit) {
    match (&exit.status, exit.pid) {
        (Ok(status), Some(pid)) => warn!(
            "Worker {pid} died ({status}) after {:?}; starting a replacement",
            exit.uptime
        ),
        (Ok(status), None) => warn!("Worker died ({status}); starting a replacement"),
        (Err(e), _) => error!("Worker in slot {} could not run: {e}", exit.slot),
    }
}
