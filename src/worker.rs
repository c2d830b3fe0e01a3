//! Training worker.
//!
//! Runs as its own process (`combine worker`). It claims one job at a time
//! from the [`TrainQueue`], runs the configured training command as a child
//! process and records the outcome. A failing job never stops the worker.
//!
//! Training command contract:
//!
//! ```text
//! <train.command> <train.args...> --user <user> --replay-dir <replay_dir>/<user>
//!                 --model-dir <models.dir> [--age-days <n>]
//! ```
//!
//! Exit status 0 means a model was written to
//! `<models.dir>/<user>/model.json`; anything else is a failure.

use anyhow::Result;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::queue::{Job, JobStatus, QueueError, TrainQueue};

/// Lines of child stderr kept in the failure log.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainOutcome {
    Success,
    Failed(String),
}

impl TrainOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            TrainOutcome::Success => JobStatus::Success,
            TrainOutcome::Failed(_) => JobStatus::Failed,
        }
    }
}

/// Builds and runs the training command for one job.
#[derive(Debug, Clone)]
pub struct TrainRunner {
    program: String,
    args: Vec<String>,
    replay_dir: PathBuf,
    model_dir: PathBuf,
}

impl TrainRunner {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        replay_dir: PathBuf,
        model_dir: PathBuf,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            replay_dir,
            model_dir,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.train.command.clone(),
            config.train.args.clone(),
            config.train.replay_dir.clone(),
            config.models.dir.clone(),
        )
    }

    fn command(&self, job: &Job) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--user")
            .arg(&job.user)
            .arg("--replay-dir")
            .arg(self.replay_dir.join(&job.user))
            .arg("--model-dir")
            .arg(&self.model_dir);
        if let Some(age_days) = job.age_days {
            cmd.arg("--age-days").arg(age_days.to_string());
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run `job` to completion, calling `on_tick` every `tick` while the
    /// child is alive.
    pub async fn run<F, Fut>(&self, job: &Job, tick: Duration, mut on_tick: F) -> TrainOutcome
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let child = match self.command(job).spawn() {
            Ok(child) => child,
            Err(e) => {
                return TrainOutcome::Failed(format!("failed to start {}: {}", self.program, e))
            }
        };

        let output = child.wait_with_output();
        tokio::pin!(output);
        let mut ticker = tokio::time::interval(tick);
        // first tick completes immediately
        ticker.tick().await;

        let output = loop {
            tokio::select! {
                result = &mut output => break result,
                _ = ticker.tick() => on_tick().await,
            }
        };

        match output {
            Ok(output) if output.status.success() => TrainOutcome::Success,
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let lines: Vec<&str> = stderr.lines().collect();
                let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
                TrainOutcome::Failed(format!("{}: {}", output.status, tail.trim()))
            }
            Err(e) => TrainOutcome::Failed(format!("failed to wait for {}: {}", self.program, e)),
        }
    }
}

pub struct Worker {
    queue: TrainQueue,
    runner: TrainRunner,
    poll_interval: Duration,
    lease: Duration,
}

impl Worker {
    pub fn new(
        queue: TrainQueue,
        runner: TrainRunner,
        poll_interval: Duration,
        lease: Duration,
    ) -> Self {
        Self {
            queue,
            runner,
            poll_interval,
            lease,
        }
    }

    pub fn from_config(queue: TrainQueue, config: &Config) -> Self {
        Self::new(
            queue,
            TrainRunner::from_config(config),
            config.train.poll_interval(),
            config.train.lease(),
        )
    }

    /// Heartbeats are written several times per lease so one slow write
    /// does not expire a live job.
    fn heartbeat_every(&self) -> Duration {
        (self.lease / 4).max(Duration::from_millis(250))
    }

    /// Expire stale jobs, then claim and run at most one job.
    ///
    /// Returns `None` when there was nothing to run.
    pub async fn run_once(&self) -> Result<Option<(Job, JobStatus)>> {
        for job in self.queue.fail_stale(self.lease).await? {
            warn!(job = job.id, user = %job.user, "running job lost its worker; marked failed");
        }

        let job = match self.queue.dequeue().await {
            Ok(job) => job,
            Err(QueueError::Empty) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let span = info_span!("train", job = job.id, user = %job.user);
        let status = self.run_job(&job).instrument(span).await?;
        Ok(Some((job, status)))
    }

    async fn run_job(&self, job: &Job) -> Result<JobStatus> {
        info!(age_days = ?job.age_days, "training started");

        let queue = &self.queue;
        let id = job.id;
        let outcome = self
            .runner
            .run(job, self.heartbeat_every(), || async move {
                if let Err(e) = queue.heartbeat(id).await {
                    warn!(error = %e, "heartbeat failed");
                }
            })
            .await;

        match &outcome {
            TrainOutcome::Success => info!("training succeeded"),
            TrainOutcome::Failed(reason) => warn!(%reason, "training failed"),
        }

        let status = outcome.status();
        self.queue.update_status(job.id, status).await?;
        Ok(status)
    }

    /// Poll forever. Queue errors are logged and retried after the poll
    /// interval.
    pub async fn run_forever(&self) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "training worker started");
        loop {
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => debug!("queue empty"),
                Err(e) => error!(error = %format!("{:#}", e), "worker iteration failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
