//! [StreamProcessor] runs a [Topology]: one [Runner] task per computation and input partition.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorSettings;
use crate::error::{Error, Result};
use crate::log::{LogManager, deadline_after};
use crate::metrics::ProcessorHealth;
use crate::runner::{Runner, RunnerState};
use crate::topology::Topology;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct RunnerHandle {
    computation: String,
    partition: u32,
    state: watch::Receiver<RunnerState>,
    task: Option<JoinHandle<Result<()>>>,
}

pub struct StreamProcessor<M> {
    manager: M,
    topology: Topology,
    settings: ProcessorSettings,
    cancel: CancellationToken,
    health: ProcessorHealth,
    runners: Vec<RunnerHandle>,
}

impl<M> StreamProcessor<M>
where
    M: LogManager + Clone + Sync + 'static,
{
    pub fn new(manager: M, topology: Topology, settings: ProcessorSettings) -> Self {
        Self {
            manager,
            topology,
            settings,
            cancel: CancellationToken::new(),
            health: ProcessorHealth::default(),
            runners: Vec::new(),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Readiness shared with the metrics server.
    pub fn health(&self) -> ProcessorHealth {
        self.health.clone()
    }

    /// Creates every stream of the topology that does not exist yet.
    pub async fn init(&self) -> Result<()> {
        for stream in self.topology.streams() {
            let partitions = self.settings.partitions(stream);
            if self
                .manager
                .create_if_not_exists(stream, partitions)
                .await?
            {
                info!(stream, partitions, "Created stream");
                continue;
            }
            let existing = self.manager.partitions(stream).await?;
            if existing != partitions {
                warn!(
                    stream,
                    partitions = existing,
                    configured = partitions,
                    "Stream exists with a different partition count, keeping it"
                );
            }
        }
        Ok(())
    }

    /// Spawns the runners. A computation gets one runner per partition of its widest input, and
    /// a single one when it has no input. The streams must exist, see [StreamProcessor::init].
    pub async fn start(&mut self) -> Result<()> {
        if !self.runners.is_empty() {
            return Err(Error::Config("processor is already started".to_string()));
        }

        for node in self.topology.computations() {
            let mut partitions = 1;
            for stream in node.input_streams() {
                partitions = partitions.max(self.manager.partitions(stream).await?);
            }

            for partition in 0..partitions {
                let runner = Runner::new(
                    self.manager.clone(),
                    node,
                    partition,
                    &self.settings,
                    self.cancel.clone(),
                    self.health.clone(),
                )
                .await?;
                let state = runner.state();
                let task = tokio::spawn(runner.run());
                self.runners.push(RunnerHandle {
                    computation: node.name().to_string(),
                    partition,
                    state,
                    task: Some(task),
                });
            }
            info!(computation = %node.name(), partitions, "Started computation");
        }
        Ok(())
    }

    /// `(computation, partition, state)` of every runner.
    pub fn states(&self) -> Vec<(String, u32, RunnerState)> {
        self.runners
            .iter()
            .map(|r| (r.computation.clone(), r.partition, *r.state.borrow()))
            .collect()
    }

    pub fn is_terminated(&self) -> bool {
        self.runners
            .iter()
            .all(|r| r.state.borrow().is_terminal())
    }

    pub fn has_halted(&self) -> bool {
        self.runners
            .iter()
            .any(|r| *r.state.borrow() == RunnerState::FailedHalted)
    }

    /// Cancels the runners and waits up to `timeout` for them to checkpoint and stop. Runners
    /// still busy after that are aborted. Returns `true` when every runner stopped by itself.
    pub async fn stop(&mut self, timeout: Duration) -> bool {
        info!(?timeout, "Stopping processor");
        self.cancel.cancel();
        let deadline = deadline_after(timeout);
        let mut clean = true;

        for runner in &mut self.runners {
            let Some(mut task) = runner.task.take() else {
                continue;
            };
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    debug!(computation = %runner.computation, partition = runner.partition, %e, "Runner ended with an error");
                }
                Ok(Err(e)) => {
                    error!(computation = %runner.computation, partition = runner.partition, ?e, "Runner task failed");
                    clean = false;
                }
                Err(_) => {
                    warn!(computation = %runner.computation, partition = runner.partition, "Runner did not stop in time, aborting");
                    task.abort();
                    clean = false;
                }
            }
        }
        clean
    }

    /// Waits until every computation has consumed all of its inputs, then stops. Gives up
    /// waiting after `timeout` or as soon as a runner halts. Returns `true` when the inputs were
    /// drained and every runner stopped by itself.
    pub async fn drain_and_stop(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = deadline_after(timeout);
        let mut previous: Option<(u64, u64)> = None;
        let mut drained = false;

        while Instant::now() < deadline && !self.has_halted() && !self.is_terminated() {
            let backlog = self.backlog().await?;
            // outputs appended between two lag reads are caught by the second sweep
            if backlog.0 == 0 && previous == Some(backlog) {
                drained = true;
                break;
            }
            previous = Some(backlog);
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        if !drained {
            warn!("Stopping before the inputs were drained");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let stopped = self.stop(remaining).await;
        Ok(drained && stopped)
    }

    /// Total lag of the computations on their inputs, and the sum of the input end offsets.
    async fn backlog(&self) -> Result<(u64, u64)> {
        let mut lag = 0;
        let mut ends = 0;
        for node in self.topology.computations() {
            for stream in node.input_streams() {
                for partition in self.manager.lag_per_partition(stream, node.name()).await? {
                    lag += partition.lag;
                    ends += partition.upper;
                }
            }
        }
        Ok((lag, ends))
    }

    /// Waits for every runner to end by itself and returns the first error, a halt typically.
    pub async fn wait(&mut self) -> Result<()> {
        let mut first_error = None;
        for runner in &mut self.runners {
            let Some(task) = runner.task.take() else {
                continue;
            };
            let result = task.await.map_err(|e| {
                Error::Processing(format!(
                    "runner {}-{} failed: {e}",
                    runner.computation, runner.partition
                ))
            });
            if let Err(e) | Ok(Err(e)) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
