//! Drives one computation instance over one partition of its inputs.
//!
//! ```text
//!   Init --> Running <--> Retrying
//!               |            |
//!               v            v
//!           Stopping     FailedHalted
//!               |
//!               v
//!            Stopped
//! ```
//!
//! Records are read in batches, handed to the computation one by one and the outputs it produced
//! are appended before the input offsets are committed. A record that keeps failing is either
//! skipped or halts the partition, as the [ComputationPolicy] says.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use backoff::retry::Retry;
use backoff::strategy::fixed;
use futures::future::select_all;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::computation::{Computation, Failure, FailureSource};
use crate::config::ProcessorSettings;
use crate::context::{ComputationContext, Produced};
use crate::error::{Error, ErrorKind, Result};
use crate::log::{
    LogAppender, LogManager, LogOffset, LogRecord, Tailer, deadline_after,
};
use crate::metrics::{ProcessorHealth, runner_labels, runner_metrics};
use crate::policy::ComputationPolicy;
use crate::topology::ComputationNode;

const COMMIT_RETRY_INTERVAL_MS: u64 = 100;
const COMMIT_RETRY_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Init,
    Running,
    Retrying,
    Stopping,
    Stopped,
    FailedHalted,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunnerState::Stopped | RunnerState::FailedHalted)
    }
}

/// What became of a record or timer once handed to the computation.
enum Outcome {
    Done,
    Skipped(Failure),
    Halted(Error),
    /// the runner was cancelled while backing off
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Input<M> {
    logical: String,
    tailer: Tailer<M>,
    /// next offset to commit once the outputs are appended
    done: u64,
    committed: u64,
}

pub struct Runner<M> {
    name: String,
    partition: u32,
    computation: Box<dyn Computation>,
    context: ComputationContext,
    policy: ComputationPolicy,
    inputs: Vec<Input<M>>,
    outputs: BTreeMap<String, LogAppender<M>>,
    poll_timeout: Duration,
    /// failures that may still be skipped
    skip_budget: u32,
    next_input: usize,
    state: watch::Sender<RunnerState>,
    cancel: CancellationToken,
    health: ProcessorHealth,
    labels: Vec<(String, String)>,
}

impl<M> Runner<M>
where
    M: LogManager + Clone + Sync + 'static,
{
    /// Builds the runner of `node` for `partition`. The consumer group is the computation name
    /// and every input starts from the group's committed offset. Inputs with fewer partitions
    /// than `partition` are not read.
    pub async fn new(
        manager: M,
        node: &ComputationNode,
        partition: u32,
        settings: &ProcessorSettings,
        cancel: CancellationToken,
        health: ProcessorHealth,
    ) -> Result<Self> {
        let name = node.name().to_string();

        let mut inputs = Vec::with_capacity(node.inputs().len());
        for (logical, stream) in node.inputs() {
            if partition >= manager.partitions(stream).await? {
                debug!(computation = %name, stream, partition, "Input has no such partition");
                continue;
            }
            let tailer = Tailer::new(manager.clone(), stream, partition, &name).await?;
            let committed = tailer.position();
            inputs.push(Input {
                logical: logical.clone(),
                tailer,
                done: committed,
                committed,
            });
        }

        let mut outputs = BTreeMap::new();
        let mut output_partitions = BTreeMap::new();
        for (logical, stream) in node.outputs() {
            let appender =
                LogAppender::open(manager.clone(), stream, settings.partitioning(stream)).await?;
            output_partitions.insert(logical.clone(), appender.partitions());
            outputs.insert(logical.clone(), appender);
        }

        let policy = settings.policy(&name).clone();
        let (state, _) = watch::channel(RunnerState::Init);
        Ok(Self {
            computation: (node.factory())(),
            context: ComputationContext::new(&name, partition, output_partitions),
            skip_budget: policy.skip_first_failures(),
            policy,
            inputs,
            outputs,
            poll_timeout: settings.poll_timeout(),
            next_input: 0,
            state,
            cancel,
            health,
            labels: runner_labels(&name, partition),
            name,
            partition,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    /// Runs until cancelled, asked to terminate, a poison pill is read or the partition halts.
    /// A halt resolves to [Error::FatalHalt].
    pub async fn run(mut self) -> Result<()> {
        info!(computation = %self.name, partition = self.partition, "Starting runner");
        let result = self.run_until_stopped().await;
        self.computation.destroy();
        match result {
            Ok(()) => {
                self.set_state(RunnerState::Stopped);
                info!(computation = %self.name, partition = self.partition, "Runner stopped");
                Ok(())
            }
            Err(e @ Error::FatalHalt { .. }) => Err(e),
            Err(e) => {
                let offset = self.committed_offset();
                Err(self.halt(offset, e))
            }
        }
    }

    async fn run_until_stopped(&mut self) -> Result<()> {
        self.computation.init(&mut self.context)?;

        // committing the start positions makes the group visible to the lag tooling
        for input in &self.inputs {
            commit_with_retry(&input.tailer, input.committed, &self.cancel).await?;
        }
        self.set_state(RunnerState::Running);

        let cancel = self.cancel.clone();
        loop {
            if self.fire_timers().await? == Flow::Stop || cancel.is_cancelled() {
                break;
            }
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.read_batch() => batch?,
            };
            if batch.is_empty() {
                continue;
            }
            if self.process_batch(batch).await? == Flow::Stop {
                break;
            }
        }

        self.set_state(RunnerState::Stopping);
        self.checkpoint().await
    }

    /// Reads until `batch_capacity` records are buffered, `batch_threshold` elapsed since the
    /// first one or a timer is due. Returns an empty batch when nothing arrived within the poll
    /// timeout, or before the next timer is due.
    async fn read_batch(&mut self) -> Result<Vec<(usize, LogRecord)>> {
        let capacity = self.policy.batch_capacity();
        let mut batch = Vec::new();
        let mut deadline: Option<Instant> = None;
        let mut delays = self.policy.retry_policy().backoff();
        let mut failures = 0;

        loop {
            let now = Instant::now();
            let until = deadline.unwrap_or_else(|| deadline_after(self.poll_timeout));
            let until = self
                .context
                .next_timer()
                .map_or(until, |due| until.min(due));
            let wait = until.saturating_duration_since(now);

            let polled = match self.poll_inputs(capacity - batch.len(), wait).await {
                Ok(polled) => polled,
                Err(e) => {
                    failures += 1;
                    let delay = if self.policy.retry_policy().is_retryable(&e) {
                        delays.next()
                    } else {
                        None
                    };
                    let Some(delay) = delay else {
                        error!(computation = %self.name, partition = self.partition, %e, failures, "Polling failed");
                        return Err(e);
                    };
                    warn!(computation = %self.name, partition = self.partition, %e, failures, ?delay, "Polling failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            if polled.is_empty() && batch.is_empty() {
                return Ok(batch);
            }
            if deadline.is_none() {
                deadline = Some(deadline_after(self.policy.batch_threshold()));
            }
            batch.extend(polled);

            let now = Instant::now();
            let expired = deadline.is_some_and(|deadline| now >= deadline);
            let timer_due = self.context.next_timer().is_some_and(|due| now >= due);
            if batch.len() >= capacity || expired || timer_due {
                return Ok(batch);
            }
        }
    }

    /// Takes whatever is available from the inputs, starting with the one after the input read
    /// last so none is starved. Waits up to `wait` on all of them when none has records.
    async fn poll_inputs(&mut self, max: usize, wait: Duration) -> Result<Vec<(usize, LogRecord)>> {
        let count = self.inputs.len();
        if count == 0 {
            tokio::time::sleep(wait).await;
            return Ok(Vec::new());
        }

        for i in 0..count {
            let index = (self.next_input + i) % count;
            let Some(input) = self.inputs.get_mut(index) else {
                continue;
            };
            let records = input.tailer.read(max, Duration::ZERO).await?;
            if !records.is_empty() {
                self.next_input = (index + 1) % count;
                return Ok(records.into_iter().map(|r| (index, r)).collect());
            }
        }
        if wait.is_zero() {
            return Ok(Vec::new());
        }

        let reads = self
            .inputs
            .iter_mut()
            .map(|input| Box::pin(input.tailer.read(max, wait)));
        let (records, index, _) = select_all(reads).await;
        let records = records?;
        if !records.is_empty() {
            self.next_input = (index + 1) % count;
        }
        Ok(records.into_iter().map(|r| (index, r)).collect())
    }

    async fn process_batch(&mut self, batch: Vec<(usize, LogRecord)>) -> Result<Flow> {
        let start = Instant::now();
        debug!(computation = %self.name, partition = self.partition, size = batch.len(), "Processing batch");

        for (index, log_record) in batch {
            // timers elapsed while the batch was filling or being processed go first
            if self.fire_timers().await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
            let Some(input) = self.inputs.get(index) else {
                continue;
            };
            let logical = input.logical.clone();
            let stream = input.tailer.stream().to_string();
            let LogRecord {
                partition,
                offset,
                record,
            } = log_record;

            if record.is_poison_pill() {
                info!(computation = %self.name, %stream, partition, offset, "Poison pill read, stopping");
                self.mark_done(index, offset);
                return Ok(Flow::Stop);
            }

            self.context
                .set_last_offset(Some(LogOffset { partition, offset }));
            let source = FailureSource::Record {
                input: stream.clone(),
                partition,
                offset,
                key: record.key_str().into_owned(),
            };
            let outcome = self
                .process_with_retry(source, |computation, context| {
                    computation.process_record(context, &logical, &record)
                })
                .await;

            match outcome {
                Outcome::Done => {
                    self.mark_done(index, offset);
                    runner_metrics()
                        .records_processed
                        .get_or_create(&self.labels)
                        .inc();
                }
                Outcome::Skipped(failure) => {
                    self.mark_done(index, offset);
                    runner_metrics()
                        .records_skipped
                        .get_or_create(&self.labels)
                        .inc();
                    warn!(
                        computation = %self.name,
                        %stream,
                        partition,
                        offset,
                        error = %failure.error,
                        remaining = self.skip_budget,
                        "Skipping record"
                    );
                }
                Outcome::Halted(error) => {
                    self.checkpoint().await?;
                    return Err(self.halt(offset, error));
                }
                Outcome::Cancelled => return Ok(Flow::Stop),
            }

            if self.context.termination_requested() {
                info!(computation = %self.name, partition = self.partition, "Termination requested");
                return Ok(Flow::Stop);
            }
            if self.context.checkpoint_requested() {
                self.checkpoint().await?;
            }
        }

        self.checkpoint().await?;
        runner_metrics()
            .processing_time
            .get_or_create(&self.labels)
            .observe(start.elapsed().as_micros() as f64);
        Ok(Flow::Continue)
    }

    async fn fire_timers(&mut self) -> Result<Flow> {
        let expired = self.context.take_expired(Instant::now());
        if expired.is_empty() {
            return Ok(Flow::Continue);
        }
        self.context.set_last_offset(None);

        for (key, timestamp) in expired {
            debug!(computation = %self.name, partition = self.partition, %key, "Timer elapsed");
            let source = FailureSource::Timer { key: key.clone() };
            let outcome = self
                .process_with_retry(source, |computation, context| {
                    computation.process_timer(context, &key, timestamp)
                })
                .await;
            match outcome {
                Outcome::Done => {}
                Outcome::Skipped(failure) => {
                    runner_metrics()
                        .records_skipped
                        .get_or_create(&self.labels)
                        .inc();
                    warn!(computation = %self.name, partition = self.partition, %key, error = %failure.error, "Skipping timer");
                }
                Outcome::Halted(error) => {
                    self.checkpoint().await?;
                    let offset = self.committed_offset();
                    return Err(self.halt(offset, error));
                }
                Outcome::Cancelled => return Ok(Flow::Stop),
            }
            if self.context.termination_requested() {
                info!(computation = %self.name, partition = self.partition, "Termination requested");
                return Ok(Flow::Stop);
            }
        }

        self.checkpoint().await?;
        Ok(Flow::Continue)
    }

    /// Invokes `handler` until it succeeds or the retry policy gives up. Outputs of a failed
    /// attempt are dropped before the next one.
    async fn process_with_retry<F>(&mut self, source: FailureSource, mut handler: F) -> Outcome
    where
        F: FnMut(&mut dyn Computation, &mut ComputationContext) -> Result<()>,
    {
        let mark = self.context.accumulator().len();
        let mut delays = self.policy.retry_policy().backoff();
        let mut attempt = 0;

        loop {
            let error = match handler(&mut *self.computation, &mut self.context) {
                Ok(()) => return Outcome::Done,
                Err(e) => e,
            };
            self.context.accumulator_mut().truncate(mark);
            attempt += 1;
            let failure = Failure {
                error,
                attempt,
                source: source.clone(),
            };

            let delay = if self.policy.retry_policy().is_retryable(&failure.error) {
                delays.next()
            } else {
                None
            };
            if let Some(delay) = delay {
                self.set_state(RunnerState::Retrying);
                runner_metrics().retries.get_or_create(&self.labels).inc();
                self.computation.process_retry(&mut self.context, &failure);

                let cancelled = tokio::select! {
                    _ = self.cancel.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };
                if cancelled {
                    info!(computation = %self.name, partition = self.partition, "Cancelled while retrying");
                    return Outcome::Cancelled;
                }
                self.set_state(RunnerState::Running);
                continue;
            }

            runner_metrics().failures.get_or_create(&self.labels).inc();
            self.computation.process_failure(&mut self.context, &failure);

            if self.policy.continue_on_failure() {
                return Outcome::Skipped(failure);
            }
            if self.skip_budget > 0 {
                self.skip_budget -= 1;
                return Outcome::Skipped(failure);
            }
            return Outcome::Halted(failure.error);
        }
    }

    fn mark_done(&mut self, index: usize, offset: u64) {
        if let Some(input) = self.inputs.get_mut(index) {
            input.done = offset + 1;
        }
    }

    /// Appends what the computation produced, then commits the inputs. Nothing is committed when
    /// the outputs could not all be appended.
    async fn checkpoint(&mut self) -> Result<()> {
        self.flush().await?;

        for input in &mut self.inputs {
            if input.done <= input.committed {
                continue;
            }
            commit_with_retry(&input.tailer, input.done, &self.cancel).await?;
            input.committed = input.done;
            runner_metrics().commits.get_or_create(&self.labels).inc();
            debug!(
                computation = %self.name,
                stream = %input.tailer.stream(),
                partition = input.tailer.partition(),
                offset = input.committed,
                "Committed"
            );
        }
        self.context.checkpoint_done();
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let mut pending: VecDeque<Produced> = self.context.accumulator_mut().drain().into();
        let mut delays = self.policy.retry_policy().backoff();
        let mut attempt = 0;

        while let Some(produced) = pending.front() {
            let appender = self.outputs.get_mut(&produced.output).ok_or_else(|| {
                Error::Processing(format!("{} has no output {}", self.name, produced.output))
            })?;
            let appended = match produced.partition {
                Some(partition) => appender.append_to(partition, produced.record.clone()).await,
                None => appender.append(produced.record.clone()).await,
            };

            let error = match appended {
                Ok(_) => {
                    pending.pop_front();
                    runner_metrics()
                        .records_produced
                        .get_or_create(&self.labels)
                        .inc();
                    continue;
                }
                Err(e) => e,
            };
            attempt += 1;
            let failure = Failure {
                error,
                attempt,
                source: FailureSource::Flush,
            };
            let delay = if self.policy.retry_policy().is_retryable(&failure.error) {
                delays.next()
            } else {
                None
            };
            match delay {
                Some(delay) => {
                    runner_metrics().retries.get_or_create(&self.labels).inc();
                    self.computation.process_retry(&mut self.context, &failure);
                    tokio::time::sleep(delay).await;
                }
                None => {
                    runner_metrics().failures.get_or_create(&self.labels).inc();
                    self.computation.process_failure(&mut self.context, &failure);
                    return Err(failure.error);
                }
            }
        }
        Ok(())
    }

    fn committed_offset(&self) -> u64 {
        self.inputs.first().map(|i| i.committed).unwrap_or(0)
    }

    fn halt(&mut self, offset: u64, error: Error) -> Error {
        self.health.mark_halted();
        runner_metrics().halted.get_or_create(&self.labels).set(1);
        self.set_state(RunnerState::FailedHalted);
        error!(
            computation = %self.name,
            partition = self.partition,
            offset,
            %error,
            "Halting partition"
        );
        Error::FatalHalt {
            computation: self.name.clone(),
            partition: self.partition,
            offset,
        }
    }

    fn set_state(&self, state: RunnerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(computation = %self.name, partition = self.partition, ?previous, ?state, "Runner state");
        }
    }
}

/// Commits with a bounded number of retries, giving up early once cancelled.
async fn commit_with_retry<M: LogManager>(
    tailer: &Tailer<M>,
    offset: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let interval =
        fixed::Interval::from_millis(COMMIT_RETRY_INTERVAL_MS).take(COMMIT_RETRY_ATTEMPTS);
    Retry::new(
        interval,
        async || tailer.commit_offset(offset).await,
        |e: &Error, attempt: u32| {
            if cancel.is_cancelled() {
                error!(?e, offset, attempt, "Cancellation received, stopping commit retries");
                return false;
            }
            if e.kind() == ErrorKind::Addressing {
                error!(?e, offset, "Stream or partition is gone, stopping commit retries");
                return false;
            }
            warn!(?e, offset, attempt, "Commit failed, retrying...");
            true
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::computation::{ComputationFactory, ComputationMetadata};
    use crate::policy::RetryPolicy;
    use crate::record::Record;
    use crate::topology::Topology;
    use crate::log::memory::MemLogManager;

    #[derive(Debug, Clone, Default)]
    struct Calls {
        records: Arc<AtomicU32>,
        retries: Arc<AtomicU32>,
        failures: Arc<AtomicU32>,
    }

    impl Calls {
        fn get(counter: &AtomicU32) -> u32 {
            counter.load(Ordering::SeqCst)
        }
    }

    /// Ships every record to `o1`, failing on the keys in `fail_on`.
    struct Shipper {
        metadata: ComputationMetadata,
        fail_on: Vec<&'static str>,
        calls: Calls,
    }

    impl Computation for Shipper {
        fn metadata(&self) -> &ComputationMetadata {
            &self.metadata
        }

        fn process_record(
            &mut self,
            context: &mut ComputationContext,
            _input: &str,
            record: &Record,
        ) -> Result<()> {
            self.calls.records.fetch_add(1, Ordering::SeqCst);
            context.produce("o1", record.clone())?;
            let key = record.key_str();
            if self.fail_on.iter().any(|k| *k == key) {
                return Err(Error::processing(format!("cannot ship {}", record.key_str())));
            }
            Ok(())
        }

        fn process_retry(&mut self, _context: &mut ComputationContext, _failure: &Failure) {
            self.calls.retries.fetch_add(1, Ordering::SeqCst);
        }

        fn process_failure(&mut self, _context: &mut ComputationContext, _failure: &Failure) {
            self.calls.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn shipper(fail_on: Vec<&'static str>, calls: Calls) -> ComputationFactory {
        Arc::new(move || {
            Box::new(Shipper {
                metadata: ComputationMetadata::new("A", 1, 1),
                fail_on: fail_on.clone(),
                calls: calls.clone(),
            }) as Box<dyn Computation>
        })
    }

    fn retrying(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries)
            .with_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
    }

    async fn orders(keys: &[&str]) -> MemLogManager {
        let manager = MemLogManager::new();
        manager.create_if_not_exists("orders", 1).await.unwrap();
        manager.create_if_not_exists("shipped", 1).await.unwrap();
        for key in keys {
            manager
                .append("orders", 0, Record::of_key(key.to_string()))
                .await
                .unwrap();
        }
        manager
    }

    async fn build_runner(
        manager: &MemLogManager,
        factory: ComputationFactory,
        policy: ComputationPolicy,
        cancel: CancellationToken,
    ) -> Runner<MemLogManager> {
        let topology = Topology::builder()
            .add_computation(factory, ["i1:orders", "o1:shipped"])
            .unwrap()
            .build()
            .unwrap();
        let settings = ProcessorSettings::new(1)
            .with_default_policy(policy)
            .with_poll_timeout(Duration::from_millis(10));
        Runner::new(
            manager.clone(),
            topology.computation("A").unwrap(),
            0,
            &settings,
            cancel,
            ProcessorHealth::default(),
        )
        .await
        .unwrap()
    }

    async fn shipped_keys(manager: &MemLogManager) -> Vec<String> {
        manager
            .read("shipped", 0, 0, 100, Duration::ZERO)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.record.key_str().into_owned())
            .collect()
    }

    async fn wait_committed(manager: &MemLogManager, offset: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.committed("orders", 0, "A").await.unwrap() < offset {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn failing_record_halts_after_retries() {
        let manager = orders(&["k1", "k2", "k3"]).await;
        let calls = Calls::default();
        let policy = ComputationPolicy::builder()
            .retry_policy(retrying(2))
            .batch_policy(10, Duration::ZERO)
            .build();
        let runner = build_runner(
            &manager,
            shipper(vec!["k2"], calls.clone()),
            policy,
            CancellationToken::new(),
        )
        .await;
        let state = runner.state();

        let result = tokio::time::timeout(Duration::from_secs(5), runner.run())
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(Error::FatalHalt { ref computation, partition: 0, offset: 1 }) if computation == "A"
        ));
        assert_eq!(*state.borrow(), RunnerState::FailedHalted);

        assert_eq!(shipped_keys(&manager).await, vec!["k1"]);
        assert_eq!(manager.committed("orders", 0, "A").await.unwrap(), 1);
        let lag = manager.lag_per_partition("orders", "A").await.unwrap();
        assert_eq!(lag[0].lag, 2);

        assert_eq!(Calls::get(&calls.retries), 2);
        assert_eq!(Calls::get(&calls.failures), 1);
        // k1 once, k2 three times, k3 never
        assert_eq!(Calls::get(&calls.records), 4);
    }

    #[tokio::test]
    async fn continue_on_failure_skips_the_record() {
        let manager = orders(&["k1", "k2", "k3"]).await;
        let calls = Calls::default();
        let policy = ComputationPolicy::builder()
            .retry_policy(retrying(1))
            .continue_on_failure(true)
            .build();
        let cancel = CancellationToken::new();
        let runner = build_runner(
            &manager,
            shipper(vec!["k2"], calls.clone()),
            policy,
            cancel.clone(),
        )
        .await;
        let state = runner.state();
        let handle = tokio::spawn(runner.run());

        wait_committed(&manager, 3).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(*state.borrow(), RunnerState::Stopped);
        // partial output of the skipped record is discarded
        assert_eq!(shipped_keys(&manager).await, vec!["k1", "k3"]);
        assert_eq!(Calls::get(&calls.retries), 1);
        assert_eq!(Calls::get(&calls.failures), 1);
    }

    #[tokio::test]
    async fn skip_budget_is_spent_before_halting() {
        let manager = orders(&["k1", "k2", "k3", "k4"]).await;
        let policy = ComputationPolicy::builder().skip_first_failures(1).build();
        let runner = build_runner(
            &manager,
            shipper(vec!["k2", "k3"], Calls::default()),
            policy,
            CancellationToken::new(),
        )
        .await;

        let result = tokio::time::timeout(Duration::from_secs(5), runner.run())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::FatalHalt { offset: 2, .. })));
        assert_eq!(shipped_keys(&manager).await, vec!["k1"]);
        assert_eq!(manager.committed("orders", 0, "A").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn nothing_is_committed_when_outputs_are_lost() {
        let manager = orders(&["k1", "k2"]).await;
        manager.error_injector().fail_appends(10);
        let policy = ComputationPolicy::builder()
            .retry_policy(retrying(2))
            .batch_policy(10, Duration::ZERO)
            .build();
        let runner = build_runner(
            &manager,
            shipper(vec![], Calls::default()),
            policy.clone(),
            CancellationToken::new(),
        )
        .await;

        let result = tokio::time::timeout(Duration::from_secs(5), runner.run())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::FatalHalt { offset: 0, .. })));
        assert_eq!(manager.committed("orders", 0, "A").await.unwrap(), 0);
        assert!(shipped_keys(&manager).await.is_empty());

        // a restarted runner gets the records again
        manager.error_injector().fail_appends(0);
        let cancel = CancellationToken::new();
        let restarted = build_runner(&manager, shipper(vec![], Calls::default()), policy, cancel.clone()).await;
        let handle = tokio::spawn(restarted.run());
        wait_committed(&manager, 2).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(shipped_keys(&manager).await, vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let manager = orders(&["k1", "k2"]).await;
        manager.error_injector().fail_reads(1);
        manager.error_injector().fail_appends(1);
        manager.error_injector().fail_commits(1);
        let policy = ComputationPolicy::builder()
            .retry_policy(retrying(3))
            .build();
        let cancel = CancellationToken::new();
        let runner = build_runner(&manager, shipper(vec![], Calls::default()), policy, cancel.clone()).await;
        let handle = tokio::spawn(runner.run());

        wait_committed(&manager, 2).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(shipped_keys(&manager).await, vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn poison_pill_stops_the_runner() {
        let manager = orders(&["k1"]).await;
        manager
            .append("orders", 0, Record::poison_pill())
            .await
            .unwrap();
        manager
            .append("orders", 0, Record::of_key("k2"))
            .await
            .unwrap();
        let calls = Calls::default();
        let runner = build_runner(
            &manager,
            shipper(vec![], calls.clone()),
            ComputationPolicy::default(),
            CancellationToken::new(),
        )
        .await;
        let state = runner.state();

        tokio::time::timeout(Duration::from_secs(5), runner.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*state.borrow(), RunnerState::Stopped);
        assert_eq!(manager.committed("orders", 0, "A").await.unwrap(), 2);
        assert_eq!(shipped_keys(&manager).await, vec!["k1"]);
        assert_eq!(Calls::get(&calls.records), 1);
    }

    #[tokio::test]
    async fn fresh_group_is_registered_at_start() {
        let manager = orders(&[]).await;
        let cancel = CancellationToken::new();
        let runner = build_runner(&manager, shipper(vec![], Calls::default()), ComputationPolicy::NONE, cancel.clone()).await;
        let mut state = runner.state();
        let handle = tokio::spawn(runner.run());

        state
            .wait_for(|s| *s == RunnerState::Running)
            .await
            .unwrap();
        assert_eq!(manager.consumer_groups("orders").await.unwrap(), vec!["A"]);
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    /// Emits a tick from a timer armed in `init`, then asks to stop.
    struct Ticker {
        metadata: ComputationMetadata,
    }

    impl Computation for Ticker {
        fn metadata(&self) -> &ComputationMetadata {
            &self.metadata
        }

        fn init(&mut self, context: &mut ComputationContext) -> Result<()> {
            context.set_timer("tick", Duration::from_millis(20));
            Ok(())
        }

        fn process_record(
            &mut self,
            _context: &mut ComputationContext,
            _input: &str,
            _record: &Record,
        ) -> Result<()> {
            Ok(())
        }

        fn process_timer(
            &mut self,
            context: &mut ComputationContext,
            key: &str,
            timestamp: u64,
        ) -> Result<()> {
            context.produce_key_value("o1", key.to_string(), timestamp.to_string())?;
            context.ask_for_termination();
            Ok(())
        }
    }

    #[tokio::test]
    async fn timers_drive_source_computations() {
        let manager = orders(&[]).await;
        let factory: ComputationFactory = Arc::new(|| {
            Box::new(Ticker {
                metadata: ComputationMetadata::new("ticker", 0, 1),
            }) as Box<dyn Computation>
        });
        let topology = Topology::builder()
            .add_computation(factory, ["o1:shipped"])
            .unwrap()
            .build()
            .unwrap();
        let runner = Runner::new(
            manager.clone(),
            topology.computation("ticker").unwrap(),
            0,
            &ProcessorSettings::new(1).with_poll_timeout(Duration::from_millis(5)),
            CancellationToken::new(),
            ProcessorHealth::default(),
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), runner.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shipped_keys(&manager).await, vec!["tick"]);
    }

    #[tokio::test]
    async fn batches_are_committed_once_flushed() {
        let manager = orders(&["k1", "k2", "k3", "k4", "k5"]).await;
        let policy = ComputationPolicy::builder()
            .batch_policy(2, Duration::from_millis(50))
            .build();
        let cancel = CancellationToken::new();
        let runner = build_runner(&manager, shipper(vec![], Calls::default()), policy, cancel.clone()).await;
        let handle = tokio::spawn(runner.run());

        wait_committed(&manager, 5).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(
            shipped_keys(&manager).await,
            vec!["k1", "k2", "k3", "k4", "k5"]
        );
        assert_eq!(manager.end_offset("shipped", 0).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn run_future_can_be_spawned() {
        fn assert_send<T: Send + 'static>(_: T) {}
        let manager = orders(&[]).await;
        let runner = build_runner(
            &manager,
            shipper(vec![], Calls::default()),
            ComputationPolicy::NONE,
            CancellationToken::new(),
        )
        .await;
        assert_send(runner.run());
    }

    #[tokio::test]
    async fn outputs_are_redelivered_when_commits_fail() {
        let manager = orders(&[]).await;
        let policy = ComputationPolicy::builder()
            .batch_policy(1, Duration::ZERO)
            .build();
        let runner = build_runner(
            &manager,
            shipper(vec![], Calls::default()),
            policy.clone(),
            CancellationToken::new(),
        )
        .await;
        let mut state = runner.state();
        let handle = tokio::spawn(runner.run());
        state
            .wait_for(|s| *s == RunnerState::Running)
            .await
            .unwrap();

        manager.error_injector().fail_commits(100);
        manager
            .append("orders", 0, Record::of_key("k1"))
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::FatalHalt { offset: 0, .. })));
        // the output made it, the input offset did not
        assert_eq!(manager.end_offset("shipped", 0).await.unwrap(), 1);
        assert_eq!(manager.committed("orders", 0, "A").await.unwrap(), 0);

        manager.error_injector().fail_commits(0);
        let cancel = CancellationToken::new();
        let restarted = build_runner(
            &manager,
            shipper(vec![], Calls::default()),
            policy,
            cancel.clone(),
        )
        .await;
        let handle = tokio::spawn(restarted.run());
        wait_committed(&manager, 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(shipped_keys(&manager).await, vec!["k1", "k1"]);
        assert_eq!(manager.committed("orders", 0, "A").await.unwrap(), 1);
    }

    /// Ships records and remembers the group's committed offset seen by each of them. Asks for
    /// a checkpoint right after `k1`.
    struct Checkpointing {
        metadata: ComputationMetadata,
        manager: MemLogManager,
        seen: Arc<parking_lot::Mutex<Vec<u64>>>,
    }

    impl Computation for Checkpointing {
        fn metadata(&self) -> &ComputationMetadata {
            &self.metadata
        }

        fn process_record(
            &mut self,
            context: &mut ComputationContext,
            _input: &str,
            record: &Record,
        ) -> Result<()> {
            let committed =
                futures::executor::block_on(self.manager.committed("orders", 0, "A"))?;
            self.seen.lock().push(committed);
            context.produce("o1", record.clone())?;
            if record.key_str() == "k1" {
                context.ask_for_checkpoint();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn checkpoint_request_commits_inside_the_batch() {
        let manager = orders(&["k1", "k2", "k3"]).await;
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let factory: ComputationFactory = {
            let manager = manager.clone();
            let seen = Arc::clone(&seen);
            Arc::new(move || {
                Box::new(Checkpointing {
                    metadata: ComputationMetadata::new("A", 1, 1),
                    manager: manager.clone(),
                    seen: Arc::clone(&seen),
                }) as Box<dyn Computation>
            })
        };
        let policy = ComputationPolicy::builder()
            .batch_policy(100, Duration::from_millis(300))
            .build();
        let cancel = CancellationToken::new();
        let runner = build_runner(&manager, factory, policy, cancel.clone()).await;
        let handle = tokio::spawn(runner.run());

        wait_committed(&manager, 3).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        // one batch of three records, committed after k1 and again at the end
        assert_eq!(*seen.lock(), vec![0, 1, 1]);
        assert_eq!(shipped_keys(&manager).await, vec!["k1", "k2", "k3"]);
    }

    /// Ticks once, 20 ms after `init`, then asks to stop. Records are shipped as they are.
    struct TimedShipper {
        metadata: ComputationMetadata,
    }

    impl Computation for TimedShipper {
        fn metadata(&self) -> &ComputationMetadata {
            &self.metadata
        }

        fn init(&mut self, context: &mut ComputationContext) -> Result<()> {
            context.set_timer("tick", Duration::from_millis(20));
            Ok(())
        }

        fn process_record(
            &mut self,
            context: &mut ComputationContext,
            _input: &str,
            record: &Record,
        ) -> Result<()> {
            context.produce("o1", record.clone())
        }

        fn process_timer(
            &mut self,
            context: &mut ComputationContext,
            key: &str,
            _timestamp: u64,
        ) -> Result<()> {
            context.produce_key_value("o1", key.to_string(), "")?;
            context.ask_for_termination();
            Ok(())
        }
    }

    #[tokio::test]
    async fn timers_are_not_held_back_by_a_filling_batch() {
        let manager = orders(&["k1"]).await;
        let factory: ComputationFactory = Arc::new(|| {
            Box::new(TimedShipper {
                metadata: ComputationMetadata::new("A", 1, 1),
            }) as Box<dyn Computation>
        });
        let policy = ComputationPolicy::builder()
            .batch_policy(100, Duration::from_secs(10))
            .build();
        let runner = build_runner(&manager, factory, policy, CancellationToken::new()).await;

        tokio::time::timeout(Duration::from_secs(2), runner.run())
            .await
            .unwrap()
            .unwrap();
        // the timer stopped the runner before the buffered record was handled
        assert_eq!(shipped_keys(&manager).await, vec!["tick"]);
        assert_eq!(manager.committed("orders", 0, "A").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unbounded_batch_threshold() {
        let manager = orders(&["k1", "k2"]).await;
        let policy = ComputationPolicy::builder()
            .batch_policy(1, Duration::MAX)
            .build();
        let cancel = CancellationToken::new();
        let runner = build_runner(&manager, shipper(vec![], Calls::default()), policy, cancel.clone()).await;
        let handle = tokio::spawn(runner.run());

        wait_committed(&manager, 2).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(shipped_keys(&manager).await, vec!["k1", "k2"]);
    }

    #[test]
    fn terminal_states() {
        assert!(RunnerState::Stopped.is_terminal());
        assert!(RunnerState::FailedHalted.is_terminal());
        assert!(!RunnerState::Retrying.is_terminal());
    }
}
