//! Collect operator attestations and certify each batch exactly once.
//!
//! # Ingestion
//!
//! Operators may respond before the batch they attest to is registered. An attestation for an
//! unknown batch is held (without locking anything) for up to `task_wait_retries` checks of the
//! registry, `task_wait_delay` apart, before it is rejected.
//!
//! Every attestation is then handled while holding the [Entry](crate::registry::Entry) of the
//! batch it refers to:
//!
//! 1. Fetch (and cache) the roster at the batch's creation block.
//! 2. Reject attestations from unknown operators or with invalid signatures (neither is stored).
//! 3. Store the attestation (the first attestation of each operator wins).
//! 4. Evaluate the stored attestations and, if a quorum of stake is reached, wait for the ledger
//!    to advance past the batch's creation block and submit the resulting certificate.
//! 5. Once the ledger accepts the certificate (or reports that the batch was already certified),
//!    mark the batch as submitted.
//!
//! Because all of these steps happen in one critical section, only the attestation that first
//! completes the quorum performs a submission. If that submission fails, the batch remains
//! unsubmitted and the next attestation (including a resend) tries again.
//!
//! # Garbage Collection
//!
//! [Aggregator::start] periodically forgets batches more than `task_age` indices older than the
//! newest registered batch.

use crate::{
    certificate, ledger,
    registry::{Recorded, Registry},
    roster::Roster,
    rpc,
    submitter::{self, Submitter},
    subscriber::Registrar,
    telemetry::Telemetry,
    types::{Attestation, Batch},
};
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use std::{sync::Arc, time::Duration};
use tally_retry::{retry, Error as Retry, Policy};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while processing an attestation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("roster unavailable: {0}")]
    Roster(ledger::Error),
    #[error("evaluation failed: {0}")]
    Evaluation(certificate::Error),
    #[error("submission failed: {0}")]
    Submission(ledger::Error),
}

/// Why an attestation was rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reason {
    UnknownTask,
    UnknownOperator,
    InvalidSignature,
}

/// Outcome of [Aggregator::process].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// The attestation was stored (or was a duplicate). No certificate was submitted.
    Accepted,
    /// The attestation completed a quorum and the certificate was submitted.
    Submitted,
    /// The attestation was discarded.
    Rejected(Reason),
}

impl Status {
    /// Returns the code reported to the operator.
    pub fn code(&self) -> u8 {
        match self {
            Status::Accepted | Status::Submitted => rpc::ACCEPTED,
            Status::Rejected(_) => rpc::REJECTED,
        }
    }
}

/// Configuration for the [Aggregator].
#[derive(Clone, Debug)]
pub struct Config {
    /// Percentage of total stake that must sign a batch.
    pub threshold: u8,

    /// Backoff applied to roster requests.
    pub retry: Policy,

    pub submitter: submitter::Config,

    /// Delay between submitting a certificate and finishing its trace.
    pub finish_trace_delay: Duration,

    /// Interval between garbage collection passes.
    pub gc_period: Duration,

    /// Number of indices below the newest batch that are retained.
    pub task_age: u64,

    /// Times the registry is checked again before an attestation for an unknown batch is
    /// rejected.
    pub task_wait_retries: u32,

    /// Delay between checks for an unknown batch.
    pub task_wait_delay: Duration,

    /// Interval between block number requests while waiting to submit.
    pub block_poll_interval: Duration,

    /// Longest wait for a block after the batch's creation block (submission proceeds anyway).
    pub block_wait_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 67,
            retry: Policy::default(),
            submitter: submitter::Config::default(),
            finish_trace_delay: Duration::from_secs(10),
            gc_period: Duration::from_secs(60),
            task_age: 100,
            task_wait_retries: 50,
            task_wait_delay: Duration::from_secs(4),
            block_poll_interval: Duration::from_secs(1),
            block_wait_timeout: Duration::from_secs(30),
        }
    }
}

/// Aggregates attestations into certificates.
///
/// Clones share the same registry and metrics.
#[derive(Clone)]
pub struct Aggregator<
    E: Clock + Spawner + Metrics,
    L: ledger::Reader + ledger::Writer,
    T: Telemetry,
> {
    context: E,
    ledger: L,
    telemetry: T,
    registry: Arc<Registry>,
    submitter: Submitter<E, L>,

    threshold: u8,
    retry: Policy,
    finish_trace_delay: Duration,
    gc_period: Duration,
    task_age: u64,
    task_wait_retries: u32,
    task_wait_delay: Duration,
    block_poll_interval: Duration,
    block_wait_timeout: Duration,

    tasks: Counter,
    responses: Counter,
    rejected: Counter,
    duplicates: Counter,
    certificates: Counter,
    submission_failures: Counter,
    pending: Gauge,
    pruned: Counter,
}

impl<E: Clock + Spawner + Metrics, L: ledger::Reader + ledger::Writer, T: Telemetry>
    Aggregator<E, L, T>
{
    pub fn new(context: E, ledger: L, telemetry: T, cfg: Config) -> Self {
        let tasks = Counter::default();
        let responses = Counter::default();
        let rejected = Counter::default();
        let duplicates = Counter::default();
        let certificates = Counter::default();
        let submission_failures = Counter::default();
        let pending = Gauge::default();
        let pruned = Counter::default();
        context.register("tasks", "number of batches registered", tasks.clone());
        context.register("responses", "number of attestations received", responses.clone());
        context.register("rejected", "number of attestations rejected", rejected.clone());
        context.register(
            "duplicates",
            "number of repeated attestations from an operator",
            duplicates.clone(),
        );
        context.register(
            "certificates",
            "number of certificates accepted by the ledger",
            certificates.clone(),
        );
        context.register(
            "submission_failures",
            "number of certificates the ledger did not accept",
            submission_failures.clone(),
        );
        context.register("pending", "number of batches tracked", pending.clone());
        context.register("pruned", "number of batches garbage collected", pruned.clone());

        let submitter = Submitter::new(context.clone(), ledger.clone(), cfg.submitter);
        Self {
            context,
            ledger,
            telemetry,
            registry: Arc::new(Registry::new()),
            submitter,
            threshold: cfg.threshold,
            retry: cfg.retry,
            finish_trace_delay: cfg.finish_trace_delay,
            gc_period: cfg.gc_period,
            task_age: cfg.task_age,
            task_wait_retries: cfg.task_wait_retries,
            task_wait_delay: cfg.task_wait_delay,
            block_poll_interval: cfg.block_poll_interval,
            block_wait_timeout: cfg.block_wait_timeout,
            tasks,
            responses,
            rejected,
            duplicates,
            certificates,
            submission_failures,
            pending,
            pruned,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Processes an operator attestation.
    pub async fn process(&self, attestation: Attestation) -> Result<Status, Error> {
        self.responses.inc();
        let index = attestation.batch_index;
        let operator = attestation.operator;
        let mut waited = 0;
        let mut entry = loop {
            match self.registry.entry(index).await {
                Ok(entry) => break entry,
                Err(_) if waited < self.task_wait_retries => {
                    waited += 1;
                    debug!(index, %operator, waited, "waiting for task");
                    self.context.sleep(self.task_wait_delay).await;
                }
                Err(_) => {
                    warn!(index, %operator, "attestation for unknown task");
                    return Ok(self.reject(Reason::UnknownTask));
                }
            }
        };
        let batch = entry.batch().clone();

        // Verify the signer
        let roster = match entry.roster() {
            Some(roster) => roster,
            None => {
                let roster = Arc::new(self.fetch_roster(batch.created_at_block).await?);
                entry.set_roster(roster.clone());
                roster
            }
        };
        let Some((_, registered)) = roster.get(&operator) else {
            warn!(index, %operator, "attestation from unknown operator");
            return Ok(self.reject(Reason::UnknownOperator));
        };
        if !attestation.verify(&batch, &registered.public_key) {
            warn!(index, %operator, "invalid attestation signature");
            return Ok(self.reject(Reason::InvalidSignature));
        }

        // Store the attestation
        match entry.record(attestation) {
            Recorded::Added => {
                debug!(index, %operator, "recorded attestation");
                self.telemetry.operator_responded(&batch, &operator);
            }
            Recorded::Duplicate => {
                debug!(index, %operator, "duplicate attestation");
                self.duplicates.inc();
            }
            Recorded::Submitted => {
                self.telemetry.operator_responded(&batch, &operator);
            }
        }
        if entry.is_submitted() {
            debug!(index, %operator, "batch already certified");
            return Ok(Status::Accepted);
        }

        // Check for quorum
        let evaluation =
            certificate::evaluate_verified(&batch, entry.attestations(), &roster, self.threshold)
                .map_err(Error::Evaluation)?;
        let Some(certificate) = evaluation.certificate else {
            debug!(
                index,
                signed_stake = evaluation.signed_stake,
                total_stake = evaluation.total_stake,
                "quorum not reached"
            );
            return Ok(Status::Accepted);
        };
        info!(
            index,
            signed_stake = certificate.signed_stake,
            total_stake = certificate.total_stake,
            non_signers = certificate.non_signers.len(),
            "quorum reached"
        );

        // Submit while holding the entry
        self.wait_for_block(batch.created_at_block).await;
        match self.submitter.submit(&batch, &certificate).await {
            Ok(_) => {
                entry.mark_submitted();
                self.certificates.inc();
                self.telemetry.quorum_reached(&batch);
                self.finish_trace(batch);
                Ok(Status::Submitted)
            }
            Err(ledger::Error::AlreadyResponded) => {
                info!(index, "batch already responded");
                entry.mark_submitted();
                self.finish_trace(batch);
                Ok(Status::Accepted)
            }
            Err(err) => {
                self.submission_failures.inc();
                Err(Error::Submission(err))
            }
        }
    }

    /// Forgets batches more than `task_age` indices older than the newest batch.
    pub fn prune(&self) -> usize {
        let Some(newest) = self.registry.newest() else {
            return 0;
        };
        let below = newest.saturating_sub(self.task_age);
        let removed = self.registry.prune(below);
        if removed > 0 {
            self.pruned.inc_by(removed as u64);
            self.pending.set(self.registry.len() as i64);
            info!(removed, below, "pruned batches");
        }
        removed
    }

    /// Runs garbage collection until the task is aborted.
    pub fn start(self) -> Handle<()> {
        self.context.with_label("gc").spawn(|context| async move {
            loop {
                context.sleep(self.gc_period).await;
                self.prune();
            }
        })
    }

    fn reject(&self, reason: Reason) -> Status {
        self.rejected.inc();
        Status::Rejected(reason)
    }

    async fn fetch_roster(&self, reference_block: u64) -> Result<Roster, Error> {
        let ledger = &self.ledger;
        retry(&self.context, &self.retry, || async move {
            ledger
                .operator_roster(reference_block)
                .await
                .map_err(|err| {
                    if err.is_permanent() {
                        Retry::Permanent(err)
                    } else {
                        Retry::Transient(err)
                    }
                })
        })
        .await
        .map_err(|err| {
            warn!(reference_block, ?err, "failed to fetch roster");
            Error::Roster(err)
        })
    }

    /// Waits until the ledger is past `created_at_block`, giving up after `block_wait_timeout`.
    async fn wait_for_block(&self, created_at_block: u64) {
        let deadline = self.context.current() + self.block_wait_timeout;
        loop {
            match self.ledger.current_block().await {
                Ok(block) if block > created_at_block => return,
                Ok(block) => debug!(block, created_at_block, "waiting for next block"),
                Err(err) => {
                    warn!(created_at_block, %err, "failed to fetch block, submitting anyway");
                    return;
                }
            }
            if self.context.current() >= deadline {
                warn!(created_at_block, "no new block, submitting anyway");
                return;
            }
            self.context.sleep(self.block_poll_interval).await;
        }
    }

    fn finish_trace(&self, batch: Batch) {
        let telemetry = self.telemetry.clone();
        let delay = self.finish_trace_delay;
        self.context
            .with_label("trace")
            .spawn(move |context| async move {
                context.sleep(delay).await;
                telemetry.trace_finished(&batch);
            });
    }
}

impl<E: Clock + Spawner + Metrics, L: ledger::Reader + ledger::Writer, T: Telemetry> Registrar
    for Aggregator<E, L, T>
{
    fn register(&self, batch: Batch) -> bool {
        if !self.registry.register(batch.clone()) {
            return false;
        }
        self.tasks.inc();
        self.pending.set(self.registry.len() as i64);
        self.telemetry.trace_started(&batch);
        true
    }
}

impl<E: Clock + Spawner + Metrics, L: ledger::Reader + ledger::Writer, T: Telemetry> rpc::Service
    for Aggregator<E, L, T>
{
    async fn process_signed_response(&self, attestation: Attestation) -> u8 {
        let index = attestation.batch_index;
        match self.process(attestation).await {
            Ok(status) => status.code(),
            Err(err) => {
                warn!(index, ?err, "failed to process attestation");
                rpc::REJECTED
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mocks::{self, Event, Outcome},
        types::{tests::batch, NAMESPACE},
    };
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use futures::future::join_all;

    type Mocked<E> = Aggregator<E, mocks::Ledger<E>, mocks::Telemetry>;

    fn config(threshold: u8) -> Config {
        Config {
            threshold,
            retry: Policy {
                min_delay: Duration::from_millis(100),
                multiplier: 2.0,
                max_retries: 3,
                max_delay: None,
            },
            submitter: submitter::Config {
                policy: Policy {
                    min_delay: Duration::from_millis(100),
                    multiplier: 2.0,
                    max_retries: 2,
                    max_delay: None,
                },
                attempt_timeout: Duration::from_secs(5),
            },
            finish_trace_delay: Duration::from_secs(10),
            gc_period: Duration::from_secs(60),
            task_age: 10,
            task_wait_retries: 3,
            task_wait_delay: Duration::from_secs(1),
            block_poll_interval: Duration::from_secs(1),
            block_wait_timeout: Duration::from_secs(30),
        }
    }

    fn setup<E: Clock + Spawner + Metrics>(
        context: &E,
        stakes: &[u128],
        threshold: u8,
    ) -> (Mocked<E>, mocks::Ledger<E>, mocks::Telemetry, Vec<mocks::Signer>) {
        let (signers, roster) = mocks::roster(stakes, 0);
        let ledger = mocks::Ledger::new(context.clone(), roster.operators().to_vec(), threshold);
        let telemetry = mocks::Telemetry::default();
        let aggregator = Aggregator::new(
            context.with_label("aggregator"),
            ledger.clone(),
            telemetry.clone(),
            config(threshold),
        );
        (aggregator, ledger, telemetry, signers)
    }

    #[test_traced]
    fn test_end_to_end() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, telemetry, signers) = setup(&context, &[1, 1, 1], 50);
            let target = batch(7);
            assert!(aggregator.register(target.clone()));

            // A alone is not enough
            let status = aggregator.process(signers[0].attest(&target, true)).await;
            assert_eq!(status, Ok(Status::Accepted));
            assert!(ledger.submissions().is_empty());

            // B completes the quorum
            let status = aggregator.process(signers[1].attest(&target, true)).await;
            assert_eq!(status, Ok(Status::Submitted));
            let submissions = ledger.submissions();
            assert_eq!(submissions.len(), 1);
            assert_eq!(submissions[0].0, 7);

            // C arrives late
            let status = aggregator.process(signers[2].attest(&target, true)).await;
            assert_eq!(status, Ok(Status::Accepted));
            assert_eq!(ledger.attempts(), 1);

            // The roster was fetched once
            assert_eq!(ledger.roster_requests(), 1);

            // The trace finishes after a delay
            assert_eq!(
                telemetry.events_for(7),
                vec![
                    Event::Started(7),
                    Event::Responded(7, signers[0].id),
                    Event::Responded(7, signers[1].id),
                    Event::Quorum(7),
                    Event::Responded(7, signers[2].id),
                ]
            );
            context.sleep(Duration::from_secs(11)).await;
            assert_eq!(telemetry.events().last(), Some(&Event::Finished(7)));

            let metrics = context.encode();
            assert!(metrics.contains("aggregator_certificates_total 1"));
            assert!(metrics.contains("aggregator_responses_total 3"));
        });
    }

    #[test_traced]
    fn test_below_quorum() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, _, signers) = setup(&context, &[1, 1, 1], 67);
            let target = batch(1);
            aggregator.register(target.clone());
            for signer in &signers[..2] {
                let status = aggregator.process(signer.attest(&target, true)).await;
                assert_eq!(status, Ok(Status::Accepted));
            }
            assert_eq!(ledger.attempts(), 0);

            // Dissent is stored but never counted
            let status = aggregator.process(signers[2].attest(&target, false)).await;
            assert_eq!(status, Ok(Status::Accepted));
            assert_eq!(ledger.attempts(), 0);
            assert_eq!(aggregator.registry().entry(1).await.unwrap().len(), 3);
        });
    }

    #[test_traced]
    fn test_unknown_task() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, telemetry, signers) = setup(&context, &[1, 1, 1], 50);
            aggregator.register(batch(1));
            let status = aggregator.process(signers[0].attest(&batch(2), true)).await;
            assert_eq!(status, Ok(Status::Rejected(Reason::UnknownTask)));
            assert_eq!(status.unwrap().code(), rpc::REJECTED);

            // Nothing changed
            assert_eq!(aggregator.registry().len(), 1);
            assert!(aggregator.registry().entry(1).await.unwrap().is_empty());
            assert_eq!(ledger.roster_requests(), 0);
            assert_eq!(telemetry.events(), vec![Event::Started(1)]);
        });
    }

    #[test_traced]
    fn test_late_registration() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, _, signers) = setup(&context, &[1, 1], 50);
            let target = batch(2);

            // The attestation arrives before the batch
            let handle = context.with_label("operator").spawn({
                let aggregator = aggregator.clone();
                let attestation = signers[0].attest(&target, true);
                move |_| async move { aggregator.process(attestation).await }
            });
            context.sleep(Duration::from_millis(1_500)).await;
            assert!(aggregator.register(target.clone()));
            assert_eq!(handle.await.unwrap(), Ok(Status::Submitted));
            assert_eq!(ledger.certified(), vec![2]);

            // Batches that never show up are rejected after the last check
            let start = context.current();
            let status = aggregator.process(signers[0].attest(&batch(3), true)).await;
            assert_eq!(status, Ok(Status::Rejected(Reason::UnknownTask)));
            let waited = context.current().duration_since(start).unwrap();
            assert!(waited >= Duration::from_secs(3));
            assert!(waited < Duration::from_secs(4));
        });
    }

    #[test_traced]
    fn test_flipped_verdict_rejected() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, _, signers) = setup(&context, &[1, 1], 50);
            let target = batch(4);
            aggregator.register(target.clone());

            // A relay replays the operator's signature with the opposite verdict
            let genuine = signers[0].attest(&target, true);
            let mut flipped = genuine.clone();
            flipped.verdict = false;
            let status = aggregator.process(flipped).await;
            assert_eq!(status, Ok(Status::Rejected(Reason::InvalidSignature)));
            assert!(aggregator.registry().entry(4).await.unwrap().is_empty());

            // The genuine attestation still counts
            let status = aggregator.process(genuine).await;
            assert_eq!(status, Ok(Status::Submitted));
            assert_eq!(ledger.certified(), vec![4]);
        });
    }

    #[test_traced]
    fn test_waits_for_next_block() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, _, signers) = setup(&context, &[1, 1], 50);
            let target = batch(5);
            aggregator.register(target.clone());
            ledger.set_height(target.created_at_block);
            context.with_label("miner").spawn({
                let ledger = ledger.clone();
                let next = target.created_at_block + 1;
                move |context| async move {
                    context.sleep(Duration::from_millis(4_500)).await;
                    ledger.set_height(next);
                }
            });

            // Nothing is submitted in the batch's creation block
            let start = context.current();
            let status = aggregator.process(signers[0].attest(&target, true)).await;
            assert_eq!(status, Ok(Status::Submitted));
            assert!(context.current().duration_since(start).unwrap() >= Duration::from_secs(5));
            assert_eq!(ledger.attempts(), 1);
            assert_eq!(ledger.block_requests(), 6);
            assert!(ledger.submissions()[0].1.block > target.created_at_block + 1);
        });
    }

    #[test_traced]
    fn test_block_wait_bounded() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, _, signers) = setup(&context, &[1, 1], 50);

            // The ledger never advances
            let stalled = batch(6);
            aggregator.register(stalled.clone());
            ledger.set_height(stalled.created_at_block);
            let start = context.current();
            let status = aggregator.process(signers[0].attest(&stalled, true)).await;
            assert_eq!(status, Ok(Status::Submitted));
            let waited = context.current().duration_since(start).unwrap();
            assert!(waited >= Duration::from_secs(30));
            assert!(waited < Duration::from_secs(32));

            // The block number is unavailable
            let target = batch(20);
            aggregator.register(target.clone());
            ledger.fail_blocks([ledger::Error::Transport("unavailable".into())]);
            let start = context.current();
            let status = aggregator.process(signers[0].attest(&target, true)).await;
            assert_eq!(status, Ok(Status::Submitted));
            assert!(context.current().duration_since(start).unwrap() < Duration::from_secs(1));
            assert_eq!(ledger.certified(), vec![6, 20]);
        });
    }

    #[test_traced]
    fn test_duplicate_counts_once() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, _, signers) = setup(&context, &[1, 1, 1], 50);
            let target = batch(3);
            aggregator.register(target.clone());
            let attestation = signers[0].attest(&target, true);
            assert_eq!(aggregator.process(attestation.clone()).await, Ok(Status::Accepted));
            assert_eq!(aggregator.process(attestation).await, Ok(Status::Accepted));

            // A conflicting attestation is ignored as well
            let conflicting = signers[0].attest(&target, false);
            assert_eq!(aggregator.process(conflicting).await, Ok(Status::Accepted));
            assert_eq!(ledger.attempts(), 0);
            {
                let entry = aggregator.registry().entry(3).await.unwrap();
                assert_eq!(entry.len(), 1);
                assert!(entry.attestations().all(|attestation| attestation.verdict));
            }

            // The earlier attestation still counts toward quorum
            let status = aggregator.process(signers[1].attest(&target, true)).await;
            assert_eq!(status, Ok(Status::Submitted));
            assert!(context.encode().contains("aggregator_duplicates_total 2"));
        });
    }

    #[test_traced]
    fn test_invalid_signature_does_not_block() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, _, signers) = setup(&context, &[1, 1, 1], 67);
            let target = batch(4);
            aggregator.register(target.clone());

            // B's attestation is signed by someone else
            let mut forged = signers[1].attest(&target, true);
            forged.signature = signers[0].key.sign(NAMESPACE, &target.identifier());
            let status = aggregator.process(forged).await;
            assert_eq!(status, Ok(Status::Rejected(Reason::InvalidSignature)));

            // An attestation signed over another batch
            let mut replayed = signers[1].attest(&batch(5), true);
            replayed.batch_index = 4;
            let status = aggregator.process(replayed).await;
            assert_eq!(status, Ok(Status::Rejected(Reason::InvalidSignature)));

            // A stranger
            let stranger = mocks::Signer::new(42, 100);
            let status = aggregator.process(stranger.attest(&target, true)).await;
            assert_eq!(status, Ok(Status::Rejected(Reason::UnknownOperator)));

            // Nothing was stored, so B's genuine attestation still counts
            for signer in &signers {
                aggregator.process(signer.attest(&target, true)).await.unwrap();
            }
            assert_eq!(ledger.certified(), vec![4]);
            assert!(context.encode().contains("aggregator_rejected_total 3"));
        });
    }

    #[test_traced]
    fn test_submission_failure_then_resend() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, telemetry, signers) = setup(&context, &[1, 1, 1], 50);
            let target = batch(5);
            aggregator.register(target.clone());
            let transport = || Outcome::Fail(ledger::Error::Transport("unreachable".into()));
            ledger.script_submissions([transport(), transport(), transport()]);

            aggregator.process(signers[0].attest(&target, true)).await.unwrap();
            let status = aggregator.process(signers[1].attest(&target, true)).await;
            assert_eq!(
                status,
                Err(Error::Submission(ledger::Error::Transport("unreachable".into())))
            );

            // The operator resends, which retries the submission
            let resend = signers[1].attest(&target, true);
            let code = rpc::Service::process_signed_response(&aggregator, resend).await;
            assert_eq!(code, rpc::ACCEPTED);
            assert_eq!(ledger.attempts(), 4);
            assert_eq!(ledger.certified(), vec![5]);
            assert!(telemetry.events().contains(&Event::Quorum(5)));

            // Already certified
            let status = aggregator.process(signers[2].attest(&target, true)).await;
            assert_eq!(status, Ok(Status::Accepted));
            assert_eq!(ledger.attempts(), 4);
        });
    }

    #[test_traced]
    fn test_already_responded_completes() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, telemetry, signers) = setup(&context, &[1, 1, 1], 50);
            let target = batch(6);
            aggregator.register(target.clone());
            ledger.script_submissions([Outcome::Fail(ledger::Error::AlreadyResponded)]);
            for signer in &signers[..2] {
                let status = aggregator.process(signer.attest(&target, true)).await;
                assert_eq!(status, Ok(Status::Accepted));
            }
            assert_eq!(ledger.attempts(), 1);
            assert!(aggregator.registry().entry(6).await.unwrap().is_submitted());

            // No further attempts
            aggregator.process(signers[2].attest(&target, true)).await.unwrap();
            assert_eq!(ledger.attempts(), 1);
            assert!(!telemetry.events().contains(&Event::Quorum(6)));
        });
    }

    #[test_traced]
    fn test_roster_retried() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, _, signers) = setup(&context, &[1, 1], 50);
            let target = batch(8);
            aggregator.register(target.clone());
            let unavailable = || ledger::Error::Transport("unavailable".into());

            // Recovers within the retry budget
            ledger.fail_rosters([unavailable(), unavailable()]);
            let status = aggregator.process(signers[0].attest(&target, true)).await;
            assert_eq!(status, Ok(Status::Submitted));
            assert_eq!(ledger.roster_requests(), 3);

            // Exhausts the retry budget
            let next = batch(9);
            aggregator.register(next.clone());
            ledger.fail_rosters((0..4).map(|_| unavailable()));
            let status = aggregator.process(signers[0].attest(&next, true)).await;
            assert_eq!(status, Err(Error::Roster(unavailable())));
            assert_eq!(ledger.roster_requests(), 7);
            assert!(aggregator.registry().entry(9).await.unwrap().is_empty());
        });
    }

    fn at_most_once<E: Clock + Spawner + Metrics>(
        context: E,
    ) -> impl std::future::Future<Output = ()> {
        async move {
            let (aggregator, ledger, _, signers) = setup(&context, &[1; 10], 50);
            let target = batch(11);
            aggregator.register(target.clone());
            ledger.set_latency(Duration::from_millis(50));

            // Every operator responds at once
            let handles: Vec<_> = signers
                .iter()
                .enumerate()
                .map(|(i, signer)| {
                    let aggregator = aggregator.clone();
                    let attestation = signer.attest(&target, true);
                    context
                        .with_label(&format!("operator_{i}"))
                        .spawn(move |_| async move { aggregator.process(attestation).await })
                })
                .collect();
            let statuses: Vec<_> = join_all(handles)
                .await
                .into_iter()
                .map(|result| result.unwrap().unwrap())
                .collect();
            let submitted = statuses
                .iter()
                .filter(|status| **status == Status::Submitted)
                .count();
            assert_eq!(submitted, 1);
            assert_eq!(ledger.attempts(), 1);
            assert_eq!(ledger.submissions().len(), 1);
        }
    }

    #[test_traced]
    fn test_at_most_once_deterministic() {
        for seed in 0..5 {
            let executor = deterministic::Runner::seeded(seed);
            executor.start(at_most_once);
        }
    }

    #[test_traced]
    fn test_at_most_once_tokio() {
        let executor = commonware_runtime::tokio::Runner::default();
        executor.start(at_most_once);
    }

    #[test_traced]
    fn test_garbage_collection() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (aggregator, ledger, _, signers) = setup(&context, &[1, 1], 50);
            for index in 1..=25 {
                aggregator.register(batch(index));
            }
            let target = batch(3);
            aggregator.process(signers[0].attest(&target, true)).await.unwrap();
            assert_eq!(ledger.certified(), vec![3]);

            let _gc = aggregator.clone().start();
            context.sleep(Duration::from_secs(61)).await;

            // Batches below 25 - 10 are gone
            assert_eq!(aggregator.registry().len(), 11);
            assert!(aggregator.registry().get(14).is_none());
            assert!(aggregator.registry().get(15).is_some());
            let status = aggregator.process(signers[1].attest(&target, true)).await;
            assert_eq!(status, Ok(Status::Rejected(Reason::UnknownTask)));

            // A replayed batch is registered again and its resubmission absorbed
            assert!(aggregator.register(target.clone()));
            let status = aggregator.process(signers[1].attest(&target, true)).await;
            assert_eq!(status, Ok(Status::Accepted));
            assert!(aggregator.registry().entry(3).await.unwrap().is_submitted());
            assert_eq!(ledger.submissions().len(), 1);

            let metrics = context.encode();
            assert!(metrics.contains("aggregator_pruned_total 14"));
            assert!(metrics.contains("aggregator_pending 12"));
        });
    }
}
