use crate::{
    certificate::{Certificate, Invalid},
    ledger::{self, Error, Receipt},
    roster::{Operator, Roster},
    types::Batch,
};
use commonware_runtime::Clock;
use futures::channel::mpsc;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

/// Scripted result of a submission attempt.
#[derive(Clone, Debug)]
pub enum Outcome {
    /// Verify the certificate and include it.
    Accept,
    /// Fail without looking at the certificate.
    Fail(Error),
}

struct State {
    operators: Vec<Operator>,
    threshold: u8,
    latency: Duration,

    roster_failures: VecDeque<Error>,
    roster_requests: usize,

    outcomes: VecDeque<Outcome>,
    attempts: usize,
    in_flight: usize,
    max_in_flight: usize,
    certified: BTreeMap<u64, Receipt>,
    submissions: Vec<(u64, Receipt)>,
    height: u64,
    block_failures: VecDeque<Error>,
    block_requests: usize,

    history: Vec<Batch>,
    subscribe_failures: VecDeque<Error>,
    subscriptions: Vec<u64>,
    subscribers: Vec<mpsc::UnboundedSender<Result<Batch, Error>>>,
}

/// In-memory ledger that verifies certificates the way the on-chain verifier does.
///
/// All clones share the same state.
#[derive(Clone)]
pub struct Ledger<E: Clock> {
    context: E,
    state: Arc<Mutex<State>>,
}

struct InFlight(Arc<Mutex<State>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.lock().unwrap().in_flight -= 1;
    }
}

impl<E: Clock> Ledger<E> {
    /// Creates a ledger where `operators` are registered at every block and certificates must
    /// meet `threshold` percent of their stake.
    pub fn new(context: E, operators: Vec<Operator>, threshold: u8) -> Self {
        Self {
            context,
            state: Arc::new(Mutex::new(State {
                operators,
                threshold,
                latency: Duration::ZERO,
                roster_failures: VecDeque::new(),
                roster_requests: 0,
                outcomes: VecDeque::new(),
                attempts: 0,
                in_flight: 0,
                max_in_flight: 0,
                certified: BTreeMap::new(),
                submissions: Vec::new(),
                height: 1_000,
                block_failures: VecDeque::new(),
                block_requests: 0,
                history: Vec::new(),
                subscribe_failures: VecDeque::new(),
                subscriptions: Vec::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    /// Delays every submission by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// Fails the next roster requests, in order.
    pub fn fail_rosters(&self, errors: impl IntoIterator<Item = Error>) {
        self.state.lock().unwrap().roster_failures.extend(errors);
    }

    /// Overrides the outcome of the next submissions, in order.
    pub fn script_submissions(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state.lock().unwrap().outcomes.extend(outcomes);
    }

    /// Sets the latest block (receipts are included in the blocks after it).
    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    /// Fails the next block number requests, in order.
    pub fn fail_blocks(&self, errors: impl IntoIterator<Item = Error>) {
        self.state.lock().unwrap().block_failures.extend(errors);
    }

    pub fn block_requests(&self) -> usize {
        self.state.lock().unwrap().block_requests
    }

    /// Fails the next subscription attempts, in order.
    pub fn fail_subscriptions(&self, errors: impl IntoIterator<Item = Error>) {
        self.state.lock().unwrap().subscribe_failures.extend(errors);
    }

    /// Announces `batch` to current and future subscribers.
    pub fn publish(&self, batch: Batch) {
        let mut state = self.state.lock().unwrap();
        state
            .subscribers
            .retain(|subscriber| subscriber.unbounded_send(Ok(batch.clone())).is_ok());
        state.history.push(batch);
    }

    /// Closes every open subscription.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().subscribers.clear();
    }

    /// Sends `err` to every open subscription and closes it.
    pub fn break_subscriptions(&self, err: Error) {
        let subscribers = std::mem::take(&mut self.state.lock().unwrap().subscribers);
        for subscriber in subscribers {
            let _ = subscriber.unbounded_send(Err(err.clone()));
        }
    }

    pub fn roster_requests(&self) -> usize {
        self.state.lock().unwrap().roster_requests
    }

    /// Returns the number of submission attempts (including failed and abandoned ones).
    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    /// Returns the largest number of concurrent submissions observed.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    /// Returns accepted certificates in the order they were included.
    pub fn submissions(&self) -> Vec<(u64, Receipt)> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Returns the indices of certified batches, ascending.
    pub fn certified(&self) -> Vec<u64> {
        self.state.lock().unwrap().certified.keys().copied().collect()
    }

    /// Returns the `from_block` of every subscription attempt.
    pub fn subscriptions(&self) -> Vec<u64> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    fn include(
        state: &mut State,
        batch: &Batch,
        certificate: &Certificate,
    ) -> Result<Receipt, Error> {
        if let Some(Outcome::Fail(err)) = state.outcomes.pop_front() {
            return Err(err);
        }
        if state.certified.contains_key(&batch.index) {
            return Err(Error::AlreadyResponded);
        }
        let roster = Roster::new(batch.created_at_block, state.operators.clone())
            .map_err(|err| Error::MalformedCertificate(err.to_string()))?;
        certificate
            .verify(batch, &roster, state.threshold)
            .map_err(|err| match err {
                Invalid::QuorumNotMet => Error::QuorumNotMet,
                err => Error::MalformedCertificate(err.to_string()),
            })?;

        state.height += 1;
        let mut hasher = Sha256::new();
        hasher.update(certificate.identifier);
        hasher.update(state.height.to_be_bytes());
        let receipt = Receipt {
            transaction: hasher.finalize().into(),
            block: state.height,
            gas_used: 100_000 + 5_000 * certificate.non_signers.len() as u64,
        };
        state.certified.insert(batch.index, receipt.clone());
        state.submissions.push((batch.index, receipt.clone()));
        Ok(receipt)
    }
}

impl<E: Clock> ledger::Reader for Ledger<E> {
    async fn operator_roster(&self, reference_block: u64) -> Result<Roster, Error> {
        let mut state = self.state.lock().unwrap();
        state.roster_requests += 1;
        if let Some(err) = state.roster_failures.pop_front() {
            return Err(err);
        }
        Roster::new(reference_block, state.operators.clone())
            .map_err(|err| Error::Transport(err.to_string()))
    }

    async fn current_block(&self) -> Result<u64, Error> {
        let mut state = self.state.lock().unwrap();
        state.block_requests += 1;
        if let Some(err) = state.block_failures.pop_front() {
            return Err(err);
        }
        Ok(state.height)
    }
}

impl<E: Clock> ledger::Writer for Ledger<E> {
    async fn submit_certificate(
        &self,
        batch: &Batch,
        certificate: &Certificate,
    ) -> Result<Receipt, Error> {
        let latency = {
            let mut state = self.state.lock().unwrap();
            state.attempts += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency
        };
        let _in_flight = InFlight(self.state.clone());
        if !latency.is_zero() {
            self.context.sleep(latency).await;
        }
        let mut state = self.state.lock().unwrap();
        Self::include(&mut state, batch, certificate)
    }
}

impl<E: Clock> ledger::Subscriber for Ledger<E> {
    type Events = mpsc::UnboundedReceiver<Result<Batch, Error>>;

    async fn subscribe(&mut self, from_block: u64) -> Result<Self::Events, Error> {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.push(from_block);
        if let Some(err) = state.subscribe_failures.pop_front() {
            return Err(err);
        }
        let (sender, receiver) = mpsc::unbounded();
        for batch in &state.history {
            if batch.created_at_block >= from_block {
                let _ = sender.unbounded_send(Ok(batch.clone()));
            }
        }
        state.subscribers.push(sender);
        Ok(receiver)
    }
}
