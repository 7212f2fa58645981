//! Register batches announced by the ledger.
//!
//! The subscriber alternates between two states:
//!
//! ```txt
//! Connecting --subscribed--> Listening
//!     ^  \--failed (wait)--/      |
//!     |                           |
//!     \---stream error or end-----/ (wait)
//! ```
//!
//! It never gives up. Every reconnection resubscribes from the highest block observed so far,
//! so batches announced while disconnected are replayed (registration is idempotent, so batches
//! seen twice are ignored).

use crate::{ledger, types::Batch};
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::StreamExt;
use prometheus_client::metrics::counter::Counter;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Accepts batches observed by the [Subscriber].
pub trait Registrar: Clone + Send + Sync + 'static {
    /// Registers `batch`, returning false if it was already known.
    fn register(&self, batch: Batch) -> bool;
}

/// Configuration for the [Subscriber].
#[derive(Clone, Debug)]
pub struct Config {
    /// Block to replay batches from on the first subscription.
    pub start_block: u64,

    /// Delay between a failed or dropped subscription and the next attempt.
    pub reconnect_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start_block: 0,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

enum State<S: ledger::Subscriber> {
    Connecting,
    Listening(S::Events),
}

/// Listens for new batches and forwards them to a [Registrar].
pub struct Subscriber<E: Clock + Spawner + Metrics, L: ledger::Subscriber, R: Registrar> {
    context: E,
    ledger: L,
    registrar: R,

    reconnect_delay: Duration,
    from_block: u64,

    reconnects: Counter,
    batches: Counter,
}

impl<E: Clock + Spawner + Metrics, L: ledger::Subscriber, R: Registrar> Subscriber<E, L, R> {
    pub fn new(context: E, ledger: L, registrar: R, cfg: Config) -> Self {
        let reconnects = Counter::default();
        let batches = Counter::default();
        context.register(
            "reconnects",
            "number of times the batch subscription was re-established",
            reconnects.clone(),
        );
        context.register("batches", "number of batch events observed", batches.clone());
        Self {
            context,
            ledger,
            registrar,
            reconnect_delay: cfg.reconnect_delay,
            from_block: cfg.start_block,
            reconnects,
            batches,
        }
    }

    /// Runs the subscriber until its task is aborted.
    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    async fn run(mut self) {
        let mut state = State::Connecting;
        loop {
            state = match state {
                State::Connecting => match self.ledger.subscribe(self.from_block).await {
                    Ok(events) => {
                        info!(from_block = self.from_block, "subscribed to batches");
                        State::Listening(events)
                    }
                    Err(err) => {
                        warn!(from_block = self.from_block, ?err, "failed to subscribe");
                        self.backoff().await;
                        State::Connecting
                    }
                },
                State::Listening(mut events) => match events.next().await {
                    Some(Ok(batch)) => {
                        self.observe(batch);
                        State::Listening(events)
                    }
                    Some(Err(err)) => {
                        warn!(?err, "subscription failed");
                        self.backoff().await;
                        State::Connecting
                    }
                    None => {
                        warn!("subscription closed");
                        self.backoff().await;
                        State::Connecting
                    }
                },
            };
        }
    }

    fn observe(&mut self, batch: Batch) {
        self.batches.inc();
        self.from_block = self.from_block.max(batch.created_at_block);
        let index = batch.index;
        let block = batch.created_at_block;
        if self.registrar.register(batch) {
            info!(index, block, "registered batch");
        } else {
            debug!(index, block, "ignored known batch");
        }
    }

    async fn backoff(&mut self) {
        self.reconnects.inc();
        self.context.sleep(self.reconnect_delay).await;
    }
}
