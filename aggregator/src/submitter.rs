//! Publish certificates to the ledger.

use crate::{
    certificate::Certificate,
    ledger::{Error, Receipt, Writer},
    types::Batch,
};
use async_lock::Mutex;
use commonware_macros::select;
use commonware_runtime::Clock;
use std::{sync::Arc, time::Duration};
use tally_retry::{retry, Error as Retry, Policy};
use tracing::{debug, info, warn};

/// Configuration for the [Submitter].
#[derive(Clone, Debug)]
pub struct Config {
    /// Backoff applied to transient failures.
    pub policy: Policy,

    /// Deadline of a single submission attempt.
    pub attempt_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Submits certificates through a [Writer], one at a time.
///
/// All clones share a single wallet lock (the ledger account signs one transaction at a time).
#[derive(Clone)]
pub struct Submitter<E: Clock, W: Writer> {
    context: E,
    ledger: W,
    policy: Policy,
    attempt_timeout: Duration,
    wallet: Arc<Mutex<()>>,
}

impl<E: Clock, W: Writer> Submitter<E, W> {
    pub fn new(context: E, ledger: W, cfg: Config) -> Self {
        Self {
            context,
            ledger,
            policy: cfg.policy,
            attempt_timeout: cfg.attempt_timeout,
            wallet: Arc::new(Mutex::new(())),
        }
    }

    /// Submits `certificate` for `batch`, retrying transient failures.
    ///
    /// Permanent failures (including [Error::AlreadyResponded]) are returned after the attempt
    /// that observed them.
    pub async fn submit(&self, batch: &Batch, certificate: &Certificate) -> Result<Receipt, Error> {
        let _wallet = self.wallet.lock().await;
        let (context, ledger, timeout) = (&self.context, &self.ledger, self.attempt_timeout);
        let result = retry(context, &self.policy, || async move {
            select! {
                result = ledger.submit_certificate(batch, certificate) => {
                    match result {
                        Ok(receipt) => Ok(receipt),
                        Err(err) if err.is_permanent() => Err(Retry::Permanent(err)),
                        Err(err) => Err(Retry::Transient(err)),
                    }
                },
                _ = context.sleep(timeout) => {
                    debug!(index = batch.index, ?timeout, "submission attempt timed out");
                    Err(Retry::Transient(Error::Timeout))
                },
            }
        })
        .await;
        match &result {
            Ok(receipt) => info!(
                index = batch.index,
                block = receipt.block,
                gas_used = receipt.gas_used,
                "submitted certificate"
            ),
            Err(err) => warn!(index = batch.index, ?err, "failed to submit certificate"),
        }
        result
    }
}
