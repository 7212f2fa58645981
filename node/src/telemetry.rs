//! Report batch traces to a telemetry collector.
//!
//! Events are queued in a bounded [Mailbox] and posted by an [Actor] in the order they were
//! emitted. When the queue is full, new events are dropped rather than slowing down
//! certification.

use crate::config;
use commonware_runtime::{Handle, Metrics, Spawner};
use commonware_utils::hex;
use prometheus_client::metrics::counter::Counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tally_aggregator::{
    telemetry::Telemetry,
    types::{Batch, OperatorId},
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Body of every trace request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub merkle_root: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operator_id: Option<String>,
}

enum Message {
    Started([u8; 32]),
    Responded([u8; 32], OperatorId),
    Quorum([u8; 32]),
    Finished([u8; 32]),
}

impl Message {
    fn request(&self) -> (&'static str, Trace) {
        let (path, merkle_root, operator) = match self {
            Message::Started(root) => ("/api/initTaskTrace", root, None),
            Message::Responded(root, operator) => ("/api/operatorResponse", root, Some(operator)),
            Message::Quorum(root) => ("/api/quorumReached", root, None),
            Message::Finished(root) => ("/api/finishTaskTrace", root, None),
        };
        let trace = Trace {
            merkle_root: format!("0x{}", hex(merkle_root)),
            operator_id: operator.map(|operator| format!("0x{}", hex(&operator.0))),
        };
        (path, trace)
    }
}

/// Queues events for the [Actor].
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
    dropped: Counter,
}

impl Mailbox {
    fn send(&self, message: Message) {
        if let Err(err) = self.sender.try_send(message) {
            self.dropped.inc();
            debug!(%err, "dropped telemetry event");
        }
    }
}

impl Telemetry for Mailbox {
    fn trace_started(&self, batch: &Batch) {
        self.send(Message::Started(batch.merkle_root));
    }

    fn operator_responded(&self, batch: &Batch, operator: &OperatorId) {
        self.send(Message::Responded(batch.merkle_root, *operator));
    }

    fn quorum_reached(&self, batch: &Batch) {
        self.send(Message::Quorum(batch.merkle_root));
    }

    fn trace_finished(&self, batch: &Batch) {
        self.send(Message::Finished(batch.merkle_root));
    }
}

/// Posts queued events to the collector.
pub struct Actor<E: Spawner + Metrics> {
    context: E,
    client: Client,
    url: String,
    mailbox: mpsc::Receiver<Message>,

    sent: Counter,
    failed: Counter,
}

impl<E: Spawner + Metrics> Actor<E> {
    pub fn new(context: E, cfg: &config::Telemetry) -> Result<(Self, Mailbox), reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()?;
        let (sender, receiver) = mpsc::channel(cfg.mailbox_size);

        let sent = Counter::default();
        let failed = Counter::default();
        let dropped = Counter::default();
        context.register("sent", "number of trace events delivered", sent.clone());
        context.register(
            "failed",
            "number of trace events that could not be delivered",
            failed.clone(),
        );
        context.register(
            "dropped",
            "number of trace events dropped because the mailbox was full",
            dropped.clone(),
        );
        Ok((
            Self {
                context,
                client,
                url: cfg.url.trim_end_matches('/').to_string(),
                mailbox: receiver,
                sent,
                failed,
            },
            Mailbox { sender, dropped },
        ))
    }

    /// Delivers events until every [Mailbox] is dropped.
    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    async fn run(mut self) {
        while let Some(message) = self.mailbox.recv().await {
            let (path, trace) = message.request();
            let result = self
                .client
                .post(format!("{}{}", self.url, path))
                .json(&trace)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            match result {
                Ok(response) => {
                    self.sent.inc();
                    debug!(
                        path,
                        merkle_root = %trace.merkle_root,
                        status = %response.status(),
                        "sent trace"
                    );
                }
                Err(err) => {
                    self.failed.inc();
                    warn!(path, merkle_root = %trace.merkle_root, ?err, "failed to send trace");
                }
            }
        }
        debug!("telemetry mailbox closed");
    }
}
