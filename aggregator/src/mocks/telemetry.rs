use crate::{
    telemetry,
    types::{Batch, OperatorId},
};
use std::sync::{Arc, Mutex};

/// A recorded lifecycle event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Started(u64),
    Responded(u64, OperatorId),
    Quorum(u64),
    Finished(u64),
}

/// Records every event in order.
#[derive(Clone, Default)]
pub struct Telemetry {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Telemetry {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Returns the events recorded for batch `index`.
    pub fn events_for(&self, index: u64) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|event| match event {
                Event::Started(i) | Event::Quorum(i) | Event::Finished(i) => *i == index,
                Event::Responded(i, _) => *i == index,
            })
            .collect()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl telemetry::Telemetry for Telemetry {
    fn trace_started(&self, batch: &Batch) {
        self.push(Event::Started(batch.index));
    }

    fn operator_responded(&self, batch: &Batch, operator: &OperatorId) {
        self.push(Event::Responded(batch.index, *operator));
    }

    fn quorum_reached(&self, batch: &Batch) {
        self.push(Event::Quorum(batch.index));
    }

    fn trace_finished(&self, batch: &Batch) {
        self.push(Event::Finished(batch.index));
    }
}
