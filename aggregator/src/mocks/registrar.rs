use crate::{subscriber, types::Batch};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

#[derive(Default)]
struct State {
    batches: BTreeMap<u64, Batch>,
    attempts: usize,
}

/// Records registered batches.
#[derive(Clone, Default)]
pub struct Registrar {
    state: Arc<Mutex<State>>,
}

impl Registrar {
    /// Returns the indices of registered batches, ascending.
    pub fn indices(&self) -> Vec<u64> {
        self.state.lock().unwrap().batches.keys().copied().collect()
    }

    /// Returns the number of registration calls (including replays).
    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }
}

impl subscriber::Registrar for Registrar {
    fn register(&self, batch: Batch) -> bool {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if state.batches.contains_key(&batch.index) {
            return false;
        }
        state.batches.insert(batch.index, batch);
        true
    }
}
