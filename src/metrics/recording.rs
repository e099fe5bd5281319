//! In-memory observer for tests and local debugging.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{CommandObserver, CommandOutcome};

#[derive(Debug, Default)]
struct Recorded {
    outcomes: Vec<(String, CommandOutcome)>,
    durations: Vec<(String, f64)>,
    lags: HashMap<(String, i32), i64>,
}

/// Observer that keeps every call
#[derive(Debug, Default)]
pub struct RecordingObserver {
    inner: Mutex<Recorded>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<(String, CommandOutcome)> {
        self.inner.lock().outcomes.clone()
    }

    pub fn outcome_count(&self, outcome: CommandOutcome) -> usize {
        self.inner
            .lock()
            .outcomes
            .iter()
            .filter(|(_, o)| *o == outcome)
            .count()
    }

    pub fn durations(&self) -> Vec<(String, f64)> {
        self.inner.lock().durations.clone()
    }

    pub fn lag(&self, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .lock()
            .lags
            .get(&(topic.to_string(), partition))
            .copied()
    }
}

impl CommandObserver for RecordingObserver {
    fn record_outcome(&self, command_name: &str, outcome: CommandOutcome) {
        self.inner
            .lock()
            .outcomes
            .push((command_name.to_string(), outcome));
    }

    fn observe_duration(&self, command_name: &str, seconds: f64) {
        self.inner
            .lock()
            .durations
            .push((command_name.to_string(), seconds));
    }

    fn set_consumer_lag(&self, topic: &str, partition: i32, lag: i64) {
        self.inner
            .lock()
            .lags
            .insert((topic.to_string(), partition), lag);
    }
}
