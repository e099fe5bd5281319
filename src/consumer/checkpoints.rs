//! Consumer-local record of the last processed offset per partition, shared
//! between the consumer loop and the reliability monitor.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::messaging::Offset;

#[derive(Debug, Clone, Default)]
pub struct ConsumerCheckpoints {
    offsets: Arc<DashMap<(String, i32), Offset>>,
}

impl ConsumerCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `offset` as processed; the stored offset never moves backwards
    pub fn record(&self, topic: &str, partition: i32, offset: Offset) {
        self.offsets
            .entry((topic.to_string(), partition))
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
    }

    pub fn get(&self, topic: &str, partition: i32) -> Option<Offset> {
        self.offsets
            .get(&(topic.to_string(), partition))
            .map(|entry| *entry.value())
    }

    /// Last processed offset for every partition of `topic`
    pub fn for_topic(&self, topic: &str) -> HashMap<i32, Offset> {
        self.offsets
            .iter()
            .filter(|entry| entry.key().0 == topic)
            .map(|entry| (entry.key().1, *entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoints_are_monotonic_and_shared() {
        let checkpoints = ConsumerCheckpoints::new();
        let shared = checkpoints.clone();

        checkpoints.record("commands", 0, 10);
        checkpoints.record("commands", 0, 7);
        checkpoints.record("commands", 1, 3);
        checkpoints.record("other", 0, 99);

        assert_eq!(shared.get("commands", 0), Some(10));
        assert_eq!(shared.get("commands", 2), None);

        let per_partition = shared.for_topic("commands");
        assert_eq!(per_partition.len(), 2);
        assert_eq!(per_partition[&1], 3);
    }
}
