use dashmap::DashMap;
use mqbridge_client::CommitHandle;

/// Counts delivery attempts of records that failed as poison.
///
/// Kafka has no backout count, so the sink keeps one per record position.
/// Entries are dropped once the record is committed or dead-lettered.
#[derive(Debug, Default)]
pub struct AttemptTracker {
    attempts: DashMap<CommitHandle, u32>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records another failed attempt and returns the total so far.
    pub fn record_failure(&self, handle: &CommitHandle) -> u32 {
        let mut entry = self.attempts.entry(handle.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn attempts(&self, handle: &CommitHandle) -> u32 {
        self.attempts.get(handle).map(|a| *a).unwrap_or(0)
    }

    pub fn clear(&self, handles: &[CommitHandle]) {
        for handle in handles {
            self.attempts.remove(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(offset: i64) -> CommitHandle {
        CommitHandle {
            topic: "mq-messages-out".to_string(),
            partition: 0,
            offset,
        }
    }

    #[test]
    fn test_counts_per_record() {
        let tracker = AttemptTracker::new();

        assert_eq!(tracker.record_failure(&handle(1)), 1);
        assert_eq!(tracker.record_failure(&handle(1)), 2);
        assert_eq!(tracker.record_failure(&handle(2)), 1);
        assert_eq!(tracker.attempts(&handle(1)), 2);
        assert_eq!(tracker.attempts(&handle(3)), 0);
    }

    #[test]
    fn test_clear_forgets_committed_records() {
        let tracker = AttemptTracker::new();
        tracker.record_failure(&handle(1));
        tracker.record_failure(&handle(2));

        tracker.clear(&[handle(1), handle(2)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_shared_between_threads() {
        let tracker = std::sync::Arc::new(AttemptTracker::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        tracker.record_failure(&handle(9));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(tracker.attempts(&handle(9)), 100);
        assert_eq!(tracker.len(), 1);
    }
}
