// Time-windowed set of recently written entity ids, for echo suppression.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RecentWrites {
    window: Duration,
    entries: HashMap<String, Instant>,
}

impl RecentWrites {
    pub fn new(window: Duration) -> Self {
        Self { window, entries: HashMap::new() }
    }

    /// Mark an entity as just written; a repeat write restarts its window.
    pub fn record(&mut self, entity: &str, now: Instant) {
        self.entries.insert(entity.to_string(), now);
    }

    /// Whether the entity is still inside its suppression window. Expired
    /// entries are pruned as a side effect.
    pub fn contains(&mut self, entity: &str, now: Instant) -> bool {
        self.prune(now);
        self.entries.contains_key(entity)
    }

    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.entries.retain(|_, written_at| now.duration_since(*written_at) < window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_after_the_window() {
        let mut recent = RecentWrites::new(Duration::from_millis(2_000));
        let now = Instant::now();

        recent.record("a", now);
        assert!(recent.contains("a", now + Duration::from_millis(1_999)));
        assert!(!recent.contains("a", now + Duration::from_millis(2_000)));
        assert_eq!(recent.len(), 0);
    }

    #[test]
    fn rewriting_restarts_the_window() {
        let mut recent = RecentWrites::new(Duration::from_millis(1_000));
        let now = Instant::now();

        recent.record("a", now);
        recent.record("a", now + Duration::from_millis(900));
        assert!(recent.contains("a", now + Duration::from_millis(1_500)));
        assert!(!recent.contains("a", now + Duration::from_millis(2_000)));
    }

    #[test]
    fn unknown_entities_are_never_recent() {
        let mut recent = RecentWrites::new(Duration::from_millis(1_000));
        assert!(!recent.contains("ghost", Instant::now()));
    }
}
