use std::collections::{HashSet, VecDeque};

pub const DEFAULT_MAX_ENTRIES: usize = 100;

/// Bounded, insertion-ordered set of run ids believed terminal.
///
/// Membership is a hint, not a source of truth: a false negative (an evicted
/// but still-terminal id) only costs a redundant subscribe attempt. On
/// overflow the oldest half is evicted in one pass, amortizing eviction cost
/// across many inserts instead of paying it on every insert at the cap.
#[derive(Debug)]
pub struct TerminalCache {
    max_entries: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl TerminalCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    pub fn insert(&mut self, run_id: &str) {
        if self.members.contains(run_id) {
            return;
        }
        self.members.insert(run_id.to_string());
        self.order.push_back(run_id.to_string());

        if self.order.len() > self.max_entries {
            let evict = (self.max_entries + 1) / 2;
            for _ in 0..evict {
                if let Some(oldest) = self.order.pop_front() {
                    self.members.remove(&oldest);
                }
            }
        }
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.members.contains(run_id)
    }

    /// Explicit invalidation, used only when a run id is deliberately reused.
    pub fn remove(&mut self, run_id: &str) -> bool {
        if !self.members.remove(run_id) {
            return false;
        }
        self.order.retain(|id| id != run_id);
        true
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Default for TerminalCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let mut cache = TerminalCache::new(10);
        cache.insert("run_1");
        cache.insert("run_1");
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("run_1"));
    }

    #[test]
    fn never_holds_more_than_max_entries() {
        let mut cache = TerminalCache::new(100);
        for i in 0..250 {
            cache.insert(&format!("run_{i}"));
            assert!(cache.len() <= 100);
        }
    }

    #[test]
    fn overflow_evicts_oldest_half() {
        let mut cache = TerminalCache::new(4);
        for i in 0..5 {
            cache.insert(&format!("run_{i}"));
        }
        // 5 entries exceeded the cap of 4, dropping the oldest ceil(4/2) = 2.
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("run_0"));
        assert!(!cache.contains("run_1"));
        assert!(cache.contains("run_2"));
        assert!(cache.contains("run_4"));
    }

    #[test]
    fn odd_cap_evicts_ceil_half() {
        let mut cache = TerminalCache::new(5);
        for i in 0..6 {
            cache.insert(&format!("run_{i}"));
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("run_2"));
        assert!(cache.contains("run_3"));
    }

    #[test]
    fn remove_allows_reuse() {
        let mut cache = TerminalCache::new(10);
        cache.insert("run_1");
        assert!(cache.remove("run_1"));
        assert!(!cache.contains("run_1"));
        assert!(!cache.remove("run_1"));
        cache.insert("run_1");
        assert!(cache.contains("run_1"));
    }
}
