//! In-flight query registry keyed by query id.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use basalt_core::QueryCancel;

/// Tracks every running query's cancellation handle plus the fail time that
/// governs remaining-time budgets. Mutation happens only through
/// `register`/`remove`; reads are lock-free gets.
#[derive(Default)]
pub struct QueryWatcher {
    running: DashMap<String, WatchedQuery>,
    open_connections: AtomicUsize,
}

#[derive(Clone)]
pub struct WatchedQuery {
    pub cancel: QueryCancel,
    /// Absolute epoch millis after which the query has failed.
    pub fail_time: Option<i64>,
}

impl QueryWatcher {
    pub fn new() -> Arc<QueryWatcher> {
        Arc::new(QueryWatcher::default())
    }

    pub fn register(&self, query_id: &str, cancel: QueryCancel, fail_time: Option<i64>) {
        self.running
            .insert(query_id.to_string(), WatchedQuery { cancel, fail_time });
    }

    pub fn remove(&self, query_id: &str) {
        self.running.remove(query_id);
    }

    pub fn get(&self, query_id: &str) -> Option<WatchedQuery> {
        self.running.get(query_id).map(|e| e.value().clone())
    }

    /// Flip the cancellation flag of a running query; false when unknown.
    pub fn cancel(&self, query_id: &str) -> bool {
        match self.running.get(query_id) {
            Some(entry) => {
                entry.value().cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Open-connection gauge used for backpressure visibility.
    pub fn connection_opened(&self) -> usize {
        self.open_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connection_closed(&self) -> usize {
        self.open_connections.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_cancel_remove() {
        let watcher = QueryWatcher::new();
        let cancel = QueryCancel::new();
        watcher.register("q1", cancel.clone(), None);
        assert_eq!(watcher.running_count(), 1);
        assert!(watcher.cancel("q1"));
        assert!(cancel.is_cancelled());
        watcher.remove("q1");
        assert!(!watcher.cancel("q1"));
    }

    #[test]
    fn test_gauge() {
        let watcher = QueryWatcher::new();
        assert_eq!(watcher.connection_opened(), 1);
        assert_eq!(watcher.connection_opened(), 2);
        assert_eq!(watcher.connection_closed(), 1);
    }
}
