use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// How a wait on a pending entry ended.
#[derive(Debug, PartialEq)]
pub enum Wait<V> {
    Reply(V),
    TimedOut,
    /// The table was drained (the channel went away).
    Closed,
}

type Entries<K, V> = Arc<Mutex<HashMap<K, oneshot::Sender<V>>>>;

/// Requests awaiting a reply, keyed by correlation id.
///
/// Every entry is removed on every exit path: resolved by a reply, dropped by
/// [`PendingTable::drain`], or removed by the [`PendingEntry`] guard when the
/// waiter times out or is cancelled.
pub struct PendingTable<K, V> {
    entries: Entries<K, V>,
}

impl<K, V> Clone for PendingTable<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<K, V> Default for PendingTable<K, V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn lock<K, V>(entries: &Mutex<HashMap<K, oneshot::Sender<V>>>) -> MutexGuard<'_, HashMap<K, oneshot::Sender<V>>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K: Eq + Hash + Clone, V> PendingTable<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `key`. A previous waiter on the same key is closed.
    pub fn register(&self, key: K) -> PendingEntry<K, V> {
        let (tx, rx) = oneshot::channel();
        lock(&self.entries).insert(key.clone(), tx);
        PendingEntry {
            key,
            entries: self.entries.clone(),
            rx,
        }
    }

    /// Hand `value` to the waiter of `key`. Returns `false` if nobody waits
    /// (already timed out, or a duplicate reply).
    pub fn resolve(&self, key: &K, value: V) -> bool {
        let Some(tx) = lock(&self.entries).remove(key) else {
            return false;
        };
        tx.send(value).is_ok()
    }

    /// Release every waiter as [`Wait::Closed`]. Returns how many there were.
    pub fn drain(&self) -> usize {
        let drained: Vec<_> = lock(&self.entries).drain().collect();
        drained.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One registered waiter. Dropping it removes its table entry.
pub struct PendingEntry<K: Eq + Hash, V> {
    key: K,
    entries: Entries<K, V>,
    rx: oneshot::Receiver<V>,
}

impl<K: Eq + Hash, V> PendingEntry<K, V> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub async fn wait(mut self, timeout: Duration) -> Wait<V> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(value)) => Wait::Reply(value),
            Ok(Err(_)) => Wait::Closed,
            Err(_) => Wait::TimedOut,
        }
    }
}

impl<K: Eq + Hash, V> Drop for PendingEntry<K, V> {
    fn drop(&mut self) {
        self.rx.close();
        let mut entries = lock(&self.entries);
        // Only remove our own sender; a re-registration may have replaced it.
        if entries.get(&self.key).is_some_and(|tx| tx.is_closed()) {
            entries.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_reaches_waiter_and_clears_entry() {
        let table: PendingTable<u64, &str> = PendingTable::new();
        let entry = table.register(1);
        assert_eq!(table.len(), 1);

        assert!(table.resolve(&1, "ok"));
        assert_eq!(entry.wait(Duration::from_secs(1)).await, Wait::Reply("ok"));
        assert!(table.is_empty());
        assert!(!table.resolve(&1, "late"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_entry() {
        let table: PendingTable<u64, ()> = PendingTable::new();
        let entry = table.register(7);
        assert_eq!(entry.wait(Duration::from_millis(50)).await, Wait::TimedOut);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn drain_closes_every_waiter() {
        let table: PendingTable<u64, ()> = PendingTable::new();
        let a = table.register(1);
        let b = table.register(2);
        assert_eq!(table.drain(), 2);
        assert_eq!(a.wait(Duration::from_secs(5)).await, Wait::Closed);
        assert_eq!(b.wait(Duration::from_secs(5)).await, Wait::Closed);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_removes_its_entry() {
        let table: PendingTable<u64, ()> = PendingTable::new();
        let entry = table.register(3);
        drop(entry);
        assert!(table.is_empty());
    }
}
