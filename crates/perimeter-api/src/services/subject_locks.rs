use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

/// Per-subject mutex map serializing the insert → count → penalty → ban
/// sequence for one principal or address. Entries are held by weak reference
/// and evicted once the last in-flight request drops its handle.
#[derive(Default)]
pub struct SubjectLocks {
    inner: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

/// Stable lock key for a subject: principal wins over address.
pub fn subject_key(principal_id: Option<Uuid>, remote_address: Option<&str>) -> String {
    match (principal_id, remote_address) {
        (Some(id), _) => format!("p:{id}"),
        (None, Some(addr)) => format!("a:{addr}"),
        (None, None) => "a:unknown".to_string(),
    }
}

impl SubjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().expect("subject lock map poisoned");
        if let Some(existing) = map.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let fresh = Arc::new(tokio::sync::Mutex::new(()));
        map.insert(key.to_string(), Arc::downgrade(&fresh));
        if map.len() > 1024 {
            map.retain(|_, weak| weak.strong_count() > 0);
        }
        fresh
    }

    #[cfg(test)]
    fn live_entries(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_returns_same_mutex() {
        let locks = SubjectLocks::new();
        let a = locks.acquire("p:123");
        let b = locks.acquire("p:123");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_keys_do_not_share() {
        let locks = SubjectLocks::new();
        let a = locks.acquire("p:123");
        let b = locks.acquire("a:203.0.113.9");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn dropped_handles_are_evictable() {
        let locks = SubjectLocks::new();
        {
            let _held = locks.acquire("p:temp");
            assert_eq!(locks.live_entries(), 1);
        }
        assert_eq!(locks.live_entries(), 0);
    }

    #[test]
    fn principal_takes_precedence_in_key() {
        let id = Uuid::new_v4();
        assert_eq!(
            subject_key(Some(id), Some("203.0.113.9")),
            format!("p:{id}")
        );
        assert_eq!(subject_key(None, Some("203.0.113.9")), "a:203.0.113.9");
    }

    #[tokio::test]
    async fn serializes_critical_section() {
        let locks = Arc::new(SubjectLocks::new());
        let counter = Arc::new(std::sync::Mutex::new(0_i32));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let lock = locks.acquire("p:shared");
                let _guard = lock.lock().await;
                let before = *counter.lock().unwrap();
                tokio::task::yield_now().await;
                *counter.lock().unwrap() = before + 1;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 8);
    }
}
