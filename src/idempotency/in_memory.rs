//! In-memory idempotency store for tests and local development.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{
    IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyResult, IdempotencyStore,
};

type StoreKey = (String, String, String);

/// DashMap-backed store with switchable failures
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<StoreKey, IdempotencyRecord>,
    fail_checks: AtomicBool,
    fail_records: AtomicBool,
    check_calls: AtomicUsize,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `check` return an unavailable error
    pub fn set_fail_checks(&self, fail: bool) {
        self.fail_checks.store(fail, Ordering::SeqCst);
    }

    /// Make `record` return an unavailable error
    pub fn set_fail_records(&self, fail: bool) {
        self.fail_records.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &IdempotencyKey<'_>) -> Option<IdempotencyRecord> {
        self.records.get(&store_key(key)).map(|r| r.value().clone())
    }
}

fn store_key(key: &IdempotencyKey<'_>) -> StoreKey {
    (
        key.tenant_id.to_string(),
        key.key.to_string(),
        key.command_name.to_string(),
    )
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check(&self, key: &IdempotencyKey<'_>) -> IdempotencyResult<bool> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_checks.load(Ordering::SeqCst) {
            return Err(IdempotencyError::unavailable(
                "check",
                "injected store failure",
            ));
        }
        Ok(self.records.contains_key(&store_key(key)))
    }

    async fn record(&self, record: &IdempotencyRecord) -> IdempotencyResult<bool> {
        if self.fail_records.load(Ordering::SeqCst) {
            return Err(IdempotencyError::unavailable(
                "record",
                "injected store failure",
            ));
        }
        let key = (
            record.tenant_id.clone(),
            record.idempotency_key.clone(),
            record.command_name.clone(),
        );
        match self.records.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key<'a>(tenant: &'a str, k: &'a str) -> IdempotencyKey<'a> {
        IdempotencyKey {
            tenant_id: tenant,
            key: k,
            command_name: "ApplyPayment",
        }
    }

    #[tokio::test]
    async fn test_record_is_insert_if_absent() {
        let store = InMemoryIdempotencyStore::new();
        let k = key("t1", "abc");

        assert!(!store.check(&k).await.unwrap());
        assert!(store.record(&IdempotencyRecord::new(&k, Some("cmd-1"))).await.unwrap());
        assert!(!store.record(&IdempotencyRecord::new(&k, Some("cmd-2"))).await.unwrap());
        assert!(store.check(&k).await.unwrap());
        assert_eq!(store.get(&k).unwrap().command_id.as_deref(), Some("cmd-1"));
    }

    #[tokio::test]
    async fn test_keys_are_tenant_scoped() {
        let store = InMemoryIdempotencyStore::new();
        store
            .record(&IdempotencyRecord::new(&key("t1", "abc"), None))
            .await
            .unwrap();
        assert!(!store.check(&key("t2", "abc")).await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = InMemoryIdempotencyStore::new();
        store.set_fail_checks(true);
        assert!(matches!(
            store.check(&key("t1", "abc")).await,
            Err(IdempotencyError::Unavailable { .. })
        ));
        assert_eq!(store.check_calls(), 1);
    }
}
