//! Persisted billing cache
//!
//! The cached subscription and payment history are only used to paint the UI
//! before the first server fetch completes. Nothing here is consulted for
//! access control.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use prepbuddy_shared::{PaymentRecord, SubscriptionRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ClientResult;

/// Storage key for the billing cache
pub const BILLING_CACHE_KEY: &str = "billing-storage";

/// What survives between sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingCache {
    #[serde(default)]
    pub subscription: Option<SubscriptionRecord>,
    #[serde(default)]
    pub payment_history: Vec<PaymentRecord>,
}

/// Key-value storage for the cache
pub trait CacheStorage: Send + Sync {
    fn load(&self, key: &str) -> ClientResult<Option<String>>;
    fn save(&self, key: &str, value: &str) -> ClientResult<()>;
    fn remove(&self, key: &str) -> ClientResult<()>;
}

/// One JSON file per key under a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl CacheStorage for FileStorage {
    fn load(&self, key: &str) -> ClientResult<Option<String>> {
        match fs::read_to_string(self.path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, value: &str) -> ClientResult<()> {
        fs::create_dir_all(&self.dir)?;
        // Write then rename so a crash never leaves a truncated cache
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        fs::write(&tmp, value)?;
        fs::rename(tmp, self.path(key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> ClientResult<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStorage for MemoryStorage {
    fn load(&self, key: &str) -> ClientResult<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> ClientResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> ClientResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

impl BillingCache {
    /// Drop records that belong to anyone but `user_id`. Returns true if
    /// anything was removed.
    pub fn retain_user(&mut self, user_id: Uuid) -> bool {
        let before = self.payment_history.len();
        self.payment_history.retain(|p| p.user_id == user_id);
        let mut changed = self.payment_history.len() != before;

        if self.subscription.as_ref().is_some_and(|s| s.user_id != user_id) {
            self.subscription = None;
            changed = true;
        }
        changed
    }

    /// Read the cache, treating a missing or unreadable entry as empty
    pub fn read(storage: &dyn CacheStorage) -> Self {
        let raw = match storage.load(BILLING_CACHE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Self::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read billing cache");
                return Self::default();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable billing cache");
                if let Err(e) = storage.remove(BILLING_CACHE_KEY) {
                    tracing::warn!(error = %e, "Failed to remove billing cache");
                }
                Self::default()
            }
        }
    }

    pub fn write(&self, storage: &dyn CacheStorage) -> ClientResult<()> {
        let raw = serde_json::to_string(self)?;
        storage.save(BILLING_CACHE_KEY, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.load("k").unwrap(), None);

        storage.save("k", "v").unwrap();
        assert_eq!(storage.load("k").unwrap(), Some("v".to_string()));

        storage.remove("k").unwrap();
        storage.remove("k").unwrap();
        assert_eq!(storage.load("k").unwrap(), None);
    }

    #[test]
    fn test_file_storage() {
        let dir = std::env::temp_dir().join(format!("prepbuddy-cache-{}", uuid::Uuid::new_v4()));
        let storage = FileStorage::new(&dir);

        assert_eq!(storage.load(BILLING_CACHE_KEY).unwrap(), None);
        storage.save(BILLING_CACHE_KEY, "{}").unwrap();
        assert!(dir.join("billing-storage.json").exists());
        assert_eq!(storage.load(BILLING_CACHE_KEY).unwrap(), Some("{}".to_string()));

        storage.remove(BILLING_CACHE_KEY).unwrap();
        assert_eq!(storage.load(BILLING_CACHE_KEY).unwrap(), None);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_cache_uses_camel_case_keys() {
        let storage = MemoryStorage::new();
        BillingCache::default().write(&storage).unwrap();

        let raw = storage.load(BILLING_CACHE_KEY).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(json["subscription"].is_null());
        assert!(json["paymentHistory"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_retain_user_drops_other_users_records() {
        let owner = Uuid::new_v4();
        let cache: BillingCache = serde_json::from_value(serde_json::json!({
            "subscription": {
                "id": Uuid::new_v4(),
                "user_id": owner,
                "plan_id": "pro",
                "status": "active",
                "cancel_at_period_end": false,
                "created_at": "2026-01-01T00:00:00Z",
                "updated_at": "2026-01-01T00:00:00Z"
            },
            "paymentHistory": []
        }))
        .unwrap();

        let mut same = cache.clone();
        assert!(!same.retain_user(owner));
        assert_eq!(same, cache);

        let mut other = cache;
        assert!(other.retain_user(Uuid::new_v4()));
        assert_eq!(other, BillingCache::default());
    }

    #[test]
    fn test_corrupt_cache_is_discarded() {
        let storage = MemoryStorage::new();
        storage.save(BILLING_CACHE_KEY, "not json").unwrap();

        assert_eq!(BillingCache::read(&storage), BillingCache::default());
        assert_eq!(storage.load(BILLING_CACHE_KEY).unwrap(), None);
    }
}
