use std::sync::Arc;

use tracing::debug;

use crate::{LicenseStorage, StoredSessionRecord};

/// In-memory view of persisted sessions, synchronized with the
/// host-provided [`LicenseStorage`] when one exists.
pub(crate) struct SessionStore {
    storage: Option<Arc<dyn LicenseStorage>>,
    records: Vec<StoredSessionRecord>,
}

impl SessionStore {
    pub(crate) fn new(storage: Option<Arc<dyn LicenseStorage>>) -> Self {
        let records = storage.as_ref().map(|s| s.load()).unwrap_or_default();
        if !records.is_empty() {
            debug!(count = records.len(), "loaded persisted license sessions");
        }
        Self { storage, records }
    }

    pub(crate) fn find(&self, fingerprint: &str) -> Option<&StoredSessionRecord> {
        self.records.iter().find(|r| r.fingerprint == fingerprint)
    }

    /// Insert or replace the record for its fingerprint, then write back.
    pub(crate) fn persist(&mut self, record: StoredSessionRecord) {
        self.records.retain(|r| r.fingerprint != record.fingerprint);
        self.records.push(record);
        if let Some(storage) = &self.storage {
            storage.save(self.records.clone());
        }
    }

    /// Drop a stale record, e.g. after a failed `load_session`.
    pub(crate) fn evict(&mut self, fingerprint: &str) {
        let before = self.records.len();
        self.records.retain(|r| r.fingerprint != fingerprint);
        if self.records.len() != before {
            if let Some(storage) = &self.storage {
                storage.save(self.records.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemStorage {
        saved: Mutex<Vec<StoredSessionRecord>>,
    }

    impl LicenseStorage for MemStorage {
        fn load(&self) -> Vec<StoredSessionRecord> {
            self.saved.lock().clone()
        }

        fn save(&self, records: Vec<StoredSessionRecord>) {
            *self.saved.lock() = records;
        }
    }

    fn record(fp: &str, sid: &str) -> StoredSessionRecord {
        StoredSessionRecord {
            fingerprint: fp.to_string(),
            session_id: sid.to_string(),
            key_system: "com.widevine.alpha".to_string(),
        }
    }

    #[test]
    fn persist_and_find_round_trip() {
        let storage = Arc::new(MemStorage::default());
        let mut store = SessionStore::new(Some(storage.clone()));
        store.persist(record("fp1", "s1"));

        assert_eq!(store.find("fp1").unwrap().session_id, "s1");
        assert_eq!(storage.saved.lock().len(), 1);

        // Reloading from the same storage sees the record.
        let reloaded = SessionStore::new(Some(storage));
        assert!(reloaded.find("fp1").is_some());
    }

    #[test]
    fn persist_replaces_same_fingerprint() {
        let mut store = SessionStore::new(None);
        store.persist(record("fp1", "s1"));
        store.persist(record("fp1", "s2"));
        assert_eq!(store.find("fp1").unwrap().session_id, "s2");
    }

    #[test]
    fn evict_writes_back() {
        let storage = Arc::new(MemStorage::default());
        let mut store = SessionStore::new(Some(storage.clone()));
        store.persist(record("fp1", "s1"));
        store.evict("fp1");
        assert!(store.find("fp1").is_none());
        assert!(storage.saved.lock().is_empty());
    }
}
