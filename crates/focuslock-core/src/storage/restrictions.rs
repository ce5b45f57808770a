//! Restriction store: the authoritative set of active restrictions.
//!
//! Records live in memory and are mirrored to durable storage after every
//! change. Durable failures are logged and never reach the caller; for the
//! rest of the process lifetime the in-memory map is authoritative.
//!
//! Reads are expiry-aware. [`RestrictionStore::is_restricted`] and
//! [`RestrictionStore::list`] drop timed records whose end time has passed
//! (lazy expiry) and remember their ids so the expiry scheduler can announce
//! them; see [`RestrictionStore::take_lapsed`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::mirror::{DurableMirror, RESTRICTIONS_KEY};
use crate::model::RestrictionRecord;
use crate::platform::AppCatalog;

pub struct RestrictionStore {
    records: BTreeMap<String, RestrictionRecord>,
    mirror: DurableMirror,
    lapsed: Vec<String>,
}

impl RestrictionStore {
    /// Empty store that writes through `mirror`.
    pub fn new(mirror: DurableMirror) -> Self {
        Self {
            records: BTreeMap::new(),
            mirror,
            lapsed: Vec::new(),
        }
    }

    /// Load persisted records.
    ///
    /// Records for packages the catalog no longer resolves, records already
    /// expired at `now`, and individually malformed entries are dropped.
    /// A failed read leaves the store empty.
    pub fn load(mirror: DurableMirror, catalog: &dyn AppCatalog, now: DateTime<Utc>) -> Self {
        let mut store = Self::new(mirror);
        let raw: Vec<serde_json::Value> = match store.mirror.load_json(RESTRICTIONS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return store,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted restrictions, starting empty");
                return store;
            }
        };

        let stored = raw.len();
        for value in raw {
            let record: RestrictionRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed restriction record");
                    continue;
                }
            };
            let Some(metadata) = catalog.resolve(record.package_id()) else {
                tracing::debug!(package_id = record.package_id(), "dropping restriction for unresolvable package");
                continue;
            };
            if record.is_expired_at(now) {
                tracing::debug!(package_id = record.package_id(), "dropping restriction that expired while stopped");
                continue;
            }
            let record = record.with_icon(metadata.icon_ref);
            store.records.insert(record.package_id().to_string(), record);
        }

        tracing::info!(loaded = store.records.len(), stored, "restored restrictions");
        if store.records.len() != stored {
            store.persist();
        }
        store
    }

    /// Insert or overwrite by package id, then mirror to storage.
    pub fn add(&mut self, record: RestrictionRecord) {
        tracing::info!(
            package_id = record.package_id(),
            permanent = record.is_permanent(),
            "adding restriction"
        );
        self.lapsed.retain(|id| id != record.package_id());
        self.records.insert(record.package_id().to_string(), record);
        self.persist();
    }

    /// Remove a restriction. Unknown ids are a no-op.
    pub fn remove(&mut self, package_id: &str) -> Option<RestrictionRecord> {
        let removed = self.records.remove(package_id);
        if removed.is_some() {
            tracing::info!(package_id, "removed restriction");
            self.persist();
        }
        removed
    }

    /// Whether `package_id` is currently restricted.
    ///
    /// A timed record with `now > end_time` is removed by this call and
    /// reported as not restricted.
    pub fn is_restricted(&mut self, package_id: &str, now: DateTime<Utc>) -> bool {
        let Some(record) = self.records.get(package_id) else {
            return false;
        };
        if record.is_expired_at(now) {
            tracing::debug!(package_id, "restriction lapsed on read");
            self.records.remove(package_id);
            self.lapsed.push(package_id.to_string());
            self.persist();
            return false;
        }
        true
    }

    /// All live restrictions, after sweeping expired ones.
    pub fn list(&mut self, now: DateTime<Utc>) -> Vec<RestrictionRecord> {
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|record| record.is_expired_at(now))
            .map(|record| record.package_id().to_string())
            .collect();
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "sweeping lapsed restrictions");
            for package_id in &expired {
                self.records.remove(package_id);
            }
            self.lapsed.extend(expired);
            self.persist();
        }
        self.records.values().cloned().collect()
    }

    /// Remove `package_id` if it has expired at `now`.
    ///
    /// Used by the expiry scheduler, which announces the removal itself, so
    /// the id is not queued in the lapsed list.
    pub fn expire_if_due(&mut self, package_id: &str, now: DateTime<Utc>) -> Option<RestrictionRecord> {
        if !self.records.get(package_id)?.is_expired_at(now) {
            return None;
        }
        let removed = self.records.remove(package_id);
        self.persist();
        removed
    }

    /// Ids removed by lazy expiry since the last call.
    pub fn take_lapsed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lapsed)
    }

    /// Read-only view without expiry side effects.
    pub fn get(&self, package_id: &str) -> Option<&RestrictionRecord> {
        self.records.get(package_id)
    }

    /// Read-only snapshot without expiry side effects.
    pub fn records(&self) -> impl Iterator<Item = &RestrictionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn persist(&self) {
        let snapshot: Vec<&RestrictionRecord> = self.records.values().collect();
        if let Err(e) = self.mirror.save_json(RESTRICTIONS_KEY, &snapshot) {
            tracing::warn!(error = %e, "failed to persist restrictions, keeping in-memory state");
        }
    }
}
