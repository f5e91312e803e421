//! # Persisted Sync State
//!
//! What the engine last wrote for each tracked entity, when each entity
//! expires, which entities are retired for good, and how far the CRM
//! catch-up poll has read.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  remember_* / forget / sweep      (std Mutex, no awaits, dirty = true)  │
//! │                │                                                        │
//! │                ▼                                                        │
//! │  flush()  ──► serialize under the lock ──► write <file>.tmp ──► rename  │
//! │               (once per batch / poll cycle; no-op when clean)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Retired ids are tombstones: once an entity is forgotten nothing can make
//! it tracked again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use leadsync_core::EntityId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreResult;

// =============================================================================
// Document
// =============================================================================

/// Per-entity state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    /// Status value last written to (or baselined from) the sheet.
    #[serde(default)]
    pub known_status: String,

    /// Secondary marker (order number) last seen in the sheet.
    #[serde(default)]
    pub known_secondary_marker: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The on-disk JSON document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub entities: BTreeMap<EntityId, EntityState>,

    /// Purged entities and when they were purged.
    #[serde(default)]
    pub retired: BTreeMap<EntityId, DateTime<Utc>>,

    /// Unix seconds up to which CRM events have been caught up.
    #[serde(default)]
    pub crm_cursor: Option<i64>,
}

#[derive(Debug, Default)]
struct Inner {
    doc: StateDocument,
    dirty: bool,
}

// =============================================================================
// Store
// =============================================================================

/// Sync state with batched, atomic persistence.
#[derive(Debug)]
pub struct SyncStateStore {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl SyncStateStore {
    /// Loads state from `path`. A missing file starts empty.
    pub async fn load(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let doc = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => StateDocument::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No sync state file yet, starting empty");
                StateDocument::default()
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            tracked = doc.entities.len(),
            retired = doc.retired.len(),
            "Loaded sync state"
        );

        Ok(Self {
            path: Some(path),
            inner: Mutex::new(Inner { doc, dirty: false }),
            flush_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// State that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(Inner::default()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read<R>(&self, f: impl FnOnce(&StateDocument) -> R) -> R {
        f(&self.lock().doc)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut StateDocument) -> R) -> R {
        let mut inner = self.lock();
        inner.dirty = true;
        f(&mut inner.doc)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn known_status(&self, id: EntityId) -> Option<String> {
        self.read(|doc| doc.entities.get(&id).map(|s| s.known_status.clone()))
    }

    pub fn known_marker(&self, id: EntityId) -> Option<String> {
        self.read(|doc| {
            doc.entities
                .get(&id)
                .map(|s| s.known_secondary_marker.clone())
        })
    }

    pub fn expires_at(&self, id: EntityId) -> Option<DateTime<Utc>> {
        self.read(|doc| doc.entities.get(&id).and_then(|s| s.expires_at))
    }

    pub fn is_tracked(&self, id: EntityId) -> bool {
        self.read(|doc| doc.entities.contains_key(&id))
    }

    pub fn is_retired(&self, id: EntityId) -> bool {
        self.read(|doc| doc.retired.contains_key(&id))
    }

    pub fn tracked_count(&self) -> usize {
        self.read(|doc| doc.entities.len())
    }

    pub fn crm_cursor(&self) -> Option<i64> {
        self.read(|doc| doc.crm_cursor)
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Ids whose expiry is at or before `now`.
    pub fn due_for_expiry(&self, now: DateTime<Utc>) -> Vec<EntityId> {
        self.read(|doc| {
            doc.entities
                .iter()
                .filter(|(_, s)| s.expires_at.is_some_and(|at| at <= now))
                .map(|(id, _)| *id)
                .collect()
        })
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Records the status written for `id`. Ignored for retired ids.
    pub fn remember_status(&self, id: EntityId, status: &str) -> bool {
        self.update(id, |s| s.known_status = status.to_string())
    }

    /// Records the secondary marker seen for `id`. Ignored for retired ids.
    pub fn remember_marker(&self, id: EntityId, marker: &str) -> bool {
        self.update(id, |s| s.known_secondary_marker = marker.to_string())
    }

    /// Arms expiry for `id`. Ignored for retired ids.
    pub fn remember_expiry(&self, id: EntityId, at: DateTime<Utc>) -> bool {
        self.update(id, |s| s.expires_at = Some(at))
    }

    fn update(&self, id: EntityId, f: impl FnOnce(&mut EntityState)) -> bool {
        self.mutate(|doc| {
            if doc.retired.contains_key(&id) {
                debug!(entity_id = %id, "Ignoring update for retired entity");
                return false;
            }
            f(doc.entities.entry(id).or_default());
            true
        })
    }

    /// Seeds state for a row that already existed in the sheet. Only
    /// applies to ids that are neither tracked nor retired.
    pub fn baseline(&self, id: EntityId, status: &str, marker: &str) -> bool {
        if self.is_tracked(id) || self.is_retired(id) {
            return false;
        }
        self.mutate(|doc| {
            doc.entities.insert(
                id,
                EntityState {
                    known_status: status.to_string(),
                    known_secondary_marker: marker.to_string(),
                    expires_at: None,
                },
            );
        });
        true
    }

    /// Drops all state for `id` and retires it permanently.
    pub fn forget(&self, id: EntityId, now: DateTime<Utc>) {
        self.mutate(|doc| {
            doc.entities.remove(&id);
            doc.retired.entry(id).or_insert(now);
        });
    }

    /// Forgets every entity whose expiry passed. Returns the purged ids.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<EntityId> {
        let due = self.due_for_expiry(now);
        for id in &due {
            self.forget(*id, now);
        }
        if !due.is_empty() {
            info!(purged = due.len(), "Expired entities purged");
        }
        due
    }

    pub fn set_crm_cursor(&self, cursor: i64) {
        self.mutate(|doc| doc.crm_cursor = Some(cursor));
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Writes the document if anything changed since the last flush.
    /// Returns whether a write happened.
    pub async fn flush(&self) -> StoreResult<bool> {
        let _serialized = self.flush_lock.lock().await;

        let bytes = {
            let mut inner = self.lock();
            if !inner.dirty {
                return Ok(false);
            }
            let bytes = serde_json::to_vec_pretty(&inner.doc)?;
            inner.dirty = false;
            bytes
        };

        let Some(path) = &self.path else {
            return Ok(false);
        };

        if let Err(e) = write_atomic(path, &bytes).await {
            self.lock().dirty = true;
            return Err(e);
        }

        debug!(path = %path.display(), bytes = bytes.len(), "Flushed sync state");
        Ok(true)
    }

    /// Copy of the current document.
    pub fn document(&self) -> StateDocument {
        self.read(StateDocument::clone)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
