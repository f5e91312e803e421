//! Per-lead serialization of the push and pull paths.
//!
//! A sheet edit is PATCHed to the CRM, which answers with a webhook for the
//! same lead. Both paths read and write `known_status`, so each holds the
//! lead's lock from its first read to its last write.
//!
//! ```text
//!   pull(555): lock ─► GET ─► PATCH ─────────► remember ─► unlock
//!   push(555):              lock (waits) ──────────────────────► re-fetch ─► guard
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use leadsync_core::EntityId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub(super) struct EntityLocks {
    slots: Mutex<HashMap<EntityId, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    /// Waits for the lead's lock. Slots nobody holds or waits on are dropped
    /// on the way in.
    pub(super) async fn acquire(&self, id: EntityId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(id).or_default().clone()
        };
        slot.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
