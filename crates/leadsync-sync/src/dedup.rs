//! # Dedup Window
//!
//! The CRM delivers webhooks at least once and the catch-up poll re-reads
//! events the webhook already delivered. Both feed the same
//! `(entity, status)` pairs through this window.
//!
//! ```text
//!   t=0   (555, B) ──► first time    ──► process, remember t=0
//!   t=30  (555, B) ──► within TTL    ──► drop
//!   t=400 (555, B) ──► TTL elapsed   ──► process, remember t=400
//!   every check evicts entries older than 2 × TTL
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use leadsync_core::{EntityId, StatusId};

#[derive(Debug)]
pub struct DedupWindow {
    ttl: Duration,
    seen: Mutex<HashMap<(EntityId, StatusId), DateTime<Utc>>>,
}

impl DedupWindow {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// True when the pair was processed less than TTL ago. Otherwise records
    /// `now` for the pair and returns false.
    pub fn is_duplicate(&self, id: EntityId, status: StatusId, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());

        let horizon = now - self.ttl * 2;
        seen.retain(|_, at| *at >= horizon);

        if let Some(at) = seen.get(&(id, status)) {
            if now - *at < self.ttl {
                return true;
            }
        }
        seen.insert((id, status), now);
        false
    }

    /// Drops the record for a pair whose processing failed, so a redelivery
    /// is not mistaken for a duplicate.
    pub fn release(&self, id: EntityId, status: StatusId) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(id, status));
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn pair() -> (EntityId, StatusId) {
        (EntityId::new(555), StatusId::new(42))
    }

    #[test]
    fn test_suppresses_within_ttl() {
        let window = DedupWindow::new(Duration::seconds(300));
        let (id, status) = pair();
        assert!(!window.is_duplicate(id, status, t(0)));
        assert!(window.is_duplicate(id, status, t(30)));
        assert!(window.is_duplicate(id, status, t(299)));
        assert!(!window.is_duplicate(id, status, t(300)));
    }

    #[test]
    fn test_different_status_is_not_duplicate() {
        let window = DedupWindow::new(Duration::seconds(300));
        let (id, status) = pair();
        assert!(!window.is_duplicate(id, status, t(0)));
        assert!(!window.is_duplicate(id, StatusId::new(43), t(1)));
    }

    #[test]
    fn test_old_entries_are_evicted() {
        let window = DedupWindow::new(Duration::seconds(100));
        assert!(!window.is_duplicate(EntityId::new(1), StatusId::new(1), t(0)));
        assert!(!window.is_duplicate(EntityId::new(2), StatusId::new(1), t(150)));
        assert_eq!(window.len(), 2);
        assert!(!window.is_duplicate(EntityId::new(3), StatusId::new(1), t(201)));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_release_allows_redelivery() {
        let window = DedupWindow::new(Duration::seconds(300));
        let (id, status) = pair();
        assert!(!window.is_duplicate(id, status, t(0)));
        window.release(id, status);
        assert!(!window.is_duplicate(id, status, t(1)));
    }
}
