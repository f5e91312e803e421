//! Staff directory: staff code → display name, read from the staff partition.
//!
//! The partition has a header row followed by `code | name` rows. Codes are
//! stored with leading zeros stripped so "0100" on a lead matches "100".

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use leadsync_core::row::normalize_staff_code;
use leadsync_store::{Grid, IndexedTableStore};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub type StaffMap = Arc<HashMap<String, String>>;

struct Cached {
    map: StaffMap,
    loaded_at: DateTime<Utc>,
}

pub struct StaffDirectory {
    partition: String,
    ttl: Duration,
    cache: Mutex<Option<Cached>>,
}

impl StaffDirectory {
    pub fn new(partition: impl Into<String>, ttl: Duration) -> Self {
        Self {
            partition: partition.into(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    /// Current mapping. Re-read once the TTL elapsed (or while the cached map
    /// is empty). A failed read returns whatever was cached before.
    pub async fn mapping(&self, store: &IndexedTableStore, now: DateTime<Utc>) -> StaffMap {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if !cached.map.is_empty() && now - cached.loaded_at < self.ttl {
                return cached.map.clone();
            }
        }

        match store.read_lookup(&self.partition).await {
            Ok(grid) => {
                let map: StaffMap = Arc::new(parse_staff(&grid));
                debug!(partition = %self.partition, entries = map.len(), "Loaded staff directory");
                *cache = Some(Cached {
                    map: map.clone(),
                    loaded_at: now,
                });
                map
            }
            Err(e) => {
                warn!(partition = %self.partition, error = %e, "Could not load staff directory, using cached copy");
                cache
                    .as_ref()
                    .map(|c| c.map.clone())
                    .unwrap_or_default()
            }
        }
    }
}

fn parse_staff(grid: &Grid) -> HashMap<String, String> {
    grid.iter()
        .skip(1)
        .filter_map(|row| {
            let code = row.first()?.trim();
            let name = row.get(1)?.trim();
            if code.is_empty() || name.is_empty() {
                return None;
            }
            Some((normalize_staff_code(code), name.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use leadsync_core::TableSchema;
    use leadsync_store::MemoryBackend;

    fn grid(rows: &[(&str, &str)]) -> Grid {
        let mut grid = vec![vec!["Код сотрудника".to_string(), "Имя".to_string()]];
        grid.extend(rows.iter().map(|(c, n)| vec![c.to_string(), n.to_string()]));
        grid
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_normalizes_codes_and_skips_incomplete_rows() {
        let map = parse_staff(&grid(&[("0100", "Нилуфар"), ("", "Nobody"), ("7", ""), ("A1", "Ali")]));
        assert_eq!(map.len(), 2);
        assert_eq!(map["100"], "Нилуфар");
        assert_eq!(map["A1"], "Ali");
    }

    #[tokio::test]
    async fn test_cached_until_ttl_then_reloaded() {
        let backend = Arc::new(MemoryBackend::with_partition("Staff", grid(&[("5", "Мунира")])));
        let store = IndexedTableStore::new(backend.clone(), TableSchema::default(), "Sheet1", vec![]);
        let staff = StaffDirectory::new("Staff", Duration::seconds(300));

        assert_eq!(staff.mapping(&store, t0()).await["5"], "Мунира");
        backend.set_cell("Staff", 2, 2, "Мунира К.");
        assert_eq!(staff.mapping(&store, t0() + Duration::seconds(10)).await["5"], "Мунира");
        assert_eq!(backend.read_count(), 1);

        let reloaded = staff.mapping(&store, t0() + Duration::seconds(301)).await;
        assert_eq!(reloaded["5"], "Мунира К.");
    }

    #[tokio::test]
    async fn test_read_failure_returns_stale_copy() {
        let backend = Arc::new(MemoryBackend::with_partition("Staff", grid(&[("5", "Мунира")])));
        let store = IndexedTableStore::new(backend.clone(), TableSchema::default(), "Sheet1", vec![]);
        let staff = StaffDirectory::new("Staff", Duration::seconds(60));

        staff.mapping(&store, t0()).await;
        backend.fail_next_with_quota(1);
        let stale = staff.mapping(&store, t0() + Duration::seconds(120)).await;
        assert_eq!(stale["5"], "Мунира");
    }
}
