//! # Poller
//!
//! Background task that drives everything not triggered by a webhook.
//!
//! ## Schedule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Poller Loop                                     │
//! │                                                                         │
//! │  poll tick (poll_interval_secs)                                        │
//! │    ├── engine.poll_table()   sheet → CRM                               │
//! │    └── engine.catch_up()     CRM → sheet (missed webhooks)             │
//! │                                                                         │
//! │  sweep tick (sweep_interval_secs)                                      │
//! │    └── engine.sweep_expired()                                          │
//! │                                                                         │
//! │  systemic failure (auth, quota, 429, connection)                       │
//! │    └── exponential backoff, capped at max_backoff_secs                 │
//! │        reset after the next clean cycle                                │
//! │                                                                         │
//! │  shutdown channel ──► loop exits after the current step                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::ReconciliationEngine;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Poller
// =============================================================================

pub struct Poller {
    engine: Arc<ReconciliationEngine>,
    poll_interval: Duration,
    sweep_interval: Duration,
    max_backoff: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

/// Handle for stopping a running [`Poller`].
#[derive(Clone)]
pub struct PollerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl PollerHandle {
    /// Asks the poller to stop.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }
}

impl Poller {
    pub fn new(engine: Arc<ReconciliationEngine>) -> (Self, PollerHandle) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let settings = &engine.config().sync;

        let poller = Poller {
            poll_interval: settings.poll_interval(),
            sweep_interval: settings.sweep_interval(),
            max_backoff: Duration::from_secs(settings.max_backoff_secs.max(1)),
            engine,
            shutdown_rx,
        };
        (poller, PollerHandle { shutdown_tx })
    }

    /// Runs until shutdown. Spawn as a background task.
    pub async fn run(mut self) {
        info!(
            poll_secs = self.poll_interval.as_secs(),
            sweep_secs = self.sweep_interval.as_secs(),
            "Poller starting"
        );

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = self.create_backoff();

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.cycle().await {
                        Ok(()) => backoff.reset(),
                        Err(e) if e.is_systemic() || e.is_retryable() => {
                            let wait = backoff.next_backoff().unwrap_or(self.max_backoff);
                            warn!(error = %e, ?wait, "Poll cycle failed, backing off");
                            if !self.pause(wait).await {
                                break;
                            }
                        }
                        Err(e) => error!(error = %e, "Poll cycle failed"),
                    }
                }

                _ = sweep.tick() => {
                    let purged = self.engine.sweep_expired().await;
                    if !purged.is_empty() {
                        info!(purged = purged.len(), "Expired entities purged");
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Poller shutting down");
                    break;
                }
            }
        }

        info!("Poller stopped");
    }

    async fn cycle(&self) -> SyncResult<()> {
        let pulled = self.engine.poll_table().await?;
        let caught = self.engine.catch_up().await?;
        debug!(
            rows = pulled.rows_seen,
            status_pushes = pulled.status_pushes,
            caught_up = caught.written,
            "Poll cycle done"
        );
        Ok(())
    }

    /// Sleeps for `wait`. Returns false when shutdown arrived meanwhile.
    async fn pause(&mut self, wait: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = self.shutdown_rx.recv() => {
                info!("Shutdown during backoff");
                false
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        let initial = self.poll_interval.min(self.max_backoff);
        ExponentialBackoff {
            current_interval: initial,
            initial_interval: initial,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Startup
// =============================================================================

/// Runs [`ReconciliationEngine::bootstrap`], retrying quota failures with a
/// linearly growing wait (`attempt × wait`). Other errors are returned at once.
pub async fn bootstrap_with_retry(
    engine: &ReconciliationEngine,
    attempts: u32,
    wait: Duration,
) -> SyncResult<usize> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match engine.bootstrap().await {
            Ok(adopted) => return Ok(adopted),
            Err(e @ SyncError::Quota(_)) if attempt < attempts => {
                let delay = wait * attempt;
                warn!(attempt, ?delay, error = %e, "Bootstrap hit table quota, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use leadsync_core::{Contact, ContactId, EntityId, Lead, Pipeline, StatusChangeEvent, User};
    use leadsync_store::{MemoryBackend, SyncStateStore};

    use crate::client::{CrmApi, DateField, LeadPatch};
    use crate::clock::{Clock, ManualClock};
    use crate::config::SyncConfig;

    /// A CRM with nothing in it.
    struct EmptyCrm;

    #[async_trait]
    impl CrmApi for EmptyCrm {
        async fn get_lead(&self, id: EntityId) -> SyncResult<Lead> {
            Err(SyncError::NotFound(format!("lead {}", id)))
        }
        async fn get_contact(&self, id: ContactId) -> SyncResult<Contact> {
            Err(SyncError::NotFound(format!("contact {}", id)))
        }
        async fn leads_between(&self, _: DateField, _: i64, _: i64) -> SyncResult<Vec<Lead>> {
            Ok(Vec::new())
        }
        async fn status_change_events(&self, _: i64, _: i64) -> SyncResult<Vec<StatusChangeEvent>> {
            Ok(Vec::new())
        }
        async fn patch_lead(&self, _: EntityId, _: &LeadPatch) -> SyncResult<()> {
            Ok(())
        }
        async fn pipelines(&self) -> SyncResult<Vec<Pipeline>> {
            Ok(Vec::new())
        }
        async fn users(&self) -> SyncResult<Vec<User>> {
            Ok(Vec::new())
        }
    }

    fn engine(backend: Arc<MemoryBackend>, clock: Arc<ManualClock>) -> Arc<ReconciliationEngine> {
        let mut config = SyncConfig::default();
        config.sync.poll_interval_secs = 60;
        config.sync.sweep_interval_secs = 300;
        config.sync.max_backoff_secs = 120;
        config.sync.expiry_secs.insert("Отказ".into(), 60);
        Arc::new(
            ReconciliationEngine::new(
                config,
                Arc::new(EmptyCrm),
                backend,
                SyncStateStore::in_memory(),
                clock,
            )
            .unwrap(),
        )
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_retries_quota_then_succeeds() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(backend.clone(), clock());
        backend.fail_next_with_quota(2);

        let started = tokio::time::Instant::now();
        let adopted = bootstrap_with_retry(&engine, 3, Duration::from_secs(5)).await.unwrap();

        assert_eq!(adopted, 0);
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_gives_up_after_attempts() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(backend.clone(), clock());
        backend.fail_next_with_quota(5);

        let err = bootstrap_with_retry(&engine, 2, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Quota(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_interval_until_shutdown() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(backend.clone(), clock());
        let (poller, handle) = Poller::new(engine.clone());
        let task = tokio::spawn(poller.run());

        tokio::time::sleep(Duration::from_secs(125)).await;
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(backend.read_count() >= 3);
        assert!(engine.state().crm_cursor().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_backs_off_and_recovers() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(backend.clone(), clock());
        backend.fail_next_with_quota(2);
        let (poller, handle) = Poller::new(engine);
        let task = tokio::spawn(poller.run());

        // Failures at t=0 and at t in [60s, 90s]; the second backoff is at
        // least 60s (120s with ±50% jitter), so nothing is read before 120s.
        tokio::time::sleep(Duration::from_secs(110)).await;
        assert_eq!(backend.read_count(), 0);
        assert!(backend.partitions().is_empty());

        // Third attempt lands by 270s, the next regular tick 60s after it.
        tokio::time::sleep(Duration::from_secs(290)).await;
        assert!(backend.read_count() >= 2);
        assert!(backend.partitions().contains(&"Sheet1".to_string()));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_backoff_starts_at_poll_interval_and_caps() {
        let (poller, _handle) = Poller::new(engine(Arc::new(MemoryBackend::new()), clock()));
        let mut backoff = poller.create_backoff();

        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_secs(30) && first <= Duration::from_secs(90));
        for _ in 0..5 {
            assert!(backoff.next_backoff().unwrap() <= Duration::from_secs(180));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_purges_expired_entities() {
        let backend = Arc::new(MemoryBackend::new());
        let clock = clock();
        let engine = engine(backend, clock.clone());
        let id = EntityId::new(555);
        engine.state().remember_status(id, "Отказ");
        engine
            .state()
            .remember_expiry(id, clock.now() + chrono::Duration::seconds(60));
        clock.advance(chrono::Duration::seconds(61));

        let (poller, handle) = Poller::new(engine.clone());
        let task = tokio::spawn(poller.run());
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(!engine.state().is_tracked(id));
        assert!(engine.state().is_retired(id));
    }
}
