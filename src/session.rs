//! The ingestion session: owns all per-node pipeline state.
//!
//! One `Session` is built at startup and shared with the HTTP layer. Tests
//! build a fresh one each, so there are no process-wide singletons.
//!
//! Readings for the same node pass through a per-node lane (an async mutex)
//! so that confirmation timers, live history and broadcast order all follow
//! arrival order. Different nodes never contend with each other.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::alert::{self, ThresholdPolicy, Thresholds};
use crate::confirm::ConfirmationTracker;
use crate::hub::{BroadcastHub, HubMessage};
use crate::live_store::LiveStore;
use crate::models::{IncomingReading, LiveReading};
use crate::store::DurableStore;
use crate::throttle::{PersistPolicy, Persister};
use crate::Config;

// ---

pub struct Session {
    // ---
    thresholds: Arc<Thresholds>,
    tracker: ConfirmationTracker,
    live: Arc<LiveStore>,
    hub: BroadcastHub,
    persister: Persister,
    lanes: DashMap<String, Arc<Mutex<()>>>,
}

impl Session {
    // ---
    pub fn new(cfg: &Config, store: Arc<dyn DurableStore>, live: Arc<LiveStore>) -> Self {
        // ---
        let thresholds = Arc::new(Thresholds::from_config(cfg));
        let persister = Persister::new(
            store,
            Arc::clone(&thresholds),
            TimeDelta::milliseconds(i64::from(cfg.db_write_interval_ms)),
            PersistPolicy {
                default_location: cfg.default_location,
                retain_rows: cfg.db_retain_rows,
            },
        );

        Self {
            thresholds,
            tracker: ConfirmationTracker::new(TimeDelta::milliseconds(i64::from(
                cfg.confirm_window_ms,
            ))),
            live,
            hub: BroadcastHub::new(cfg.subscriber_buffer),
            persister,
            lanes: DashMap::new(),
        }
    }

    /// Run one reading through the whole pipeline.
    ///
    /// `now` is the processing time used for confirmation and throttling; the
    /// reading's own timestamp (if any) is only what gets reported and stored.
    /// Returns once the live state reflects the reading. Broadcast and durable
    /// writes are handed off without waiting on any subscriber or the database.
    pub async fn ingest(&self, reading: IncomingReading, now: DateTime<Utc>) -> LiveReading {
        // ---
        let lane = self.lane(&reading.node_id);
        let _ordered = lane.lock().await;

        let profile = self.thresholds.profile_for(&reading.node_id);
        let alert_status = alert::classify(reading.water_level, &profile);
        let confirmed_alert = self.tracker.observe(&reading.node_id, alert_status, now);

        let live = LiveReading {
            node_id: reading.node_id,
            water_level: reading.water_level,
            timestamp: reading.timestamp.unwrap_or(now),
            alert_status,
            confirmed_alert,
        };
        debug!(
            "Live: {} {}m [{}]{}",
            live.node_id,
            live.water_level,
            live.alert_status,
            if confirmed_alert { " confirmed" } else { "" }
        );

        self.live.record(live.clone());

        let delivered = self.hub.broadcast(&HubMessage::LiveReading { data: live.clone() });
        debug!("Broadcast {} to {} subscribers", live.node_id, delivered);

        self.persister.maybe_persist(&live, now);

        live
    }

    /// Relative policy only: seed node thresholds from the durable store.
    pub async fn preload_thresholds(&self) {
        // ---
        if self.thresholds.policy() != ThresholdPolicy::Relative {
            return;
        }
        match self.persister.store().node_thresholds().await {
            Ok(rows) => {
                let loaded = self.thresholds.load(rows);
                info!("Loaded thresholds for {} nodes", loaded);
            }
            Err(e) => warn!(
                "Could not load node thresholds, using default for all nodes: {}",
                e
            ),
        }
    }

    /// Wait (bounded) for outstanding durable writes.
    pub async fn shutdown(&self, grace: Duration) {
        // ---
        let abandoned = self.persister.drain(grace).await;
        if abandoned == 0 {
            info!("All durable writes completed");
        }
    }

    pub fn live(&self) -> &LiveStore {
        &self.live
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        self.persister.store()
    }

    pub fn active_alerts(&self) -> usize {
        self.tracker.active_alerts()
    }

    pub fn pending_writes(&self) -> usize {
        self.persister.in_flight()
    }

    fn lane(&self, node_id: &str) -> Arc<Mutex<()>> {
        // ---
        if let Some(lane) = self.lanes.get(node_id) {
            return Arc::clone(lane.value());
        }
        Arc::clone(
            self.lanes
                .entry(node_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::test_config;
    use crate::models::AlertStatus;
    use crate::store::memory::MemoryStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + TimeDelta::milliseconds(ms)
    }

    fn incoming(node_id: &str, water_level: f64) -> IncomingReading {
        IncomingReading {
            node_id: node_id.to_string(),
            water_level,
            timestamp: None,
        }
    }

    fn session_with(cfg: &Config) -> (Session, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let live = Arc::new(LiveStore::new(cfg.history_len));
        (Session::new(cfg, store.clone(), live), store)
    }

    #[tokio::test]
    async fn test_sustained_danger_becomes_confirmed() {
        // ---
        let (session, _) = session_with(&test_config());

        let first = session.ingest(incoming("node-a", 4.8), at(0)).await;
        assert_eq!(first.alert_status, AlertStatus::Danger);
        assert!(!first.confirmed_alert);

        assert!(!session.ingest(incoming("node-a", 4.9), at(4_000)).await.confirmed_alert);
        assert!(session.ingest(incoming("node-a", 4.9), at(5_000)).await.confirmed_alert);
        assert_eq!(session.active_alerts(), 1);

        let back = session.ingest(incoming("node-a", 1.0), at(6_000)).await;
        assert_eq!(back.alert_status, AlertStatus::Normal);
        assert!(!back.confirmed_alert);
        assert_eq!(session.active_alerts(), 0);
    }

    #[tokio::test]
    async fn test_ingest_updates_live_state_and_subscribers() {
        // ---
        let (session, _) = session_with(&test_config());
        let mut subscriber = session.hub().register();

        let live = session.ingest(incoming("node-a", 3.6), at(0)).await;
        assert_eq!(live.timestamp, at(0));

        let record = session.live().get("node-a").unwrap();
        assert_eq!(record.current, live);
        assert_eq!(record.history.len(), 1);

        let pushed = subscriber.recv().await.unwrap();
        assert_eq!(
            HubMessage::parse(&pushed).unwrap(),
            HubMessage::LiveReading { data: live }
        );
    }

    #[tokio::test]
    async fn test_device_timestamp_is_kept() {
        // ---
        let (session, _) = session_with(&test_config());
        let mut reading = incoming("node-a", 1.0);
        reading.timestamp = Some(at(-60_000));

        let live = session.ingest(reading, at(0)).await;
        assert_eq!(live.timestamp, at(-60_000));
    }

    #[tokio::test]
    async fn test_durable_writes_are_throttled() {
        // ---
        let (session, store) = session_with(&test_config());

        session.ingest(incoming("node-a", 2.0), at(0)).await;
        session.ingest(incoming("node-a", 2.1), at(10)).await;
        session.ingest(incoming("node-a", 2.2), at(40_000)).await;
        session.shutdown(Duration::from_secs(1)).await;

        assert_eq!(store.readings().len(), 2);
        assert_eq!(session.live().get("node-a").unwrap().history.len(), 3);
    }

    #[tokio::test]
    async fn test_relative_policy_uses_stored_threshold() {
        // ---
        let mut cfg = test_config();
        cfg.threshold_policy = ThresholdPolicy::Relative;
        let (session, store) = session_with(&cfg);

        store
            .find_or_create_node(
                "tall-bank",
                cfg.default_location,
                10.0,
            )
            .await
            .unwrap();
        session.preload_thresholds().await;

        // 70% of 10.0
        let tall = session.ingest(incoming("tall-bank", 7.0), at(0)).await;
        assert_eq!(tall.alert_status, AlertStatus::Warning);

        // unknown node uses the default 5.0 threshold: 90% is 4.5
        let other = session.ingest(incoming("unknown", 4.5), at(0)).await;
        assert_eq!(other.alert_status, AlertStatus::Danger);
    }

    #[tokio::test]
    async fn test_concurrent_readings_for_one_node_keep_arrival_order() {
        // ---
        let (session, _) = session_with(&test_config());
        let session = Arc::new(session);

        // hold the node's lane so every ingest queues behind it in spawn order
        let lane = session.lane("node-a");
        let held = lane.lock().await;

        let mut handles = Vec::new();
        for i in 0..50 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move {
                session.ingest(incoming("node-a", i as f64), at(i)).await
            }));
            // let the new task run up to the lane before spawning the next
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        }
        assert!(session.live().get("node-a").is_none());

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }

        let record = session.live().get("node-a").unwrap();
        let levels: Vec<f64> = record.history.iter().map(|r| r.water_level).collect();
        let expected: Vec<f64> = (0..50).rev().map(|i| i as f64).collect();
        assert_eq!(levels, expected);
        assert_eq!(record.current.water_level, 49.0);
    }

    #[tokio::test]
    async fn test_other_nodes_do_not_wait_on_a_busy_lane() {
        // ---
        let (session, _) = session_with(&test_config());

        let lane = session.lane("node-a");
        let _held = lane.lock().await;

        let live = tokio::time::timeout(
            Duration::from_secs(1),
            session.ingest(incoming("node-b", 1.0), at(0)),
        )
        .await
        .expect("node-b blocked behind node-a");
        assert_eq!(live.node_id, "node-b");
    }
}
