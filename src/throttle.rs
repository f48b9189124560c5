//! Write-through throttle from live readings to the durable store.
//!
//! Live state sees every reading; the durable store sees at most one per node
//! per write interval. The slot is claimed synchronously before the write is
//! spawned, so a slow database cannot let a second write for the same node
//! slip into the same window.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::alert::Thresholds;
use crate::models::{LiveReading, Location};
use crate::store::{DurableStore, NewReading, StoreError};

// ---

/// Per-node record of the last durable write attempt.
#[derive(Debug)]
pub struct WriteThrottle {
    // ---
    interval: TimeDelta,
    last_save: DashMap<String, DateTime<Utc>>,
}

impl WriteThrottle {
    // ---
    pub fn new(interval: TimeDelta) -> Self {
        Self {
            interval,
            last_save: DashMap::new(),
        }
    }

    /// Claim the durable write slot for `node_id` if the interval has elapsed.
    ///
    /// On success the node's last-save time is set to `now` before returning.
    pub fn try_claim(&self, node_id: &str, now: DateTime<Utc>) -> bool {
        // ---
        match self.last_save.entry(node_id.to_string()) {
            Entry::Occupied(mut last) => {
                if now.signed_duration_since(*last.get()) < self.interval {
                    return false;
                }
                last.insert(now);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }
}

/// What the persister needs to know about lazily created nodes and pruning.
#[derive(Debug, Clone, Copy)]
pub struct PersistPolicy {
    pub default_location: Location,
    pub retain_rows: u32,
}

/// Spawns throttled durable writes and keeps track of the ones in flight.
pub struct Persister {
    // ---
    store: Arc<dyn DurableStore>,
    thresholds: Arc<Thresholds>,
    throttle: WriteThrottle,
    policy: PersistPolicy,
    in_flight: Mutex<JoinSet<()>>,
}

impl Persister {
    // ---
    pub fn new(
        store: Arc<dyn DurableStore>,
        thresholds: Arc<Thresholds>,
        interval: TimeDelta,
        policy: PersistPolicy,
    ) -> Self {
        Self {
            store,
            thresholds,
            throttle: WriteThrottle::new(interval),
            policy,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    /// Schedule a durable write for `reading` if its node's window allows.
    ///
    /// Returns `true` when a write was scheduled. Failures of the write itself
    /// are logged and never reach the caller.
    pub fn maybe_persist(&self, reading: &LiveReading, now: DateTime<Utc>) -> bool {
        // ---
        if !self.throttle.try_claim(&reading.node_id, now) {
            return false;
        }

        let store = Arc::clone(&self.store);
        let thresholds = Arc::clone(&self.thresholds);
        let policy = self.policy;
        let reading = reading.clone();

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // reap finished writes so the set only holds live ones
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            if let Err(e) = persist(store.as_ref(), &thresholds, policy, &reading).await {
                match e {
                    StoreError::Unavailable(_) => {
                        warn!("Durable store unavailable, skipping {}: {}", reading.node_id, e)
                    }
                    StoreError::Database(_) => {
                        error!("Error persisting {} to database: {}", reading.node_id, e)
                    }
                }
            }
        });

        true
    }

    pub fn in_flight(&self) -> usize {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while in_flight.try_join_next().is_some() {}
        in_flight.len()
    }

    /// Wait up to `grace` for outstanding writes; abandons whatever is left.
    ///
    /// Returns the number of writes that did not finish in time.
    pub async fn drain(&self, grace: Duration) -> usize {
        // ---
        let mut pending = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *in_flight)
        };
        if pending.is_empty() {
            return 0;
        }

        debug!("Waiting for {} durable writes", pending.len());
        let drained = tokio::time::timeout(grace, async {
            while pending.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            let abandoned = pending.len();
            warn!("Abandoning {} durable writes after {:?}", abandoned, grace);
            pending.abort_all();
            return abandoned;
        }
        0
    }
}

/// Find-or-create the node, insert the reading, prune old rows.
async fn persist(
    store: &dyn DurableStore,
    thresholds: &Thresholds,
    policy: PersistPolicy,
    reading: &LiveReading,
) -> Result<(), StoreError> {
    // ---
    let node = store
        .find_or_create_node(
            &reading.node_id,
            policy.default_location,
            thresholds.default_threshold(),
        )
        .await?;
    thresholds.set_node_threshold(&node.name, node.threshold);

    store
        .insert_reading(&NewReading {
            node_id: node.node_id,
            water_level: reading.water_level,
            // no flow sensor feed yet
            flow_rate: 0.0,
            timestamp: reading.timestamp,
            confirmed_alert: reading.confirmed_alert,
        })
        .await?;

    let pruned = store
        .delete_readings_beyond(node.node_id, policy.retain_rows)
        .await?;
    if pruned > 0 {
        debug!("Cleaned up {} old readings for {}", pruned, reading.node_id);
    }

    if reading.confirmed_alert {
        warn!(
            "CONFIRMED ALERT: {} - {}m [{}]",
            reading.node_id, reading.water_level, reading.alert_status
        );
    }
    info!("Saved to database: {}", reading.node_id);

    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::alert::ThresholdPolicy;
    use crate::models::{AlertStatus, ThresholdProfile};
    use crate::store::memory::MemoryStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + TimeDelta::milliseconds(ms)
    }

    fn reading(node_id: &str, ms: i64, confirmed_alert: bool) -> LiveReading {
        LiveReading {
            node_id: node_id.to_string(),
            water_level: 4.7,
            timestamp: at(ms),
            alert_status: AlertStatus::Danger,
            confirmed_alert,
        }
    }

    fn persister(store: Arc<MemoryStore>, retain_rows: u32) -> Persister {
        let thresholds = Arc::new(Thresholds::new(
            ThresholdPolicy::Relative,
            ThresholdProfile::from_threshold(5.0),
            5.0,
        ));
        Persister::new(
            store,
            thresholds,
            TimeDelta::milliseconds(30_000),
            PersistPolicy {
                default_location: Location {
                    latitude: 6.3,
                    longitude: 124.9,
                },
                retain_rows,
            },
        )
    }

    #[test]
    fn test_claim_respects_interval() {
        // ---
        let throttle = WriteThrottle::new(TimeDelta::milliseconds(30_000));
        assert!(throttle.try_claim("node-a", at(0)));
        assert!(!throttle.try_claim("node-a", at(10)));
        assert!(!throttle.try_claim("node-a", at(29_999)));
        assert!(throttle.try_claim("node-a", at(30_000)));
        // window restarts from the last claim
        assert!(!throttle.try_claim("node-a", at(40_000)));
        // other nodes have their own window
        assert!(throttle.try_claim("node-b", at(10)));
    }

    #[tokio::test]
    async fn test_readings_10ms_apart_write_once() {
        // ---
        let store = Arc::new(MemoryStore::default());
        let persister = persister(Arc::clone(&store), 20);

        assert!(persister.maybe_persist(&reading("node-a", 0, false), at(0)));
        assert!(!persister.maybe_persist(&reading("node-a", 10, false), at(10)));
        assert_eq!(persister.drain(Duration::from_secs(1)).await, 0);

        assert_eq!(store.readings().len(), 1);
    }

    #[tokio::test]
    async fn test_readings_40s_apart_write_twice() {
        // ---
        let store = Arc::new(MemoryStore::default());
        let persister = persister(Arc::clone(&store), 20);

        persister.maybe_persist(&reading("node-a", 0, false), at(0));
        persister.maybe_persist(&reading("node-a", 40_000, true), at(40_000));
        persister.drain(Duration::from_secs(1)).await;

        let readings = store.readings();
        assert_eq!(readings.len(), 2);
        assert!(readings.iter().any(|r| r.confirmed_alert));
        assert!(readings.iter().all(|r| r.flow_rate == 0.0));
    }

    #[tokio::test]
    async fn test_unknown_node_created_with_placeholder_location() {
        // ---
        let store = Arc::new(MemoryStore::default());
        let persister = persister(Arc::clone(&store), 20);

        persister.maybe_persist(&reading("Purok 10 River", 0, false), at(0));
        persister.drain(Duration::from_secs(1)).await;

        let nodes = store.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "Purok 10 River");
        assert_eq!(nodes[0].latitude, 6.3);
        assert_eq!(nodes[0].threshold, 5.0);
    }

    #[tokio::test]
    async fn test_old_rows_are_pruned() {
        // ---
        let store = Arc::new(MemoryStore::default());
        let persister = persister(Arc::clone(&store), 3);

        for i in 0..6 {
            let ms = i * 30_000;
            persister.maybe_persist(&reading("node-a", ms, false), at(ms));
            persister.drain(Duration::from_secs(1)).await;
        }

        let readings = store.readings();
        assert_eq!(readings.len(), 3);
        let oldest_kept = readings.iter().map(|r| r.timestamp).min().unwrap();
        assert_eq!(oldest_kept, at(90_000));
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_write_despite_device_clock() {
        // ---
        let store = Arc::new(MemoryStore::default());
        let persister = persister(Arc::clone(&store), 2);

        // the third device clock was reset and lags the first two
        for (i, device_ms) in [100_000, 200_000, 50_000].into_iter().enumerate() {
            let now = at(i as i64 * 30_000);
            persister.maybe_persist(&reading("node-a", device_ms, false), now);
            persister.drain(Duration::from_secs(1)).await;
        }

        let mut kept: Vec<_> = store.readings().iter().map(|r| r.timestamp).collect();
        kept.sort();
        assert_eq!(kept, vec![at(50_000), at(200_000)]);

        let latest = store.latest_reading("node-a").await.unwrap().unwrap();
        assert_eq!(latest.timestamp, at(50_000));
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        // ---
        let store = Arc::new(MemoryStore::default());
        store.set_failing(true);
        let persister = persister(Arc::clone(&store), 20);

        assert!(persister.maybe_persist(&reading("node-a", 0, false), at(0)));
        persister.drain(Duration::from_secs(1)).await;
        assert!(store.readings().is_empty());

        // the next window retries once the store is back
        store.set_failing(false);
        assert!(persister.maybe_persist(&reading("node-a", 30_000, false), at(30_000)));
        persister.drain(Duration::from_secs(1)).await;
        assert_eq!(store.readings().len(), 1);
        assert_eq!(persister.in_flight(), 0);
    }
}
