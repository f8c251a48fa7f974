//! # Snapshot Publisher
//!
//! Batched presentation output. Readers never see per-sample updates; they
//! get at most one snapshot per `publish_interval`, and only when the store
//! changed since the last one.
//!
//! ```text
//!   tick (100ms) ──► store.generation() == last? ── yes ──► skip
//!                                 │
//!                                 no
//!                                 ▼
//!                    store.summaries() ──► watch::Sender<InventorySnapshot>
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use portal_store::{InventoryStore, SessionPhase, TagSummary};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One published view of the inventory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InventorySnapshot {
    pub generation: u64,
    pub taken_at: DateTime<Utc>,
    pub session: SessionPhase,
    pub unique_tags: usize,
    pub detected_tags: usize,
    pub total_reads: u64,
    pub tags: Vec<TagSummary>,
}

impl InventorySnapshot {
    pub fn capture(store: &InventoryStore) -> Self {
        // Read the generation first: a write racing the copy makes the next
        // tick publish again rather than being missed.
        let generation = store.generation();
        let tags = store.summaries();
        InventorySnapshot {
            generation,
            taken_at: Utc::now(),
            session: store.session_status().phase,
            unique_tags: tags.len(),
            detected_tags: tags.iter().filter(|t| t.detected).count(),
            total_reads: store.total_reads(),
            tags,
        }
    }
}

/// Periodic snapshot task.
pub struct SnapshotPublisher {
    task: JoinHandle<()>,
    snapshots: watch::Receiver<InventorySnapshot>,
}

impl SnapshotPublisher {
    /// Starts publishing `store` every `interval`.
    pub fn spawn(store: Arc<InventoryStore>, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(InventorySnapshot::capture(&store));
        let task = tokio::spawn(publish_loop(store, interval, tx));
        SnapshotPublisher {
            task,
            snapshots: rx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<InventorySnapshot> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> InventorySnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

async fn publish_loop(
    store: Arc<InventoryStore>,
    interval: Duration,
    tx: watch::Sender<InventorySnapshot>,
) {
    info!(interval_ms = interval.as_millis() as u64, "Snapshot publisher started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last = tx.borrow().generation;

    loop {
        ticker.tick().await;
        if store.generation() == last {
            continue;
        }

        let snapshot = InventorySnapshot::capture(&store);
        last = snapshot.generation;
        debug!(
            generation = snapshot.generation,
            tags = snapshot.unique_tags,
            reads = snapshot.total_reads,
            "Publishing snapshot"
        );
        if tx.send(snapshot).is_err() {
            debug!("All snapshot subscribers gone");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_core::{AntennaId, ReaderConfig, RssiSample, TagIdentity};
    use std::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_publishes_only_on_change() {
        let store = Arc::new(InventoryStore::default());
        let publisher = SnapshotPublisher::spawn(store.clone(), Duration::from_millis(100));
        let mut rx = publisher.subscribe();
        rx.borrow_and_update();

        // Nothing changed: no publication.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!rx.has_changed().unwrap());

        store.begin_session(ReaderConfig::default()).unwrap();
        let epc: TagIdentity = "E200AA".parse().unwrap();
        for i in 0..50 {
            store
                .upsert(epc.clone(), RssiSample::new(AntennaId::ONE, -60 + (i % 3), Instant::now()))
                .unwrap();
        }

        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.unique_tags, 1);
        assert_eq!(snapshot.total_reads, 50);
        assert_eq!(snapshot.session, SessionPhase::Running);
        assert_eq!(snapshot.tags[0].epc, epc);

        // 50 upserts, one snapshot.
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!rx.has_changed().unwrap());

        publisher.stop();
    }
}
