//! # Inventory Store
//!
//! Authoritative map of every tag seen in the current session.
//!
//! ## Thread Safety
//! The store is shared as `Arc<InventoryStore>`:
//! 1. The engine's processing task is the only writer (`upsert`)
//! 2. The snapshot publisher and the CLI only read
//! 3. Records and session state sit under one `RwLock`, so a snapshot never
//!    mixes two points in time
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Store Operations                                     │
//! │                                                                         │
//! │  Caller              Operation            Lock     Effect               │
//! │  ──────              ─────────            ────     ──────               │
//! │  engine ───────────► begin_session()      write    Idle/Stopped→Running │
//! │  engine ───────────► upsert(tag, sample)  write    record + votes       │
//! │  engine ───────────► end_session(reason)  write    Running→Stopped      │
//! │  publisher ────────► summaries()          read     point-in-time rows   │
//! │  operator ─────────► clear()              write    Stopped→Idle, empty  │
//! │                                                                         │
//! │  Every write bumps `generation`; readers poll it to skip unchanged      │
//! │  snapshots.                                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use portal_core::analyzer::{AnalyzerConfig, SignalAnalyzer, VoteVector};
use portal_core::{AntennaMask, ReaderConfig, RssiSample, TagIdentity};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::record::{TagRecord, TagSummary};
use crate::session::{SessionPhase, SessionState, SessionStatus, StopReason};
use crate::DEFAULT_MAX_TAGS;

// =============================================================================
// Configuration
// =============================================================================

/// Store limits and analysis thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreConfig {
    pub analyzer: AnalyzerConfig,
    /// Distinct tags accepted per session before `CapacityExceeded`.
    pub max_tags: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            analyzer: AnalyzerConfig::default(),
            max_tags: DEFAULT_MAX_TAGS,
        }
    }
}

// =============================================================================
// Upsert Outcome
// =============================================================================

/// What one sample did to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// The tag was seen for the first time.
    pub is_new: bool,
    pub votes: VoteVector,
    pub detected: bool,
    /// `detected` flipped from false to true on this sample.
    pub became_detected: bool,
    pub read_count: u64,
}

// =============================================================================
// Store
// =============================================================================

struct Inner {
    records: HashMap<TagIdentity, TagRecord>,
    session: SessionState,
    analyzer: SignalAnalyzer,
    next_sequence: u64,
    total_reads: u64,
    generation: u64,
}

/// Thread-safe tag inventory.
pub struct InventoryStore {
    config: StoreConfig,
    inner: RwLock<Inner>,
}

impl InventoryStore {
    pub fn new(config: StoreConfig) -> Self {
        InventoryStore {
            config,
            inner: RwLock::new(Inner {
                records: HashMap::new(),
                session: SessionState::Idle,
                analyzer: SignalAnalyzer::new(config.analyzer, AntennaMask::default()),
                next_sequence: 0,
                total_reads: 0,
                generation: 0,
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // A panic while holding the lock cannot leave a record half-written:
    // every mutation is computed before it is stored.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Session Lifecycle
    // =========================================================================

    /// Enters `Running` under `config`. Records from a stopped session are
    /// kept with their counters, but their RSSI windows and votes start over:
    /// a new session detects tags from its own samples only. Call `clear()`
    /// first for a fresh inventory.
    pub fn begin_session(&self, config: ReaderConfig) -> StoreResult<()> {
        let mut guard = self.write();
        let inner = &mut *guard;
        if inner.session.phase() == SessionPhase::Running {
            return Err(StoreError::SessionRunning);
        }

        inner.analyzer = SignalAnalyzer::new(self.config.analyzer, config.antennas);
        for record in inner.records.values_mut() {
            record.signal = inner.analyzer.new_signal();
        }
        info!(
            antennas = %config.antennas,
            session = %config.session,
            target = %config.target,
            power_dbm = config.power_dbm.get(),
            region = %config.region,
            "Inventory session started"
        );
        inner.session = SessionState::Running {
            config,
            started_at: Utc::now(),
        };
        inner.generation += 1;
        Ok(())
    }

    /// Leaves `Running`. Inventory data is preserved.
    pub fn end_session(&self, reason: StopReason) -> StoreResult<SessionStatus> {
        let mut inner = self.write();
        let (config, started_at) = match &inner.session {
            SessionState::Running { config, started_at } => (config.clone(), *started_at),
            other => {
                return Err(StoreError::SessionNotRunning {
                    phase: other.phase(),
                })
            }
        };

        if reason.is_failure() {
            warn!(%reason, tags = inner.records.len(), "Inventory session stopped");
        } else {
            info!(%reason, tags = inner.records.len(), "Inventory session stopped");
        }

        inner.session = SessionState::Stopped {
            config,
            started_at,
            stopped_at: Utc::now(),
            reason,
        };
        inner.generation += 1;
        Ok(inner.session.status())
    }

    pub fn session_status(&self) -> SessionStatus {
        self.read().session.status()
    }

    pub fn is_running(&self) -> bool {
        self.read().session.phase() == SessionPhase::Running
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Records one RSSI sample for `tag`, creating its record on first sight.
    /// Placeholder EPCs are rejected.
    pub fn upsert(&self, tag: TagIdentity, sample: RssiSample) -> StoreResult<UpsertOutcome> {
        let mut guard = self.write();
        let inner = &mut *guard;

        let phase = inner.session.phase();
        if phase != SessionPhase::Running {
            return Err(StoreError::SessionNotRunning { phase });
        }
        if tag.is_placeholder() {
            return Err(StoreError::PlaceholderTag { epc: tag });
        }

        let now = Utc::now();
        let is_new = !inner.records.contains_key(&tag);
        if is_new && inner.records.len() >= self.config.max_tags {
            return Err(StoreError::CapacityExceeded {
                max: self.config.max_tags,
            });
        }

        let record = inner.records.entry(tag).or_insert_with_key(|tag| {
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;
            debug!(epc = %tag, antenna = %sample.antenna, rssi = sample.rssi, "New tag");
            TagRecord::new(tag.clone(), inner.analyzer.new_signal(), sequence, &sample, now)
        });

        let was_detected = record.detected();
        let votes = inner.analyzer.ingest(&mut record.signal, sample);
        record.touch(&sample, now);

        let detected = votes.detected();
        let became_detected = detected && !was_detected;
        if became_detected {
            info!(
                epc = %record.identity,
                reads = record.read_count,
                ant1 = votes.ant1,
                ant2 = votes.ant2,
                combined = votes.combined,
                "Tag detected"
            );
        }

        let outcome = UpsertOutcome {
            is_new,
            votes,
            detected,
            became_detected,
            read_count: record.read_count,
        };
        inner.total_reads += 1;
        inner.generation += 1;
        Ok(outcome)
    }

    /// Point-in-time copy of every record, ordered by first sighting.
    pub fn snapshot(&self) -> Vec<TagRecord> {
        let inner = self.read();
        let mut records: Vec<TagRecord> = inner.records.values().cloned().collect();
        records.sort_by_key(|r| (r.first_seen, r.sequence));
        records
    }

    /// Point-in-time summary rows, ordered by first sighting.
    pub fn summaries(&self) -> Vec<TagSummary> {
        let inner = self.read();
        let mut records: Vec<&TagRecord> = inner.records.values().collect();
        records.sort_by_key(|r| (r.first_seen, r.sequence));
        records.into_iter().map(TagRecord::summary).collect()
    }

    pub fn get(&self, tag: &TagIdentity) -> Option<TagRecord> {
        self.read().records.get(tag).cloned()
    }

    /// Identities of detected tags, ordered by first sighting.
    pub fn detected_tags(&self) -> Vec<TagIdentity> {
        self.snapshot()
            .into_iter()
            .filter(TagRecord::detected)
            .map(|r| r.identity)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    /// Samples accepted since the last `clear()`.
    pub fn total_reads(&self) -> u64 {
        self.read().total_reads
    }

    /// Changes on every mutation.
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Empties the inventory. Not allowed while running.
    ///
    /// Returns the number of records removed.
    pub fn clear(&self) -> StoreResult<usize> {
        let mut inner = self.write();
        if inner.session.phase() == SessionPhase::Running {
            return Err(StoreError::SessionRunning);
        }

        let removed = inner.records.len();
        inner.records.clear();
        inner.session = SessionState::Idle;
        inner.next_sequence = 0;
        inner.total_reads = 0;
        inner.generation += 1;
        info!(removed, "Inventory cleared");
        Ok(removed)
    }
}

impl Default for InventoryStore {
    fn default() -> Self {
        InventoryStore::new(StoreConfig::default())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use portal_core::AntennaId;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn tag(hex: &str) -> TagIdentity {
        hex.parse().unwrap()
    }

    fn sample(antenna: AntennaId, rssi: i16, at: Instant) -> RssiSample {
        RssiSample::new(antenna, rssi, at)
    }

    fn running_store() -> InventoryStore {
        let store = InventoryStore::default();
        store.begin_session(ReaderConfig::default()).unwrap();
        store
    }

    /// Feeds a clean ramp on antennas 1 and 2; detection needs both.
    fn feed_ramp(store: &InventoryStore, epc: &TagIdentity, t0: Instant) -> Vec<UpsertOutcome> {
        let ramp = [-60, -58, -55, -52];
        let mut outcomes = Vec::new();
        for (i, rssi) in ramp.iter().enumerate() {
            let at = t0 + Duration::from_millis(100 * i as u64);
            outcomes.push(store.upsert(epc.clone(), sample(AntennaId::ONE, *rssi, at)).unwrap());
            outcomes.push(
                store
                    .upsert(epc.clone(), sample(AntennaId::TWO, *rssi, at + Duration::from_millis(50)))
                    .unwrap(),
            );
        }
        outcomes
    }

    #[test]
    fn test_upsert_requires_running_session() {
        let store = InventoryStore::default();
        let err = store
            .upsert(tag("AAAA"), sample(AntennaId::ONE, -50, Instant::now()))
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::SessionNotRunning {
                phase: SessionPhase::Idle
            }
        );
    }

    #[test]
    fn test_first_upsert_creates_record() {
        let store = running_store();
        let t0 = Instant::now();

        let first = store.upsert(tag("AAAA"), sample(AntennaId::ONE, -50, t0)).unwrap();
        assert!(first.is_new);
        assert!(!first.detected);
        assert_eq!(first.read_count, 1);

        let second = store
            .upsert(tag("AAAA"), sample(AntennaId::TWO, -48, t0 + Duration::from_millis(20)))
            .unwrap();
        assert!(!second.is_new);
        assert_eq!(second.read_count, 2);

        let record = store.get(&tag("AAAA")).unwrap();
        assert_eq!(record.last_antenna(), AntennaId::TWO);
        assert_eq!(record.last_rssi(), -48);
        assert_eq!(store.len(), 1);
        assert_eq!(store.total_reads(), 2);
    }

    #[test]
    fn test_became_detected_fires_once() {
        let store = running_store();
        let epc = tag("E2801160");
        let outcomes = feed_ramp(&store, &epc, Instant::now());

        let flips: Vec<_> = outcomes.iter().filter(|o| o.became_detected).collect();
        assert_eq!(flips.len(), 1);
        assert!(outcomes.last().unwrap().detected);
        assert!(store.get(&epc).unwrap().detected());
        assert_eq!(store.detected_tags(), vec![epc]);
    }

    #[test]
    fn test_detected_matches_votes_after_every_sample() {
        let store = running_store();
        for outcome in feed_ramp(&store, &tag("BEEF"), Instant::now()) {
            assert_eq!(outcome.detected, outcome.votes.passes() >= 2);
        }
    }

    #[test]
    fn test_snapshot_ordered_by_first_seen() {
        let store = running_store();
        let t0 = Instant::now();
        store.upsert(tag("0002"), sample(AntennaId::ONE, -50, t0 + Duration::from_millis(5))).unwrap();
        store.upsert(tag("0001"), sample(AntennaId::ONE, -50, t0)).unwrap();
        store.upsert(tag("0003"), sample(AntennaId::ONE, -50, t0)).unwrap();

        let order: Vec<String> = store.snapshot().iter().map(|r| r.identity().to_string()).collect();
        assert_eq!(order, vec!["0001", "0003", "0002"]);

        let rows = store.summaries();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].epc, tag("0001"));
    }

    #[test]
    fn test_clear_rules() {
        let store = running_store();
        store.upsert(tag("AAAA"), sample(AntennaId::ONE, -50, Instant::now())).unwrap();

        assert_eq!(store.clear(), Err(StoreError::SessionRunning));

        let status = store.end_session(StopReason::Requested).unwrap();
        assert_eq!(status.phase, SessionPhase::Stopped);
        assert_eq!(store.len(), 1);

        assert_eq!(store.clear(), Ok(1));
        assert!(store.is_empty());
        assert_eq!(store.total_reads(), 0);
        assert_eq!(store.session_status().phase, SessionPhase::Idle);
    }

    #[test]
    fn test_session_transitions() {
        let store = InventoryStore::default();
        assert!(store.end_session(StopReason::Requested).is_err());

        store.begin_session(ReaderConfig::default()).unwrap();
        assert!(store.is_running());
        assert_eq!(
            store.begin_session(ReaderConfig::default()),
            Err(StoreError::SessionRunning)
        );

        let status = store
            .end_session(StopReason::LinkFailure("port vanished".into()))
            .unwrap();
        assert_eq!(
            status.stop_reason,
            Some(StopReason::LinkFailure("port vanished".into()))
        );
        assert!(status.stopped_at.is_some());

        let err = store
            .upsert(tag("AAAA"), sample(AntennaId::ONE, -50, Instant::now()))
            .unwrap_err();
        assert!(err.is_session_error());

        store.begin_session(ReaderConfig::default()).unwrap();
        assert!(store.is_running());
    }

    #[test]
    fn test_burst_reads_do_not_detect_static_tag() {
        let store = running_store();
        let epc = tag("E2000017221101441890");
        let t0 = Instant::now();

        store.upsert(epc.clone(), sample(AntennaId::ONE, -60, t0)).unwrap();
        let outcome = store
            .upsert(epc.clone(), sample(AntennaId::ONE, -59, t0 + Duration::from_micros(50)))
            .unwrap();

        assert!(!outcome.detected);
        assert_eq!(outcome.votes.passes(), 0);
        assert!(store.detected_tags().is_empty());
    }

    #[test]
    fn test_restart_resets_signal_windows() {
        let store = running_store();
        let epc = tag("E2801160");
        feed_ramp(&store, &epc, Instant::now());
        assert!(store.get(&epc).unwrap().detected());

        store.end_session(StopReason::Requested).unwrap();
        store.begin_session(ReaderConfig::default()).unwrap();

        let record = store.get(&epc).unwrap();
        assert!(!record.detected());
        assert!(record.signal().window(AntennaId::ONE).is_empty());
        assert!(record.metrics(AntennaId::ONE).is_none());
        // Counters survive the restart.
        assert_eq!(record.read_count(), 8);

        let next = store
            .upsert(epc.clone(), sample(AntennaId::ONE, -50, Instant::now()))
            .unwrap();
        assert!(!next.is_new);
        assert!(!next.detected);
        assert_eq!(store.get(&epc).unwrap().signal().window(AntennaId::ONE).len(), 1);
    }

    #[test]
    fn test_placeholder_epcs_are_rejected() {
        let store = running_store();
        let t0 = Instant::now();
        for epc in ["000000", "000001"] {
            assert_eq!(
                store.upsert(tag(epc), sample(AntennaId::ONE, -50, t0)),
                Err(StoreError::PlaceholderTag { epc: tag(epc) })
            );
        }
        assert!(store.is_empty());
        assert_eq!(store.total_reads(), 0);

        assert!(store.upsert(tag("000002"), sample(AntennaId::ONE, -50, t0)).unwrap().is_new);
    }

    #[test]
    fn test_capacity_limit() {
        let store = InventoryStore::new(StoreConfig {
            max_tags: 2,
            ..StoreConfig::default()
        });
        store.begin_session(ReaderConfig::default()).unwrap();
        let t0 = Instant::now();

        store.upsert(tag("0001"), sample(AntennaId::ONE, -50, t0)).unwrap();
        store.upsert(tag("0002"), sample(AntennaId::ONE, -50, t0)).unwrap();
        assert_eq!(
            store.upsert(tag("0003"), sample(AntennaId::ONE, -50, t0)),
            Err(StoreError::CapacityExceeded { max: 2 })
        );
        // Known tags still update.
        assert!(store.upsert(tag("0001"), sample(AntennaId::ONE, -49, t0)).is_ok());
    }

    #[test]
    fn test_generation_tracks_mutations() {
        let store = InventoryStore::default();
        let g0 = store.generation();
        store.begin_session(ReaderConfig::default()).unwrap();
        let g1 = store.generation();
        assert!(g1 > g0);
        store.upsert(tag("AAAA"), sample(AntennaId::ONE, -50, Instant::now())).unwrap();
        assert!(store.generation() > g1);
        let _ = store.snapshot();
        assert_eq!(store.generation(), g1 + 1);
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let store = Arc::new(running_store());
        let t0 = Instant::now();

        std::thread::scope(|scope| {
            for worker in 0..4u8 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for i in 0..50u64 {
                        let epc = TagIdentity::new(vec![worker, (i % 5) as u8]).unwrap();
                        let at = t0 + Duration::from_millis(i);
                        store.upsert(epc, sample(AntennaId::ONE, -50, at)).unwrap();
                    }
                });
            }
            let reader = Arc::clone(&store);
            scope.spawn(move || {
                for _ in 0..20 {
                    let snapshot = reader.snapshot();
                    assert!(snapshot.len() <= 20);
                }
            });
        });

        assert_eq!(store.len(), 20);
        assert_eq!(store.total_reads(), 200);
    }
}
