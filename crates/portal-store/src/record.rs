//! # Tag Records
//!
//! One record per distinct EPC, owned by the inventory store.
//!
//! ## Snapshot Rows
//! A [`TagRecord`] holds the full RSSI history and uses monotonic time, so it
//! stays inside the process. Presentation gets [`TagSummary`] rows instead:
//! serializable, wall-clock stamped, one per tag.

use std::time::Instant;

use chrono::{DateTime, Utc};
use portal_core::analyzer::{SignalMetrics, TagSignal, VoteVector};
use portal_core::{AntennaId, RssiSample, TagIdentity};
use serde::Serialize;

/// Inventory state of one tag.
#[derive(Debug, Clone)]
pub struct TagRecord {
    pub(crate) identity: TagIdentity,
    pub(crate) signal: TagSignal,
    pub(crate) sequence: u64,
    pub(crate) first_seen: Instant,
    pub(crate) last_seen: Instant,
    pub(crate) first_seen_at: DateTime<Utc>,
    pub(crate) last_seen_at: DateTime<Utc>,
    pub(crate) read_count: u64,
    pub(crate) last_antenna: AntennaId,
    pub(crate) last_rssi: i16,
}

impl TagRecord {
    pub(crate) fn new(
        identity: TagIdentity,
        signal: TagSignal,
        sequence: u64,
        sample: &RssiSample,
        now: DateTime<Utc>,
    ) -> Self {
        TagRecord {
            identity,
            signal,
            sequence,
            first_seen: sample.at,
            last_seen: sample.at,
            first_seen_at: now,
            last_seen_at: now,
            read_count: 0,
            last_antenna: sample.antenna,
            last_rssi: sample.rssi,
        }
    }

    pub(crate) fn touch(&mut self, sample: &RssiSample, now: DateTime<Utc>) {
        self.read_count += 1;
        self.last_seen = self.last_seen.max(sample.at);
        self.last_seen_at = now;
        self.last_antenna = sample.antenna;
        self.last_rssi = sample.rssi;
    }

    pub fn identity(&self) -> &TagIdentity {
        &self.identity
    }

    pub fn signal(&self) -> &TagSignal {
        &self.signal
    }

    pub fn votes(&self) -> VoteVector {
        self.signal.votes()
    }

    /// True iff at least two of the three votes pass.
    pub fn detected(&self) -> bool {
        self.signal.detected()
    }

    pub fn metrics(&self, antenna: AntennaId) -> Option<&SignalMetrics> {
        self.signal.metrics(antenna)
    }

    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    pub fn last_antenna(&self) -> AntennaId {
        self.last_antenna
    }

    pub fn last_rssi(&self) -> i16 {
        self.last_rssi
    }

    /// Insertion order, used to break `first_seen` ties.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn summary(&self) -> TagSummary {
        let votes = self.votes();
        let ant1 = self.metrics(AntennaId::ONE);
        let ant2 = self.metrics(AntennaId::TWO);
        let combined = self.signal.combined();

        TagSummary {
            epc: self.identity.clone(),
            read_count: self.read_count,
            first_seen: self.first_seen_at,
            last_seen: self.last_seen_at,
            last_antenna: self.last_antenna,
            last_rssi: self.last_rssi,
            detected: votes.detected(),
            ant1_pass: votes.ant1,
            ant2_pass: votes.ant2,
            combined_pass: votes.combined,
            slope_ant1: ant1.map(|m| m.slope),
            slope_ant2: ant2.map(|m| m.slope),
            slope_combined: combined.map(|m| m.slope),
            confidence_ant1: ant1.map(|m| m.confidence),
            confidence_ant2: ant2.map(|m| m.confidence),
            confidence_combined: combined.map(|m| m.confidence),
        }
    }
}

/// Serializable per-tag row for presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagSummary {
    pub epc: TagIdentity,
    pub read_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_antenna: AntennaId,
    pub last_rssi: i16,
    pub detected: bool,
    pub ant1_pass: bool,
    pub ant2_pass: bool,
    pub combined_pass: bool,
    pub slope_ant1: Option<f64>,
    pub slope_ant2: Option<f64>,
    pub slope_combined: Option<f64>,
    pub confidence_ant1: Option<f64>,
    pub confidence_ant2: Option<f64>,
    pub confidence_combined: Option<f64>,
}
