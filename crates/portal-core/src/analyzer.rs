//! # Signal Analyzer
//!
//! Turns the RSSI history of one tag into a 2-of-3 detection vote.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Per-Sample Pipeline                                │
//! │                                                                         │
//! │  RssiSample(ant N) ──► ring buffer N (capacity window_size)            │
//! │                              │                                          │
//! │                              ▼                                          │
//! │                  least-squares slope (dBm/s)                            │
//! │                  variance (residual or raw)                             │
//! │                              │                                          │
//! │        ┌─────────────────────┼─────────────────────┐                   │
//! │        ▼                     ▼                     ▼                    │
//! │   ANT1 vote             ANT2 vote          combined vote               │
//! │   (buffer 1)            (buffer 2)    (all enabled buffers,            │
//! │                                         merged by timestamp)           │
//! │        └─────────────────────┼─────────────────────┘                   │
//! │                              ▼                                          │
//! │                 detected = passes >= 2                                  │
//! │                                                                         │
//! │  vote = |slope| >= slope_threshold  AND  variance <= variance_threshold │
//! │         AND samples >= min_samples  AND  span >= min_span              │
//! │  fewer than 2 samples → no metrics, vote fails                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A tag carried through the portal shows a steady RSSI ramp: large slope,
//! small scatter around the ramp. A tag sitting near the antenna shows a flat,
//! noisy signal and fails the vote.
//!
//! ## Variance Mode
//! `Detrended` (default) measures the scatter of the samples around the
//! fitted line, which is what separates a clean ramp from noise. `Raw` is the
//! plain sample variance of the RSSI values; a fast ramp alone inflates it.
//!
//! ## Evidence Gates
//! Sample times are decode times, so reads that arrive in one serial chunk
//! are microseconds apart. A 1 dB wobble across such a burst is a slope of
//! thousands of dBm/s, and two points always fit a line exactly. A window
//! must therefore hold `min_samples` samples spread over at least `min_span`
//! before it can vote.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{AntennaId, AntennaMask, RssiSample};
use crate::{validation, ANTENNA_COUNT};

/// Below this the time axis is treated as degenerate (all samples at once).
const MIN_TIME_SPREAD: f64 = 1e-12;

// =============================================================================
// Configuration
// =============================================================================

/// How variance is measured over the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceMode {
    /// Sample variance of the regression residuals.
    #[default]
    Detrended,
    /// Sample variance of the RSSI values.
    Raw,
}

/// Scale of the informational confidence score. Never affects votes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScale {
    #[serde(default = "default_slope_min")]
    pub slope_min: f64,
    #[serde(default = "default_slope_max")]
    pub slope_max: f64,
    #[serde(default = "default_variance_min")]
    pub variance_min: f64,
    #[serde(default = "default_variance_max")]
    pub variance_max: f64,
    /// Weight of the variance term.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

fn default_slope_min() -> f64 {
    0.5
}
fn default_slope_max() -> f64 {
    15.0
}
fn default_variance_min() -> f64 {
    2.0
}
fn default_variance_max() -> f64 {
    40.0
}
fn default_alpha() -> f64 {
    0.5
}

impl Default for ConfidenceScale {
    fn default() -> Self {
        ConfidenceScale {
            slope_min: default_slope_min(),
            slope_max: default_slope_max(),
            variance_min: default_variance_min(),
            variance_max: default_variance_max(),
            alpha: default_alpha(),
        }
    }
}

impl ConfidenceScale {
    /// Score in `0.0..=100.0`.
    pub fn score(&self, slope: f64, variance: f64) -> f64 {
        let slope_part = normalize(slope.abs(), self.slope_min, self.slope_max);
        let variance_part = normalize(variance, self.variance_min, self.variance_max);
        (slope_part * (1.0 - self.alpha) + variance_part * self.alpha) * 100.0
    }
}

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if max <= min {
        return 0.0;
    }
    ((value - min) / (max - min)).clamp(0.0, 1.0)
}

/// Analyzer thresholds.
///
/// ## Defaults
/// ```text
/// window_size         32 samples per antenna
/// slope_threshold     5.0 dBm/s
/// variance_threshold  4.0 dBm²
/// variance_mode       detrended
/// min_samples         3
/// min_span_ms         200
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_slope_threshold")]
    pub slope_threshold: f64,
    #[serde(default = "default_variance_threshold")]
    pub variance_threshold: f64,
    #[serde(default)]
    pub variance_mode: VarianceMode,
    /// Samples a window needs before it can vote.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Time a window must cover before it can vote.
    #[serde(default = "default_min_span_ms")]
    pub min_span_ms: u64,
    #[serde(default)]
    pub confidence: ConfidenceScale,
}

fn default_window_size() -> usize {
    32
}
fn default_slope_threshold() -> f64 {
    5.0
}
fn default_variance_threshold() -> f64 {
    4.0
}
fn default_min_samples() -> usize {
    3
}
fn default_min_span_ms() -> u64 {
    200
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            window_size: default_window_size(),
            slope_threshold: default_slope_threshold(),
            variance_threshold: default_variance_threshold(),
            variance_mode: VarianceMode::default(),
            min_samples: default_min_samples(),
            min_span_ms: default_min_span_ms(),
            confidence: ConfidenceScale::default(),
        }
    }
}

impl AnalyzerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate_window_size(self.window_size)?;
        validation::validate_min_samples(self.min_samples, self.window_size)?;
        validation::validate_threshold("slope_threshold", self.slope_threshold)?;
        validation::validate_threshold("variance_threshold", self.variance_threshold)
    }
}

// =============================================================================
// Metrics & Votes
// =============================================================================

/// Metrics over one window of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalMetrics {
    pub samples: usize,
    /// Seconds between the first and the last sample.
    pub span: f64,
    /// dBm per second.
    pub slope: f64,
    /// dBm².
    pub variance: f64,
    pub mean_rssi: f64,
    /// Informational score, 0..=100.
    pub confidence: f64,
}

/// The three detection votes of one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VoteVector {
    pub ant1: bool,
    pub ant2: bool,
    pub combined: bool,
}

impl VoteVector {
    pub fn passes(&self) -> u8 {
        self.ant1 as u8 + self.ant2 as u8 + self.combined as u8
    }

    /// Two of three votes decide detection.
    pub fn detected(&self) -> bool {
        self.passes() >= 2
    }
}

// =============================================================================
// Per-Tag State
// =============================================================================

/// Bounded FIFO of samples from one antenna. The oldest sample is evicted on
/// overflow.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<RssiSample>,
    capacity: usize,
}

impl SampleWindow {
    pub fn new(capacity: usize) -> Self {
        SampleWindow {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: RssiSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &RssiSample> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<&RssiSample> {
        self.samples.back()
    }
}

/// Signal history and derived metrics of one tag.
#[derive(Debug, Clone)]
pub struct TagSignal {
    windows: [SampleWindow; ANTENNA_COUNT],
    antenna_metrics: [Option<SignalMetrics>; ANTENNA_COUNT],
    combined: Option<SignalMetrics>,
    votes: VoteVector,
}

impl TagSignal {
    pub fn new(window_size: usize) -> Self {
        TagSignal {
            windows: std::array::from_fn(|_| SampleWindow::new(window_size)),
            antenna_metrics: [None; ANTENNA_COUNT],
            combined: None,
            votes: VoteVector::default(),
        }
    }

    pub fn window(&self, antenna: AntennaId) -> &SampleWindow {
        &self.windows[antenna.index()]
    }

    pub fn metrics(&self, antenna: AntennaId) -> Option<&SignalMetrics> {
        self.antenna_metrics[antenna.index()].as_ref()
    }

    pub fn combined(&self) -> Option<&SignalMetrics> {
        self.combined.as_ref()
    }

    pub fn votes(&self) -> VoteVector {
        self.votes
    }

    /// Derived from the vote vector on every call.
    pub fn detected(&self) -> bool {
        self.votes.detected()
    }
}

// =============================================================================
// Analyzer
// =============================================================================

/// Stateless evaluator; all per-tag state lives in [`TagSignal`].
#[derive(Debug, Clone)]
pub struct SignalAnalyzer {
    config: AnalyzerConfig,
    antennas: AntennaMask,
}

impl SignalAnalyzer {
    /// `antennas` are the ones feeding the combined vote.
    pub fn new(config: AnalyzerConfig, antennas: AntennaMask) -> Self {
        SignalAnalyzer { config, antennas }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn antennas(&self) -> AntennaMask {
        self.antennas
    }

    /// Empty history sized for this analyzer.
    pub fn new_signal(&self) -> TagSignal {
        TagSignal::new(self.config.window_size)
    }

    /// Records a sample and recomputes the metrics and votes of `signal`.
    pub fn ingest(&self, signal: &mut TagSignal, sample: RssiSample) -> VoteVector {
        let index = sample.antenna.index();
        signal.windows[index].push(sample);

        let own: Vec<RssiSample> = signal.windows[index].iter().copied().collect();
        signal.antenna_metrics[index] = self.measure(&own);

        let mut merged: Vec<RssiSample> = self
            .antennas
            .iter()
            .flat_map(|ant| signal.windows[ant.index()].iter().copied())
            .collect();
        merged.sort_by_key(|s| s.at);
        signal.combined = self.measure(&merged);

        signal.votes = VoteVector {
            ant1: self.passes(signal.antenna_metrics[AntennaId::ONE.index()].as_ref()),
            ant2: self.passes(signal.antenna_metrics[AntennaId::TWO.index()].as_ref()),
            combined: self.passes(signal.combined.as_ref()),
        };
        signal.votes
    }

    /// Metrics over time-ordered samples; `None` below two samples.
    pub fn measure(&self, samples: &[RssiSample]) -> Option<SignalMetrics> {
        if samples.len() < 2 {
            return None;
        }
        let origin = samples[0].at;
        let points: Vec<(f64, f64)> = samples
            .iter()
            .map(|s| (s.at.saturating_duration_since(origin).as_secs_f64(), s.rssi as f64))
            .collect();

        let fit = LinearFit::of(&points);
        let variance = match self.config.variance_mode {
            VarianceMode::Detrended => fit.residual_variance(&points),
            VarianceMode::Raw => sample_variance(&points),
        };

        let span = points.last().map_or(0.0, |p| p.0);
        Some(SignalMetrics {
            samples: samples.len(),
            span,
            slope: fit.slope,
            variance,
            mean_rssi: fit.mean_y,
            confidence: self.config.confidence.score(fit.slope, variance),
        })
    }

    /// Vote rule; missing metrics and thin windows fail.
    pub fn passes(&self, metrics: Option<&SignalMetrics>) -> bool {
        metrics.is_some_and(|m| {
            self.has_evidence(m)
                && m.slope.abs() >= self.config.slope_threshold
                && m.variance <= self.config.variance_threshold
        })
    }

    fn has_evidence(&self, metrics: &SignalMetrics) -> bool {
        let min_span = self.config.min_span_ms as f64 / 1000.0;
        metrics.samples >= self.config.min_samples && metrics.span >= min_span
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Least-squares line `y = intercept + slope * x`.
#[derive(Debug, Clone, Copy)]
struct LinearFit {
    slope: f64,
    intercept: f64,
    mean_y: f64,
}

impl LinearFit {
    fn of(points: &[(f64, f64)]) -> Self {
        let n = points.len() as f64;
        let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

        let (sxx, sxy) = points.iter().fold((0.0, 0.0), |(sxx, sxy), (x, y)| {
            let dx = x - mean_x;
            (sxx + dx * dx, sxy + dx * (y - mean_y))
        });

        let slope = if sxx > MIN_TIME_SPREAD { sxy / sxx } else { 0.0 };
        LinearFit {
            slope,
            intercept: mean_y - slope * mean_x,
            mean_y,
        }
    }

    fn residual_variance(&self, points: &[(f64, f64)]) -> f64 {
        let sum_sq: f64 = points
            .iter()
            .map(|(x, y)| {
                let r = y - (self.intercept + self.slope * x);
                r * r
            })
            .sum();
        sum_sq / (points.len() as f64 - 1.0)
    }
}

fn sample_variance(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let mean = points.iter().map(|p| p.1).sum::<f64>() / n;
    points.iter().map(|p| (p.1 - mean).powi(2)).sum::<f64>() / (n - 1.0)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn samples(antenna: AntennaId, start: Instant, step_ms: u64, rssi: &[i16]) -> Vec<RssiSample> {
        rssi.iter()
            .enumerate()
            .map(|(i, r)| RssiSample::new(antenna, *r, start + Duration::from_millis(step_ms * i as u64)))
            .collect()
    }

    fn analyzer() -> SignalAnalyzer {
        SignalAnalyzer::new(AnalyzerConfig::default(), AntennaMask::default())
    }

    #[test]
    fn test_ramp_passes_vote() {
        let t0 = Instant::now();
        let analyzer = analyzer();
        let metrics = analyzer
            .measure(&samples(AntennaId::ONE, t0, 100, &[-60, -58, -55, -52]))
            .unwrap();

        assert!((metrics.slope - 27.0).abs() < 1e-6, "slope {}", metrics.slope);
        assert!((metrics.variance - 0.1).abs() < 1e-6, "variance {}", metrics.variance);
        assert!(analyzer.passes(Some(&metrics)));
    }

    #[test]
    fn test_raw_variance_mode() {
        let t0 = Instant::now();
        let config = AnalyzerConfig {
            variance_mode: VarianceMode::Raw,
            ..AnalyzerConfig::default()
        };
        let analyzer = SignalAnalyzer::new(config, AntennaMask::default());
        let metrics = analyzer
            .measure(&samples(AntennaId::ONE, t0, 100, &[-60, -58, -55, -52]))
            .unwrap();

        assert!((metrics.variance - 12.25).abs() < 1e-9);
        assert!(!analyzer.passes(Some(&metrics)));
    }

    #[test]
    fn test_flat_signal_fails_vote() {
        let t0 = Instant::now();
        let analyzer = analyzer();
        let metrics = analyzer
            .measure(&samples(AntennaId::ONE, t0, 100, &[-50, -50, -50, -50]))
            .unwrap();
        assert_eq!(metrics.slope, 0.0);
        assert!(!analyzer.passes(Some(&metrics)));
    }

    #[test]
    fn test_fewer_than_two_samples_fail() {
        let t0 = Instant::now();
        let analyzer = analyzer();
        assert!(analyzer.measure(&[]).is_none());
        assert!(analyzer
            .measure(&samples(AntennaId::ONE, t0, 100, &[-40]))
            .is_none());
        assert!(!analyzer.passes(None));
    }

    #[test]
    fn test_burst_of_two_reads_does_not_vote() {
        let t0 = Instant::now();
        let analyzer = analyzer();
        let mut signal = analyzer.new_signal();

        analyzer.ingest(&mut signal, RssiSample::new(AntennaId::ONE, -60, t0));
        let votes = analyzer.ingest(
            &mut signal,
            RssiSample::new(AntennaId::ONE, -59, t0 + Duration::from_micros(50)),
        );

        let metrics = signal.metrics(AntennaId::ONE).unwrap();
        assert!(metrics.slope > 10_000.0);
        assert!(metrics.variance < 1e-9);
        assert_eq!(votes, VoteVector::default());
        assert!(!signal.detected());
    }

    #[test]
    fn test_short_span_does_not_vote() {
        let t0 = Instant::now();
        let analyzer = analyzer();
        // Clean ramp, but all inside 30 ms.
        let burst = samples(AntennaId::ONE, t0, 10, &[-60, -58, -56, -54]);
        let metrics = analyzer.measure(&burst).unwrap();
        assert!((metrics.span - 0.03).abs() < 1e-9);
        assert!(!analyzer.passes(Some(&metrics)));

        // The same ramp spread over 300 ms votes.
        let spread = samples(AntennaId::ONE, t0, 100, &[-60, -58, -56, -54]);
        assert!(analyzer.passes(analyzer.measure(&spread).as_ref()));
    }

    #[test]
    fn test_two_samples_never_vote_by_default() {
        let t0 = Instant::now();
        let analyzer = analyzer();
        let pair = samples(AntennaId::ONE, t0, 500, &[-70, -50]);
        let metrics = analyzer.measure(&pair).unwrap();
        assert!((metrics.slope - 40.0).abs() < 1e-9);
        assert!(!analyzer.passes(Some(&metrics)));
    }

    #[test]
    fn test_simultaneous_samples_have_zero_slope() {
        let t0 = Instant::now();
        let metrics = analyzer()
            .measure(&samples(AntennaId::ONE, t0, 0, &[-40, -50]))
            .unwrap();
        assert_eq!(metrics.slope, 0.0);
    }

    #[test]
    fn test_ingest_recomputes_votes_each_sample() {
        let t0 = Instant::now();
        let analyzer = analyzer();
        let mut signal = analyzer.new_signal();

        let ant1 = samples(AntennaId::ONE, t0, 100, &[-60, -58, -55, -52]);
        let ant2 = samples(
            AntennaId::TWO,
            t0 + Duration::from_millis(50),
            100,
            &[-62, -60, -57, -54],
        );

        let first = analyzer.ingest(&mut signal, ant1[0]);
        assert_eq!(first, VoteVector::default());
        assert!(!signal.detected());

        for (a, b) in ant1.iter().zip(ant2.iter()) {
            analyzer.ingest(&mut signal, *a);
            analyzer.ingest(&mut signal, *b);
        }

        let votes = signal.votes();
        assert!(votes.ant1);
        assert!(votes.ant2);
        assert!(signal.detected());
        assert_eq!(signal.window(AntennaId::ONE).len(), 5);
        assert!(signal.metrics(AntennaId::ONE).is_some());
        assert!(signal.combined().is_some());
    }

    #[test]
    fn test_detected_is_two_of_three() {
        for ant1 in [false, true] {
            for ant2 in [false, true] {
                for combined in [false, true] {
                    let votes = VoteVector { ant1, ant2, combined };
                    let expected = (ant1 as u8 + ant2 as u8 + combined as u8) >= 2;
                    assert_eq!(votes.detected(), expected);
                }
            }
        }
    }

    #[test]
    fn test_disabled_antenna_excluded_from_combined() {
        let t0 = Instant::now();
        let mask = AntennaMask::new([AntennaId::ONE]).unwrap();
        let analyzer = SignalAnalyzer::new(AnalyzerConfig::default(), mask);
        let mut signal = analyzer.new_signal();

        analyzer.ingest(&mut signal, RssiSample::new(AntennaId::THREE, -40, t0));
        analyzer.ingest(
            &mut signal,
            RssiSample::new(AntennaId::THREE, -30, t0 + Duration::from_millis(100)),
        );
        assert!(signal.metrics(AntennaId::THREE).is_some());
        assert!(signal.combined().is_none());
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let t0 = Instant::now();
        let config = AnalyzerConfig {
            window_size: 3,
            ..AnalyzerConfig::default()
        };
        let analyzer = SignalAnalyzer::new(config, AntennaMask::default());
        let mut signal = analyzer.new_signal();
        for s in samples(AntennaId::ONE, t0, 100, &[-70, -60, -50, -40, -30]) {
            analyzer.ingest(&mut signal, s);
        }
        let window = signal.window(AntennaId::ONE);
        assert_eq!(window.len(), 3);
        assert_eq!(window.iter().next().map(|s| s.rssi), Some(-50));
        assert_eq!(window.latest().map(|s| s.rssi), Some(-30));
    }

    #[test]
    fn test_confidence_score_range() {
        let scale = ConfidenceScale::default();
        assert_eq!(scale.score(0.0, 0.0), 0.0);
        assert_eq!(scale.score(100.0, 100.0), 100.0);
        let mid = scale.score(-15.0, 2.0);
        assert!((mid - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_config_validation() {
        assert!(AnalyzerConfig::default().validate().is_ok());
        let bad = AnalyzerConfig {
            window_size: 1,
            ..AnalyzerConfig::default()
        };
        assert!(bad.validate().is_err());

        let unreachable = AnalyzerConfig {
            window_size: 4,
            min_samples: 5,
            ..AnalyzerConfig::default()
        };
        assert!(unreachable.validate().is_err());
    }
}
