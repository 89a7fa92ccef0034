//! Statistical anomaly detection over named metric series.
//!
//! Each series is a bounded ring of `(time, value)` samples. Every recorded
//! sample is checked against three tests over the trailing window, each
//! excluding the just-added point from its baseline: z-score, IQR, and
//! rate-of-change.

pub mod stats;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const DEFAULT_Z_THRESHOLD: f64 = 3.0;
const DEFAULT_IQR_FACTOR: f64 = 1.5;
const DEFAULT_MIN_SAMPLES: usize = 30;
const DEFAULT_WINDOW_SIZE: usize = 100;
const RATE_CHANGE_THRESHOLD: f64 = 0.5;
const RATE_RECENT_SAMPLES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Zscore,
    Iqr,
    RateChange,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Zscore => "zscore",
            AnomalyKind::Iqr => "iqr",
            AnomalyKind::RateChange => "rate_change",
        }
    }
}

/// One triggered test for one recorded sample.
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub time: DateTime<Utc>,
    pub metric: String,
    pub value: f64,
    pub score: f64,
    pub kind: AnomalyKind,
    pub threshold: f64,
    pub message: &'static str,
}

/// Bounded ring of samples for one metric.
#[derive(Debug)]
struct MetricSeries {
    samples: VecDeque<(DateTime<Utc>, f64)>,
    max_len: usize,
}

impl MetricSeries {
    fn new(max_len: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_len),
            max_len,
        }
    }

    fn add(&mut self, time: DateTime<Utc>, value: f64) {
        if self.samples.len() >= self.max_len {
            self.samples.pop_front();
        }
        self.samples.push_back((time, value));
    }

    fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|(_, v)| *v).collect()
    }
}

pub struct AnomalyDetector {
    series: Mutex<HashMap<String, MetricSeries>>,
    z_threshold: f64,
    iqr_factor: f64,
    min_samples: usize,
    window_size: usize,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self::with_config(
            DEFAULT_Z_THRESHOLD,
            DEFAULT_IQR_FACTOR,
            DEFAULT_MIN_SAMPLES,
            DEFAULT_WINDOW_SIZE,
        )
    }

    pub fn with_config(
        z_threshold: f64,
        iqr_factor: f64,
        min_samples: usize,
        window_size: usize,
    ) -> Self {
        let z_threshold = if z_threshold > 0.0 { z_threshold } else { DEFAULT_Z_THRESHOLD };
        let iqr_factor = if iqr_factor > 0.0 { iqr_factor } else { DEFAULT_IQR_FACTOR };
        let min_samples = if min_samples > 0 { min_samples } else { DEFAULT_MIN_SAMPLES };
        let window_size = if window_size > 0 { window_size } else { DEFAULT_WINDOW_SIZE };
        Self {
            series: Mutex::new(HashMap::new()),
            z_threshold,
            iqr_factor,
            min_samples,
            window_size,
        }
    }

    /// Record a sample and return any anomalies it triggers.
    pub fn record(&self, metric: &str, time: DateTime<Utc>, value: f64) -> Vec<Anomaly> {
        let values = {
            let mut series = self.series.lock().unwrap();
            let entry = series
                .entry(metric.to_string())
                .or_insert_with(|| MetricSeries::new(self.window_size * 10));
            entry.add(time, value);
            entry.values()
        };

        if values.len() < self.min_samples {
            return Vec::new();
        }

        let window = if values.len() > self.window_size {
            &values[values.len() - self.window_size..]
        } else {
            &values[..]
        };

        let mut anomalies = Vec::new();

        if let Some(a) = self.check_z_score(metric, window, time, value) {
            anomalies.push(a);
        }
        if let Some(a) = self.check_iqr(metric, window, time, value) {
            anomalies.push(a);
        }
        if let Some(a) = self.check_rate_change(metric, window, time, value) {
            anomalies.push(a);
        }

        anomalies
    }

    fn check_z_score(
        &self,
        metric: &str,
        window: &[f64],
        time: DateTime<Utc>,
        value: f64,
    ) -> Option<Anomaly> {
        let baseline = &window[..window.len() - 1];
        let mean = stats::mean(baseline);
        let stddev = stats::std_dev(baseline);

        if stddev == 0.0 {
            return None;
        }

        let zscore = ((value - mean) / stddev).abs();
        if zscore > self.z_threshold {
            return Some(Anomaly {
                time,
                metric: metric.to_string(),
                value,
                score: zscore,
                kind: AnomalyKind::Zscore,
                threshold: self.z_threshold,
                message: "Value deviates significantly from the mean",
            });
        }
        None
    }

    fn check_iqr(
        &self,
        metric: &str,
        window: &[f64],
        time: DateTime<Utc>,
        value: f64,
    ) -> Option<Anomaly> {
        let mut sorted = window[..window.len() - 1].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let q1 = stats::percentile(&sorted, 25.0);
        let q3 = stats::percentile(&sorted, 75.0);
        let iqr = q3 - q1;

        if iqr == 0.0 {
            return None;
        }

        let lower = q1 - self.iqr_factor * iqr;
        let upper = q3 + self.iqr_factor * iqr;

        if value < lower || value > upper {
            let deviation = if value > upper {
                (value - upper) / iqr
            } else {
                (lower - value) / iqr
            };
            return Some(Anomaly {
                time,
                metric: metric.to_string(),
                value,
                score: deviation,
                kind: AnomalyKind::Iqr,
                threshold: self.iqr_factor,
                message: "Value is an outlier based on IQR analysis",
            });
        }
        None
    }

    fn check_rate_change(
        &self,
        metric: &str,
        window: &[f64],
        time: DateTime<Utc>,
        value: f64,
    ) -> Option<Anomaly> {
        if window.len() <= RATE_RECENT_SAMPLES {
            return None;
        }
        let recent = stats::mean(&window[window.len() - RATE_RECENT_SAMPLES..]);
        let historical = stats::mean(&window[..window.len() - RATE_RECENT_SAMPLES]);

        if historical == 0.0 {
            return None;
        }

        let rate_change = ((recent - historical) / historical).abs();
        if rate_change > RATE_CHANGE_THRESHOLD {
            return Some(Anomaly {
                time,
                metric: metric.to_string(),
                value,
                score: rate_change,
                kind: AnomalyKind::RateChange,
                threshold: RATE_CHANGE_THRESHOLD,
                message: "Significant rate of change detected",
            });
        }
        None
    }

    pub fn series_count(&self) -> usize {
        self.series.lock().unwrap().len()
    }

    pub fn series_len(&self, metric: &str) -> usize {
        self.series
            .lock()
            .unwrap()
            .get(metric)
            .map(|s| s.samples.len())
            .unwrap_or(0)
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_steady(detector: &AnomalyDetector, metric: &str, count: usize) {
        let base = [50.0, 51.0, 52.0];
        for i in 0..count {
            detector.record(metric, Utc::now(), base[i % base.len()]);
        }
    }

    #[test]
    fn test_below_min_samples_no_anomalies() {
        let detector = AnomalyDetector::new();
        for i in 0..29 {
            let anomalies = detector.record("cpu", Utc::now(), 1000.0 * i as f64);
            assert!(anomalies.is_empty());
        }
    }

    #[test]
    fn test_z_score_spike() {
        let detector = AnomalyDetector::new();
        record_steady(&detector, "cpu", 50);

        let anomalies = detector.record("cpu", Utc::now(), 200.0);
        let z = anomalies
            .iter()
            .find(|a| a.kind == AnomalyKind::Zscore)
            .expect("expected a zscore anomaly");
        assert!(z.score > 3.0);
        assert_eq!(z.threshold, 3.0);
        assert_eq!(z.metric, "cpu");
    }

    #[test]
    fn test_constant_series_never_flags() {
        // stddev and IQR are both zero; rate change compares equal means
        let detector = AnomalyDetector::new();
        for _ in 0..100 {
            let anomalies = detector.record("mem", Utc::now(), 42.0);
            assert!(anomalies.is_empty());
        }
    }

    #[test]
    fn test_iqr_outlier() {
        let detector = AnomalyDetector::new();
        record_steady(&detector, "reqs", 60);

        let anomalies = detector.record("reqs", Utc::now(), 500.0);
        assert!(anomalies.iter().any(|a| a.kind == AnomalyKind::Iqr));
    }

    #[test]
    fn test_rate_change_on_sustained_shift() {
        let detector = AnomalyDetector::new();
        for _ in 0..40 {
            detector.record("conns", Utc::now(), 10.0);
        }
        // Push the last five samples well above the historical mean
        let mut flagged = false;
        for _ in 0..5 {
            let anomalies = detector.record("conns", Utc::now(), 30.0);
            if anomalies.iter().any(|a| a.kind == AnomalyKind::RateChange) {
                flagged = true;
            }
        }
        assert!(flagged);
    }

    #[test]
    fn test_series_bounded() {
        let detector = AnomalyDetector::with_config(3.0, 1.5, 30, 10);
        for i in 0..500 {
            detector.record("bounded", Utc::now(), i as f64);
        }
        // Capacity is window_size * 10
        assert_eq!(detector.series_len("bounded"), 100);
    }

    #[test]
    fn test_independent_series() {
        let detector = AnomalyDetector::new();
        record_steady(&detector, "a", 50);
        // "b" has too few samples to flag anything, even though "a" is warm
        let anomalies = detector.record("b", Utc::now(), 1_000_000.0);
        assert!(anomalies.is_empty());
        assert_eq!(detector.series_count(), 2);
    }
}
