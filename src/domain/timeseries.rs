use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// One sample of the external time series: spot price, PV production and
/// site load at a fixed resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimePoint {
    pub timestamp: DateTime<Utc>,
    /// Spot price, currency units per kWh.
    pub price_per_kwh: f64,
    /// On-site PV production potential (kW).
    pub pv_kw: f64,
    /// Site load (kW).
    pub load_kw: f64,
}

/// Ordered, fixed-resolution input series. Read-only once constructed;
/// windows are borrowed slices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    points: Vec<TimePoint>,
    resolution: Duration,
}

impl TimeSeries {
    /// Validate ordering, uniform spacing at the declared resolution and
    /// value sanity.
    pub fn new(points: Vec<TimePoint>, resolution: Duration) -> Result<Self, DispatchError> {
        let err = |msg: String| Err(DispatchError::Configuration(msg));
        if points.is_empty() {
            return err("time series must contain at least one point".into());
        }
        if resolution <= Duration::zero() {
            return err(format!("time series resolution must be positive, got {resolution}"));
        }
        for (i, p) in points.iter().enumerate() {
            if !(p.price_per_kwh.is_finite() && p.pv_kw.is_finite() && p.load_kw.is_finite()) {
                return err(format!("non-finite value at step {i} ({})", p.timestamp));
            }
            if p.pv_kw < 0.0 || p.load_kw < 0.0 {
                return err(format!(
                    "negative production or load at step {i} ({})",
                    p.timestamp
                ));
            }
        }
        for ((i, a), (_, b)) in points.iter().enumerate().tuple_windows() {
            let gap = b.timestamp - a.timestamp;
            if gap != resolution {
                return err(format!(
                    "irregular spacing between steps {i} and {}: expected {resolution}, got {gap}",
                    i + 1
                ));
            }
        }
        Ok(Self { points, resolution })
    }

    pub fn points(&self) -> &[TimePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Step length in hours, for energy = power x duration terms.
    pub fn step_hours(&self) -> f64 {
        self.resolution.num_seconds() as f64 / 3600.0
    }

    /// Borrow up to `max_len` points starting at `start`, clamped to the
    /// end of the series.
    pub fn window(&self, start: usize, max_len: usize) -> &[TimePoint] {
        let end = (start + max_len).min(self.points.len());
        &self.points[start.min(end)..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hourly_points(n: usize) -> Vec<TimePoint> {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| TimePoint {
                timestamp: start + Duration::hours(i as i64),
                price_per_kwh: 0.3,
                pv_kw: 1.0,
                load_kw: 2.0,
            })
            .collect()
    }

    #[test]
    fn accepts_uniform_hourly_series() {
        let series = TimeSeries::new(hourly_points(24), Duration::hours(1)).unwrap();
        assert_eq!(series.len(), 24);
        assert!((series.step_hours() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_irregular_spacing() {
        let mut points = hourly_points(5);
        points[3].timestamp += Duration::minutes(10);
        let result = TimeSeries::new(points, Duration::hours(1));
        assert!(
            matches!(result, Err(DispatchError::Configuration(msg)) if msg.contains("spacing"))
        );
    }

    #[test]
    fn rejects_unordered_points() {
        let mut points = hourly_points(5);
        points.swap(1, 2);
        assert!(TimeSeries::new(points, Duration::hours(1)).is_err());
    }

    #[test]
    fn rejects_negative_load() {
        let mut points = hourly_points(3);
        points[1].load_kw = -4.0;
        assert!(TimeSeries::new(points, Duration::hours(1)).is_err());
    }

    #[test]
    fn rejects_empty_series() {
        assert!(TimeSeries::new(vec![], Duration::hours(1)).is_err());
    }

    #[test]
    fn window_clamps_at_series_end() {
        let series = TimeSeries::new(hourly_points(10), Duration::hours(1)).unwrap();
        assert_eq!(series.window(8, 24).len(), 2);
        assert_eq!(series.window(0, 4).len(), 4);
    }
}
