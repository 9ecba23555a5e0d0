//! Progressive power-tariff structure.
//!
//! The monthly demand charge is a step function of the month's peak grid
//! import: the bracket containing the peak determines the charge. For the
//! LP objective the step function is replaced by its convex piecewise-
//! linear lower envelope through the bracket corners; minimization
//! pressure keeps the peak variable tight against the true maximum, so the
//! envelope prices marginal peak growth correctly while the exact bracket
//! charge is settled outside the LP.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

const KW_EPSILON: f64 = 1e-9;

/// One demand-charge bracket: peaks in (lower_kw, upper_kw] pay
/// `monthly_charge`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TariffBracket {
    pub lower_kw: f64,
    pub upper_kw: f64,
    pub monthly_charge: f64,
}

impl TariffBracket {
    pub fn new(lower_kw: f64, upper_kw: f64, monthly_charge: f64) -> Self {
        Self {
            lower_kw,
            upper_kw,
            monthly_charge,
        }
    }
}

/// Time-of-use grid fee added on top of the spot price for imported
/// energy. Hours are UTC, `start_hour <= h < end_hour`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeOfUseRate {
    pub start_hour: u32,
    pub end_hour: u32,
    pub rate_per_kwh: f64,
}

/// One supporting line of the convex envelope: `cost >= slope * peak +
/// intercept`.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeSegment {
    pub slope: f64,
    pub intercept: f64,
}

/// Immutable tariff definition: ordered demand-charge brackets plus
/// optional time-of-use energy rates.
///
/// An empty bracket list means no demand charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TariffStructure {
    brackets: Vec<TariffBracket>,
    energy_rates: Vec<TimeOfUseRate>,
}

impl TariffStructure {
    /// Build and validate a tariff. Malformed brackets (gaps, overlaps,
    /// regressive charges) fail fast rather than silently mis-price.
    pub fn new(
        brackets: Vec<TariffBracket>,
        energy_rates: Vec<TimeOfUseRate>,
    ) -> Result<Self, DispatchError> {
        let tariff = Self {
            brackets,
            energy_rates,
        };
        tariff.validate()?;
        Ok(tariff)
    }

    /// Tariff with neither demand charges nor time-of-use fees.
    pub fn energy_only() -> Self {
        Self {
            brackets: Vec::new(),
            energy_rates: Vec::new(),
        }
    }

    pub fn brackets(&self) -> &[TariffBracket] {
        &self.brackets
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        let err = |msg: String| Err(DispatchError::Configuration(msg));
        if let Some(first) = self.brackets.first() {
            if first.lower_kw.abs() > KW_EPSILON {
                return err(format!(
                    "first tariff bracket must start at 0 kW, starts at {}",
                    first.lower_kw
                ));
            }
        }
        let mut prev_slope = 0.0;
        for (i, b) in self.brackets.iter().enumerate() {
            if !(b.upper_kw.is_finite() && b.upper_kw > b.lower_kw) {
                return err(format!(
                    "tariff bracket {i} has non-positive width ({}..{} kW)",
                    b.lower_kw, b.upper_kw
                ));
            }
            if !(b.monthly_charge.is_finite() && b.monthly_charge >= 0.0) {
                return err(format!(
                    "tariff bracket {i} has invalid charge {}",
                    b.monthly_charge
                ));
            }
            if i > 0 {
                let prev = &self.brackets[i - 1];
                let step = b.lower_kw - prev.upper_kw;
                if step > KW_EPSILON {
                    return err(format!(
                        "gap between tariff brackets {} and {i}: {} kW to {} kW",
                        i - 1,
                        prev.upper_kw,
                        b.lower_kw
                    ));
                }
                if step < -KW_EPSILON {
                    return err(format!(
                        "overlap between tariff brackets {} and {i}: {} kW vs {} kW",
                        i - 1,
                        prev.upper_kw,
                        b.lower_kw
                    ));
                }
                if b.monthly_charge + KW_EPSILON < prev.monthly_charge {
                    return err(format!(
                        "tariff bracket {i} charges less than bracket {}; brackets must be progressive",
                        i - 1
                    ));
                }
            }
            let prev_charge = if i > 0 {
                self.brackets[i - 1].monthly_charge
            } else {
                0.0
            };
            let slope = (b.monthly_charge - prev_charge) / (b.upper_kw - b.lower_kw);
            if slope + KW_EPSILON < prev_slope {
                return err(format!(
                    "tariff bracket {i} has a lower marginal rate than its predecessor; \
                     the peak-cost envelope would be non-convex"
                ));
            }
            prev_slope = slope;
        }
        for (i, r) in self.energy_rates.iter().enumerate() {
            if !(r.start_hour < r.end_hour && r.end_hour <= 24) {
                return err(format!(
                    "time-of-use rate {i} has invalid hour range {}..{}",
                    r.start_hour, r.end_hour
                ));
            }
            if !(r.rate_per_kwh.is_finite() && r.rate_per_kwh >= 0.0) {
                return err(format!(
                    "time-of-use rate {i} has invalid rate {}",
                    r.rate_per_kwh
                ));
            }
            for (j, other) in self.energy_rates.iter().enumerate().take(i) {
                if r.start_hour < other.end_hour && other.start_hour < r.end_hour {
                    return err(format!("time-of-use rates {j} and {i} overlap"));
                }
            }
        }
        Ok(())
    }

    /// Exact monthly demand charge for a given peak import.
    ///
    /// Policy: a non-positive peak pays nothing; a peak above the highest
    /// bracket extrapolates at the final bracket's marginal rate per kW.
    pub fn monthly_charge(&self, peak_kw: f64) -> f64 {
        if peak_kw <= 0.0 || self.brackets.is_empty() {
            return 0.0;
        }
        for b in &self.brackets {
            if peak_kw <= b.upper_kw + KW_EPSILON {
                return b.monthly_charge;
            }
        }
        // Above the last defined bracket.
        let last = self.brackets[self.brackets.len() - 1];
        let prev_charge = if self.brackets.len() > 1 {
            self.brackets[self.brackets.len() - 2].monthly_charge
        } else {
            0.0
        };
        let marginal = (last.monthly_charge - prev_charge) / (last.upper_kw - last.lower_kw);
        last.monthly_charge + marginal * (peak_kw - last.upper_kw)
    }

    /// Grid energy fee applying to imports at `ts`, or 0 when no
    /// time-of-use rate covers the hour.
    pub fn import_rate_at(&self, ts: DateTime<Utc>) -> f64 {
        let hour = ts.hour();
        self.energy_rates
            .iter()
            .find(|r| r.start_hour <= hour && hour < r.end_hour)
            .map(|r| r.rate_per_kwh)
            .unwrap_or(0.0)
    }

    /// Convex lower envelope of the bracket step function, for embedding
    /// in the LP objective. Segment `i` connects the corner of bracket
    /// `i-1` (or the origin) to the corner of bracket `i`; the last
    /// segment extends unbounded, matching the extrapolation policy of
    /// [`monthly_charge`](Self::monthly_charge).
    pub fn envelope_segments(&self) -> Vec<EnvelopeSegment> {
        let mut segments = Vec::with_capacity(self.brackets.len());
        let mut prev_upper = 0.0;
        let mut prev_charge = 0.0;
        for b in &self.brackets {
            let slope = (b.monthly_charge - prev_charge) / (b.upper_kw - prev_upper);
            let intercept = b.monthly_charge - slope * b.upper_kw;
            segments.push(EnvelopeSegment { slope, intercept });
            prev_upper = b.upper_kw;
            prev_charge = b.monthly_charge;
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn two_bracket_tariff() -> TariffStructure {
        TariffStructure::new(
            vec![
                TariffBracket::new(0.0, 5.0, 100.0),
                TariffBracket::new(5.0, 10.0, 200.0),
            ],
            vec![],
        )
        .unwrap()
    }

    #[rstest]
    #[case(3.0, 100.0)]
    #[case(5.0, 100.0)]
    #[case(5.0001, 200.0)]
    #[case(-1.0, 0.0)]
    #[case(0.0, 0.0)]
    #[case(100.0, 2000.0)]
    fn bracket_lookup(#[case] peak: f64, #[case] expected: f64) {
        let tariff = two_bracket_tariff();
        assert!((tariff.monthly_charge(peak) - expected).abs() < 1e-9);
    }

    #[test]
    fn rejects_gap_between_brackets() {
        let result = TariffStructure::new(
            vec![
                TariffBracket::new(0.0, 5.0, 100.0),
                TariffBracket::new(6.0, 10.0, 200.0),
            ],
            vec![],
        );
        assert!(matches!(result, Err(DispatchError::Configuration(msg)) if msg.contains("gap")));
    }

    #[test]
    fn rejects_overlapping_brackets() {
        let result = TariffStructure::new(
            vec![
                TariffBracket::new(0.0, 5.0, 100.0),
                TariffBracket::new(4.0, 10.0, 200.0),
            ],
            vec![],
        );
        assert!(
            matches!(result, Err(DispatchError::Configuration(msg)) if msg.contains("overlap"))
        );
    }

    #[test]
    fn rejects_regressive_charges() {
        let result = TariffStructure::new(
            vec![
                TariffBracket::new(0.0, 5.0, 200.0),
                TariffBracket::new(5.0, 10.0, 100.0),
            ],
            vec![],
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_first_bracket_not_at_zero() {
        let result =
            TariffStructure::new(vec![TariffBracket::new(2.0, 5.0, 100.0)], vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn envelope_touches_bracket_corners() {
        let tariff = two_bracket_tariff();
        let segments = tariff.envelope_segments();
        assert_eq!(segments.len(), 2);
        for b in tariff.brackets() {
            let envelope = segments
                .iter()
                .map(|s| s.slope * b.upper_kw + s.intercept)
                .fold(f64::MIN, f64::max);
            assert!((envelope - b.monthly_charge).abs() < 1e-9);
        }
    }

    #[test]
    fn envelope_never_exceeds_exact_charge() {
        let tariff = two_bracket_tariff();
        let segments = tariff.envelope_segments();
        for i in 0..=100 {
            let peak = i as f64 * 0.15;
            let envelope = segments
                .iter()
                .map(|s| s.slope * peak + s.intercept)
                .fold(0.0_f64, f64::max);
            assert!(envelope <= tariff.monthly_charge(peak) + 1e-9);
        }
    }

    #[test]
    fn time_of_use_rate_lookup() {
        let tariff = TariffStructure::new(
            vec![],
            vec![
                TimeOfUseRate {
                    start_hour: 6,
                    end_hour: 22,
                    rate_per_kwh: 0.25,
                },
                TimeOfUseRate {
                    start_hour: 22,
                    end_hour: 24,
                    rate_per_kwh: 0.10,
                },
            ],
        )
        .unwrap();
        let day = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2025, 6, 1, 23, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        assert!((tariff.import_rate_at(day) - 0.25).abs() < 1e-12);
        assert!((tariff.import_rate_at(night) - 0.10).abs() < 1e-12);
        assert_eq!(tariff.import_rate_at(early), 0.0);
    }

    #[test]
    fn rejects_overlapping_time_of_use_rates() {
        let result = TariffStructure::new(
            vec![],
            vec![
                TimeOfUseRate {
                    start_hour: 6,
                    end_hour: 22,
                    rate_per_kwh: 0.25,
                },
                TimeOfUseRate {
                    start_hour: 20,
                    end_hour: 24,
                    rate_per_kwh: 0.10,
                },
            ],
        );
        assert!(result.is_err());
    }
}
