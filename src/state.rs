//! Persistent operating state carried across window boundaries.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::BatterySpecification;
use crate::error::DispatchError;

/// Measurement slack for SOC bound checks (kWh).
const SOC_TOLERANCE_KWH: f64 = 1e-6;

/// First instant of the calendar month containing `ts` (UTC).
pub fn month_start_of(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
        .single()
        .expect("first of month is a valid UTC timestamp")
}

/// Mutable per-run operating state: SOC, month-to-date peak import,
/// cumulative degradation.
///
/// Exactly one instance exists per simulation run and only the controller
/// mutates it. Parallel scenario sweeps each own an independent instance;
/// there is no sharing and no locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatingState {
    soc_kwh: f64,
    month_to_date_peak_kw: f64,
    month_start: DateTime<Utc>,
    cumulative_degradation_pct: f64,
    last_update: DateTime<Utc>,
    soc_min_kwh: f64,
    soc_max_kwh: f64,
}

impl OperatingState {
    pub fn new(
        spec: &BatterySpecification,
        initial_soc_kwh: f64,
        start: DateTime<Utc>,
    ) -> Result<Self, DispatchError> {
        spec.validate()?;
        let (lo, hi) = (spec.min_soc_kwh(), spec.max_soc_kwh());
        if !(initial_soc_kwh.is_finite() && lo <= initial_soc_kwh && initial_soc_kwh <= hi) {
            return Err(DispatchError::Configuration(format!(
                "initial SOC {initial_soc_kwh} kWh outside bounds [{lo}, {hi}] kWh"
            )));
        }
        Ok(Self {
            soc_kwh: initial_soc_kwh,
            month_to_date_peak_kw: 0.0,
            month_start: month_start_of(start),
            cumulative_degradation_pct: 0.0,
            last_update: start,
            soc_min_kwh: lo,
            soc_max_kwh: hi,
        })
    }

    pub fn soc_kwh(&self) -> f64 {
        self.soc_kwh
    }

    pub fn month_to_date_peak_kw(&self) -> f64 {
        self.month_to_date_peak_kw
    }

    pub fn month_start(&self) -> DateTime<Utc> {
        self.month_start
    }

    pub fn cumulative_degradation_pct(&self) -> f64 {
        self.cumulative_degradation_pct
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    /// Commit the measured outcome of an applied step: end-of-step SOC and
    /// the step's grid import. The month-to-date peak is the running
    /// maximum of imports since the last monthly reset.
    pub fn update_from_measurement(
        &mut self,
        timestamp: DateTime<Utc>,
        soc_kwh: f64,
        grid_import_kw: f64,
    ) -> Result<(), DispatchError> {
        if timestamp < self.last_update {
            return Err(DispatchError::StateConsistency(format!(
                "measurement at {timestamp} predates last update {}",
                self.last_update
            )));
        }
        if !soc_kwh.is_finite()
            || soc_kwh < self.soc_min_kwh - SOC_TOLERANCE_KWH
            || soc_kwh > self.soc_max_kwh + SOC_TOLERANCE_KWH
        {
            return Err(DispatchError::StateConsistency(format!(
                "SOC {soc_kwh} kWh outside bounds [{}, {}] kWh at {timestamp}",
                self.soc_min_kwh, self.soc_max_kwh
            )));
        }
        if !(grid_import_kw.is_finite() && grid_import_kw >= 0.0) {
            return Err(DispatchError::StateConsistency(format!(
                "negative or non-finite grid import {grid_import_kw} kW at {timestamp}"
            )));
        }
        self.soc_kwh = soc_kwh.clamp(self.soc_min_kwh, self.soc_max_kwh);
        self.month_to_date_peak_kw = self.month_to_date_peak_kw.max(grid_import_kw);
        self.last_update = timestamp;
        Ok(())
    }

    /// Accrue state-of-health loss. Cumulative degradation never
    /// decreases and is never reset.
    pub fn apply_degradation(&mut self, increment_pct: f64) -> Result<(), DispatchError> {
        if !(increment_pct.is_finite() && increment_pct >= 0.0) {
            return Err(DispatchError::StateConsistency(format!(
                "degradation increment must be non-negative, got {increment_pct}"
            )));
        }
        self.cumulative_degradation_pct += increment_pct;
        Ok(())
    }

    /// Zero the monthly peak tracker at a calendar-month boundary. SOC and
    /// cumulative degradation carry forward unchanged.
    pub fn reset_monthly_peak(
        &mut self,
        new_month_start: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        if month_start_of(new_month_start) != new_month_start {
            return Err(DispatchError::StateConsistency(format!(
                "monthly reset timestamp {new_month_start} is not a month boundary"
            )));
        }
        if new_month_start <= self.month_start {
            return Err(DispatchError::StateConsistency(format!(
                "monthly reset to {new_month_start} does not advance past {}",
                self.month_start
            )));
        }
        self.month_to_date_peak_kw = 0.0;
        self.month_start = new_month_start;
        Ok(())
    }
}
