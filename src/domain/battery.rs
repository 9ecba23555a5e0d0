use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Immutable physical description of the battery system.
///
/// All power values are AC-side kW, all energy values kWh. The round-trip
/// efficiency is split symmetrically between the two legs: charging
/// multiplies incoming energy by sqrt(eta), discharging divides outgoing
/// energy by sqrt(eta).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatterySpecification {
    /// Nameplate energy capacity (kWh).
    pub capacity_kwh: f64,
    /// Symmetric charge/discharge power rating (kW).
    pub power_kw: f64,
    /// Round-trip efficiency, 0 < eta <= 1.
    pub round_trip_efficiency: f64,
    /// Lower state-of-charge bound as a fraction of capacity.
    pub min_soc: f64,
    /// Upper state-of-charge bound as a fraction of capacity.
    pub max_soc: f64,
    /// Rated number of equivalent full cycles (100% depth of discharge)
    /// until the end-of-life threshold is reached.
    pub cycle_life_cycles: f64,
    /// Rated shelf life in years until the end-of-life threshold is
    /// reached with zero cycling.
    pub calendar_life_years: f64,
    /// Capacity loss (% of nameplate) that defines end of life.
    pub eol_threshold_pct: f64,
}

impl Default for BatterySpecification {
    fn default() -> Self {
        Self {
            capacity_kwh: 10.0,
            power_kw: 5.0,
            round_trip_efficiency: 0.9,
            min_soc: 0.1,
            max_soc: 0.9,
            cycle_life_cycles: 6000.0,
            calendar_life_years: 15.0,
            eol_threshold_pct: 20.0,
        }
    }
}

impl BatterySpecification {
    /// Validate the specification, consuming and returning it so call sites
    /// can fail fast at construction.
    pub fn validated(self) -> Result<Self, DispatchError> {
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        let err = |msg: String| Err(DispatchError::Configuration(msg));
        if !(self.capacity_kwh.is_finite() && self.capacity_kwh > 0.0) {
            return err(format!("battery capacity must be > 0, got {}", self.capacity_kwh));
        }
        if !(self.power_kw.is_finite() && self.power_kw > 0.0) {
            return err(format!("battery power rating must be > 0, got {}", self.power_kw));
        }
        if !(self.round_trip_efficiency > 0.0 && self.round_trip_efficiency <= 1.0) {
            return err(format!(
                "round-trip efficiency must be in (0, 1], got {}",
                self.round_trip_efficiency
            ));
        }
        if !(0.0 <= self.min_soc && self.min_soc < self.max_soc && self.max_soc <= 1.0) {
            return err(format!(
                "SOC bounds must satisfy 0 <= min < max <= 1, got min={} max={}",
                self.min_soc, self.max_soc
            ));
        }
        if !(self.cycle_life_cycles.is_finite() && self.cycle_life_cycles > 0.0) {
            return err(format!("cycle life must be > 0, got {}", self.cycle_life_cycles));
        }
        if !(self.calendar_life_years.is_finite() && self.calendar_life_years > 0.0) {
            return err(format!(
                "calendar life must be > 0, got {}",
                self.calendar_life_years
            ));
        }
        if !(self.eol_threshold_pct > 0.0 && self.eol_threshold_pct <= 100.0) {
            return err(format!(
                "end-of-life threshold must be in (0, 100] percent, got {}",
                self.eol_threshold_pct
            ));
        }
        Ok(())
    }

    /// One-way efficiency applied on each leg (sqrt of round-trip).
    pub fn one_way_efficiency(&self) -> f64 {
        self.round_trip_efficiency.sqrt()
    }

    /// Lowest permitted stored energy (kWh).
    pub fn min_soc_kwh(&self) -> f64 {
        self.min_soc * self.capacity_kwh
    }

    /// Highest permitted stored energy (kWh).
    pub fn max_soc_kwh(&self) -> f64 {
        self.max_soc * self.capacity_kwh
    }
}
