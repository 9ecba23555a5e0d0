use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Solver execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Wall-clock budget per window solve (milliseconds).
    pub time_limit_ms: u64,
    /// Numerical tolerance for validating the returned primal; relaxed
    /// tenfold for the single post-timeout retry.
    pub tolerance: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            time_limit_ms: 30_000,
            tolerance: 1e-6,
        }
    }
}

/// Per-scenario dispatch configuration, passed by reference into each
/// component's constructor. Independent what-if runs construct their own
/// value; nothing here is process-global.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Planning window length in steps.
    pub horizon_steps: usize,
    /// Steps committed per iteration; must stay below the horizon so
    /// later steps are re-optimized with fresher information.
    pub commit_steps: usize,
    /// Premium paid on top of the spot price for exported energy.
    pub feed_in_premium_per_kwh: f64,
    /// Site export limit (kW).
    pub export_limit_kw: f64,
    /// Site fuse limit on grid import (kW); `None` means unlimited.
    pub grid_import_limit_kw: Option<f64>,
    /// Price of one percent of nameplate capacity loss, typically derived
    /// from the replacement cost via
    /// [`degradation_price_from_replacement_cost`].
    pub degradation_price_per_percent: f64,
    /// Small objective penalty per kWh of battery throughput that rules
    /// out simultaneous nonzero charge and discharge in the continuous
    /// relaxation.
    pub simultaneity_penalty: f64,
    pub solver: SolverSettings,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            horizon_steps: 24,
            commit_steps: 6,
            feed_in_premium_per_kwh: 0.0,
            export_limit_kw: 17.25,
            grid_import_limit_kw: None,
            degradation_price_per_percent: 0.0,
            simultaneity_penalty: 1e-4,
            solver: SolverSettings::default(),
        }
    }
}

impl ScenarioConfig {
    pub fn validate(&self) -> Result<(), DispatchError> {
        let err = |msg: String| Err(DispatchError::Configuration(msg));
        if self.horizon_steps < 2 {
            return err(format!(
                "horizon must span at least 2 steps, got {}",
                self.horizon_steps
            ));
        }
        if self.commit_steps == 0 || self.commit_steps >= self.horizon_steps {
            return err(format!(
                "commit steps must satisfy 1 <= k < horizon ({}), got {}",
                self.horizon_steps, self.commit_steps
            ));
        }
        if !(self.feed_in_premium_per_kwh.is_finite()) {
            return err(format!(
                "feed-in premium must be finite, got {}",
                self.feed_in_premium_per_kwh
            ));
        }
        if !(self.export_limit_kw.is_finite() && self.export_limit_kw >= 0.0) {
            return err(format!(
                "export limit must be >= 0, got {}",
                self.export_limit_kw
            ));
        }
        if let Some(limit) = self.grid_import_limit_kw {
            if !(limit.is_finite() && limit > 0.0) {
                return err(format!("grid import limit must be > 0, got {limit}"));
            }
        }
        if !(self.degradation_price_per_percent.is_finite()
            && self.degradation_price_per_percent >= 0.0)
        {
            return err(format!(
                "degradation price must be >= 0, got {}",
                self.degradation_price_per_percent
            ));
        }
        if !(self.simultaneity_penalty.is_finite() && self.simultaneity_penalty >= 0.0) {
            return err(format!(
                "simultaneity penalty must be >= 0, got {}",
                self.simultaneity_penalty
            ));
        }
        if self.solver.time_limit_ms == 0 {
            return err("solver time limit must be positive".into());
        }
        if !(self.solver.tolerance.is_finite() && self.solver.tolerance > 0.0) {
            return err(format!(
                "solver tolerance must be > 0, got {}",
                self.solver.tolerance
            ));
        }
        Ok(())
    }

    /// Load from `config/dispatch.toml` with `DISPATCH__` environment
    /// overrides, e.g. `DISPATCH__HORIZON_STEPS=48`.
    pub fn load() -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file("config/dispatch.toml"))
            .merge(Env::prefixed("DISPATCH__").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }
}

/// Price of one percent of nameplate capacity loss given the battery
/// replacement cost: the battery is fully consumed once the end-of-life
/// threshold is reached.
pub fn degradation_price_from_replacement_cost(
    replacement_cost: f64,
    eol_threshold_pct: f64,
) -> f64 {
    replacement_cost / eol_threshold_pct
}
