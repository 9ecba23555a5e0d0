use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One step of a dispatch schedule. Powers are AC-side kW averaged over
/// the step; `soc_kwh` is the stored energy at the end of the step;
/// `degradation_pct` is the state-of-health loss incurred during it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DispatchStep {
    pub timestamp: DateTime<Utc>,
    pub charge_kw: f64,
    pub discharge_kw: f64,
    pub import_kw: f64,
    pub export_kw: f64,
    pub curtailment_kw: f64,
    pub soc_kwh: f64,
    pub degradation_pct: f64,
}

/// Objective value decomposed into its cost components (currency units).
///
/// In a [`WindowSolution`] the tariff component is the LP's convex
/// envelope value, a planning figure; realized reports settle the exact
/// bracket charge instead.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ObjectiveBreakdown {
    pub energy_cost: f64,
    pub tariff_cost: f64,
    pub degradation_cost: f64,
}

impl ObjectiveBreakdown {
    pub fn total(&self) -> f64 {
        self.energy_cost + self.tariff_cost + self.degradation_cost
    }
}

/// Full-window LP output. Immutable once produced; the controller commits
/// only the leading steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSolution {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub steps: Vec<DispatchStep>,
    pub objective: ObjectiveBreakdown,
}
