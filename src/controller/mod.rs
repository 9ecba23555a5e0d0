//! Rolling-horizon controller.
//!
//! Orchestrates repeated window solves, commits only the near-term slice
//! of each solution, advances the operating state and resets month-scoped
//! state at calendar boundaries. Strictly sequential: each window's
//! initial SOC and month-to-date peak are exactly where the previous
//! commit left them. Scenario sweeps parallelize outside this type, one
//! controller and one state per scenario.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ScenarioConfig;
use crate::domain::{
    BatterySpecification, DegradationModel, TariffStructure, TimeSeries,
};
use crate::error::DispatchError;
use crate::optimizer::{DispatchSolver, DispatchStep, ObjectiveBreakdown};
use crate::state::{month_start_of, OperatingState};

/// Controller life cycle. `Committed` loops back to `Solving` until the
/// series is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Solving,
    Committed,
    Terminated,
}

/// Peak and settled demand charge of one calendar month of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlySummary {
    pub month_start: DateTime<Utc>,
    pub peak_kw: f64,
    pub charge: f64,
}

/// Outcome of a full rolling-horizon run. Costs are realized values over
/// the committed trajectory: energy at spot plus fees, demand charges
/// settled per month with the exact bracket evaluator, degradation priced
/// per percent of capacity lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub committed: Vec<DispatchStep>,
    pub totals: ObjectiveBreakdown,
    pub months: Vec<MonthlySummary>,
    pub windows_solved: usize,
    pub retries: usize,
    pub eol_reached: bool,
    pub final_state: OperatingState,
}

/// Receding-horizon dispatch driver. Owns the run's operating state;
/// borrows the immutable context structs.
pub struct RollingHorizonController<'a> {
    solver: DispatchSolver<'a>,
    spec: &'a BatterySpecification,
    tariff: &'a TariffStructure,
    config: &'a ScenarioConfig,
    degradation: DegradationModel,
    state: OperatingState,
    phase: Phase,
}

impl<'a> RollingHorizonController<'a> {
    pub fn new(
        spec: &'a BatterySpecification,
        tariff: &'a TariffStructure,
        config: &'a ScenarioConfig,
        state: OperatingState,
    ) -> Result<Self, DispatchError> {
        let solver = DispatchSolver::new(spec, tariff, config)?;
        Ok(Self {
            solver,
            spec,
            tariff,
            config,
            degradation: DegradationModel::from_spec(spec),
            state,
            phase: Phase::Idle,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &OperatingState {
        &self.state
    }

    /// Drive the run over the whole series. On a retryable solve failure
    /// the window is re-solved once with a halved horizon before the run
    /// terminates with the error.
    pub fn run(&mut self, series: &TimeSeries) -> Result<DispatchReport, DispatchError> {
        let first = series.points()[0].timestamp;
        if first < self.state.last_update() {
            return Err(DispatchError::StateConsistency(format!(
                "series starts at {first}, before the state's last update {}",
                self.state.last_update()
            )));
        }
        let resolution = series.resolution();
        let dt_h = series.step_hours();

        let mut committed: Vec<DispatchStep> = Vec::with_capacity(series.len());
        let mut totals = ObjectiveBreakdown::default();
        let mut months: Vec<MonthlySummary> = Vec::new();
        let mut windows_solved = 0usize;
        let mut retries = 0usize;
        let mut eol_reached = false;

        let mut cursor = 0usize;
        while cursor < series.len() {
            self.phase = Phase::Solving;
            let window = series.window(cursor, self.config.horizon_steps);
            let solution = match self.solver.solve_window(window, resolution, &self.state) {
                Ok(solution) => solution,
                Err(e) if e.is_retryable() => {
                    retries += 1;
                    let shrunk = (self.config.horizon_steps / 2)
                        .max(self.config.commit_steps)
                        .max(1);
                    warn!(
                        error = %e,
                        shrunk_horizon = shrunk,
                        "window solve failed, retrying with a shrunk horizon"
                    );
                    let window = series.window(cursor, shrunk);
                    match self.solver.solve_window(window, resolution, &self.state) {
                        Ok(solution) => solution,
                        Err(e) => {
                            self.phase = Phase::Terminated;
                            error!(error = %e, "dispatch run aborted");
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    self.phase = Phase::Terminated;
                    return Err(e);
                }
            };
            windows_solved += 1;

            // Commit only the near-term slice; later steps are
            // re-optimized next iteration with fresher state.
            let k = self.config.commit_steps.min(solution.steps.len());
            for offset in 0..k {
                let step = solution.steps[offset];
                let point = &series.points()[cursor + offset];

                // Month boundary inside the committed slice: settle the
                // closing month, then reset the peak tracker at the exact
                // boundary timestamp.
                let step_month = month_start_of(step.timestamp);
                if step_month != self.state.month_start() {
                    let peak = self.state.month_to_date_peak_kw();
                    let charge = self.tariff.monthly_charge(peak);
                    months.push(MonthlySummary {
                        month_start: self.state.month_start(),
                        peak_kw: peak,
                        charge,
                    });
                    totals.tariff_cost += charge;
                    info!(
                        closed_month = %self.state.month_start(),
                        peak_kw = peak,
                        charge,
                        boundary = %step_month,
                        "monthly peak settled and reset"
                    );
                    self.state.reset_monthly_peak(step_month)?;
                }

                let incr =
                    self.degradation
                        .increment(step.charge_kw, step.discharge_kw, dt_h);
                self.state.apply_degradation(incr.total())?;
                self.state.update_from_measurement(
                    step.timestamp + resolution,
                    step.soc_kwh,
                    step.import_kw,
                )?;

                let buy = point.price_per_kwh + self.tariff.import_rate_at(point.timestamp);
                let sell = point.price_per_kwh + self.config.feed_in_premium_per_kwh;
                totals.energy_cost += dt_h * (step.import_kw * buy - step.export_kw * sell);
                totals.degradation_cost +=
                    self.config.degradation_price_per_percent * incr.total();
                committed.push(step);

                if !eol_reached
                    && self.state.cumulative_degradation_pct() >= self.spec.eol_threshold_pct
                {
                    warn!(
                        cumulative_pct = self.state.cumulative_degradation_pct(),
                        threshold_pct = self.spec.eol_threshold_pct,
                        at = %step.timestamp,
                        "battery crossed its end-of-life threshold"
                    );
                    eol_reached = true;
                }
            }
            self.phase = Phase::Committed;
            debug!(
                cursor,
                committed = k,
                soc_kwh = self.state.soc_kwh(),
                "window committed"
            );
            cursor += k;
        }

        // Settle the final, possibly partial month.
        let peak = self.state.month_to_date_peak_kw();
        let charge = self.tariff.monthly_charge(peak);
        months.push(MonthlySummary {
            month_start: self.state.month_start(),
            peak_kw: peak,
            charge,
        });
        totals.tariff_cost += charge;

        self.phase = Phase::Terminated;
        info!(
            steps = committed.len(),
            windows_solved,
            total_cost = totals.total(),
            "dispatch run complete"
        );
        Ok(DispatchReport {
            committed,
            totals,
            months,
            windows_solved,
            retries,
            eol_reached,
            final_state: self.state.clone(),
        })
    }
}

/// Run one what-if scenario end to end with its own freshly constructed
/// operating state. Scenario sweeps call this from independent threads;
/// nothing is shared between calls.
pub fn run_scenario(
    spec: &BatterySpecification,
    tariff: &TariffStructure,
    config: &ScenarioConfig,
    series: &TimeSeries,
    initial_soc_kwh: f64,
) -> Result<DispatchReport, DispatchError> {
    let start = series.points()[0].timestamp;
    let state = OperatingState::new(spec, initial_soc_kwh, start)?;
    let mut controller = RollingHorizonController::new(spec, tariff, config, state)?;
    controller.run(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TariffBracket, TimePoint};
    use chrono::{Duration, TimeZone};

    fn flat_series(start: DateTime<Utc>, n: usize, load_kw: f64) -> TimeSeries {
        let points: Vec<TimePoint> = (0..n)
            .map(|i| TimePoint {
                timestamp: start + Duration::hours(i as i64),
                price_per_kwh: 0.25,
                pv_kw: 0.0,
                load_kw,
            })
            .collect();
        TimeSeries::new(points, Duration::hours(1)).unwrap()
    }

    fn demand_tariff() -> TariffStructure {
        TariffStructure::new(
            vec![
                TariffBracket::new(0.0, 10.0, 100.0),
                TariffBracket::new(10.0, 20.0, 300.0),
                TariffBracket::new(20.0, 40.0, 900.0),
            ],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn commits_every_step_and_terminates() {
        let spec = BatterySpecification::default();
        let tariff = demand_tariff();
        let config = ScenarioConfig::default();
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let series = flat_series(start, 48, 8.0);

        let state = OperatingState::new(&spec, 5.0, start).unwrap();
        let mut controller =
            RollingHorizonController::new(&spec, &tariff, &config, state).unwrap();
        assert_eq!(controller.phase(), Phase::Idle);
        let report = controller.run(&series).unwrap();
        assert_eq!(controller.phase(), Phase::Terminated);
        assert_eq!(report.committed.len(), 48);
        // 48 steps at 6 committed per window.
        assert_eq!(report.windows_solved, 8);
        assert_eq!(report.retries, 0);
        assert_eq!(report.months.len(), 1);
    }

    #[test]
    fn committed_soc_stays_within_bounds() {
        let spec = BatterySpecification::default();
        let tariff = demand_tariff();
        let config = ScenarioConfig::default();
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let series = flat_series(start, 72, 12.0);
        let report = run_scenario(&spec, &tariff, &config, &series, 5.0).unwrap();
        for step in &report.committed {
            assert!(step.soc_kwh >= spec.min_soc_kwh() - 1e-6);
            assert!(step.soc_kwh <= spec.max_soc_kwh() + 1e-6);
        }
    }

    /// A window spanning a month boundary resets the peak exactly once,
    /// at the boundary timestamp, leaving SOC and degradation untouched.
    #[test]
    fn month_boundary_resets_peak_at_exact_timestamp() {
        let spec = BatterySpecification::default();
        let tariff = demand_tariff();
        let config = ScenarioConfig {
            horizon_steps: 12,
            commit_steps: 4,
            ..Default::default()
        };
        // 2025-01-31 18:00 .. 2025-02-01 06:00, crossing midnight.
        let start = Utc.with_ymd_and_hms(2025, 1, 31, 18, 0, 0).unwrap();
        let series = flat_series(start, 12, 15.0);
        let report = run_scenario(&spec, &tariff, &config, &series, 5.0).unwrap();

        let feb = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let jan = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(report.months.len(), 2);
        assert_eq!(report.months[0].month_start, jan);
        assert_eq!(report.months[1].month_start, feb);
        assert!(report.months[0].peak_kw > 0.0);
        assert_eq!(report.final_state.month_start(), feb);
        // Both month charges were settled with the exact bracket table.
        for month in &report.months {
            assert!((month.charge - tariff.monthly_charge(month.peak_kw)).abs() < 1e-9);
        }
        // Degradation accrued monotonically across the boundary.
        let mut cumulative = 0.0;
        for step in &report.committed {
            assert!(step.degradation_pct >= 0.0);
            cumulative += step.degradation_pct;
        }
        assert!(
            (report.final_state.cumulative_degradation_pct() - cumulative).abs() < 1e-9
        );
    }

    #[test]
    fn infeasible_run_aborts_with_window_context() {
        let spec = BatterySpecification::default();
        let tariff = TariffStructure::energy_only();
        let config = ScenarioConfig {
            grid_import_limit_kw: Some(5.0),
            ..Default::default()
        };
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let series = flat_series(start, 24, 30.0);
        let state = OperatingState::new(&spec, 5.0, start).unwrap();
        let mut controller =
            RollingHorizonController::new(&spec, &tariff, &config, state).unwrap();
        let result = controller.run(&series);
        assert_eq!(controller.phase(), Phase::Terminated);
        match result {
            Err(DispatchError::InfeasibleWindow {
                window_start,
                detail,
                ..
            }) => {
                assert_eq!(window_start, start);
                assert!(detail.contains("load exceeds"));
            }
            other => panic!("expected InfeasibleWindow, got {other:?}"),
        }
    }

    /// Crossing the end-of-life threshold is reported, not enforced: the
    /// run continues and the flag is set.
    #[test]
    fn end_of_life_crossing_is_reported() {
        let spec = BatterySpecification {
            // Shelf life of roughly nine hours burns through the
            // threshold within the run.
            calendar_life_years: 0.001,
            ..Default::default()
        };
        let tariff = TariffStructure::energy_only();
        let config = ScenarioConfig::default();
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let series = flat_series(start, 24, 4.0);
        let report = run_scenario(&spec, &tariff, &config, &series, 5.0).unwrap();
        assert!(report.eol_reached);
        assert_eq!(report.committed.len(), 24);
        assert!(
            report.final_state.cumulative_degradation_pct() > spec.eol_threshold_pct
        );
    }

    #[test]
    fn rejects_series_starting_before_state() {
        let spec = BatterySpecification::default();
        let tariff = TariffStructure::energy_only();
        let config = ScenarioConfig::default();
        let late = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let series = flat_series(early, 24, 5.0);
        let state = OperatingState::new(&spec, 5.0, late).unwrap();
        let mut controller =
            RollingHorizonController::new(&spec, &tariff, &config, state).unwrap();
        assert!(matches!(
            controller.run(&series),
            Err(DispatchError::StateConsistency(_))
        ));
    }
}
