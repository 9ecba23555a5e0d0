//! LP dispatch solver.
//!
//! Builds and solves, per rolling window, the linear program that yields
//! the cost-minimizing charge/discharge/import/export/curtailment/SOC
//! trajectory. Continuous variables only: the bracket tariff enters
//! through its convex envelope (see [`crate::domain::tariff`]) rather
//! than big-M selection binaries, which keeps the problem a plain LP the
//! pure-Rust backend solves quickly.

use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use good_lp::{
    constraint, default_solver, variable, Expression, ProblemVariables, ResolutionError, Solution,
    SolverModel, Variable,
};
use tracing::{debug, warn};

use crate::config::ScenarioConfig;
use crate::domain::{BatterySpecification, DegradationModel, TariffStructure, TimePoint};
use crate::error::DispatchError;
use crate::optimizer::types::{DispatchStep, ObjectiveBreakdown, WindowSolution};
use crate::state::{month_start_of, OperatingState};

/// Tolerance multiplier for the single retry after a solver timeout.
const TOLERANCE_RELAXATION: f64 = 10.0;

/// Windows beyond this size are legal but slow; the solver warns once per
/// solve.
const LARGE_WINDOW_STEPS: usize = 168;

/// Per-window LP dispatch solver, parameterized by borrowed context
/// structs so independent scenario runs share nothing mutable.
pub struct DispatchSolver<'a> {
    spec: &'a BatterySpecification,
    tariff: &'a TariffStructure,
    config: &'a ScenarioConfig,
    degradation: DegradationModel,
}

/// Consecutive steps of one calendar month inside a window, with the peak
/// variable's lower bound (month-to-date peak for the running month, zero
/// for months the window opens).
struct MonthBlock {
    month_start: DateTime<Utc>,
    steps: Vec<usize>,
    peak_floor_kw: f64,
}

impl<'a> DispatchSolver<'a> {
    /// Fail fast on any malformed context before the first solve.
    pub fn new(
        spec: &'a BatterySpecification,
        tariff: &'a TariffStructure,
        config: &'a ScenarioConfig,
    ) -> Result<Self, DispatchError> {
        spec.validate()?;
        tariff.validate()?;
        config.validate()?;
        Ok(Self {
            spec,
            tariff,
            config,
            degradation: DegradationModel::from_spec(spec),
        })
    }

    /// Solve one window. A timeout is retried once with a relaxed
    /// tolerance before surfacing `SolverTimeout`.
    pub fn solve_window(
        &self,
        window: &[TimePoint],
        resolution: Duration,
        state: &OperatingState,
    ) -> Result<WindowSolution, DispatchError> {
        match self.solve_once(window, resolution, state, self.config.solver.tolerance) {
            Err(DispatchError::SolverTimeout {
                window_start,
                window_end,
                budget_ms,
            }) => {
                let relaxed = self.config.solver.tolerance * TOLERANCE_RELAXATION;
                warn!(
                    %window_start,
                    %window_end,
                    budget_ms,
                    relaxed_tolerance = relaxed,
                    "solver timed out, retrying once with relaxed tolerance"
                );
                self.solve_once(window, resolution, state, relaxed)
            }
            other => other,
        }
    }

    fn solve_once(
        &self,
        window: &[TimePoint],
        resolution: Duration,
        state: &OperatingState,
        tolerance: f64,
    ) -> Result<WindowSolution, DispatchError> {
        let n = window.len();
        if n == 0 {
            return Err(DispatchError::Configuration(
                "cannot solve an empty window".into(),
            ));
        }
        if n > LARGE_WINDOW_STEPS {
            warn!(
                steps = n,
                "window is large; consider a shorter horizon for faster solves"
            );
        }
        let dt_h = resolution.num_seconds() as f64 / 3600.0;
        let window_start = window[0].timestamp;
        let window_end = window[n - 1].timestamp + resolution;

        let soc_min = self.spec.min_soc_kwh();
        let soc_max = self.spec.max_soc_kwh();
        let initial_soc = state.soc_kwh().clamp(soc_min, soc_max);
        let eta = self.spec.one_way_efficiency();

        let mut vars = ProblemVariables::new();
        let charge = vars.add_vector(variable().min(0.0).max(self.spec.power_kw), n);
        let discharge = vars.add_vector(variable().min(0.0).max(self.spec.power_kw), n);
        let import = match self.config.grid_import_limit_kw {
            Some(limit) => vars.add_vector(variable().min(0.0).max(limit), n),
            None => vars.add_vector(variable().min(0.0), n),
        };
        let export = vars.add_vector(
            variable().min(0.0).max(self.config.export_limit_kw),
            n,
        );
        let curtail = vars.add_vector(variable().min(0.0), n);
        let soc = vars.add_vector(variable().min(soc_min).max(soc_max), n + 1);

        // One peak-tracking variable and one envelope cost variable per
        // calendar month overlapping the window. Minimization pressure
        // drives the peak to the true maximum import of its month.
        let months = self.month_blocks(window, state);
        let segments = self.tariff.envelope_segments();
        let has_demand_charge = !segments.is_empty();
        let peaks: Vec<Variable> = if has_demand_charge {
            months
                .iter()
                .map(|m| vars.add(variable().min(m.peak_floor_kw)))
                .collect()
        } else {
            Vec::new()
        };
        let tariff_costs: Vec<Variable> = if has_demand_charge {
            months.iter().map(|_| vars.add(variable().min(0.0))).collect()
        } else {
            Vec::new()
        };

        // Objective, all energy terms as power x step duration. The wear
        // coefficient prices cyclic degradation per the linear model; the
        // simultaneity penalty breaks the charge-and-discharge-at-once
        // degeneracy of the continuous relaxation.
        let wear_coeff = self.config.degradation_price_per_percent
            * self.degradation.cyclic_pct_per_kwh_throughput()
            + self.config.simultaneity_penalty;
        let energy_cost: Expression = (0..n)
            .map(|t| {
                let buy = window[t].price_per_kwh + self.tariff.import_rate_at(window[t].timestamp);
                let sell = window[t].price_per_kwh + self.config.feed_in_premium_per_kwh;
                import[t] * (buy * dt_h) - export[t] * (sell * dt_h)
            })
            .sum();
        let wear_cost: Expression = (0..n)
            .map(|t| (charge[t] + discharge[t]) * (wear_coeff * dt_h))
            .sum();
        let demand_cost: Expression = tariff_costs.iter().copied().map(Expression::from).sum();
        let objective = energy_cost + wear_cost + demand_cost;

        let mut model = vars.minimise(objective).using(default_solver);
        model = model.with(constraint!(soc[0] == initial_soc));
        for t in 0..n {
            // Power balance, AC side: production + discharge + import
            // covers load + charge + export; curtailment sheds surplus PV.
            let supply = discharge[t] + import[t] - charge[t] - export[t] - curtail[t];
            model = model.with(constraint!(
                supply == window[t].load_kw - window[t].pv_kw
            ));
            // SOC recursion with the efficiency split on each leg.
            let soc_delta = charge[t] * (eta * dt_h) - discharge[t] * (dt_h / eta);
            model = model.with(constraint!(soc[t + 1] == soc[t] + soc_delta));
            // Curtailment cannot exceed available production.
            model = model.with(constraint!(curtail[t] <= window[t].pv_kw));
        }
        if has_demand_charge {
            for (mi, block) in months.iter().enumerate() {
                for &t in &block.steps {
                    model = model.with(constraint!(peaks[mi] >= import[t]));
                }
                for seg in &segments {
                    model = model.with(constraint!(
                        tariff_costs[mi] - peaks[mi] * seg.slope >= seg.intercept
                    ));
                }
            }
        }

        debug!(
            steps = n,
            months = months.len(),
            %window_start,
            "solving dispatch window"
        );
        let started = Instant::now();
        let result = model.solve();
        let elapsed = started.elapsed();
        let budget = std::time::Duration::from_millis(self.config.solver.time_limit_ms);

        let solution = match result {
            Ok(solution) => solution,
            Err(ResolutionError::Infeasible) => {
                return Err(DispatchError::InfeasibleWindow {
                    window_start,
                    window_end,
                    detail: self.diagnose_infeasible(window),
                });
            }
            Err(ResolutionError::Unbounded) => {
                return Err(DispatchError::Configuration(
                    "dispatch objective is unbounded; check the feed-in premium against the \
                     export limit"
                        .into(),
                ));
            }
            Err(other) => {
                if elapsed >= budget {
                    return Err(DispatchError::SolverTimeout {
                        window_start,
                        window_end,
                        budget_ms: self.config.solver.time_limit_ms,
                    });
                }
                return Err(DispatchError::InfeasibleWindow {
                    window_start,
                    window_end,
                    detail: format!("solver failed: {other}"),
                });
            }
        };
        if elapsed >= budget {
            debug!(?elapsed, "solve exceeded its budget but returned a solution");
        }

        // Extract the primal, clamp numerical noise into bounds and verify
        // the power balance within tolerance.
        let mut steps = Vec::with_capacity(n);
        let mut energy = 0.0;
        let mut cyclic_pct = 0.0;
        let mut calendar_pct = 0.0;
        for t in 0..n {
            let c = solution.value(charge[t]).max(0.0);
            let d = solution.value(discharge[t]).max(0.0);
            let imp = solution.value(import[t]).max(0.0);
            let exp = solution.value(export[t]).max(0.0);
            let cur = solution.value(curtail[t]).clamp(0.0, window[t].pv_kw);
            let soc_end = solution.value(soc[t + 1]).clamp(soc_min, soc_max);

            let residual =
                (window[t].pv_kw - cur + d + imp) - (window[t].load_kw + c + exp);
            let scale = 1.0 + window[t].load_kw + window[t].pv_kw + self.spec.power_kw;
            if residual.abs() > tolerance * scale {
                return Err(DispatchError::InfeasibleWindow {
                    window_start,
                    window_end,
                    detail: format!(
                        "power balance residual {residual:.3e} kW at step {t} ({}) exceeds \
                         solver tolerance",
                        window[t].timestamp
                    ),
                });
            }

            let buy = window[t].price_per_kwh + self.tariff.import_rate_at(window[t].timestamp);
            let sell = window[t].price_per_kwh + self.config.feed_in_premium_per_kwh;
            energy += dt_h * (imp * buy - exp * sell);
            let incr = self.degradation.increment(c, d, dt_h);
            cyclic_pct += incr.cyclic_pct;
            calendar_pct += incr.calendar_pct;

            steps.push(DispatchStep {
                timestamp: window[t].timestamp,
                charge_kw: c,
                discharge_kw: d,
                import_kw: imp,
                export_kw: exp,
                curtailment_kw: cur,
                soc_kwh: soc_end,
                degradation_pct: incr.total(),
            });
        }
        let tariff_cost = tariff_costs
            .iter()
            .map(|&v| solution.value(v).max(0.0))
            .sum();
        let degradation_cost =
            self.config.degradation_price_per_percent * (cyclic_pct + calendar_pct);

        Ok(WindowSolution {
            window_start,
            window_end,
            steps,
            objective: ObjectiveBreakdown {
                energy_cost: energy,
                tariff_cost,
                degradation_cost,
            },
        })
    }

    /// Group window steps into consecutive calendar-month blocks.
    fn month_blocks(&self, window: &[TimePoint], state: &OperatingState) -> Vec<MonthBlock> {
        let mut blocks: Vec<MonthBlock> = Vec::new();
        for (i, point) in window.iter().enumerate() {
            let month_start = month_start_of(point.timestamp);
            match blocks.last_mut() {
                Some(block) if block.month_start == month_start => block.steps.push(i),
                _ => blocks.push(MonthBlock {
                    month_start,
                    steps: vec![i],
                    peak_floor_kw: if month_start == state.month_start() {
                        state.month_to_date_peak_kw()
                    } else {
                        0.0
                    },
                }),
            }
        }
        blocks
    }

    /// Name the violated constraint class for an infeasible window. The
    /// only structurally infeasible case is a step whose load exceeds
    /// every available source; anything else is SOC coupling.
    fn diagnose_infeasible(&self, window: &[TimePoint]) -> String {
        if let Some(limit) = self.config.grid_import_limit_kw {
            for (i, point) in window.iter().enumerate() {
                let supply = limit + point.pv_kw + self.spec.power_kw;
                if point.load_kw > supply {
                    return format!(
                        "load exceeds grid+battery+PV capacity by {:.2} kW at step {i} ({})",
                        point.load_kw - supply,
                        point.timestamp
                    );
                }
            }
        }
        "no feasible state-of-charge trajectory within energy and power bounds".into()
    }
}
