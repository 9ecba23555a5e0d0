//! Rolling-horizon dispatch optimizer for a grid-connected battery
//! co-located with on-site solar.
//!
//! Given price, production and load time series, a battery specification
//! and a progressive monthly power tariff, the crate repeatedly solves a
//! linear program over a moving planning window, commits only the
//! near-term steps of each solution, and carries SOC, month-to-date peak
//! demand and cumulative degradation across window boundaries.
//!
//! The core is synchronous and single-threaded: window solves form a
//! strict sequential chain through [`OperatingState`]. What-if scenario
//! sweeps parallelize around it by giving every scenario its own state
//! and controller (see [`controller::run_scenario`]).
//!
//! No network, file or CLI surface lives here; surrounding layers call in
//! through the typed interfaces re-exported below.

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod optimizer;
pub mod state;

pub use config::{degradation_price_from_replacement_cost, ScenarioConfig, SolverSettings};
pub use controller::{
    run_scenario, DispatchReport, MonthlySummary, Phase, RollingHorizonController,
};
pub use domain::{
    BatterySpecification, DegradationModel, SohIncrement, TariffBracket, TariffStructure,
    TimeOfUseRate, TimePoint, TimeSeries,
};
pub use error::DispatchError;
pub use optimizer::{DispatchSolver, DispatchStep, ObjectiveBreakdown, WindowSolution};
pub use state::OperatingState;
