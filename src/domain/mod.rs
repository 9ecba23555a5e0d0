pub mod battery;
pub mod degradation;
pub mod tariff;
pub mod timeseries;

pub use battery::*;
pub use degradation::*;
pub use tariff::*;
pub use timeseries::*;
