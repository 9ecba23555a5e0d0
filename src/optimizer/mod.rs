pub mod lp;
pub mod types;

pub use lp::*;
pub use types::*;
