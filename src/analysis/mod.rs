/// Deviation analysis against deploy baselines
pub mod deviation;

pub use deviation::{Classification, DeviationAnalyzer, DeviationResult};
