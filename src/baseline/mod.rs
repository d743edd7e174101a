/// Known-good deploy baselines
pub mod registry;

pub use registry::{BaselineEntry, BaselineRate, BaselineRegistry};
