//! weighin-hw: scale sensor abstraction.
//!
//! Scales report through a `tokio::sync::mpsc` stream of [`ScaleEvent`]s.
//! Ships a simulated scale and a TOML scenario player for benches and tests.

pub mod scale;
pub mod scenario;

pub use scale::{ScaleError, ScaleEvent, ScaleFault, SimulatedScale, SimulatedScaleConfig};
pub use scenario::{Scenario, ScenarioError};
