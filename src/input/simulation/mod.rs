//! Simulated radio for development and tests.

mod devices;
mod radio;

pub use devices::{demo_fingerprints, run_device_simulation};
pub use radio::{SimOutcome, SimulatedRadio};
