//! The fan control engine: curve resolution/smoothing (spec §4.2) and the
//! per-fan characterisation test protocol (spec §4.3).

pub mod characterise;
pub mod curve;

pub use characterise::{characterise, derive_interval_ms, CharacterisationResult};
pub use curve::resolve_pwm;
