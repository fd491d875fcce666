//! NVIDIA GPU fan/sensor backend for fancon (spec §4.5).
//!
//! Wraps NVML: GPU discovery, temperature reads, and fan duty-cycle
//! control. `fancon_core` builds its `Fan`/`Sensor` trait implementations
//! on top of the types and handle exposed here; this crate knows nothing
//! about the engine's curve/smoothing logic.

pub mod constants;
mod types;
pub mod nvidia;

pub use nvidia::{enumerate_gpus, GpuHandle};
pub use types::{GpuFanTarget, GpuInfo, GpuSensorTarget};
