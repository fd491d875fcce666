//! Core fan control engine for fancon: the polymorphic `Sensor`/`Fan`
//! device abstraction, hardware backends (sysfs, Dell SMM, NVIDIA), curve
//! resolution/smoothing, the per-fan characterisation test, and the
//! `Controller` that ties them together for `fancon-daemon`.

pub mod constants;
pub mod controller;
pub mod data;
pub mod device;
pub mod engine;
pub mod error;
pub mod hw;

pub use controller::Controller;
pub use device::{Fan, Sensor};
pub use error::{FanconError, Result};
