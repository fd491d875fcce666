//! Runtime data types and the persistence layer for the device set
//! (spec §3, §6, §9).

mod persistence;
mod types;
mod validation;

pub use persistence::{load, save};
pub use types::{FanCurveTables, SmoothingState};
pub use validation::{
    build_pwm_only_tables, build_rpm_to_pwm, build_temp_to_rpm, clamp_pwm, validate_devices,
    validate_sysfs_path,
};
