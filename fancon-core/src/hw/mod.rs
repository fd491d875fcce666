//! Hardware backends implementing the `Sensor`/`Fan` traits (spec §4.1,
//! §4.2): generic sysfs hwmon, Dell SMM, and NVIDIA via NVML.

pub mod dell;
pub mod nvidia;
pub mod sysfs;

pub use dell::{smm_present, FanDell};
pub use nvidia::{open_gpu, FanNvidia, NvidiaSensor};
pub use sysfs::{enumerate as enumerate_sysfs, DiscoveredFan, DiscoveredSensor, FanSysfs, SysfsSensor};
