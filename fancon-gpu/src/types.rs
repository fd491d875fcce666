//! Enumeration results for the NVIDIA backend (spec §4.5 item 4:
//! "enumerate GPUs, discover coolers/thermal sensors, produce labelled
//! devices").

/// A GPU discovered via NVML, with its cooler (fan) and thermal-sensor
/// target counts, used to synthesize `fancon_protocol::Fan`/`Sensor`
/// labels and identities at enumeration time.
#[derive(Debug, Clone)]
pub struct GpuInfo {
    /// NVML device index, used to re-open the device handle later.
    pub index: u32,
    pub name: String,
    pub num_fans: u32,
}

/// A single cooler (fan) target on a GPU, addressed as `nvidia:<gpu
/// index>:<fan index>` in `fancon_protocol::Fan::identity`.
#[derive(Debug, Clone, Copy)]
pub struct GpuFanTarget {
    pub gpu_index: u32,
    pub fan_index: u32,
}

/// The GPU's primary thermal sensor target, addressed as
/// `nvidia:<gpu index>:core` in `fancon_protocol::Sensor::identity`.
#[derive(Debug, Clone, Copy)]
pub struct GpuSensorTarget {
    pub gpu_index: u32,
}
