//! Shared wire schema for fancon: the `Devices` message used both as the
//! on-disk persisted configuration and as the payload of the `GetDevices`
//! / `SetDevices` RPCs, plus the `Request`/`Response` envelopes framing the
//! full RPC surface over the daemon's Unix domain socket.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maximum message size for a single framed RPC line.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Generate a unique request ID for correlation.
pub fn generate_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// ===========================================================================
// Device data model (spec §3, §6) — the single schema shared by persistence
// and RPC.
// ===========================================================================

/// Hardware backend a Fan or Sensor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Sys,
    Dell,
    Nv,
}

/// A single curve point: `(temp, rpm, pwm)`, at least one of rpm/pwm set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub temp: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwm: Option<u8>,
}

impl Point {
    pub fn rpm(temp: i32, rpm: u32) -> Self {
        Self { temp, rpm: Some(rpm), pwm: None }
    }

    pub fn pwm(temp: i32, pwm: u8) -> Self {
        Self { temp, rpm: None, pwm: Some(pwm) }
    }
}

/// Serialisable Sensor record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub label: String,
    pub backend: BackendKind,
    /// sysfs path, or `nvidia:<gpu_index>:<sensor_target>` for NV sensors.
    pub identity: String,
    pub temp_averaging_intervals: u32,
}

/// Serialisable Fan record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fan {
    pub label: String,
    pub backend: BackendKind,
    /// sysfs pwm path, or `nvidia:<gpu_index>:<fan_index>` for NV fans.
    pub identity: String,
    pub sensor_label: String,
    /// Ordered by `temp`. Serialised as a sorted vector, loaded into a
    /// `BTreeMap<i32, u32>` at runtime.
    pub temp_to_rpm: Vec<Point>,
    /// Ordered by `rpm`. Serialised as a sorted vector, loaded into a
    /// `BTreeMap<u32, u8>` at runtime.
    pub rpm_to_pwm: Vec<Point>,
    pub start_pwm: u8,
    pub interval_ms: u32,
    pub enabled: bool,
    /// Elected Dell SMM manual-control method (1, 2, or 3), only meaningful
    /// when `backend == BackendKind::Dell`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_flag: Option<u8>,
}

/// The top-level persisted / transmitted container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Devices {
    pub sensors: BTreeMap<String, Sensor>,
    pub fans: BTreeMap<String, Fan>,
}

impl Devices {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Status of a single fan as seen by the controller (spec §3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanState {
    Disabled,
    Enabled,
    Testing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanStatus {
    pub label: String,
    pub state: FanState,
    pub rpm: u32,
    pub pwm: u8,
}

/// Controller-wide configuration exposed via Get/SetControllerConfig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub default_interval_ms: u32,
    pub smoothing_intervals: u32,
    pub top_stickiness_intervals: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 1000,
            smoothing_intervals: 5,
            top_stickiness_intervals: 3,
        }
    }
}

// ===========================================================================
// RPC envelopes and surface (spec §6)
// ===========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self { id: generate_request_id(), request }
    }

    pub fn with_id(request: Request, id: u64) -> Self {
        Self { id, request }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    StopService,
    GetDevices,
    SetDevices { devices: Devices },
    SubscribeDevices,
    GetEnumeratedDevices,
    GetControllerConfig,
    SetControllerConfig { config: ControllerConfig },
    GetFanStatus { label: String },
    SubscribeFanStatus,
    Enable { label: String },
    EnableAll,
    Disable { label: String },
    DisableAll,
    Test { label: String, forced: bool },
    Reload,
    NvInit,
}

impl Request {
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::StopService => "StopService",
            Request::GetDevices => "GetDevices",
            Request::SetDevices { .. } => "SetDevices",
            Request::SubscribeDevices => "SubscribeDevices",
            Request::GetEnumeratedDevices => "GetEnumeratedDevices",
            Request::GetControllerConfig => "GetControllerConfig",
            Request::SetControllerConfig { .. } => "SetControllerConfig",
            Request::GetFanStatus { .. } => "GetFanStatus",
            Request::SubscribeFanStatus => "SubscribeFanStatus",
            Request::Enable { .. } => "Enable",
            Request::EnableAll => "EnableAll",
            Request::Disable { .. } => "Disable",
            Request::DisableAll => "DisableAll",
            Request::Test { .. } => "Test",
            Request::Reload => "Reload",
            Request::NvInit => "NvInit",
        }
    }

    /// Streaming requests keep the connection open and emit multiple
    /// `ResponseEnvelope`s sharing the same request id.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Request::SubscribeDevices | Request::SubscribeFanStatus | Request::Test { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, response }
    }
}

/// RPC status codes, matching spec §6/§7's NOT_FOUND / UNAVAILABLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    NotFound,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponseData),
    #[serde(rename = "error")]
    Error { code: StatusCode, message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub devices: Option<Devices>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ControllerConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_status: Option<FanStatus>,
    /// 0-100, present on `Test` progress responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_progress: Option<u8>,
}

impl ResponseData {
    pub fn none() -> Self {
        Self::default()
    }
    pub fn devices(d: Devices) -> Self {
        Self { devices: Some(d), ..Self::default() }
    }
    pub fn config(c: ControllerConfig) -> Self {
        Self { config: Some(c), ..Self::default() }
    }
    pub fn fan_status(s: FanStatus) -> Self {
        Self { fan_status: Some(s), ..Self::default() }
    }
    pub fn test_progress(p: u8) -> Self {
        Self { test_progress: Some(p), ..Self::default() }
    }
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(ResponseData::none())
    }
    pub fn ok_devices(d: Devices) -> Self {
        Response::Ok(ResponseData::devices(d))
    }
    pub fn ok_config(c: ControllerConfig) -> Self {
        Response::Ok(ResponseData::config(c))
    }
    pub fn ok_fan_status(s: FanStatus) -> Self {
        Response::Ok(ResponseData::fan_status(s))
    }
    pub fn ok_test_progress(p: u8) -> Self {
        Response::Ok(ResponseData::test_progress(p))
    }
    pub fn not_found(label: impl Into<String>) -> Self {
        Response::Error { code: StatusCode::NotFound, message: label.into() }
    }
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Response::Error { code: StatusCode::Unavailable, message: msg.into() }
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Response::Error { code: StatusCode::Internal, message: msg.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_round_trip_byte_identical() {
        let mut devices = Devices::new();
        devices.sensors.insert(
            "cpu".into(),
            Sensor {
                label: "cpu".into(),
                backend: BackendKind::Sys,
                identity: "/sys/class/hwmon/hwmon0/temp1_input".into(),
                temp_averaging_intervals: 5,
            },
        );
        devices.fans.insert(
            "cpu_fan".into(),
            Fan {
                label: "cpu_fan".into(),
                backend: BackendKind::Sys,
                identity: "/sys/class/hwmon/hwmon0/pwm1".into(),
                sensor_label: "cpu".into(),
                temp_to_rpm: vec![Point::rpm(20, 500), Point::rpm(60, 1500)],
                rpm_to_pwm: vec![Point::pwm(500, 80), Point::pwm(1500, 240)],
                start_pwm: 120,
                interval_ms: 1000,
                enabled: true,
                driver_flag: None,
            },
        );

        let serialized = serde_json::to_vec(&devices).unwrap();
        let deserialized: Devices = serde_json::from_slice(&serialized).unwrap();
        assert_eq!(devices, deserialized);
        let reserialized = serde_json::to_vec(&deserialized).unwrap();
        assert_eq!(serialized, reserialized);
    }

    #[test]
    fn request_envelope_flattens_cmd_tag() {
        let env = RequestEnvelope::with_id(Request::Enable { label: "cpu_fan".into() }, 7);
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"cmd\":\"Enable\""));
        let back: RequestEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.request.type_name(), "Enable");
    }
}
