//! Unified error handling for fancon
//!
//! One error type shared across the workspace, covering the error kinds
//! enumerated for the control engine: transient I/O, control loss,
//! configuration, enumeration, RPC, and fatal startup errors.

use std::io;
use std::path::PathBuf;

/// Result type alias using [`FanconError`]
pub type Result<T> = std::result::Result<T, FanconError>;

/// Unified error type for all fancon operations
#[derive(thiserror::Error, Debug)]
pub enum FanconError {
    // ============================================================================
    // I/O and file system
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read {path}: {source}")]
    FileRead { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    FileWrite { path: PathBuf, source: io::Error },

    #[error("path not allowed: {0}")]
    PathNotAllowed(PathBuf),

    // ============================================================================
    // Hardware access (transient I/O)
    // ============================================================================
    #[error("failed to read temperature from {path}: {reason}")]
    TemperatureRead { path: PathBuf, reason: String },

    #[error("failed to read fan RPM from {path}: {reason}")]
    FanRead { path: PathBuf, reason: String },

    #[error("failed to read PWM from {path}: {reason}")]
    PwmRead { path: PathBuf, reason: String },

    #[error("failed to write PWM {value} to {path}: {reason}")]
    PwmWrite {
        path: PathBuf,
        value: u8,
        reason: String,
    },

    #[error("hardware not found: {0}")]
    HardwareNotFound(String),

    // ============================================================================
    // Control loss: set_pwm failed and recover_control exhausted its retries
    // ============================================================================
    #[error("fan {label}: lost control after {attempts} recovery attempts, ceding to driver")]
    ControlLost { label: String, attempts: u32 },

    // ============================================================================
    // Dell SMM
    // ============================================================================
    #[error("Dell SMM port permission acquisition failed: {0}")]
    SmmPortPermission(io::Error),

    #[error("Dell SMM signature check failed (eax={eax:#06x})")]
    SmmSignatureMismatch { eax: u32 },

    #[error("Dell SMM call failed: command={command:#06x} rc={rc}")]
    SmmCallFailed { command: u16, rc: i32 },

    // ============================================================================
    // NVIDIA / NVML
    // ============================================================================
    #[error("NVML not initialized")]
    NvmlNotInitialized,

    #[error("NVML error: {0}")]
    Nvml(String),

    #[error("GPU error: {0}")]
    GpuError(String),

    // ============================================================================
    // Configuration: dropped curve points, unknown sensors
    // ============================================================================
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration value for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("fan {fan} references unknown sensor {sensor}")]
    UnknownSensor { fan: String, sensor: String },

    #[error("failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Enumeration: backend refuses to initialise
    // ============================================================================
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    // ============================================================================
    // Characterisation test
    // ============================================================================
    #[error("fan {label}: characterisation test failed: {reason}")]
    TestFailed { label: String, reason: String },

    // ============================================================================
    // RPC
    // ============================================================================
    #[error("fan not found: {0}")]
    NotFound(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    // ============================================================================
    // Fatal startup errors
    // ============================================================================
    #[error("fatal startup error: {0}")]
    Fatal(String),

    // ============================================================================
    // Generic
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl FanconError {
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error should surface to an RPC client as NOT_FOUND.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FanconError::NotFound(_))
    }

    /// Whether this error should surface to an RPC client as UNAVAILABLE.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, FanconError::Unavailable(_))
    }
}

impl From<String> for FanconError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

impl From<&str> for FanconError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
