//! The `Controller`: owns every configured device, runs one `tokio` task
//! per enabled fan, and fans state changes out to RPC subscribers (spec
//! §4.4, §5, §9). `fancon-daemon`'s RPC server is the only consumer of
//! this type; it never touches a hardware backend directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fancon_error::{FanconError, Result};
use fancon_protocol::{
    BackendKind, ControllerConfig, Devices, FanState, FanStatus, Point,
};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::data::{self, build_pwm_only_tables, build_rpm_to_pwm, build_temp_to_rpm, validate_devices, FanCurveTables};
use crate::device::{Fan, Sensor};
use crate::engine::{characterise, derive_interval_ms, resolve_pwm};
use crate::hw;

const DEVICE_CHANNEL_CAPACITY: usize = 16;
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// One managed fan: its backend handle, derived curve tables, smoothing
/// state, and lifecycle state, guarded independently so one fan's control
/// loop never blocks another's.
struct ManagedFan {
    fan: Arc<dyn Fan>,
    backend: BackendKind,
    identity: String,
    sensor_label: String,
    tables: RwLock<FanCurveTables>,
    start_pwm: RwLock<u8>,
    interval_ms: AtomicU32,
    state: RwLock<FanState>,
    task: RwLock<Option<JoinHandle<()>>>,
    /// Elected Dell SMM manual-control method, mirrored here so snapshots
    /// round-trip it without downcasting `Arc<dyn Fan>` (spec §6 Devices
    /// schema: `driver_flag`, only meaningful for Dell fans).
    driver_flag: RwLock<Option<u8>>,
}

/// A managed sensor paired with the persisted identity it was built from,
/// so `snapshot_devices` can round-trip the same `backend`/`identity` it
/// loaded (spec §8 "serialise a Devices and deserialise: byte-equivalent
/// to the source").
struct ManagedSensor {
    sensor: Arc<dyn Sensor>,
    backend: BackendKind,
    identity: String,
    temp_averaging_intervals: u32,
}

pub struct Controller {
    config_path: PathBuf,
    config: RwLock<ControllerConfig>,
    sensors: RwLock<HashMap<String, Arc<ManagedSensor>>>,
    fans: RwLock<HashMap<String, Arc<ManagedFan>>>,
    device_tx: broadcast::Sender<Devices>,
    status_tx: broadcast::Sender<FanStatus>,
}

impl Controller {
    /// Load `config_path`, build every backend it describes, and leave
    /// all fans disabled (spec §5: devices load disabled; callers
    /// re-enable whichever were enabled at last shutdown).
    pub fn load(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let devices = data::load(&config_path)?;
        validate_devices(&devices)?;

        let (device_tx, _) = broadcast::channel(DEVICE_CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);

        let controller = Self {
            config_path,
            config: RwLock::new(ControllerConfig::default()),
            sensors: RwLock::new(HashMap::new()),
            fans: RwLock::new(HashMap::new()),
            device_tx,
            status_tx,
        };
        controller.rebuild_from(devices)?;
        Ok(controller)
    }

    fn rebuild_from(&self, devices: Devices) -> Result<()> {
        let mut sensors = HashMap::new();
        for (label, record) in &devices.sensors {
            match build_sensor(record) {
                Ok(sensor) => {
                    sensors.insert(
                        label.clone(),
                        Arc::new(ManagedSensor {
                            sensor,
                            backend: record.backend,
                            identity: record.identity.clone(),
                            temp_averaging_intervals: record.temp_averaging_intervals,
                        }),
                    );
                }
                Err(e) => warn!(sensor = %label, error = %e, "failed to initialise sensor backend"),
            }
        }

        let mut fans = HashMap::new();
        for (label, record) in &devices.fans {
            match build_fan(record) {
                Ok(fan) => {
                    let tables = if record.rpm_to_pwm.is_empty() && !record.temp_to_rpm.is_empty() {
                        build_pwm_only_tables(label, &record.temp_to_rpm)
                    } else {
                        FanCurveTables {
                            temp_to_rpm: build_temp_to_rpm(label, &record.temp_to_rpm),
                            rpm_to_pwm: build_rpm_to_pwm(label, &record.rpm_to_pwm),
                        }
                    };
                    fans.insert(
                        label.clone(),
                        Arc::new(ManagedFan {
                            fan,
                            backend: record.backend,
                            identity: record.identity.clone(),
                            sensor_label: record.sensor_label.clone(),
                            tables: RwLock::new(tables),
                            start_pwm: RwLock::new(record.start_pwm),
                            interval_ms: AtomicU32::new(record.interval_ms),
                            state: RwLock::new(FanState::Disabled),
                            task: RwLock::new(None),
                            driver_flag: RwLock::new(record.driver_flag),
                        }),
                    );
                }
                Err(e) => warn!(fan = %label, error = %e, "failed to initialise fan backend"),
            }
        }

        *self.sensors.write() = sensors;
        *self.fans.write() = fans;
        let _ = self.device_tx.send(devices);
        Ok(())
    }

    pub fn subscribe_devices(&self) -> broadcast::Receiver<Devices> {
        self.device_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<FanStatus> {
        self.status_tx.subscribe()
    }

    pub fn get_devices(&self) -> Devices {
        self.snapshot_devices()
    }

    fn snapshot_devices(&self) -> Devices {
        let mut devices = Devices::new();
        for (label, managed) in self.sensors.read().iter() {
            devices.sensors.insert(
                label.clone(),
                fancon_protocol::Sensor {
                    label: label.clone(),
                    backend: managed.backend,
                    identity: managed.identity.clone(),
                    temp_averaging_intervals: managed.temp_averaging_intervals,
                },
            );
        }
        for (label, managed) in self.fans.read().iter() {
            let tables = managed.tables.read();
            devices.fans.insert(
                label.clone(),
                fancon_protocol::Fan {
                    label: label.clone(),
                    backend: managed.backend,
                    identity: managed.identity.clone(),
                    sensor_label: managed.sensor_label.clone(),
                    temp_to_rpm: tables
                        .temp_to_rpm
                        .iter()
                        .map(|(&t, &r)| Point::rpm(t, r))
                        .collect(),
                    rpm_to_pwm: tables.rpm_to_pwm.iter().map(|(&r, &p)| Point::pwm(r as i32, p)).collect(),
                    start_pwm: *managed.start_pwm.read(),
                    interval_ms: managed.interval_ms.load(Ordering::Acquire),
                    enabled: *managed.state.read() == FanState::Enabled,
                    driver_flag: *managed.driver_flag.read(),
                },
            );
        }
        devices
    }

    /// Persist the current in-memory device set to `config_path` (spec
    /// §3, §6 persisted-config schema).
    pub fn persist(&self) -> Result<()> {
        data::save(&self.config_path, &self.snapshot_devices())
    }

    pub fn get_config(&self) -> ControllerConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: ControllerConfig) {
        *self.config.write() = config;
    }

    pub fn status(&self, label: &str) -> Result<FanStatus> {
        let fans = self.fans.read();
        let managed = fans.get(label).ok_or_else(|| FanconError::NotFound(label.to_string()))?;
        Ok(FanStatus {
            label: label.to_string(),
            state: *managed.state.read(),
            rpm: managed.fan.get_rpm(),
            pwm: managed.fan.get_pwm(),
        })
    }

    pub fn enable(&self, label: &str) -> Result<()> {
        let managed = self.fan_or_not_found(label)?;
        self.spawn_control_loop(label.to_string(), managed);
        Ok(())
    }

    pub fn enable_all(&self) {
        let labels: Vec<String> = self.fans.read().keys().cloned().collect();
        for label in labels {
            if let Err(e) = self.enable(&label) {
                warn!(fan = %label, error = %e, "failed to enable fan");
            }
        }
    }

    pub async fn disable(&self, label: &str) -> Result<()> {
        let managed = self.fan_or_not_found(label)?;
        self.stop_control_loop(&managed).await;
        Ok(())
    }

    pub async fn disable_all(&self) {
        let managed: Vec<Arc<ManagedFan>> = self.fans.read().values().cloned().collect();
        for fan in managed {
            self.stop_control_loop(&fan).await;
        }
    }

    fn fan_or_not_found(&self, label: &str) -> Result<Arc<ManagedFan>> {
        self.fans
            .read()
            .get(label)
            .cloned()
            .ok_or_else(|| FanconError::NotFound(label.to_string()))
    }

    fn spawn_control_loop(&self, label: String, managed: Arc<ManagedFan>) {
        {
            let mut state = managed.state.write();
            if *state == FanState::Enabled {
                return;
            }
            *state = FanState::Enabled;
        }

        if let Err(e) = managed.fan.enable_control() {
            warn!(fan = %label, error = %e, "enable_control failed, keeping fan disabled");
            *managed.state.write() = FanState::Disabled;
            return;
        }
        if let Some(flag) = managed.fan.driver_flag() {
            *managed.driver_flag.write() = Some(flag);
        }

        let sensors = self.sensors.read().clone();
        let status_tx = self.status_tx.clone();
        let smoothing_intervals = self.config.read().smoothing_intervals;
        let top_stickiness_intervals = self.config.read().top_stickiness_intervals;

        let handle = tokio::spawn(async move {
            let mut smoothing = crate::data::SmoothingState::new();
            loop {
                if *managed.state.read() != FanState::Enabled {
                    break;
                }

                let avg_temp = sensors
                    .get(&managed.sensor_label)
                    .map(|s| s.sensor.get_average_temp())
                    .unwrap_or(0);

                let target_pwm = {
                    let tables = managed.tables.read();
                    let start_pwm = *managed.start_pwm.read();
                    let current_rpm = managed.fan.get_rpm();
                    resolve_pwm(
                        &tables,
                        &mut smoothing,
                        avg_temp,
                        current_rpm,
                        start_pwm,
                        smoothing_intervals,
                        top_stickiness_intervals,
                    )
                };

                if !managed.fan.set_pwm(target_pwm) {
                    debug!(fan = %label, "set_pwm failed mid-loop");
                }

                let _ = status_tx.send(FanStatus {
                    label: label.clone(),
                    state: FanState::Enabled,
                    rpm: managed.fan.get_rpm(),
                    pwm: managed.fan.get_pwm(),
                });

                let interval = managed.interval_ms.load(Ordering::Acquire).max(50);
                tokio::time::sleep(Duration::from_millis(u64::from(interval))).await;
            }
        });

        *managed.task.write() = Some(handle);
    }

    /// Signal the fan's control loop to exit and wait for it to actually
    /// stop before touching the hardware again (spec §4.4, §5: a task
    /// must be joined, not just aborted, before `disable_control` runs or
    /// a device-map swap proceeds -- `abort()` only cancels at the task's
    /// next `.await` point, and the loop body between `sleep`s still
    /// writes to the fan synchronously).
    async fn stop_control_loop(&self, managed: &Arc<ManagedFan>) {
        *managed.state.write() = FanState::Disabled;
        let handle = managed.task.write().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        if let Err(e) = managed.fan.disable_control() {
            warn!(fan = %managed.fan.label(), error = %e, "disable_control failed");
        }
    }

    /// Run the characterisation protocol against `label` (spec §4.3,
    /// §4.4 state diagram: Disabled/Enabled -> Testing -> Disabled).
    /// `forced` re-runs even if the fan already has a populated
    /// `rpm_to_pwm` table.
    pub async fn test(&self, label: &str, forced: bool, mut progress: impl FnMut(u8) + Send + 'static) -> Result<()> {
        let managed = self.fan_or_not_found(label)?;

        let prior_state = {
            let mut state = managed.state.write();
            if *state == FanState::Testing {
                return Err(FanconError::generic(format!("fan {label} is already being tested")));
            }
            if !forced && managed.tables.read().is_tested() {
                return Ok(());
            }
            let prior_state = *state;
            *state = FanState::Testing;
            prior_state
        };

        let handle = managed.task.write().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        let fan = managed.fan.clone();
        let result = tokio::task::spawn_blocking(move || characterise(fan.as_ref(), &mut progress))
            .await
            .map_err(|e| FanconError::generic(format!("characterisation task panicked: {e}")))??;

        {
            let mut tables = managed.tables.write();
            tables.rpm_to_pwm = result.rpm_to_pwm;
            *managed.start_pwm.write() = result.start_pwm;
        }
        managed.interval_ms.store(derive_interval_ms(result.max_speed_change_time_ms), Ordering::Release);
        *managed.state.write() = FanState::Disabled;

        // Transition back to ENABLED or DISABLED according to the state
        // the fan was in before the test started (spec §4.4), and persist
        // the new curve/interval either way.
        if prior_state == FanState::Enabled {
            self.spawn_control_loop(label.to_string(), managed.clone());
        }
        if let Err(e) = self.persist() {
            warn!(fan = %label, error = %e, "failed to persist characterisation result");
        }

        info!(fan = %label, "characterisation finished");
        Ok(())
    }

    /// Stop every running task, reload `Devices` from disk, rebuild
    /// backends, and re-enable whichever fans were enabled beforehand
    /// (spec §5 "devices are only swapped after every per-fan task has
    /// joined").
    pub async fn reload(&self) -> Result<()> {
        let previously_enabled: Vec<String> = self
            .fans
            .read()
            .iter()
            .filter(|(_, m)| *m.state.read() == FanState::Enabled)
            .map(|(label, _)| label.clone())
            .collect();

        self.disable_all().await;

        let devices = data::load(&self.config_path)?;
        validate_devices(&devices)?;
        self.rebuild_from(devices)?;

        for label in previously_enabled {
            if let Err(e) = self.enable(&label) {
                warn!(fan = %label, error = %e, "failed to re-enable fan after reload");
            }
        }
        Ok(())
    }

    /// Replace the current device set with `devices` (spec §4.4
    /// `set_devices`): stop every running task, rebuild backends from the
    /// supplied configuration, persist it, then reconcile each fan back
    /// to the enabled state its incoming record carries.
    pub async fn set_devices(&self, devices: Devices) -> Result<()> {
        validate_devices(&devices)?;
        self.disable_all().await;

        let to_enable: Vec<String> =
            devices.fans.iter().filter(|(_, f)| f.enabled).map(|(l, _)| l.clone()).collect();

        self.rebuild_from(devices)?;
        self.persist()?;

        for label in to_enable {
            if let Err(e) = self.enable(&label) {
                warn!(fan = %label, error = %e, "failed to enable fan from set_devices");
            }
        }
        Ok(())
    }

    /// Scan sysfs hwmon chips and NVML GPUs for devices not yet present
    /// in the persisted configuration, returned with empty curves (spec
    /// §3 "Enumerated devices carry empty curves", §6 `GetEnumeratedDevices`
    /// RPC). Purely a discovery report; never mutates managed state.
    pub fn enumerate_devices(&self) -> Devices {
        let mut devices = Devices::new();

        let (sensors, fans) = hw::enumerate_sysfs(Path::new(crate::constants::paths::HWMON_BASE))
            .unwrap_or_else(|e| {
                warn!(error = %e, "sysfs enumeration failed");
                (Vec::new(), Vec::new())
            });
        for s in sensors {
            devices.sensors.insert(
                s.label.clone(),
                fancon_protocol::Sensor {
                    label: s.label,
                    backend: BackendKind::Sys,
                    identity: s.base_path.display().to_string(),
                    temp_averaging_intervals: crate::constants::engine::DEFAULT_TEMP_AVERAGING_INTERVALS,
                },
            );
        }
        for f in fans {
            devices.fans.insert(
                f.label.clone(),
                fancon_protocol::Fan {
                    label: f.label,
                    backend: BackendKind::Sys,
                    identity: f.pwm_path.display().to_string(),
                    sensor_label: String::new(),
                    temp_to_rpm: Vec::new(),
                    rpm_to_pwm: Vec::new(),
                    start_pwm: 0,
                    interval_ms: ControllerConfig::default().default_interval_ms,
                    enabled: false,
                    driver_flag: None,
                },
            );
        }

        for gpu in fancon_gpu::enumerate_gpus() {
            let sensor_label = format!("nvidia:{}:core", gpu.index);
            devices.sensors.insert(
                sensor_label.clone(),
                fancon_protocol::Sensor {
                    label: sensor_label,
                    backend: BackendKind::Nv,
                    identity: format!("nvidia:{}", gpu.index),
                    temp_averaging_intervals: crate::constants::engine::DEFAULT_TEMP_AVERAGING_INTERVALS,
                },
            );
            for fan_index in 0..gpu.num_fans {
                let fan_label = format!("{}:fan{fan_index}", gpu.name);
                devices.fans.insert(
                    fan_label.clone(),
                    fancon_protocol::Fan {
                        label: fan_label,
                        backend: BackendKind::Nv,
                        identity: format!("nvidia:{}:{fan_index}", gpu.index),
                        sensor_label: String::new(),
                        temp_to_rpm: Vec::new(),
                        rpm_to_pwm: Vec::new(),
                        start_pwm: 0,
                        interval_ms: ControllerConfig::default().default_interval_ms,
                        enabled: false,
                        driver_flag: None,
                    },
                );
            }
        }

        devices
    }

    /// Enumerate NVIDIA GPUs and add any not already present to the
    /// managed device set (spec §6 `NvInit` RPC).
    pub fn nv_init(&self) -> usize {
        let gpus = fancon_gpu::enumerate_gpus();
        let mut added = 0;
        for gpu in gpus {
            let identity = format!("nvidia:{}", gpu.index);
            let sensor_label = format!("nvidia:{}:core", gpu.index);
            if !self.sensors.read().contains_key(&sensor_label) {
                match hw::open_gpu(gpu.index).and_then(|h| Ok(Arc::new(hw::NvidiaSensor::new(sensor_label.clone(), h)) as Arc<dyn Sensor>)) {
                    Ok(sensor) => {
                        self.sensors.write().insert(
                            sensor_label,
                            Arc::new(ManagedSensor {
                                sensor,
                                backend: BackendKind::Nv,
                                identity,
                                temp_averaging_intervals: crate::constants::engine::DEFAULT_TEMP_AVERAGING_INTERVALS,
                            }),
                        );
                        added += 1;
                    }
                    Err(e) => warn!(gpu = gpu.index, error = %e, "failed to open NVIDIA sensor"),
                }
            }
        }
        added
    }
}

/// Instantiate the `Sensor` backend named by a persisted `Sensor` record
/// (spec §4.1, §6 identity conventions).
fn build_sensor(record: &fancon_protocol::Sensor) -> Result<Arc<dyn Sensor>> {
    match record.backend {
        BackendKind::Sys => {
            data::validate_sysfs_path(&record.identity)?;
            let base = PathBuf::from(&record.identity);
            Ok(Arc::new(hw::SysfsSensor::new(
                record.label.clone(),
                base,
                record.temp_averaging_intervals as usize,
            )))
        }
        BackendKind::Dell => {
            data::validate_sysfs_path(&record.identity)?;
            let base = PathBuf::from(&record.identity);
            Ok(Arc::new(hw::SysfsSensor::new(
                record.label.clone(),
                base,
                record.temp_averaging_intervals as usize,
            )))
        }
        BackendKind::Nv => {
            let index = parse_nvidia_index(&record.identity)?;
            let handle = hw::open_gpu(index)?;
            Ok(Arc::new(hw::NvidiaSensor::new(record.label.clone(), handle)))
        }
    }
}

/// Instantiate the `Fan` backend named by a persisted `Fan` record (spec
/// §4.2, §6 identity conventions).
fn build_fan(record: &fancon_protocol::Fan) -> Result<Arc<dyn Fan>> {
    match record.backend {
        BackendKind::Sys => {
            data::validate_sysfs_path(&record.identity)?;
            let (pwm_path, fan_input_path) = sysfs_fan_paths(&record.identity)?;
            Ok(Arc::new(hw::FanSysfs::new(record.label.clone(), pwm_path, fan_input_path)))
        }
        BackendKind::Dell => {
            let (sysfs_part, fan_index) = split_dell_identity(&record.identity);
            data::validate_sysfs_path(&sysfs_part)?;
            if !hw::smm_present() {
                tracing::warn!(
                    fan = %record.label,
                    "Dell SMM signature not detected, manual control commands may not take effect"
                );
            }
            let (pwm_path, fan_input_path) = sysfs_fan_paths(&sysfs_part)?;
            let inner = hw::FanSysfs::new(record.label.clone(), pwm_path, fan_input_path);
            Ok(Arc::new(hw::FanDell::new(inner, fan_index)))
        }
        BackendKind::Nv => {
            let (gpu_index, fan_index) = parse_nvidia_fan_identity(&record.identity)?;
            let handle = hw::open_gpu(gpu_index)?;
            Ok(Arc::new(hw::FanNvidia::new(record.label.clone(), handle, fan_index)))
        }
    }
}

/// Dell identities carry an optional `:<fan index>` suffix selecting the
/// SMM fan target (0 if omitted, e.g. `/sys/.../pwm1` or
/// `/sys/.../pwm1:1`).
fn split_dell_identity(identity: &str) -> (String, u32) {
    if let Some((path, idx)) = identity.rsplit_once(':') {
        if let Ok(fan_index) = idx.parse::<u32>() {
            return (path.to_string(), fan_index);
        }
    }
    (identity.to_string(), 0)
}

fn sysfs_fan_paths(identity: &str) -> Result<(PathBuf, PathBuf)> {
    let pwm_path = PathBuf::from(identity);
    let fan_input_path = pwm_path
        .to_str()
        .map(|s| PathBuf::from(s.replacen("pwm", "fan", 1) + "_input"))
        .ok_or_else(|| FanconError::config(format!("invalid sysfs fan identity: {identity}")))?;
    Ok((pwm_path, fan_input_path))
}

fn parse_nvidia_index(identity: &str) -> Result<u32> {
    let mut parts = identity.split(':');
    match (parts.next(), parts.next()) {
        (Some("nvidia"), Some(idx)) => {
            idx.parse().map_err(|_| FanconError::config(format!("invalid NVIDIA identity: {identity}")))
        }
        _ => Err(FanconError::config(format!("invalid NVIDIA identity: {identity}"))),
    }
}

fn parse_nvidia_fan_identity(identity: &str) -> Result<(u32, u32)> {
    let mut parts = identity.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("nvidia"), Some(gpu_idx), Some(fan_idx)) => {
            let gpu_index = gpu_idx.parse().map_err(|_| FanconError::config(format!("invalid NVIDIA identity: {identity}")))?;
            let fan_index = fan_idx.parse().map_err(|_| FanconError::config(format!("invalid NVIDIA identity: {identity}")))?;
            Ok((gpu_index, fan_index))
        }
        _ => Err(FanconError::config(format!("invalid NVIDIA identity: {identity}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fancon_protocol::Sensor as SensorRecord;

    /// A config with one sysfs fan/sensor pair pointed at paths under a
    /// tempdir that don't exist -- every hardware call becomes a no-op
    /// (`enable_control`/`disable_control` skip missing `_enable` files,
    /// reads return 0) so the controller's lifecycle logic can be
    /// exercised without real hwmon devices.
    fn sample_devices() -> Devices {
        let mut devices = Devices::new();
        devices.sensors.insert(
            "cpu".into(),
            SensorRecord {
                label: "cpu".into(),
                backend: BackendKind::Sys,
                identity: "/sys/class/hwmon/fancon-test-nonexistent/temp1".into(),
                temp_averaging_intervals: 3,
            },
        );
        devices.fans.insert(
            "cpu_fan".into(),
            fancon_protocol::Fan {
                label: "cpu_fan".into(),
                backend: BackendKind::Sys,
                identity: "/sys/class/hwmon/fancon-test-nonexistent/pwm1".into(),
                sensor_label: "cpu".into(),
                temp_to_rpm: vec![Point::rpm(30, 500), Point::rpm(60, 1500)],
                rpm_to_pwm: vec![Point::pwm(500, 80), Point::pwm(1500, 240)],
                start_pwm: 100,
                interval_ms: 20,
                enabled: false,
                driver_flag: None,
            },
        );
        devices
    }

    fn controller_with(devices: Devices) -> (Controller, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("devices.json");
        data::save(&config_path, &devices).unwrap();
        (Controller::load(&config_path).unwrap(), dir)
    }

    #[tokio::test]
    async fn enable_twice_is_idempotent() {
        let (controller, _dir) = controller_with(sample_devices());
        controller.enable("cpu_fan").unwrap();
        let first_task_present = controller.fans.read().get("cpu_fan").unwrap().task.read().is_some();
        assert!(first_task_present);

        // A second enable must not spawn a second task / touch state.
        controller.enable("cpu_fan").unwrap();
        assert_eq!(controller.status("cpu_fan").unwrap().state, FanState::Enabled);

        controller.disable("cpu_fan").await.unwrap();
    }

    #[tokio::test]
    async fn disable_on_disabled_fan_is_noop() {
        let (controller, _dir) = controller_with(sample_devices());
        assert_eq!(controller.status("cpu_fan").unwrap().state, FanState::Disabled);
        controller.disable("cpu_fan").await.unwrap();
        assert_eq!(controller.status("cpu_fan").unwrap().state, FanState::Disabled);
    }

    #[tokio::test]
    async fn unknown_label_is_not_found() {
        let (controller, _dir) = controller_with(sample_devices());
        let err = controller.enable("missing").unwrap_err();
        assert!(matches!(err, FanconError::NotFound(_)));
    }

    #[test]
    fn devices_round_trip_preserves_backend_and_identity() {
        let (controller, _dir) = controller_with(sample_devices());
        let snapshot = controller.get_devices();
        let original = sample_devices();
        assert_eq!(snapshot.sensors["cpu"].identity, original.sensors["cpu"].identity);
        assert_eq!(snapshot.sensors["cpu"].backend, original.sensors["cpu"].backend);
        assert_eq!(snapshot.fans["cpu_fan"].identity, original.fans["cpu_fan"].identity);
        assert_eq!(snapshot.fans["cpu_fan"].backend, original.fans["cpu_fan"].backend);
    }

    #[tokio::test]
    async fn test_is_noop_on_already_tested_fan() {
        let (controller, _dir) = controller_with(sample_devices());
        // sample_devices() already carries a populated rpm_to_pwm, i.e. tested.
        controller.test("cpu_fan", false, |_| {}).await.unwrap();
        // Untouched: still exactly the two points loaded initially.
        assert_eq!(controller.fans.read().get("cpu_fan").unwrap().tables.read().rpm_to_pwm.len(), 2);
    }

    #[tokio::test]
    async fn reload_reconciles_enabled_state_and_notifies_observers() {
        let (controller, dir) = controller_with(sample_devices());
        let mut device_rx = controller.subscribe_devices();

        controller.enable("cpu_fan").unwrap();
        assert_eq!(controller.status("cpu_fan").unwrap().state, FanState::Enabled);

        // Drop the fan from the persisted config entirely before reloading.
        let mut empty = Devices::new();
        empty.sensors = sample_devices().sensors;
        data::save(&dir.path().join("devices.json"), &empty).unwrap();

        controller.reload().await.unwrap();
        assert!(controller.fans.read().get("cpu_fan").is_none());

        // At least one device-observer notification fired (rebuild_from
        // broadcasts on every reload).
        assert!(device_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn set_devices_enables_fans_marked_enabled_in_the_incoming_set() {
        let (controller, _dir) = controller_with(sample_devices());
        let mut incoming = sample_devices();
        incoming.fans.get_mut("cpu_fan").unwrap().enabled = true;

        controller.set_devices(incoming).await.unwrap();
        assert_eq!(controller.status("cpu_fan").unwrap().state, FanState::Enabled);
    }

    /// A fan whose RPM is a deterministic function of commanded PWM, used
    /// to drive `Controller::test` through a real characterisation run
    /// without touching hardware.
    struct FakeFan {
        pwm: std::sync::atomic::AtomicU8,
        label: String,
    }

    impl FakeFan {
        fn new(label: &str) -> Self {
            Self { pwm: std::sync::atomic::AtomicU8::new(0), label: label.to_string() }
        }
    }

    impl Fan for FakeFan {
        fn enable_control(&self) -> Result<()> {
            Ok(())
        }
        fn disable_control(&self) -> Result<()> {
            Ok(())
        }
        fn set_pwm(&self, value: u8) -> bool {
            self.pwm.store(value, Ordering::SeqCst);
            true
        }
        fn get_pwm(&self) -> u8 {
            self.pwm.load(Ordering::SeqCst)
        }
        fn get_rpm(&self) -> u32 {
            u32::from(self.pwm.load(Ordering::SeqCst)) * 10
        }
        fn valid(&self) -> bool {
            true
        }
        fn label(&self) -> &str {
            &self.label
        }
    }

    fn insert_fake_fan(controller: &Controller, label: &str, state: FanState) {
        controller.fans.write().insert(
            label.to_string(),
            Arc::new(ManagedFan {
                fan: Arc::new(FakeFan::new(label)),
                backend: BackendKind::Sys,
                identity: "/sys/class/hwmon/fancon-test-fake/pwm1".into(),
                sensor_label: "cpu".into(),
                tables: RwLock::new(FanCurveTables { temp_to_rpm: Default::default(), rpm_to_pwm: Default::default() }),
                start_pwm: RwLock::new(0),
                interval_ms: AtomicU32::new(1000),
                state: RwLock::new(state),
                task: RwLock::new(None),
                driver_flag: RwLock::new(None),
            }),
        );
    }

    #[tokio::test]
    async fn test_restores_enabled_state_derives_interval_and_persists() {
        let (controller, dir) = controller_with(sample_devices());
        insert_fake_fan(&controller, "fake_fan", FanState::Enabled);

        controller.test("fake_fan", true, |_| {}).await.unwrap();

        // Transitioned back to ENABLED (it was running before the test),
        // not left DISABLED.
        assert_eq!(controller.status("fake_fan").unwrap().state, FanState::Enabled);
        assert!(controller.fans.read().get("fake_fan").unwrap().task.read().is_some());

        // interval_ms was derived from the measured ramp time, not left
        // untouched at its pre-test value.
        let interval = controller.fans.read().get("fake_fan").unwrap().interval_ms.load(Ordering::Acquire);
        assert!((crate::constants::test::MIN_DERIVED_INTERVAL_MS..=crate::constants::test::MAX_DERIVED_INTERVAL_MS).contains(&interval));

        // The result made it to disk.
        let persisted = data::load(&dir.path().join("devices.json")).unwrap();
        assert!(!persisted.fans["fake_fan"].rpm_to_pwm.is_empty());

        controller.disable("fake_fan").await.unwrap();
    }

    #[tokio::test]
    async fn test_leaves_previously_disabled_fan_disabled() {
        let (controller, _dir) = controller_with(sample_devices());
        insert_fake_fan(&controller, "fake_fan", FanState::Disabled);

        controller.test("fake_fan", true, |_| {}).await.unwrap();

        assert_eq!(controller.status("fake_fan").unwrap().state, FanState::Disabled);
        assert!(controller.fans.read().get("fake_fan").unwrap().task.read().is_none());
    }
}
