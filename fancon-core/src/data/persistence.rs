//! Load/save the persisted `Devices` set (spec §6, §9): the same schema
//! used for the `GetDevices`/`SetDevices` RPCs is read from disk at
//! startup and written back by `set_devices`.

use std::fs;
use std::path::Path;

use fancon_protocol::Devices;
use tracing::{debug, info};

use crate::error::{FanconError, Result};

/// Load a `Devices` set from `path`. Returns an empty `Devices` if the
/// file does not exist yet (first run before any `SetDevices`/`Reload`).
pub fn load(path: &Path) -> Result<Devices> {
    if !path.exists() {
        debug!(path = %path.display(), "no persisted devices file, starting empty");
        return Ok(Devices::new());
    }

    let contents = fs::read_to_string(path).map_err(|e| FanconError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let devices: Devices = serde_json::from_str(&contents)?;
    info!(
        path = %path.display(),
        fans = devices.fans.len(),
        sensors = devices.sensors.len(),
        "loaded persisted devices"
    );
    Ok(devices)
}

/// Serialise `devices` and write it to `path`, creating parent
/// directories as needed.
pub fn save(path: &Path, devices: &Devices) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| FanconError::FileWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let contents = serde_json::to_string_pretty(devices)?;
    fs::write(path, contents).map_err(|e| FanconError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    debug!(path = %path.display(), "persisted devices");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_returns_empty() {
        let devices = load(Path::new("/nonexistent/fancon/devices.json")).unwrap();
        assert!(devices.fans.is_empty());
        assert!(devices.sensors.is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");

        let mut devices = Devices::new();
        devices.sensors.insert(
            "cpu".into(),
            fancon_protocol::Sensor {
                label: "cpu".into(),
                backend: fancon_protocol::BackendKind::Sys,
                identity: "/sys/class/hwmon/hwmon0/temp1_input".into(),
                temp_averaging_intervals: 5,
            },
        );

        save(&path, &devices).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, devices);
    }
}
