//! Mount-point configuration, immutable after load.

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use std::{
    collections::HashSet,
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// RPC waits poll the machine at this period.
pub const POLL_PERIOD: Duration = Duration::from_millis(100);

/// Seconds an RPC waits for the machine, on top of the configured timeout.
pub const TIMEOUT_GRACE_SECS: u64 = 5;

/// Active mount points with no gadget I/O for this long are unmounted.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How a mount point acquires its image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// The image source already speaks NBD; only nbd-client is started.
    Proxy,
    /// The image is fetched via SMB or HTTPS; nbdkit adapts it to NBD.
    Legacy,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Proxy => "proxy",
            Mode::Legacy => "legacy",
        }
    }
}

/// Kernel NBD device identifier, e.g. `nbd0`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct NbdDevice(String);

impl NbdDevice {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let digits = id.strip_prefix("nbd").unwrap_or("");
        ensure!(
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
            "invalid NBD device identifier {id:?}"
        );
        Ok(NbdDevice(id))
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    /// Device node path, `/dev/nbdN`.
    pub fn to_path(&self) -> PathBuf {
        Path::new("/dev").join(&self.0)
    }

    /// Sysfs file present while an nbd-client holds the device.
    pub fn sys_pid_path(&self) -> PathBuf {
        PathBuf::from(format!("/sys/block/{}/pid", self.0))
    }

    /// Block-layer I/O counters for the device.
    pub fn sys_stat_path(&self) -> PathBuf {
        PathBuf::from(format!("/sys/block/{}/stat", self.0))
    }
}

impl TryFrom<String> for NbdDevice {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        NbdDevice::new(value)
    }
}

impl fmt::Display for NbdDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One configured mount point.
#[derive(Clone, Debug, Deserialize)]
pub struct MountPoint {
    pub name: String,
    pub mode: Mode,
    pub nbd_device: NbdDevice,
    pub endpoint_id: String,
    pub unix_socket: PathBuf,
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl MountPoint {
    /// Configured RPC timeout in seconds.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    /// Argument vector for nbd-client against this mount point.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "-t".into(),
            self.timeout_secs().to_string(),
            "-u".into(),
            self.unix_socket.display().to_string(),
            self.nbd_device.to_path().display().to_string(),
            "-n".into(),
        ]
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.name.is_empty()
                && self
                    .name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-'),
            "invalid mount point name {:?}",
            self.name
        );
        ensure!(
            self.unix_socket.is_absolute(),
            "unix socket path for {:?} must be absolute",
            self.name
        );
        Ok(())
    }
}

/// Top-level configuration document.
#[derive(Debug, Deserialize)]
pub struct Configuration {
    pub mount_points: Vec<MountPoint>,
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("read configuration {}", path.display()))?;
        let config: Configuration =
            serde_json::from_slice(&data).context("decode configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut devices = HashSet::new();
        for mp in &self.mount_points {
            mp.validate()?;
            if !names.insert(mp.name.as_str()) {
                bail!("duplicate mount point name {:?}", mp.name);
            }
            if !devices.insert(&mp.nbd_device) {
                bail!("duplicate NBD device {} in configuration", mp.nbd_device);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount_point(name: &str, device: &str) -> MountPoint {
        MountPoint {
            name: name.into(),
            mode: Mode::Legacy,
            nbd_device: NbdDevice::new(device).unwrap(),
            endpoint_id: "/redfish/v1/e0".into(),
            unix_socket: PathBuf::from("/run/vmedia/e0.sock"),
            timeout: None,
        }
    }

    #[test]
    fn nbd_device_validation() {
        assert!(NbdDevice::new("nbd0").is_ok());
        assert!(NbdDevice::new("nbd12").is_ok());
        assert!(NbdDevice::new("nbd").is_err());
        assert!(NbdDevice::new("sda").is_err());
        assert!(NbdDevice::new("nbd0x").is_err());
    }

    #[test]
    fn to_args_uses_configured_timeout() {
        let mut mp = mount_point("usb0", "nbd0");
        assert_eq!(
            mp.to_args(),
            ["-t", "30", "-u", "/run/vmedia/e0.sock", "/dev/nbd0", "-n"]
        );

        mp.timeout = Some(120);
        assert_eq!(mp.to_args()[1], "120");
    }

    #[test]
    fn load_rejects_duplicates() {
        let config = Configuration {
            mount_points: vec![mount_point("a", "nbd0"), mount_point("a", "nbd1")],
        };
        assert!(config.validate().is_err());

        let config = Configuration {
            mount_points: vec![mount_point("a", "nbd0"), mount_point("b", "nbd0")],
        };
        assert!(config.validate().is_err());

        let config = Configuration {
            mount_points: vec![mount_point("a", "nbd0"), mount_point("b", "nbd1")],
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "mount_points": [{
                    "name": "usb0",
                    "mode": "proxy",
                    "nbd_device": "nbd0",
                    "endpoint_id": "/redfish/v1/e0",
                    "unix_socket": "/run/vmedia/e0.sock"
                }]
            }"#,
        )
        .unwrap();

        let config = Configuration::load(&path).unwrap();
        assert_eq!(config.mount_points.len(), 1);
        assert_eq!(config.mount_points[0].mode, Mode::Proxy);
        assert_eq!(config.mount_points[0].timeout_secs(), 30);
    }
}
