//! Attached serial device enumeration

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::ConnectorError;

/// Anything that can report which devices are physically attached right now.
///
/// Called synchronously once per poll tick; implementations may block briefly.
pub trait DeviceSource: Send + Sync {
    /// Device identifier (e.g. `/dev/ttyACM0`) to a human-readable description.
    fn list_attached_devices(&self) -> Result<BTreeMap<String, String>, ConnectorError>;
}

const SERIAL_PREFIXES: &[&str] = &["ttyUSB", "ttyACM", "cu.usbserial", "cu.usbmodem"];

/// Scans a device directory for USB serial adapters
#[derive(Debug, Clone)]
pub struct SerialPortScanner {
    dev_dir: PathBuf,
    /// udev's persistent names; the link name doubles as the description
    by_id_dir: PathBuf,
}

impl Default for SerialPortScanner {
    fn default() -> Self {
        Self::new("/dev", "/dev/serial/by-id")
    }
}

impl SerialPortScanner {
    pub fn new(dev_dir: impl Into<PathBuf>, by_id_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
            by_id_dir: by_id_dir.into(),
        }
    }

    fn descriptions(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let Ok(entries) = std::fs::read_dir(&self.by_id_dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let link = entry.path();
            let Ok(target) = std::fs::read_link(&link) else {
                continue;
            };
            let Some(target_name) = target.file_name() else {
                continue;
            };
            let device = self.dev_dir.join(target_name);
            out.insert(
                device.to_string_lossy().into_owned(),
                describe_by_id(&entry.file_name().to_string_lossy()),
            );
        }
        out
    }
}

impl DeviceSource for SerialPortScanner {
    fn list_attached_devices(&self) -> Result<BTreeMap<String, String>, ConnectorError> {
        let entries = std::fs::read_dir(&self.dev_dir).map_err(|e| {
            ConnectorError::Enumeration(format!("{}: {}", self.dev_dir.display(), e))
        })?;
        let descriptions = self.descriptions();

        let mut ports = BTreeMap::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_serial_name(&name) {
                continue;
            }
            let device = self.dev_dir.join(&name).to_string_lossy().into_owned();
            let description = descriptions
                .get(&device)
                .cloned()
                .unwrap_or_else(|| device.clone());
            ports.insert(device, description);
        }
        Ok(ports)
    }
}

fn is_serial_name(name: &str) -> bool {
    SERIAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// `usb-1a86_USB_Single_Serial_5A46083062-if00` -> `1a86 USB Single Serial 5A46083062`
fn describe_by_id(link_name: &str) -> String {
    let trimmed = link_name.strip_prefix("usb-").unwrap_or(link_name);
    let trimmed = match trimmed.rfind("-if") {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    };
    trimmed.replace('_', " ")
}

/// A fixed device list, for tests and for hosts without serial hardware.
#[derive(Debug, Clone, Default)]
pub struct StaticDevices(pub BTreeMap<String, String>);

impl DeviceSource for StaticDevices {
    fn list_attached_devices(&self) -> Result<BTreeMap<String, String>, ConnectorError> {
        Ok(self.0.clone())
    }
}

impl<T: DeviceSource + ?Sized> DeviceSource for std::sync::Arc<T> {
    fn list_attached_devices(&self) -> Result<BTreeMap<String, String>, ConnectorError> {
        (**self).list_attached_devices()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").expect("create device file");
    }

    #[test]
    fn lists_only_serial_devices() {
        let dev = TempDir::new().expect("tempdir");
        for name in ["ttyACM0", "ttyUSB1", "tty0", "null", "cu.usbmodem1101"] {
            touch(dev.path(), name);
        }
        let scanner = SerialPortScanner::new(dev.path(), dev.path().join("missing"));

        let ports = scanner.list_attached_devices().expect("scan");
        let names: Vec<_> = ports
            .keys()
            .map(|k| {
                Path::new(k)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect();
        assert_eq!(names, vec!["cu.usbmodem1101", "ttyACM0", "ttyUSB1"]);
        // Without by-id links the device path is its own description.
        for (device, description) in &ports {
            assert_eq!(device, description);
        }
    }

    #[cfg(unix)]
    #[test]
    fn uses_by_id_links_for_descriptions() {
        let dev = TempDir::new().expect("tempdir");
        let by_id = dev.path().join("serial").join("by-id");
        std::fs::create_dir_all(&by_id).expect("by-id dir");
        touch(dev.path(), "ttyACM0");
        std::os::unix::fs::symlink(
            "../../ttyACM0",
            by_id.join("usb-1a86_USB_Single_Serial_5A46083062-if00"),
        )
        .expect("symlink");

        let scanner = SerialPortScanner::new(dev.path(), &by_id);
        let ports = scanner.list_attached_devices().expect("scan");
        let device = dev.path().join("ttyACM0").to_string_lossy().into_owned();
        assert_eq!(
            ports.get(&device).map(String::as_str),
            Some("1a86 USB Single Serial 5A46083062")
        );
    }

    #[test]
    fn missing_dev_dir_is_an_enumeration_error() {
        let dev = TempDir::new().expect("tempdir");
        let scanner = SerialPortScanner::new(dev.path().join("nope"), dev.path());
        assert!(matches!(
            scanner.list_attached_devices(),
            Err(ConnectorError::Enumeration(_))
        ));
    }
}
