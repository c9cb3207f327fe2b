//! OS detection module
//!
//! Identifies the host operating system family. On Linux the systemd
//! runtime marker is checked separately when the provider is chosen.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;

/// Directory that only exists while systemd is running as PID 1
pub const SYSTEMD_MARKER: &str = "/run/systemd/system";

/// Operating system type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OsType {
    Linux,
    MacOs,
    Unknown,
}

/// Host information relevant to service management
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsInfo {
    pub os_type: OsType,
    pub architecture: String,
}

impl OsInfo {
    /// Detect current operating system information
    pub fn detect() -> Self {
        OsInfo {
            os_type: Self::detect_os_type(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }

    fn detect_os_type() -> OsType {
        #[cfg(target_os = "linux")]
        return OsType::Linux;

        #[cfg(target_os = "macos")]
        return OsType::MacOs;

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        return OsType::Unknown;
    }
}

/// Check for the systemd runtime marker directory
pub fn systemd_running(marker: &Path) -> bool {
    let present = marker.is_dir();
    debug!("systemd marker {} present: {}", marker.display(), present);
    present
}

static OS_INFO: OnceLock<OsInfo> = OnceLock::new();

/// Get cached OS information (initialized once)
pub fn get_os_info() -> &'static OsInfo {
    OS_INFO.get_or_init(|| {
        let info = OsInfo::detect();
        info!("Detected OS: {:?} ({})", info.os_type, info.architecture);
        info
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_type_detection() {
        let os_type = OsInfo::detect_os_type();
        if cfg!(target_os = "linux") {
            assert_eq!(os_type, OsType::Linux);
        }
        if cfg!(target_os = "macos") {
            assert_eq!(os_type, OsType::MacOs);
        }
    }

    #[test]
    fn test_systemd_marker() {
        let dir = tempfile::tempdir().unwrap();
        assert!(systemd_running(dir.path()));
        assert!(!systemd_running(&dir.path().join("missing")));
    }

    #[test]
    fn test_cached_os_info() {
        let info1 = get_os_info();
        let info2 = get_os_info();

        assert_eq!(info1 as *const _, info2 as *const _);
        assert!(!info1.architecture.is_empty());
    }
}
