//! Hardware encoder detection.
//!
//! Queried fresh for every job; GPUs may come and go between runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// PCI vendor id of NVIDIA.
pub const PCI_VENDOR_NVIDIA: u16 = 0x10de;
/// PCI vendor id of AMD/ATI.
pub const PCI_VENDOR_AMD: u16 = 0x1002;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    None,
    Nvidia,
    Amd,
}

pub trait HardwareProbe: Send + Sync {
    fn detect(&self) -> GpuVendor;
}

/// Parses the content of a sysfs `vendor` file (`0x10de\n`).
pub fn parse_pci_vendor(content: &str) -> Option<u16> {
    let trimmed = content.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(hex, 16).ok()
}

/// Maps PCI vendor ids to the first supported encoder vendor. NVIDIA wins
/// when both are present.
pub fn vendor_from_ids(ids: &[u16]) -> GpuVendor {
    if ids.contains(&PCI_VENDOR_NVIDIA) {
        GpuVendor::Nvidia
    } else if ids.contains(&PCI_VENDOR_AMD) {
        GpuVendor::Amd
    } else {
        GpuVendor::None
    }
}

/// Reads DRM card vendor ids from sysfs.
#[derive(Debug, Clone)]
pub struct SysfsGpuProbe {
    drm_root: PathBuf,
}

impl Default for SysfsGpuProbe {
    fn default() -> Self {
        Self::new("/sys/class/drm")
    }
}

impl SysfsGpuProbe {
    pub fn new(drm_root: impl Into<PathBuf>) -> Self {
        Self {
            drm_root: drm_root.into(),
        }
    }

    fn vendor_ids(root: &Path) -> Vec<u16> {
        let Ok(entries) = std::fs::read_dir(root) else {
            return Vec::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                // card0, card1... but not connectors like card0-HDMI-A-1
                name.starts_with("card") && !name.contains('-')
            })
            .filter_map(|entry| std::fs::read_to_string(entry.path().join("device/vendor")).ok())
            .filter_map(|content| parse_pci_vendor(&content))
            .collect()
    }
}

impl HardwareProbe for SysfsGpuProbe {
    fn detect(&self) -> GpuVendor {
        let ids = Self::vendor_ids(&self.drm_root);
        let vendor = vendor_from_ids(&ids);
        debug!(?ids, ?vendor, "GPU detection");
        vendor
    }
}

/// Probe that always reports the same vendor.
#[derive(Debug, Clone, Copy)]
pub struct FixedGpu(pub GpuVendor);

impl HardwareProbe for FixedGpu {
    fn detect(&self) -> GpuVendor {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn card(root: &Path, name: &str, vendor: &str) {
        let dir = root.join(name).join("device");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("vendor"), vendor).unwrap();
    }

    #[test]
    fn test_parse_pci_vendor() {
        assert_eq!(parse_pci_vendor("0x10de\n"), Some(0x10de));
        assert_eq!(parse_pci_vendor("1002"), Some(0x1002));
        assert_eq!(parse_pci_vendor("garbage"), None);
    }

    #[test]
    fn test_vendor_priority() {
        assert_eq!(vendor_from_ids(&[0x8086]), GpuVendor::None);
        assert_eq!(vendor_from_ids(&[0x1002]), GpuVendor::Amd);
        assert_eq!(vendor_from_ids(&[0x1002, 0x10de]), GpuVendor::Nvidia);
    }

    #[test]
    fn test_sysfs_probe() {
        let temp_dir = TempDir::new().unwrap();
        card(temp_dir.path(), "card0", "0x8086\n");
        card(temp_dir.path(), "card0-HDMI-A-1", "0x10de\n");
        assert_eq!(SysfsGpuProbe::new(temp_dir.path()).detect(), GpuVendor::None);

        card(temp_dir.path(), "card1", "0x1002\n");
        assert_eq!(SysfsGpuProbe::new(temp_dir.path()).detect(), GpuVendor::Amd);
    }

    #[test]
    fn test_missing_root_detects_nothing() {
        let probe = SysfsGpuProbe::new("/definitely/not/here");
        assert_eq!(probe.detect(), GpuVendor::None);
    }
}
