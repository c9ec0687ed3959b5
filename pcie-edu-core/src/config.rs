//! Device configuration.
//!
//! Replaces static property tables with an explicit struct passed at construction.
//! `EduConfig::default()` describes the reference device.

use crate::error::{EduError, Result};
use crate::types::FunctionIdentity;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Vendor id shared by PF and VFs.
pub const EDU_VENDOR_ID: u16 = 0x17db;
/// PF device id.
pub const EDU_DEVICE_ID: u16 = 0x0001;
/// VF device id.
pub const EDU_VF_DEVICE_ID: u16 = 0x0002;
/// PCI_CLASS_OTHERS
pub const EDU_CLASS_ID: u16 = 0xff00;

/// BAR slot of the MMIO window.
pub const MMIO_BAR: u8 = 0;
/// BAR slot of the MSI-X window.
pub const MSIX_BAR: u8 = 2;

/// Per-kind function configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionConfig {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision: u8,
    pub class_id: u16,
    pub mmio_bar_size: u64,
    pub msix_bar_size: u64,
    pub msix_vectors: u16,
    pub msix_table_offset: u32,
    pub msix_pba_offset: u32,
}

impl FunctionConfig {
    /// Reference physical function.
    pub fn physical() -> Self {
        Self {
            vendor_id: EDU_VENDOR_ID,
            device_id: EDU_DEVICE_ID,
            revision: 0,
            class_id: EDU_CLASS_ID,
            mmio_bar_size: 0x8000_0000, // 2 GiB
            msix_bar_size: 16 * 1024,
            msix_vectors: 4,
            msix_table_offset: 0x000,
            msix_pba_offset: 0x800,
        }
    }

    /// Reference virtual function.
    pub fn virtual_fn() -> Self {
        Self {
            device_id: EDU_VF_DEVICE_ID,
            mmio_bar_size: 4 * 1024,
            msix_vectors: 2,
            ..Self::physical()
        }
    }

    pub fn identity(&self) -> FunctionIdentity {
        FunctionIdentity {
            vendor_id: self.vendor_id,
            device_id: self.device_id,
            revision: self.revision,
            class_id: self.class_id,
        }
    }

    fn validate(&self, which: &str) -> Result<()> {
        let sizes = [("mmio_bar_size", self.mmio_bar_size), ("msix_bar_size", self.msix_bar_size)];
        for (name, size) in sizes {
            if size == 0 || !size.is_power_of_two() {
                return Err(EduError::InvalidConfig {
                    reason: format!(
                        "{}.{} must be a non-zero power of two, got {:#x}",
                        which, name, size
                    ),
                });
            }
        }
        if self.msix_vectors == 0 {
            return Err(EduError::InvalidConfig {
                reason: format!("{}.msix_vectors must be at least 1", which),
            });
        }
        Ok(())
    }
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self::physical()
    }
}

/// SR-IOV capability parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SriovConfig {
    pub total_vfs: u16,
    pub initial_vfs: u16,
    pub vf_offset: u16,
    pub vf_stride: u16,
    /// Routing id of the PF itself.
    pub pf_routing_id: u16,
}

impl Default for SriovConfig {
    fn default() -> Self {
        Self { total_vfs: 16, initial_vfs: 16, vf_offset: 0x80, vf_stride: 2, pf_routing_id: 0 }
    }
}

/// Complete device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EduConfig {
    pub pf: FunctionConfig,
    pub vf: FunctionConfig,
    pub sriov: SriovConfig,
    /// Host interrupt-routing budget shared by every function; `None` is unbounded.
    pub msix_vector_budget: Option<u32>,
    pub log_level: String,
}

impl Default for EduConfig {
    fn default() -> Self {
        Self {
            pf: FunctionConfig::physical(),
            vf: FunctionConfig::virtual_fn(),
            sriov: SriovConfig::default(),
            msix_vector_budget: None,
            log_level: "info".to_string(),
        }
    }
}

impl EduConfig {
    /// Parse configuration from a JSON document.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| EduError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from disk. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| EduError::IoError { path: path.to_path_buf(), source: e })?;
        Self::from_json(&content)
    }

    /// Save configuration to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EduError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| EduError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| EduError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Check structural constraints that would otherwise surface mid-realize.
    pub fn validate(&self) -> Result<()> {
        self.pf.validate("pf")?;
        self.vf.validate("vf")?;
        if self.sriov.total_vfs == 0 {
            return Err(EduError::InvalidConfig {
                reason: "sriov.total_vfs must be at least 1".into(),
            });
        }
        if self.sriov.initial_vfs > self.sriov.total_vfs {
            return Err(EduError::InvalidConfig {
                reason: format!(
                    "sriov.initial_vfs ({}) exceeds total_vfs ({})",
                    self.sriov.initial_vfs, self.sriov.total_vfs
                ),
            });
        }
        if self.sriov.vf_stride == 0 {
            return Err(EduError::InvalidConfig {
                reason: "sriov.vf_stride must be non-zero".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_defaults() {
        let config = EduConfig::default();
        assert_eq!(config.pf.mmio_bar_size, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.vf.mmio_bar_size, 4096);
        assert_eq!(config.pf.msix_vectors, 4);
        assert_eq!(config.vf.msix_vectors, 2);
        assert_eq!(config.vf.device_id, 0x0002);
        assert_eq!(config.sriov.total_vfs, 16);
        assert_eq!(config.sriov.vf_offset, 0x80);
        assert_eq!(config.sriov.vf_stride, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            EduConfig::from_json(r#"{"sriov": {"total_vfs": 4, "initial_vfs": 4}}"#).unwrap();
        assert_eq!(config.sriov.total_vfs, 4);
        assert_eq!(config.sriov.vf_offset, 0x80);
        assert_eq!(config.pf, FunctionConfig::physical());
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let mut config = EduConfig::default();
        config.vf.mmio_bar_size = 3000;
        assert!(matches!(config.validate(), Err(EduError::InvalidConfig { .. })));

        let mut config = EduConfig::default();
        config.sriov.initial_vfs = 17;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("edu.json");

        let mut config = EduConfig::default();
        config.msix_vector_budget = Some(64);
        config.save(&path).unwrap();

        let loaded = EduConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = EduConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, EduConfig::default());
    }
}
