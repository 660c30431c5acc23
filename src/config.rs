//! Session, dispatch and host backend configuration

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MediaError, Result};

/// Accelerator session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device to open (see `AcceleratorSession::devices`)
    pub device_index: usize,
    /// Directory scanned for `*.cl` kernel sources at initialize
    pub kernel_dir: Option<PathBuf>,
}

impl SessionConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Audio chunking defaults for kernel dispatch
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub chunk_size: usize,
    /// Overlap fraction in `[0, 1)`
    pub overlap: f32,
    /// Pull results back to the host when a dispatch owned the push
    pub move_back: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16384,
            overlap: 0.5,
            move_back: true,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || !(0.0..1.0).contains(&self.overlap) {
            return Err(MediaError::InvalidChunking {
                chunk_size: self.chunk_size,
                overlap: self.overlap,
            });
        }
        Ok(())
    }
}

/// Host reference backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostBackendConfig {
    /// Emulated device memory in bytes
    pub memory_capacity: u64,
    pub device_name: String,
    pub clock_mhz: u32,
}

impl Default for HostBackendConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 1 << 30,
            device_name: "Host Reference Device".to_string(),
            clock_mhz: 1000,
        }
    }
}

/// Combined configuration file layout used by the CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    pub session: SessionConfig,
    pub dispatch: DispatchConfig,
    pub host: HostBackendConfig,
}

impl AccelConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
