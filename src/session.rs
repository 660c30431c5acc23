//! Accelerator session
//!
//! [`AcceleratorSession`] owns the compute backend, the buffer registry and
//! the kernel catalog of one device. There is exactly one device context per
//! session; `initialize` tears down any previous context first and `dispose`
//! frees every tracked buffer before releasing it. Dropping the session
//! disposes it.
//!
//! ```rust,no_run
//! use accel_media::{AcceleratorSession, HostBackend, SessionConfig};
//!
//! let mut session = AcceleratorSession::new(HostBackend::new());
//! let device = session.strongest_device_index().unwrap_or(0);
//! session.initialize(&SessionConfig { device_index: device, kernel_dir: Some("kernels".into()) })?;
//! println!("{:?}", session.info());
//! # Ok::<(), accel_media::MediaError>(())
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{ComputeBackend, DeviceDescriptor, WorkDims};
use crate::buffer::{BufferHandle, BufferInfo, BufferRegistry, ElementKind, HostData, UsageTotals};
use crate::config::SessionConfig;
use crate::error::{MediaError, Result};
use crate::kernel::{BoundArgs, KernelCatalog, KernelDescriptor};
use crate::metrics::Metrics;

/// Serializable session status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub initialized: bool,
    pub backend: String,
    pub device_index: Option<usize>,
    pub device_name: Option<String>,
    pub status: String,
    pub kernels: Vec<String>,
    pub live_buffers: usize,
    pub usage: UsageTotals,
    pub usage_percentage: f32,
}

/// Result of a kernel launch registered with the session
#[derive(Debug, Clone, Copy)]
pub struct LaunchResult {
    pub handle: BufferHandle,
    pub stretch_factor: f64,
}

pub struct AcceleratorSession<B: ComputeBackend> {
    backend: B,
    registry: BufferRegistry,
    kernels: KernelCatalog,
    device: Option<DeviceDescriptor>,
    metrics: Arc<Metrics>,
}

impl<B: ComputeBackend> AcceleratorSession<B> {
    /// Wrap a backend. No device context exists until [`initialize`](Self::initialize).
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            registry: BufferRegistry::new(),
            kernels: KernelCatalog::new(),
            device: None,
            metrics: Metrics::new(),
        }
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.backend.enumerate_devices()
    }

    /// Device with the highest `compute_units × clock` score.
    pub fn strongest_device_index(&self) -> Option<usize> {
        self.devices()
            .into_iter()
            .max_by_key(|d| d.score())
            .map(|d| d.index)
    }

    /// Open a context on `config.device_index` and compile the kernel directory.
    pub fn initialize(&mut self, config: &SessionConfig) -> Result<()> {
        if self.is_initialized() {
            debug!("Disposing previous session before re-initializing");
            self.dispose();
        }

        let device = self
            .devices()
            .into_iter()
            .find(|d| d.index == config.device_index)
            .ok_or_else(|| {
                warn!("No device at index {}", config.device_index);
                MediaError::SessionCreation(format!("no device at index {}", config.device_index))
            })?;

        self.backend.create_session(device.index).map_err(|e| {
            warn!("Couldn't create session on {}: {}", device.name, e);
            e
        })?;
        info!("🚀 Session initialized on [{}] {} ({})", device.index, device.name, self.backend.name());
        self.device = Some(device);

        if let Some(dir) = &config.kernel_dir {
            if let Err(e) = self.kernels.load_directory(&mut self.backend, dir) {
                warn!("Couldn't load kernels from {}: {}", dir.display(), e);
                self.dispose();
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.device.is_some()
    }

    /// Free every tracked buffer, then release the device context.
    ///
    /// Returns the bytes freed. Safe to call repeatedly.
    pub fn dispose(&mut self) -> u64 {
        let freed = self.registry.free_all(&mut self.backend);
        self.kernels.clear();
        if let Some(device) = self.device.take() {
            self.backend.release_session();
            info!("Session on {} disposed ({} kB freed)", device.name, freed / 1024);
        }
        freed
    }

    pub fn info(&self) -> SessionInfo {
        let usage = self.usage();
        SessionInfo {
            initialized: self.is_initialized(),
            backend: self.backend.name().to_string(),
            device_index: self.device.as_ref().map(|d| d.index),
            device_name: self.device.as_ref().map(|d| d.name.clone()),
            status: match &self.device {
                Some(d) => format!("Initialized on [{}] {}", d.index, d.name),
                None => "Not initialized".to_string(),
            },
            kernels: self.kernels.names().into_iter().map(String::from).collect(),
            live_buffers: self.registry.len(),
            usage,
            usage_percentage: usage.usage_percentage(),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn kernels(&self) -> &KernelCatalog {
        &self.kernels
    }

    /// Compile one more kernel source into the catalog.
    pub fn load_kernel(&mut self, path: &Path) -> Result<&KernelDescriptor> {
        if !self.is_initialized() {
            return Err(MediaError::NoSession);
        }
        self.kernels.load_kernel(&mut self.backend, path)
    }

    pub fn resolve_kernel(&self, base_name: &str, version: &str) -> Result<KernelDescriptor> {
        self.kernels.resolve(base_name, version).cloned()
    }

    pub fn alloc(&mut self, kind: ElementKind, segment_lengths: &[usize]) -> Result<BufferHandle> {
        self.registry.alloc(&mut self.backend, kind, segment_lengths)
    }

    pub fn push(&mut self, data: &HostData) -> Result<BufferHandle> {
        self.push_segments(std::slice::from_ref(data))
    }

    pub fn push_segments(&mut self, segments: &[HostData]) -> Result<BufferHandle> {
        let handle = self.registry.push_segments(&mut self.backend, segments)?;
        if !handle.is_null() {
            self.metrics.record_push(self.registry.size_of(handle));
        }
        Ok(handle)
    }

    pub fn push_chunks(&mut self, chunks: Vec<Vec<f32>>) -> Result<BufferHandle> {
        let segments: Vec<HostData> = chunks.into_iter().map(HostData::Real32).collect();
        self.push_segments(&segments)
    }

    pub fn pull(&mut self, handle: BufferHandle, free: bool) -> HostData {
        let size = self.registry.size_of(handle);
        let data = self.registry.pull(&mut self.backend, handle, free);
        if !data.is_empty() {
            self.metrics.record_pull(size);
        }
        data
    }

    pub fn pull_segments(&mut self, handle: BufferHandle, free: bool) -> Vec<HostData> {
        let size = self.registry.size_of(handle);
        let segments = self.registry.pull_segments(&mut self.backend, handle, free);
        if !segments.is_empty() {
            self.metrics.record_pull(size);
        }
        segments
    }

    pub fn free(&mut self, handle: BufferHandle) -> u64 {
        self.registry.free(&mut self.backend, handle)
    }

    pub fn usage(&self) -> UsageTotals {
        self.registry.usage_totals(self.backend.memory_info())
    }

    pub fn buffer_infos(&self) -> Vec<BufferInfo> {
        self.registry.buffer_infos()
    }

    /// Bind `handle` as kernel input and register the launch output.
    pub(crate) fn launch(
        &mut self,
        kernel: &KernelDescriptor,
        input: BufferHandle,
        scalars: Vec<crate::kernel::BoundScalar>,
        dims: WorkDims,
    ) -> Result<LaunchResult> {
        let buffer = self.registry.get(input).ok_or(MediaError::UnknownHandle(input))?;
        let args = BoundArgs {
            input: buffer.segments().to_vec(),
            input_kind: buffer.kind(),
            input_lengths: buffer.lengths().to_vec(),
            scalars,
        };

        let output = self.backend.launch(kernel, &args, dims).map_err(|e| {
            warn!("Kernel {} failed on {}: {}", kernel.name, input, e);
            e
        })?;
        let stretch_factor = output.stretch_factor;
        let handle = self.registry.adopt(output.kind, output.segments, output.lengths);
        Ok(LaunchResult { handle, stretch_factor })
    }

    /// Backend access for transforms that manage their own buffers.
    pub(crate) fn parts(&mut self) -> (&mut B, &mut BufferRegistry) {
        (&mut self.backend, &mut self.registry)
    }
}

impl<B: ComputeBackend> Drop for AcceleratorSession<B> {
    fn drop(&mut self) {
        if self.is_initialized() || !self.registry.is_empty() {
            self.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_backend::HostBackend;

    fn session() -> AcceleratorSession<HostBackend> {
        let mut session = AcceleratorSession::new(HostBackend::new());
        session.initialize(&SessionConfig::default()).unwrap();
        session
    }

    #[test]
    fn test_strongest_device() {
        let session = AcceleratorSession::new(HostBackend::new());
        assert_eq!(session.strongest_device_index(), Some(0));
    }

    #[test]
    fn test_push_requires_initialize() {
        let mut session = AcceleratorSession::new(HostBackend::new());
        let result = session.push(&HostData::Real32(vec![1.0]));
        assert!(matches!(result, Err(MediaError::NoSession)));
    }

    #[test]
    fn test_initialize_bad_device() {
        let mut session = AcceleratorSession::new(HostBackend::new());
        let config = SessionConfig {
            device_index: 9,
            kernel_dir: None,
        };
        assert!(matches!(session.initialize(&config), Err(MediaError::SessionCreation(_))));
        assert!(!session.info().initialized);
    }

    #[test]
    fn test_dispose_frees_all_buffers() {
        let mut session = session();
        session.push(&HostData::Real32(vec![0.0; 256])).unwrap();
        session.push(&HostData::Byte(vec![0; 64])).unwrap();

        assert_eq!(session.dispose(), 256 * 4 + 64);
        assert!(session.registry().is_empty());
        assert_eq!(session.backend().live_segments(), 0);
        assert_eq!(session.dispose(), 0);
    }

    #[test]
    fn test_reinitialize_disposes_previous() {
        let mut session = session();
        let handle = session.push(&HostData::Byte(vec![1, 2, 3])).unwrap();

        session.initialize(&SessionConfig::default()).unwrap();

        assert!(!session.registry().contains(handle));
        assert_eq!(session.usage().used, 0);
        assert!(session.info().initialized);
    }

    #[test]
    fn test_info_and_metrics() {
        let mut session = session();
        let handle = session.push(&HostData::Real32(vec![1.0; 8])).unwrap();
        session.pull(handle, true);

        let info = session.info();
        assert_eq!(info.backend, "host");
        assert_eq!(info.live_buffers, 0);

        let snap = session.metrics().snapshot();
        assert_eq!(snap.transfers.pushes, 1);
        assert_eq!(snap.transfers.bytes_pulled, 32);
    }

    #[test]
    fn test_missing_kernel_dir_fails_initialize() {
        let mut session = AcceleratorSession::new(HostBackend::new());
        let config = SessionConfig {
            device_index: 0,
            kernel_dir: Some("/nonexistent/kernels".into()),
        };
        assert!(matches!(session.initialize(&config), Err(MediaError::Io(_))));
        assert!(!session.is_initialized());
    }
}
