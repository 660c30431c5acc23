//! accel_media - accelerator compute orchestration for audio and image media
//!
//! Tracks device buffers bound to host-side media objects, moves data across
//! the host/device boundary, chunks and reconstructs audio with overlap-add,
//! and dispatches kernels and FFTs against a pluggable [`ComputeBackend`].
//! [`HostBackend`] runs everything on the CPU.

mod backend;
mod buffer;
mod chunker;
mod collection;
mod config;
mod dispatch;
mod error;
mod fft;
mod host_backend;
mod kernel;
mod media;
mod metrics;
mod session;

pub use backend::{
    ComputeBackend, DeviceDescriptor, DeviceKind, DevicePtr, FftDirection, LaunchOutput, MemoryInfo, WorkDims,
};
pub use buffer::{BufferHandle, BufferInfo, BufferRegistry, DeviceBuffer, ElementKind, HostData, UsageTotals};
pub use chunker::{
    aggregate_linear, aggregate_windowed, extract, hann_window, stretched_hop, windowed_output_len, ChunkLayout,
    MAX_OUTPUT_SAMPLES, MIN_WINDOW_WEIGHT,
};
pub use collection::MediaCollection;
pub use config::{AccelConfig, DispatchConfig, HostBackendConfig, SessionConfig};
pub use dispatch::{device_kind, KernelDispatcher};
pub use error::{ErrorKind, MediaError, Result};
pub use fft::{select_direction, FftMode, FftOrchestrator};
pub use host_backend::HostBackend;
pub use kernel::{
    ArgValue, AudioLaunchParams, BoundArgs, BoundScalar, KernelCatalog, KernelDescriptor, KernelParam, OptionalArgs,
    ParamType, Precision,
};
pub use media::{AudioInfo, AudioObject, Form, ImageInfo, ImageObject, MediaId, MediaObject, Residency, Waveform};
pub use metrics::{Metrics, MetricsSnapshot, Timer};
pub use session::{AcceleratorSession, LaunchResult, SessionInfo};
