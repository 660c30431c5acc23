//! Compute backend contract
//!
//! The accelerator driver (device enumeration, contexts, kernel compilation,
//! raw copies and launches) sits behind [`ComputeBackend`]. Everything in this
//! crate talks to the device through this trait, one synchronous call at a
//! time: each method returns only after the device operation completed.
//!
//! Raw device addresses ([`DevicePtr`]) never leave the crate's buffer
//! registry; callers hold registry-assigned [`BufferHandle`](crate::BufferHandle)s.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::buffer::ElementKind;
use crate::error::Result;
use crate::kernel::{BoundArgs, KernelDescriptor};

/// Raw device address of one allocated segment, as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{:#016X}>", self.0)
    }
}

/// Device type as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Gpu,
    Cpu,
    Accelerator,
}

/// Static description of one enumerable device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub name: String,
    pub vendor: String,
    pub kind: DeviceKind,
    pub global_memory: u64,
    pub compute_units: u32,
    pub clock_mhz: u32,
}

impl DeviceDescriptor {
    /// Throughput heuristic used for picking the strongest device.
    pub fn score(&self) -> u64 {
        self.compute_units as u64 * self.clock_mhz as u64
    }
}

/// Backend-reported device memory in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
}

/// Global work size of a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkDims {
    /// Image kernels: one work item per pixel
    Image { width: u32, height: u32 },
    /// Audio kernels: one work item per sample of each chunk
    Chunks { chunk_size: usize, count: usize },
}

/// Output produced by a kernel launch
#[derive(Debug, Clone)]
pub struct LaunchOutput {
    pub segments: Vec<DevicePtr>,
    pub kind: ElementKind,
    pub lengths: Vec<usize>,
    /// Effective stretch factor of the launch; 1.0 when duration is unchanged.
    pub stretch_factor: f64,
}

/// Transform direction of a device FFT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FftDirection {
    /// Real input, complex output
    RealToComplex,
    /// Complex input, real output (normalized inverse)
    ComplexToReal,
    /// Complex input, complex output (normalized inverse)
    ComplexToComplex,
}

impl FftDirection {
    /// Element kind of the transform output for a given input kind.
    pub fn output_kind(&self, input: ElementKind) -> ElementKind {
        match self {
            FftDirection::RealToComplex => ElementKind::Complex32,
            FftDirection::ComplexToReal => ElementKind::Real32,
            FftDirection::ComplexToComplex => input,
        }
    }
}

/// Accelerator driver capability consumed by the session.
pub trait ComputeBackend {
    /// Human-readable backend name for logs
    fn name(&self) -> &str;

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor>;

    /// Create context + command queue on the given device.
    fn create_session(&mut self, device_index: usize) -> Result<()>;

    /// Release context and queue. Safe to call without an active session.
    fn release_session(&mut self);

    /// Reserve one segment per entry of `segment_lengths` (element counts).
    fn allocate(&mut self, kind: ElementKind, segment_lengths: &[usize]) -> Result<Vec<DevicePtr>>;

    fn free(&mut self, segment: DevicePtr);

    fn copy_host_to_device(&mut self, segment: DevicePtr, bytes: &[u8]) -> Result<()>;

    fn copy_device_to_host(&mut self, segment: DevicePtr) -> Result<Vec<u8>>;

    fn compile_kernel(&mut self, source_path: &Path) -> Result<KernelDescriptor>;

    fn launch(&mut self, kernel: &KernelDescriptor, args: &BoundArgs, dims: WorkDims) -> Result<LaunchOutput>;

    /// Run one transform of `length` elements from `input` into `output`.
    fn execute_fft(
        &mut self,
        direction: FftDirection,
        input: DevicePtr,
        input_kind: ElementKind,
        output: DevicePtr,
        length: usize,
    ) -> Result<()>;

    fn memory_info(&self) -> MemoryInfo;
}
