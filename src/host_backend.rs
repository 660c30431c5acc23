//! Host reference backend
//!
//! Implements [`ComputeBackend`] on the CPU. Device memory is emulated in host
//! RAM with a fixed capacity, kernels compile by signature parsing and run as
//! built-in host routines parallelized with rayon, and FFTs run through
//! rustfft. Used by the CLI when no accelerator driver is wired in, and by
//! the test-suite.
//!
//! ## Built-in kernels
//!
//! | base name     | path  | behavior                                        |
//! |---------------|-------|-------------------------------------------------|
//! | `mandelbrot`  | image | renders `(zoom, x, y, iter)` into RGBA pixels   |
//! | `invert`      | image | inverts RGB, keeps alpha                        |
//! | `normalize`   | audio | scales all chunks to peak `amplitude`           |
//! | `timestretch` | audio | passes grains through, reports `factor`         |
//!
//! A `_double` suffix on the base name selects the same routine.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use tracing::{debug, info, warn};

use crate::backend::{
    ComputeBackend, DeviceDescriptor, DeviceKind, DevicePtr, FftDirection, LaunchOutput, MemoryInfo, WorkDims,
};
use crate::buffer::{ElementKind, HostData};
use crate::config::HostBackendConfig;
use crate::error::{MediaError, Result};
use crate::kernel::{BoundArgs, KernelDescriptor};

const BASE_ADDRESS: u64 = 0x7F00_0000_0000;
const ALIGNMENT: u64 = 256;

/// Largest duration change the `timestretch` routine accepts.
const MAX_STRETCH_FACTOR: f64 = 64.0;

/// Host routine behind a compiled kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostKernel {
    Mandelbrot,
    Invert,
    Normalize,
    TimeStretch,
}

impl HostKernel {
    fn from_base_name(base: &str) -> Option<Self> {
        let base = base.strip_suffix("_double").unwrap_or(base);
        let base = base.strip_suffix("_float").unwrap_or(base);
        match base.to_ascii_lowercase().as_str() {
            "mandelbrot" => Some(HostKernel::Mandelbrot),
            "invert" => Some(HostKernel::Invert),
            "normalize" => Some(HostKernel::Normalize),
            "timestretch" => Some(HostKernel::TimeStretch),
            _ => None,
        }
    }
}

struct Segment {
    kind: ElementKind,
    bytes: Vec<u8>,
}

/// CPU implementation of the compute backend
pub struct HostBackend {
    config: HostBackendConfig,
    active_device: Option<usize>,
    memory: HashMap<u64, Segment>,
    used: u64,
    next_address: u64,
    planner: FftPlanner<f64>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::with_config(HostBackendConfig::default())
    }

    pub fn with_config(config: HostBackendConfig) -> Self {
        info!(
            "🔧 HostBackend ready ({} MB emulated device memory, {} threads)",
            config.memory_capacity / (1024 * 1024),
            rayon::current_num_threads()
        );
        Self {
            config,
            active_device: None,
            memory: HashMap::new(),
            used: 0,
            next_address: BASE_ADDRESS,
            planner: FftPlanner::new(),
        }
    }

    pub fn config(&self) -> &HostBackendConfig {
        &self.config
    }

    /// Number of live emulated segments
    pub fn live_segments(&self) -> usize {
        self.memory.len()
    }

    fn require_session(&self) -> Result<()> {
        match self.active_device {
            Some(_) => Ok(()),
            None => Err(MediaError::NoSession),
        }
    }

    fn read(&self, ptr: DevicePtr, kind: ElementKind) -> Result<HostData> {
        let segment = self
            .memory
            .get(&ptr.0)
            .ok_or_else(|| MediaError::Launch(format!("unknown device address {}", ptr)))?;
        if segment.kind != kind {
            return Err(MediaError::Launch(format!(
                "segment {} holds {:?}, kernel expects {:?}",
                ptr, segment.kind, kind
            )));
        }
        HostData::from_bytes(kind, &segment.bytes)
            .ok_or_else(|| MediaError::Launch(format!("segment {} is not a whole number of elements", ptr)))
    }

    /// Allocate and fill output segments; frees them again if any copy fails.
    fn store(&mut self, outputs: Vec<HostData>) -> Result<LaunchOutput> {
        let kind = outputs.first().map(HostData::kind).unwrap_or(ElementKind::Byte);
        let lengths: Vec<usize> = outputs.iter().map(HostData::len).collect();
        let segments = self.allocate(kind, &lengths)?;
        for (ptr, data) in segments.iter().zip(&outputs) {
            if let Err(e) = self.copy_host_to_device(*ptr, &data.to_bytes()) {
                for ptr in &segments {
                    self.free(*ptr);
                }
                return Err(e);
            }
        }
        Ok(LaunchOutput {
            segments,
            kind,
            lengths,
            stretch_factor: 1.0,
        })
    }

    fn read_inputs(&self, args: &BoundArgs) -> Result<Vec<HostData>> {
        args.input.iter().map(|ptr| self.read(*ptr, args.input_kind)).collect()
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        vec![DeviceDescriptor {
            index: 0,
            name: self.config.device_name.clone(),
            vendor: "accel_media".to_string(),
            kind: DeviceKind::Cpu,
            global_memory: self.config.memory_capacity,
            compute_units: rayon::current_num_threads() as u32,
            clock_mhz: self.config.clock_mhz,
        }]
    }

    fn create_session(&mut self, device_index: usize) -> Result<()> {
        if device_index >= self.enumerate_devices().len() {
            return Err(MediaError::SessionCreation(format!("no device at index {}", device_index)));
        }
        if self.active_device.is_some() {
            self.release_session();
        }
        self.active_device = Some(device_index);
        debug!("Host session opened on device {}", device_index);
        Ok(())
    }

    fn release_session(&mut self) {
        if !self.memory.is_empty() {
            warn!("Releasing host session with {} live segment(s)", self.memory.len());
        }
        self.memory.clear();
        self.used = 0;
        self.active_device = None;
    }

    fn allocate(&mut self, kind: ElementKind, segment_lengths: &[usize]) -> Result<Vec<DevicePtr>> {
        self.require_session()?;
        let requested: u64 = segment_lengths.iter().map(|&len| (len * kind.size()) as u64).sum();
        let available = self.config.memory_capacity.saturating_sub(self.used);
        if requested > available {
            return Err(MediaError::OutOfMemory { requested, available });
        }

        let ptrs = segment_lengths
            .iter()
            .map(|&len| {
                let bytes = len * kind.size();
                let address = self.next_address;
                self.next_address += (bytes as u64).div_ceil(ALIGNMENT).max(1) * ALIGNMENT;
                self.memory.insert(address, Segment { kind, bytes: vec![0; bytes] });
                DevicePtr(address)
            })
            .collect();
        self.used += requested;
        Ok(ptrs)
    }

    fn free(&mut self, segment: DevicePtr) {
        if let Some(freed) = self.memory.remove(&segment.0) {
            self.used -= freed.bytes.len() as u64;
        }
    }

    fn copy_host_to_device(&mut self, segment: DevicePtr, bytes: &[u8]) -> Result<()> {
        let target = self
            .memory
            .get_mut(&segment.0)
            .ok_or_else(|| MediaError::CopyFailed(format!("unknown device address {}", segment)))?;
        if target.bytes.len() != bytes.len() {
            return Err(MediaError::CopyFailed(format!(
                "{} bytes into a {} byte segment",
                bytes.len(),
                target.bytes.len()
            )));
        }
        target.bytes.copy_from_slice(bytes);
        Ok(())
    }

    fn copy_device_to_host(&mut self, segment: DevicePtr) -> Result<Vec<u8>> {
        self.memory
            .get(&segment.0)
            .map(|s| s.bytes.clone())
            .ok_or_else(|| MediaError::CopyFailed(format!("unknown device address {}", segment)))
    }

    fn compile_kernel(&mut self, source_path: &Path) -> Result<KernelDescriptor> {
        self.require_session()?;
        let source = fs::read_to_string(source_path)?;
        let descriptor = KernelDescriptor::parse_source(&source, source_path)?;
        if HostKernel::from_base_name(&descriptor.base_name).is_none() {
            return Err(MediaError::Compile(format!(
                "no host routine for kernel '{}'",
                descriptor.name
            )));
        }
        if descriptor.input_kind().is_none() {
            return Err(MediaError::Compile(format!("{} declares no input buffer", descriptor.name)));
        }
        Ok(descriptor)
    }

    fn launch(&mut self, kernel: &KernelDescriptor, args: &BoundArgs, dims: WorkDims) -> Result<LaunchOutput> {
        self.require_session()?;
        let routine = HostKernel::from_base_name(&kernel.base_name)
            .ok_or_else(|| MediaError::Launch(format!("kernel '{}' was not compiled here", kernel.name)))?;
        if args.input.is_empty() {
            return Err(MediaError::Launch("no input segments bound".to_string()));
        }

        let inputs = self.read_inputs(args)?;
        let outputs = match (routine, dims) {
            (HostKernel::Mandelbrot, WorkDims::Image { width, height }) => {
                let view = MandelbrotView {
                    zoom: args.scalar_at(4).map(|v| v.as_f64()).unwrap_or(1.0),
                    center_x: args.scalar_at(5).map(|v| v.as_f64()).unwrap_or(-0.5),
                    center_y: args.scalar_at(6).map(|v| v.as_f64()).unwrap_or(0.0),
                    max_iter: args.scalar_at(7).map(|v| v.as_f64() as u32).unwrap_or(100),
                };
                vec![HostData::Byte(render_mandelbrot(width, height, view))]
            }
            (HostKernel::Invert, WorkDims::Image { width, height }) => inputs
                .into_iter()
                .map(|data| match data {
                    HostData::Byte(pixels) if pixels.len() == width as usize * height as usize * 4 => {
                        Ok(HostData::Byte(invert_rgba(pixels)))
                    }
                    other => Err(MediaError::Launch(format!(
                        "invert expects {}x{} RGBA bytes, got {} {:?} elements",
                        width,
                        height,
                        other.len(),
                        other.kind()
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
            (HostKernel::Normalize, WorkDims::Chunks { .. }) => {
                let amplitude = args.get("amplitude").map(|v| v.as_f64() as f32).unwrap_or(1.0);
                normalize_chunks(inputs, amplitude)?
            }
            (HostKernel::TimeStretch, WorkDims::Chunks { .. }) => {
                let factor = args.get("factor").map(|v| v.as_f64()).unwrap_or(1.0);
                if !(factor > 0.0 && factor <= MAX_STRETCH_FACTOR) {
                    return Err(MediaError::Launch(format!("invalid stretch factor {}", factor)));
                }
                // Grains pass through unchanged; duration changes when the host
                // re-spaces them at hop × factor during reconstruction.
                inputs
            }
            (routine, dims) => {
                return Err(MediaError::Launch(format!(
                    "{:?} cannot run with work dims {:?}",
                    routine, dims
                )));
            }
        };

        let mut output = self.store(outputs)?;
        output.stretch_factor = args.get("factor").map(|v| v.as_f64()).unwrap_or(1.0);
        debug!(
            "Launched {} on {} segment(s) -> {} segment(s)",
            kernel.name,
            args.input.len(),
            output.segments.len()
        );
        Ok(output)
    }

    fn execute_fft(
        &mut self,
        direction: FftDirection,
        input: DevicePtr,
        input_kind: ElementKind,
        output: DevicePtr,
        length: usize,
    ) -> Result<()> {
        self.require_session()?;
        let valid = match direction {
            FftDirection::RealToComplex => input_kind == ElementKind::Real32,
            FftDirection::ComplexToReal | FftDirection::ComplexToComplex => input_kind.is_complex(),
        };
        if !valid || length == 0 {
            return Err(MediaError::Fft(format!(
                "{:?} cannot transform {} {:?} elements",
                direction, length, input_kind
            )));
        }

        let data = self.read(input, input_kind).map_err(|e| MediaError::Fft(e.to_string()))?;
        if data.len() != length {
            return Err(MediaError::Fft(format!("segment holds {} elements, expected {}", data.len(), length)));
        }
        let mut buffer: Vec<Complex<f64>> = match data {
            HostData::Real32(v) => v.into_iter().map(|x| Complex::new(x as f64, 0.0)).collect(),
            HostData::Complex32(v) => v.into_iter().map(|c| Complex::new(c.re as f64, c.im as f64)).collect(),
            HostData::Complex64(v) => v,
            HostData::Byte(_) => return Err(MediaError::UnsupportedElementKind(ElementKind::Byte)),
        };

        let result = match direction {
            FftDirection::RealToComplex => {
                self.planner.plan_fft_forward(length).process(&mut buffer);
                HostData::Complex32(buffer.iter().map(|c| Complex::new(c.re as f32, c.im as f32)).collect())
            }
            FftDirection::ComplexToReal => {
                self.planner.plan_fft_inverse(length).process(&mut buffer);
                let scale = 1.0 / length as f64;
                HostData::Real32(buffer.iter().map(|c| (c.re * scale) as f32).collect())
            }
            FftDirection::ComplexToComplex => {
                self.planner.plan_fft_inverse(length).process(&mut buffer);
                let scale = 1.0 / length as f64;
                match input_kind {
                    ElementKind::Complex64 => HostData::Complex64(buffer.iter().map(|c| *c * scale).collect()),
                    _ => HostData::Complex32(
                        buffer
                            .iter()
                            .map(|c| Complex::new((c.re * scale) as f32, (c.im * scale) as f32))
                            .collect(),
                    ),
                }
            }
        };

        let target_kind = self.memory.get(&output.0).map(|s| s.kind);
        if target_kind != Some(result.kind()) {
            return Err(MediaError::Fft(format!(
                "output segment {} holds {:?}, transform produces {:?}",
                output,
                target_kind,
                result.kind()
            )));
        }
        self.copy_host_to_device(output, &result.to_bytes())
            .map_err(|e| MediaError::Fft(e.to_string()))
    }

    fn memory_info(&self) -> MemoryInfo {
        MemoryInfo {
            total: self.config.memory_capacity,
            free: self.config.memory_capacity.saturating_sub(self.used),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MandelbrotView {
    zoom: f64,
    center_x: f64,
    center_y: f64,
    max_iter: u32,
}

fn render_mandelbrot(width: u32, height: u32, view: MandelbrotView) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let scale = 3.0 / (view.zoom.max(f64::MIN_POSITIVE) * w.max(1) as f64);
    let max_iter = view.max_iter.max(1);
    let mut pixels = vec![0u8; w * h * 4];

    pixels.par_chunks_mut(w * 4).enumerate().for_each(|(py, row)| {
        let cy = view.center_y + (py as f64 - h as f64 / 2.0) * scale;
        for (px, pixel) in row.chunks_exact_mut(4).enumerate() {
            let cx = view.center_x + (px as f64 - w as f64 / 2.0) * scale;
            let (mut zx, mut zy) = (0.0f64, 0.0f64);
            let mut i = 0;
            while i < max_iter && zx * zx + zy * zy <= 4.0 {
                let t = zx * zx - zy * zy + cx;
                zy = 2.0 * zx * zy + cy;
                zx = t;
                i += 1;
            }
            let t = i as f64 / max_iter as f64;
            let (r, g, b) = if i >= max_iter {
                (0.0, 0.0, 0.0)
            } else {
                (
                    9.0 * (1.0 - t) * t * t * t,
                    15.0 * (1.0 - t) * (1.0 - t) * t * t,
                    8.5 * (1.0 - t) * (1.0 - t) * (1.0 - t) * t,
                )
            };
            pixel[0] = (r * 255.0).clamp(0.0, 255.0) as u8;
            pixel[1] = (g * 255.0).clamp(0.0, 255.0) as u8;
            pixel[2] = (b * 255.0).clamp(0.0, 255.0) as u8;
            pixel[3] = 255;
        }
    });
    pixels
}

fn invert_rgba(mut pixels: Vec<u8>) -> Vec<u8> {
    pixels.par_chunks_exact_mut(4).for_each(|px| {
        px[0] = 255 - px[0];
        px[1] = 255 - px[1];
        px[2] = 255 - px[2];
    });
    pixels
}

fn normalize_chunks(inputs: Vec<HostData>, amplitude: f32) -> Result<Vec<HostData>> {
    let mut chunks = inputs
        .into_iter()
        .map(|data| match data {
            HostData::Real32(v) => Ok(v),
            other => Err(MediaError::Launch(format!("normalize expects Real32, got {:?}", other.kind()))),
        })
        .collect::<Result<Vec<Vec<f32>>>>()?;

    let peak = chunks
        .par_iter()
        .map(|c| c.iter().fold(0.0f32, |m, x| m.max(x.abs())))
        .reduce(|| 0.0, f32::max);
    if peak > 0.0 {
        let gain = amplitude / peak;
        chunks.par_iter_mut().for_each(|c| c.iter_mut().for_each(|x| *x *= gain));
    }
    Ok(chunks.into_iter().map(HostData::Real32).collect())
}
