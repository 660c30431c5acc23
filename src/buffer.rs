//! Device buffer registry
//!
//! Tracks every device allocation by a registry-assigned [`BufferHandle`].
//! Handles are never reused, so a stale handle can't alias a newer buffer
//! that happens to land on the same device address.
//!
//! Sentinel semantics:
//! - `push` of empty data returns [`BufferHandle::NULL`] without allocating
//! - `pull` of an unknown handle returns empty [`HostData`]
//! - `free` of an unknown or already-freed handle returns 0

use std::collections::BTreeMap;
use std::fmt;

use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{ComputeBackend, DevicePtr, MemoryInfo};
use crate::error::{MediaError, Result};

/// Element type of a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Real32,
    Complex32,
    Complex64,
    Byte,
}

impl ElementKind {
    /// Size of one element in bytes
    pub const fn size(&self) -> usize {
        match self {
            ElementKind::Real32 => 4,
            ElementKind::Complex32 => 8,
            ElementKind::Complex64 => 16,
            ElementKind::Byte => 1,
        }
    }

    pub const fn is_complex(&self) -> bool {
        matches!(self, ElementKind::Complex32 | ElementKind::Complex64)
    }
}

/// Typed host-side data for one buffer segment
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    Real32(Vec<f32>),
    Complex32(Vec<Complex<f32>>),
    Complex64(Vec<Complex<f64>>),
    Byte(Vec<u8>),
}

impl Default for HostData {
    fn default() -> Self {
        HostData::Byte(Vec::new())
    }
}

impl HostData {
    pub fn empty(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Real32 => HostData::Real32(Vec::new()),
            ElementKind::Complex32 => HostData::Complex32(Vec::new()),
            ElementKind::Complex64 => HostData::Complex64(Vec::new()),
            ElementKind::Byte => HostData::Byte(Vec::new()),
        }
    }

    pub fn kind(&self) -> ElementKind {
        match self {
            HostData::Real32(_) => ElementKind::Real32,
            HostData::Complex32(_) => ElementKind::Complex32,
            HostData::Complex64(_) => ElementKind::Complex64,
            HostData::Byte(_) => ElementKind::Byte,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            HostData::Real32(v) => v.len(),
            HostData::Complex32(v) => v.len(),
            HostData::Complex64(v) => v.len(),
            HostData::Byte(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Little-endian byte image, as copied to the device
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            HostData::Real32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            HostData::Complex32(v) => v
                .iter()
                .flat_map(|c| c.re.to_le_bytes().into_iter().chain(c.im.to_le_bytes()))
                .collect(),
            HostData::Complex64(v) => v
                .iter()
                .flat_map(|c| c.re.to_le_bytes().into_iter().chain(c.im.to_le_bytes()))
                .collect(),
            HostData::Byte(v) => v.clone(),
        }
    }

    /// Rebuild typed data from a little-endian byte image.
    ///
    /// Returns `None` when `bytes` is not a whole number of elements.
    pub fn from_bytes(kind: ElementKind, bytes: &[u8]) -> Option<Self> {
        if bytes.len() % kind.size() != 0 {
            return None;
        }
        let data = match kind {
            ElementKind::Real32 => HostData::Real32(
                bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
            ElementKind::Complex32 => HostData::Complex32(
                bytes
                    .chunks_exact(8)
                    .map(|b| {
                        Complex::new(
                            f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
                            f32::from_le_bytes([b[4], b[5], b[6], b[7]]),
                        )
                    })
                    .collect(),
            ),
            ElementKind::Complex64 => HostData::Complex64(
                bytes
                    .chunks_exact(16)
                    .map(|b| {
                        let mut re = [0u8; 8];
                        let mut im = [0u8; 8];
                        re.copy_from_slice(&b[..8]);
                        im.copy_from_slice(&b[8..]);
                        Complex::new(f64::from_le_bytes(re), f64::from_le_bytes(im))
                    })
                    .collect(),
            ),
            ElementKind::Byte => HostData::Byte(bytes.to_vec()),
        };
        Some(data)
    }

    /// Append another segment of the same kind. Mismatched kinds are ignored.
    fn extend(&mut self, other: HostData) {
        match (self, other) {
            (HostData::Real32(a), HostData::Real32(b)) => a.extend(b),
            (HostData::Complex32(a), HostData::Complex32(b)) => a.extend(b),
            (HostData::Complex64(a), HostData::Complex64(b)) => a.extend(b),
            (HostData::Byte(a), HostData::Byte(b)) => a.extend(b),
            _ => {}
        }
    }
}

/// Opaque registry-assigned buffer id. `NULL` is the zero handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BufferHandle(u64);

impl BufferHandle {
    pub const NULL: BufferHandle = BufferHandle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One tracked device allocation (one or more segments of one element kind)
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    segments: Vec<DevicePtr>,
    lengths: Vec<usize>,
    kind: ElementKind,
}

impl DeviceBuffer {
    pub fn segments(&self) -> &[DevicePtr] {
        &self.segments
    }

    /// Element count of each segment
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn total_length(&self) -> usize {
        self.lengths.iter().sum()
    }

    pub fn size_bytes(&self) -> u64 {
        self.lengths
            .iter()
            .map(|&len| (len * self.kind.size()) as u64)
            .sum()
    }
}

/// Device memory totals in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Backend-reported device memory
    pub total: u64,
    /// Sum of all live registry buffers
    pub used: u64,
    /// Backend-reported free device memory
    pub free: u64,
}

impl UsageTotals {
    pub fn usage_percentage(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f32 / self.total as f32 * 100.0
        }
    }
}

/// Serializable view of one live buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferInfo {
    pub handle: BufferHandle,
    pub kind: ElementKind,
    pub segments: usize,
    pub lengths: Vec<usize>,
    pub total_length: usize,
    pub total_bytes: u64,
}

/// Registry of live device buffers
#[derive(Debug)]
pub struct BufferRegistry {
    buffers: BTreeMap<BufferHandle, DeviceBuffer>,
    next_id: u64,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self {
            buffers: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, buffer: DeviceBuffer) -> BufferHandle {
        let handle = BufferHandle(self.next_id);
        self.next_id += 1;
        self.buffers.insert(handle, buffer);
        handle
    }

    /// Reserve device segments of `kind` with the given element counts.
    pub fn alloc<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        kind: ElementKind,
        segment_lengths: &[usize],
    ) -> Result<BufferHandle> {
        if segment_lengths.is_empty() {
            warn!("Refusing allocation without segments");
            return Err(MediaError::AllocationFailed("no segments requested".to_string()));
        }

        let segments = backend.allocate(kind, segment_lengths).map_err(|e| {
            warn!("Allocation of {} {:?} segment(s) denied: {}", segment_lengths.len(), kind, e);
            e
        })?;

        if segments.len() != segment_lengths.len() {
            for ptr in segments {
                backend.free(ptr);
            }
            warn!("Backend returned a segment count that does not match the request");
            return Err(MediaError::AllocationFailed("segment count mismatch".to_string()));
        }

        let buffer = DeviceBuffer {
            segments,
            lengths: segment_lengths.to_vec(),
            kind,
        };
        let size = buffer.size_bytes();
        let handle = self.insert(buffer);
        debug!("Allocated {} kB {}", size / 1024, handle);
        Ok(handle)
    }

    /// Register a buffer the backend produced itself (kernel outputs).
    pub fn adopt(&mut self, kind: ElementKind, segments: Vec<DevicePtr>, lengths: Vec<usize>) -> BufferHandle {
        let handle = self.insert(DeviceBuffer { segments, lengths, kind });
        debug!("Adopted backend output as {}", handle);
        handle
    }

    /// Allocate and copy one segment of host data.
    pub fn push<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B, data: &HostData) -> Result<BufferHandle> {
        self.push_segments(backend, std::slice::from_ref(data))
    }

    /// Allocate one segment per entry and copy each host→device.
    ///
    /// All segments must share one element kind. A failed copy frees the
    /// whole allocation before returning.
    pub fn push_segments<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        segments: &[HostData],
    ) -> Result<BufferHandle> {
        let Some(first) = segments.first() else {
            debug!("No data to push");
            return Ok(BufferHandle::NULL);
        };
        if segments.iter().all(HostData::is_empty) {
            debug!("No data to push");
            return Ok(BufferHandle::NULL);
        }

        let kind = first.kind();
        if let Some(other) = segments.iter().find(|s| s.kind() != kind) {
            warn!("Mixed element kinds in one push: {:?} and {:?}", kind, other.kind());
            return Err(MediaError::UnsupportedElementKind(other.kind()));
        }

        let lengths: Vec<usize> = segments.iter().map(HostData::len).collect();
        let handle = self.alloc(backend, kind, &lengths)?;

        let ptrs = self
            .buffers
            .get(&handle)
            .map(|b| b.segments.clone())
            .unwrap_or_default();
        for (ptr, data) in ptrs.iter().zip(segments) {
            if let Err(e) = backend.copy_host_to_device(*ptr, &data.to_bytes()) {
                warn!("Copy to device failed for {}: {}", handle, e);
                self.free(backend, handle);
                return Err(e);
            }
        }

        debug!("Pushed {} kB {}", self.size_of(handle) / 1024, handle);
        Ok(handle)
    }

    /// Push overlapping audio chunks as one multi-segment `Real32` buffer.
    pub fn push_chunks<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        chunks: Vec<Vec<f32>>,
    ) -> Result<BufferHandle> {
        let segments: Vec<HostData> = chunks.into_iter().map(HostData::Real32).collect();
        self.push_segments(backend, &segments)
    }

    /// Copy every segment device→host, concatenated.
    pub fn pull<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B, handle: BufferHandle, free: bool) -> HostData {
        let Some(kind) = self.buffers.get(&handle).map(|b| b.kind) else {
            debug!("Couldn't find {} to pull", handle);
            return HostData::default();
        };
        let mut out = HostData::empty(kind);
        for segment in self.pull_segments(backend, handle, free) {
            out.extend(segment);
        }
        out
    }

    /// Copy every segment device→host, one entry per segment.
    ///
    /// Returns an empty vector for unknown handles or when any copy fails;
    /// the buffer is only freed after a complete pull.
    pub fn pull_segments<B: ComputeBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        handle: BufferHandle,
        free: bool,
    ) -> Vec<HostData> {
        let Some(buffer) = self.buffers.get(&handle) else {
            debug!("Couldn't find {} to pull", handle);
            return Vec::new();
        };
        let kind = buffer.kind;
        let ptrs = buffer.segments.clone();

        let mut out = Vec::with_capacity(ptrs.len());
        for ptr in ptrs {
            let bytes = match backend.copy_device_to_host(ptr) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Copy to host failed for {}: {}", handle, e);
                    return Vec::new();
                }
            };
            match HostData::from_bytes(kind, &bytes) {
                Some(data) => out.push(data),
                None => {
                    warn!("Device returned {} bytes, not a whole number of {:?}", bytes.len(), kind);
                    return Vec::new();
                }
            }
        }

        debug!("Pulled {} kB {}", self.size_of(handle) / 1024, handle);
        if free {
            self.free(backend, handle);
        }
        out
    }

    /// Release every segment of `handle`. Returns the bytes freed, 0 if unknown.
    pub fn free<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B, handle: BufferHandle) -> u64 {
        let Some(buffer) = self.buffers.remove(&handle) else {
            debug!("Couldn't find {} to free", handle);
            return 0;
        };
        for ptr in &buffer.segments {
            backend.free(*ptr);
        }
        let size = buffer.size_bytes();
        debug!("Freed {} kB {}", size / 1024, handle);
        size
    }

    /// Free every tracked buffer. Returns the bytes freed.
    pub fn free_all<B: ComputeBackend + ?Sized>(&mut self, backend: &mut B) -> u64 {
        let handles: Vec<BufferHandle> = self.buffers.keys().copied().collect();
        handles.into_iter().map(|h| self.free(backend, h)).sum()
    }

    pub fn get(&self, handle: BufferHandle) -> Option<&DeviceBuffer> {
        self.buffers.get(&handle)
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.buffers.contains_key(&handle)
    }

    pub fn kind_of(&self, handle: BufferHandle) -> Option<ElementKind> {
        self.buffers.get(&handle).map(|b| b.kind)
    }

    pub fn size_of(&self, handle: BufferHandle) -> u64 {
        self.buffers.get(&handle).map(DeviceBuffer::size_bytes).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes held by live buffers
    pub fn used_bytes(&self) -> u64 {
        self.buffers.values().map(DeviceBuffer::size_bytes).sum()
    }

    pub fn usage_totals(&self, memory: MemoryInfo) -> UsageTotals {
        UsageTotals {
            total: memory.total,
            used: self.used_bytes(),
            free: memory.free,
        }
    }

    pub fn buffer_infos(&self) -> Vec<BufferInfo> {
        self.buffers
            .iter()
            .map(|(handle, b)| BufferInfo {
                handle: *handle,
                kind: b.kind,
                segments: b.segment_count(),
                lengths: b.lengths.clone(),
                total_length: b.total_length(),
                total_bytes: b.size_bytes(),
            })
            .collect()
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host_backend::HostBackend;

    fn backend() -> HostBackend {
        let mut backend = HostBackend::new();
        backend.create_session(0).unwrap();
        backend
    }

    #[test]
    fn test_push_empty_returns_null_without_allocating() {
        let mut backend = backend();
        let mut registry = BufferRegistry::new();

        let handle = registry.push(&mut backend, &HostData::Real32(vec![])).unwrap();

        assert!(handle.is_null());
        assert!(registry.is_empty());
        assert_eq!(registry.used_bytes(), 0);
    }

    #[test]
    fn test_push_pull_round_trip_bytes() {
        let mut backend = backend();
        let mut registry = BufferRegistry::new();
        let data = HostData::Byte((0..=255).collect());

        let handle = registry.push(&mut backend, &data).unwrap();
        assert_eq!(registry.used_bytes(), 256);

        let pulled = registry.pull(&mut backend, handle, true);
        assert_eq!(pulled, data);
        assert!(!registry.contains(handle));
    }

    #[test]
    fn test_free_unknown_handle_is_noop() {
        let mut backend = backend();
        let mut registry = BufferRegistry::new();

        assert_eq!(registry.free(&mut backend, BufferHandle(42)), 0);
        assert_eq!(registry.free(&mut backend, BufferHandle::NULL), 0);
    }

    #[test]
    fn test_double_free_returns_zero() {
        let mut backend = backend();
        let mut registry = BufferRegistry::new();
        let handle = registry.alloc(&mut backend, ElementKind::Real32, &[16, 16]).unwrap();

        assert_eq!(registry.free(&mut backend, handle), 128);
        assert_eq!(registry.free(&mut backend, handle), 0);
    }

    #[test]
    fn test_pull_unknown_handle_is_empty() {
        let mut backend = backend();
        let mut registry = BufferRegistry::new();

        assert!(registry.pull(&mut backend, BufferHandle(7), false).is_empty());
        assert!(registry.pull_segments(&mut backend, BufferHandle(7), false).is_empty());
    }

    #[test]
    fn test_handles_are_not_reused() {
        let mut backend = backend();
        let mut registry = BufferRegistry::new();

        let first = registry.alloc(&mut backend, ElementKind::Byte, &[8]).unwrap();
        registry.free(&mut backend, first);
        let second = registry.alloc(&mut backend, ElementKind::Byte, &[8]).unwrap();

        assert_ne!(first, second);
        assert!(!registry.contains(first));
    }

    #[test]
    fn test_mixed_kinds_rejected() {
        let mut backend = backend();
        let mut registry = BufferRegistry::new();
        let segments = vec![HostData::Real32(vec![1.0]), HostData::Byte(vec![1])];

        let result = registry.push_segments(&mut backend, &segments);

        assert!(matches!(result, Err(MediaError::UnsupportedElementKind(ElementKind::Byte))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_usage_totals_sum_live_buffers() {
        let mut backend = backend();
        let mut registry = BufferRegistry::new();
        registry.alloc(&mut backend, ElementKind::Complex32, &[10, 20]).unwrap();
        registry.alloc(&mut backend, ElementKind::Byte, &[100]).unwrap();

        let totals = registry.usage_totals(backend.memory_info());

        assert_eq!(totals.used, 30 * 8 + 100);
        assert_eq!(totals.total, backend.memory_info().total);
    }

    #[test]
    fn test_complex64_bytes_round_trip() {
        let data = HostData::Complex64(vec![Complex::new(1.5, -2.25), Complex::new(f64::MIN_POSITIVE, 0.0)]);
        let bytes = data.to_bytes();
        assert_eq!(bytes.len(), 32);
        assert_eq!(HostData::from_bytes(ElementKind::Complex64, &bytes), Some(data));
        assert_eq!(HostData::from_bytes(ElementKind::Complex64, &bytes[..31]), None);
    }
}
