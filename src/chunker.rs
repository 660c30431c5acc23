//! Overlapping window extraction and overlap-add reconstruction
//!
//! Audio is split into fixed-size windows before it goes to the device and
//! stitched back together afterwards. Two reconstruction policies exist:
//!
//! - [`aggregate_linear`]: plain overlap-add divided by the number of
//!   contributing windows. Lossless for unmodified chunks.
//! - [`aggregate_windowed`]: Hann-weighted overlap-add with the output hop
//!   scaled by a stretch factor. Amplitude-correct only; phases of
//!   neighbouring windows are not aligned, so pitch is not preserved
//!   coherently across a stretch.
//!
//! Invalid parameters produce an empty result rather than an error.

use std::f64::consts::PI;
use std::sync::Mutex;

use rayon::prelude::*;
use tracing::{debug, warn};

/// Weights below this are treated as silence in windowed reconstruction.
pub const MIN_WINDOW_WEIGHT: f64 = 1e-6;

/// Longest signal a reconstruction may produce (about 25 minutes of mono
/// audio at 44.1 kHz, 1 GiB of accumulation buffers).
pub const MAX_OUTPUT_SAMPLES: usize = 1 << 26;

/// Window geometry derived from a chunk size and an overlap fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    pub chunk_size: usize,
    pub overlap_size: usize,
}

impl ChunkLayout {
    /// `None` unless `chunk_size > 0` and `0 <= overlap < 1`.
    pub fn new(chunk_size: usize, overlap: f32) -> Option<Self> {
        if chunk_size == 0 || !(0.0..1.0).contains(&overlap) {
            return None;
        }
        Self::from_sizes(chunk_size, (chunk_size as f64 * overlap as f64).floor() as usize)
    }

    pub fn from_sizes(chunk_size: usize, overlap_size: usize) -> Option<Self> {
        (chunk_size > 0 && overlap_size < chunk_size).then_some(Self {
            chunk_size,
            overlap_size,
        })
    }

    pub fn hop(&self) -> usize {
        self.chunk_size - self.overlap_size
    }

    /// Number of whole windows that fit into `len` samples.
    pub fn count_for(&self, len: usize) -> usize {
        if len < self.chunk_size {
            0
        } else {
            (len - self.chunk_size) / self.hop() + 1
        }
    }

    /// Length of an overlap-add of `count` windows spaced `hop` apart.
    ///
    /// `None` when the length overflows or exceeds [`MAX_OUTPUT_SAMPLES`].
    pub fn output_len(&self, count: usize, hop: usize) -> Option<usize> {
        match count {
            0 => Some(0),
            n => (n - 1)
                .checked_mul(hop)
                .and_then(|len| len.checked_add(self.chunk_size))
                .filter(|&len| len <= MAX_OUTPUT_SAMPLES),
        }
    }
}

/// Output hop after stretching: `round(hop × stretch)`, saturating.
pub fn stretched_hop(hop: usize, stretch: f64) -> usize {
    (hop as f64 * stretch).round() as usize
}

/// Output length of [`aggregate_windowed`] for `count` chunks, or `None`
/// when the parameters are invalid or the result would be too long.
pub fn windowed_output_len(count: usize, chunk_size: usize, overlap_size: usize, stretch: f64) -> Option<usize> {
    let layout = ChunkLayout::from_sizes(chunk_size, overlap_size)?;
    if !(stretch.is_finite() && stretch > 0.0) {
        return None;
    }
    layout.output_len(count, stretched_hop(layout.hop(), stretch))
}

/// Split `samples` into `chunk_size` windows overlapping by `overlap`.
///
/// A trailing remainder shorter than one window is dropped.
pub fn extract(samples: &[f32], chunk_size: usize, overlap: f32) -> Vec<Vec<f32>> {
    let Some(layout) = ChunkLayout::new(chunk_size, overlap) else {
        warn!("Invalid chunking (size {}, overlap {}), nothing extracted", chunk_size, overlap);
        return Vec::new();
    };
    let hop = layout.hop();
    let count = layout.count_for(samples.len());

    let chunks: Vec<Vec<f32>> = (0..count)
        .into_par_iter()
        .map(|i| samples[i * hop..i * hop + chunk_size].to_vec())
        .collect();

    let covered = if count == 0 { 0 } else { (count - 1) * hop + chunk_size };
    let dropped = samples.len() - covered;
    debug!(
        "Extracted {} chunk(s) of {} samples (hop {}, {} trailing samples dropped)",
        count, chunk_size, hop, dropped
    );
    chunks
}

/// Overlap-add normalized by the number of windows covering each sample.
pub fn aggregate_linear(chunks: &[Vec<f32>], chunk_size: usize, overlap_size: usize) -> Vec<f32> {
    let Some(layout) = ChunkLayout::from_sizes(chunk_size, overlap_size) else {
        warn!("Invalid aggregation (size {}, overlap {})", chunk_size, overlap_size);
        return Vec::new();
    };
    let hop = layout.hop();
    let Some(len) = layout.output_len(chunks.len(), hop) else {
        warn!("Linear overlap-add of {} chunk(s) is too long", chunks.len());
        return Vec::new();
    };

    let (sum, weight) = overlap_add(chunks, len, hop, chunk_size, None);
    sum.iter()
        .zip(&weight)
        .map(|(&s, &w)| if w > 0.0 { (s / w) as f32 } else { 0.0 })
        .collect()
}

/// Hann-weighted overlap-add with the output hop scaled by `stretch`.
pub fn aggregate_windowed(chunks: &[Vec<f32>], chunk_size: usize, overlap_size: usize, stretch: f64) -> Vec<f32> {
    let Some(layout) = ChunkLayout::from_sizes(chunk_size, overlap_size) else {
        warn!("Invalid aggregation (size {}, overlap {})", chunk_size, overlap_size);
        return Vec::new();
    };
    if !(stretch.is_finite() && stretch > 0.0) {
        warn!("Invalid stretch factor {}", stretch);
        return Vec::new();
    }
    let hop = stretched_hop(layout.hop(), stretch);
    let Some(len) = layout.output_len(chunks.len(), hop) else {
        warn!("Stretch {} of {} chunk(s) exceeds {} samples", stretch, chunks.len(), MAX_OUTPUT_SAMPLES);
        return Vec::new();
    };
    let window = hann_window(chunk_size);

    let (sum, weight) = overlap_add(chunks, len, hop, chunk_size, Some(&window));
    debug!("Windowed overlap-add: {} chunk(s), hop {}, {} samples", chunks.len(), hop, len);
    sum.iter()
        .zip(&weight)
        .map(|(&s, &w)| if w >= MIN_WINDOW_WEIGHT { (s / w) as f32 } else { 0.0 })
        .collect()
}

/// `w[i] = 0.5 (1 - cos(2πi / (n - 1)))`
pub fn hann_window(n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![1.0],
        n => (0..n)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1) as f64).cos()))
            .collect(),
    }
}

/// Accumulate chunk `i` at `i × hop`. Each worker sums a contiguous run of
/// chunks into private buffers and merges them once.
fn overlap_add(
    chunks: &[Vec<f32>],
    len: usize,
    hop: usize,
    chunk_size: usize,
    window: Option<&[f64]>,
) -> (Vec<f64>, Vec<f64>) {
    if chunks.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let shared = Mutex::new((vec![0.0f64; len], vec![0.0f64; len]));
    let per_worker = chunks.len().div_ceil(rayon::current_num_threads()).max(1);

    chunks.par_chunks(per_worker).enumerate().for_each(|(group, run)| {
        let first = group * per_worker;
        let start = first * hop;
        let span = (run.len() - 1) * hop + chunk_size;
        let mut sum = vec![0.0f64; span];
        let mut weight = vec![0.0f64; span];

        for (offset, chunk) in run.iter().enumerate() {
            let base = offset * hop;
            for (i, &x) in chunk.iter().take(chunk_size).enumerate() {
                let w = window.map_or(1.0, |w| w[i]);
                sum[base + i] += x as f64 * w;
                weight[base + i] += w;
            }
        }

        let mut guard = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (total, total_weight) = &mut *guard;
        for i in 0..span {
            total[start + i] += sum[i];
            total_weight[start + i] += weight[i];
        }
    });

    shared.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
}
