//! Audio and image media objects
//!
//! A media object holds its data either on the host or on the device, never
//! both: a non-null device handle implies empty host buffers. Disposal is
//! terminal; a disposed object holds neither.
//!
//! Residency only changes through the dispatcher and the owning collection,
//! which is why the mutators here are crate-private.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};

use image::RgbaImage;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::buffer::BufferHandle;
use crate::error::{MediaError, Result};

static NEXT_MEDIA_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique media object id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MediaId(u64);

impl MediaId {
    fn next() -> Self {
        MediaId(NEXT_MEDIA_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MediaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Residency {
    Host,
    Device,
    Disposed,
}

/// Whether audio data is in time domain or spectrum form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Form {
    Real,
    Complex,
}

/// Common surface of audio and image objects
pub trait MediaObject {
    fn id(&self) -> MediaId;

    fn name(&self) -> &str;

    fn residency(&self) -> Residency;

    /// Current device buffer, `NULL` unless device-resident
    fn device_handle(&self) -> BufferHandle;

    /// Dispose the object: clears host data and hands back the device
    /// handle that must now be freed. Later calls return `NULL`.
    fn release(&mut self) -> BufferHandle;

    fn is_disposed(&self) -> bool {
        self.residency() == Residency::Disposed
    }
}

/// Test waveform shapes for [`AudioObject::waveform`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Waveform {
    Sine,
    Square,
    Saw,
}

const WAVEFORM_FREQUENCY: f64 = 440.0;
const WAVEFORM_AMPLITUDE: f32 = 0.8;

/// Audio samples (interleaved) with transform metadata
#[derive(Debug)]
pub struct AudioObject {
    id: MediaId,
    name: String,
    samples: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    handle: BufferHandle,
    disposed: bool,
    pub(crate) samplerate: u32,
    pub(crate) channels: u16,
    pub(crate) bitdepth: u16,
    pub(crate) chunk_size: usize,
    pub(crate) overlap_size: usize,
    pub(crate) form: Form,
    pub(crate) stretch_factor: f64,
    /// Stretch applied on the device and not yet resolved by reconstruction
    pub(crate) pending_stretch: f64,
    pub(crate) tempo: f64,
}

impl AudioObject {
    pub fn new(name: impl Into<String>, samples: Vec<f32>, samplerate: u32, channels: u16, bitdepth: u16) -> Self {
        Self {
            id: MediaId::next(),
            name: name.into(),
            samples,
            spectrum: Vec::new(),
            handle: BufferHandle::NULL,
            disposed: false,
            samplerate,
            channels,
            bitdepth,
            chunk_size: 0,
            overlap_size: 0,
            form: Form::Real,
            stretch_factor: 1.0,
            pending_stretch: 1.0,
            tempo: 0.0,
        }
    }

    /// Zero-filled placeholder of `length` samples
    pub fn silent(name: impl Into<String>, length: usize, samplerate: u32, channels: u16, bitdepth: u16) -> Self {
        Self::new(name, vec![0.0; length], samplerate, channels, bitdepth)
    }

    /// 440 Hz test tone at amplitude 0.8, duplicated across channels.
    pub fn waveform(wave: Waveform, seconds: f64, samplerate: u32, channels: u16, bitdepth: u16) -> Result<Self> {
        if seconds.is_nan() || seconds <= 0.0 || samplerate == 0 || channels == 0 || bitdepth == 0 {
            return Err(MediaError::EmptyData(format!(
                "invalid waveform: {}s at {} Hz, {} channel(s), {} bit",
                seconds, samplerate, channels, bitdepth
            )));
        }

        let frames = (seconds * samplerate as f64).round() as usize;
        let period = samplerate as f64 / WAVEFORM_FREQUENCY;
        let increment = 2.0 * PI * WAVEFORM_FREQUENCY / samplerate as f64;
        let mut samples = Vec::with_capacity(frames * channels as usize);
        for frame in 0..frames {
            let value = match wave {
                Waveform::Sine => (frame as f64 * increment).sin() as f32,
                Waveform::Square => {
                    if frame as f64 % period < period / 2.0 {
                        1.0
                    } else {
                        -1.0
                    }
                }
                Waveform::Saw => ((frame as f64 % period) / period * 2.0 - 1.0) as f32,
            };
            samples.extend(std::iter::repeat(WAVEFORM_AMPLITUDE * value).take(channels as usize));
        }

        let name = format!("{:?} {} Hz", wave, WAVEFORM_FREQUENCY).to_lowercase();
        Ok(Self::new(name, samples, samplerate, channels, bitdepth))
    }

    pub fn with_tempo(mut self, bpm: f64) -> Self {
        self.tempo = bpm;
        self
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Host spectrum, filled when a complex-form object is pulled back
    pub fn spectrum(&self) -> &[Complex<f32>] {
        &self.spectrum
    }

    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bitdepth(&self) -> u16 {
        self.bitdepth
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap_size(&self) -> usize {
        self.overlap_size
    }

    pub fn form(&self) -> Form {
        self.form
    }

    /// Total stretch applied to this object: the product of every confirmed
    /// launch factor, not only the latest one. Two 0.5 stretches report 0.25.
    pub fn stretch_factor(&self) -> f64 {
        self.stretch_factor
    }

    /// Derived tempo in BPM, 0 when unknown
    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Host duration in seconds
    pub fn duration_secs(&self) -> f64 {
        let frames_per_second = self.samplerate as f64 * self.channels.max(1) as f64;
        if frames_per_second == 0.0 {
            0.0
        } else {
            self.samples.len() as f64 / frames_per_second
        }
    }

    pub fn host_size_bytes(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>() + self.spectrum.len() * std::mem::size_of::<Complex<f32>>()
    }

    pub fn has_host_data(&self) -> bool {
        !self.samples.is_empty() || !self.spectrum.is_empty()
    }

    /// Scale host samples so the peak equals `max_amplitude`.
    pub fn normalize(&mut self, max_amplitude: f32) -> Result<()> {
        self.ensure_live()?;
        if self.residency() != Residency::Host || self.form != Form::Real {
            return Err(MediaError::EmptyData(format!("audio {} has no host samples to normalize", self.id)));
        }
        let peak = self.samples.iter().fold(0.0f32, |m, x| m.max(x.abs()));
        if peak > 0.0 {
            let gain = max_amplitude / peak;
            self.samples.iter_mut().for_each(|x| *x *= gain);
        }
        Ok(())
    }

    pub fn info(&self) -> AudioInfo {
        AudioInfo {
            id: self.id,
            name: self.name.clone(),
            samplerate: self.samplerate,
            channels: self.channels,
            bitdepth: self.bitdepth,
            length: self.samples.len(),
            duration_secs: self.duration_secs(),
            residency: self.residency(),
            form: self.form,
            device_handle: self.handle,
            chunk_size: self.chunk_size,
            overlap_size: self.overlap_size,
            stretch_factor: self.stretch_factor,
            tempo: self.tempo,
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            Err(MediaError::Disposed(self.id.0))
        } else {
            Ok(())
        }
    }

    /// Device handle takes over; host buffers are dropped.
    pub(crate) fn attach_device(&mut self, handle: BufferHandle) {
        self.handle = handle;
        self.samples = Vec::new();
        self.spectrum = Vec::new();
    }

    pub(crate) fn detach_device(&mut self) -> BufferHandle {
        std::mem::replace(&mut self.handle, BufferHandle::NULL)
    }

    pub(crate) fn set_host_samples(&mut self, samples: Vec<f32>) {
        self.samples = samples;
        self.spectrum = Vec::new();
    }

    pub(crate) fn set_host_spectrum(&mut self, spectrum: Vec<Complex<f32>>) {
        self.spectrum = spectrum;
        self.samples = Vec::new();
    }

    /// Apply a confirmed device stretch: cumulative factor and tempo.
    pub(crate) fn apply_stretch(&mut self, factor: f64) {
        if factor == 1.0 {
            return;
        }
        self.stretch_factor *= factor;
        self.pending_stretch *= factor;
        self.tempo /= factor;
    }
}

impl MediaObject for AudioObject {
    fn id(&self) -> MediaId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn residency(&self) -> Residency {
        if self.disposed {
            Residency::Disposed
        } else if !self.handle.is_null() {
            Residency::Device
        } else {
            Residency::Host
        }
    }

    fn device_handle(&self) -> BufferHandle {
        self.handle
    }

    fn release(&mut self) -> BufferHandle {
        self.disposed = true;
        self.samples = Vec::new();
        self.spectrum = Vec::new();
        self.detach_device()
    }
}

/// Serializable audio summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioInfo {
    pub id: MediaId,
    pub name: String,
    pub samplerate: u32,
    pub channels: u16,
    pub bitdepth: u16,
    pub length: usize,
    pub duration_secs: f64,
    pub residency: Residency,
    pub form: Form,
    pub device_handle: BufferHandle,
    pub chunk_size: usize,
    pub overlap_size: usize,
    pub stretch_factor: f64,
    pub tempo: f64,
}

/// RGBA image with fixed dimensions
#[derive(Debug)]
pub struct ImageObject {
    id: MediaId,
    name: String,
    pixels: Option<RgbaImage>,
    handle: BufferHandle,
    disposed: bool,
    width: u32,
    height: u32,
}

impl ImageObject {
    pub fn new(name: impl Into<String>, pixels: RgbaImage) -> Self {
        let (width, height) = pixels.dimensions();
        Self {
            id: MediaId::next(),
            name: name.into(),
            pixels: Some(pixels),
            handle: BufferHandle::NULL,
            disposed: false,
            width,
            height,
        }
    }

    /// Transparent black canvas, e.g. as a fractal render target
    pub fn blank(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self::new(name, RgbaImage::new(width, height))
    }

    pub fn from_raw(name: impl Into<String>, width: u32, height: u32, rgba: Vec<u8>) -> Result<Self> {
        let len = rgba.len();
        let pixels = RgbaImage::from_raw(width, height, rgba).ok_or_else(|| {
            MediaError::InvalidPixels(format!("{} bytes do not form a {}x{} RGBA image", len, width, height))
        })?;
        Ok(Self::new(name, pixels))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> Option<&RgbaImage> {
        self.pixels.as_ref()
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }

    pub fn info(&self) -> ImageInfo {
        ImageInfo {
            id: self.id,
            name: self.name.clone(),
            width: self.width,
            height: self.height,
            channels: 4,
            size_bytes: self.byte_len(),
            residency: self.residency(),
            device_handle: self.handle,
        }
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            Err(MediaError::Disposed(self.id.0))
        } else {
            Ok(())
        }
    }

    /// Raw RGBA bytes of the host image, empty if not host-resident
    pub(crate) fn host_bytes(&self) -> &[u8] {
        self.pixels.as_ref().map(|p| p.as_raw().as_slice()).unwrap_or(&[])
    }

    pub(crate) fn attach_device(&mut self, handle: BufferHandle) {
        self.handle = handle;
        self.pixels = None;
    }

    pub(crate) fn detach_device(&mut self) -> BufferHandle {
        std::mem::replace(&mut self.handle, BufferHandle::NULL)
    }

    pub(crate) fn set_pixels(&mut self, pixels: RgbaImage) {
        let (width, height) = pixels.dimensions();
        self.width = width;
        self.height = height;
        self.pixels = Some(pixels);
    }
}

impl MediaObject for ImageObject {
    fn id(&self) -> MediaId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn residency(&self) -> Residency {
        if self.disposed {
            Residency::Disposed
        } else if !self.handle.is_null() {
            Residency::Device
        } else {
            Residency::Host
        }
    }

    fn device_handle(&self) -> BufferHandle {
        self.handle
    }

    fn release(&mut self) -> BufferHandle {
        self.disposed = true;
        self.pixels = None;
        self.detach_device()
    }
}

/// Serializable image summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: MediaId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub size_bytes: usize,
    pub residency: Residency,
    pub device_handle: BufferHandle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = AudioObject::silent("a", 4, 44100, 1, 16);
        let b = AudioObject::silent("b", 4, 44100, 1, 16);
        let c = ImageObject::blank("c", 2, 2);
        assert_ne!(a.id(), b.id());
        assert_ne!(b.id(), c.id());
    }

    #[test]
    fn test_waveform_shape() {
        let audio = AudioObject::waveform(Waveform::Sine, 1.0, 44100, 2, 16).unwrap();

        assert_eq!(audio.samples().len(), 88200);
        assert_eq!(audio.samples()[2], audio.samples()[3]);
        let peak = audio.samples().iter().fold(0.0f32, |m, x| m.max(x.abs()));
        assert!((peak - 0.8).abs() < 1e-3);
        assert!((audio.duration_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_square_and_saw_ranges() {
        let square = AudioObject::waveform(Waveform::Square, 0.1, 8000, 1, 16).unwrap();
        assert!(square.samples().iter().all(|&x| x == 0.8 || x == -0.8));

        let saw = AudioObject::waveform(Waveform::Saw, 0.1, 8000, 1, 16).unwrap();
        assert!(saw.samples().iter().all(|&x| (-0.8..0.8).contains(&x)));
    }

    #[test]
    fn test_waveform_rejects_bad_parameters() {
        assert!(AudioObject::waveform(Waveform::Sine, 0.0, 44100, 1, 16).is_err());
        assert!(AudioObject::waveform(Waveform::Sine, 1.0, 0, 1, 16).is_err());
    }

    #[test]
    fn test_normalize_peak() {
        let mut audio = AudioObject::new("n", vec![0.1, -0.4, 0.2], 8000, 1, 16);
        audio.normalize(1.0).unwrap();
        for (x, expected) in audio.samples().iter().zip([0.25, -1.0, 0.5]) {
            assert!((x - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_residency_is_exclusive() {
        let mut audio = AudioObject::silent("r", 16, 8000, 1, 16);
        assert_eq!(audio.residency(), Residency::Host);

        audio.attach_device(BufferHandle::NULL);
        assert!(audio.samples().is_empty());

        let mut image = ImageObject::blank("i", 4, 4);
        assert_eq!(image.host_bytes().len(), 64);
        image.attach_device(BufferHandle::NULL);
        assert!(image.pixels().is_none());
        assert_eq!(image.width(), 4);
    }

    #[test]
    fn test_release_is_terminal() {
        let mut audio = AudioObject::silent("d", 16, 8000, 1, 16);
        assert!(audio.release().is_null());
        assert_eq!(audio.residency(), Residency::Disposed);
        assert!(!audio.has_host_data());
        assert!(matches!(audio.normalize(1.0), Err(MediaError::Disposed(_))));
        assert!(audio.release().is_null());
    }

    #[test]
    fn test_stretch_updates_tempo() {
        let mut audio = AudioObject::silent("t", 16, 44100, 1, 16).with_tempo(120.0);
        audio.apply_stretch(0.75);
        assert_eq!(audio.stretch_factor(), 0.75);
        assert!((audio.tempo() - 160.0).abs() < 1e-9);

        audio.apply_stretch(1.0);
        assert_eq!(audio.stretch_factor(), 0.75);
    }

    #[test]
    fn test_stretch_factor_accumulates() {
        let mut audio = AudioObject::silent("t", 16, 44100, 1, 16).with_tempo(100.0);
        audio.apply_stretch(0.5);
        audio.apply_stretch(0.5);

        assert_eq!(audio.stretch_factor(), 0.25);
        assert!((audio.tempo() - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_image_from_raw_validates_length() {
        assert!(ImageObject::from_raw("ok", 2, 2, vec![0; 16]).is_ok());
        assert!(matches!(ImageObject::from_raw("bad", 2, 2, vec![0; 15]), Err(MediaError::InvalidPixels(_))));
    }
}
