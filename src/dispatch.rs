//! Kernel dispatch
//!
//! Brackets a kernel launch with the host/device moves it needs:
//!
//! 1. resolve the kernel and bind its arguments (fails before any device work)
//! 2. push the object if it is host-resident (audio is chunked first)
//! 3. launch, then swap the object's device handle for the output handle
//! 4. update derived metadata (stretch factor, tempo)
//! 5. pull back if this call did the push
//!
//! A failing stage returns an error and leaves the object as it was after
//! the last successful stage. Metadata only changes after a confirmed launch.

use image::RgbaImage;
use rustfft::num_complex::Complex;
use tracing::{debug, info, warn};

use crate::backend::{ComputeBackend, WorkDims};
use crate::buffer::{BufferHandle, ElementKind, HostData};
use crate::chunker::{self, ChunkLayout};
use crate::config::DispatchConfig;
use crate::error::{MediaError, Result};
use crate::kernel::{ArgValue, AudioLaunchParams, OptionalArgs};
use crate::media::{AudioObject, Form, ImageObject, MediaObject, Residency};
use crate::metrics::Timer;
use crate::session::AcceleratorSession;

#[derive(Debug, Clone, Default)]
pub struct KernelDispatcher {
    config: DispatchConfig,
}

impl KernelDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Run an image kernel with positional `variable_args`.
    ///
    /// Returns the kernel's output handle. When the image was host-resident
    /// on entry the result is pulled back and that handle is already freed.
    pub fn execute_image_kernel<B: ComputeBackend>(
        &self,
        session: &mut AcceleratorSession<B>,
        image: &mut ImageObject,
        base_name: &str,
        version: &str,
        variable_args: &[ArgValue],
    ) -> Result<BufferHandle> {
        let timer = Timer::new();
        let result = self.run_image_kernel(session, image, base_name, version, variable_args);
        session
            .metrics()
            .record_dispatch("image.kernel", result.is_ok(), timer.elapsed_ms());
        if let Err(e) = &result {
            warn!("Image kernel {}{} failed for image {}: {}", base_name, version, image.id(), e);
        }
        result
    }

    fn run_image_kernel<B: ComputeBackend>(
        &self,
        session: &mut AcceleratorSession<B>,
        image: &mut ImageObject,
        base_name: &str,
        version: &str,
        variable_args: &[ArgValue],
    ) -> Result<BufferHandle> {
        image.ensure_live()?;
        let kernel = session.resolve_kernel(base_name, version)?;
        let (width, height) = (image.width(), image.height());
        let scalars = kernel.bind_image_scalars(width, height, variable_args)?;

        let owns_transition = image.residency() == Residency::Host;
        if owns_transition {
            self.push_image(session, image)?;
        }

        let input = image.device_handle();
        let output = session.launch(&kernel, input, scalars, WorkDims::Image { width, height })?;
        image.detach_device();
        session.free(input);
        image.attach_device(output.handle);
        debug!("Image {} now on {}", image.id(), output.handle);

        if owns_transition {
            self.pull_image(session, image)?;
        }
        Ok(output.handle)
    }

    /// Run an audio kernel, chunking and pushing first if needed.
    ///
    /// `chunk_size` and `overlap` only apply when the object is host-resident;
    /// device-resident audio keeps the layout it was pushed with.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_audio_kernel<B: ComputeBackend>(
        &self,
        session: &mut AcceleratorSession<B>,
        audio: &mut AudioObject,
        base_name: &str,
        version: &str,
        chunk_size: usize,
        overlap: f32,
        optional_args: &OptionalArgs,
        move_back: bool,
    ) -> Result<BufferHandle> {
        let timer = Timer::new();
        let result = self.run_audio_kernel(
            session,
            audio,
            base_name,
            version,
            chunk_size,
            overlap,
            optional_args,
            move_back,
        );
        session
            .metrics()
            .record_dispatch("audio.kernel", result.is_ok(), timer.elapsed_ms());
        if let Err(e) = &result {
            warn!("Audio kernel {}{} failed for audio {}: {}", base_name, version, audio.id(), e);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn run_audio_kernel<B: ComputeBackend>(
        &self,
        session: &mut AcceleratorSession<B>,
        audio: &mut AudioObject,
        base_name: &str,
        version: &str,
        chunk_size: usize,
        overlap: f32,
        optional_args: &OptionalArgs,
        move_back: bool,
    ) -> Result<BufferHandle> {
        audio.ensure_live()?;
        let kernel = session.resolve_kernel(base_name, version)?;

        let owns_transition = audio.residency() == Residency::Host;
        let (layout, input_length) = launch_layout(session, audio, chunk_size, overlap)?;

        let launch = AudioLaunchParams {
            input_length,
            chunk_size: layout.chunk_size,
            overlap_size: layout.overlap_size,
            samplerate: audio.samplerate,
            bitdepth: audio.bitdepth,
            channels: audio.channels,
        };
        let scalars = kernel.bind_audio_scalars(launch, optional_args)?;

        if owns_transition {
            self.push_audio(session, audio, chunk_size, overlap)?;
        }

        let input = audio.device_handle();
        let count = session.registry().get(input).map(|b| b.segment_count()).unwrap_or(0);
        let output = session.launch(
            &kernel,
            input,
            scalars,
            WorkDims::Chunks {
                chunk_size: layout.chunk_size,
                count,
            },
        )?;

        audio.detach_device();
        session.free(input);
        audio.attach_device(output.handle);
        if let Some(kind) = session.registry().kind_of(output.handle) {
            audio.form = if kind.is_complex() { Form::Complex } else { Form::Real };
        }
        audio.apply_stretch(output.stretch_factor);
        if output.stretch_factor != 1.0 {
            info!(
                "Audio {} stretched by {} (tempo now {:.2} BPM)",
                audio.id(),
                output.stretch_factor,
                audio.tempo
            );
        }

        if owns_transition && move_back && audio.form == Form::Real {
            self.pull_audio(session, audio)?;
        }
        Ok(output.handle)
    }

    /// Stretch audio duration by `factor` via a `timestretch` style kernel.
    ///
    /// `factor` binds as `f64` when the kernel name contains `double`,
    /// otherwise as `f32`.
    pub fn time_stretch<B: ComputeBackend>(
        &self,
        session: &mut AcceleratorSession<B>,
        audio: &mut AudioObject,
        base_name: &str,
        version: &str,
        factor: f64,
    ) -> Result<BufferHandle> {
        let args = OptionalArgs::from([("factor".to_string(), factor)]);
        self.execute_audio_kernel(
            session,
            audio,
            base_name,
            version,
            self.config.chunk_size,
            self.config.overlap,
            &args,
            self.config.move_back,
        )
    }

    /// Chunk host samples and move them to the device.
    ///
    /// Already device-resident audio returns its current handle.
    pub fn push_audio<B: ComputeBackend>(
        &self,
        session: &mut AcceleratorSession<B>,
        audio: &mut AudioObject,
        chunk_size: usize,
        overlap: f32,
    ) -> Result<BufferHandle> {
        audio.ensure_live()?;
        if audio.residency() == Residency::Device {
            return Ok(audio.device_handle());
        }

        let handle = match audio.form {
            Form::Real => {
                let layout = ChunkLayout::new(chunk_size, overlap)
                    .ok_or(MediaError::InvalidChunking { chunk_size, overlap })?;
                let chunks = chunker::extract(audio.samples(), chunk_size, overlap);
                if chunks.is_empty() {
                    return Err(MediaError::EmptyData(format!(
                        "audio {} has {} samples, less than one chunk of {}",
                        audio.id(),
                        audio.samples().len(),
                        chunk_size
                    )));
                }
                let handle = session.push_chunks(chunks)?;
                audio.chunk_size = layout.chunk_size;
                audio.overlap_size = layout.overlap_size;
                handle
            }
            Form::Complex => {
                // Spectra were pulled as concatenated per-chunk segments.
                let segment = audio.chunk_size.max(1);
                let segments: Vec<HostData> = audio
                    .spectrum()
                    .chunks(segment)
                    .map(|c| HostData::Complex32(c.to_vec()))
                    .collect();
                session.push_segments(&segments)?
            }
        };

        if handle.is_null() {
            return Err(MediaError::EmptyData(format!("audio {} has no host data", audio.id())));
        }
        audio.attach_device(handle);
        debug!("Audio {} pushed as {}", audio.id(), handle);
        Ok(handle)
    }

    /// Move device audio back to the host.
    ///
    /// Real form is reconstructed by windowed overlap-add when a stretch is
    /// pending, else by linear overlap-add. Complex form is concatenated into
    /// the host spectrum.
    pub fn pull_audio<B: ComputeBackend>(&self, session: &mut AcceleratorSession<B>, audio: &mut AudioObject) -> Result<()> {
        audio.ensure_live()?;
        if audio.residency() == Residency::Host {
            return Ok(());
        }
        let handle = audio.device_handle();
        let segments = session.pull_segments(handle, false);
        if segments.is_empty() {
            return Err(MediaError::CopyFailed(format!("couldn't pull {} for audio {}", handle, audio.id())));
        }

        match audio.form {
            Form::Real => {
                let chunks = segments
                    .into_iter()
                    .map(|s| match s {
                        HostData::Real32(v) => Ok(v),
                        other => Err(MediaError::UnsupportedElementKind(other.kind())),
                    })
                    .collect::<Result<Vec<Vec<f32>>>>()?;
                let samples = if audio.pending_stretch != 1.0 {
                    let stretch = audio.pending_stretch;
                    if chunker::windowed_output_len(chunks.len(), audio.chunk_size, audio.overlap_size, stretch)
                        .is_none()
                    {
                        return Err(MediaError::InvalidStretch(stretch));
                    }
                    chunker::aggregate_windowed(&chunks, audio.chunk_size, audio.overlap_size, stretch)
                } else {
                    chunker::aggregate_linear(&chunks, audio.chunk_size, audio.overlap_size)
                };
                audio.detach_device();
                session.free(handle);
                audio.set_host_samples(samples);
                audio.pending_stretch = 1.0;
            }
            Form::Complex => {
                let mut spectrum: Vec<Complex<f32>> = Vec::new();
                for segment in segments {
                    match segment {
                        HostData::Complex32(v) => spectrum.extend(v),
                        HostData::Complex64(v) => spectrum.extend(v.iter().map(|c| Complex::new(c.re as f32, c.im as f32))),
                        other => return Err(MediaError::UnsupportedElementKind(other.kind())),
                    }
                }
                audio.detach_device();
                session.free(handle);
                audio.set_host_spectrum(spectrum);
            }
        }
        debug!("Audio {} pulled to host", audio.id());
        Ok(())
    }

    /// Move host pixels to the device as one `Byte` segment.
    pub fn push_image<B: ComputeBackend>(
        &self,
        session: &mut AcceleratorSession<B>,
        image: &mut ImageObject,
    ) -> Result<BufferHandle> {
        image.ensure_live()?;
        if image.residency() == Residency::Device {
            return Ok(image.device_handle());
        }
        let handle = session.push(&HostData::Byte(image.host_bytes().to_vec()))?;
        if handle.is_null() {
            return Err(MediaError::EmptyData(format!("image {} has no pixels", image.id())));
        }
        image.attach_device(handle);
        Ok(handle)
    }

    /// Move device pixels back into a host RGBA image.
    pub fn pull_image<B: ComputeBackend>(&self, session: &mut AcceleratorSession<B>, image: &mut ImageObject) -> Result<()> {
        image.ensure_live()?;
        if image.residency() == Residency::Host {
            return Ok(());
        }
        let handle = image.device_handle();
        let bytes = match session.pull(handle, false) {
            HostData::Byte(bytes) if !bytes.is_empty() => bytes,
            HostData::Byte(_) => {
                return Err(MediaError::CopyFailed(format!("couldn't pull {} for image {}", handle, image.id())));
            }
            other => return Err(MediaError::UnsupportedElementKind(other.kind())),
        };
        let len = bytes.len();
        let pixels = RgbaImage::from_raw(image.width(), image.height(), bytes).ok_or_else(|| {
            MediaError::InvalidPixels(format!(
                "{} bytes for a {}x{} image",
                len,
                image.width(),
                image.height()
            ))
        })?;

        image.detach_device();
        session.free(handle);
        image.set_pixels(pixels);
        Ok(())
    }
}

/// Chunk layout and total input length an audio launch binds.
///
/// Only host samples in real form are chunked with the caller's layout. A
/// host spectrum or device data keeps the layout it was first pushed with.
fn launch_layout<B: ComputeBackend>(
    session: &AcceleratorSession<B>,
    audio: &AudioObject,
    chunk_size: usize,
    overlap: f32,
) -> Result<(ChunkLayout, usize)> {
    match (audio.residency(), audio.form) {
        (Residency::Host, Form::Real) => {
            let layout = ChunkLayout::new(chunk_size, overlap)
                .ok_or(MediaError::InvalidChunking { chunk_size, overlap })?;
            Ok((layout, audio.samples().len()))
        }
        (residency, _) => {
            let layout = ChunkLayout::from_sizes(audio.chunk_size, audio.overlap_size).ok_or(
                MediaError::InvalidChunking {
                    chunk_size: audio.chunk_size,
                    overlap: 0.0,
                },
            )?;
            let length = if residency == Residency::Host {
                audio.spectrum().len()
            } else {
                session
                    .registry()
                    .get(audio.device_handle())
                    .map(|b| b.total_length())
                    .unwrap_or(0)
            };
            Ok((layout, length))
        }
    }
}

/// Element kind of the buffer currently bound to `audio`, if any
pub fn device_kind<B: ComputeBackend>(session: &AcceleratorSession<B>, audio: &AudioObject) -> Option<ElementKind> {
    session.registry().kind_of(audio.device_handle())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostBackendConfig, SessionConfig};
    use crate::host_backend::HostBackend;
    use std::fs;

    const INVERT: &str =
        "__kernel void invert00(__global uchar* in, __global uchar* out, int ox, int oy, int w, int h) {}";
    const STRETCH: &str = "__kernel void timestretch_double03(__global float* in, __global float* out, \
         long n, int chunk, int overlap, int sr, int bd, int ch, double factor) {}";

    fn session(dir: &tempfile::TempDir) -> AcceleratorSession<HostBackend> {
        session_with(dir, HostBackend::new())
    }

    fn session_with(dir: &tempfile::TempDir, backend: HostBackend) -> AcceleratorSession<HostBackend> {
        fs::write(dir.path().join("invert00.cl"), INVERT).unwrap();
        fs::write(dir.path().join("timestretch_double03.cl"), STRETCH).unwrap();
        let mut session = AcceleratorSession::new(backend);
        session
            .initialize(&SessionConfig {
                device_index: 0,
                kernel_dir: Some(dir.path().to_path_buf()),
            })
            .unwrap();
        session
    }

    #[test]
    fn test_image_kernel_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let mut image = ImageObject::from_raw("px", 1, 1, vec![10, 20, 30, 40]).unwrap();

        KernelDispatcher::default()
            .execute_image_kernel(&mut session, &mut image, "invert", "00", &[])
            .unwrap();

        assert_eq!(image.residency(), Residency::Host);
        assert_eq!(image.pixels().unwrap().as_raw(), &vec![245, 235, 225, 40]);
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_unknown_kernel_leaves_object_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let mut image = ImageObject::blank("b", 2, 2);

        let result = KernelDispatcher::default().execute_image_kernel(&mut session, &mut image, "blur", "00", &[]);

        assert!(matches!(result, Err(MediaError::KernelNotFound(_))));
        assert_eq!(image.residency(), Residency::Host);
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_device_resident_image_stays_on_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let dispatcher = KernelDispatcher::default();
        let mut image = ImageObject::from_raw("px", 1, 1, vec![0, 0, 0, 255]).unwrap();
        let pushed = dispatcher.push_image(&mut session, &mut image).unwrap();

        let output = dispatcher
            .execute_image_kernel(&mut session, &mut image, "invert", "00", &[])
            .unwrap();

        assert_ne!(pushed, output);
        assert_eq!(image.device_handle(), output);
        assert!(!session.registry().contains(pushed));
        dispatcher.pull_image(&mut session, &mut image).unwrap();
        assert_eq!(image.pixels().unwrap().as_raw(), &vec![255, 255, 255, 255]);
    }

    #[test]
    fn test_time_stretch_updates_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let samples: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.05).sin()).collect();
        let mut audio = AudioObject::new("tone", samples, 8000, 1, 16).with_tempo(100.0);
        let dispatcher = KernelDispatcher::new(DispatchConfig {
            chunk_size: 512,
            overlap: 0.5,
            move_back: true,
        });

        dispatcher
            .time_stretch(&mut session, &mut audio, "timestretch_double", "03", 0.5)
            .unwrap();

        let count = (4096 - 512) / 256 + 1;
        assert_eq!(audio.residency(), Residency::Host);
        assert_eq!(audio.samples().len(), (count - 1) * 128 + 512);
        assert_eq!(audio.stretch_factor(), 0.5);
        assert!((audio.tempo() - 200.0).abs() < 1e-9);
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_invalid_chunking_rejected_before_push() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let mut audio = AudioObject::silent("s", 1024, 8000, 1, 16);
        let args = OptionalArgs::from([("factor".to_string(), 2.0)]);

        let result = KernelDispatcher::default().execute_audio_kernel(
            &mut session,
            &mut audio,
            "timestretch_double",
            "03",
            0,
            0.5,
            &args,
            true,
        );

        assert!(matches!(result, Err(MediaError::InvalidChunking { .. })));
        assert_eq!(audio.samples().len(), 1024);
        assert_eq!(session.metrics().snapshot().transfers.pushes, 0);
    }

    #[test]
    fn test_binding_failure_keeps_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let mut audio = AudioObject::silent("s", 1024, 8000, 1, 16).with_tempo(90.0);

        let result = KernelDispatcher::default().execute_audio_kernel(
            &mut session,
            &mut audio,
            "timestretch_double",
            "03",
            256,
            0.5,
            &OptionalArgs::new(),
            true,
        );

        assert!(matches!(result, Err(MediaError::Binding(_))));
        assert_eq!(audio.residency(), Residency::Host);
        assert_eq!(audio.stretch_factor(), 1.0);
        assert_eq!(audio.tempo(), 90.0);
    }

    #[test]
    fn test_without_move_back_audio_stays_on_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let mut audio = AudioObject::silent("s", 2048, 8000, 1, 16).with_tempo(120.0);
        let args = OptionalArgs::from([("factor".to_string(), 2.0)]);
        let dispatcher = KernelDispatcher::default();

        let handle = dispatcher
            .execute_audio_kernel(&mut session, &mut audio, "timestretch_double", "03", 512, 0.0, &args, false)
            .unwrap();

        assert_eq!(audio.residency(), Residency::Device);
        assert_eq!(audio.device_handle(), handle);
        assert_eq!(device_kind(&session, &audio), Some(ElementKind::Real32));
        assert_eq!(audio.tempo(), 60.0);

        dispatcher.pull_audio(&mut session, &mut audio).unwrap();
        assert_eq!(audio.samples().len(), 3 * 1024 + 512);
    }

    #[test]
    fn test_disposed_objects_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let mut audio = AudioObject::silent("s", 2048, 8000, 1, 16);
        audio.release();

        let result = KernelDispatcher::default().push_audio(&mut session, &mut audio, 512, 0.5);

        assert!(matches!(result, Err(MediaError::Disposed(_))));
        assert!(session.registry().is_empty());
    }

    #[test]
    fn test_rejected_audio_launch_keeps_pushed_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let mut audio = AudioObject::silent("s", 2048, 8000, 1, 16).with_tempo(120.0);
        let args = OptionalArgs::from([("factor".to_string(), -1.0)]);
        let dispatcher = KernelDispatcher::default();

        let result = dispatcher.execute_audio_kernel(
            &mut session,
            &mut audio,
            "timestretch_double",
            "03",
            512,
            0.5,
            &args,
            true,
        );

        assert!(matches!(result, Err(MediaError::Launch(_))));
        assert_eq!(audio.residency(), Residency::Device);
        assert_eq!(session.registry().len(), 1);
        assert!(session.registry().contains(audio.device_handle()));
        assert_eq!(audio.tempo(), 120.0);
        assert_eq!(audio.stretch_factor(), 1.0);
        assert_eq!(session.metrics().snapshot().failed_dispatches, 1);
    }

    #[test]
    fn test_rejected_audio_launch_keeps_device_handle() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let mut audio = AudioObject::silent("s", 2048, 8000, 1, 16).with_tempo(120.0);
        let dispatcher = KernelDispatcher::default();
        let pushed = dispatcher.push_audio(&mut session, &mut audio, 512, 0.5).unwrap();

        for factor in [-1.0, 1e300] {
            let result = dispatcher.time_stretch(&mut session, &mut audio, "timestretch_double", "03", factor);

            assert!(matches!(result, Err(MediaError::Launch(_))), "factor {}", factor);
            assert_eq!(audio.device_handle(), pushed);
            assert_eq!(session.registry().len(), 1);
            assert_eq!(audio.tempo(), 120.0);
            assert_eq!(audio.stretch_factor(), 1.0);
        }
    }

    #[test]
    fn test_rejected_image_launch_keeps_pushed_state() {
        let dir = tempfile::tempdir().unwrap();
        // Room for the 16x16 input but not for the kernel output.
        let backend = HostBackend::with_config(HostBackendConfig {
            memory_capacity: 1536,
            ..Default::default()
        });
        let mut session = session_with(&dir, backend);
        let mut image = ImageObject::blank("b", 16, 16);
        let dispatcher = KernelDispatcher::default();

        let result = dispatcher.execute_image_kernel(&mut session, &mut image, "invert", "00", &[]);

        assert!(matches!(result, Err(MediaError::OutOfMemory { .. })));
        assert_eq!(image.residency(), Residency::Device);
        assert_eq!(session.registry().len(), 1);
        let pushed = image.device_handle();
        assert_eq!(session.registry().size_of(pushed), 1024);

        let again = dispatcher.execute_image_kernel(&mut session, &mut image, "invert", "00", &[]);

        assert!(matches!(again, Err(MediaError::OutOfMemory { .. })));
        assert_eq!(image.device_handle(), pushed);
        assert_eq!(session.registry().len(), 1);
        assert_eq!((image.width(), image.height()), (16, 16));
    }

    #[test]
    fn test_pull_rejects_unreconstructable_stretch() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let mut audio = AudioObject::silent("s", 8192, 8000, 1, 16);
        let dispatcher = KernelDispatcher::default();
        let pushed = dispatcher.push_audio(&mut session, &mut audio, 1024, 0.5).unwrap();
        audio.pending_stretch = 1e300;

        let result = dispatcher.pull_audio(&mut session, &mut audio);

        assert!(matches!(result, Err(MediaError::InvalidStretch(_))));
        assert_eq!(audio.device_handle(), pushed);
        assert_eq!(session.registry().len(), 1);
    }

    #[test]
    fn test_host_spectrum_keeps_pushed_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let mut audio = AudioObject::silent("s", 0, 8000, 1, 16);
        audio.set_host_spectrum(vec![Complex::new(0.5, -0.5); 2048]);
        audio.form = Form::Complex;
        audio.chunk_size = 512;
        audio.overlap_size = 0;

        let (layout, length) = launch_layout(&session, &audio, 4096, 0.5).unwrap();
        assert_eq!((layout.chunk_size, layout.overlap_size), (512, 0));
        assert_eq!(length, 2048);

        let args = OptionalArgs::from([("factor".to_string(), 1.0)]);
        let handle = KernelDispatcher::default()
            .execute_audio_kernel(&mut session, &mut audio, "timestretch_double", "03", 4096, 0.5, &args, true)
            .unwrap();

        assert_eq!(audio.residency(), Residency::Device);
        assert_eq!(audio.form(), Form::Complex);
        assert_eq!(session.registry().get(handle).unwrap().lengths(), &[512; 4]);
    }

    #[test]
    fn test_host_samples_use_call_layout() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(&dir);
        let audio = AudioObject::silent("s", 10000, 8000, 1, 16);

        let (layout, length) = launch_layout(&session, &audio, 4096, 0.5).unwrap();

        assert_eq!((layout.chunk_size, layout.overlap_size), (4096, 2048));
        assert_eq!(length, 10000);
    }
}
