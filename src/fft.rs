//! FFT orchestration for audio objects
//!
//! The transform direction follows the element kind of the object's device
//! buffer: real data goes forward to a spectrum, complex data comes back to
//! real samples (or stays complex when [`FftMode::ComplexToComplex`] is
//! requested). Every chunk segment is transformed independently into a
//! freshly allocated output buffer of the same segment lengths.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{ComputeBackend, FftDirection};
use crate::buffer::{BufferHandle, ElementKind};
use crate::config::DispatchConfig;
use crate::dispatch::KernelDispatcher;
use crate::error::{MediaError, Result};
use crate::media::{AudioObject, Form, MediaObject, Residency};
use crate::metrics::Timer;
use crate::session::AcceleratorSession;

/// How complex input is transformed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FftMode {
    /// Complex input returns to real samples
    #[default]
    Auto,
    /// Complex input stays complex (normalized inverse)
    ComplexToComplex,
}

/// Pick the transform direction for a buffer of `kind`.
pub fn select_direction(kind: ElementKind, mode: FftMode) -> Result<FftDirection> {
    match (kind, mode) {
        (ElementKind::Real32, _) => Ok(FftDirection::RealToComplex),
        (ElementKind::Complex32 | ElementKind::Complex64, FftMode::Auto) => Ok(FftDirection::ComplexToReal),
        (ElementKind::Complex32 | ElementKind::Complex64, FftMode::ComplexToComplex) => {
            Ok(FftDirection::ComplexToComplex)
        }
        (ElementKind::Byte, _) => Err(MediaError::UnsupportedElementKind(kind)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct FftOrchestrator {
    config: DispatchConfig,
    mode: FftMode,
}

impl FftOrchestrator {
    /// `config` supplies the chunk layout used when host audio must be pushed first.
    pub fn new(config: DispatchConfig, mode: FftMode) -> Self {
        Self { config, mode }
    }

    pub fn mode(&self) -> FftMode {
        self.mode
    }

    /// Transform `audio` in place on the device and return the new handle.
    ///
    /// On failure the original handle and form are kept.
    pub fn perform_fft<B: ComputeBackend>(
        &self,
        session: &mut AcceleratorSession<B>,
        audio: &mut AudioObject,
    ) -> Result<BufferHandle> {
        let timer = Timer::new();
        let result = self.run(session, audio);
        session
            .metrics()
            .record_dispatch("audio.fft", result.is_ok(), timer.elapsed_ms());
        if let Err(e) = &result {
            warn!("FFT failed for audio {}: {}", audio.id(), e);
        }
        result
    }

    fn run<B: ComputeBackend>(&self, session: &mut AcceleratorSession<B>, audio: &mut AudioObject) -> Result<BufferHandle> {
        audio.ensure_live()?;
        if audio.residency() == Residency::Host {
            KernelDispatcher::new(self.config).push_audio(session, audio, self.config.chunk_size, self.config.overlap)?;
        }

        let input = audio.device_handle();
        let (kind, lengths, input_segments) = {
            let buffer = session.registry().get(input).ok_or(MediaError::UnknownHandle(input))?;
            (buffer.kind(), buffer.lengths().to_vec(), buffer.segments().to_vec())
        };
        let direction = select_direction(kind, self.mode)?;
        let output_kind = direction.output_kind(kind);

        let output = session.alloc(output_kind, &lengths)?;
        let transformed = {
            let (backend, registry) = session.parts();
            let output_segments = registry.get(output).map(|b| b.segments().to_vec()).unwrap_or_default();
            input_segments
                .iter()
                .zip(&output_segments)
                .zip(&lengths)
                .try_for_each(|((src, dst), &len)| backend.execute_fft(direction, *src, kind, *dst, len))
        };
        if let Err(e) = transformed {
            session.free(output);
            return Err(e);
        }

        audio.detach_device();
        session.free(input);
        audio.attach_device(output);
        audio.form = if output_kind.is_complex() { Form::Complex } else { Form::Real };
        debug!(
            "FFT {:?} on {} segment(s): {} -> {}",
            direction,
            lengths.len(),
            input,
            output
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostBackendConfig, SessionConfig};
    use crate::host_backend::HostBackend;

    fn session() -> AcceleratorSession<HostBackend> {
        let mut session = AcceleratorSession::new(HostBackend::new());
        session.initialize(&SessionConfig::default()).unwrap();
        session
    }

    fn orchestrator() -> FftOrchestrator {
        FftOrchestrator::new(
            DispatchConfig {
                chunk_size: 256,
                overlap: 0.0,
                move_back: true,
            },
            FftMode::Auto,
        )
    }

    #[test]
    fn test_direction_selection() {
        assert_eq!(select_direction(ElementKind::Real32, FftMode::Auto).unwrap(), FftDirection::RealToComplex);
        assert_eq!(
            select_direction(ElementKind::Complex64, FftMode::Auto).unwrap(),
            FftDirection::ComplexToReal
        );
        assert_eq!(
            select_direction(ElementKind::Complex32, FftMode::ComplexToComplex).unwrap(),
            FftDirection::ComplexToComplex
        );
        assert!(matches!(
            select_direction(ElementKind::Byte, FftMode::Auto),
            Err(MediaError::UnsupportedElementKind(ElementKind::Byte))
        ));
    }

    #[test]
    fn test_forward_toggles_form() {
        let mut session = session();
        let mut audio = AudioObject::silent("z", 1024, 8000, 1, 16);

        let handle = orchestrator().perform_fft(&mut session, &mut audio).unwrap();

        assert_eq!(audio.form(), Form::Complex);
        assert_eq!(audio.device_handle(), handle);
        let buffer = session.registry().get(handle).unwrap();
        assert_eq!(buffer.kind(), ElementKind::Complex32);
        assert_eq!(buffer.lengths(), &[256, 256, 256, 256]);
        assert_eq!(session.registry().len(), 1);
    }

    #[test]
    fn test_failure_keeps_handle_and_form() {
        // Room for the real input but not for the complex output
        let backend = HostBackend::with_config(HostBackendConfig {
            memory_capacity: 8192,
            ..Default::default()
        });
        let mut session = AcceleratorSession::new(backend);
        session.initialize(&SessionConfig::default()).unwrap();
        let mut audio = AudioObject::silent("z", 1024, 8000, 1, 16);

        let result = orchestrator().perform_fft(&mut session, &mut audio);

        assert!(matches!(result, Err(MediaError::OutOfMemory { .. })));
        assert_eq!(audio.residency(), Residency::Device);
        assert_eq!(audio.form(), Form::Real);
        assert_eq!(session.registry().len(), 1);
        assert_eq!(session.registry().kind_of(audio.device_handle()), Some(ElementKind::Real32));
        assert_eq!(session.metrics().snapshot().failed_dispatches, 1);
    }
}
