use thiserror::Error;

use crate::buffer::{BufferHandle, ElementKind};

/// Coarse classification of a [`MediaError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Allocation failure, unknown or already-freed handle.
    Resource,
    /// Compile, launch or session failure inside the compute backend.
    Backend,
    /// Invalid parameters, rejected before any backend call.
    Data,
    /// Host filesystem or config errors.
    Io,
}

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("Unknown buffer handle: {0}")]
    UnknownHandle(BufferHandle),

    #[error("Copy failed: {0}")]
    CopyFailed(String),

    #[error("No active accelerator session")]
    NoSession,

    #[error("Session creation failed: {0}")]
    SessionCreation(String),

    #[error("Kernel compilation failed: {0}")]
    Compile(String),

    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    #[error("Kernel launch failed: {0}")]
    Launch(String),

    #[error("FFT failed: {0}")]
    Fft(String),

    #[error("Invalid chunking: chunk size {chunk_size}, overlap {overlap}")]
    InvalidChunking { chunk_size: usize, overlap: f32 },

    #[error("Unsupported element kind: {0:?}")]
    UnsupportedElementKind(ElementKind),

    #[error("Stretch factor {0} yields no valid reconstruction")]
    InvalidStretch(f64),

    #[error("Argument binding failed: {0}")]
    Binding(String),

    #[error("Media object {0} is disposed")]
    Disposed(u64),

    #[error("No data: {0}")]
    EmptyData(String),

    #[error("Invalid pixel data: {0}")]
    InvalidPixels(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl MediaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MediaError::AllocationFailed(_)
            | MediaError::OutOfMemory { .. }
            | MediaError::UnknownHandle(_)
            | MediaError::CopyFailed(_) => ErrorKind::Resource,
            MediaError::NoSession
            | MediaError::SessionCreation(_)
            | MediaError::Compile(_)
            | MediaError::KernelNotFound(_)
            | MediaError::Launch(_)
            | MediaError::Fft(_) => ErrorKind::Backend,
            MediaError::InvalidChunking { .. }
            | MediaError::UnsupportedElementKind(_)
            | MediaError::InvalidStretch(_)
            | MediaError::Binding(_)
            | MediaError::Disposed(_)
            | MediaError::EmptyData(_)
            | MediaError::InvalidPixels(_) => ErrorKind::Data,
            MediaError::Io(_) | MediaError::Config(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;
