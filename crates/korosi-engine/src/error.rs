use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no valid model artifact at {path} and no download URL configured")]
    NoSource { path: PathBuf },
    #[error("download from {url} failed: {message}")]
    Download {
        url: String,
        message: String,
        retryable: bool,
    },
    #[error("download from {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("model artifact {path} is {size} bytes, below the {min} byte minimum")]
    Undersized { path: PathBuf, size: u64, min: u64 },
    #[error("model artifact {path} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "model artifact from {location} is a {format} file, not ONNX; \
         set MODEL_URL to an ONNX export of the classifier"
    )]
    UnsupportedFormat {
        location: String,
        format: &'static str,
    },
    #[error("failed to load model from {path}: {message}")]
    Load { path: PathBuf, message: String },
}

impl ProvisionError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Download { retryable, .. } => *retryable,
            Self::HttpStatus { status, .. } => crate::transport::is_retryable_status(*status),
            _ => false,
        }
    }

    /// Short machine-friendly kind used in event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoSource { .. } => "no_source",
            Self::Download { .. } => "download",
            Self::HttpStatus { .. } => "http_status",
            Self::Undersized { .. } => "undersized",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::Io { .. } => "io",
            Self::UnsupportedFormat { .. } => "unsupported_format",
            Self::Load { .. } => "load",
        }
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("unsupported image type '{0}' (expected jpg, jpeg or png)")]
    UnsupportedFormat(String),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to read image {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("model produced output of shape {0:?}, expected a single probability")]
    OutputShape(Vec<usize>),
    #[error("model produced invalid probability {0}")]
    InvalidProbability(f32),
    #[error("forward pass failed: {0}")]
    Runtime(String),
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("model unavailable: {0}")]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Failure inside report generation. Never escapes the engine: callers
/// receive it rendered as the report text.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to encode image as PNG: {0}")]
    Encode(#[from] image::ImageError),
    #[error("{0}")]
    Transport(String),
    #[error("Gemini request failed ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("Gemini returned invalid JSON payload: {0}")]
    InvalidPayload(String),
    #[error("Gemini returned no text{0}")]
    EmptyResponse(String),
}
