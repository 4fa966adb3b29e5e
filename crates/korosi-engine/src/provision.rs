use std::fs::{self, File};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use korosi_contracts::Settings;
use reqwest::blocking::Client as HttpClient;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::transport::{error_chain_text, is_retryable_reqwest_error, RetryPolicy};

/// Smallest artifact accepted as a complete model file.
pub const MIN_ARTIFACT_BYTES: u64 = 10_000_000;

const CHUNK_SIZE: usize = 8192;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const HDF5_MAGIC: &[u8] = b"\x89HDF\r\n\x1a\n";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some((self.downloaded as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

pub struct ArtifactStream {
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

/// Where artifact bytes come from. The HTTP implementation follows redirects;
/// tests substitute in-memory sources.
pub trait ArtifactSource: Send + Sync {
    fn open(&self, url: &str) -> Result<ArtifactStream, ProvisionError>;
}

pub struct HttpArtifactSource {
    http: HttpClient,
}

impl HttpArtifactSource {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }
}

impl ArtifactSource for HttpArtifactSource {
    fn open(&self, url: &str) -> Result<ArtifactStream, ProvisionError> {
        let response = self.http.get(url).send().map_err(|err| {
            let retryable = is_retryable_reqwest_error(&err);
            ProvisionError::Download {
                url: url.to_string(),
                message: error_chain_text(&anyhow::Error::new(err), 512),
                retryable,
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(ArtifactStream {
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}

/// What to provision and how to judge it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionPlan {
    pub path: PathBuf,
    pub url: Option<String>,
    pub sha256: Option<String>,
    pub min_bytes: u64,
}

impl ProvisionPlan {
    pub fn new(path: impl Into<PathBuf>, url: Option<String>) -> Self {
        Self {
            path: path.into(),
            url,
            sha256: None,
            min_bytes: MIN_ARTIFACT_BYTES,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            sha256: settings.model_sha256.clone(),
            ..Self::new(settings.model_path.clone(), settings.model_url.clone())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactOrigin {
    Cached,
    Downloaded,
}

impl ArtifactOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Downloaded => "downloaded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub origin: ArtifactOrigin,
    pub url: Option<String>,
}

pub struct Provisioner {
    plan: ProvisionPlan,
    source: Arc<dyn ArtifactSource>,
    retry: RetryPolicy,
    /// URL whose payload was not an ONNX graph, with the detected format.
    rejected: Mutex<Option<(String, &'static str)>>,
}

impl Provisioner {
    pub fn new(plan: ProvisionPlan, source: Arc<dyn ArtifactSource>) -> Self {
        Self {
            plan,
            source,
            retry: RetryPolicy::default(),
            rejected: Mutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn plan(&self) -> &ProvisionPlan {
        &self.plan
    }

    /// Makes sure a valid artifact sits at the plan's path, downloading it if needed.
    ///
    /// Any file left behind by a failed or rejected download is removed before
    /// returning the error. A URL that served a non-ONNX payload is not fetched
    /// again by this provisioner.
    pub fn ensure(
        &self,
        progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<ProvisionedArtifact, ProvisionError> {
        let path = &self.plan.path;
        if let Some(size_bytes) = self.validate_existing()? {
            if let Some(format) = foreign_model_format(path)? {
                return Err(ProvisionError::UnsupportedFormat {
                    location: path.display().to_string(),
                    format,
                });
            }
            debug!(path = %path.display(), size_bytes, "using cached model artifact");
            return Ok(ProvisionedArtifact {
                path: path.clone(),
                size_bytes,
                origin: ArtifactOrigin::Cached,
                url: self.plan.url.clone(),
            });
        }

        remove_if_exists(path)?;
        let Some(url) = self.plan.url.as_deref() else {
            return Err(ProvisionError::NoSource { path: path.clone() });
        };
        if let Some(format) = self.rejected_format(url) {
            return Err(ProvisionError::UnsupportedFormat {
                location: url.to_string(),
                format,
            });
        }

        info!(url, path = %path.display(), "downloading model artifact");
        for attempt in 0..=self.retry.max_retries {
            match self.download_once(url, progress) {
                Ok(written) => {
                    debug!(written, "download finished");
                    break;
                }
                Err(err) => {
                    remove_if_exists(path)?;
                    if !err.is_retryable() || attempt >= self.retry.max_retries {
                        return Err(err);
                    }
                    warn!(
                        "model download retry {}/{} after transient failure: {err}",
                        attempt + 1,
                        self.retry.max_retries
                    );
                    self.retry.sleep_before_retry(attempt);
                }
            }
        }

        let size_bytes = file_size(path)?;
        if size_bytes < self.plan.min_bytes {
            remove_if_exists(path)?;
            return Err(ProvisionError::Undersized {
                path: path.clone(),
                size: size_bytes,
                min: self.plan.min_bytes,
            });
        }
        if let Some(format) = foreign_model_format(path)? {
            remove_if_exists(path)?;
            warn!(url, format, "downloaded model artifact is not ONNX");
            if let Ok(mut rejected) = self.rejected.lock() {
                *rejected = Some((url.to_string(), format));
            }
            return Err(ProvisionError::UnsupportedFormat {
                location: url.to_string(),
                format,
            });
        }
        if let Some(expected) = self.plan.sha256.as_deref() {
            let actual = sha256_file(path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                remove_if_exists(path)?;
                return Err(ProvisionError::ChecksumMismatch {
                    path: path.clone(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        info!(path = %path.display(), size_bytes, "model artifact ready");
        Ok(ProvisionedArtifact {
            path: path.clone(),
            size_bytes,
            origin: ArtifactOrigin::Downloaded,
            url: Some(url.to_string()),
        })
    }

    /// Size of the file at the plan's path when it already qualifies as a
    /// complete artifact, `None` when it is missing or must be replaced.
    pub fn validate_existing(&self) -> Result<Option<u64>, ProvisionError> {
        let path = &self.plan.path;
        let size = match fs::metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ProvisionError::io(path, err)),
        };
        if size < self.plan.min_bytes {
            warn!(
                path = %path.display(),
                size,
                min = self.plan.min_bytes,
                "cached model artifact is undersized, discarding"
            );
            return Ok(None);
        }
        if let Some(expected) = self.plan.sha256.as_deref() {
            let actual = sha256_file(path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                warn!(path = %path.display(), "cached model artifact failed checksum, discarding");
                return Ok(None);
            }
        }
        Ok(Some(size))
    }

    fn rejected_format(&self, url: &str) -> Option<&'static str> {
        let rejected = self.rejected.lock().ok()?;
        match rejected.as_ref() {
            Some((seen, format)) if seen.as_str() == url => Some(*format),
            _ => None,
        }
    }

    fn download_once(
        &self,
        url: &str,
        progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<u64, ProvisionError> {
        let stream = self.source.open(url)?;
        let path = &self.plan.path;
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| ProvisionError::io(parent, err))?;
        }
        let file = File::create(path).map_err(|err| ProvisionError::io(path, err))?;
        let mut writer = BufWriter::new(file);
        let mut body = stream.body;
        let read_failed = |err: io::Error| ProvisionError::Download {
            url: url.to_string(),
            message: format!("failed reading response body: {err}"),
            retryable: true,
        };

        let written = match stream.content_length.filter(|total| *total > 0) {
            Some(total) => {
                let mut buf = vec![0u8; CHUNK_SIZE];
                let mut downloaded = 0u64;
                progress(DownloadProgress {
                    downloaded,
                    total: Some(total),
                });
                loop {
                    let read = match body.read(&mut buf) {
                        Ok(0) => break,
                        Ok(read) => read,
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err) => return Err(read_failed(err)),
                    };
                    writer
                        .write_all(&buf[..read])
                        .map_err(|err| ProvisionError::io(path, err))?;
                    downloaded += read as u64;
                    progress(DownloadProgress {
                        downloaded,
                        total: Some(total),
                    });
                }
                downloaded
            }
            None => {
                let mut bytes = Vec::new();
                body.read_to_end(&mut bytes).map_err(read_failed)?;
                writer
                    .write_all(&bytes)
                    .map_err(|err| ProvisionError::io(path, err))?;
                let downloaded = bytes.len() as u64;
                progress(DownloadProgress {
                    downloaded,
                    total: None,
                });
                downloaded
            }
        };
        writer.flush().map_err(|err| ProvisionError::io(path, err))?;
        Ok(written)
    }
}

pub fn sha256_file(path: &Path) -> Result<String, ProvisionError> {
    let mut file = File::open(path).map_err(|err| ProvisionError::io(path, err))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(ProvisionError::io(path, err)),
        };
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Recognizes Keras archives by their leading bytes. ONNX protobufs carry no
/// magic number, so anything else is left for the loader to judge.
fn foreign_model_format(path: &Path) -> Result<Option<&'static str>, ProvisionError> {
    let mut file = File::open(path).map_err(|err| ProvisionError::io(path, err))?;
    let mut head = [0u8; 8];
    let mut filled = 0;
    while filled < head.len() {
        match file.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(ProvisionError::io(path, err)),
        }
    }
    let head = &head[..filled];
    Ok(if head.starts_with(ZIP_MAGIC) {
        Some("Keras (zip)")
    } else if head.starts_with(HDF5_MAGIC) {
        Some("Keras (HDF5)")
    } else {
        None
    })
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<(), ProvisionError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ProvisionError::io(path, err)),
    }
}

fn file_size(path: &Path) -> Result<u64, ProvisionError> {
    fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(|err| ProvisionError::io(path, err))
}
