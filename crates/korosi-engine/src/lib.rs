pub mod classifier;
pub mod error;
pub mod preprocess;
pub mod provision;
pub mod report;
pub mod status;
pub mod transport;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use image::DynamicImage;
use korosi_contracts::events::{EventPayload, EventWriter};
use korosi_contracts::{Label, Prediction, Settings};
use once_cell::sync::OnceCell;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

pub use classifier::{ModelCache, ModelLoader, ProbabilityModel, SharedModel, TractLoader};
pub use error::{DetectError, InferenceError, ProvisionError, ReportError};
pub use provision::{
    ArtifactOrigin, ArtifactSource, DownloadProgress, HttpArtifactSource, ProvisionPlan,
    ProvisionedArtifact, Provisioner, MIN_ARTIFACT_BYTES,
};
pub use report::{GeminiReportProvider, Report, ReportGenerator, ReportProvider, ReportStatus};

/// Provisioning, the shared model handle, prediction and reporting behind one
/// handle. The model is fetched and loaded at most once per engine; a failed
/// attempt leaves nothing cached so the next call starts over.
pub struct DetectionEngine {
    settings: Settings,
    provisioner: Provisioner,
    loader: Arc<dyn ModelLoader>,
    cache: ModelCache,
    artifact: OnceCell<ProvisionedArtifact>,
    reporter: ReportGenerator,
    events: Option<EventWriter>,
}

impl DetectionEngine {
    pub fn new(settings: Settings) -> Result<Self> {
        let source = HttpArtifactSource::new(settings.download_timeout)
            .context("failed to build model download client")?;
        let provisioner = Provisioner::new(ProvisionPlan::from_settings(&settings), Arc::new(source));
        let reporter = ReportGenerator::new(Arc::new(GeminiReportProvider::from_settings(&settings)));
        Ok(Self::with_parts(
            settings,
            provisioner,
            Arc::new(TractLoader),
            reporter,
        ))
    }

    pub fn with_parts(
        settings: Settings,
        provisioner: Provisioner,
        loader: Arc<dyn ModelLoader>,
        reporter: ReportGenerator,
    ) -> Self {
        Self {
            settings,
            provisioner,
            loader,
            cache: ModelCache::new(),
            artifact: OnceCell::new(),
            reporter,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn model_loaded(&self) -> bool {
        self.cache.is_loaded()
    }

    /// Artifact behind the cached model, once one has been loaded.
    pub fn artifact(&self) -> Option<&ProvisionedArtifact> {
        self.artifact.get()
    }

    pub fn ensure_model(
        &self,
        progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<SharedModel, ProvisionError> {
        self.cache.get_or_try_init(|| self.provision_and_load(progress))
    }

    pub fn load_image(&self, path: &Path) -> Result<DynamicImage, InferenceError> {
        preprocess::load_upload(path)
    }

    pub fn predict(&self, image: &DynamicImage) -> Result<Prediction, DetectError> {
        let model = self.ensure_model(&mut |_| {})?;
        let prediction = classifier::predict(model.as_ref(), image)?;
        info!(
            label = prediction.label.as_str(),
            probability = prediction.probability,
            "prediction complete"
        );
        self.emit(
            "prediction",
            json!({
                "probability": prediction.probability,
                "label": prediction.label,
                "class_index": prediction.label.class_index(),
                "confidence": prediction.confidence_percent,
                "confidence_text": prediction.confidence_text(),
            }),
        );
        Ok(prediction)
    }

    /// Explicit reporting step; uses the configured credential.
    pub fn generate_report(
        &self,
        image: &DynamicImage,
        label: Label,
        confidence_percent: f64,
    ) -> Report {
        let report = self.reporter.generate_report(
            image,
            label,
            confidence_percent,
            self.settings.gemini_api_key.as_deref(),
        );
        let event_type = if report.is_generated() {
            "report_generated"
        } else {
            "report_failed"
        };
        self.emit(
            event_type,
            json!({
                "status": report.status.as_str(),
                "provider": self.reporter.provider().name(),
                "model": report.model,
                "label": label,
                "chars": report.text.chars().count(),
            }),
        );
        report
    }

    fn provision_and_load(
        &self,
        progress: &mut dyn FnMut(DownloadProgress),
    ) -> Result<SharedModel, ProvisionError> {
        let plan = self.provisioner.plan();
        self.emit(
            "provision_started",
            json!({
                "path": plan.path.to_string_lossy(),
                "url": plan.url,
            }),
        );

        let mut last_percent = None;
        let provisioned = self.provisioner.ensure(&mut |update: DownloadProgress| {
            let percent = update.fraction().map(|fraction| (fraction * 100.0).floor() as u64);
            if percent.is_none() || percent != last_percent {
                last_percent = percent;
                self.emit(
                    "download_progress",
                    json!({
                        "downloaded": update.downloaded,
                        "total": update.total,
                        "percent": percent,
                    }),
                );
            }
            progress(update);
        });
        let artifact = match provisioned {
            Ok(artifact) => artifact,
            Err(err) => return Err(self.provision_failed(err)),
        };

        let model = match self.loader.load(&artifact.path) {
            Ok(model) => model,
            Err(err) => {
                // Only a file this call fetched is ours to discard.
                if artifact.origin == ArtifactOrigin::Downloaded {
                    if let Err(remove_err) = provision::remove_if_exists(&artifact.path) {
                        warn!("failed to remove unloadable artifact: {remove_err}");
                    }
                }
                return Err(self.provision_failed(err));
            }
        };

        let signature = model.signature();
        self.emit(
            "model_ready",
            json!({
                "path": artifact.path.to_string_lossy(),
                "size_bytes": artifact.size_bytes,
                "origin": artifact.origin.as_str(),
                "input_shape": signature.input,
                "output_shape": signature.output,
            }),
        );
        if self.artifact.set(artifact).is_err() {
            debug!("model artifact already recorded");
        }
        Ok(model)
    }

    fn provision_failed(&self, err: ProvisionError) -> ProvisionError {
        warn!("model provisioning failed: {err}");
        self.emit(
            "provision_failed",
            json!({
                "kind": err.kind(),
                "error": err.to_string(),
                "retryable": err.is_retryable(),
            }),
        );
        err
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Err(err) = events.emit(event_type, map_object(payload)) {
            warn!("failed to write {event_type} event: {err:#}");
        }
    }
}

fn map_object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
