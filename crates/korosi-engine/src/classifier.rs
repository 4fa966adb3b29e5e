use std::path::Path;
use std::sync::Arc;

use image::DynamicImage;
use korosi_contracts::Prediction;
use once_cell::sync::OnceCell;
use tracing::debug;
use tract_onnx::prelude::*;

use crate::error::{InferenceError, ProvisionError};
use crate::preprocess::{preprocess, InputTensor};

type TractPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelSignature {
    pub input: Option<String>,
    pub output: Option<String>,
}

/// A loaded binary classifier: one forward pass yields the sigmoid output.
pub trait ProbabilityModel: Send + Sync {
    fn forward(&self, input: &InputTensor) -> Result<f32, InferenceError>;

    fn signature(&self) -> ModelSignature {
        ModelSignature::default()
    }
}

pub type SharedModel = Arc<dyn ProbabilityModel>;

pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<SharedModel, ProvisionError>;
}

pub struct TractModel {
    plan: TractPlan,
}

impl TractModel {
    pub fn load(path: &Path) -> Result<Self, ProvisionError> {
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| {
                model.with_input_fact(
                    0,
                    InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 128, 128, 3)),
                )
            })
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|err| ProvisionError::Load {
                path: path.to_path_buf(),
                message: format!("{err:#}"),
            })?;
        Ok(Self { plan })
    }

    pub fn from_typed(model: TypedModel) -> TractResult<Self> {
        Ok(Self {
            plan: model.into_runnable()?,
        })
    }
}

impl ProbabilityModel for TractModel {
    fn forward(&self, input: &InputTensor) -> Result<f32, InferenceError> {
        let runtime = |err: TractError| InferenceError::Runtime(format!("{err:#}"));
        let outputs = self
            .plan
            .run(tvec!(input.clone().into_tensor().into()))
            .map_err(runtime)?;
        let first = outputs
            .first()
            .ok_or_else(|| InferenceError::OutputShape(Vec::new()))?;
        let view = first.to_array_view::<f32>().map_err(runtime)?;
        if view.len() != 1 {
            return Err(InferenceError::OutputShape(view.shape().to_vec()));
        }
        let probability = view
            .iter()
            .next()
            .copied()
            .ok_or_else(|| InferenceError::OutputShape(view.shape().to_vec()))?;
        validate_probability(probability)
    }

    fn signature(&self) -> ModelSignature {
        let model = self.plan.model();
        ModelSignature {
            input: model
                .input_fact(0)
                .ok()
                .map(|fact| format!("{:?}", fact.shape)),
            output: model
                .output_fact(0)
                .ok()
                .map(|fact| format!("{:?}", fact.shape)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TractLoader;

impl ModelLoader for TractLoader {
    fn load(&self, path: &Path) -> Result<SharedModel, ProvisionError> {
        debug!(path = %path.display(), "loading ONNX model");
        Ok(Arc::new(TractModel::load(path)?))
    }
}

pub fn validate_probability(probability: f32) -> Result<f32, InferenceError> {
    if probability.is_finite() && (0.0..=1.0).contains(&probability) {
        Ok(probability)
    } else {
        Err(InferenceError::InvalidProbability(probability))
    }
}

pub fn predict(
    model: &dyn ProbabilityModel,
    image: &DynamicImage,
) -> Result<Prediction, InferenceError> {
    let input = preprocess(image);
    let probability = model.forward(&input)?;
    Ok(Prediction::from_probability(f64::from(probability)))
}

/// Once-initialized slot for the process's model handle.
///
/// Holds nothing until an initializer succeeds; a failed initializer leaves
/// the slot empty so a later call can try again. Once filled it never changes.
#[derive(Default)]
pub struct ModelCache {
    cell: OnceCell<SharedModel>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<SharedModel> {
        self.cell.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn get_or_try_init<F>(&self, init: F) -> Result<SharedModel, ProvisionError>
    where
        F: FnOnce() -> Result<SharedModel, ProvisionError>,
    {
        self.cell.get_or_try_init(init).cloned()
    }
}
