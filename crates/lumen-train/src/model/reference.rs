//! Small self-contained models for runs that do not bring their own
//! architecture. They have real weights and a real (linear) forward pass, so
//! checkpointing, resume and export can be exercised end to end.

use super::package::{write_export, ModelFormat, Package};
use super::{load_state_dict_strict, Module, ModelWrapper, StateDict, Tensor};
use crate::args::parse_field;
use crate::error::{TrainingError, TrainingResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, RwLock};

pub const PACKAGE_NAME: &str = "reference";
const INPUT_CHANNELS: usize = 3;
const WEIGHT_KEY: &str = "backbone.weight";
const BIAS_KEY: &str = "backbone.bias";

/// Built-in architectures and their feature dimensions.
const ARCHITECTURES: &[(&str, usize)] = &[("tiny", 64), ("small", 384), ("base", 768)];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ReferenceModelArgs {
    feature_dim: Option<usize>,
    seed: u64,
}

#[derive(Debug)]
pub struct ReferenceModule {
    architecture: String,
    feature_dim: usize,
    weights: RwLock<StateDict>,
}

impl ReferenceModule {
    #[must_use]
    pub fn new(architecture: &str, feature_dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let weight: Vec<f32> =
            (0..feature_dim * INPUT_CHANNELS).map(|_| rng.gen_range(-0.1f32..0.1)).collect();

        let mut weights = StateDict::new();
        weights.insert(
            WEIGHT_KEY.to_string(),
            Tensor { shape: vec![feature_dim, INPUT_CHANNELS], data: weight },
        );
        weights.insert(BIAS_KEY.to_string(), Tensor::zeros(vec![feature_dim]));

        Self { architecture: format!("{PACKAGE_NAME}/{architecture}"), feature_dim, weights: RwLock::new(weights) }
    }

    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

impl Module for ReferenceModule {
    fn architecture(&self) -> &str {
        &self.architecture
    }

    fn state_dict(&self) -> TrainingResult<StateDict> {
        Ok(self.weights.read().map_err(|_| poisoned())?.clone())
    }

    fn load_state_dict(&self, state: &StateDict) -> TrainingResult<()> {
        let mut weights = self.weights.write().map_err(|_| poisoned())?;
        load_state_dict_strict(&mut weights, state)
    }
}

/// Linear feature extractor over any module holding `backbone.weight` and
/// `backbone.bias`.
#[derive(Debug, Clone)]
pub struct ReferenceWrapper {
    module: Arc<dyn Module>,
    feature_dim: usize,
}

impl ReferenceWrapper {
    #[must_use]
    pub fn new(module: Arc<ReferenceModule>) -> Self {
        let feature_dim = module.feature_dim();
        Self { module, feature_dim }
    }

    #[must_use]
    pub fn with_feature_dim(architecture: &str, feature_dim: usize) -> Self {
        Self::new(Arc::new(ReferenceModule::new(architecture, feature_dim, 0)))
    }
}

impl ModelWrapper for ReferenceWrapper {
    fn model(&self) -> Arc<dyn Module> {
        self.module.clone()
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn forward_features(&self, input: &Tensor) -> TrainingResult<Tensor> {
        let weights = self.module.state_dict()?;
        let (Some(weight), Some(bias)) = (weights.get(WEIGHT_KEY), weights.get(BIAS_KEY)) else {
            return Err(TrainingError::Trainer(format!(
                "model `{}` has no backbone weights",
                self.module.architecture()
            )));
        };

        let mut out = input.matmul_transposed(weight)?;
        for row in out.data.chunks_mut(self.feature_dim) {
            for (value, b) in row.iter_mut().zip(&bias.data) {
                *value += b;
            }
        }
        Ok(out)
    }
}

/// Package serving `reference/<architecture>` models.
#[derive(Debug, Default)]
pub struct ReferencePackage;

impl Package for ReferencePackage {
    fn name(&self) -> &'static str {
        PACKAGE_NAME
    }

    fn list_model_names(&self) -> Vec<String> {
        ARCHITECTURES.iter().map(|(name, _)| format!("{PACKAGE_NAME}/{name}")).collect()
    }

    fn is_supported_model(&self, model: &dyn Module) -> bool {
        model
            .architecture()
            .strip_prefix(&format!("{PACKAGE_NAME}/"))
            .is_some_and(|arch| ARCHITECTURES.iter().any(|(name, _)| *name == arch))
    }

    fn get_model(&self, model_name: &str, model_args: Option<&Map<String, Value>>) -> TrainingResult<Arc<dyn Module>> {
        let Some((_, default_dim)) = ARCHITECTURES.iter().find(|(name, _)| *name == model_name) else {
            return Err(TrainingError::resolution(format!(
                "unknown model `{PACKAGE_NAME}/{model_name}`, available: {}",
                self.list_model_names().join(", ")
            )));
        };

        let args: ReferenceModelArgs = match model_args {
            Some(map) => parse_field("model_args", Value::Object(map.clone()))?,
            None => ReferenceModelArgs::default(),
        };
        let feature_dim = args.feature_dim.unwrap_or(*default_dim);
        if feature_dim == 0 {
            return Err(TrainingError::config("model_args.feature_dim", "must be >= 1"));
        }

        Ok(Arc::new(ReferenceModule::new(model_name, feature_dim, args.seed)))
    }

    fn get_model_wrapper(&self, model: Arc<dyn Module>) -> TrainingResult<Arc<dyn ModelWrapper>> {
        if !self.is_supported_model(model.as_ref()) {
            return Err(TrainingError::resolution(format!(
                "model `{}` is not supported by package `{PACKAGE_NAME}`",
                model.architecture()
            )));
        }
        let feature_dim = model
            .state_dict()?
            .get(WEIGHT_KEY)
            .and_then(|w| w.shape.first().copied())
            .ok_or_else(|| TrainingError::resolution(format!("model `{}` has no `{WEIGHT_KEY}`", model.architecture())))?;
        Ok(Arc::new(ReferenceWrapper { module: model, feature_dim }))
    }

    fn export_model(&self, model: &dyn ModelWrapper, out: &Path, format: ModelFormat) -> TrainingResult<()> {
        write_export(PACKAGE_NAME, model, out, format)
    }
}

fn poisoned() -> TrainingError {
    TrainingError::Trainer("reference module lock poisoned".to_string())
}
