//! Model capability surfaces.
//!
//! Architectures live outside this crate. The orchestration layer only needs
//! to read and write named weights, ask for the feature dimension and run a
//! forward pass, which is what [`Module`] and [`ModelWrapper`] expose.

pub mod embedding;
pub mod package;
pub mod reference;

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub use embedding::EmbeddingModel;
pub use package::{CustomPackage, ModelFormat, Package, PackageRegistry};
pub use reference::{ReferenceModule, ReferencePackage, ReferenceWrapper};

/// Dense row-major tensor used for weights and activations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> TrainingResult<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(TrainingError::Trainer(format!(
                "tensor shape {shape:?} needs {numel} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>) -> Self {
        let numel = shape.iter().product();
        Self { shape, data: vec![0.0; numel] }
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// `self [n, k] x other^T` where `other` is `[m, k]`, giving `[n, m]`.
    pub fn matmul_transposed(&self, other: &Tensor) -> TrainingResult<Tensor> {
        let (&[n, k], &[m, k2]) = (self.shape.as_slice(), other.shape.as_slice()) else {
            return Err(TrainingError::Trainer(format!(
                "matmul expects 2d tensors, got {:?} and {:?}",
                self.shape, other.shape
            )));
        };
        if k != k2 {
            return Err(TrainingError::Trainer(format!(
                "matmul inner dimensions differ: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }

        let mut out = vec![0.0f32; n * m];
        for row in 0..n {
            let lhs = &self.data[row * k..(row + 1) * k];
            for col in 0..m {
                let rhs = &other.data[col * k..(col + 1) * k];
                out[row * m + col] = lhs.iter().zip(rhs).map(|(a, b)| a * b).sum();
            }
        }
        Tensor::new(vec![n, m], out)
    }
}

/// Named weights of a module.
pub type StateDict = BTreeMap<String, Tensor>;

/// Copy `incoming` over `target`, requiring identical keys and shapes.
pub fn load_state_dict_strict(target: &mut StateDict, incoming: &StateDict) -> TrainingResult<()> {
    let missing: Vec<&String> = target.keys().filter(|k| !incoming.contains_key(*k)).collect();
    let unexpected: Vec<&String> = incoming.keys().filter(|k| !target.contains_key(*k)).collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        return Err(TrainingError::Checkpoint(format!(
            "state dict keys do not match (missing: {missing:?}, unexpected: {unexpected:?})"
        )));
    }

    for (name, tensor) in incoming {
        if let Some(current) = target.get(name) {
            if current.shape != tensor.shape {
                return Err(TrainingError::Checkpoint(format!(
                    "shape mismatch for `{name}`: model has {:?}, checkpoint has {:?}",
                    current.shape, tensor.shape
                )));
            }
        }
    }

    target.clone_from(incoming);
    Ok(())
}

/// Prefix every key of `state` with `prefix.`.
#[must_use]
pub fn prefixed(prefix: &str, state: StateDict) -> StateDict {
    state.into_iter().map(|(k, v)| (format!("{prefix}.{k}"), v)).collect()
}

/// Keys of `state` under `prefix.`, with the prefix stripped.
#[must_use]
pub fn strip_prefix(prefix: &str, state: &StateDict) -> StateDict {
    let prefix = format!("{prefix}.");
    state
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone())))
        .collect()
}

/// An underlying model: something that owns weights.
pub trait Module: Send + Sync + std::fmt::Debug {
    /// Architecture identifier, used by packages to recognise their models.
    fn architecture(&self) -> &str;

    fn state_dict(&self) -> TrainingResult<StateDict>;

    fn load_state_dict(&self, state: &StateDict) -> TrainingResult<()>;
}

/// Uniform surface over heterogeneous architectures.
pub trait ModelWrapper: Send + Sync + std::fmt::Debug {
    fn model(&self) -> Arc<dyn Module>;

    fn feature_dim(&self) -> usize;

    /// Map a `[batch, channels]` input to `[batch, feature_dim]` features.
    fn forward_features(&self, input: &Tensor) -> TrainingResult<Tensor>;
}

/// How a model was handed to the run.
///
/// Raw config input can only carry a name. Library callers may also pass a
/// bare module (resolved through a package) or a ready wrapper.
#[derive(Clone)]
pub enum ModelSource {
    Name(String),
    Module(Arc<dyn Module>),
    Wrapper(Arc<dyn ModelWrapper>),
}

impl ModelSource {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Name(name) => name.clone(),
            Self::Module(module) => format!("<module {}>", module.architecture()),
            Self::Wrapper(wrapper) => format!("<wrapper {}>", wrapper.model().architecture()),
        }
    }
}

impl std::fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

impl PartialEq for ModelSource {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Name(a), Self::Name(b)) => a == b,
            (Self::Module(a), Self::Module(b)) => Arc::ptr_eq(a, b),
            (Self::Wrapper(a), Self::Wrapper(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Serialize for ModelSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.describe())
    }
}
