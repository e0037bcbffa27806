use super::{load_state_dict_strict, prefixed, strip_prefix, ModelWrapper, StateDict, Tensor};
use crate::error::{TrainingError, TrainingResult};
use std::sync::{Arc, RwLock};

const WRAPPED_PREFIX: &str = "wrapped_model";
const HEAD_KEY: &str = "embedding_head.weight";

/// Produces fixed-size embeddings from a wrapped model.
///
/// Without an explicit `embed_dim` the wrapper's features are the embedding.
/// With one, a linear head of shape `[embed_dim, feature_dim]` is appended.
#[derive(Debug)]
pub struct EmbeddingModel {
    wrapped_model: Arc<dyn ModelWrapper>,
    embed_dim: Option<usize>,
    head: RwLock<Option<Tensor>>,
}

impl EmbeddingModel {
    pub fn new(wrapped_model: Arc<dyn ModelWrapper>, embed_dim: Option<usize>) -> TrainingResult<Self> {
        if embed_dim == Some(0) {
            return Err(TrainingError::config("embed_dim", "must be >= 1"));
        }
        let feature_dim = wrapped_model.feature_dim();
        if feature_dim == 0 {
            return Err(TrainingError::resolution("wrapped model reports a feature dimension of 0"));
        }

        let head = embed_dim.map(|dim| identity_like(dim, feature_dim));
        Ok(Self { wrapped_model, embed_dim, head: RwLock::new(head) })
    }

    #[must_use]
    pub fn wrapped_model(&self) -> &Arc<dyn ModelWrapper> {
        &self.wrapped_model
    }

    #[must_use]
    pub fn embed_dim(&self) -> usize {
        self.embed_dim.unwrap_or_else(|| self.wrapped_model.feature_dim())
    }

    pub fn forward(&self, input: &Tensor) -> TrainingResult<Tensor> {
        let features = self.wrapped_model.forward_features(input)?;
        let head = self.head.read().map_err(|_| lock_poisoned())?;
        match head.as_ref() {
            Some(weight) => features.matmul_transposed(weight),
            None => Ok(features),
        }
    }

    pub fn state_dict(&self) -> TrainingResult<StateDict> {
        let mut state = prefixed(WRAPPED_PREFIX, self.wrapped_model.model().state_dict()?);
        if let Some(weight) = self.head.read().map_err(|_| lock_poisoned())?.as_ref() {
            state.insert(HEAD_KEY.to_string(), weight.clone());
        }
        Ok(state)
    }

    pub fn load_state_dict(&self, state: &StateDict) -> TrainingResult<()> {
        let mut head = self.head.write().map_err(|_| lock_poisoned())?;
        match (head.as_mut(), state.get(HEAD_KEY)) {
            (Some(current), Some(incoming)) => {
                let mut target = StateDict::from([(HEAD_KEY.to_string(), current.clone())]);
                let source = StateDict::from([(HEAD_KEY.to_string(), incoming.clone())]);
                load_state_dict_strict(&mut target, &source)?;
                *current = incoming.clone();
            }
            (None, None) => {}
            (Some(_), None) => {
                return Err(TrainingError::Checkpoint(format!("checkpoint is missing `{HEAD_KEY}`")));
            }
            (None, Some(_)) => {
                return Err(TrainingError::Checkpoint(format!(
                    "checkpoint has `{HEAD_KEY}` but the embedding model has no head (set embed_dim)"
                )));
            }
        }

        self.wrapped_model.model().load_state_dict(&strip_prefix(WRAPPED_PREFIX, state))
    }
}

fn identity_like(rows: usize, cols: usize) -> Tensor {
    let mut weight = Tensor::zeros(vec![rows, cols]);
    for i in 0..rows.min(cols) {
        weight.data[i * cols + i] = 1.0;
    }
    weight
}

fn lock_poisoned() -> TrainingError {
    TrainingError::Trainer("embedding head lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::reference::ReferenceWrapper;

    #[test]
    fn test_embed_dim_defaults_to_feature_dim() {
        let wrapper: Arc<dyn ModelWrapper> = Arc::new(ReferenceWrapper::with_feature_dim("tiny", 16));
        let model = EmbeddingModel::new(wrapper, None).unwrap();
        assert_eq!(model.embed_dim(), 16);
        assert!(!model.state_dict().unwrap().contains_key(HEAD_KEY));
    }

    #[test]
    fn test_explicit_embed_dim_adds_head() {
        let wrapper: Arc<dyn ModelWrapper> = Arc::new(ReferenceWrapper::with_feature_dim("tiny", 16));
        let model = EmbeddingModel::new(wrapper, Some(8)).unwrap();
        assert_eq!(model.embed_dim(), 8);

        let input = Tensor::zeros(vec![2, 3]);
        let out = model.forward(&input).unwrap();
        assert_eq!(out.shape, vec![2, 8]);
    }

    #[test]
    fn test_zero_embed_dim_is_rejected() {
        let wrapper: Arc<dyn ModelWrapper> = Arc::new(ReferenceWrapper::with_feature_dim("tiny", 16));
        let err = EmbeddingModel::new(wrapper, Some(0)).unwrap_err();
        assert!(err.is_config_validation());
    }

    #[test]
    fn test_state_dict_roundtrip_through_load() {
        let wrapper: Arc<dyn ModelWrapper> = Arc::new(ReferenceWrapper::with_feature_dim("tiny", 4));
        let model = EmbeddingModel::new(wrapper, Some(2)).unwrap();
        let mut state = model.state_dict().unwrap();
        state.get_mut(HEAD_KEY).unwrap().data[0] = 3.0;
        model.load_state_dict(&state).unwrap();
        assert_eq!(model.state_dict().unwrap()[HEAD_KEY].data[0], 3.0);
    }
}
