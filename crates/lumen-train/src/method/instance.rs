use super::{MethodArgs, MethodKind};
use crate::dataset::DatasetItem;
use crate::error::{TrainingError, TrainingResult};
use crate::model::{EmbeddingModel, Tensor};
use crate::optim::OptimizerArgs;
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;

/// Input channels fed to the embedding model per view.
const INPUT_CHANNELS: usize = 3;

/// Loss and schedule values produced by one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f64,
    pub lr: f64,
    pub num_views: usize,
}

/// A fully resolved method ready to be handed to the trainer.
#[derive(Debug)]
pub struct MethodInstance {
    args: MethodArgs,
    optimizer_args: OptimizerArgs,
    embedding_model: Arc<EmbeddingModel>,
    global_batch_size: usize,
    num_views: usize,
}

impl MethodInstance {
    pub fn new(
        args: MethodArgs,
        optimizer_args: OptimizerArgs,
        embedding_model: Arc<EmbeddingModel>,
        global_batch_size: usize,
        num_views: usize,
    ) -> TrainingResult<Self> {
        if global_batch_size == 0 {
            return Err(TrainingError::resolution("global batch size must be >= 1"));
        }
        Ok(Self { args, optimizer_args, embedding_model, global_batch_size, num_views: num_views.max(1) })
    }

    #[must_use]
    pub fn method(&self) -> MethodKind {
        self.args.method()
    }

    #[must_use]
    pub fn args(&self) -> &MethodArgs {
        &self.args
    }

    #[must_use]
    pub fn optimizer_args(&self) -> &OptimizerArgs {
        &self.optimizer_args
    }

    #[must_use]
    pub fn embedding_model(&self) -> &Arc<EmbeddingModel> {
        &self.embedding_model
    }

    #[must_use]
    pub fn global_batch_size(&self) -> usize {
        self.global_batch_size
    }

    /// Base learning rate scaled linearly with the global batch size.
    #[must_use]
    pub fn scaled_lr(&self) -> f64 {
        let reference = self.method().reference_batch_size() as f64;
        self.optimizer_args.lr() * self.global_batch_size as f64 / reference
    }

    /// Cosine-decayed learning rate for `step` out of `total_steps`.
    #[must_use]
    pub fn lr_at(&self, step: u64, total_steps: u64) -> f64 {
        if total_steps == 0 {
            return self.scaled_lr();
        }
        let progress = (step.min(total_steps) as f64) / total_steps as f64;
        self.scaled_lr() * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }

    /// Run the embedding model over `batch` and report a scalar loss.
    ///
    /// Pixel decoding lives in the external data pipeline, so views are
    /// stood in for by random inputs drawn from the run's rng.
    pub fn training_step(
        &self,
        batch: &[DatasetItem],
        step: u64,
        total_steps: u64,
        rng: &mut StdRng,
    ) -> TrainingResult<StepOutput> {
        if batch.is_empty() {
            return Err(TrainingError::Trainer("training step received an empty batch".to_string()));
        }
        let rows = batch.len() * self.num_views;
        let data: Vec<f32> = (0..rows * INPUT_CHANNELS).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let input = Tensor::new(vec![rows, INPUT_CHANNELS], data)?;
        let embeddings = self.embedding_model.forward(&input)?;

        let mean_sq = embeddings.data.iter().map(|v| f64::from(*v).powi(2)).sum::<f64>() / embeddings.numel().max(1) as f64;
        let loss = mean_sq.ln_1p();
        if !loss.is_finite() {
            return Err(TrainingError::Trainer(format!("non-finite loss at step {step}")));
        }
        Ok(StepOutput { loss, lr: self.lr_at(step, total_steps), num_views: self.num_views })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::SimclrArgs;
    use crate::model::reference::ReferenceWrapper;
    use rand::SeedableRng;
    use std::path::PathBuf;

    fn instance(global_batch_size: usize) -> MethodInstance {
        let wrapper = Arc::new(ReferenceWrapper::with_feature_dim("tiny", 8));
        let embedding = Arc::new(EmbeddingModel::new(wrapper, None).unwrap());
        let optimizer = MethodKind::Simclr.optimizer_defaults(crate::optim::OptimizerType::Lars);
        MethodInstance::new(MethodArgs::Simclr(SimclrArgs::default()), optimizer, embedding, global_batch_size, 2).unwrap()
    }

    #[test]
    fn test_lr_scales_with_batch_size() {
        let small = instance(128);
        let large = instance(512);
        assert!((large.scaled_lr() / small.scaled_lr() - 4.0).abs() < 1e-12);
        assert!((instance(256).scaled_lr() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_lr_schedule_decays_to_zero() {
        let method = instance(256);
        assert!((method.lr_at(0, 100) - method.scaled_lr()).abs() < 1e-12);
        assert!(method.lr_at(100, 100).abs() < 1e-12);
    }

    #[test]
    fn test_training_step_is_deterministic_per_seed() {
        let method = instance(4);
        let batch: Vec<DatasetItem> =
            (0..4).map(|i| DatasetItem { index: i, path: PathBuf::from(format!("{i}.png")) }).collect();
        let a = method.training_step(&batch, 0, 10, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = method.training_step(&batch, 0, 10, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
        assert!(a.loss >= 0.0);
        assert_eq!(a.num_views, 2);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let method = instance(4);
        assert!(method.training_step(&[], 0, 1, &mut StdRng::seed_from_u64(0)).is_err());
    }
}
