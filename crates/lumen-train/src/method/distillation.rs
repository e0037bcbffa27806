//! Knowledge distillation from a frozen pretrained teacher.

use super::MethodArgsContext;
use crate::args::Args;
use crate::auto::Auto;
use crate::error::{TrainingError, TrainingResult};
use crate::transform::TransformArgs;
use serde::{Deserialize, Serialize};

pub const MAX_AUTO_QUEUE_SIZE: usize = 8192;

/// Teachers known to the distillation method: (name, embed dim, depth).
pub const TEACHERS: [(&str, usize, usize); 4] = [
    ("dinov2/vits14", 384, 12),
    ("dinov2/vitb14", 768, 12),
    ("dinov2/vitl14", 1024, 24),
    ("dinov2/vitg14", 1536, 40),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistillationArgs {
    pub teacher: String,
    /// Must match the teacher when set explicitly.
    pub teacher_embed_dim: Auto<usize>,
    /// Number of final teacher blocks whose outputs are averaged as targets.
    pub n_teacher_blocks: usize,
    /// Number of past teacher embeddings kept as negatives.
    pub queue_size: Auto<usize>,
    pub temperature: f64,
}

impl Default for DistillationArgs {
    fn default() -> Self {
        Self {
            teacher: "dinov2/vitb14".to_string(),
            teacher_embed_dim: Auto::Auto,
            n_teacher_blocks: 2,
            queue_size: Auto::Auto,
            temperature: 0.07,
        }
    }
}

impl Args for DistillationArgs {
    const FIELD: &'static str = "method_args";

    fn check(&self) -> TrainingResult<()> {
        if self.n_teacher_blocks == 0 {
            return Err(TrainingError::config("method_args.n_teacher_blocks", "must be >= 1"));
        }
        if self.temperature <= 0.0 {
            return Err(TrainingError::config("method_args.temperature", "must be > 0"));
        }
        if self.queue_size.explicit() == Some(&0) {
            return Err(TrainingError::config("method_args.queue_size", "must be >= 1"));
        }
        Ok(())
    }
}

impl DistillationArgs {
    pub(crate) fn resolve_auto(self, ctx: &MethodArgsContext<'_>) -> TrainingResult<Self> {
        self.check()?;
        let Some((_, embed_dim, depth)) = TEACHERS.iter().find(|(name, _, _)| *name == self.teacher).copied() else {
            let known: Vec<&str> = TEACHERS.iter().map(|(name, _, _)| *name).collect();
            return Err(TrainingError::resolution(format!(
                "unknown distillation teacher `{}`, available teachers: {}",
                self.teacher,
                known.join(", ")
            )));
        };

        if let Some(explicit) = self.teacher_embed_dim.explicit() {
            if *explicit != embed_dim {
                return Err(TrainingError::resolution(format!(
                    "teacher_embed_dim is {explicit} but teacher `{}` has embedding dimension {embed_dim}",
                    self.teacher
                )));
            }
        }
        if self.n_teacher_blocks > depth {
            return Err(TrainingError::resolution(format!(
                "n_teacher_blocks is {} but teacher `{}` only has {depth} blocks",
                self.n_teacher_blocks, self.teacher
            )));
        }

        let queue_size = self.queue_size.try_resolve_with(|| auto_queue_size(ctx.scaling.dataset_size))?;
        Ok(Self { teacher_embed_dim: Auto::Explicit(embed_dim), queue_size: Auto::Explicit(queue_size), ..self })
    }
}

/// Largest power of two not above the dataset size, capped.
fn auto_queue_size(dataset_size: usize) -> TrainingResult<usize> {
    if dataset_size == 0 {
        return Err(TrainingError::resolution("cannot derive queue_size from an empty dataset"));
    }
    let pow2 = 1usize << dataset_size.ilog2();
    Ok(pow2.min(MAX_AUTO_QUEUE_SIZE))
}

pub(super) fn transform_defaults() -> TransformArgs {
    TransformArgs { random_gray_scale: Some(0.2), ..TransformArgs::default() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ScalingInfo;
    use crate::method::test_support::context;
    use crate::method::MethodKind;
    use crate::optim::OptimizerType;

    fn resolve(args: DistillationArgs, dataset_size: usize) -> TrainingResult<DistillationArgs> {
        let scaling = ScalingInfo { dataset_size, epochs: 10 };
        let optimizer = MethodKind::Distillation.optimizer_defaults(OptimizerType::Lars);
        args.resolve_auto(&context(&scaling, &optimizer, 64))
    }

    #[test]
    fn test_auto_fields_resolved() {
        let args = resolve(DistillationArgs::default(), 1000).unwrap();
        assert_eq!(args.teacher_embed_dim, Auto::Explicit(768));
        assert_eq!(args.queue_size, Auto::Explicit(512));

        let large = resolve(DistillationArgs::default(), 1_000_000).unwrap();
        assert_eq!(large.queue_size, Auto::Explicit(MAX_AUTO_QUEUE_SIZE));
    }

    #[test]
    fn test_teacher_embed_dim_mismatch() {
        let args = DistillationArgs { teacher_embed_dim: Auto::Explicit(384), ..DistillationArgs::default() };
        assert!(resolve(args, 100).unwrap_err().is_resolution());
    }

    #[test]
    fn test_too_many_teacher_blocks() {
        let args = DistillationArgs {
            teacher: "dinov2/vits14".to_string(),
            n_teacher_blocks: 13,
            ..DistillationArgs::default()
        };
        assert!(resolve(args, 100).unwrap_err().is_resolution());
    }

    #[test]
    fn test_unknown_teacher() {
        let args = DistillationArgs { teacher: "dinov3/vit7b16".to_string(), ..DistillationArgs::default() };
        let err = resolve(args, 100).unwrap_err();
        assert!(err.to_string().contains("dinov2/vitb14"));
    }

    #[test]
    fn test_explicit_queue_size_kept() {
        let args = DistillationArgs { queue_size: Auto::Explicit(100), ..DistillationArgs::default() };
        assert_eq!(resolve(args, 10).unwrap().queue_size, Auto::Explicit(100));
    }
}
