use super::MethodArgsContext;
use crate::args::Args;
use crate::auto::Auto;
use crate::error::{TrainingError, TrainingResult};
use crate::optim::OptimizerArgs;
use crate::transform::{ColorJitterArgs, LocalViewArgs, TransformArgs};
use serde::{Deserialize, Serialize};

const MIN_AUTO_OUTPUT_DIM: usize = 1024;
const MAX_AUTO_OUTPUT_DIM: usize = 65536;
const MAX_AUTO_WARMUP_EPOCHS: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DinoArgs {
    pub hidden_dim: usize,
    pub bottleneck_dim: usize,
    /// Number of prototypes. `auto` scales with the dataset size.
    pub output_dim: Auto<usize>,
    pub student_temp: f64,
    pub teacher_temp: f64,
    pub warmup_teacher_temp: f64,
    pub warmup_teacher_temp_epochs: Auto<usize>,
    pub momentum_start: f64,
    pub momentum_end: f64,
    pub weight_decay_start: Auto<f64>,
    pub weight_decay_end: Auto<f64>,
}

impl Default for DinoArgs {
    fn default() -> Self {
        Self {
            hidden_dim: 2048,
            bottleneck_dim: 256,
            output_dim: Auto::Auto,
            student_temp: 0.1,
            teacher_temp: 0.04,
            warmup_teacher_temp: 0.04,
            warmup_teacher_temp_epochs: Auto::Auto,
            momentum_start: 0.996,
            momentum_end: 1.0,
            weight_decay_start: Auto::Auto,
            weight_decay_end: Auto::Auto,
        }
    }
}

impl Args for DinoArgs {
    const FIELD: &'static str = "method_args";

    fn check(&self) -> TrainingResult<()> {
        if self.hidden_dim == 0 || self.bottleneck_dim == 0 {
            return Err(TrainingError::config("method_args.hidden_dim", "head dimensions must be >= 1"));
        }
        if self.bottleneck_dim > self.hidden_dim {
            return Err(TrainingError::config(
                "method_args.bottleneck_dim",
                format!("must be <= hidden_dim ({}), got {}", self.hidden_dim, self.bottleneck_dim),
            ));
        }
        if self.output_dim.explicit() == Some(&0) {
            return Err(TrainingError::config("method_args.output_dim", "must be >= 1"));
        }
        for (field, temp) in [
            ("method_args.student_temp", self.student_temp),
            ("method_args.teacher_temp", self.teacher_temp),
            ("method_args.warmup_teacher_temp", self.warmup_teacher_temp),
        ] {
            if temp <= 0.0 {
                return Err(TrainingError::config(field, "must be > 0"));
            }
        }
        if !(0.0..=1.0).contains(&self.momentum_start) || !(0.0..=1.0).contains(&self.momentum_end) {
            return Err(TrainingError::config("method_args.momentum_start", "momentum must be in [0, 1]"));
        }
        Ok(())
    }
}

impl DinoArgs {
    pub(crate) fn resolve_auto(self, ctx: &MethodArgsContext<'_>) -> TrainingResult<Self> {
        self.check()?;
        let epochs = ctx.scaling.epochs;
        let output_dim = self.output_dim.resolve_with(|| auto_output_dim(ctx.scaling.dataset_size));
        let warmup = self.warmup_teacher_temp_epochs.resolve_with(|| (epochs / 10).min(MAX_AUTO_WARMUP_EPOCHS));
        if epochs > 0 && warmup > epochs {
            return Err(TrainingError::resolution(format!(
                "warmup_teacher_temp_epochs ({warmup}) exceeds the number of epochs ({epochs})"
            )));
        }

        let (wd_start, wd_end) = auto_weight_decay(ctx.optimizer);
        Ok(Self {
            output_dim: Auto::Explicit(output_dim),
            warmup_teacher_temp_epochs: Auto::Explicit(warmup),
            weight_decay_start: Auto::Explicit(self.weight_decay_start.resolve_with(|| wd_start)),
            weight_decay_end: Auto::Explicit(self.weight_decay_end.resolve_with(|| wd_end)),
            ..self
        })
    }
}

fn auto_output_dim(dataset_size: usize) -> usize {
    dataset_size.next_power_of_two().clamp(MIN_AUTO_OUTPUT_DIM, MAX_AUTO_OUTPUT_DIM)
}

/// AdamW ramps weight decay up tenfold over training, other optimizers keep it flat.
fn auto_weight_decay(optimizer: &OptimizerArgs) -> (f64, f64) {
    let start = optimizer.weight_decay();
    match optimizer {
        OptimizerArgs::AdamW(_) => (start, start * 10.0),
        OptimizerArgs::Sgd(_) | OptimizerArgs::Lars(_) => (start, start),
    }
}

pub(super) fn transform_defaults() -> TransformArgs {
    TransformArgs {
        color_jitter: Some(ColorJitterArgs::default()),
        local_views: Some(LocalViewArgs::default()),
        ..TransformArgs::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::ScalingInfo;
    use crate::method::test_support::context;
    use crate::method::MethodKind;
    use crate::optim::OptimizerType;

    #[test]
    fn test_auto_fields_follow_scaling_and_optimizer() {
        let scaling = ScalingInfo { dataset_size: 3000, epochs: 100 };
        let optimizer = MethodKind::Dino.optimizer_defaults(OptimizerType::AdamW);
        let args = DinoArgs::default().resolve_auto(&context(&scaling, &optimizer, 384)).unwrap();
        assert_eq!(args.output_dim, Auto::Explicit(4096));
        assert_eq!(args.warmup_teacher_temp_epochs, Auto::Explicit(10));
        assert_eq!(args.weight_decay_start, Auto::Explicit(0.04));
        assert_eq!(args.weight_decay_end, Auto::Explicit(0.4));
    }

    #[test]
    fn test_sgd_keeps_weight_decay_flat() {
        let scaling = ScalingInfo { dataset_size: 10, epochs: 1000 };
        let optimizer = MethodKind::Dino.optimizer_defaults(OptimizerType::Sgd);
        let args = DinoArgs::default().resolve_auto(&context(&scaling, &optimizer, 384)).unwrap();
        assert_eq!(args.output_dim, Auto::Explicit(MIN_AUTO_OUTPUT_DIM));
        assert_eq!(args.warmup_teacher_temp_epochs, Auto::Explicit(MAX_AUTO_WARMUP_EPOCHS));
        assert_eq!(args.weight_decay_start, args.weight_decay_end);
    }

    #[test]
    fn test_bottleneck_larger_than_hidden() {
        let args = DinoArgs { hidden_dim: 128, bottleneck_dim: 256, ..DinoArgs::default() };
        assert!(args.check().unwrap_err().is_config_validation());
    }

    #[test]
    fn test_warmup_longer_than_training() {
        let scaling = ScalingInfo { dataset_size: 100, epochs: 5 };
        let optimizer = MethodKind::Dino.optimizer_defaults(OptimizerType::AdamW);
        let args = DinoArgs { warmup_teacher_temp_epochs: Auto::Explicit(6), ..DinoArgs::default() };
        assert!(args.resolve_auto(&context(&scaling, &optimizer, 384)).unwrap_err().is_resolution());
    }
}
