use super::MethodArgsContext;
use crate::args::Args;
use crate::auto::Auto;
use crate::error::{TrainingError, TrainingResult};
use crate::transform::{ColorJitterArgs, TransformArgs};
use serde::{Deserialize, Serialize};

pub const DEFAULT_OUTPUT_DIM: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimclrArgs {
    /// Projection head width. `auto` uses the embedding dimension.
    pub hidden_dim: Auto<usize>,
    /// `auto` is [`DEFAULT_OUTPUT_DIM`] capped at the hidden width.
    pub output_dim: Auto<usize>,
    pub num_layers: usize,
    pub batch_norm: bool,
    pub temperature: f64,
}

impl Default for SimclrArgs {
    fn default() -> Self {
        Self { hidden_dim: Auto::Auto, output_dim: Auto::Auto, num_layers: 2, batch_norm: true, temperature: 0.1 }
    }
}

impl Args for SimclrArgs {
    const FIELD: &'static str = "method_args";

    fn check(&self) -> TrainingResult<()> {
        if self.hidden_dim.explicit() == Some(&0) {
            return Err(TrainingError::config("method_args.hidden_dim", "must be >= 1"));
        }
        if self.output_dim.explicit() == Some(&0) {
            return Err(TrainingError::config("method_args.output_dim", "must be >= 1"));
        }
        if self.num_layers == 0 {
            return Err(TrainingError::config("method_args.num_layers", "must be >= 1"));
        }
        if self.temperature <= 0.0 {
            return Err(TrainingError::config("method_args.temperature", "must be > 0"));
        }
        Ok(())
    }
}

impl SimclrArgs {
    pub(crate) fn resolve_auto(self, ctx: &MethodArgsContext<'_>) -> TrainingResult<Self> {
        self.check()?;
        let hidden_dim = self.hidden_dim.resolve_with(|| ctx.embed_dim);
        let output_dim = match self.output_dim {
            Auto::Auto => DEFAULT_OUTPUT_DIM.min(hidden_dim),
            Auto::Explicit(output_dim) if output_dim > hidden_dim => {
                return Err(TrainingError::resolution(format!(
                    "simclr output_dim ({output_dim}) must not exceed hidden_dim ({hidden_dim})"
                )));
            }
            Auto::Explicit(output_dim) => output_dim,
        };
        Ok(Self { hidden_dim: Auto::Explicit(hidden_dim), output_dim: Auto::Explicit(output_dim), ..self })
    }
}

pub(super) fn transform_defaults() -> TransformArgs {
    TransformArgs { color_jitter: Some(ColorJitterArgs::default()), ..TransformArgs::default() }
}
