//! Self-supervised methods and their argument schemas.

pub mod dino;
pub mod distillation;
pub mod instance;
pub mod simclr;

use crate::args::{merge_json, parse_field, Args, ArgsInput};
use crate::dataset::ScalingInfo;
use crate::error::{TrainingError, TrainingResult};
use crate::optim::{AdamWArgs, LarsArgs, OptimizerArgs, OptimizerType, SgdArgs};
use crate::transform::TransformArgs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use dino::DinoArgs;
pub use distillation::DistillationArgs;
pub use instance::MethodInstance;
pub use simclr::SimclrArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    Distillation,
    Dino,
    Simclr,
}

impl MethodKind {
    pub const ALL: [MethodKind; 3] = [Self::Distillation, Self::Dino, Self::Simclr];

    pub fn from_name(name: &str) -> TrainingResult<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == name).ok_or_else(|| {
            let available: Vec<&str> = Self::ALL.iter().map(|m| m.as_str()).collect();
            TrainingError::resolution(format!("unknown method `{name}`, available methods: {}", available.join(", ")))
        })
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Distillation => "distillation",
            Self::Dino => "dino",
            Self::Simclr => "simclr",
        }
    }

    #[must_use]
    pub fn transform_defaults(self) -> TransformArgs {
        match self {
            Self::Distillation => distillation::transform_defaults(),
            Self::Dino => dino::transform_defaults(),
            Self::Simclr => simclr::transform_defaults(),
        }
    }

    #[must_use]
    pub fn supports_local_views(self) -> bool {
        matches!(self, Self::Dino)
    }

    /// Full-size views per image.
    #[must_use]
    pub fn global_views(self) -> usize {
        match self {
            Self::Distillation => 1,
            Self::Dino | Self::Simclr => 2,
        }
    }

    #[must_use]
    pub fn default_optimizer(self) -> OptimizerType {
        match self {
            Self::Distillation | Self::Simclr => OptimizerType::Lars,
            Self::Dino => OptimizerType::AdamW,
        }
    }

    #[must_use]
    pub fn supported_optimizers(self) -> &'static [OptimizerType] {
        match self {
            Self::Distillation => &[OptimizerType::Lars],
            Self::Dino => &[OptimizerType::AdamW, OptimizerType::Sgd],
            Self::Simclr => &[OptimizerType::Lars, OptimizerType::Sgd, OptimizerType::AdamW],
        }
    }

    /// Method-specific defaults for `optimizer_type`.
    #[must_use]
    pub fn optimizer_defaults(self, optimizer_type: OptimizerType) -> OptimizerArgs {
        match (self, optimizer_type) {
            (Self::Distillation, OptimizerType::Lars) => {
                OptimizerArgs::Lars(LarsArgs { lr: 1.8, weight_decay: 1e-6, ..LarsArgs::default() })
            }
            (Self::Dino, OptimizerType::AdamW) => {
                OptimizerArgs::AdamW(AdamWArgs { lr: 5e-4, weight_decay: 0.04, ..AdamWArgs::default() })
            }
            (Self::Dino, OptimizerType::Sgd) => {
                OptimizerArgs::Sgd(SgdArgs { lr: 0.03, weight_decay: 1e-4, ..SgdArgs::default() })
            }
            (_, OptimizerType::Lars) => OptimizerArgs::Lars(LarsArgs::default()),
            (_, OptimizerType::Sgd) => OptimizerArgs::Sgd(SgdArgs { lr: 0.06, weight_decay: 5e-4, ..SgdArgs::default() }),
            (_, OptimizerType::AdamW) => OptimizerArgs::AdamW(AdamWArgs::default()),
        }
    }

    /// Batch size the default learning rates are tuned for.
    #[must_use]
    pub fn reference_batch_size(self) -> usize {
        256
    }
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs method args may depend on.
#[derive(Debug, Clone, Copy)]
pub struct MethodArgsContext<'a> {
    pub scaling: &'a ScalingInfo,
    pub optimizer: &'a OptimizerArgs,
    /// Feature dimension of the underlying model.
    pub feature_dim: usize,
    /// Output dimension of the embedding model.
    pub embed_dim: usize,
}

/// Resolved method arguments, one variant per method.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MethodArgs {
    Distillation(DistillationArgs),
    Dino(DinoArgs),
    Simclr(SimclrArgs),
}

impl MethodArgs {
    #[must_use]
    pub fn method(&self) -> MethodKind {
        match self {
            Self::Distillation(_) => MethodKind::Distillation,
            Self::Dino(_) => MethodKind::Dino,
            Self::Simclr(_) => MethodKind::Simclr,
        }
    }
}

/// Merge `overrides` over `T::default()` and parse strictly.
fn partial_args<T: Args + Default>(overrides: Map<String, Value>) -> TrainingResult<T> {
    let mut merged = serde_json::to_value(T::default())?;
    merge_json(&mut merged, &Value::Object(overrides));
    parse_field(T::FIELD, merged)
}

fn method_mismatch(args: &MethodArgs, method: MethodKind) -> TrainingError {
    TrainingError::resolution(format!(
        "method_args are for method `{}` but the method is `{method}`",
        args.method()
    ))
}

/// Resolve the args of `method`, filling every `auto` field from `ctx` and
/// enforcing the method's constraints.
pub fn get_method_args(
    method: MethodKind,
    input: Option<ArgsInput<MethodArgs>>,
    ctx: &MethodArgsContext<'_>,
) -> TrainingResult<MethodArgs> {
    let resolved = match method {
        MethodKind::Distillation => {
            let args = match input {
                None => DistillationArgs::default(),
                Some(ArgsInput::Partial(map)) => partial_args(map)?,
                Some(ArgsInput::Typed(MethodArgs::Distillation(args))) => args,
                Some(ArgsInput::Typed(other)) => return Err(method_mismatch(&other, method)),
            };
            MethodArgs::Distillation(args.resolve_auto(ctx)?)
        }
        MethodKind::Dino => {
            let args = match input {
                None => DinoArgs::default(),
                Some(ArgsInput::Partial(map)) => partial_args(map)?,
                Some(ArgsInput::Typed(MethodArgs::Dino(args))) => args,
                Some(ArgsInput::Typed(other)) => return Err(method_mismatch(&other, method)),
            };
            MethodArgs::Dino(args.resolve_auto(ctx)?)
        }
        MethodKind::Simclr => {
            let args = match input {
                None => SimclrArgs::default(),
                Some(ArgsInput::Partial(map)) => partial_args(map)?,
                Some(ArgsInput::Typed(MethodArgs::Simclr(args))) => args,
                Some(ArgsInput::Typed(other)) => return Err(method_mismatch(&other, method)),
            };
            MethodArgs::Simclr(args.resolve_auto(ctx)?)
        }
    };
    Ok(resolved)
}
