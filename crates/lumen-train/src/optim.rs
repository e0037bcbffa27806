//! Optimizer selection and arguments.

use crate::args::{merge_json, parse_field, ArgsInput};
use crate::auto::Auto;
use crate::error::{TrainingError, TrainingResult};
use crate::method::MethodKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    AdamW,
    Sgd,
    Lars,
}

impl OptimizerType {
    pub const ALL: [OptimizerType; 3] = [Self::AdamW, Self::Sgd, Self::Lars];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdamW => "adamw",
            Self::Sgd => "sgd",
            Self::Lars => "lars",
        }
    }
}

impl std::fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdamWArgs {
    pub lr: f64,
    pub betas: (f64, f64),
    pub weight_decay: f64,
}

impl Default for AdamWArgs {
    fn default() -> Self {
        Self { lr: 1e-3, betas: (0.9, 0.999), weight_decay: 1e-2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SgdArgs {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for SgdArgs {
    fn default() -> Self {
        Self { lr: 1e-3, momentum: 0.9, weight_decay: 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LarsArgs {
    pub lr: f64,
    pub momentum: f64,
    pub dampening: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
    pub trust_coefficient: f64,
    pub eps: f64,
}

impl Default for LarsArgs {
    fn default() -> Self {
        Self { lr: 0.3, momentum: 0.9, dampening: 0.0, weight_decay: 1e-6, nesterov: false, trust_coefficient: 1e-3, eps: 1e-8 }
    }
}

/// Resolved optimizer arguments. The variant is the optimizer type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OptimizerArgs {
    AdamW(AdamWArgs),
    Sgd(SgdArgs),
    Lars(LarsArgs),
}

impl OptimizerArgs {
    #[must_use]
    pub fn optimizer_type(&self) -> OptimizerType {
        match self {
            Self::AdamW(_) => OptimizerType::AdamW,
            Self::Sgd(_) => OptimizerType::Sgd,
            Self::Lars(_) => OptimizerType::Lars,
        }
    }

    #[must_use]
    pub fn lr(&self) -> f64 {
        match self {
            Self::AdamW(a) => a.lr,
            Self::Sgd(a) => a.lr,
            Self::Lars(a) => a.lr,
        }
    }

    #[must_use]
    pub fn weight_decay(&self) -> f64 {
        match self {
            Self::AdamW(a) => a.weight_decay,
            Self::Sgd(a) => a.weight_decay,
            Self::Lars(a) => a.weight_decay,
        }
    }

    fn from_value(optimizer_type: OptimizerType, value: Value) -> TrainingResult<Self> {
        Ok(match optimizer_type {
            OptimizerType::AdamW => Self::AdamW(parse_field("optim_args", value)?),
            OptimizerType::Sgd => Self::Sgd(parse_field("optim_args", value)?),
            OptimizerType::Lars => Self::Lars(parse_field("optim_args", value)?),
        })
    }

    pub fn check(&self) -> TrainingResult<()> {
        let lr = self.lr();
        if !lr.is_finite() || lr <= 0.0 {
            return Err(TrainingError::config("optim_args.lr", format!("must be > 0, got {lr}")));
        }
        if self.weight_decay() < 0.0 {
            return Err(TrainingError::config("optim_args.weight_decay", "must be >= 0"));
        }
        let momentum = match self {
            Self::AdamW(a) => {
                let (b1, b2) = a.betas;
                if !(0.0..1.0).contains(&b1) || !(0.0..1.0).contains(&b2) {
                    return Err(TrainingError::config("optim_args.betas", "both values must be in [0, 1)"));
                }
                None
            }
            Self::Sgd(a) => Some(a.momentum),
            Self::Lars(a) => Some(a.momentum),
        };
        if let Some(momentum) = momentum {
            if !(0.0..=1.0).contains(&momentum) {
                return Err(TrainingError::config("optim_args.momentum", "must be in [0, 1]"));
            }
        }
        Ok(())
    }
}

/// Resolve the optimizer type and its arguments for `method`.
///
/// `auto` picks the method's default optimizer. User values override the
/// method's defaults for that optimizer key by key.
pub fn get_optimizer_args(
    optim: &Auto<OptimizerType>,
    input: Option<ArgsInput<OptimizerArgs>>,
    method: MethodKind,
) -> TrainingResult<OptimizerArgs> {
    let optimizer_type = optim.explicit().copied().unwrap_or_else(|| method.default_optimizer());
    if !method.supported_optimizers().contains(&optimizer_type) {
        let supported: Vec<&str> = method.supported_optimizers().iter().map(|o| o.as_str()).collect();
        return Err(TrainingError::resolution(format!(
            "optimizer `{optimizer_type}` is not supported by method `{method}`, supported: {}",
            supported.join(", ")
        )));
    }

    let defaults = method.optimizer_defaults(optimizer_type);
    let args = match input {
        None => defaults,
        Some(ArgsInput::Typed(args)) => {
            if args.optimizer_type() != optimizer_type {
                return Err(TrainingError::resolution(format!(
                    "optim_args are for `{}` but the optimizer is `{optimizer_type}`",
                    args.optimizer_type()
                )));
            }
            args
        }
        Some(ArgsInput::Partial(overrides)) => {
            let mut merged = serde_json::to_value(&defaults)?;
            merge_json(&mut merged, &Value::Object(overrides));
            OptimizerArgs::from_value(optimizer_type, merged)?
        }
    };
    args.check()?;
    Ok(args)
}
