//! Image transform arguments.
//!
//! Pixel work happens in the external data pipeline. Here the per-method
//! defaults are merged with user overrides and validated, and the result is
//! handed to the dataset and to checkpoints (which record `normalize`).

use crate::args::{resolve_args, Args, ArgsInput};
use crate::error::{TrainingError, TrainingResult};
use crate::method::MethodKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizeArgs {
    pub mean: (f64, f64, f64),
    pub std: (f64, f64, f64),
}

impl Default for NormalizeArgs {
    fn default() -> Self {
        // ImageNet statistics.
        Self { mean: (0.485, 0.456, 0.406), std: (0.229, 0.224, 0.225) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RandomResizeArgs {
    pub min_scale: f64,
    pub max_scale: f64,
}

impl Default for RandomResizeArgs {
    fn default() -> Self {
        Self { min_scale: 0.08, max_scale: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RandomFlipArgs {
    pub horizontal_prob: f64,
    pub vertical_prob: f64,
}

impl Default for RandomFlipArgs {
    fn default() -> Self {
        Self { horizontal_prob: 0.5, vertical_prob: 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RandomRotationArgs {
    pub prob: f64,
    pub degrees: u32,
}

impl Default for RandomRotationArgs {
    fn default() -> Self {
        Self { prob: 0.0, degrees: 90 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColorJitterArgs {
    pub prob: f64,
    pub strength: f64,
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    pub hue: f64,
}

impl Default for ColorJitterArgs {
    fn default() -> Self {
        Self { prob: 0.8, strength: 1.0, brightness: 0.4, contrast: 0.4, saturation: 0.2, hue: 0.1 }
    }
}

/// Extra small crops used by multi-crop methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalViewArgs {
    pub num_views: usize,
    pub view_size: (u32, u32),
    pub random_resize: RandomResizeArgs,
}

impl Default for LocalViewArgs {
    fn default() -> Self {
        Self { num_views: 6, view_size: (96, 96), random_resize: RandomResizeArgs { min_scale: 0.05, max_scale: 0.14 } }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransformArgs {
    pub image_size: (u32, u32),
    pub random_resize: Option<RandomResizeArgs>,
    pub random_flip: Option<RandomFlipArgs>,
    pub random_rotation: Option<RandomRotationArgs>,
    pub random_gray_scale: Option<f64>,
    pub color_jitter: Option<ColorJitterArgs>,
    pub local_views: Option<LocalViewArgs>,
    pub normalize: NormalizeArgs,
}

impl Default for TransformArgs {
    fn default() -> Self {
        Self {
            image_size: (224, 224),
            random_resize: Some(RandomResizeArgs::default()),
            random_flip: Some(RandomFlipArgs::default()),
            random_rotation: None,
            random_gray_scale: Some(0.2),
            color_jitter: None,
            local_views: None,
            normalize: NormalizeArgs::default(),
        }
    }
}

impl Args for TransformArgs {
    const FIELD: &'static str = "transform_args";

    fn check(&self) -> TrainingResult<()> {
        check_size("transform_args.image_size", self.image_size)?;
        if let Some(resize) = &self.random_resize {
            check_resize("transform_args.random_resize", resize)?;
        }
        if let Some(flip) = &self.random_flip {
            check_prob("transform_args.random_flip.horizontal_prob", flip.horizontal_prob)?;
            check_prob("transform_args.random_flip.vertical_prob", flip.vertical_prob)?;
        }
        if let Some(rotation) = &self.random_rotation {
            check_prob("transform_args.random_rotation.prob", rotation.prob)?;
        }
        if let Some(prob) = self.random_gray_scale {
            check_prob("transform_args.random_gray_scale", prob)?;
        }
        if let Some(jitter) = &self.color_jitter {
            check_prob("transform_args.color_jitter.prob", jitter.prob)?;
            if jitter.strength < 0.0 {
                return Err(TrainingError::config("transform_args.color_jitter.strength", "must be >= 0"));
            }
        }
        if let Some(local) = &self.local_views {
            check_size("transform_args.local_views.view_size", local.view_size)?;
            check_resize("transform_args.local_views.random_resize", &local.random_resize)?;
        }
        let (s0, s1, s2) = self.normalize.std;
        if [s0, s1, s2].iter().any(|s| *s <= 0.0) {
            return Err(TrainingError::config("transform_args.normalize.std", "all values must be > 0"));
        }
        Ok(())
    }
}

fn check_prob(field: &str, value: f64) -> TrainingResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(TrainingError::config(field, format!("probability must be in [0, 1], got {value}")))
    }
}

fn check_size(field: &str, (h, w): (u32, u32)) -> TrainingResult<()> {
    if h == 0 || w == 0 {
        return Err(TrainingError::config(field, format!("must be positive, got ({h}, {w})")));
    }
    Ok(())
}

fn check_resize(field: &str, resize: &RandomResizeArgs) -> TrainingResult<()> {
    if resize.min_scale <= 0.0 || resize.max_scale > 1.0 || resize.min_scale > resize.max_scale {
        return Err(TrainingError::config(
            field,
            format!(
                "expected 0 < min_scale <= max_scale <= 1, got min_scale={} max_scale={}",
                resize.min_scale, resize.max_scale
            ),
        ));
    }
    Ok(())
}

/// Merge user overrides over the method's defaults.
pub fn get_transform_args(method: MethodKind, input: Option<ArgsInput<TransformArgs>>) -> TrainingResult<TransformArgs> {
    let args = resolve_args(&method.transform_defaults(), input)?;
    if args.local_views.is_some() && !method.supports_local_views() {
        return Err(TrainingError::config(
            "transform_args.local_views",
            format!("not supported by method `{method}`"),
        ));
    }
    Ok(args)
}

/// Transform handed to the dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodTransform {
    method: MethodKind,
    args: TransformArgs,
}

impl MethodTransform {
    #[must_use]
    pub fn new(method: MethodKind, args: TransformArgs) -> Self {
        Self { method, args }
    }

    #[must_use]
    pub fn method(&self) -> MethodKind {
        self.method
    }

    #[must_use]
    pub fn args(&self) -> &TransformArgs {
        &self.args
    }

    #[must_use]
    pub fn normalize(&self) -> &NormalizeArgs {
        &self.args.normalize
    }

    /// Views produced per image: the method's global views plus local crops.
    #[must_use]
    pub fn num_views(&self) -> usize {
        self.method.global_views() + self.args.local_views.as_ref().map_or(0, |l| l.num_views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn partial(value: serde_json::Value) -> Option<ArgsInput<TransformArgs>> {
        let serde_json::Value::Object(map) = value else { panic!("expected object") };
        Some(ArgsInput::Partial(map))
    }

    #[test]
    fn test_defaults_depend_on_method() {
        let distill = get_transform_args(MethodKind::Distillation, None).unwrap();
        let dino = get_transform_args(MethodKind::Dino, None).unwrap();
        assert!(distill.local_views.is_none());
        assert!(dino.local_views.is_some());
    }

    #[test]
    fn test_nested_override_keeps_siblings() {
        let args = get_transform_args(MethodKind::Simclr, partial(json!({"random_flip": {"vertical_prob": 0.5}}))).unwrap();
        let flip = args.random_flip.unwrap();
        assert_eq!(flip.vertical_prob, 0.5);
        assert_eq!(flip.horizontal_prob, 0.5);
    }

    #[test]
    fn test_invalid_probability_rejected() {
        let err = get_transform_args(MethodKind::Simclr, partial(json!({"random_gray_scale": 1.5}))).unwrap_err();
        assert!(matches!(err, TrainingError::ConfigValidation { ref field, .. } if field == "transform_args.random_gray_scale"));
    }

    #[test]
    fn test_local_views_rejected_for_distillation() {
        let err = get_transform_args(MethodKind::Distillation, partial(json!({"local_views": {"num_views": 2}}))).unwrap_err();
        assert!(err.is_config_validation());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut map = Map::new();
        map.insert("image_sise".to_string(), json!([1, 1]));
        let err = get_transform_args(MethodKind::Dino, Some(ArgsInput::Partial(map))).unwrap_err();
        assert!(err.is_config_validation());
    }

    #[test]
    fn test_num_views() {
        let args = get_transform_args(MethodKind::Dino, None).unwrap();
        let transform = MethodTransform::new(MethodKind::Dino, args);
        assert_eq!(transform.num_views(), 8);
    }
}
