//! Model packages: named families of architectures that know how to build,
//! wrap and export their models.

use super::reference::ReferencePackage;
use super::{Module, ModelSource, ModelWrapper, StateDict};
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

pub const CUSTOM_PACKAGE_NAME: &str = "custom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFormat {
    /// The package's own on-disk format.
    PackageDefault,
    /// Bare weight map, independent of the package.
    StateDict,
}

/// On-disk export document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedModel {
    pub package: String,
    pub architecture: String,
    pub format: ModelFormat,
    pub feature_dim: usize,
    pub state_dict: StateDict,
}

pub trait Package: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fully qualified names (`<package>/<model>`) this package can build.
    fn list_model_names(&self) -> Vec<String>;

    fn is_supported_model(&self, model: &dyn Module) -> bool;

    /// Build a model from its name without the package prefix.
    fn get_model(&self, model_name: &str, model_args: Option<&Map<String, Value>>) -> TrainingResult<Arc<dyn Module>>;

    fn get_model_wrapper(&self, model: Arc<dyn Module>) -> TrainingResult<Arc<dyn ModelWrapper>>;

    fn export_model(&self, model: &dyn ModelWrapper, out: &Path, format: ModelFormat) -> TrainingResult<()>;
}

/// Serialise `model` to `out` as an [`ExportedModel`] document.
pub fn write_export(package: &str, model: &dyn ModelWrapper, out: &Path, format: ModelFormat) -> TrainingResult<()> {
    let module = model.model();
    let doc = ExportedModel {
        package: package.to_string(),
        architecture: module.architecture().to_string(),
        format,
        feature_dim: model.feature_dim(),
        state_dict: module.state_dict()?,
    };

    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = match format {
        ModelFormat::PackageDefault => serde_json::to_vec(&doc)?,
        ModelFormat::StateDict => serde_json::to_vec(&doc.state_dict)?,
    };
    std::fs::write(out, bytes)?;
    debug!(path = %out.display(), package, "exported model");
    Ok(())
}

/// Fallback for user-provided wrappers no registered package recognises.
#[derive(Debug, Default)]
pub struct CustomPackage;

impl Package for CustomPackage {
    fn name(&self) -> &'static str {
        CUSTOM_PACKAGE_NAME
    }

    fn list_model_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_supported_model(&self, _model: &dyn Module) -> bool {
        false
    }

    fn get_model(&self, model_name: &str, _model_args: Option<&Map<String, Value>>) -> TrainingResult<Arc<dyn Module>> {
        Err(TrainingError::resolution(format!(
            "package `{CUSTOM_PACKAGE_NAME}` cannot build models by name (`{model_name}`), pass a model wrapper instead"
        )))
    }

    fn get_model_wrapper(&self, model: Arc<dyn Module>) -> TrainingResult<Arc<dyn ModelWrapper>> {
        Err(TrainingError::resolution(format!(
            "package `{CUSTOM_PACKAGE_NAME}` cannot wrap bare modules (`{}`), pass a model wrapper instead",
            model.architecture()
        )))
    }

    fn export_model(&self, model: &dyn ModelWrapper, out: &Path, format: ModelFormat) -> TrainingResult<()> {
        write_export(CUSTOM_PACKAGE_NAME, model, out, format)
    }
}

/// Registered packages, searched in registration order.
#[derive(Clone)]
pub struct PackageRegistry {
    packages: Vec<Arc<dyn Package>>,
    custom: Arc<dyn Package>,
}

impl Default for PackageRegistry {
    fn default() -> Self {
        Self::new().with_package(Arc::new(ReferencePackage))
    }
}

impl PackageRegistry {
    /// Registry with no named packages, only the custom fallback.
    #[must_use]
    pub fn new() -> Self {
        Self { packages: Vec::new(), custom: Arc::new(CustomPackage) }
    }

    #[must_use]
    pub fn with_package(mut self, package: Arc<dyn Package>) -> Self {
        self.packages.push(package);
        self
    }

    #[must_use]
    pub fn list_model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.packages.iter().flat_map(|p| p.list_model_names()).collect();
        names.sort();
        names
    }

    pub fn get_package(&self, name: &str) -> TrainingResult<Arc<dyn Package>> {
        self.packages.iter().find(|p| p.name() == name).cloned().ok_or_else(|| {
            let available: Vec<&str> = self.packages.iter().map(|p| p.name()).collect();
            TrainingError::resolution(format!(
                "unknown model package `{name}`, available packages: {}",
                available.join(", ")
            ))
        })
    }

    /// Resolve any [`ModelSource`] into a wrapper, dispatching on the variant.
    pub fn get_wrapped_model(
        &self,
        model: &ModelSource,
        model_args: Option<&Map<String, Value>>,
    ) -> TrainingResult<Arc<dyn ModelWrapper>> {
        match model {
            ModelSource::Name(name) => self.wrapped_model_from_name(name, model_args),
            ModelSource::Module(module) => {
                reject_model_args(model_args, "a model instance")?;
                self.wrapped_model_from_module(module.clone())
            }
            ModelSource::Wrapper(wrapper) => {
                reject_model_args(model_args, "a model wrapper")?;
                Ok(wrapper.clone())
            }
        }
    }

    fn wrapped_model_from_name(
        &self,
        name: &str,
        model_args: Option<&Map<String, Value>>,
    ) -> TrainingResult<Arc<dyn ModelWrapper>> {
        let Some((package_name, model_name)) = name.split_once('/') else {
            return Err(TrainingError::resolution(format!(
                "model name `{name}` must have the format `<package>/<model>`"
            )));
        };
        let package = self.get_package(package_name)?;
        let module = package.get_model(model_name, model_args)?;
        package.get_model_wrapper(module)
    }

    fn wrapped_model_from_module(&self, module: Arc<dyn Module>) -> TrainingResult<Arc<dyn ModelWrapper>> {
        let package = self
            .packages
            .iter()
            .find(|p| p.is_supported_model(module.as_ref()))
            .ok_or_else(|| {
                TrainingError::resolution(format!(
                    "no registered package supports model `{}`",
                    module.architecture()
                ))
            })?;
        package.get_model_wrapper(module)
    }

    /// Package responsible for exporting `model`.
    ///
    /// Falls back to the custom package when `fallback_custom` is set and no
    /// registered package recognises the underlying module.
    pub fn get_package_from_model(
        &self,
        model: &dyn ModelWrapper,
        fallback_custom: bool,
    ) -> TrainingResult<Arc<dyn Package>> {
        let module = model.model();
        if let Some(package) = self.packages.iter().find(|p| p.is_supported_model(module.as_ref())) {
            return Ok(package.clone());
        }
        if fallback_custom {
            return Ok(self.custom.clone());
        }
        Err(TrainingError::resolution(format!(
            "no registered package supports model `{}`",
            module.architecture()
        )))
    }
}

fn reject_model_args(model_args: Option<&Map<String, Value>>, what: &str) -> TrainingResult<()> {
    match model_args {
        Some(args) if !args.is_empty() => {
            Err(TrainingError::config("model_args", format!("cannot be used when passing {what}")))
        }
        _ => Ok(()),
    }
}
