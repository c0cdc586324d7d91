//! Named environment overlays for running one service definition in several
//! ways.

use super::Result;
use crate::environment::Environment;
use eyre::WrapErr;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

pub const VARIANTS_FILE: &str = "variants.yml";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VariantError {
    #[error("default variant is undefined")]
    UndefinedDefault,
    #[error("variant {name:?} is not defined")]
    NotFound { name: String },
}

/// Contents of a `variants.yml` file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariantsFile {
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub variants: BTreeMap<String, Environment>,
}

impl VariantsFile {
    /// Reads `variants.yml` from `dir`. A missing file yields `None`.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(VARIANTS_FILE);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).wrap_err_with(|| format!("can't read variants file {}", path.display())),
        };
        let file = serde_yaml::from_slice(&content)
            .wrap_err_with(|| format!("can't parse variants file {}", path.display()))?;
        Ok(Some(file))
    }

    /// Picks `selected`, or the default variant when no selection is given.
    pub fn resolve(&self, selected: Option<&str>) -> Result<ServiceVariant> {
        if self.default.is_empty() {
            return Err(VariantError::UndefinedDefault.into());
        }
        let name = selected.filter(|s| !s.is_empty()).unwrap_or(&self.default);
        let env = self
            .variants
            .get(name)
            .ok_or_else(|| VariantError::NotFound { name: name.to_string() })?;
        Ok(ServiceVariant {
            name: name.to_string(),
            env: env.clone(),
        })
    }
}

/// The variant chosen for a run. Inactive when its name is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceVariant {
    pub name: String,
    pub env: Environment,
}

impl ServiceVariant {
    pub fn is_active(&self) -> bool {
        !self.name.is_empty()
    }
}

impl fmt::Display for ServiceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (env: {})", self.name, self.env)
    }
}

/// Resolves the variant for a run from the variants file in `dir`, if any.
pub fn resolve(dir: &Path, selected: Option<&str>) -> Result<ServiceVariant> {
    match VariantsFile::load(dir)? {
        Some(file) => file.resolve(selected),
        None => Ok(ServiceVariant::default()),
    }
}
