//! Model loader and model handle contracts.
//!
//! A [`ModelRef`] is the only description of a model that crosses a process
//! boundary. Each worker turns it into its own [`ModelHandle`] through a
//! [`ModelLoader`]; handles are never shared, serialized or moved between
//! workers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, LoadError, SimulateError};
use crate::outcome::RawOutcome;
use crate::platform::PlatformKey;
use crate::request::SimulationRequest;

/// Serializable reference to a simulatable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    /// Model identifier, usually a path to an `.fmu` file.
    pub path: PathBuf,
    /// Loader options, passed through uninterpreted.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl ModelRef {
    /// Creates a reference without options.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: BTreeMap::new(),
        }
    }

    /// Adds a loader option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Locates `<base>/<platform dir>/<name>.fmu`.
    pub fn locate(base: &Path, name: &str, platform: &PlatformKey) -> Result<Self, ConfigurationError> {
        let path = base.join(platform.directory()?).join(format!("{name}.fmu"));
        if !path.is_file() {
            return Err(ConfigurationError::ModelNotAvailable {
                path: path.display().to_string(),
                platform: platform.to_string(),
            });
        }
        Ok(Self::new(path))
    }

    /// File stem of the model path.
    #[must_use]
    pub fn stem(&self) -> Option<&str> {
        self.path.file_stem().and_then(|s| s.to_str())
    }

    /// Boolean loader option; absent or non-boolean values read as `false`.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.options
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    pub(crate) fn load_error(&self, message: impl Into<String>) -> LoadError {
        LoadError {
            path: self.path.display().to_string(),
            message: message.into(),
        }
    }
}

/// A loaded, stateful model instance.
///
/// Implementations need not be thread-safe: a handle is owned by exactly one
/// worker and used sequentially.
pub trait ModelHandle {
    /// Names of all model variables.
    fn variables(&self) -> Vec<String>;

    /// Resets the model, applies the request and simulates it.
    fn simulate(&mut self, request: &SimulationRequest) -> Result<RawOutcome, SimulateError>;
}

/// Produces model handles inside a worker process.
pub trait ModelLoader {
    /// Loads a fresh handle for `model`.
    fn load(&self, model: &ModelRef, platform: &PlatformKey) -> Result<Box<dyn ModelHandle>, LoadError>;
}

impl<F> ModelLoader for F
where
    F: Fn(&ModelRef, &PlatformKey) -> Result<Box<dyn ModelHandle>, LoadError>,
{
    fn load(&self, model: &ModelRef, platform: &PlatformKey) -> Result<Box<dyn ModelHandle>, LoadError> {
        self(model, platform)
    }
}
