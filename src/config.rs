//! Per-method thresholds and the default extension list.
//!
//! Built-in values can be overridden by a JSON file such as
//!
//! ```json
//! {
//!   "methods": { "phash": { "threshold": 6.0, "aspect_tolerance": 0.1 } },
//!   "extensions": [".jpg", ".jpeg", ".png"]
//! }
//! ```
//!
//! Methods missing from the file keep their built-in values.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::harvest::DEFAULT_EXTENSIONS;
use crate::core::matcher::MatchParams;
use crate::core::vision::Method;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown method `{name}` in {path}")]
    UnknownMethod { path: PathBuf, name: String },

    #[error("Negative {field} for {method} in {path}")]
    Negative {
        path: PathBuf,
        method: Method,
        field: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MethodDefaults {
    pub threshold: f64,
    pub aspect_tolerance: f64,
}

impl MethodDefaults {
    const fn new(threshold: f64, aspect_tolerance: f64) -> Self {
        Self {
            threshold,
            aspect_tolerance,
        }
    }

    fn builtin(method: Method) -> Self {
        match method {
            Method::PHash | Method::DHash | Method::AHash | Method::Blockhash => {
                Self::new(4.0, 0.2)
            }
            Method::Tiles => Self::new(0.04, 0.2),
            Method::Orb => Self::new(30.0, 0.2),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SettingsFile {
    methods: BTreeMap<String, MethodDefaults>,
    extensions: Option<Vec<String>>,
}

/// Effective settings after applying any config file.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub methods: BTreeMap<Method, MethodDefaults>,
    pub extensions: Vec<String>,
    /// File the overrides came from, if any.
    pub source: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            methods: Method::ALL
                .into_iter()
                .map(|m| (m, MethodDefaults::builtin(m)))
                .collect(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            source: None,
        }
    }
}

/// `<config_dir>/simcull/config.json`, when the platform has a config dir.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("simcull").join("config.json"))
}

impl Settings {
    /// Load settings. An explicit path must exist; the default location is
    /// optional and silently skipped when absent.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_path().filter(|p| p.is_file()) {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: SettingsFile =
            serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut settings = Self::default();
        for (name, values) in file.methods {
            let method =
                Method::from_str(&name, true).map_err(|_| ConfigError::UnknownMethod {
                    path: path.to_path_buf(),
                    name: name.clone(),
                })?;
            for (field, value) in [
                ("threshold", values.threshold),
                ("aspect_tolerance", values.aspect_tolerance),
            ] {
                if value < 0.0 {
                    return Err(ConfigError::Negative {
                        path: path.to_path_buf(),
                        method,
                        field,
                    });
                }
            }
            settings.methods.insert(method, values);
        }
        if let Some(extensions) = file.extensions {
            settings.extensions = extensions;
        }
        settings.source = Some(path.to_path_buf());

        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn defaults_for(&self, method: Method) -> MethodDefaults {
        self.methods
            .get(&method)
            .copied()
            .unwrap_or_else(|| MethodDefaults::builtin(method))
    }

    /// Thresholds for a run; each override replaces one table value.
    pub fn params_for(
        &self,
        method: Method,
        threshold: Option<f64>,
        aspect_tolerance: Option<f64>,
    ) -> MatchParams {
        let defaults = self.defaults_for(method);
        MatchParams {
            threshold: threshold.unwrap_or(defaults.threshold),
            aspect_tolerance: aspect_tolerance.unwrap_or(defaults.aspect_tolerance),
        }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(path) => writeln!(f, "Settings from {}", path.display())?,
            None => writeln!(f, "Built-in settings")?,
        }
        writeln!(
            f,
            "{:<10} {:>10} {:>12}  scale",
            "method", "threshold", "aspect tol"
        )?;
        for (method, values) in &self.methods {
            writeln!(
                f,
                "{:<10} {:>10} {:>12}  {}",
                method.to_string(),
                values.threshold,
                values.aspect_tolerance,
                method.scale()
            )?;
        }
        write!(f, "extensions: {}", self.extensions.join(" "))
    }
}
