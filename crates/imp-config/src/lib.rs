//! TOML configuration loading for the IMP exec driver.
//!
//! Configuration lives in a directory of `*.toml` fragments matched by a
//! glob pattern (by default the build tree's `imp.conf.d`, overridable
//! with `FLUX_IMP_CONFIG_PATTERN`), mirroring the original's config
//! pattern lookup. Fragments are merged by table: a later file's keys
//! overwrite an earlier file's for the same table.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_PATTERN_ENV: &str = "FLUX_IMP_CONFIG_PATTERN";
const DEFAULT_CONFIG_PATTERN: &str = "/etc/flux/imp/conf.d/*.toml";

/// Test-only sentinel accepted in place of a positive `max_ttl`.
pub const MAX_TTL_UNLIMITED_SENTINEL: i64 = -100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid glob pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("no config files matched pattern {0:?}")]
    NoFilesMatched(String),
    #[error("no config file matching {0:?} defines a [sign] table")]
    MissingSignTable(String),
    #[error("sign.max-ttl must be greater than zero (or {MAX_TTL_UNLIMITED_SENTINEL} for test builds), got {0}")]
    InvalidMaxTtl(i64),
    #[error("sign.default-type {0:?} is not present in sign.allowed-types")]
    DefaultTypeNotAllowed(String),
    #[error("sign.allowed-types must not be empty")]
    EmptyAllowedTypes,
    #[error("sign.allowed-types names an unregistered mechanism {0:?}")]
    UnknownMechanism(String),
}

/// Exec-side authorization policy: who may invoke the IMP, as whom, and
/// under what shells.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ExecConfig {
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub allowed_shells: Vec<String>,
    #[serde(default)]
    pub allow_unprivileged_exec: bool,
    #[serde(default)]
    pub pam_support: bool,
}

/// Signing-side policy: the token's maximum time-to-live, the mechanism
/// used when the caller doesn't pick one, and the mechanisms a token may
/// legally claim at a trust boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct SignConfig {
    #[serde(rename = "max-ttl")]
    pub max_ttl: i64,
    #[serde(rename = "default-type")]
    pub default_type: String,
    #[serde(rename = "allowed-types")]
    pub allowed_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFragment {
    #[serde(default)]
    exec: Option<ExecConfig>,
    #[serde(default)]
    sign: Option<SignConfig>,
}

/// The IMP's fully merged and validated configuration.
#[derive(Debug, Clone)]
pub struct ImpConfig {
    pub exec: ExecConfig,
    pub sign: SignConfig,
}

impl ImpConfig {
    /// Load and merge every `*.toml` file matching `pattern`, then
    /// validate against `known_mechanisms` (the mechanism registry's
    /// registered names — passed in rather than imported, so this crate
    /// doesn't need to depend on the signing crate just to validate a
    /// string). Later files (in glob match order) override earlier ones.
    pub fn load(pattern: &str, known_mechanisms: &[&str]) -> Result<ImpConfig, ConfigError> {
        let paths = glob::glob(pattern).map_err(|source| ConfigError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;

        let mut exec: Option<ExecConfig> = None;
        let mut sign: Option<SignConfig> = None;
        let mut any_file = false;

        for entry in paths {
            let path = entry.map_err(|e| ConfigError::Read {
                path: e.path().to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;
            any_file = true;
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let fragment: ConfigFragment =
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;
            if let Some(e) = fragment.exec {
                exec = Some(e);
            }
            if let Some(s) = fragment.sign {
                sign = Some(s);
            }
        }

        if !any_file {
            return Err(ConfigError::NoFilesMatched(pattern.to_string()));
        }

        let config = ImpConfig {
            exec: exec.unwrap_or_default(),
            sign: sign.ok_or_else(|| ConfigError::MissingSignTable(pattern.to_string()))?,
        };
        config.validate(known_mechanisms)?;
        Ok(config)
    }

    /// Load from the pattern named by `FLUX_IMP_CONFIG_PATTERN`, falling
    /// back to the built-in default pattern.
    pub fn load_from_env(known_mechanisms: &[&str]) -> Result<ImpConfig, ConfigError> {
        let pattern =
            std::env::var(CONFIG_PATTERN_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATTERN.to_string());
        Self::load(&pattern, known_mechanisms)
    }

    fn validate(&self, known_mechanisms: &[&str]) -> Result<(), ConfigError> {
        if self.sign.max_ttl <= 0 && self.sign.max_ttl != MAX_TTL_UNLIMITED_SENTINEL {
            return Err(ConfigError::InvalidMaxTtl(self.sign.max_ttl));
        }
        if self.sign.allowed_types.is_empty() {
            return Err(ConfigError::EmptyAllowedTypes);
        }
        for name in &self.sign.allowed_types {
            if !known_mechanisms.contains(&name.as_str()) {
                return Err(ConfigError::UnknownMechanism(name.clone()));
            }
        }
        if !known_mechanisms.contains(&self.sign.default_type.as_str()) {
            return Err(ConfigError::UnknownMechanism(self.sign.default_type.clone()));
        }
        if !self.sign.allowed_types.contains(&self.sign.default_type) {
            return Err(ConfigError::DefaultTypeNotAllowed(
                self.sign.default_type.clone(),
            ));
        }
        Ok(())
    }
}
