//! Named CLI profiles, each pointing at one sync target.
//!
//! Stored as JSON under the platform config directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CliError;

const CONFIG_FILE_NAME: &str = "profiles.json";
const DEFAULT_PROFILE: &str = "default";

pub const ENV_PROFILE: &str = "LOAM_PROFILE";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfilesConfig {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[serde(default)]
    pub active_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, CliProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CliProfile {
    /// Sync target URI
    #[serde(default)]
    pub target: Option<String>,
}

const fn default_config_version() -> u32 {
    1
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("loam")
        .join(CONFIG_FILE_NAME)
}

pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    loam_core::util::normalize_text_option(value)
}

pub fn normalize_profile_name(value: Option<&str>) -> Option<String> {
    normalize_text_option(value.map(ToString::to_string))
}

fn config_error(action: &str, path: &Path, error: impl std::fmt::Display) -> CliError {
    CliError::Config(format!("{action} {}: {error}", path.display()))
}

impl CliProfilesConfig {
    pub fn load() -> Result<Self, CliError> {
        Self::load_from_path(&default_config_path())
    }

    /// A missing file is an empty configuration
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(error) => return Err(config_error("cannot read", path, error)),
        };
        let config: Self =
            serde_json::from_str(&raw).map_err(|error| config_error("cannot parse", path, error))?;
        Ok(config.normalized())
    }

    pub fn save(&self) -> Result<PathBuf, CliError> {
        let path = default_config_path();
        self.save_to_path(&path)?;
        Ok(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), CliError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|error| config_error("cannot create", dir, error))?;
        }
        let json = serde_json::to_string_pretty(&self.clone().normalized())?;
        std::fs::write(path, json).map_err(|error| config_error("cannot write", path, error))?;
        tracing::debug!(path = %path.display(), "Saved CLI profiles");
        Ok(())
    }

    /// Explicit name, then `LOAM_PROFILE`, then the active profile, then "default"
    pub fn resolve_profile_name(&self, explicit: Option<&str>) -> String {
        self.resolve_profile_name_with(explicit, std::env::var(ENV_PROFILE).ok().as_deref())
    }

    fn resolve_profile_name_with(&self, explicit: Option<&str>, from_env: Option<&str>) -> String {
        [explicit, from_env, self.active_profile.as_deref()]
            .into_iter()
            .find_map(normalize_profile_name)
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string())
    }

    pub fn profile(&self, name: &str) -> Option<&CliProfile> {
        self.profiles.get(name)
    }

    pub fn profile_mut_or_default(&mut self, name: &str) -> &mut CliProfile {
        self.profiles.entry(name.to_string()).or_default()
    }

    fn normalized(mut self) -> Self {
        self.active_profile = normalize_profile_name(self.active_profile.as_deref());
        for profile in self.profiles.values_mut() {
            profile.target = normalize_text_option(profile.target.take());
        }
        self
    }
}

impl CliProfile {
    pub fn target(&self) -> Option<String> {
        normalize_text_option(self.target.clone())
    }
}
