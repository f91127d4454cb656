//! Configuration for the flow decoder.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Errors raised while constructing a decoder. All of them are fatal: a
/// decoder with a broken configuration or unloadable field definitions is
/// never built.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read field definitions {}: {}", path.display(), source))]
    ReadDefinitions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("invalid field definitions in {}: {}", name, source))]
    ParseDefinitions {
        name: String,
        source: serde_yaml::Error,
    },

    #[snafu(display("invalid configuration: {}", reasons.join("; ")))]
    InvalidConfig { reasons: Vec<String> },
}

/// File name of the persisted IPFIX template cache inside `cache_save_path`.
pub(crate) const IPFIX_CACHE_FILE: &str = "ipfix_templates.cache";

/// Configuration for the flow decoder.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct NetflowConfig {
    /// Protocol versions the decoder will accept (subset of 5, 9, 10).
    pub versions: Vec<u16>,

    /// Seconds before unused templates and samplers expire.
    pub cache_ttl: u64,

    /// When true, keep `first_switched`/`last_switched` as raw
    /// uptime-relative integers instead of converting to ISO-8601.
    pub switched_times_from_uptime: bool,

    /// Path to an extra NetFlow v9 field definition file, merged into the
    /// `option` category of the built-in dictionary.
    pub definitions: Option<PathBuf>,

    /// Path to an extra IPFIX field definition file, merged per enterprise id.
    pub ipfix_definitions: Option<PathBuf>,

    /// Directory for the IPFIX template cache file; `None` disables
    /// persistence.
    pub cache_save_path: Option<PathBuf>,

    /// When true, adds `flowset_id` to each template-decoded event.
    pub include_flowset_id: bool,
}

const fn default_cache_ttl() -> u64 {
    4000
}

fn default_versions() -> Vec<u16> {
    vec![5, 9, 10]
}

impl Default for NetflowConfig {
    fn default() -> Self {
        Self {
            versions: default_versions(),
            cache_ttl: default_cache_ttl(),
            switched_times_from_uptime: false,
            definitions: None,
            ipfix_definitions: None,
            cache_save_path: None,
            include_flowset_id: false,
        }
    }
}

impl NetflowConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.versions.is_empty() {
            errors.push("at least one protocol version must be enabled".to_string());
        }
        for version in &self.versions {
            if !matches!(version, 5 | 9 | 10) {
                errors.push(format!(
                    "unsupported version {}, must be one of 5, 9, 10",
                    version
                ));
            }
        }

        if self.cache_ttl == 0 {
            errors.push("cache_ttl must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Check whether a specific protocol version is enabled.
    pub fn is_version_enabled(&self, version: u16) -> bool {
        self.versions.contains(&version)
    }

    /// Full path of the IPFIX template cache file, if persistence is enabled.
    pub(crate) fn ipfix_cache_file(&self) -> Option<PathBuf> {
        self.cache_save_path
            .as_ref()
            .map(|dir| dir.join(IPFIX_CACHE_FILE))
    }
}
