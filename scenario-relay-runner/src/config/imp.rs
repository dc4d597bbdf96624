// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{RetryPolicy, deserialize_retry_policy};
use crate::errors::{ConfigParseError, ConfigParseErrorKind};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use scenario_relay_metadata::collector::RunMode;
use serde::Deserialize;
use std::{collections::BTreeSet, fmt, time::Duration};
use tracing::warn;

/// Trait for handling configuration warnings.
pub trait ConfigWarnings {
    /// Handle unknown configuration keys found in a config file.
    fn unknown_config_keys(&mut self, config_file: &Utf8Path, unknown: &BTreeSet<String>);
}

/// Reports configuration warnings through `tracing`.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultConfigWarnings;

impl ConfigWarnings for DefaultConfigWarnings {
    fn unknown_config_keys(&mut self, config_file: &Utf8Path, unknown: &BTreeSet<String>) {
        let mut unknown_str = String::new();
        if let [key] = unknown.iter().collect::<Vec<_>>().as_slice() {
            unknown_str.push_str("key: ");
            unknown_str.push_str(key);
        } else {
            unknown_str.push_str("keys:\n");
            for ignored_key in unknown {
                unknown_str.push('\n');
                unknown_str.push_str("  - ");
                unknown_str.push_str(ignored_key);
            }
        }

        warn!("in config file {config_file}, ignoring unknown configuration {unknown_str}");
    }
}

/// Overall configuration for scenario-relay.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayConfig {
    /// How to reach the remote collector.
    pub collector: CollectorConfig,
    /// Limits for uploads and submissions.
    pub delivery: DeliveryConfig,
    /// Automated repair settings.
    pub recovery: RecoveryConfig,
    /// Local report settings.
    pub report: ReportConfig,
}

impl RelayConfig {
    /// The default location of the config within the working directory.
    pub const CONFIG_PATH: &'static str = ".config/scenario-relay.toml";

    /// Contains the default config as a TOML file.
    ///
    /// User configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// Environment variables that override individual config keys.
    pub const ENV_OVERRIDES: &'static [EnvOverride] = &[
        EnvOverride::string("SCENARIO_RELAY_TOKEN", "collector.token"),
        EnvOverride::string("SCENARIO_RELAY_COLLECTOR_URL", "collector.base-url"),
        EnvOverride::string("SCENARIO_RELAY_ANALYTICS_URL", "collector.analytics-url"),
        EnvOverride::bool("SCENARIO_RELAY_UPLOAD_REPORTS", "collector.upload-reports"),
        EnvOverride::string("SCENARIO_RELAY_MODE", "collector.mode"),
        EnvOverride::string("SCENARIO_RELAY_BROWSER", "collector.browser"),
        EnvOverride::string("SCENARIO_RELAY_BRANCH", "collector.branch"),
        EnvOverride::string("SCENARIO_RELAY_VIDEO_ID", "collector.video-id"),
        EnvOverride::string("SCENARIO_RELAY_RETRY_ID", "collector.retry-id"),
        EnvOverride::string("SCENARIO_RELAY_STATUS_UUID", "collector.status-uuid"),
        EnvOverride::string("SCENARIO_RELAY_RUN_ID", "collector.run-id"),
        EnvOverride::string("SCENARIO_RELAY_PROJECT_ID", "collector.project-id"),
        EnvOverride::bool("SCENARIO_RELAY_RECOVER", "recovery.enabled"),
        EnvOverride::string("SCENARIO_RELAY_ENV_TAG", "recovery.env-tag"),
        EnvOverride::step_list(ATTEMPTED_STEPS_ENV, "recovery.attempted-steps"),
        EnvOverride::string("SCENARIO_RELAY_LOCAL_REPORT_DIR", "report.local-dir"),
    ];

    /// Reads the config from the given file, or if not specified from
    /// [`Self::CONFIG_PATH`] under `root`, then applies environment overrides
    /// looked up through `env`.
    pub fn from_sources(
        root: &Utf8Path,
        file: Option<&Utf8Path>,
        env: impl Fn(&str) -> Option<String>,
        warnings: &mut impl ConfigWarnings,
    ) -> Result<Self, ConfigParseError> {
        let (config_file, source) = match file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let config_file = root.join(Self::CONFIG_PATH);
                let source = File::new(config_file.as_str(), FileFormat::Toml).required(false);
                (config_file, source)
            }
        };

        let mut builder = Self::make_default_config().add_source(source);
        for env_override in Self::ENV_OVERRIDES {
            builder = env_override
                .apply(builder, &env)
                .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
        }

        let (config, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
        if !unknown.is_empty() {
            warnings.unknown_config_keys(&config_file, &unknown);
        }

        Ok(config)
    }

    /// Returns the default config, with no file or environment overrides.
    pub fn default_config() -> Self {
        let (config, _) = Self::build_and_deserialize_config(&Self::make_default_config())
            .unwrap_or_else(|error| panic!("default config is always valid: {error}"));
        config
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    /// This returns a tuple of (config, ignored paths).
    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(Self, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let config: Self = serde_path_to_error::deserialize(ignored_de).map_err(|error| {
            // Both serde_path_to_error and the config crate report the key.
            // Drop the key from the config error for consistency.
            let path = error.path().clone();
            let config_error = error.into_inner();
            let error = match config_error {
                ConfigError::At { error, .. } => *error,
                other => other,
            };
            ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                path, error,
            )))
        })?;

        Ok((config, ignored))
    }
}

/// The environment variable carrying step indices attempted by a previous pass.
pub const ATTEMPTED_STEPS_ENV: &str = "SCENARIO_RELAY_ATTEMPTED_STEPS";

/// A mapping from an environment variable to a config key.
#[derive(Copy, Clone, Debug)]
pub struct EnvOverride {
    /// The environment variable.
    pub var: &'static str,
    /// The dotted config key it overrides.
    pub key: &'static str,
    kind: EnvValueKind,
}

#[derive(Copy, Clone, Debug)]
enum EnvValueKind {
    String,
    Bool,
    StepList,
}

impl EnvOverride {
    const fn string(var: &'static str, key: &'static str) -> Self {
        Self {
            var,
            key,
            kind: EnvValueKind::String,
        }
    }

    const fn bool(var: &'static str, key: &'static str) -> Self {
        Self {
            var,
            key,
            kind: EnvValueKind::Bool,
        }
    }

    const fn step_list(var: &'static str, key: &'static str) -> Self {
        Self {
            var,
            key,
            kind: EnvValueKind::StepList,
        }
    }

    fn apply(
        &self,
        builder: ConfigBuilder<DefaultState>,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigParseErrorKind> {
        // Empty variables are treated as unset.
        let Some(value) = env(self.var).filter(|value| !value.is_empty()) else {
            return Ok(builder);
        };

        let builder = match self.kind {
            EnvValueKind::String => builder.set_override(self.key, value),
            EnvValueKind::Bool => {
                let parsed = parse_bool(&value).ok_or_else(|| {
                    ConfigParseErrorKind::InvalidEnvValue {
                        var: self.var,
                        value: value.clone(),
                        reason: "expected true, false, 1 or 0",
                    }
                })?;
                builder.set_override(self.key, parsed)
            }
            EnvValueKind::StepList => {
                let parsed = parse_step_list(&value).ok_or_else(|| {
                    ConfigParseErrorKind::InvalidEnvValue {
                        var: self.var,
                        value: value.clone(),
                        reason: "expected a comma-separated list of step indices",
                    }
                })?;
                builder.set_override(self.key, parsed)
            }
        };
        builder.map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_step_list(value: &str) -> Option<Vec<i64>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u32>().ok().map(i64::from))
        .collect()
}

/// How to reach the remote collector.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CollectorConfig {
    /// Base URL of the run API.
    pub base_url: String,
    /// Base URL of the analytics service.
    pub analytics_url: String,
    /// Base URL for links to uploaded reports.
    pub link_base: String,
    /// Bearer token sent with every call.
    #[serde(default)]
    pub token: Option<AuthToken>,
    /// If false, every network operation is skipped.
    pub upload_reports: bool,
    /// How the run was launched.
    pub mode: RunMode,
    /// Browser the scenarios run in.
    pub browser: String,
    /// Source branch, reported with the run.
    pub branch: String,
    /// Recording id, for runs with a video.
    #[serde(default)]
    pub video_id: Option<String>,
    /// Re-run correlation id used when the run id isn't already part of it.
    #[serde(default)]
    pub retry_id: Option<String>,
    /// Correlation id for run-status heartbeats. Heartbeats are skipped without one.
    #[serde(default)]
    pub status_uuid: Option<String>,
    /// Reuse an existing remote run instead of creating one.
    #[serde(default)]
    pub run_id: Option<String>,
    /// Project of the reused run.
    #[serde(default)]
    pub project_id: Option<String>,
}

/// A bearer token. Never printed by `Debug`.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    /// Creates a new token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the token text.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(..)")
    }
}

/// Limits for uploads and submissions.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeliveryConfig {
    /// Maximum artifact uploads in flight for one test case.
    pub artifact_concurrency: usize,
    /// Attempts per artifact before it is skipped.
    pub artifact_retries: u32,
    /// Timeout for a single collector request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Retry policy for the whole test case submission.
    #[serde(deserialize_with = "deserialize_retry_policy")]
    pub submit_retries: RetryPolicy,
}

/// Automated repair settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecoveryConfig {
    /// Whether failures are sent for repair.
    pub enabled: bool,
    /// The repair and re-run program.
    pub program: String,
    /// Leading arguments passed to `program`.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment tag forwarded as `--env=<tag>`.
    #[serde(default)]
    pub env_tag: Option<String>,
    /// Step indices already attempted by a previous pass of this run.
    #[serde(default)]
    pub attempted_steps: Vec<usize>,
}

/// Local report settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReportConfig {
    /// If set, test cases are written here instead of being uploaded.
    #[serde(default)]
    pub local_dir: Option<Utf8PathBuf>,
    /// JSON file used to resolve `{{name}}` parameters.
    pub test_data_file: Utf8PathBuf,
    /// Name of the remote run. Falls back to the stream's `meta` event.
    #[serde(default)]
    pub run_name: Option<String>,
}
