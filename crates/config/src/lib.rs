//! Configuration loading, validation and env substitution.
//!
//! Config files: `jobkit.toml`, `jobkit.yaml`, `jobkit.yml` or `jobkit.json`,
//! searched in `./` then `~/.config/jobkit/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{config_dir, discover_and_load, find_config_file, load_config, parse_config},
    schema::{
        EmailConfig, HistoryBackend, JobConfig, JobHistoryConfig, JobkitConfig, MetricsConfig,
        NotificationsConfig, ParameterConfig, ServerConfig, ShellConfig, SlackConfig,
        WebhookConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate, validate_config},
};
