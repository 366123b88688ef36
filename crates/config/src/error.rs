use std::path::PathBuf;

use {jobkit_common::FromMessage, thiserror::Error};

use crate::validate::Diagnostic;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("unsupported config format: .{ext}")]
    UnsupportedFormat { ext: String },

    #[error("invalid configuration: {}", summarize(.diagnostics))]
    Invalid { diagnostics: Vec<Diagnostic> },

    #[error("{message}")]
    Message { message: String },
}

fn summarize(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

jobkit_common::impl_context!();
