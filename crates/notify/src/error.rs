use {jobkit_common::FromMessage, thiserror::Error};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{target} returned {status}: {body}")]
    Status {
        target: &'static str,
        status: u16,
        body: String,
    },

    #[error("invalid http method: {method}")]
    InvalidMethod { method: String },

    #[error("sendmail exited with status {status}")]
    Sendmail { status: i32 },

    #[error("{message}")]
    Message { message: String },
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

jobkit_common::impl_context!();
