use {
    axum::{
        http::StatusCode,
        response::{IntoResponse, Json, Response},
    },
    thiserror::Error,
    tracing::warn,
};

/// Handler error, rendered as `{ "error": message }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Cron(#[from] jobkit_cron::Error),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        use jobkit_cron::Error as E;
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Cron(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            Self::Cron(E::AlreadyRunning { .. }) => StatusCode::CONFLICT,
            Self::Cron(E::MissingParameter { .. }) => StatusCode::BAD_REQUEST,
            Self::Cron(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, jobkit_cron::Error};

    #[test]
    fn maps_errors_to_status_codes() {
        let cases = [
            (Error::job_not_found("a"), StatusCode::NOT_FOUND),
            (Error::invocation_not_found("a", "b"), StatusCode::NOT_FOUND),
            (
                Error::Multiple(vec![Error::message("x"), Error::job_not_found("a")]),
                StatusCode::NOT_FOUND,
            ),
            (Error::already_running("a"), StatusCode::CONFLICT),
            (
                Error::MissingParameter {
                    job: "a".into(),
                    parameter: "p".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (Error::message("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
        assert_eq!(
            ApiError::BadRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
