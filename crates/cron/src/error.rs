use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid cron expression '{expr}': {source}")]
    CronParse {
        expr: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("unknown timezone: {timezone}")]
    UnknownTimezone { timezone: String },

    #[error("job already running: {job}")]
    AlreadyRunning { job: String },

    #[error("job not found: {job}")]
    JobNotFound { job: String },

    #[error("invocation not found: {job}/{id}")]
    InvocationNotFound { job: String, id: String },

    #[error("job already loaded: {job}")]
    DuplicateJob { job: String },

    #[error("job {job} is missing required parameter {parameter}")]
    MissingParameter { job: String, parameter: String },

    #[error("job scheduler already started: {job}")]
    CannotStart { job: String },

    #[error("{}", join_messages(.0))]
    Multiple(Vec<Error>),

    #[error("{message}")]
    Message { message: String },

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn already_running(job: impl Into<String>) -> Self {
        Self::AlreadyRunning { job: job.into() }
    }

    #[must_use]
    pub fn job_not_found(job: impl Into<String>) -> Self {
        Self::JobNotFound { job: job.into() }
    }

    #[must_use]
    pub fn invocation_not_found(job: impl Into<String>, id: impl Into<String>) -> Self {
        Self::InvocationNotFound {
            job: job.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn invalid_schedule(schedule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            schedule: schedule.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn unknown_timezone(timezone: impl Into<String>) -> Self {
        Self::UnknownTimezone {
            timezone: timezone.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Collapse a list of errors: none is `Ok`, one is returned as-is.
    pub fn collect(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Whether this error (or any error inside a [`Error::Multiple`]) is a
    /// missing-job lookup.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::JobNotFound { .. } | Self::InvocationNotFound { .. } => true,
            Self::Multiple(errors) => errors.iter().any(Self::is_not_found),
            _ => false,
        }
    }
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, Error>;
