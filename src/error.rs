//! Error types for the orchestration engine
//!
//! Errors fall into two independent channels. Errors returned when a task is
//! enqueued go straight back to the caller. Errors raised inside a task are
//! written into the entity's `status`/`error_message` columns by the task
//! itself and only surface to the worker for logging.

/// Errors from the task queue lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue was never started, or has already been shut down
    #[error("task queue has not been started")]
    NotStarted,
    /// `start` was called on a queue that is already running
    #[error("task queue is already running")]
    AlreadyStarted,
}

/// Failure running an external binary (acme.sh, nginx)
#[derive(Debug, thiserror::Error)]
pub enum ExternalProcessError {
    /// Binary could not be resolved on the executable search path
    #[error("{binary}: executable not found")]
    NotFound { binary: String },

    /// Binary was found but could not be spawned
    #[error("failed to execute {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// Binary exited with a non-zero status
    #[error("command failed: {} {} ({}): {}", .command, join_args(.args), describe_exit(.code), trim_output(.output))]
    Failed {
        command: String,
        args: Vec<String>,
        code: Option<i32>,
        output: String,
    },
}

impl ExternalProcessError {
    /// Output captured from the process, if it ran at all
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Failed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Text worth showing a user: trimmed process output, falling back to the
    /// error itself when the process printed nothing
    pub fn diagnostic(&self) -> String {
        match self.output().map(str::trim) {
            Some(output) if !output.is_empty() => output.to_string(),
            _ => self.to_string(),
        }
    }
}

fn join_args(args: &[String]) -> String {
    args.join(" ")
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

fn trim_output(output: &str) -> &str {
    output.trim()
}

/// Template could not be rendered against the entity data
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RenderError(pub String);

impl From<handlebars::RenderError> for RenderError {
    fn from(e: handlebars::RenderError) -> Self {
        Self(e.to_string())
    }
}

/// Store and validation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("invalid stored JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind} #{id} not found")]
    NotFound { kind: &'static str, id: i64 },
}

impl Error {
    pub fn not_found(kind: &'static str, id: i64) -> Self {
        Self::NotFound { kind, id }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
