use thiserror::Error;

/// Main error type for the sweepline system
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Study error: {0}")]
    Study(#[from] StudyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SweepError {
    /// True for the external-interrupt kind, which stops the scheduler
    /// without surfacing an error to the caller.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SweepError::Scheduler(SchedulerError::Cancelled))
    }

    /// True when a backend call failed in a way that is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, SweepError::Backend(e) if e.is_transient())
    }
}

/// Scheduler configuration and protocol errors. All of these are fatal to
/// the scheduler except `Cancelled`, which maps to a graceful stop.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("sweep not found: {sweep_id} (entity: {entity}, project: {project})")]
    SweepNotFound {
        sweep_id: String,
        entity: String,
        project: String,
    },

    #[error("no executable to launch: {message}")]
    ExecutableNotFound { message: String },

    #[error("unknown command type in agent heartbeat: {command_type}")]
    UnknownCommand { command_type: String },

    #[error("No run id in agent heartbeat: {command}")]
    MissingRunId { command: String },

    #[error("{kind}: {name} not yet supported")]
    UnsupportedComponent { kind: String, name: String },

    #[error("failed to load custom optimizer configuration from {artifact}: {message}")]
    CustomStudyLoad { artifact: String, message: String },

    #[error("invalid sweep configuration: {message}")]
    InvalidConfig { message: String },

    #[error("scheduler cancelled")]
    Cancelled,
}

/// Errors surfaced by the remote backend and launch queue collaborators.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("communication error: {message}")]
    Communication { message: String },

    #[error("transient error: {message}")]
    Transient { message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transient { .. } | BackendError::Communication { .. } => true,
            BackendError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Errors from the ask/tell/prune study.
#[derive(Error, Debug)]
pub enum StudyError {
    #[error("study storage error: {message}")]
    Storage { message: String },

    #[error("unknown trial: {trial}")]
    UnknownTrial { trial: u64 },

    #[error("trial {trial} already finished")]
    TrialFinished { trial: u64 },

    #[error("invalid parameter {parameter}: {message}")]
    InvalidParameter { parameter: String, message: String },
}

/// Result type alias for sweepline operations
pub type SweepResult<T> = Result<T, SweepError>;

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Result alias for study operations.
pub type StudyResult<T> = Result<T, StudyError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SweepError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SweepError::Config(format!($($arg)*))
    };
}
