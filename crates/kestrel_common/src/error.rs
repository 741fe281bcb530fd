//! Orchestrator error taxonomy.
//!
//! Every error crossing a component boundary carries one of the canonical
//! codes below. Wrapping preserves the code: the outermost wrap describes
//! the verb, the innermost the shard and operation, and classification
//! survives any number of `wrap` calls so retry decisions can be made at
//! the top of the stack.

use thiserror::Error;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Canonical error codes on the component boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::OutOfRange => "OUT_OF_RANGE",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::DataLoss => "DATA_LOSS",
        };
        write!(f, "{s}")
    }
}

/// Top-level orchestrator error. One variant per canonical code; the
/// message alone is the display form, the code is queried via [`code`].
///
/// [`code`]: KestrelError::code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KestrelError {
    #[error("{0}")]
    Canceled(String),
    #[error("{0}")]
    Unknown(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    DeadlineExceeded(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    ResourceExhausted(String),
    #[error("{0}")]
    FailedPrecondition(String),
    #[error("{0}")]
    Aborted(String),
    #[error("{0}")]
    OutOfRange(String),
    #[error("{0}")]
    Unimplemented(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    DataLoss(String),
}

impl KestrelError {
    /// The canonical code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            KestrelError::Canceled(_) => ErrorCode::Canceled,
            KestrelError::Unknown(_) => ErrorCode::Unknown,
            KestrelError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            KestrelError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            KestrelError::NotFound(_) => ErrorCode::NotFound,
            KestrelError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            KestrelError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            KestrelError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            KestrelError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            KestrelError::Aborted(_) => ErrorCode::Aborted,
            KestrelError::OutOfRange(_) => ErrorCode::OutOfRange,
            KestrelError::Unimplemented(_) => ErrorCode::Unimplemented,
            KestrelError::Internal(_) => ErrorCode::Internal,
            KestrelError::Unavailable(_) => ErrorCode::Unavailable,
            KestrelError::DataLoss(_) => ErrorCode::DataLoss,
        }
    }

    /// Rebuild the same variant with a new message.
    fn with_message(&self, msg: String) -> Self {
        match self {
            KestrelError::Canceled(_) => KestrelError::Canceled(msg),
            KestrelError::Unknown(_) => KestrelError::Unknown(msg),
            KestrelError::InvalidArgument(_) => KestrelError::InvalidArgument(msg),
            KestrelError::DeadlineExceeded(_) => KestrelError::DeadlineExceeded(msg),
            KestrelError::NotFound(_) => KestrelError::NotFound(msg),
            KestrelError::AlreadyExists(_) => KestrelError::AlreadyExists(msg),
            KestrelError::PermissionDenied(_) => KestrelError::PermissionDenied(msg),
            KestrelError::ResourceExhausted(_) => KestrelError::ResourceExhausted(msg),
            KestrelError::FailedPrecondition(_) => KestrelError::FailedPrecondition(msg),
            KestrelError::Aborted(_) => KestrelError::Aborted(msg),
            KestrelError::OutOfRange(_) => KestrelError::OutOfRange(msg),
            KestrelError::Unimplemented(_) => KestrelError::Unimplemented(msg),
            KestrelError::Internal(_) => KestrelError::Internal(msg),
            KestrelError::Unavailable(_) => KestrelError::Unavailable(msg),
            KestrelError::DataLoss(_) => KestrelError::DataLoss(msg),
        }
    }

    /// Prepend context to the message, **preserving the code**.
    pub fn wrap(self, ctx: impl AsRef<str>) -> Self {
        let msg = format!("{}: {}", ctx.as_ref(), self);
        self.with_message(msg)
    }

    /// Precondition failures are surfaced as-is and never retried.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::FailedPrecondition | ErrorCode::InvalidArgument
        )
    }

    /// Whether the caller may usefully retry the whole operation.
    /// Aborted covers topology CAS misses and lock contention; Unavailable
    /// and ResourceExhausted cover transient agent failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Aborted | ErrorCode::Unavailable | ErrorCode::ResourceExhausted
        )
    }
}

/// Add context to a Result, preserving the canonical code.
/// Usage: `store.get_shard(ks, shard).await.ctx("switch writes")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> KestrelResult<T>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> KestrelResult<T>;
}

impl<T, E: Into<KestrelError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> KestrelResult<T> {
        self.map_err(|e| e.into().wrap(context))
    }
    fn ctx_with(self, f: impl FnOnce() -> String) -> KestrelResult<T> {
        self.map_err(|e| e.into().wrap(f()))
    }
}

// ── Fan-out error aggregation ───────────────────────────────────────────────

/// Collects per-shard failures during a fan-out and folds them into one
/// combined error that names each failed shard. No partial result is
/// returned when the recorder is non-empty.
#[derive(Debug, Default)]
pub struct ErrorRecorder {
    errors: Vec<(String, KestrelError)>,
}

impl ErrorRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `target` (typically `keyspace/shard`).
    pub fn record(&mut self, target: impl Into<String>, err: KestrelError) {
        self.errors.push((target.into(), err));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Fold into a single error, or `Ok(())` when nothing was recorded.
    /// A single failure keeps its code; multiple failures keep the first
    /// failure's code with every shard listed in the message.
    pub fn result(mut self) -> KestrelResult<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => {
                let (target, err) = self.errors.remove(0);
                Err(err.wrap(target))
            }
            _ => {
                let code_holder = self.errors[0].1.clone();
                let msgs: Vec<String> = self
                    .errors
                    .iter()
                    .map(|(target, err)| format!("{target}: {err}"))
                    .collect();
                let combined = format!(
                    "{} targets failed: {}",
                    self.errors.len(),
                    msgs.join("; ")
                );
                Err(code_holder.with_message(combined))
            }
        }
    }
}
