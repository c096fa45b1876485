use runkit_backend::{ErrorClass, RuntimeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppErrorDetail {
    Message(String),
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
    Runtime(RuntimeError),
}

impl std::fmt::Display for AppErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(message) => write!(f, "{message}"),
            Self::Io { kind, message } => write!(f, "{kind}: {message}"),
            Self::Runtime(error) => write!(f, "{error}"),
        }
    }
}

impl From<String> for AppErrorDetail {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for AppErrorDetail {
    fn from(value: &str) -> Self {
        Self::Message(value.to_string())
    }
}

impl From<std::io::Error> for AppErrorDetail {
    fn from(error: std::io::Error) -> Self {
        Self::Io {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<RuntimeError> for AppErrorDetail {
    fn from(value: RuntimeError) -> Self {
        Self::Runtime(value)
    }
}

impl From<runkit_platform::AppPathsError> for AppErrorDetail {
    fn from(value: runkit_platform::AppPathsError) -> Self {
        Self::Message(value.to_string())
    }
}

impl From<crate::single_instance::AcquireError> for AppErrorDetail {
    fn from(value: crate::single_instance::AcquireError) -> Self {
        Self::Message(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    Timeout {
        operation: &'static str,
        seconds: u64,
    },
    InvalidArgument {
        argument: &'static str,
        details: AppErrorDetail,
    },
    EnvironmentUnavailable {
        reason: AppErrorDetail,
    },
    OperationFailed {
        operation: &'static str,
        details: AppErrorDetail,
    },
    UpdateCheckFailed {
        target: &'static str,
        details: AppErrorDetail,
    },
}

impl AppError {
    pub fn timeout(operation: &'static str, seconds: u64) -> Self {
        Self::Timeout { operation, seconds }
    }

    pub fn invalid_argument(argument: &'static str, details: impl Into<AppErrorDetail>) -> Self {
        Self::InvalidArgument {
            argument,
            details: details.into(),
        }
    }

    pub fn environment_unavailable(reason: impl Into<AppErrorDetail>) -> Self {
        Self::EnvironmentUnavailable {
            reason: reason.into(),
        }
    }

    pub fn operation_failed(operation: &'static str, details: impl Into<AppErrorDetail>) -> Self {
        Self::OperationFailed {
            operation,
            details: details.into(),
        }
    }

    pub fn update_check_failed(target: &'static str, details: impl Into<AppErrorDetail>) -> Self {
        Self::UpdateCheckFailed {
            target,
            details: details.into(),
        }
    }

    /// Process exit code: 2 for caller mistakes, 3 when retrying may help,
    /// 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidArgument { .. } => 2,
            Self::Timeout { .. } => 3,
            Self::OperationFailed {
                details: AppErrorDetail::Runtime(error),
                ..
            }
            | Self::UpdateCheckFailed {
                details: AppErrorDetail::Runtime(error),
                ..
            } => match error.class() {
                ErrorClass::Precondition => 2,
                _ if error.is_retryable() => 3,
                _ => 1,
            },
            _ => 1,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { operation, seconds } => {
                write!(f, "{operation} timed out after {seconds}s")
            }
            Self::InvalidArgument { argument, details } => {
                write!(f, "Invalid {argument}: {details}")
            }
            Self::EnvironmentUnavailable { reason } => write!(f, "{reason}"),
            Self::OperationFailed { operation, details } => {
                write!(f, "{operation} failed: {details}")
            }
            Self::UpdateCheckFailed { target, details } => {
                write!(f, "{target} update check failed: {details}")
            }
        }
    }
}

impl std::error::Error for AppError {}
