use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::kind::RuntimeKind;
use crate::types::{FullVersion, MajorVersion, OperationKind};

/// The operation holding a kind's single-flight guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveOperation {
    pub operation: OperationKind,
    pub major: Option<MajorVersion>,
}

impl fmt::Display for ActiveOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.major {
            Some(major) => write!(f, "{} {major}", self.operation),
            None => write!(f, "{}", self.operation),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Recoverable by reconciliation; never shown to the user directly.
    Integrity,
    /// Surfaced to the caller and retryable by re-invoking.
    Install,
    /// Surfaced immediately; needs a state change before retrying.
    Precondition,
    /// No runtime of the kind can be made available.
    Fatal,
    Internal,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("{} is not an executable binary", .path.display())]
    BinaryNotExecutable { path: PathBuf },

    #[error("Failed to run version probe for {}: {details}", .path.display())]
    VersionExtractionFailed { path: PathBuf, details: String },

    #[error("Could not parse a version from {} output: {output}", .path.display())]
    VersionParsingFailed { path: PathBuf, output: String },

    #[error("{kind} metadata unavailable: {details}")]
    MetadataUnavailable { kind: RuntimeKind, details: String },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Extraction failed: {details}")]
    ExtractionFailed { details: String },

    #[error("Download from {url} failed: {details}")]
    DownloadFailed { url: String, details: String },

    #[error("{kind} {major} is already installed")]
    AlreadyInstalled {
        kind: RuntimeKind,
        major: MajorVersion,
    },

    #[error("{kind} {major} is not available in the catalog")]
    VersionNotAvailable {
        kind: RuntimeKind,
        major: MajorVersion,
    },

    #[error("{kind} {major} is not installed")]
    VersionNotInstalled {
        kind: RuntimeKind,
        major: MajorVersion,
    },

    #[error("Cannot remove {kind} {major}: it is the last installed version")]
    CannotRemoveLastVersion {
        kind: RuntimeKind,
        major: MajorVersion,
    },

    #[error("Cannot remove {kind} {major}: it is the default version")]
    CannotRemoveDefaultVersion {
        kind: RuntimeKind,
        major: MajorVersion,
    },

    #[error("Another {kind} operation is in progress ({active})")]
    AnotherOperationInProgress {
        kind: RuntimeKind,
        active: ActiveOperation,
    },

    #[error("{kind} {major} is already at the latest version ({version})")]
    NoUpdateAvailable {
        kind: RuntimeKind,
        major: MajorVersion,
        version: FullVersion,
    },

    #[error("No {kind} runtime is available: nothing installed and no bundled fallback")]
    NoRuntimeAvailable { kind: RuntimeKind },

    #[error("{context} ({kind}): {message}")]
    Io {
        context: &'static str,
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("Record store error: {details}")]
    Store { details: String },

    #[error("{kind} manager has shut down")]
    ManagerClosed { kind: RuntimeKind },
}

impl RuntimeError {
    pub fn io(context: &'static str, error: &std::io::Error) -> Self {
        Self::Io {
            context,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn extraction_failed(details: impl Into<String>) -> Self {
        Self::ExtractionFailed {
            details: details.into(),
        }
    }

    pub fn download_failed(url: impl Into<String>, details: impl fmt::Display) -> Self {
        Self::DownloadFailed {
            url: url.into(),
            details: details.to_string(),
        }
    }

    pub fn metadata_unavailable(kind: RuntimeKind, details: impl fmt::Display) -> Self {
        Self::MetadataUnavailable {
            kind,
            details: details.to_string(),
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::BinaryNotExecutable { .. }
            | Self::VersionExtractionFailed { .. }
            | Self::VersionParsingFailed { .. } => ErrorClass::Integrity,
            Self::MetadataUnavailable { .. }
            | Self::ChecksumMismatch { .. }
            | Self::ExtractionFailed { .. }
            | Self::DownloadFailed { .. } => ErrorClass::Install,
            Self::AlreadyInstalled { .. }
            | Self::VersionNotAvailable { .. }
            | Self::VersionNotInstalled { .. }
            | Self::CannotRemoveLastVersion { .. }
            | Self::CannotRemoveDefaultVersion { .. }
            | Self::AnotherOperationInProgress { .. }
            | Self::NoUpdateAvailable { .. } => ErrorClass::Precondition,
            Self::NoRuntimeAvailable { .. } => ErrorClass::Fatal,
            Self::Io { .. } | Self::Store { .. } | Self::ManagerClosed { .. } => {
                ErrorClass::Internal
            }
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Install | ErrorClass::Integrity)
    }
}
