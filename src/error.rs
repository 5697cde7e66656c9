use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::artifact::ArtifactError;
use crate::curation::CurationError;
use crate::dispatch::RemoteError;
use crate::store::StoreError;

/// Where in the lifecycle an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Intake,
    OpenVersion,
    Attach,
    Detach,
    Query,
    Curation,
    SafetyFilter,
    Artifact,
    Configure,
    Dispatch,
    Training,
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::OpenVersion => "open_version",
            Stage::Attach => "attach",
            Stage::Detach => "detach",
            Stage::Query => "query",
            Stage::Curation => "curation",
            Stage::SafetyFilter => "safety_filter",
            Stage::Artifact => "artifact",
            Stage::Configure => "configure",
            Stage::Dispatch => "dispatch",
            Stage::Training => "training",
            Stage::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit context attached to every error leaving the lifecycle manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorContext {
    pub org_id: Option<Uuid>,
    pub version_id: Option<Uuid>,
    pub stage: Stage,
}

impl ErrorContext {
    pub fn new(stage: Stage) -> Self {
        Self {
            org_id: None,
            version_id: None,
            stage,
        }
    }

    pub fn org(mut self, org_id: Uuid) -> Self {
        self.org_id = Some(org_id);
        self
    }

    pub fn version(mut self, version_id: Uuid) -> Self {
        self.version_id = Some(version_id);
        self
    }

    pub fn at(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn validation(self, message: impl Into<String>) -> ForgeError {
        ForgeError::Validation {
            context: self,
            message: message.into(),
        }
    }

    pub fn conflict(self, message: impl Into<String>) -> ForgeError {
        ForgeError::Conflict {
            context: self,
            message: message.into(),
        }
    }

    pub fn not_found(self, message: impl Into<String>) -> ForgeError {
        ForgeError::NotFound {
            context: self,
            message: message.into(),
        }
    }

    pub fn upstream(self, message: impl Into<String>) -> ForgeError {
        ForgeError::Upstream {
            context: self,
            message: message.into(),
        }
    }

    pub fn storage(self, message: impl Into<String>) -> ForgeError {
        ForgeError::Storage {
            context: self,
            message: message.into(),
        }
    }

    /// Map a persistence failure, keeping guard violations as conflicts.
    pub fn store(self, err: StoreError) -> ForgeError {
        match err {
            StoreError::Conflict(msg) => self.conflict(msg),
            StoreError::NotFound(msg) => self.not_found(msg),
            StoreError::Database(msg) | StoreError::Corrupt(msg) => self.storage(msg),
        }
    }

    pub fn artifact(self, err: ArtifactError) -> ForgeError {
        self.at(Stage::Artifact).storage(err.to_string())
    }

    pub fn remote(self, err: RemoteError) -> ForgeError {
        self.upstream(err.to_string())
    }

    pub fn curation(self, err: CurationError) -> ForgeError {
        match err {
            CurationError::Empty { .. } => self.at(Stage::Curation).validation(err.to_string()),
            CurationError::InvalidPattern(_) => self.at(Stage::Curation).validation(err.to_string()),
            CurationError::Serialization(_) => self.at(Stage::Curation).storage(err.to_string()),
            CurationError::Artifact(inner) => self.artifact(inner),
            CurationError::Safety(inner) => self.at(Stage::SafetyFilter).remote(inner),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage={}", self.stage)?;
        if let Some(org_id) = self.org_id {
            write!(f, " org={}", org_id)?;
        }
        if let Some(version_id) = self.version_id {
            write!(f, " version={}", version_id)?;
        }
        Ok(())
    }
}

/// Coarse error classification, stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Upstream,
    Storage,
}

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Validation error [{context}]: {message}")]
    Validation { context: ErrorContext, message: String },

    #[error("Conflict [{context}]: {message}")]
    Conflict { context: ErrorContext, message: String },

    #[error("Not found [{context}]: {message}")]
    NotFound { context: ErrorContext, message: String },

    #[error("Upstream error [{context}]: {message}")]
    Upstream { context: ErrorContext, message: String },

    #[error("Storage error [{context}]: {message}")]
    Storage { context: ErrorContext, message: String },
}

impl ForgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForgeError::Validation { .. } => ErrorKind::Validation,
            ForgeError::Conflict { .. } => ErrorKind::Conflict,
            ForgeError::NotFound { .. } => ErrorKind::NotFound,
            ForgeError::Upstream { .. } => ErrorKind::Upstream,
            ForgeError::Storage { .. } => ErrorKind::Storage,
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            ForgeError::Validation { context, .. }
            | ForgeError::Conflict { context, .. }
            | ForgeError::NotFound { context, .. }
            | ForgeError::Upstream { context, .. }
            | ForgeError::Storage { context, .. } => context,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ForgeError::Validation { message, .. }
            | ForgeError::Conflict { message, .. }
            | ForgeError::NotFound { message, .. }
            | ForgeError::Upstream { message, .. }
            | ForgeError::Storage { message, .. } => message,
        }
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;
