//! Error utilities

use crate::watch::HandleError;
use kube::core::ErrorResponse;
use std::time::Duration;

/// Describes error reason
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Conflict,
    AlreadyExists,
    /// Resource version is too old to resume a watch from
    Gone,
    Forbidden,
    Unauthorized,
    /// Catch-all variant. Since this enum is non-exhaustive,
    /// it should be handled with `_` pattern
    Unknown,
}

/// Tries to classify k8s error
pub fn classify(error_reason: &str) -> ErrorClass {
    match error_reason {
        "NotFound" => ErrorClass::NotFound,
        "Conflict" => ErrorClass::Conflict,
        "AlreadyExists" => ErrorClass::AlreadyExists,
        "Gone" | "Expired" => ErrorClass::Gone,
        "Forbidden" => ErrorClass::Forbidden,
        "Unauthorized" => ErrorClass::Unauthorized,
        _ => ErrorClass::Unknown,
    }
}

/// Tries to classify k8s error, wrapped in kube Error
pub fn classify_kube(error: &kube::Error) -> ErrorClass {
    match error {
        kube::Error::Api(api) => match classify(&api.reason) {
            ErrorClass::Unknown => classify_code(api.code),
            class => class,
        },
        _ => ErrorClass::Unknown,
    }
}

// some servers (and proxies) leave the reason empty
fn classify_code(code: u16) -> ErrorClass {
    match code {
        401 => ErrorClass::Unauthorized,
        403 => ErrorClass::Forbidden,
        404 => ErrorClass::NotFound,
        409 => ErrorClass::Conflict,
        410 => ErrorClass::Gone,
        _ => ErrorClass::Unknown,
    }
}

pub fn is_not_found(error: &kube::Error) -> bool {
    classify_kube(error) == ErrorClass::NotFound
}

/// Returns true if retrying the same request later may succeed.
pub fn is_transient(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(api) => api.code == 429 || api.code >= 500,
        kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::ReadEvents(_) => true,
        _ => false,
    }
}

/// Builds a failure status, like the ones the API server sends.
pub fn status(code: u16, reason: &str, message: impl Into<String>) -> ErrorResponse {
    ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    }
}

/// Converts a client error into the status carried by Error watch events.
/// Non-API errors become internal errors.
pub fn status_from_error(error: &kube::Error) -> ErrorResponse {
    match error {
        kube::Error::Api(api) => api.clone(),
        other => status(500, "InternalError", format!("{:#}", other)),
    }
}

/// Cluster API operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Verb {
    Get,
    Create,
    Update,
    Delete,
    List,
    Watch,
}

/// Problem recorded on a builder. Builders keep the first one
/// and refuse to talk to the cluster afterwards.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuilderError {
    #[error("builder name cannot be empty")]
    NameEmpty,
    #[error("builder namespace cannot be empty")]
    NamespaceEmpty,
    #[error("builder option failed: {0}")]
    Option(String),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid builder: {0}")]
    Builder(#[from] BuilderError),
    #[error("failed to {verb} {kind} {name:?}: {source}")]
    Api {
        verb: Verb,
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("timed out after {0:?}: context deadline exceeded")]
    DeadlineExceeded(Duration),
    #[error(transparent)]
    Watch(#[from] HandleError),
    #[error("cannot start watch: {0}")]
    WatchSetup(String),
}

impl Error {
    pub(crate) fn api<K: kube::Resource<DynamicType = ()>>(
        verb: Verb,
        name: &str,
        source: kube::Error,
    ) -> Self {
        Error::Api {
            verb,
            kind: K::kind(&()).into_owned(),
            name: name.to_string(),
            source,
        }
    }

    /// Verb of the failed cluster call, if this error comes from one
    pub fn verb(&self) -> Option<Verb> {
        match self {
            Error::Api { verb, .. } => Some(*verb),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Api { source, .. } => is_not_found(source),
            _ => false,
        }
    }

    /// True for poll timeouts and for watch handles that ran out of time
    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            Error::DeadlineExceeded(_) => true,
            Error::Watch(err) => err.is_deadline_exceeded(),
            _ => false,
        }
    }

    pub fn is_invalid_builder(&self) -> bool {
        matches!(self, Error::Builder(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
