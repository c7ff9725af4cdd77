//! Error types for the Strava provider.

use std::fmt;

use thiserror::Error;

/// The lifecycle operation that was running when a remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Creating a subscription.
    Create,
    /// Refreshing a subscription.
    Read,
    /// Replacing a subscription (delete then create).
    Update,
    /// Deleting a subscription.
    Delete,
    /// Listing all subscriptions.
    List,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::List => "list",
        };
        f.write_str(name)
    }
}

/// The remote call within an operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// `CreateSubscription`.
    Create,
    /// `GetSubscription`.
    Read,
    /// `GetAllSubscriptions`.
    List,
    /// `DeleteSubscription`.
    Delete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::List => "list",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Errors surfaced to the driver by provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Input did not match the resource schema.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A lifecycle call arrived before `configure`.
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// A call to the Strava API failed.
    #[error("{operation} failed in {phase} phase: {message}")]
    RemoteCall {
        /// The lifecycle operation.
        operation: Operation,
        /// The remote call that failed.
        phase: Phase,
        /// The underlying client error, verbatim.
        message: String,
    },

    /// An import identifier was not of the form `<id>,<verify_token>`.
    #[error("Import format error: {0}")]
    ImportFormat(String),

    /// The `<id>` part of an import identifier was not an integer.
    #[error("Import ID error: {0}")]
    ImportId(String),

    /// The requested resource or data source type is not served here.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// The driver sent a request that cannot be acted on.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A state payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProviderError {
    /// Wrap a client failure, tagging it with operation and phase.
    pub fn remote(operation: Operation, phase: Phase, err: impl fmt::Display) -> Self {
        Self::RemoteCall {
            operation,
            phase,
            message: err.to_string(),
        }
    }

    /// The remote phase that failed, if this is a remote call error.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::RemoteCall { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

impl From<ProviderError> for tonic::Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Validation(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::NotConfigured(msg) => tonic::Status::failed_precondition(msg),
            err @ ProviderError::RemoteCall { .. } => tonic::Status::unavailable(err.to_string()),
            ProviderError::ImportFormat(msg) | ProviderError::ImportId(msg) => {
                tonic::Status::invalid_argument(msg)
            },
            ProviderError::UnknownResource(msg) => tonic::Status::not_found(msg),
            ProviderError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
            ProviderError::Serialization(err) => {
                tonic::Status::invalid_argument(format!("Serialization error: {}", err))
            },
        }
    }
}

/// Errors returned by a [`SubscriptionClient`](crate::client::SubscriptionClient).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The HTTP request could not be completed.
    ///
    /// Holds the error without its URL, whose query carries the client secret.
    #[error("HTTP error: {0}")]
    Http(#[source] reqwest::Error),

    /// The Strava API answered with a non-success status.
    #[error("Strava API returned {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, as returned.
        body: String,
    },

    /// No subscription with this id is visible to the credentials.
    #[error("push subscription {0} not found")]
    NotFound(i64),

    /// An endpoint URL could not be built.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.without_url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_call_display() {
        let err = ProviderError::remote(
            Operation::Update,
            Phase::Delete,
            ClientError::NotFound(42),
        );
        assert_eq!(
            err.to_string(),
            "update failed in delete phase: push subscription 42 not found"
        );
        assert_eq!(err.phase(), Some(Phase::Delete));
    }

    #[test]
    fn test_import_errors_display() {
        let err = ProviderError::ImportFormat("42".to_string());
        assert_eq!(err.to_string(), "Import format error: 42");

        let err = ProviderError::ImportId("abc".to_string());
        assert_eq!(err.to_string(), "Import ID error: abc");
        assert_eq!(err.phase(), None);
    }

    #[test]
    fn test_error_to_status() {
        let err = ProviderError::remote(Operation::Read, Phase::Read, "boom");
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().contains("boom"));

        let err = ProviderError::ImportId("abc".to_string());
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let err = ProviderError::NotConfigured("call configure first".to_string());
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        let err = ProviderError::UnknownResource("strava_athlete".to_string());
        let status: tonic::Status = err.into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Api {
            status: 404,
            body: r#"{"message":"Resource Not Found"}"#.to_string(),
        };
        assert_eq!(
            err.to_string(),
            r#"Strava API returned 404: {"message":"Resource Not Found"}"#
        );
    }
}
