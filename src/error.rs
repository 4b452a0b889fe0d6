//! Error taxonomy for the wizard protocol.
//!
//! Every failure is scoped to one connection or session. Most variants are
//! surfaced to the client as an `error` frame; [`WizardError::Validation`]
//! is swallowed by the gateway and [`WizardError::Authentication`] rejects
//! the upgrade before any session exists.

use crate::llm::ServiceError;

/// Errors raised while admitting a connection or handling a turn.
#[derive(Debug, thiserror::Error)]
pub enum WizardError {
    /// The credential was missing or rejected by the identity provider.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A client frame did not match the `user_message` shape.
    #[error("Invalid client frame: {0}")]
    Validation(String),

    /// An external dependency timed out, refused the connection or returned a 5xx.
    #[error("{service} unavailable: {detail}")]
    DependencyUnavailable {
        service: &'static str,
        detail: String,
    },

    /// An external dependency answered, but with something we cannot use.
    #[error("Malformed response from {service}: {detail}")]
    MalformedResponse {
        service: &'static str,
        detail: String,
    },

    /// No template cleared the similarity threshold.
    #[error("No template matched the request")]
    ClassificationMiss,

    /// The store has no template under the bound id.
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// The store has no session under the given id.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// A store write failed after the external calls succeeded.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The connection exhausted its inbound message budget.
    #[error("Rate limit exceeded")]
    RateLimited,
}

impl WizardError {
    /// Wrap a failed store read.
    pub fn store_unavailable(err: &anyhow::Error) -> Self {
        Self::DependencyUnavailable {
            service: "store",
            detail: format!("{err:#}"),
        }
    }

    /// Wrap a failed store write.
    pub fn persistence(err: &anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }

    /// Attribute an embedding/completion client error to a named service.
    pub fn from_service(service: &'static str, err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(detail) => Self::DependencyUnavailable { service, detail },
            ServiceError::Malformed(detail) => Self::MalformedResponse { service, detail },
        }
    }

    /// A call to `service` did not finish within the configured timeout.
    pub fn timeout(service: &'static str) -> Self {
        Self::DependencyUnavailable {
            service,
            detail: "timed out".to_string(),
        }
    }

    /// Text sent to the client in an `error` frame.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Authentication(_) => "Authentication failed.".to_string(),
            Self::Validation(_) => "Invalid message.".to_string(),
            Self::DependencyUnavailable { service, .. } => {
                format!("The {service} service is not responding. Please try again.")
            }
            Self::MalformedResponse { service, .. } => {
                format!("Received an unexpected response from the {service} service. Please try again.")
            }
            Self::ClassificationMiss => "I couldn't find a document template matching your request. \
                 Please describe the document you need in more detail."
                .to_string(),
            Self::TemplateNotFound(_) => {
                "The document template for this session could not be loaded.".to_string()
            }
            Self::SessionNotFound(_) => "Your session could not be found.".to_string(),
            Self::Persistence(_) => {
                "Your progress could not be saved. Please send your message again.".to_string()
            }
            Self::RateLimited => "Too many messages. Please slow down.".to_string(),
        }
    }

    /// Whether the gateway closes the connection after reporting this error.
    #[must_use]
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}

/// Run `fut` under `limit`, mapping expiry to [`WizardError::timeout`].
pub async fn with_timeout<T, F>(
    service: &'static str,
    limit: std::time::Duration,
    fut: F,
) -> Result<T, WizardError>
where
    F: std::future::Future<Output = Result<T, WizardError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(WizardError::timeout(service)),
    }
}
