//! Error taxonomy for the connection scope.
//!
//! Every variant maps to one row of the error table in the scope's design
//! document: `ArgumentError`, `Disposed`, `Cancelled`, `Timeout`,
//! `TransportError`, `AuthorizationError`, `LinkCreationError`.

/// Errors surfaced by any public operation on [`crate::scope::ConnectionScope`].
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    /// A required input was missing, empty, or otherwise invalid (e.g. an
    /// unrecognised transport selector).
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The scope (or the link opener it backs) has already been disposed.
    #[error("the connection scope has been disposed")]
    Disposed,

    /// The caller's cancellation signal fired before the operation completed.
    #[error("operation was cancelled")]
    Cancelled,

    /// The remaining deadline budget reached zero at a step boundary.
    #[error("operation timed out")]
    Timeout,

    /// Connection or transport negotiation failed.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A CBS token request was rejected or timed out.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Session/link construction failed, including a duplicate registry
    /// insertion.
    #[error("link creation error: {0}")]
    LinkCreation(String),
}

impl ScopeError {
    pub(crate) fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ScopeError::Transport(Box::new(err))
    }

    pub(crate) fn argument(msg: impl Into<String>) -> Self {
        ScopeError::Argument(msg.into())
    }

    pub(crate) fn link_creation(msg: impl Into<String>) -> Self {
        ScopeError::LinkCreation(msg.into())
    }

    pub(crate) fn authorization(msg: impl Into<String>) -> Self {
        ScopeError::Authorization(msg.into())
    }
}

/// Error returned by [`crate::credential::TokenCredential::get_token`].
#[derive(Debug, thiserror::Error)]
#[error("credential error: {0}")]
pub struct CredentialError(pub String);

pub type Result<T> = std::result::Result<T, ScopeError>;
