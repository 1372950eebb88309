//! Error types shared by publishers, receivers and backend adapters.
//!
//! Backends are free to use [`anyhow`] internally; anything that crosses the
//! [`Publisher`](crate::queue::Publisher) or
//! [`Receiver`](crate::receiver::Receiver) boundary is a [`MessagingError`].
//!
//! The error kinds map onto how a caller is expected to react:
//! - [`MessagingError::Transport`]: the broker could not be reached or refused
//!   the operation. Never retried internally; see
//!   [`PublisherExt::with_retry`](crate::queue::PublisherExt::with_retry) for
//!   an opt-in retry layer.
//! - [`MessagingError::InvalidState`]: the operation needs an open channel, or
//!   the receiver / message is not in a state that allows it.
//! - [`MessagingError::Unsupported`]: the backend has no such facility. This
//!   is a capability gap, not a transient failure.
//! - [`MessagingError::Handler`]: a user handler failed. Inside
//!   [`listen`](crate::receiver::Receiver::listen) this is contained to the
//!   failing batch and converted into a reject.
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MessagingError>;

#[derive(Error, Debug)]
pub enum MessagingError {
    /// The backend is unavailable or refused the operation.
    #[error("Transport error: {err}")]
    Transport { err: anyhow::Error },

    /// The operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The backend does not implement the requested operation.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// A user supplied handler failed.
    #[error("Handler error: {err}")]
    Handler { err: anyhow::Error },

    /// The message carries no acknowledgment handle, or one issued by another
    /// receiver instance.
    #[error("Message {message_id} was not delivered by this receiver")]
    ForeignMessage { message_id: String },

    /// The processing lock on the message expired before it was settled or
    /// renewed. The broker has already made the message available again.
    #[error("Lock on message {message_id} was lost")]
    LockLost { message_id: String },

    /// The caller supplied arguments the operation cannot accept.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl MessagingError {
    /// Wrap any error as a [`MessagingError::Transport`].
    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport { err: err.into() }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn unsupported(operation: &'static str, backend: &'static str) -> Self {
        Self::Unsupported { operation, backend }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only transport failures qualify; every other kind describes a state or
    /// capability that a retry cannot change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        Self::transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(MessagingError::transport(anyhow::anyhow!("connection reset")).is_transient());
        assert!(!MessagingError::invalid_state("closed").is_transient());
        assert!(!MessagingError::unsupported("dead-letter", "amqp").is_transient());
        assert!(!MessagingError::LockLost {
            message_id: "a".into()
        }
        .is_transient());
    }

    #[test]
    fn unsupported_names_operation_and_backend() {
        let err = MessagingError::unsupported("keep-alive", "amqp");
        assert_eq!(
            err.to_string(),
            "keep-alive is not supported by the amqp backend"
        );
    }
}
