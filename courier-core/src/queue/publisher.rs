//! The publish side of the messaging abstraction.
//!
//! A [`Publisher`] sends batches of [`Message`]s to the single destination it
//! was constructed for. It is stateless beyond the connection it holds, and
//! does not retry: on failure the whole call fails, even if the backend had
//! accepted part of the batch. Callers that want retries opt in through
//! [`PublisherExt::with_retry`].
use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;

use crate::{
    error::{MessagingError, Result},
    message::Message,
    retry::{RetryStrategy, Retrying},
};

/// Sends batches of messages to one destination.
///
/// Implementations assign a generated id to every message that lacks one,
/// carry user properties in the backend's native property bag, and preserve
/// the order of the batch.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Send a non-empty batch of messages.
    ///
    /// On success, every message was accepted by the backend.
    async fn send(&self, messages: Vec<Message>) -> Result<()>;

    /// Release the publisher's connection.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<P: ?Sized + Publisher> Publisher for Box<P> {
    async fn send(&self, messages: Vec<Message>) -> Result<()> {
        (**self).send(messages).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

#[async_trait]
impl<P: ?Sized + Publisher> Publisher for Arc<P> {
    async fn send(&self, messages: Vec<Message>) -> Result<()> {
        self.deref().send(messages).await
    }

    async fn close(&self) -> Result<()> {
        self.deref().close().await
    }
}

impl<T: ?Sized> PublisherExt for T where T: Publisher {}

/// Extension trait for [`Publisher`].
#[async_trait]
pub trait PublisherExt: Publisher {
    /// Send a single message.
    async fn send_one(&self, message: Message) -> Result<()> {
        self.send(vec![message]).await
    }

    /// Wrap the publisher such that transport failures are retried according
    /// to `strategy`.
    ///
    /// ```
    /// use std::{num::NonZeroU32, time::Duration};
    /// use courier::{
    ///     message::Message,
    ///     queue::{in_memory::InMemoryBroker, Publisher, PublisherExt},
    ///     retry::RetryStrategy,
    /// };
    ///
    /// # #[tokio::main]
    /// # async fn main() -> anyhow::Result<()> {
    /// let broker = InMemoryBroker::new();
    /// let publisher = broker.publisher("orders").with_retry(RetryStrategy::After {
    ///     max_retries: NonZeroU32::new(3).unwrap(),
    ///     duration: Duration::from_millis(50),
    /// });
    /// publisher.send(vec![Message::new("hello")]).await?;
    /// assert_eq!(broker.message_count("orders"), 1);
    /// # Ok(())
    /// # }
    /// ```
    fn with_retry(self, strategy: RetryStrategy) -> Retrying<Self>
    where
        Self: Sized,
    {
        Retrying::new(self, strategy)
    }
}

/// Validate a batch and assign ids to the messages lacking one.
pub(crate) fn prepare_batch(messages: Vec<Message>) -> Result<Vec<Message>> {
    if messages.is_empty() {
        return Err(MessagingError::InvalidInput(
            "cannot send an empty batch".to_string(),
        ));
    }

    Ok(messages.into_iter().map(Message::ensure_id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_batch_is_rejected() {
        assert!(matches!(
            prepare_batch(vec![]),
            Err(MessagingError::InvalidInput(_))
        ));
    }

    #[test]
    fn batch_ids_are_assigned_in_order() {
        let batch = prepare_batch(vec![
            Message::new("1").with_id("a"),
            Message::new("2"),
            Message::new("3").with_id("c"),
        ])
        .unwrap();

        assert_eq!(batch[0].id(), Some("a"));
        assert!(batch[1].id().is_some_and(|id| !id.is_empty()));
        assert_eq!(batch[2].id(), Some("c"));
        assert_eq!(batch[1].content().as_ref(), b"2");
    }
}
