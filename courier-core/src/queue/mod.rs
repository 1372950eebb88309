//! Backend bindings.
//!
//! Different brokers provide many different configuration options and
//! features, and we do not attempt to provide a unified interface for all of
//! them. Rather, this module defines the bare minimum a broker has to offer so
//! that the generic [`QueueReceiver`](crate::receiver::QueueReceiver) can run
//! its listen loop and acknowledgment protocol on top of it:
//!
//! - [`ReceiverBackend`]: opens a [`Subscription`], i.e. a channel plus a
//!   stream of raw deliveries.
//! - [`BackendChannel`]: settles deliveries and answers depth queries while
//!   the subscription is open.
//! - [`Publisher`]: sends batches of messages.
//!
//! Backends declare up front which optional facilities they have through
//! [`Capabilities`], and how their deliveries may be dispatched to handlers
//! through [`Dispatch`].
//!
//! Two bindings ship with the crate:
//! - [`amqp`]: a traditional broker over [`lapin`].
//! - [`in_memory`]: a brokered, lock based queue emulated in process. It
//!   supports every optional facility and is well suited for tests.
use std::{num::NonZeroUsize, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::{acker::DeliveryToken, error::Result, message::Properties};

/// The optional facilities of a backend.
///
/// Callers that need dead-lettering or lock renewal should check these rather
/// than assume them; the corresponding operations fail with
/// [`MessagingError::Unsupported`](crate::error::MessagingError::Unsupported)
/// otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Messages can be moved to a terminal failure store.
    pub dead_letter: bool,
    /// Processing locks can be renewed.
    pub keep_alive: bool,
}

/// How deliveries of one subscription are handed to the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// One handler invocation at a time, in delivery order.
    #[default]
    Sequential,
    /// Up to the given number of handler invocations run concurrently. The
    /// handler must be safe to run concurrently with itself.
    Concurrent(NonZeroUsize),
}

impl Dispatch {
    /// `Sequential` for `None`, `0` and `1`, `Concurrent` otherwise.
    pub fn with_limit(limit: Option<usize>) -> Self {
        match limit.and_then(NonZeroUsize::new) {
            Some(limit) if limit.get() > 1 => Self::Concurrent(limit),
            _ => Self::Sequential,
        }
    }

    pub fn max_in_flight(&self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Concurrent(limit) => limit.get(),
        }
    }
}

/// A delivery as produced by a backend, before the receiver turns it into a
/// [`Message`](crate::message::Message).
#[derive(Debug)]
pub struct RawDelivery {
    /// The message id as carried by the broker, if any.
    pub id: Option<String>,
    pub content: Bytes,
    pub properties: Properties,
    pub system_properties: Properties,
    /// Token used to settle the delivery.
    pub token: DeliveryToken,
    /// Whether the broker already settled the delivery on receipt.
    pub settled: bool,
}

/// Stream of deliveries of an open subscription.
///
/// An `Err` item or the end of the stream means the subscription was lost.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// An open subscription.
pub struct Subscription<C> {
    pub channel: C,
    pub deliveries: DeliveryStream,
}

/// The receive side of a backend.
#[async_trait]
pub trait ReceiverBackend: Send + Sync + 'static {
    type Channel: BackendChannel;

    /// Short backend name, used in logs and capability errors.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    fn dispatch(&self) -> Dispatch;

    /// Open a subscription on the configured destination.
    async fn subscribe(&self) -> Result<Subscription<Self::Channel>>;
}

/// The channel of an open subscription.
///
/// Implementations for backends lacking a facility return
/// [`MessagingError::Unsupported`](crate::error::MessagingError::Unsupported)
/// from the corresponding method.
#[async_trait]
pub trait BackendChannel: Send + Sync + 'static {
    async fn confirm(&self, token: &DeliveryToken) -> Result<()>;

    async fn reject(&self, token: &DeliveryToken) -> Result<()>;

    async fn dead_letter(
        &self,
        token: &DeliveryToken,
        reason: &str,
        description: &str,
    ) -> Result<()>;

    async fn keep_alive(&self, token: &DeliveryToken, extension: Option<Duration>) -> Result<()>;

    /// Approximate number of messages waiting in the destination.
    async fn message_count(&self) -> Result<u64>;

    /// Release the subscription. Unsettled deliveries become available to
    /// other consumers again.
    async fn close(&self) -> Result<()>;
}

pub mod amqp;
pub mod in_memory;
pub mod publisher;

pub use publisher::{Publisher, PublisherExt};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_limits() {
        assert_eq!(Dispatch::with_limit(None), Dispatch::Sequential);
        assert_eq!(Dispatch::with_limit(Some(0)), Dispatch::Sequential);
        assert_eq!(Dispatch::with_limit(Some(1)), Dispatch::Sequential);
        assert_eq!(Dispatch::with_limit(Some(4)).max_in_flight(), 4);
        assert_eq!(Dispatch::Sequential.max_in_flight(), 1);
    }
}
