//! The receive side: the listen loop and the acknowledgment protocol.
//!
//! A [`Receiver`] owns one subscription at a time. [`Receiver::listen`] opens
//! it, hands every delivery to a [`Handler`] and suspends until the supplied
//! [`CancellationToken`] fires or the subscription is lost. Handlers settle
//! messages explicitly through [`Receiver::confirm`], [`Receiver::reject`],
//! [`Receiver::dead_letter`] and renew their locks through
//! [`Receiver::keep_alive`]. A handler that fails (or panics) has every
//! message of its batch that is still pending rejected for redelivery; the
//! loop itself keeps running.
//!
//! [`QueueReceiver`] implements this once on top of any
//! [`ReceiverBackend`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use courier::{
//!     message::Message,
//!     queue::{in_memory::{InMemoryBroker, InMemoryReceiverOptions}, Publisher},
//!     receiver::{Receiver, ReceiverExt},
//!     CancellationToken,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let broker = InMemoryBroker::new();
//! broker.publisher("orders").send(vec![Message::new("order 1")]).await?;
//!
//! let receiver = Arc::new(broker.receiver("orders", InMemoryReceiverOptions::default()));
//! let cancel = CancellationToken::new();
//!
//! let listener = {
//!     let receiver = receiver.clone();
//!     let cancel = cancel.clone();
//!     move |messages: Vec<Message>, _: CancellationToken| {
//!         let receiver = receiver.clone();
//!         let cancel = cancel.clone();
//!         async move {
//!             receiver.confirm(&messages).await?;
//!             cancel.cancel();
//!             Ok::<_, anyhow::Error>(())
//!         }
//!     }
//! };
//!
//! receiver.listen_with(listener, cancel).await?;
//! assert_eq!(broker.message_count("orders"), 0);
//! # Ok(())
//! # }
//! ```
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::{Future, FutureExt, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    acker::{AckHandle, ReceiverId},
    error::{MessagingError, Result},
    message::Message,
    queue::{BackendChannel, Capabilities, ReceiverBackend},
};

mod session;
mod state;

use session::{Action, Session};
pub use state::ReceiverState;
use state::StateCell;

/// User code invoked for every batch of deliveries.
///
/// Any `Fn(Vec<Message>, CancellationToken) -> impl Future<Output =
/// anyhow::Result<()>>` closure is a handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, messages: Vec<Message>, cancel: CancellationToken) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Vec<Message>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, messages: Vec<Message>, cancel: CancellationToken) -> anyhow::Result<()> {
        (self)(messages, cancel).await
    }
}

/// The receiver capability set.
#[async_trait]
pub trait Receiver: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    fn state(&self) -> ReceiverState;

    /// Open a subscription and dispatch deliveries to `handler` until
    /// `cancel` fires.
    ///
    /// Returns once in-flight handlers have finished and the subscription is
    /// released. Fails with [`MessagingError::InvalidState`] when the receiver
    /// is already listening or faulted, and with the underlying error when the
    /// subscription is lost, leaving the receiver
    /// [`Faulted`](ReceiverState::Faulted).
    async fn listen(&self, handler: Arc<dyn Handler>, cancel: CancellationToken) -> Result<()>;

    /// Remove the messages from the queue permanently.
    async fn confirm(&self, messages: &[Message]) -> Result<()>;

    /// Return the message to the queue for redelivery.
    async fn reject(&self, message: &Message) -> Result<()>;

    /// Move the message to the backend's terminal failure store.
    async fn dead_letter(&self, message: &Message, reason: &str, description: &str) -> Result<()>;

    /// Renew the processing lock of the message, by `extension` or by the
    /// backend's default lock duration.
    async fn keep_alive(&self, message: &Message, extension: Option<Duration>) -> Result<()>;

    /// Approximate number of messages waiting in the queue.
    async fn message_count(&self) -> Result<u64>;
}

#[async_trait]
impl<R: ?Sized + Receiver> Receiver for Box<R> {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn state(&self) -> ReceiverState {
        (**self).state()
    }

    async fn listen(&self, handler: Arc<dyn Handler>, cancel: CancellationToken) -> Result<()> {
        (**self).listen(handler, cancel).await
    }

    async fn confirm(&self, messages: &[Message]) -> Result<()> {
        (**self).confirm(messages).await
    }

    async fn reject(&self, message: &Message) -> Result<()> {
        (**self).reject(message).await
    }

    async fn dead_letter(&self, message: &Message, reason: &str, description: &str) -> Result<()> {
        (**self).dead_letter(message, reason, description).await
    }

    async fn keep_alive(&self, message: &Message, extension: Option<Duration>) -> Result<()> {
        (**self).keep_alive(message, extension).await
    }

    async fn message_count(&self) -> Result<u64> {
        (**self).message_count().await
    }
}

#[async_trait]
impl<R: ?Sized + Receiver> Receiver for Arc<R> {
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn state(&self) -> ReceiverState {
        (**self).state()
    }

    async fn listen(&self, handler: Arc<dyn Handler>, cancel: CancellationToken) -> Result<()> {
        (**self).listen(handler, cancel).await
    }

    async fn confirm(&self, messages: &[Message]) -> Result<()> {
        (**self).confirm(messages).await
    }

    async fn reject(&self, message: &Message) -> Result<()> {
        (**self).reject(message).await
    }

    async fn dead_letter(&self, message: &Message, reason: &str, description: &str) -> Result<()> {
        (**self).dead_letter(message, reason, description).await
    }

    async fn keep_alive(&self, message: &Message, extension: Option<Duration>) -> Result<()> {
        (**self).keep_alive(message, extension).await
    }

    async fn message_count(&self) -> Result<u64> {
        (**self).message_count().await
    }
}

impl<T: ?Sized> ReceiverExt for T where T: Receiver {}

/// Extension trait for [`Receiver`].
#[async_trait]
pub trait ReceiverExt: Receiver {
    /// [`Receiver::listen`] with any [`Handler`], typically a closure.
    async fn listen_with<H: Handler>(&self, handler: H, cancel: CancellationToken) -> Result<()> {
        self.listen(Arc::new(handler), cancel).await
    }

    /// Confirm a single message.
    async fn confirm_one(&self, message: &Message) -> Result<()> {
        self.confirm(std::slice::from_ref(message)).await
    }
}

/// The receiver state machine, generic over the backend.
pub struct QueueReceiver<B: ReceiverBackend> {
    id: ReceiverId,
    backend: B,
    state: StateCell,
    session: RwLock<Option<Arc<Session<B::Channel>>>>,
}

impl<B: ReceiverBackend> QueueReceiver<B> {
    pub fn new(backend: B) -> Self {
        Self {
            id: ReceiverId::next(),
            backend,
            state: StateCell::new(),
            session: RwLock::new(None),
        }
    }

    pub fn id(&self) -> ReceiverId {
        self.id
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn require(&self, supported: bool, operation: &'static str) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(MessagingError::unsupported(operation, self.backend.name()))
        }
    }

    /// The handle of a message delivered by this receiver.
    fn handle_of<'a>(&self, message: &'a Message) -> Result<&'a AckHandle> {
        match message.ack_handle() {
            Some(handle) if handle.receiver() == self.id => Ok(handle),
            _ => Err(MessagingError::ForeignMessage {
                message_id: message.log_id().to_string(),
            }),
        }
    }

    async fn session(&self, operation: &str) -> Result<Arc<Session<B::Channel>>> {
        self.session.read().await.clone().ok_or_else(|| {
            MessagingError::invalid_state(format!("cannot {operation}: the channel is not open"))
        })
    }

    async fn settle(&self, message: &Message, operation: &str, action: Action<'_>) -> Result<()> {
        let handle = self.handle_of(message)?;
        let session = self.session(operation).await?;
        session.settle(message, handle, action).await
    }

    /// Release the subscription and record the terminal state of a listen
    /// call.
    async fn shut_down(&self, outcome: Result<()>) -> Result<()> {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            let outstanding = session.outstanding();
            if outstanding > 0 {
                debug!(receiver = %self.id, outstanding, "releasing unsettled deliveries");
            }
            if let Err(err) = session.channel().close().await {
                warn!(receiver = %self.id, %err, "failed to close channel");
            }
        }

        match outcome {
            Ok(()) => {
                self.state.set(ReceiverState::Closed);
                info!(receiver = %self.id, backend = self.backend.name(), "receiver closed");
                Ok(())
            }
            Err(err) => {
                self.state.set(ReceiverState::Faulted);
                error!(receiver = %self.id, backend = self.backend.name(), %err, "receiver faulted");
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<B: ReceiverBackend> Receiver for QueueReceiver<B> {
    fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    fn state(&self) -> ReceiverState {
        self.state.get()
    }

    async fn listen(&self, handler: Arc<dyn Handler>, cancel: CancellationToken) -> Result<()> {
        self.state.begin_listening()?;

        let subscription = match self.backend.subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.state.set(ReceiverState::Idle);
                return Err(err);
            }
        };

        let session = Arc::new(Session::new(self.id, subscription.channel));
        *self.session.write().await = Some(session.clone());
        let mut deliveries = subscription.deliveries;

        let dispatch = self.backend.dispatch();
        let limiter = Arc::new(Semaphore::new(dispatch.max_in_flight()));
        let tracker = TaskTracker::new();
        info!(receiver = %self.id, backend = self.backend.name(), ?dispatch, "listening");

        let outcome = loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                delivery = deliveries.next() => delivery,
            };

            match delivery {
                Some(Ok(delivery)) => {
                    let message = session.admit(delivery);
                    tracker.spawn(dispatch_batch(
                        handler.clone(),
                        session.clone(),
                        vec![message],
                        cancel.clone(),
                        permit,
                    ));
                }
                Some(Err(err)) => break Err(err),
                None => {
                    break Err(MessagingError::transport(anyhow!(
                        "subscription ended unexpectedly"
                    )))
                }
            }
        };

        self.state.set(ReceiverState::Draining);
        drop(deliveries);
        tracker.close();
        debug!(receiver = %self.id, in_flight = tracker.len(), "draining");
        tracker.wait().await;

        self.shut_down(outcome).await
    }

    async fn confirm(&self, messages: &[Message]) -> Result<()> {
        let handles = messages
            .iter()
            .map(|message| self.handle_of(message))
            .collect::<Result<Vec<_>>>()?;
        let session = self.session("confirm").await?;

        for (message, handle) in messages.iter().zip(handles) {
            session.settle(message, handle, Action::Confirm).await?;
        }

        Ok(())
    }

    async fn reject(&self, message: &Message) -> Result<()> {
        self.settle(message, "reject", Action::Reject).await
    }

    async fn dead_letter(&self, message: &Message, reason: &str, description: &str) -> Result<()> {
        self.require(self.capabilities().dead_letter, "dead-letter")?;
        self.settle(
            message,
            "dead-letter",
            Action::DeadLetter {
                reason,
                description,
            },
        )
        .await
    }

    async fn keep_alive(&self, message: &Message, extension: Option<Duration>) -> Result<()> {
        self.require(self.capabilities().keep_alive, "keep-alive")?;
        let handle = self.handle_of(message)?;
        let session = self.session("keep alive").await?;
        session.keep_alive(message, handle, extension).await
    }

    async fn message_count(&self) -> Result<u64> {
        self.session("count messages")
            .await?
            .channel()
            .message_count()
            .await
    }
}

/// Run the handler on one batch and reject what it left pending if it fails.
async fn dispatch_batch<C: BackendChannel>(
    handler: Arc<dyn Handler>,
    session: Arc<Session<C>>,
    messages: Vec<Message>,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) {
    let outcome = AssertUnwindSafe(handler.handle(messages.clone(), cancel))
        .catch_unwind()
        .await;

    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => MessagingError::Handler { err },
        Err(panic) => MessagingError::Handler {
            err: anyhow!("handler panicked: {}", panic_message(panic.as_ref())),
        },
    };

    let ids: Vec<&str> = messages.iter().map(Message::log_id).collect();
    warn!(%err, messages = ?ids, "handler failed, rejecting batch");

    for message in &messages {
        let Some(handle) = message.ack_handle() else {
            continue;
        };
        if !session.is_pending(handle) {
            continue;
        }
        if let Err(err) = session.settle(message, handle, Action::Reject).await {
            error!(message_id = message.log_id(), %err, "failed to reject message");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    };

    use bytes::Bytes;

    use super::*;
    use crate::{
        acker::DeliveryToken,
        message::Properties,
        queue::{Dispatch, RawDelivery, Subscription},
    };

    type Acks = Arc<Mutex<Vec<(u64, u64)>>>;

    /// Hands out delivery tag 1 on every subscription, like a fresh AMQP
    /// channel would.
    #[derive(Default)]
    struct TagBackend {
        subscriptions: AtomicU64,
        acks: Acks,
    }

    struct TagChannel {
        subscription: u64,
        acks: Acks,
    }

    fn tag_of(token: &DeliveryToken) -> u64 {
        match token {
            DeliveryToken::Tag(tag) => *tag,
            DeliveryToken::Lock(_) => unreachable!("tag backend issued a lock"),
        }
    }

    #[async_trait]
    impl BackendChannel for TagChannel {
        async fn confirm(&self, token: &DeliveryToken) -> Result<()> {
            self.acks
                .lock()
                .unwrap()
                .push((self.subscription, tag_of(token)));
            Ok(())
        }

        async fn reject(&self, _: &DeliveryToken) -> Result<()> {
            Ok(())
        }

        async fn dead_letter(&self, _: &DeliveryToken, _: &str, _: &str) -> Result<()> {
            Err(MessagingError::unsupported("dead-letter", "tag"))
        }

        async fn keep_alive(&self, _: &DeliveryToken, _: Option<Duration>) -> Result<()> {
            Err(MessagingError::unsupported("keep-alive", "tag"))
        }

        async fn message_count(&self) -> Result<u64> {
            Ok(0)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ReceiverBackend for TagBackend {
        type Channel = TagChannel;

        fn name(&self) -> &'static str {
            "tag"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        fn dispatch(&self) -> Dispatch {
            Dispatch::Sequential
        }

        async fn subscribe(&self) -> Result<Subscription<TagChannel>> {
            let subscription = self.subscriptions.fetch_add(1, Ordering::SeqCst) + 1;
            let delivery = RawDelivery {
                id: Some(format!("order-{subscription}")),
                content: Bytes::from_static(b"payload"),
                properties: Properties::new(),
                system_properties: Properties::new(),
                token: DeliveryToken::Tag(1),
                settled: false,
            };

            Ok(Subscription {
                channel: TagChannel {
                    subscription,
                    acks: self.acks.clone(),
                },
                deliveries: futures::stream::iter([Ok(delivery)])
                    .chain(futures::stream::pending())
                    .boxed(),
            })
        }
    }

    #[tokio::test]
    async fn message_kept_from_an_earlier_listen_cannot_settle_a_new_delivery() {
        let acks = Acks::default();
        let receiver = Arc::new(QueueReceiver::new(TagBackend {
            acks: acks.clone(),
            ..Default::default()
        }));

        let kept = Arc::new(Mutex::new(Vec::new()));
        let keep = {
            let kept = kept.clone();
            move |messages: Vec<Message>, cancel: CancellationToken| {
                let kept = kept.clone();
                async move {
                    kept.lock().unwrap().extend(messages);
                    cancel.cancel();
                    anyhow::Ok(())
                }
            }
        };
        receiver
            .listen_with(keep, CancellationToken::new())
            .await
            .unwrap();
        let stale = kept.lock().unwrap().remove(0);

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let settle = {
            let receiver = receiver.clone();
            let outcomes = outcomes.clone();
            move |messages: Vec<Message>, cancel: CancellationToken| {
                let receiver = receiver.clone();
                let stale = stale.clone();
                let outcomes = outcomes.clone();
                async move {
                    let earlier = receiver.confirm_one(&stale).await;
                    let current = receiver.confirm(&messages).await;
                    outcomes.lock().unwrap().extend([earlier, current]);
                    cancel.cancel();
                    anyhow::Ok(())
                }
            }
        };
        receiver
            .listen_with(settle, CancellationToken::new())
            .await
            .unwrap();

        let outcomes = outcomes.lock().unwrap();
        assert!(matches!(outcomes[0], Err(MessagingError::InvalidState(_))));
        assert!(outcomes[1].is_ok());
        assert_eq!(*acks.lock().unwrap(), [(2, 1)]);
        assert_eq!(receiver.state(), ReceiverState::Closed);
    }
}
