#![cfg_attr(docsrs, feature(doc_cfg))]

//! Broker-agnostic messaging for Rust.
//!
//! Courier puts one publisher/receiver interface in front of several message
//! brokers, so application code never touches a broker's client API. The
//! interesting part is the receive side: a listen loop with an explicit,
//! per-message acknowledgment protocol that behaves the same on every
//! backend.
//!
//! # Overview
//!
//! - [`Publisher`](crate::queue::Publisher) sends a batch of
//!   [`Message`](crate::message::Message)s to one destination.
//! - [`Receiver`](crate::receiver::Receiver) listens on a queue, hands every
//!   delivery to a [`Handler`](crate::receiver::Handler) and exposes
//!   `confirm`, `reject`, `dead_letter` and `keep_alive`.
//! - [`QueueReceiver`](crate::receiver::QueueReceiver) implements the receiver
//!   state machine once, on top of a small backend trait pair
//!   ([`ReceiverBackend`](crate::queue::ReceiverBackend) and
//!   [`BackendChannel`](crate::queue::BackendChannel)).
//!
//! Two backends ship with the crate:
//!
//! - [`amqp`](crate::queue::amqp), over `lapin`. AMQP has no dead-letter or
//!   lock renewal primitive, so those operations fail with
//!   [`MessagingError::Unsupported`](crate::error::MessagingError::Unsupported).
//! - [`in_memory`](crate::queue::in_memory), a brokered queue with peek-lock
//!   semantics: lock duration, lock renewal, delivery counts and a
//!   dead-letter sub-queue. It backs the test suite.
//!
//! [`Transport`](crate::transport::Transport) picks a backend from
//! [`Config`](crate::config::Config), which binaries flatten into their
//! command line.
//!
//! # Acknowledgment
//!
//! Handlers settle messages explicitly. Returning successfully does not
//! confirm anything. Returning an error (or panicking) rejects every message
//! of the batch that is still pending, and the loop carries on. Each message
//! can be settled exactly once; a second settlement is refused with
//! [`MessagingError::InvalidState`](crate::error::MessagingError::InvalidState)
//! before it reaches the broker.
//!
//! ```
//! use courier::{
//!     message::Message,
//!     queue::{in_memory::{InMemoryBroker, InMemoryReceiverOptions}, Publisher},
//!     receiver::{Receiver, ReceiverExt},
//!     CancellationToken,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let broker = InMemoryBroker::new();
//! broker
//!     .publisher("jobs")
//!     .send(vec![Message::new("a"), Message::new("b")])
//!     .await?;
//!
//! let receiver = Arc::new(broker.receiver("jobs", InMemoryReceiverOptions::default()));
//! let cancel = CancellationToken::new();
//!
//! let handler = {
//!     let receiver = receiver.clone();
//!     let broker = broker.clone();
//!     let cancel = cancel.clone();
//!     move |messages: Vec<Message>, _: CancellationToken| {
//!         let receiver = receiver.clone();
//!         let broker = broker.clone();
//!         let cancel = cancel.clone();
//!         async move {
//!             receiver.confirm(&messages).await?;
//!             if broker.message_count("jobs") == 0 {
//!                 cancel.cancel();
//!             }
//!             Ok::<_, anyhow::Error>(())
//!         }
//!     }
//! };
//!
//! receiver.listen_with(handler, cancel).await?;
//! assert_eq!(broker.message_count("jobs"), 0);
//! # Ok(())
//! # }
//! ```

pub mod acker;
pub mod common;
pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod receiver;
pub mod retry;
pub mod serializer;
pub mod transport;

pub use async_trait::async_trait;
pub use futures;
pub use tokio_util::sync::CancellationToken;
pub use tracing;
