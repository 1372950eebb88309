//! Backend selection from [`Config`].
//!
//! [`Transport`] turns a [`Config`] into publishers and receivers for the
//! configured backend, so binaries can switch between AMQP and the in-memory
//! broker without code changes.
//!
//! ```
//! use courier::{
//!     config::{Backend, Config},
//!     message::Message,
//!     queue::Publisher,
//!     transport::Transport,
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let transport = Transport::from_config(&Config {
//!     backend: Backend::InMemory,
//!     queue: "orders".to_string(),
//!     ..Default::default()
//! })?;
//!
//! let publisher = transport.publisher().await?;
//! publisher.send(vec![Message::new("order 1")]).await?;
//!
//! let broker = transport.broker().expect("in-memory transport");
//! assert_eq!(broker.message_count("orders"), 1);
//! # Ok(())
//! # }
//! ```
use crate::{
    config::{Backend, Config},
    error::{MessagingError, Result},
    queue::{
        amqp::{AMQPOptions, AMQPPublisher, AMQPReceiverBackend},
        in_memory::{InMemoryBroker, InMemoryReceiverOptions, ReceiveMode},
        Dispatch, Publisher,
    },
    receiver::{QueueReceiver, Receiver},
    serializer::Serializer,
};

enum Connection {
    Amqp { uri: String },
    InMemory(InMemoryBroker),
}

/// Publisher and receiver factory for the configured backend.
pub struct Transport {
    config: Config,
    connection: Connection,
}

impl Transport {
    /// Initializes the [`Transport`] with the provided [`Config`].
    pub fn from_config(config: &Config) -> Result<Self> {
        let connection = match config.backend {
            Backend::Amqp => Connection::Amqp {
                uri: config.amqp_uri.clone().ok_or_else(|| {
                    MessagingError::InvalidInput("the AMQP backend requires an AMQP URI".into())
                })?,
            },
            Backend::InMemory => Connection::InMemory(InMemoryBroker::new()),
        };

        Ok(Self {
            config: config.clone(),
            connection,
        })
    }

    /// Short-hand for an in-memory [`Transport`] with default settings.
    pub fn in_memory() -> Self {
        Self {
            config: Config {
                backend: Backend::InMemory,
                ..Default::default()
            },
            connection: Connection::InMemory(InMemoryBroker::new()),
        }
    }

    /// The in-memory broker, when that backend is selected.
    pub fn broker(&self) -> Option<&InMemoryBroker> {
        match &self.connection {
            Connection::InMemory(broker) => Some(broker),
            Connection::Amqp { .. } => None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn serializer(&self) -> Serializer {
        Serializer::from(&self.config)
    }

    pub fn dispatch(&self) -> Dispatch {
        Dispatch::with_limit(self.config.max_concurrent_handlers)
    }

    fn amqp_options<'a>(&'a self, uri: &'a str) -> AMQPOptions<'a> {
        AMQPOptions {
            uri,
            exchange: &self.config.exchange,
            queue: &self.config.queue,
            routing_key: &self.config.routing_key,
            prefetch: self.config.prefetch,
            auto_ack: self.config.auto_ack,
            dispatch: self.dispatch(),
        }
    }

    /// A publisher for the configured destination. Connects when AMQP is
    /// selected.
    pub async fn publisher(&self) -> Result<Box<dyn Publisher>> {
        match &self.connection {
            Connection::Amqp { uri } => Ok(Box::new(
                AMQPPublisher::connect(&self.amqp_options(uri)).await?,
            )),
            Connection::InMemory(broker) => Ok(Box::new(broker.publisher(&self.config.queue))),
        }
    }

    /// A receiver for the configured queue. Nothing is opened until
    /// [`Receiver::listen`] is called.
    pub fn receiver(&self) -> Box<dyn Receiver> {
        match &self.connection {
            Connection::Amqp { uri } => Box::new(QueueReceiver::new(AMQPReceiverBackend::new(
                &self.amqp_options(uri),
            ))),
            Connection::InMemory(broker) => Box::new(broker.receiver(
                &self.config.queue,
                InMemoryReceiverOptions {
                    mode: if self.config.auto_ack {
                        ReceiveMode::ReceiveAndDelete
                    } else {
                        ReceiveMode::PeekLock
                    },
                    prefetch: usize::from(self.config.prefetch),
                    dispatch: self.dispatch(),
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::Message, queue::Capabilities, receiver::ReceiverState};

    #[test]
    fn amqp_without_uri_is_rejected() {
        let config = Config {
            backend: Backend::Amqp,
            amqp_uri: None,
            ..Default::default()
        };
        assert!(matches!(
            Transport::from_config(&config),
            Err(MessagingError::InvalidInput(_))
        ));
    }

    #[test]
    fn amqp_receiver_reports_its_capabilities() {
        let transport = Transport::from_config(&Config {
            backend: Backend::Amqp,
            amqp_uri: Some("amqp://localhost:5672".into()),
            ..Default::default()
        })
        .unwrap();

        let receiver = transport.receiver();
        assert_eq!(receiver.capabilities(), Capabilities::default());
        assert_eq!(receiver.state(), ReceiverState::Idle);
        assert!(transport.broker().is_none());
    }

    #[test]
    fn handler_concurrency_follows_config() {
        let transport = Transport::from_config(&Config {
            backend: Backend::InMemory,
            max_concurrent_handlers: Some(8),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(transport.dispatch().max_in_flight(), 8);
        assert_eq!(Transport::in_memory().dispatch(), Dispatch::Sequential);
    }

    #[tokio::test]
    async fn in_memory_transport_shares_one_broker() {
        let transport = Transport::in_memory();
        transport
            .publisher()
            .await
            .unwrap()
            .send(vec![Message::new("x")])
            .await
            .unwrap();

        let broker = transport.broker().unwrap();
        assert_eq!(broker.message_count(&transport.config().queue), 1);
        assert!(transport.receiver().capabilities().dead_letter);
    }
}
