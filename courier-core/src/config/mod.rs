//! Shared transport configuration.
//!
//! This module introduces types to facilitate the configuration of publishers
//! and receivers.
//!
//! # Features:
//! - [`Config`]: Represents the main configuration structure. It's adorned with
//!   [`clap`] attributes to allow easy setup via command-line arguments and
//!   environment variables.
//! - [`Serializer`]: Specifies the payload format used by typed helpers.
//! - [`Backend`]: Enumerates the available broker backends.
//!
//! # Usage:
//! Flatten [`Config`] into a binary's CLI and hand it to
//! [`Transport::from_config`](crate::transport::Transport::from_config) to
//! obtain publishers and receivers for the selected backend.
//!
//! ```
//! use clap::Parser;
//! use courier::config::{Backend, Config};
//!
//! #[derive(Parser, Debug)]
//! struct Cli {
//!     #[command(flatten)]
//!     options: Config,
//! }
//!
//! let cli = Cli::parse_from(["app", "--backend", "in-memory", "--queue", "orders"]);
//! assert_eq!(cli.options.backend, Backend::InMemory);
//! assert_eq!(cli.options.queue, "orders");
//! ```

use clap::{Args, ValueEnum};

const DEFAULT_EXCHANGE: &str = "courier";
const DEFAULT_QUEUE: &str = "courier";
const DEFAULT_ROUTING_KEY: &str = "courier";
const DEFAULT_PREFETCH: u16 = 1;
const HELP_HEADING: &str = "Courier options";

/// Represents the main configuration structure for publishers and receivers.
#[derive(Args, Clone, PartialEq, Eq, Debug)]
pub struct Config {
    /// Specifies the broker backend to use.
    #[arg(long, help_heading = HELP_HEADING, value_enum, default_value_t = Backend::Amqp)]
    pub backend: Backend,

    /// Provides the URI for the AMQP broker, if the AMQP backend is selected.
    #[arg(long, help_heading = HELP_HEADING, env = "AMQP_URI", required_if_eq("backend", "amqp"))]
    pub amqp_uri: Option<String>,

    /// The exchange messages are published to (AMQP only).
    #[arg(long, help_heading = HELP_HEADING, default_value = DEFAULT_EXCHANGE)]
    pub exchange: String,

    /// The queue receivers consume from, and in-memory publishers send to.
    #[arg(long, help_heading = HELP_HEADING, default_value = DEFAULT_QUEUE)]
    pub queue: String,

    /// The routing key binding the queue to the exchange (AMQP only).
    #[arg(long, help_heading = HELP_HEADING, default_value = DEFAULT_ROUTING_KEY)]
    pub routing_key: String,

    /// The number of unacknowledged deliveries the broker may push to a
    /// receiver before waiting for acknowledgements.
    #[arg(long, help_heading = HELP_HEADING, default_value_t = DEFAULT_PREFETCH)]
    pub prefetch: u16,

    /// Let the broker settle deliveries on receipt. Confirm and reject become
    /// no-ops.
    #[arg(long, help_heading = HELP_HEADING)]
    pub auto_ack: bool,

    /// Maximum number of concurrent handler invocations per receiver. Handlers
    /// run one at a time when unset.
    #[arg(long, help_heading = HELP_HEADING)]
    pub max_concurrent_handlers: Option<usize>,

    /// Determines the serialization format used by typed payload helpers.
    #[arg(long, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Default::default(),
            amqp_uri: Default::default(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            routing_key: DEFAULT_ROUTING_KEY.to_string(),
            prefetch: DEFAULT_PREFETCH,
            auto_ack: false,
            max_concurrent_handlers: None,
            serializer: Default::default(),
        }
    }
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

/// Enumerates the available broker backends.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Backend {
    #[default]
    Amqp,
    InMemory,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        options: Config,
    }

    #[test]
    fn defaults_match_default_impl() {
        let cli = Cli::parse_from(["app", "--backend", "in-memory"]);
        let expected = Config {
            backend: Backend::InMemory,
            ..Default::default()
        };
        assert_eq!(cli.options, expected);
    }

    #[test]
    fn amqp_requires_uri() {
        std::env::remove_var("AMQP_URI");
        assert!(Cli::try_parse_from(["app", "--backend", "amqp"]).is_err());
        let cli = Cli::try_parse_from([
            "app",
            "--backend",
            "amqp",
            "--amqp-uri",
            "amqp://localhost:5672",
            "--prefetch",
            "8",
            "--auto-ack",
        ])
        .unwrap();
        assert_eq!(cli.options.prefetch, 8);
        assert!(cli.options.auto_ack);
    }
}
