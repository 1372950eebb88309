//! Serialization helpers for typed message payloads.
//!
//! Message content is opaque bytes as far as brokers are concerned. This
//! module provides a small, closed set of binary formats that can be used to
//! turn application types into content and back, see
//! [`Message::from_payload`](crate::message::Message::from_payload).
//!
//! # Examples
//!
//! ```rust
//! use courier::serializer::Serializer;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct ShipmentDispatched {
//!     carrier: String,
//!     parcels: u32,
//! }
//!
//! let event = ShipmentDispatched { carrier: "acme".to_string(), parcels: 2 };
//! for serializer in [Serializer::Postcard, Serializer::Cbor] {
//!     let bytes = serializer.to_bytes(&event).unwrap();
//!     let decoded: ShipmentDispatched = serializer.from_bytes(&bytes).unwrap();
//!     assert_eq!(decoded, event);
//! }
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, Config};

/// Supported payload formats.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Serializer {
    /// The value recorded in the `content-type` property.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Postcard => "application/postcard",
            Self::Cbor => "application/cbor",
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            "application/postcard" => Some(Self::Postcard),
            "application/cbor" => Some(Self::Cbor),
            _ => None,
        }
    }

    /// Encode `value` as message content.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Postcard => Ok(postcard::to_allocvec(value)?),
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result)?;
                Ok(result)
            }
        }
    }

    /// Decode message content produced by [`Serializer::to_bytes`].
    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        match config.serializer {
            config::Serializer::Postcard => Self::Postcard,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_round_trips() {
        for serializer in [Serializer::Postcard, Serializer::Cbor] {
            assert_eq!(
                Serializer::from_content_type(serializer.content_type()),
                Some(serializer)
            );
        }
        assert_eq!(Serializer::from_content_type("text/plain"), None);
    }
}
