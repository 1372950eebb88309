//! Provides the bookkeeping behind the acknowledgment protocol.
//!
//! Every message handed out by a [`Receiver`](crate::receiver::Receiver)
//! carries an [`AckHandle`]: the identity of the receiver that delivered it,
//! the subscription it arrived on, and the backend token (an AMQP delivery
//! tag, a lock token) needed to settle it. Settling means exactly one of confirm, reject or dead-letter.
//!
//! The receiver tracks each outstanding delivery in an [`AckLedger`]. The
//! per-message state machine is small:
//!
//! ```text
//!            claim              settle
//! Pending ----------> Settling --------> (removed)
//!    ^                   |
//!    +-------------------+
//!      backend call failed
//! ```
//!
//! A delivery can only be claimed while `Pending`, so two racing settlements
//! of the same message cannot both reach the broker. This matters for AMQP,
//! where acknowledging an unknown delivery tag closes the whole channel.
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::trace;
use uuid::Uuid;

use crate::error::{MessagingError, Result};

/// Identity of a receiver instance.
///
/// Each [`QueueReceiver`](crate::receiver::QueueReceiver) draws a fresh id on
/// construction, so handles can never be confused between instances, even
/// between two receivers on the same queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

impl ReceiverId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ReceiverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "receiver-{}", self.0)
    }
}

/// Identity of one subscription of a receiver.
///
/// Backend tokens are only unique within a subscription: AMQP delivery tags
/// restart at 1 on every channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Backend token identifying one delivery.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeliveryToken {
    /// AMQP delivery tag, scoped to the channel that received it.
    Tag(u64),
    /// Lock token of a peek-locked delivery.
    Lock(Uuid),
}

impl std::fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tag(tag) => write!(f, "tag:{tag}"),
            Self::Lock(token) => write!(f, "lock:{token}"),
        }
    }
}

/// The acknowledgment handle attached to delivered messages.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AckHandle {
    receiver: ReceiverId,
    session: SessionId,
    token: DeliveryToken,
    settled_on_receipt: bool,
}

impl AckHandle {
    pub(crate) fn new(
        receiver: ReceiverId,
        session: SessionId,
        token: DeliveryToken,
        settled_on_receipt: bool,
    ) -> Self {
        Self {
            receiver,
            session,
            token,
            settled_on_receipt,
        }
    }

    pub fn receiver(&self) -> ReceiverId {
        self.receiver
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn token(&self) -> &DeliveryToken {
        &self.token
    }

    /// Whether the broker settled the delivery when handing it out (AMQP
    /// auto-ack, receive-and-delete). Confirming or rejecting such a message
    /// does nothing.
    pub fn settled_on_receipt(&self) -> bool {
        self.settled_on_receipt
    }
}

/// The terminal outcomes of a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    Confirm,
    Reject,
    DeadLetter,
}

impl std::fmt::Display for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirm => write!(f, "confirm"),
            Self::Reject => write!(f, "reject"),
            Self::DeadLetter => write!(f, "dead-letter"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckState {
    /// Delivered, not yet settled.
    Pending,
    /// A settlement is in flight.
    Settling,
}

/// Outstanding deliveries of one subscription.
#[derive(Default)]
pub struct AckLedger {
    deliveries: DashMap<DeliveryToken, AckState>,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a fresh delivery.
    pub fn track(&self, token: DeliveryToken) {
        self.deliveries.insert(token, AckState::Pending);
    }

    pub fn state(&self, token: &DeliveryToken) -> Option<AckState> {
        self.deliveries.get(token).map(|state| *state)
    }

    /// Number of deliveries that are not settled yet.
    pub fn outstanding(&self) -> usize {
        self.deliveries.len()
    }

    /// Stop tracking a delivery the broker no longer associates with us.
    pub fn forget(&self, token: &DeliveryToken) {
        self.deliveries.remove(token);
    }

    /// Ensure the delivery is pending without claiming it.
    pub fn ensure_pending(&self, token: &DeliveryToken, message_id: &str) -> Result<()> {
        match self.state(token) {
            Some(AckState::Pending) => Ok(()),
            Some(AckState::Settling) => Err(MessagingError::invalid_state(format!(
                "message {message_id} is being settled"
            ))),
            None => Err(MessagingError::invalid_state(format!(
                "message {message_id} is not awaiting settlement"
            ))),
        }
    }

    /// Move a delivery from `Pending` to `Settling`.
    ///
    /// The returned [`Claim`] must be [settled](Claim::settle) once the
    /// backend accepted the settlement; dropping it instead puts the delivery
    /// back to `Pending`.
    pub fn claim(&self, token: &DeliveryToken, message_id: &str) -> Result<Claim<'_>> {
        match self.deliveries.get_mut(token) {
            Some(mut state) if *state == AckState::Pending => {
                *state = AckState::Settling;
            }
            Some(_) => {
                return Err(MessagingError::invalid_state(format!(
                    "message {message_id} is being settled"
                )))
            }
            None => {
                return Err(MessagingError::invalid_state(format!(
                    "message {message_id} is not awaiting settlement"
                )))
            }
        }

        Ok(Claim {
            ledger: self,
            token: token.clone(),
            settled: false,
        })
    }
}

/// Exclusive right to settle one delivery.
pub struct Claim<'a> {
    ledger: &'a AckLedger,
    token: DeliveryToken,
    settled: bool,
}

impl Claim<'_> {
    /// Record the settlement and stop tracking the delivery.
    pub fn settle(mut self, settlement: Settlement) {
        trace!(token = %self.token, %settlement, "delivery settled");
        self.ledger.deliveries.remove(&self.token);
        self.settled = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        if let Some(mut state) = self.ledger.deliveries.get_mut(&self.token) {
            *state = AckState::Pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receiver_ids_are_unique() {
        assert_ne!(ReceiverId::next(), ReceiverId::next());
        assert_ne!(SessionId::next(), SessionId::next());
    }

    #[test]
    fn settled_delivery_cannot_be_claimed_again() {
        let ledger = AckLedger::new();
        let token = DeliveryToken::Tag(1);
        ledger.track(token.clone());

        ledger
            .claim(&token, "a")
            .unwrap()
            .settle(Settlement::Confirm);

        assert_eq!(ledger.state(&token), None);
        assert!(matches!(
            ledger.claim(&token, "a"),
            Err(MessagingError::InvalidState(_))
        ));
    }

    #[test]
    fn concurrent_claims_are_exclusive() {
        let ledger = AckLedger::new();
        let token = DeliveryToken::Tag(7);
        ledger.track(token.clone());

        let claim = ledger.claim(&token, "a").unwrap();
        assert_eq!(ledger.state(&token), Some(AckState::Settling));
        assert!(ledger.claim(&token, "a").is_err());
        assert!(ledger.ensure_pending(&token, "a").is_err());
        drop(claim);
    }

    #[test]
    fn dropped_claim_returns_to_pending() {
        let ledger = AckLedger::new();
        let token = DeliveryToken::Lock(Uuid::new_v4());
        ledger.track(token.clone());

        drop(ledger.claim(&token, "a").unwrap());

        assert_eq!(ledger.state(&token), Some(AckState::Pending));
        assert_eq!(ledger.outstanding(), 1);
        assert!(ledger.claim(&token, "a").is_ok());
    }
}
