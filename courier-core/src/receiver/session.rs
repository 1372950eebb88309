use std::time::Duration;

use tracing::instrument;

use crate::{
    acker::{AckHandle, AckLedger, AckState, ReceiverId, SessionId, Settlement},
    error::{MessagingError, Result},
    message::{generate_id, Message},
    queue::{BackendChannel, RawDelivery},
};

/// A settlement request.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Action<'a> {
    Confirm,
    Reject,
    DeadLetter {
        reason: &'a str,
        description: &'a str,
    },
}

impl Action<'_> {
    fn settlement(&self) -> Settlement {
        match self {
            Self::Confirm => Settlement::Confirm,
            Self::Reject => Settlement::Reject,
            Self::DeadLetter { .. } => Settlement::DeadLetter,
        }
    }
}

/// The live session of a listening receiver: the backend channel plus the
/// ledger of deliveries handed out through it.
pub(crate) struct Session<C> {
    receiver: ReceiverId,
    id: SessionId,
    channel: C,
    ledger: AckLedger,
}

impl<C: BackendChannel> Session<C> {
    pub(crate) fn new(receiver: ReceiverId, channel: C) -> Self {
        Self {
            receiver,
            id: SessionId::next(),
            channel,
            ledger: AckLedger::new(),
        }
    }

    pub(crate) fn channel(&self) -> &C {
        &self.channel
    }

    /// Turn a raw delivery into a [`Message`], tracking it unless the broker
    /// already settled it.
    pub(crate) fn admit(&self, delivery: RawDelivery) -> Message {
        let id = delivery
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_id);

        if !delivery.settled {
            self.ledger.track(delivery.token.clone());
        }

        Message::delivered(
            id,
            delivery.content,
            delivery.properties,
            delivery.system_properties,
            AckHandle::new(self.receiver, self.id, delivery.token, delivery.settled),
        )
    }

    pub(crate) fn is_pending(&self, handle: &AckHandle) -> bool {
        !handle.settled_on_receipt()
            && handle.session() == self.id
            && self.ledger.state(handle.token()) == Some(AckState::Pending)
    }

    /// Tokens of an earlier subscription may collide with live ones.
    fn ensure_current(&self, handle: &AckHandle, message_id: &str) -> Result<()> {
        if handle.session() == self.id {
            return Ok(());
        }
        Err(MessagingError::invalid_state(format!(
            "message {message_id} was delivered on an earlier subscription"
        )))
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.ledger.outstanding()
    }

    #[instrument(skip(self, message, handle), fields(message_id = message.log_id()), level = "trace")]
    pub(crate) async fn settle(
        &self,
        message: &Message,
        handle: &AckHandle,
        action: Action<'_>,
    ) -> Result<()> {
        let message_id = message.log_id();
        if handle.settled_on_receipt() {
            return match action {
                Action::DeadLetter { .. } => Err(MessagingError::invalid_state(format!(
                    "message {message_id} was settled on receipt"
                ))),
                _ => Ok(()),
            };
        }

        self.ensure_current(handle, message_id)?;
        let claim = self.ledger.claim(handle.token(), message_id)?;
        let token = handle.token();
        let result = match action {
            Action::Confirm => self.channel.confirm(token).await,
            Action::Reject => self.channel.reject(token).await,
            Action::DeadLetter {
                reason,
                description,
            } => self.channel.dead_letter(token, reason, description).await,
        };

        match result {
            Ok(()) => {
                claim.settle(action.settlement());
                Ok(())
            }
            Err(err) => Err(self.lost(handle, message_id, err)),
        }
    }

    #[instrument(skip(self, message, handle), fields(message_id = message.log_id()), level = "trace")]
    pub(crate) async fn keep_alive(
        &self,
        message: &Message,
        handle: &AckHandle,
        extension: Option<Duration>,
    ) -> Result<()> {
        if handle.settled_on_receipt() {
            return Ok(());
        }

        let message_id = message.log_id();
        self.ensure_current(handle, message_id)?;
        self.ledger.ensure_pending(handle.token(), message_id)?;
        self.channel
            .keep_alive(handle.token(), extension)
            .await
            .map_err(|err| self.lost(handle, message_id, err))
    }

    /// A delivery whose lock was lost is no longer ours to settle.
    fn lost(&self, handle: &AckHandle, message_id: &str, err: MessagingError) -> MessagingError {
        match err {
            MessagingError::LockLost { .. } => {
                self.ledger.forget(handle.token());
                MessagingError::LockLost {
                    message_id: message_id.to_string(),
                }
            }
            err => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::{acker::DeliveryToken, message::Properties};

    struct NoopChannel;

    #[async_trait]
    impl BackendChannel for NoopChannel {
        async fn confirm(&self, _: &DeliveryToken) -> Result<()> {
            Ok(())
        }

        async fn reject(&self, _: &DeliveryToken) -> Result<()> {
            Ok(())
        }

        async fn dead_letter(&self, _: &DeliveryToken, _: &str, _: &str) -> Result<()> {
            Ok(())
        }

        async fn keep_alive(&self, _: &DeliveryToken, _: Option<Duration>) -> Result<()> {
            Err(MessagingError::LockLost {
                message_id: "lock".into(),
            })
        }

        async fn message_count(&self) -> Result<u64> {
            Ok(0)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn delivery(id: Option<&str>, tag: u64, settled: bool) -> RawDelivery {
        RawDelivery {
            id: id.map(str::to_string),
            content: Bytes::from_static(b"payload"),
            properties: Properties::new(),
            system_properties: Properties::new(),
            token: DeliveryToken::Tag(tag),
            settled,
        }
    }

    #[test]
    fn admitted_messages_always_have_an_id() {
        let session = Session::new(ReceiverId::next(), NoopChannel);

        let kept = session.admit(delivery(Some("given"), 1, false));
        let missing = session.admit(delivery(None, 2, false));
        let empty = session.admit(delivery(Some(""), 3, false));

        assert_eq!(kept.id(), Some("given"));
        assert!(missing.id().is_some_and(|id| !id.is_empty()));
        assert!(empty.id().is_some_and(|id| !id.is_empty()));
        assert_eq!(session.outstanding(), 3);
    }

    #[tokio::test]
    async fn settled_on_receipt_is_not_tracked() {
        let session = Session::new(ReceiverId::next(), NoopChannel);
        let message = session.admit(delivery(Some("a"), 1, true));
        let handle = message.ack_handle().unwrap().clone();

        assert_eq!(session.outstanding(), 0);
        assert!(!session.is_pending(&handle));
        assert!(session.settle(&message, &handle, Action::Confirm).await.is_ok());
        assert!(session
            .settle(
                &message,
                &handle,
                Action::DeadLetter {
                    reason: "r",
                    description: "d"
                }
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn handles_of_an_earlier_session_cannot_settle_colliding_tags() {
        let receiver = ReceiverId::next();
        let earlier = Session::new(receiver, NoopChannel);
        let current = Session::new(receiver, NoopChannel);
        let stale = earlier.admit(delivery(Some("old"), 1, false));
        let fresh = current.admit(delivery(Some("new"), 1, false));
        let stale_handle = stale.ack_handle().unwrap().clone();

        assert!(!current.is_pending(&stale_handle));
        assert!(matches!(
            current.settle(&stale, &stale_handle, Action::Confirm).await,
            Err(MessagingError::InvalidState(_))
        ));
        assert!(matches!(
            current.keep_alive(&stale, &stale_handle, None).await,
            Err(MessagingError::InvalidState(_))
        ));
        assert_eq!(current.outstanding(), 1);

        let fresh_handle = fresh.ack_handle().unwrap().clone();
        assert!(current.settle(&fresh, &fresh_handle, Action::Confirm).await.is_ok());
        assert_eq!(current.outstanding(), 0);
    }

    #[tokio::test]
    async fn lost_lock_is_forgotten_and_reported_by_message_id() {
        let session = Session::new(ReceiverId::next(), NoopChannel);
        let message = session.admit(delivery(Some("order-7"), 1, false));
        let handle = message.ack_handle().unwrap().clone();

        let err = session.keep_alive(&message, &handle, None).await.unwrap_err();
        assert!(matches!(err, MessagingError::LockLost { message_id } if message_id == "order-7"));
        assert_eq!(session.outstanding(), 0);
    }
}
