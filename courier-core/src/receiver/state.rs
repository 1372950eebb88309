use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{MessagingError, Result};

/// Lifecycle of a receiver.
///
/// ```text
/// Idle --listen--> Listening --cancel--> Draining --> Closed
///                      |                                 |
///                      | subscription lost               | listen
///                      v                                 v
///                   Faulted                          Listening
/// ```
///
/// `Faulted` is terminal: the receiver has to be rebuilt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReceiverState {
    Idle = 0,
    Listening = 1,
    Draining = 2,
    Closed = 3,
    Faulted = 4,
}

impl ReceiverState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Listening,
            2 => Self::Draining,
            3 => Self::Closed,
            _ => Self::Faulted,
        }
    }
}

impl std::fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Listening => write!(f, "listening"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Atomic holder of a [`ReceiverState`].
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ReceiverState::Idle as u8))
    }

    pub(crate) fn get(&self) -> ReceiverState {
        ReceiverState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ReceiverState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move to `Listening` from `Idle` or `Closed`.
    pub(crate) fn begin_listening(&self) -> Result<()> {
        loop {
            let current = self.get();
            match current {
                ReceiverState::Idle | ReceiverState::Closed => {
                    if self
                        .0
                        .compare_exchange(
                            current as u8,
                            ReceiverState::Listening as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return Ok(());
                    }
                }
                ReceiverState::Listening | ReceiverState::Draining => {
                    return Err(MessagingError::invalid_state(
                        "receiver is already listening",
                    ))
                }
                ReceiverState::Faulted => {
                    return Err(MessagingError::invalid_state("receiver is faulted"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listening_twice_is_rejected() {
        let cell = StateCell::new();
        cell.begin_listening().unwrap();
        assert_eq!(cell.get(), ReceiverState::Listening);
        assert!(cell.begin_listening().is_err());

        cell.set(ReceiverState::Draining);
        assert!(cell.begin_listening().is_err());
    }

    #[test]
    fn closed_receiver_can_listen_again() {
        let cell = StateCell::new();
        cell.set(ReceiverState::Closed);
        assert!(cell.begin_listening().is_ok());
    }

    #[test]
    fn faulted_is_terminal() {
        let cell = StateCell::new();
        cell.set(ReceiverState::Faulted);
        assert!(matches!(
            cell.begin_listening(),
            Err(MessagingError::InvalidState(_))
        ));
        assert_eq!(cell.get(), ReceiverState::Faulted);
    }
}
