//! Opt-in retry for publishers.
//!
//! Neither publishers nor receivers retry internally. Retrying is a policy
//! decision that belongs to the caller, so it lives in a decorating layer:
//! [`Retrying`] wraps any [`Publisher`] and re-sends a batch when the
//! wrapped publisher fails with a [transient](MessagingError::is_transient)
//! error. Every other error is returned unchanged on the first attempt.
//!
//! Message ids are assigned before the first attempt, so every attempt sends
//! the same ids and brokers with duplicate detection can discard repeats.
use std::{num::NonZeroU32, time::Duration};

use async_trait::async_trait;
use tracing::warn;

use crate::{
    error::{MessagingError, Result},
    message::Message,
    queue::{publisher::prepare_batch, Publisher},
};

/// A retry strategy for handling transient errors.
///
/// The following strategies are supported:
/// - `Immediate`: Retry the operation immediately (default).
/// - `After`: Retry the operation after a specified duration.
/// - `Exponential`: Retry the operation with exponential backoff until the
///   maximum elapsed time is reached.
#[derive(Debug, Clone, Copy)]
pub enum RetryStrategy {
    /// Retry the operation immediately.
    Immediate { max_retries: NonZeroU32 },
    /// Retry the operation after a specified duration.
    After {
        max_retries: NonZeroU32,
        duration: Duration,
    },
    /// Retry the operation with the provided exponential backoff.
    Exponential {
        min_duration: Duration,
        max_duration: Duration,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Immediate {
            max_retries: NonZeroU32::MIN.saturating_add(2),
        }
    }
}

impl RetryStrategy {
    fn backoff(min_duration: Duration, max_duration: Duration) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(min_duration)
            .with_max_elapsed_time(Some(max_duration))
            .build()
    }

    /// Run `f` until it succeeds, fails with a non-transient error, or the
    /// strategy is exhausted.
    pub async fn retry<O, Fut, F>(self, f: F) -> Result<O>
    where
        Fut: std::future::Future<Output = Result<O>>,
        F: Fn() -> Fut,
    {
        match self {
            Self::Immediate { max_retries } => retry_simple(f, max_retries, None).await,
            Self::After {
                max_retries,
                duration,
            } => retry_simple(f, max_retries, Some(duration)).await,
            Self::Exponential {
                min_duration,
                max_duration,
            } => {
                backoff::future::retry_notify(
                    Self::backoff(min_duration, max_duration),
                    || {
                        let attempt = f();
                        async move {
                            attempt.await.map_err(|err| {
                                if err.is_transient() {
                                    backoff::Error::transient(err)
                                } else {
                                    backoff::Error::permanent(err)
                                }
                            })
                        }
                    },
                    |err: MessagingError, after: Duration| {
                        warn!(%err, ?after, "transient failure, retrying");
                    },
                )
                .await
            }
        }
    }
}

async fn retry_simple<O, Fut, F>(
    f: F,
    max_retries: NonZeroU32,
    duration: Option<Duration>,
) -> Result<O>
where
    Fut: std::future::Future<Output = Result<O>>,
    F: Fn() -> Fut,
{
    let mut num_retries = 0;
    loop {
        match f().await {
            Ok(output) => return Ok(output),
            Err(err) if err.is_transient() && num_retries < max_retries.get() => {
                num_retries += 1;
                warn!(%err, attempt = num_retries, "transient failure, retrying");
                if let Some(duration) = duration {
                    tokio::time::sleep(duration).await;
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// A [`Publisher`] that retries transient failures of the wrapped publisher.
///
/// See [`PublisherExt::with_retry`](crate::queue::PublisherExt::with_retry).
pub struct Retrying<P> {
    inner: P,
    strategy: RetryStrategy,
}

impl<P> Retrying<P> {
    pub fn new(inner: P, strategy: RetryStrategy) -> Self {
        Self { inner, strategy }
    }

    pub fn into_inner(self) -> P {
        self.inner
    }
}

#[async_trait]
impl<P: Publisher> Publisher for Retrying<P> {
    async fn send(&self, messages: Vec<Message>) -> Result<()> {
        let batch = prepare_batch(messages)?;
        self.strategy
            .retry(|| self.inner.send(batch.clone()))
            .await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use super::*;

    /// Fails the first `failures` calls, transiently or not.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        transient: bool,
        sent: Mutex<Vec<Vec<Message>>>,
    }

    impl Flaky {
        fn new(failures: u32, transient: bool) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                transient,
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Publisher for Flaky {
        async fn send(&self, messages: Vec<Message>) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().unwrap().push(messages);
            if call < self.failures {
                if self.transient {
                    return Err(MessagingError::transport(anyhow::anyhow!("broker away")));
                }
                return Err(MessagingError::invalid_state("channel closed"));
            }
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn immediate(max_retries: u32) -> RetryStrategy {
        RetryStrategy::Immediate {
            max_retries: NonZeroU32::new(max_retries).unwrap(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_with_stable_ids() {
        let publisher = Retrying::new(Flaky::new(2, true), immediate(3));
        publisher.send(vec![Message::new("x")]).await.unwrap();

        let inner = publisher.into_inner();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        let sent = inner.sent.lock().unwrap();
        let ids: Vec<_> = sent.iter().map(|batch| batch[0].id().unwrap()).collect();
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let publisher = Retrying::new(Flaky::new(10, true), immediate(2));
        let err = publisher.send(vec![Message::new("x")]).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(publisher.into_inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_failures_are_not_retried() {
        let publisher = Retrying::new(Flaky::new(1, false), immediate(5));
        let err = publisher.send(vec![Message::new("x")]).await.unwrap_err();

        assert!(matches!(err, MessagingError::InvalidState(_)));
        assert_eq!(publisher.into_inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exponential_strategy_retries_transient_failures() {
        let publisher = Retrying::new(
            Flaky::new(2, true),
            RetryStrategy::Exponential {
                min_duration: Duration::from_millis(1),
                max_duration: Duration::from_secs(5),
            },
        );
        publisher.send(vec![Message::new("x")]).await.unwrap();
        assert_eq!(publisher.into_inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_batch_fails_without_calling_inner() {
        let publisher = Retrying::new(Flaky::new(0, true), immediate(1));
        assert!(publisher.send(vec![]).await.is_err());
        assert_eq!(publisher.into_inner().calls.load(Ordering::SeqCst), 0);
    }
}
