//! An in-process brokered queue.
//!
//! The in-memory broker emulates a lock based broker faithfully enough to
//! exercise every part of the receiver and acknowledgment protocol without
//! external infrastructure:
//!
//! - Deliveries are peek-locked for [`InMemoryQueueOptions::lock_duration`].
//!   A lock that is neither settled nor renewed in time expires, and the
//!   message becomes available again.
//! - Every delivery increments the message's delivery count. A message whose
//!   lock ends without settlement after
//!   [`InMemoryQueueOptions::max_delivery_count`] deliveries is moved to the
//!   queue's dead-letter store.
//! - [`ReceiveMode::ReceiveAndDelete`] removes messages on delivery.
//! - Batches are enqueued atomically.
//!
//! [`InMemoryBroker`] is cloneable; every clone refers to the same queues.
//! Inspection helpers ([`InMemoryBroker::message_count`],
//! [`InMemoryBroker::dead_letters`]) and fault injection
//! ([`InMemoryBroker::sever`]) are available on the broker itself.
//!
//! ```
//! use std::time::Duration;
//! use courier::{
//!     message::Message,
//!     queue::{in_memory::{InMemoryBroker, InMemoryQueueOptions}, Publisher},
//! };
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let broker = InMemoryBroker::new();
//! broker.declare_queue("invoices", InMemoryQueueOptions {
//!     lock_duration: Duration::from_secs(5),
//!     max_delivery_count: 3,
//! });
//!
//! broker
//!     .publisher("invoices")
//!     .send(vec![Message::new("a"), Message::new("b")])
//!     .await?;
//! assert_eq!(broker.message_count("invoices"), 2);
//! # Ok(())
//! # }
//! ```
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use futures::StreamExt;
use tokio::{
    sync::{mpsc, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    publisher::prepare_batch, BackendChannel, Capabilities, DeliveryStream, Dispatch, Publisher,
    RawDelivery, ReceiverBackend, Subscription,
};
use crate::{
    acker::DeliveryToken,
    error::{MessagingError, Result},
    message::{system, Message, Properties},
    receiver::QueueReceiver,
};

/// Dead-letter reason recorded when a message exhausted its deliveries.
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

const BACKEND: &str = "in-memory";

/// Per-queue settings, fixed when the queue is declared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InMemoryQueueOptions {
    /// How long a peek-locked delivery stays invisible to other receivers.
    pub lock_duration: Duration,
    /// Deliveries after which an unsettled message is dead-lettered.
    pub max_delivery_count: u32,
}

impl Default for InMemoryQueueOptions {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_delivery_count: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReceiveMode {
    /// Deliveries are locked and must be settled explicitly.
    #[default]
    PeekLock,
    /// Deliveries are removed from the queue when handed out.
    ReceiveAndDelete,
}

/// Per-receiver settings.
#[derive(Clone, Copy, Debug)]
pub struct InMemoryReceiverOptions {
    pub mode: ReceiveMode,
    /// Number of deliveries taken from the queue ahead of the handler.
    /// Prefetched deliveries are locked; in receive-and-delete mode they are
    /// only removed once handed to the receiver, and go back to the queue when
    /// the subscription closes first.
    pub prefetch: usize,
    pub dispatch: Dispatch,
}

impl Default for InMemoryReceiverOptions {
    fn default() -> Self {
        Self {
            mode: ReceiveMode::PeekLock,
            prefetch: 1,
            dispatch: Dispatch::Sequential,
        }
    }
}

/// A message in the dead-letter store of a queue.
#[derive(Clone, Debug)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
    pub description: String,
    pub delivery_count: i64,
}

impl DeadLetter {
    fn new(stored: Stored, reason: &str, description: &str) -> Self {
        let system_properties = Properties::from([
            (
                system::SEQUENCE_NUMBER.to_string(),
                stored.sequence_number.into(),
            ),
            (system::ENQUEUED_TIME.to_string(), stored.enqueued_time.into()),
            (
                system::DELIVERY_COUNT.to_string(),
                stored.delivery_count.into(),
            ),
            (system::DEAD_LETTER_REASON.to_string(), reason.into()),
            (
                system::DEAD_LETTER_DESCRIPTION.to_string(),
                description.into(),
            ),
        ]);

        Self {
            message: Message::new(stored.content)
                .with_id(stored.id)
                .with_properties(stored.properties)
                .with_system_properties(system_properties),
            reason: reason.to_string(),
            description: description.to_string(),
            delivery_count: stored.delivery_count,
        }
    }
}

#[derive(Clone, Debug)]
struct Stored {
    id: String,
    content: Bytes,
    properties: Properties,
    sequence_number: i64,
    enqueued_time: DateTime<Utc>,
    delivery_count: i64,
}

struct Locked {
    stored: Stored,
    session: u64,
    deadline: Instant,
}

#[derive(Default)]
struct QueueInner {
    next_sequence: i64,
    /// Available messages, ordered by sequence number.
    ready: BTreeMap<i64, Stored>,
    locked: HashMap<Uuid, Locked>,
    /// Receive-and-delete deliveries taken ahead of the receiver, by session.
    buffered: HashMap<Uuid, (u64, Stored)>,
    dead_letters: Vec<DeadLetter>,
}

struct QueueState {
    name: String,
    options: InMemoryQueueOptions,
    inner: Mutex<QueueInner>,
    /// One permit per entry in `ready`.
    ///
    /// Permits are added after a message is made available and forgotten
    /// before one is taken, so a receiver holding a permit always finds a
    /// message.
    available: Semaphore,
    /// Fault signal of every open session.
    sessions: DashMap<u64, CancellationToken>,
    next_session: AtomicU64,
}

fn lock_lost(lock: Uuid) -> MessagingError {
    MessagingError::LockLost {
        message_id: lock.to_string(),
    }
}

fn lock_of(token: &DeliveryToken) -> Result<Uuid> {
    match token {
        DeliveryToken::Lock(lock) => Ok(*lock),
        DeliveryToken::Tag(_) => Err(MessagingError::invalid_state(format!(
            "{token} is not a lock token"
        ))),
    }
}

impl QueueState {
    fn new(name: &str, options: InMemoryQueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            inner: Default::default(),
            available: Semaphore::new(0),
            sessions: Default::default(),
            next_session: AtomicU64::new(1),
        }
    }

    fn inner(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_count(&self) -> u64 {
        let inner = self.inner();
        (inner.ready.len() + inner.locked.len() + inner.buffered.len()) as u64
    }

    fn enqueue(&self, messages: Vec<Message>) {
        let enqueued_time = Utc::now();
        let count = messages.len();
        let mut inner = self.inner();
        for message in messages {
            inner.next_sequence += 1;
            let sequence_number = inner.next_sequence;
            inner.ready.insert(
                sequence_number,
                Stored {
                    id: message.log_id().to_string(),
                    content: message.content().clone(),
                    properties: message.properties().clone(),
                    sequence_number,
                    enqueued_time,
                    delivery_count: 0,
                },
            );
        }
        self.available.add_permits(count);
    }

    /// Put a message whose lock ended without settlement back in line, or
    /// dead-letter it once it exhausted its deliveries.
    fn abandon(&self, inner: &mut QueueInner, stored: Stored) {
        if stored.delivery_count >= i64::from(self.options.max_delivery_count) {
            debug!(
                queue = %self.name,
                message_id = %stored.id,
                delivery_count = stored.delivery_count,
                "max delivery count exceeded, dead-lettering"
            );
            let description = format!(
                "Message could not be consumed after {} delivery attempts.",
                self.options.max_delivery_count
            );
            inner.dead_letters.push(DeadLetter::new(
                stored,
                MAX_DELIVERY_COUNT_EXCEEDED,
                &description,
            ));
        } else {
            inner.ready.insert(stored.sequence_number, stored);
            self.available.add_permits(1);
        }
    }

    /// Take the next available message for `session`. The caller must have
    /// consumed a permit of `available`.
    fn take(
        self: &Arc<Self>,
        session: u64,
        mode: ReceiveMode,
        stop: &CancellationToken,
    ) -> Option<RawDelivery> {
        let mut inner = self.inner();
        if stop.is_cancelled() {
            self.available.add_permits(1);
            return None;
        }

        let (_, mut stored) = inner.ready.pop_first()?;
        stored.delivery_count += 1;

        let mut system_properties = Properties::new();
        system_properties.insert(
            system::SEQUENCE_NUMBER.to_string(),
            stored.sequence_number.into(),
        );
        system_properties.insert(
            system::ENQUEUED_TIME.to_string(),
            stored.enqueued_time.into(),
        );
        system_properties.insert(
            system::DELIVERY_COUNT.to_string(),
            stored.delivery_count.into(),
        );

        let lock = Uuid::new_v4();
        let settled = mode == ReceiveMode::ReceiveAndDelete;
        if !settled {
            let lock_duration = self.options.lock_duration;
            let locked_until = Utc::now()
                + chrono::Duration::milliseconds(lock_duration.as_millis() as i64);
            system_properties.insert(system::LOCK_TOKEN.to_string(), lock.to_string().into());
            system_properties.insert(system::LOCKED_UNTIL.to_string(), locked_until.into());
        }

        let delivery = RawDelivery {
            id: Some(stored.id.clone()),
            content: stored.content.clone(),
            properties: stored.properties.clone(),
            system_properties,
            token: DeliveryToken::Lock(lock),
            settled,
        };

        if settled {
            inner.buffered.insert(lock, (session, stored));
        } else {
            inner.locked.insert(
                lock,
                Locked {
                    stored,
                    session,
                    deadline: Instant::now() + self.options.lock_duration,
                },
            );
            watch_lock(Arc::downgrade(self), lock);
        }

        Some(delivery)
    }

    /// Remove a receive-and-delete delivery for good as it reaches the
    /// receiver. Returns `false` if it was already put back.
    fn hand_out(&self, token: &DeliveryToken) -> bool {
        match token {
            DeliveryToken::Lock(lock) => self.inner().buffered.remove(lock).is_some(),
            DeliveryToken::Tag(_) => false,
        }
    }

    fn lock_deadline(&self, lock: &Uuid) -> Option<Instant> {
        self.inner().locked.get(lock).map(|locked| locked.deadline)
    }

    /// Expire the lock if its deadline passed. Returns `false` while the lock
    /// is still held.
    fn expire_if_due(&self, lock: &Uuid) -> bool {
        let mut inner = self.inner();
        let due = match inner.locked.get(lock) {
            Some(locked) => locked.deadline <= Instant::now(),
            None => return true,
        };
        if !due {
            return false;
        }

        if let Some(locked) = inner.locked.remove(lock) {
            debug!(queue = %self.name, message_id = %locked.stored.id, "lock expired");
            self.abandon(&mut inner, locked.stored);
        }
        true
    }

    /// Release the lock held by `session`, failing with
    /// [`MessagingError::LockLost`] if it is gone or expired.
    fn unlock(&self, inner: &mut QueueInner, session: u64, token: &DeliveryToken) -> Result<Stored> {
        let lock = lock_of(token)?;
        let locked = match inner.locked.remove(&lock) {
            Some(locked) if locked.session == session => locked,
            Some(locked) => {
                inner.locked.insert(lock, locked);
                return Err(lock_lost(lock));
            }
            None => return Err(lock_lost(lock)),
        };

        if locked.deadline <= Instant::now() {
            self.abandon(inner, locked.stored);
            return Err(lock_lost(lock));
        }

        Ok(locked.stored)
    }

    fn complete(&self, session: u64, token: &DeliveryToken) -> Result<()> {
        let mut inner = self.inner();
        self.unlock(&mut inner, session, token)?;
        Ok(())
    }

    fn release(&self, session: u64, token: &DeliveryToken) -> Result<()> {
        let mut inner = self.inner();
        let stored = self.unlock(&mut inner, session, token)?;
        self.abandon(&mut inner, stored);
        Ok(())
    }

    fn dead_letter(
        &self,
        session: u64,
        token: &DeliveryToken,
        reason: &str,
        description: &str,
    ) -> Result<()> {
        let mut inner = self.inner();
        let stored = self.unlock(&mut inner, session, token)?;
        inner
            .dead_letters
            .push(DeadLetter::new(stored, reason, description));
        Ok(())
    }

    fn renew(&self, session: u64, token: &DeliveryToken, extension: Duration) -> Result<()> {
        let lock = lock_of(token)?;
        let mut inner = self.inner();
        let now = Instant::now();
        let expired = match inner.locked.get_mut(&lock) {
            Some(locked) if locked.session == session => {
                if locked.deadline > now {
                    locked.deadline = now + extension;
                    return Ok(());
                }
                true
            }
            _ => false,
        };

        if expired {
            if let Some(locked) = inner.locked.remove(&lock) {
                self.abandon(&mut inner, locked.stored);
            }
        }
        Err(lock_lost(lock))
    }

    /// Return every message locked by `session` to the queue, along with
    /// receive-and-delete deliveries it never handed out.
    fn release_session(&self, session: u64) {
        let mut inner = self.inner();
        let locks: Vec<Uuid> = inner
            .locked
            .iter()
            .filter(|(_, locked)| locked.session == session)
            .map(|(lock, _)| *lock)
            .collect();

        for lock in locks {
            if let Some(locked) = inner.locked.remove(&lock) {
                self.abandon(&mut inner, locked.stored);
            }
        }

        let buffered: Vec<Uuid> = inner
            .buffered
            .iter()
            .filter(|(_, (owner, _))| *owner == session)
            .map(|(lock, _)| *lock)
            .collect();

        for lock in buffered {
            if let Some((_, mut stored)) = inner.buffered.remove(&lock) {
                stored.delivery_count -= 1;
                inner.ready.insert(stored.sequence_number, stored);
                self.available.add_permits(1);
            }
        }
    }
}

/// Expire `lock` once its (possibly renewed) deadline passes.
fn watch_lock(queue: Weak<QueueState>, lock: Uuid) {
    tokio::spawn(async move {
        loop {
            let Some(deadline) = queue.upgrade().and_then(|queue| queue.lock_deadline(&lock))
            else {
                return;
            };
            tokio::time::sleep_until(deadline).await;

            let Some(queue) = queue.upgrade() else {
                return;
            };
            if queue.expire_if_due(&lock) {
                return;
            }
        }
    });
}

/// A cloneable handle to a set of in-memory queues.
///
/// Queues are created on first use with default options, or up front with
/// [`InMemoryBroker::declare_queue`].
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    queues: Arc<DashMap<String, Arc<QueueState>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a queue with the given options.
    ///
    /// Declaring an existing queue leaves it, and its options, untouched.
    pub fn declare_queue(&self, name: &str, options: InMemoryQueueOptions) {
        match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get().options != options {
                    warn!(queue = name, "queue already declared with different options");
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(QueueState::new(name, options)));
            }
        }
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::new(name, Default::default())))
            .value()
            .clone()
    }

    pub fn publisher(&self, queue: &str) -> InMemoryPublisher {
        InMemoryPublisher {
            queue: self.queue(queue),
            closed: AtomicBool::new(false),
        }
    }

    pub fn receiver(
        &self,
        queue: &str,
        options: InMemoryReceiverOptions,
    ) -> QueueReceiver<InMemoryBackend> {
        QueueReceiver::new(InMemoryBackend {
            queue: self.queue(queue),
            options,
        })
    }

    /// Number of messages in the queue that are neither settled nor
    /// dead-lettered, locked ones included.
    pub fn message_count(&self, queue: &str) -> u64 {
        self.queues
            .get(queue)
            .map_or(0, |queue| queue.active_count())
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<DeadLetter> {
        self.queues
            .get(queue)
            .map(|queue| queue.inner().dead_letters.clone())
            .unwrap_or_default()
    }

    /// Simulate a connection loss for every open session on the queue.
    ///
    /// Locks held by those sessions are released, their delivery streams
    /// fail, and settlement through their channels fails with a transport
    /// error. Returns the number of sessions severed.
    pub fn sever(&self, queue: &str) -> usize {
        let Some(queue) = self.queues.get(queue).map(|queue| queue.value().clone()) else {
            return 0;
        };

        let sessions: Vec<(u64, CancellationToken)> = queue
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (session, fault) in &sessions {
            fault.cancel();
            queue.release_session(*session);
        }

        warn!(queue = %queue.name, sessions = sessions.len(), "severed sessions");
        sessions.len()
    }
}

/// Publisher of an in-memory queue. Batches are enqueued atomically.
pub struct InMemoryPublisher {
    queue: Arc<QueueState>,
    closed: AtomicBool,
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    #[instrument(skip_all, fields(queue = %self.queue.name, count = messages.len()), level = "trace")]
    async fn send(&self, messages: Vec<Message>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MessagingError::invalid_state("publisher is closed"));
        }

        let batch = prepare_batch(messages)?;
        self.queue.enqueue(batch);

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Receive side of an in-memory queue.
pub struct InMemoryBackend {
    queue: Arc<QueueState>,
    options: InMemoryReceiverOptions,
}

#[async_trait]
impl ReceiverBackend for InMemoryBackend {
    type Channel = InMemoryChannel;

    fn name(&self) -> &'static str {
        BACKEND
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            dead_letter: true,
            keep_alive: true,
        }
    }

    fn dispatch(&self) -> Dispatch {
        self.options.dispatch
    }

    #[instrument(skip(self), fields(queue = %self.queue.name), level = "debug")]
    async fn subscribe(&self) -> Result<Subscription<Self::Channel>> {
        let session = self.queue.next_session.fetch_add(1, Ordering::Relaxed);
        let fault = CancellationToken::new();
        let stop = fault.child_token();
        self.queue.sessions.insert(session, fault.clone());

        let (tx, rx) = mpsc::channel(self.options.prefetch.max(1));
        tokio::spawn(pump(
            self.queue.clone(),
            session,
            self.options.mode,
            tx,
            stop.clone(),
        ));

        Ok(Subscription {
            deliveries: delivery_stream(self.queue.clone(), rx, fault.clone()),
            channel: InMemoryChannel {
                queue: self.queue.clone(),
                session,
                fault,
                stop,
                released: AtomicBool::new(false),
            },
        })
    }
}

/// Move deliveries from the queue into the session buffer until stopped.
async fn pump(
    queue: Arc<QueueState>,
    session: u64,
    mode: ReceiveMode,
    tx: mpsc::Sender<RawDelivery>,
    stop: CancellationToken,
) {
    loop {
        let slot = tokio::select! {
            _ = stop.cancelled() => return,
            slot = tx.reserve() => match slot {
                Ok(slot) => slot,
                Err(_) => return,
            },
        };

        let permit = tokio::select! {
            _ = stop.cancelled() => return,
            permit = queue.available.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        permit.forget();

        if let Some(delivery) = queue.take(session, mode, &stop) {
            slot.send(delivery);
        }
    }
}

fn delivery_stream(
    queue: Arc<QueueState>,
    rx: mpsc::Receiver<RawDelivery>,
    fault: CancellationToken,
) -> DeliveryStream {
    futures::stream::unfold(Some((rx, fault)), move |state| {
        let queue = queue.clone();
        async move {
            let (mut rx, fault) = state?;
            loop {
                let delivery = tokio::select! {
                    biased;
                    _ = fault.cancelled() => {
                        let err = anyhow!("connection to queue {} lost", queue.name);
                        return Some((Err(MessagingError::transport(err)), None));
                    }
                    delivery = rx.recv() => delivery?,
                };

                if delivery.settled && !queue.hand_out(&delivery.token) {
                    continue;
                }
                return Some((Ok(delivery), Some((rx, fault))));
            }
        }
    })
    .boxed()
}

/// Channel of an open in-memory subscription.
pub struct InMemoryChannel {
    queue: Arc<QueueState>,
    session: u64,
    fault: CancellationToken,
    stop: CancellationToken,
    released: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_connected(&self) -> Result<()> {
        if self.fault.is_cancelled() {
            return Err(MessagingError::transport(anyhow!(
                "connection to queue {} lost",
                self.queue.name
            )));
        }
        Ok(())
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop.cancel();
        self.queue.sessions.remove(&self.session);
        self.queue.release_session(self.session);
    }
}

#[async_trait]
impl BackendChannel for InMemoryChannel {
    #[instrument(skip(self), level = "trace")]
    async fn confirm(&self, token: &DeliveryToken) -> Result<()> {
        self.ensure_connected()?;
        self.queue.complete(self.session, token)
    }

    #[instrument(skip(self), level = "trace")]
    async fn reject(&self, token: &DeliveryToken) -> Result<()> {
        self.ensure_connected()?;
        self.queue.release(self.session, token)
    }

    #[instrument(skip(self), level = "trace")]
    async fn dead_letter(
        &self,
        token: &DeliveryToken,
        reason: &str,
        description: &str,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.queue
            .dead_letter(self.session, token, reason, description)
    }

    #[instrument(skip(self), level = "trace")]
    async fn keep_alive(&self, token: &DeliveryToken, extension: Option<Duration>) -> Result<()> {
        self.ensure_connected()?;
        self.queue.renew(
            self.session,
            token,
            extension.unwrap_or(self.queue.options.lock_duration),
        )
    }

    async fn message_count(&self) -> Result<u64> {
        self.ensure_connected()?;
        Ok(self.queue.active_count())
    }

    async fn close(&self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.release();
    }
}
