//! Typed lifecycle notifications.
//!
//! Every channel and gateway owns a [`Notifier`]. Listeners subscribe to one
//! [`NotificationKind`] at a time and are invoked synchronously, in
//! subscription order, each time a notification of that kind is emitted.
//! There is no ordering guarantee across kinds.
//!
//! ## Notification names
//!
//! ```text
//! Channel:  event:received → event:delivered → job:created
//!                          ↘ event:error
//! Gateway:  job:received → event:received → event:processed
//!                      ↘ error           ↘ event:error
//!           job:completed / job:error  (relayed from the queue worker)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::error::SharedError;
use crate::queue::Job;

/// Stable notification names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    EventReceived,
    EventDelivered,
    EventError,
    EventProcessed,
    JobCreated,
    JobReceived,
    JobCompleted,
    JobError,
    Error,
}

impl NotificationKind {
    /// Wire name, stable across versions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EventReceived => "event:received",
            Self::EventDelivered => "event:delivered",
            Self::EventError => "event:error",
            Self::EventProcessed => "event:processed",
            Self::JobCreated => "job:created",
            Self::JobReceived => "job:received",
            Self::JobCompleted => "job:completed",
            Self::JobError => "job:error",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification payload that knows its own kind.
pub trait Notification: Send + Sync + 'static {
    fn kind(&self) -> NotificationKind;
}

/// Notifications emitted by [`ProducerChannel`](crate::ProducerChannel).
#[derive(Debug, Clone)]
pub enum ChannelNotification<E> {
    /// `event:received(event)`, before any work is done
    EventReceived(E),
    /// `event:delivered(event)`, after the queue accepted the job
    EventDelivered(E),
    /// `event:error(event, error)`, when naming, options or submission failed
    EventError(E, SharedError),
    /// `job:created(job)`, with the queue-assigned job
    JobCreated(Job),
}

impl<E: Send + Sync + 'static> Notification for ChannelNotification<E> {
    fn kind(&self) -> NotificationKind {
        match self {
            Self::EventReceived(_) => NotificationKind::EventReceived,
            Self::EventDelivered(_) => NotificationKind::EventDelivered,
            Self::EventError(..) => NotificationKind::EventError,
            Self::JobCreated(_) => NotificationKind::JobCreated,
        }
    }
}

/// Notifications emitted by [`ConsumerGateway`](crate::ConsumerGateway).
#[derive(Debug, Clone)]
pub enum GatewayNotification<E> {
    /// `job:received(job)`, as soon as the worker hands over a job
    JobReceived(Job),
    /// `event:received(event)`, after extraction
    EventReceived(E),
    /// `event:processed(event, result)`, after the handler succeeded
    EventProcessed(E, Value),
    /// `event:error(event, error)`, after the handler failed
    EventError(E, SharedError),
    /// `error(job, error)`, when no event could be extracted from a job
    Error(Job, SharedError),
    /// `job:completed(job)`, relayed from the worker
    JobCompleted(Job),
    /// `job:error(job, error)`, relayed from the worker
    JobError(Job, SharedError),
}

impl<E: Send + Sync + 'static> Notification for GatewayNotification<E> {
    fn kind(&self) -> NotificationKind {
        match self {
            Self::JobReceived(_) => NotificationKind::JobReceived,
            Self::EventReceived(_) => NotificationKind::EventReceived,
            Self::EventProcessed(..) => NotificationKind::EventProcessed,
            Self::EventError(..) => NotificationKind::EventError,
            Self::Error(..) => NotificationKind::Error,
            Self::JobCompleted(_) => NotificationKind::JobCompleted,
            Self::JobError(..) => NotificationKind::JobError,
        }
    }
}

/// Handle returned by [`Notifier::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<N> = Arc<dyn Fn(&N) + Send + Sync>;

struct Subscription<N> {
    id: SubscriptionId,
    once: bool,
    listener: Listener<N>,
}

/// Per-kind listener lists with synchronous fan-out.
pub struct Notifier<N> {
    listeners: RwLock<HashMap<NotificationKind, Vec<Subscription<N>>>>,
    next_id: AtomicU64,
}

impl<N: Notification> Default for Notifier<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Notification> Notifier<N> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Invoke `listener` for every notification of `kind`.
    pub fn on<F>(&self, kind: NotificationKind, listener: F) -> SubscriptionId
    where
        F: Fn(&N) + Send + Sync + 'static,
    {
        self.subscribe(kind, false, Arc::new(listener))
    }

    /// Invoke `listener` for the next notification of `kind` only.
    pub fn once<F>(&self, kind: NotificationKind, listener: F) -> SubscriptionId
    where
        F: Fn(&N) + Send + Sync + 'static,
    {
        self.subscribe(kind, true, Arc::new(listener))
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        for subs in listeners.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    /// Number of listeners currently subscribed to `kind`.
    pub fn listener_count(&self, kind: NotificationKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Deliver `notification` to every current listener of its kind.
    ///
    /// Listeners run after the lock is released, so they may subscribe or
    /// unsubscribe without deadlocking. Returns the number of listeners invoked.
    pub fn emit(&self, notification: &N) -> usize {
        let kind = notification.kind();
        let snapshot: Vec<Listener<N>> = {
            let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
            match listeners.get_mut(&kind) {
                Some(subs) => {
                    let snapshot = subs.iter().map(|s| Arc::clone(&s.listener)).collect();
                    subs.retain(|s| !s.once);
                    snapshot
                }
                None => Vec::new(),
            }
        };

        for listener in &snapshot {
            listener(notification);
        }
        snapshot.len()
    }

    fn subscribe(&self, kind: NotificationKind, once: bool, listener: Listener<N>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Subscription { id, once, listener });
        id
    }
}
