//! Latest-value topic bus.
//!
//! Every subscription owns a single slot. A publish overwrites the slot and
//! marks it dirty; a read takes the value and clears the flag. Values that
//! are overwritten before being read are lost, which is the intended policy
//! for telemetry, state and heartbeats.

use crate::topic::{validate_topic, Topic, TopicId};
use bytes::Bytes;
use dashmap::DashMap;
use datalink_protocol::Payload;
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid topic id or name.
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    /// Topic id already registered.
    #[error("Topic {id} already registered as {existing}")]
    DuplicateTopic { id: TopicId, existing: String },

    /// Topic id not registered.
    #[error("Unknown topic: {0}")]
    UnknownTopic(TopicId),
}

/// Which publishes a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionScope {
    /// Every publish, local or received from a link.
    #[default]
    All,
    /// Only values published by components of this process.
    LocalOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Default)]
struct SlotState {
    value: Option<Bytes>,
    dirty: bool,
}

/// Single-value buffer behind a subscription.
#[derive(Debug)]
struct Slot {
    id: u64,
    scope: SubscriptionScope,
    enabled: AtomicBool,
    state: Mutex<SlotState>,
}

impl Slot {
    fn accepts(&self, origin: Origin) -> bool {
        if !self.enabled.load(Ordering::Acquire) {
            return false;
        }
        !(origin == Origin::Remote && self.scope == SubscriptionScope::LocalOnly)
    }

    fn store(&self, value: Bytes) {
        let mut state = self.state.lock();
        state.value = Some(value);
        state.dirty = true;
    }
}

/// Registered topic with its live subscription slots.
struct TopicEntry {
    name: Arc<str>,
    slots: Vec<Weak<Slot>>,
}

/// A subscription to one topic.
///
/// Owned by the component that created it. Dropping it detaches the slot
/// from the bus.
pub struct Subscription {
    topic_id: TopicId,
    slot: Arc<Slot>,
}

impl Subscription {
    /// Get the subscribed topic id.
    #[must_use]
    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }

    /// Get the subscription scope.
    #[must_use]
    pub fn scope(&self) -> SubscriptionScope {
        self.slot.scope
    }

    /// Take the latest value if it arrived since the last take.
    ///
    /// Reading and clearing the dirty flag happen under the slot lock.
    #[must_use]
    pub fn try_take_if_new(&self) -> Option<Bytes> {
        let mut state = self.slot.state.lock();
        if !state.dirty {
            return None;
        }
        state.dirty = false;
        state.value.clone()
    }

    /// Whether a value arrived since the last take.
    #[must_use]
    pub fn has_new(&self) -> bool {
        self.slot.state.lock().dirty
    }

    /// The latest value, new or not.
    #[must_use]
    pub fn latest(&self) -> Option<Bytes> {
        self.slot.state.lock().value.clone()
    }

    /// Enable or disable this subscription.
    ///
    /// A disabled subscription ignores publishes entirely.
    pub fn set_enabled(&self, enabled: bool) {
        self.slot.enabled.store(enabled, Ordering::Release);
    }

    /// Check if this subscription is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.slot.enabled.load(Ordering::Acquire)
    }

    /// Disable this subscription until the returned guard is dropped.
    ///
    /// The previous enabled state is restored on drop.
    #[must_use = "the subscription is re-enabled as soon as the guard is dropped"]
    pub fn suppress(&self) -> SuppressGuard<'_> {
        let previous = self.slot.enabled.swap(false, Ordering::AcqRel);
        trace!(topic = self.topic_id, "Subscription suppressed");
        SuppressGuard {
            subscription: self,
            previous,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic_id", &self.topic_id)
            .field("scope", &self.slot.scope)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Scoped suppression of a subscription. See [`Subscription::suppress`].
pub struct SuppressGuard<'a> {
    subscription: &'a Subscription,
    previous: bool,
}

impl Drop for SuppressGuard<'_> {
    fn drop(&mut self) {
        self.subscription.set_enabled(self.previous);
        trace!(topic = self.subscription.topic_id, "Subscription restored");
    }
}

/// Typed view of a subscription.
pub struct Subscriber<T> {
    inner: Subscription,
    _payload: PhantomData<fn() -> T>,
}

impl<T: Payload> Subscriber<T> {
    /// Take and decode the latest value if it arrived since the last take.
    ///
    /// Values that fail to decode are logged and dropped.
    #[must_use]
    pub fn try_take_if_new(&self) -> Option<T> {
        let raw = self.inner.try_take_if_new()?;
        match T::decode(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(topic = self.inner.topic_id, kind = T::KIND, error = %e, "Dropping undecodable value");
                None
            }
        }
    }

    /// Get the untyped subscription.
    #[must_use]
    pub fn subscription(&self) -> &Subscription {
        &self.inner
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

/// The topic bus.
///
/// Shared by reference (usually `Arc<Bus>`) between the bridge, gateways and
/// any other component that publishes or subscribes.
pub struct Bus {
    /// Topics indexed by id.
    topics: DashMap<TopicId, TopicEntry>,
    /// Source of slot identities.
    next_slot: AtomicU64,
}

impl Bus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            next_slot: AtomicU64::new(1),
        }
    }

    /// Register a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the id or name is invalid or the id is taken.
    pub fn register<T: Payload>(
        &self,
        id: TopicId,
        name: impl Into<String>,
    ) -> Result<Topic<T>, BusError> {
        let name = name.into();
        validate_topic(id, &name).map_err(BusError::InvalidTopic)?;

        match self.topics.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Err(BusError::DuplicateTopic {
                id,
                existing: entry.get().name.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let name: Arc<str> = Arc::from(name);
                entry.insert(TopicEntry {
                    name: name.clone(),
                    slots: Vec::new(),
                });
                debug!(topic = id, name = %name, kind = T::KIND, "Registered topic");
                Ok(Topic::new(id, name))
            }
        }
    }

    /// Check if a topic id is registered.
    #[must_use]
    pub fn is_registered(&self, id: TopicId) -> bool {
        self.topics.contains_key(&id)
    }

    /// Get the name of a registered topic.
    #[must_use]
    pub fn topic_name(&self, id: TopicId) -> Option<Arc<str>> {
        self.topics.get(&id).map(|e| e.name.clone())
    }

    /// Get all registered topic ids in ascending order.
    #[must_use]
    pub fn topic_ids(&self) -> Vec<TopicId> {
        let mut ids: Vec<TopicId> = self.topics.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Topics consumed by this process, in ascending order.
    ///
    /// A topic counts when it has at least one live subscription that also
    /// accepts values received from links. Gateway subscriptions do not count.
    #[must_use]
    pub fn interested_topics(&self) -> Vec<TopicId> {
        let mut ids: Vec<TopicId> = self
            .topics
            .iter()
            .filter(|e| {
                e.slots.iter().any(|w| {
                    w.upgrade()
                        .is_some_and(|slot| slot.scope == SubscriptionScope::All)
                })
            })
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Subscribe to a topic by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is not registered.
    pub fn subscribe_id(
        &self,
        id: TopicId,
        scope: SubscriptionScope,
    ) -> Result<Subscription, BusError> {
        let mut entry = self.topics.get_mut(&id).ok_or(BusError::UnknownTopic(id))?;

        let slot = Arc::new(Slot {
            id: self.next_slot.fetch_add(1, Ordering::Relaxed),
            scope,
            enabled: AtomicBool::new(true),
            state: Mutex::new(SlotState::default()),
        });
        entry.slots.push(Arc::downgrade(&slot));

        debug!(topic = id, name = %entry.name, ?scope, "Subscribed");

        Ok(Subscription {
            topic_id: id,
            slot,
        })
    }

    /// Subscribe to a typed topic, receiving every publish.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is not registered on this bus.
    pub fn subscribe<T: Payload>(&self, topic: &Topic<T>) -> Result<Subscriber<T>, BusError> {
        let inner = self.subscribe_id(topic.id(), SubscriptionScope::All)?;
        Ok(Subscriber {
            inner,
            _payload: PhantomData,
        })
    }

    /// Publish a value to every enabled subscription of a topic.
    ///
    /// Returns the number of subscriptions updated.
    pub fn publish<T: Payload>(&self, topic: &Topic<T>, value: &T) -> usize {
        self.deliver(topic.id(), value.to_bytes(), Origin::Local, None)
    }

    /// Publish a value to every enabled subscription except `skip`.
    ///
    /// This is how a component republishes onto a topic it also subscribes
    /// to without re-arming its own subscription.
    pub fn publish_except<T: Payload>(
        &self,
        topic: &Topic<T>,
        value: &T,
        skip: &Subscription,
    ) -> usize {
        self.deliver(topic.id(), value.to_bytes(), Origin::Local, Some(skip.slot.id))
    }

    /// Publish pre-encoded bytes from a local component.
    pub fn publish_raw(&self, id: TopicId, value: Bytes) -> usize {
        self.deliver(id, value, Origin::Local, None)
    }

    /// Publish bytes received from a transport link.
    ///
    /// [`SubscriptionScope::LocalOnly`] subscriptions do not see these.
    pub fn publish_remote(&self, id: TopicId, value: Bytes) -> usize {
        self.deliver(id, value, Origin::Remote, None)
    }

    fn deliver(&self, id: TopicId, value: Bytes, origin: Origin, skip: Option<u64>) -> usize {
        let Some(mut entry) = self.topics.get_mut(&id) else {
            trace!(topic = id, "Publish to unregistered topic");
            return 0;
        };

        let mut delivered = 0;
        entry.slots.retain(|weak| {
            let Some(slot) = weak.upgrade() else {
                return false;
            };
            if Some(slot.id) != skip && slot.accepts(origin) {
                slot.store(value.clone());
                delivered += 1;
            }
            true
        });

        trace!(topic = id, ?origin, recipients = delivered, "Published");
        delivered
    }

    /// Get bus statistics.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            topic_count: self.topics.len(),
            subscription_count: self
                .topics
                .iter()
                .map(|e| e.slots.iter().filter(|w| w.strong_count() > 0).count())
                .sum(),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Bus statistics.
#[derive(Debug, Clone)]
pub struct BusStats {
    /// Number of registered topics.
    pub topic_count: usize,
    /// Number of live subscriptions.
    pub subscription_count: usize,
}
