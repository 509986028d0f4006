//! Topic descriptors.
//!
//! A topic is identified by its numeric id. The name is carried only for
//! diagnostics. Topics are registered once at startup and never change.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub use datalink_protocol::TopicId;
use datalink_protocol::TOPIC_REPORT_ID;

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 64;

/// Validate a topic id and name.
///
/// # Errors
///
/// Returns an error message if the id is reserved or the name is invalid.
pub fn validate_topic(id: TopicId, name: &str) -> Result<(), &'static str> {
    if id == TOPIC_REPORT_ID {
        return Err("Topic id 0 is reserved for topic reports");
    }
    if name.is_empty() {
        return Err("Topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err("Topic name too long");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic name contains invalid characters");
    }
    Ok(())
}

/// Typed handle to a registered topic.
///
/// Obtained from [`Bus::register`](crate::Bus::register). The payload type
/// only exists at compile time; the bus itself stores encoded bytes.
pub struct Topic<T> {
    id: TopicId,
    name: Arc<str>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Topic<T> {
    pub(crate) fn new(id: TopicId, name: Arc<str>) -> Self {
        Self {
            id,
            name,
            _payload: PhantomData,
        }
    }

    /// Get the topic id.
    #[must_use]
    pub fn id(&self) -> TopicId {
        self.id
    }

    /// Get the topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self::new(self.id, self.name.clone())
    }
}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl<T> fmt::Display for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}
