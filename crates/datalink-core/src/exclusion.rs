//! Fixed-capacity exclusion set.
//!
//! Holds the topic ids a router must never relay between links. Insertion
//! fails once the set is full; duplicates are allowed and only waste a slot.

use crate::topic::TopicId;

/// Default number of topic ids an exclusion set can hold.
pub const DEFAULT_EXCLUSION_CAPACITY: usize = 1000;

/// An ordered, bounded list of excluded topic ids.
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    ids: Vec<TopicId>,
    capacity: usize,
}

impl ExclusionSet {
    /// Create an empty set with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EXCLUSION_CAPACITY)
    }

    /// Create an empty set holding at most `capacity` ids.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an id.
    ///
    /// Returns `false` without modifying the set if it is full.
    pub fn insert(&mut self, id: TopicId) -> bool {
        if self.ids.len() >= self.capacity {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Check if an id is excluded.
    #[must_use]
    pub fn contains(&self, id: TopicId) -> bool {
        self.ids.iter().any(|&excluded| excluded == id)
    }

    /// Remove every id.
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Number of stored ids, duplicates included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Check if the set is full.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.ids.len() >= self.capacity
    }

    /// Get the capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stored ids in insertion order.
    #[must_use]
    pub fn as_slice(&self) -> &[TopicId] {
        &self.ids
    }
}

impl Default for ExclusionSet {
    fn default() -> Self {
        Self::new()
    }
}
