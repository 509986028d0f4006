//! Message envelope exchanged between gateways.
//!
//! An envelope wraps one published topic value for transmission over a link.
//! It is created by the sending gateway and consumed by the receiving one.

use serde::{Deserialize, Serialize};

use crate::payload::{Payload, TopicReport};

/// Numeric topic identifier, unique per process and shared across nodes.
pub type TopicId = u32;

/// Topic id reserved for topic-discovery reports.
pub const TOPIC_REPORT_ID: TopicId = 0;

/// Hop budget given to envelopes created by a gateway.
pub const DEFAULT_HOPS: i32 = 10;

/// A topic value in transit between two gateways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Topic the payload was published on.
    pub topic_id: TopicId,
    /// Remaining permitted relays. Dropped once this reaches zero.
    pub hops_remaining: i32,
    /// Encoded topic value.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create an envelope with the default hop budget.
    #[must_use]
    pub fn new(topic_id: TopicId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic_id,
            hops_remaining: DEFAULT_HOPS,
            payload: payload.into(),
        }
    }

    /// Set the hop budget.
    #[must_use]
    pub fn with_hops(mut self, hops: i32) -> Self {
        self.hops_remaining = hops;
        self
    }

    /// Create a topic-discovery report listing the given topic ids.
    #[must_use]
    pub fn topic_report(report: &TopicReport) -> Self {
        Self::new(TOPIC_REPORT_ID, report.to_bytes().to_vec())
    }

    /// Whether this envelope is a topic-discovery report.
    #[must_use]
    pub fn is_topic_report(&self) -> bool {
        self.topic_id == TOPIC_REPORT_ID
    }

    /// Whether the hop budget is exhausted.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.hops_remaining <= 0
    }

    /// Copy of this envelope after one more hop.
    #[must_use]
    pub fn next_hop(&self) -> Self {
        Self {
            topic_id: self.topic_id,
            hops_remaining: self.hops_remaining.saturating_sub(1),
            payload: self.payload.clone(),
        }
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_creation() {
        let env = Envelope::new(1400, b"sample".to_vec());
        assert_eq!(env.topic_id, 1400);
        assert_eq!(env.hops_remaining, DEFAULT_HOPS);
        assert_eq!(env.payload_size(), 6);
        assert!(!env.is_topic_report());
        assert!(!env.is_expired());
    }

    #[test]
    fn test_next_hop_decrements() {
        let env = Envelope::new(7, vec![]).with_hops(1);
        let next = env.next_hop();
        assert_eq!(next.hops_remaining, 0);
        assert!(next.is_expired());
        // Source envelope is untouched
        assert_eq!(env.hops_remaining, 1);
    }

    #[test]
    fn test_next_hop_saturates() {
        let env = Envelope::new(7, vec![]).with_hops(i32::MIN);
        assert_eq!(env.next_hop().hops_remaining, i32::MIN);
    }

    #[test]
    fn test_topic_report_envelope() {
        let report = TopicReport::new(vec![1100, 1401]);
        let env = Envelope::topic_report(&report);
        assert!(env.is_topic_report());
        assert_eq!(TopicReport::decode(&env.payload).unwrap(), report);
    }
}
