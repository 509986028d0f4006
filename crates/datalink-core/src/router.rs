//! Exclusion router.
//!
//! Sits between two or more gateways and decides, for every envelope that
//! arrives on one of them, whether it may be relayed to the others.

use crate::exclusion::{ExclusionSet, DEFAULT_EXCLUSION_CAPACITY};
use crate::topic::TopicId;
use datalink_protocol::Envelope;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Identifies a gateway link bound to a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// The router's view of a gateway.
///
/// The router never owns a gateway. It only hands envelopes to this handle,
/// which must not block.
pub trait Relay: Send + Sync {
    /// The link this handle feeds.
    fn link_id(&self) -> LinkId;

    /// Queue an envelope for transmission.
    ///
    /// Returns `false` if the envelope was dropped.
    fn relay(&self, envelope: Envelope) -> bool;
}

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The exclusion set is full.
    #[error("Exclusion set full (capacity {capacity}) while adding topic {topic}")]
    ExclusionCapacity { capacity: usize, topic: TopicId },

    /// A link with this id is already bound.
    #[error("Link already bound: {0}")]
    DuplicateLink(LinkId),
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Relay topic-discovery reports between links.
    pub forward_topic_reports: bool,
    /// Maximum number of excluded topic ids.
    pub exclusion_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            forward_topic_reports: false,
            exclusion_capacity: DEFAULT_EXCLUSION_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Route,
    HopsExhausted,
    TopicReport,
    Excluded,
}

#[derive(Debug, Default)]
struct Counters {
    routed: AtomicU64,
    dropped_hops: AtomicU64,
    dropped_reports: AtomicU64,
    dropped_excluded: AtomicU64,
    relay_failures: AtomicU64,
}

/// Relays envelopes between gateways, except for excluded topics.
pub struct ExclusionRouter {
    config: RouterConfig,
    exclusions: RwLock<ExclusionSet>,
    links: RwLock<Vec<Arc<dyn Relay>>>,
    counters: Counters,
}

impl ExclusionRouter {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            exclusions: RwLock::new(ExclusionSet::with_capacity(config.exclusion_capacity)),
            links: RwLock::new(Vec::new()),
            counters: Counters::default(),
            config,
        }
    }

    /// Whether topic reports are relayed.
    #[must_use]
    pub fn forwards_topic_reports(&self) -> bool {
        self.config.forward_topic_reports
    }

    /// Bind a gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if a gateway with the same link id is already bound.
    pub fn bind(&self, relay: Arc<dyn Relay>) -> Result<(), RouterError> {
        let mut links = self.links.write();
        let id = relay.link_id();
        if links.iter().any(|l| l.link_id() == id) {
            return Err(RouterError::DuplicateLink(id));
        }
        links.push(relay);
        debug!(link = %id, links = links.len(), "Bound link");
        Ok(())
    }

    /// Number of bound links.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.read().len()
    }

    /// Exclude a topic from being relayed.
    ///
    /// Returns `false` without side effect if the exclusion set is full.
    pub fn add_excluded(&self, topic_id: TopicId) -> bool {
        let added = self.exclusions.write().insert(topic_id);
        if added {
            debug!(topic = topic_id, "Topic excluded from routing");
        } else {
            warn!(topic = topic_id, "Exclusion set full");
        }
        added
    }

    /// Clear the exclusion set. Every topic routes again.
    pub fn reset(&self) {
        self.exclusions.write().clear();
        debug!("Exclusion set cleared");
    }

    /// Replace the exclusion set with `ids`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ids` does not fit. The ids that fit stay excluded.
    pub fn provision(&self, ids: &[TopicId]) -> Result<(), RouterError> {
        let mut exclusions = self.exclusions.write();
        exclusions.clear();
        for &topic in ids {
            if !exclusions.insert(topic) {
                return Err(RouterError::ExclusionCapacity {
                    capacity: exclusions.capacity(),
                    topic,
                });
            }
        }
        info!(excluded = exclusions.len(), "Exclusion set provisioned");
        Ok(())
    }

    /// Snapshot of the excluded ids, in insertion order.
    #[must_use]
    pub fn excluded(&self) -> Vec<TopicId> {
        self.exclusions.read().as_slice().to_vec()
    }

    fn verdict(&self, envelope: &Envelope) -> Verdict {
        if envelope.is_expired() {
            return Verdict::HopsExhausted;
        }
        if envelope.is_topic_report() && !self.config.forward_topic_reports {
            return Verdict::TopicReport;
        }
        if self.exclusions.read().contains(envelope.topic_id) {
            return Verdict::Excluded;
        }
        Verdict::Route
    }

    /// Decide whether an envelope that arrived on `source` may be relayed.
    ///
    /// Checks, in order: hop budget, topic report policy, exclusion set.
    #[must_use]
    pub fn should_route(&self, envelope: &Envelope, source: LinkId) -> bool {
        let verdict = self.verdict(envelope);
        trace!(topic = envelope.topic_id, source = %source, ?verdict, "Routing decision");
        verdict == Verdict::Route
    }

    /// Relay an envelope that arrived on `source` to every other link.
    ///
    /// The relayed copies carry one hop less. Returns the number of links that
    /// accepted the envelope.
    pub fn route(&self, envelope: &Envelope, source: LinkId) -> usize {
        match self.verdict(envelope) {
            Verdict::Route => {}
            Verdict::HopsExhausted => {
                self.counters.dropped_hops.fetch_add(1, Ordering::Relaxed);
                trace!(topic = envelope.topic_id, source = %source, "Hop budget exhausted");
                return 0;
            }
            Verdict::TopicReport => {
                self.counters.dropped_reports.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
            Verdict::Excluded => {
                self.counters.dropped_excluded.fetch_add(1, Ordering::Relaxed);
                trace!(topic = envelope.topic_id, source = %source, "Excluded topic not relayed");
                return 0;
            }
        }

        let forwarded = envelope.next_hop();
        let mut accepted = 0;
        for link in self.links.read().iter() {
            if link.link_id() == source {
                continue;
            }
            if link.relay(forwarded.clone()) {
                accepted += 1;
            } else {
                self.counters.relay_failures.fetch_add(1, Ordering::Relaxed);
                warn!(topic = envelope.topic_id, link = %link.link_id(), "Relay dropped envelope");
            }
        }

        self.counters.routed.fetch_add(1, Ordering::Relaxed);
        trace!(topic = envelope.topic_id, source = %source, links = accepted, "Routed envelope");
        accepted
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            links: self.link_count(),
            excluded_topics: self.exclusions.read().len(),
            routed: self.counters.routed.load(Ordering::Relaxed),
            dropped_hops: self.counters.dropped_hops.load(Ordering::Relaxed),
            dropped_reports: self.counters.dropped_reports.load(Ordering::Relaxed),
            dropped_excluded: self.counters.dropped_excluded.load(Ordering::Relaxed),
            relay_failures: self.counters.relay_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for ExclusionRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    /// Number of bound links.
    pub links: usize,
    /// Number of entries in the exclusion set.
    pub excluded_topics: usize,
    /// Envelopes relayed.
    pub routed: u64,
    /// Envelopes dropped because their hop budget ran out.
    pub dropped_hops: u64,
    /// Topic reports not relayed.
    pub dropped_reports: u64,
    /// Envelopes dropped because their topic is excluded.
    pub dropped_excluded: u64,
    /// Relays refused by a link queue.
    pub relay_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use datalink_protocol::TOPIC_REPORT_ID;
    use parking_lot::Mutex;

    const SERIAL: LinkId = LinkId(1);
    const WIRELESS: LinkId = LinkId(2);

    struct Recorder {
        id: LinkId,
        accept: bool,
        seen: Mutex<Vec<Envelope>>,
    }

    impl Recorder {
        fn new(id: LinkId) -> Arc<Self> {
            Arc::new(Self {
                id,
                accept: true,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl Relay for Recorder {
        fn link_id(&self) -> LinkId {
            self.id
        }

        fn relay(&self, envelope: Envelope) -> bool {
            if self.accept {
                self.seen.lock().push(envelope);
            }
            self.accept
        }
    }

    #[test]
    fn test_excluded_topics_never_route() {
        let router = ExclusionRouter::new();
        let excluded = [1101, 1102, 1401];
        for id in excluded {
            assert!(router.add_excluded(id));
        }

        for id in excluded {
            for hops in [-1, 0, 1, 10, i32::MAX] {
                let env = Envelope::new(id, vec![]).with_hops(hops);
                assert!(!router.should_route(&env, SERIAL));
                assert!(!router.should_route(&env, WIRELESS));
            }
        }
    }

    #[test]
    fn test_other_topics_route_with_hops_left() {
        let router = ExclusionRouter::new();
        router.add_excluded(1401);

        for id in [1, 1100, 1400, 1402, u32::MAX] {
            for hops in [1, 2, 10, i32::MAX] {
                let env = Envelope::new(id, vec![]).with_hops(hops);
                assert!(router.should_route(&env, SERIAL), "topic {id} hops {hops}");
            }
        }
    }

    #[test]
    fn test_hop_check_comes_first() {
        let router = ExclusionRouter::new();
        let env = Envelope::new(1400, vec![]).with_hops(0);
        assert!(!router.should_route(&env, SERIAL));

        router.route(&Envelope::new(1400, vec![]).with_hops(-5), SERIAL);
        router.add_excluded(1400);
        router.route(&Envelope::new(1400, vec![]).with_hops(0), SERIAL);

        // Both expired envelopes counted as hop drops, not exclusion drops
        let stats = router.stats();
        assert_eq!(stats.dropped_hops, 2);
        assert_eq!(stats.dropped_excluded, 0);
    }

    #[test]
    fn test_topic_reports_follow_flag() {
        let report = Envelope::new(TOPIC_REPORT_ID, vec![0, 0]);

        let quiet = ExclusionRouter::new();
        assert!(!quiet.should_route(&report, SERIAL));

        let chatty = ExclusionRouter::with_config(RouterConfig {
            forward_topic_reports: true,
            ..Default::default()
        });
        assert!(chatty.should_route(&report, SERIAL));
        assert!(!chatty.should_route(&report.clone().with_hops(0), SERIAL));
    }

    #[test]
    fn test_reset_routes_previously_excluded() {
        let router = ExclusionRouter::new();
        let excluded: Vec<TopicId> = (1100..1110).collect();
        for &id in &excluded {
            router.add_excluded(id);
        }

        router.reset();
        assert!(router.excluded().is_empty());
        for id in excluded {
            assert!(router.should_route(&Envelope::new(id, vec![]), WIRELESS));
        }

        // Reset twice is harmless
        router.reset();
        assert!(router.excluded().is_empty());
    }

    #[test]
    fn test_capacity_exhaustion() {
        let router = ExclusionRouter::new();
        for id in 1..=1000 {
            assert!(router.add_excluded(id));
        }
        let before = router.excluded();

        assert!(!router.add_excluded(1001));
        assert_eq!(router.excluded().len(), 1000);
        assert_eq!(router.excluded(), before);
        assert!(router.should_route(&Envelope::new(1001, vec![]), SERIAL));
    }

    #[test]
    fn test_provision_reports_overflow() {
        let router = ExclusionRouter::with_config(RouterConfig {
            exclusion_capacity: 2,
            ..Default::default()
        });
        router.provision(&[1, 2]).unwrap();
        assert_eq!(router.excluded(), vec![1, 2]);

        let err = router.provision(&[3, 4, 5]).unwrap_err();
        assert!(matches!(
            err,
            RouterError::ExclusionCapacity {
                capacity: 2,
                topic: 5
            }
        ));
        // Provisioning replaced the old entries
        assert_eq!(router.excluded(), vec![3, 4]);
    }

    #[test]
    fn test_route_skips_source_and_decrements_hops() {
        let router = ExclusionRouter::new();
        let serial = Recorder::new(SERIAL);
        let wireless = Recorder::new(WIRELESS);
        router.bind(serial.clone()).unwrap();
        router.bind(wireless.clone()).unwrap();

        let env = Envelope::new(1400, b"tm".to_vec()).with_hops(3);
        assert_eq!(router.route(&env, SERIAL), 1);

        assert!(serial.seen.lock().is_empty());
        let relayed = wireless.seen.lock();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].hops_remaining, 2);
        assert_eq!(relayed[0].payload, b"tm".to_vec());
    }

    #[test]
    fn test_route_excluded_reaches_nobody() {
        let router = ExclusionRouter::new();
        let serial = Recorder::new(SERIAL);
        let wireless = Recorder::new(WIRELESS);
        router.bind(serial.clone()).unwrap();
        router.bind(wireless.clone()).unwrap();
        router.add_excluded(1401);

        assert_eq!(router.route(&Envelope::new(1401, vec![1]), WIRELESS), 0);
        assert!(serial.seen.lock().is_empty());
        assert_eq!(router.stats().dropped_excluded, 1);
    }

    #[test]
    fn test_relay_failure_counted() {
        let router = ExclusionRouter::new();
        router
            .bind(Arc::new(Recorder {
                id: WIRELESS,
                accept: false,
                seen: Mutex::new(Vec::new()),
            }))
            .unwrap();

        assert_eq!(router.route(&Envelope::new(1400, vec![]), SERIAL), 0);
        assert_eq!(router.stats().relay_failures, 1);
        assert_eq!(router.stats().routed, 1);
    }

    #[test]
    fn test_duplicate_link_rejected() {
        let router = ExclusionRouter::new();
        router.bind(Recorder::new(SERIAL)).unwrap();
        assert!(matches!(
            router.bind(Recorder::new(SERIAL)),
            Err(RouterError::DuplicateLink(SERIAL))
        ));
        assert_eq!(router.link_count(), 1);
    }
}
