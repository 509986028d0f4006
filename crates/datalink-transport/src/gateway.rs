//! Transport gateway.
//!
//! A gateway joins one [`Link`] to the bus. Values published locally on the
//! topics it forwards are wrapped in envelopes and sent on the link; envelopes
//! received from the link are published on the bus and offered to the router,
//! which may relay them to the other gateways.

use bytes::Bytes;
use datalink_core::{
    Bus, ExclusionRouter, LinkId, Relay, RouterError, Subscription, SubscriptionScope, TopicId,
};
use datalink_protocol::{Envelope, Payload, TopicReport, DEFAULT_HOPS};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::traits::{Link, TransportError};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Identity of this gateway towards the router.
    pub link_id: LinkId,
    /// Forward every registered topic.
    pub forward_all: bool,
    /// Topics forwarded when `forward_all` is off.
    pub topics: Vec<TopicId>,
    /// Topics never sent on this link, whatever their source.
    pub exclude: Vec<TopicId>,
    /// Topics a peer may add through a topic report.
    pub learnable: Vec<TopicId>,
    /// Hop budget of envelopes created by this gateway.
    pub default_hops: i32,
    /// How often local subscriptions are drained onto the link.
    pub poll_interval: Duration,
    /// How often a topic report is sent. `None` disables reports.
    pub report_interval: Option<Duration>,
    /// Capacity of the queue of envelopes relayed by the router.
    pub relay_queue: usize,
}

impl GatewayConfig {
    /// Create a configuration with defaults for the given link.
    #[must_use]
    pub fn new(link_id: LinkId) -> Self {
        Self {
            link_id,
            forward_all: false,
            topics: Vec::new(),
            exclude: Vec::new(),
            learnable: Vec::new(),
            default_hops: DEFAULT_HOPS,
            poll_interval: Duration::from_millis(10),
            report_interval: None,
            relay_queue: 256,
        }
    }
}

/// Shared gateway counters.
#[derive(Debug, Default)]
pub struct GatewayCounters {
    /// Envelopes received from the link.
    pub envelopes_in: AtomicU64,
    /// Envelopes created from local publishes and sent.
    pub envelopes_out: AtomicU64,
    /// Envelopes relayed by the router and sent.
    pub relayed_out: AtomicU64,
    /// Received data that failed to decode.
    pub decode_errors: AtomicU64,
    /// Sends that failed.
    pub send_errors: AtomicU64,
    /// Topic reports received.
    pub reports_in: AtomicU64,
}

/// Router-facing handle of a gateway.
pub struct GatewayRelay {
    link_id: LinkId,
    tx: mpsc::Sender<Envelope>,
}

impl Relay for GatewayRelay {
    fn link_id(&self) -> LinkId {
        self.link_id
    }

    fn relay(&self, envelope: Envelope) -> bool {
        self.tx.try_send(envelope).is_ok()
    }
}

/// A gateway between the bus and one link.
pub struct Gateway<L> {
    config: GatewayConfig,
    link: L,
    bus: Arc<Bus>,
    router: Option<Arc<ExclusionRouter>>,
    subscriptions: BTreeMap<TopicId, Subscription>,
    excluded: HashSet<TopicId>,
    learnable: HashSet<TopicId>,
    remote_interest: HashSet<TopicId>,
    relay: Arc<GatewayRelay>,
    relay_rx: mpsc::Receiver<Envelope>,
    counters: Arc<GatewayCounters>,
}

impl<L: Link> Gateway<L> {
    /// Create a gateway and subscribe to the topics it forwards.
    #[must_use]
    pub fn new(config: GatewayConfig, link: L, bus: Arc<Bus>) -> Self {
        let (tx, relay_rx) = mpsc::channel(config.relay_queue.max(1));
        let relay = Arc::new(GatewayRelay {
            link_id: config.link_id,
            tx,
        });

        let mut gateway = Self {
            excluded: config.exclude.iter().copied().collect(),
            learnable: config.learnable.iter().copied().collect(),
            config,
            link,
            bus,
            router: None,
            subscriptions: BTreeMap::new(),
            remote_interest: HashSet::new(),
            relay,
            relay_rx,
            counters: Arc::new(GatewayCounters::default()),
        };

        let initial = if gateway.config.forward_all {
            gateway.bus.topic_ids()
        } else {
            gateway.config.topics.clone()
        };
        for id in initial {
            gateway.ensure_subscribed(id);
        }

        info!(
            link = %gateway.link.name(),
            id = %gateway.config.link_id,
            topics = gateway.subscriptions.len(),
            "Gateway created"
        );
        gateway
    }

    /// Bind this gateway to a router.
    ///
    /// # Errors
    ///
    /// Returns an error if the router already has a link with this id.
    pub fn attach(&mut self, router: Arc<ExclusionRouter>) -> Result<(), RouterError> {
        router.bind(self.relay.clone())?;
        self.router = Some(router);
        Ok(())
    }

    /// Get the shared counters.
    #[must_use]
    pub fn counters(&self) -> Arc<GatewayCounters> {
        self.counters.clone()
    }

    /// Get the link id.
    #[must_use]
    pub fn link_id(&self) -> LinkId {
        self.config.link_id
    }

    /// Whether local publishes on `id` are sent on this link.
    #[must_use]
    pub fn forwards(&self, id: TopicId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    /// Topics a peer asked for through topic reports and was granted.
    #[must_use]
    pub fn remote_interest(&self) -> Vec<TopicId> {
        let mut ids: Vec<TopicId> = self.remote_interest.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn ensure_subscribed(&mut self, id: TopicId) {
        if self.excluded.contains(&id) || self.subscriptions.contains_key(&id) {
            return;
        }
        match self.bus.subscribe_id(id, SubscriptionScope::LocalOnly) {
            Ok(sub) => {
                self.subscriptions.insert(id, sub);
            }
            Err(e) => {
                warn!(link = %self.link.name(), topic = id, error = %e, "Cannot forward topic");
            }
        }
    }

    async fn transmit(&mut self, envelope: &Envelope) -> Result<bool, TransportError> {
        if !self.link.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        match self.link.send(envelope).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!(link = %self.link.name(), topic = envelope.topic_id, error = %e, "Send failed");
                Ok(false)
            }
        }
    }

    /// Send every new local value of the forwarded topics.
    ///
    /// Returns the number of envelopes sent.
    ///
    /// # Errors
    ///
    /// Returns an error only if the link is closed.
    pub async fn pump_outbound(&mut self) -> Result<usize, TransportError> {
        let pending: Vec<Envelope> = self
            .subscriptions
            .iter()
            .filter_map(|(&id, sub)| {
                sub.try_take_if_new().map(|value| {
                    Envelope::new(id, value.to_vec()).with_hops(self.config.default_hops)
                })
            })
            .collect();

        let mut sent = 0;
        for envelope in &pending {
            if self.transmit(envelope).await? {
                sent += 1;
            }
        }
        if sent > 0 {
            self.counters
                .envelopes_out
                .fetch_add(sent as u64, Ordering::Relaxed);
            trace!(link = %self.link.name(), sent, "Outbound pumped");
        }
        Ok(sent)
    }

    /// Send an envelope handed over by the router.
    ///
    /// # Errors
    ///
    /// Returns an error only if the link is closed.
    pub async fn send_relayed(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        if self.excluded.contains(&envelope.topic_id) {
            trace!(link = %self.link.name(), topic = envelope.topic_id, "Relay of excluded topic dropped");
            return Ok(());
        }
        if self.transmit(&envelope).await? {
            self.counters.relayed_out.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Send a report of the topics this process consumes.
    ///
    /// # Errors
    ///
    /// Returns an error only if the link is closed.
    pub async fn send_topic_report(&mut self) -> Result<(), TransportError> {
        let report = TopicReport::new(self.bus.interested_topics());
        debug!(link = %self.link.name(), topics = report.topics.len(), "Sending topic report");
        let envelope = Envelope::topic_report(&report).with_hops(self.config.default_hops);
        self.transmit(&envelope).await?;
        Ok(())
    }

    /// Handle an envelope received from the link.
    pub fn handle_inbound(&mut self, envelope: Envelope) {
        self.counters.envelopes_in.fetch_add(1, Ordering::Relaxed);

        if let Some(router) = &self.router {
            router.route(&envelope, self.config.link_id);
        }

        if envelope.is_topic_report() {
            self.learn_report(&envelope);
            return;
        }

        let topic = envelope.topic_id;
        let delivered = self
            .bus
            .publish_remote(topic, Bytes::from(envelope.payload));
        trace!(link = %self.link.name(), topic, delivered, "Inbound published");
    }

    fn learn_report(&mut self, envelope: &Envelope) {
        self.counters.reports_in.fetch_add(1, Ordering::Relaxed);
        let report = match TopicReport::decode(&envelope.payload) {
            Ok(report) => report,
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(link = %self.link.name(), error = %e, "Malformed topic report");
                return;
            }
        };

        for id in report.topics {
            if !self.learnable.contains(&id) || self.excluded.contains(&id) {
                trace!(link = %self.link.name(), topic = id, "Reported interest ignored");
                continue;
            }
            if self.bus.is_registered(id) && self.remote_interest.insert(id) {
                debug!(link = %self.link.name(), topic = id, "Peer interested in topic");
                self.ensure_subscribed(id);
            }
        }
    }

    /// Run the gateway until shutdown or until the link closes.
    ///
    /// # Errors
    ///
    /// Returns an error if the link fails fatally.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reports_enabled = self.config.report_interval.is_some();
        let mut report = interval(
            self.config
                .report_interval
                .unwrap_or(Duration::from_secs(3600)),
        );
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(link = %self.link.name(), "Gateway running");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(link = %self.link.name(), "Gateway shutting down");
                    return Ok(());
                }

                received = self.link.recv() => {
                    match received {
                        Ok(Some(envelope)) => self.handle_inbound(envelope),
                        Ok(None) => {
                            info!(link = %self.link.name(), "Link closed");
                            return Ok(());
                        }
                        Err(TransportError::Protocol(e)) => {
                            self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                            warn!(link = %self.link.name(), error = %e, "Dropping undecodable data");
                        }
                        Err(e) if e.is_fatal() => {
                            error!(link = %self.link.name(), error = %e, "Link failed");
                            return Err(e);
                        }
                        Err(e) => {
                            warn!(link = %self.link.name(), error = %e, "Receive error");
                        }
                    }
                }

                Some(envelope) = self.relay_rx.recv() => {
                    self.send_relayed(envelope).await?;
                }

                _ = poll.tick() => {
                    self.pump_outbound().await?;
                }

                _ = report.tick(), if reports_enabled => {
                    self.send_topic_report().await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLink;
    use datalink_core::RouterConfig;
    use datalink_protocol::{CommandKind, EstimationCommand, TOPIC_REPORT_ID};
    use tokio::time::timeout;

    const SERIAL: LinkId = LinkId(1);
    const WIRELESS: LinkId = LinkId(2);

    const SELF_COMMAND: TopicId = 1101;
    const INTERNODE_COMMAND: TopicId = 1401;
    const WIFI_AP: TopicId = 1500;

    fn node_bus() -> Arc<Bus> {
        let bus = Arc::new(Bus::new());
        bus.register::<EstimationCommand>(SELF_COMMAND, "self:command")
            .unwrap();
        bus.register::<EstimationCommand>(INTERNODE_COMMAND, "internode:command")
            .unwrap();
        bus.register::<bool>(WIFI_AP, "wifi:ap").unwrap();
        bus
    }

    async fn expect_envelope(link: &mut MemoryLink) -> Envelope {
        timeout(Duration::from_millis(500), link.recv())
            .await
            .expect("envelope expected")
            .unwrap()
            .unwrap()
    }

    async fn expect_silence(link: &mut MemoryLink) {
        if let Ok(received) = timeout(Duration::from_millis(500), link.recv()).await {
            panic!("unexpected envelope: {:?}", received);
        }
    }

    #[tokio::test]
    async fn test_pump_sends_only_new_local_values() {
        let bus = node_bus();
        let (link, mut peer) = MemoryLink::pair("wireless", "peer");
        let mut config = GatewayConfig::new(WIRELESS);
        config.topics = vec![INTERNODE_COMMAND];
        config.default_hops = 3;
        let mut gateway = Gateway::new(config, link, bus.clone());

        assert_eq!(gateway.pump_outbound().await.unwrap(), 0);

        let cmd = EstimationCommand::new(CommandKind::Startup, 0);
        bus.publish_raw(INTERNODE_COMMAND, cmd.to_bytes());
        assert_eq!(gateway.pump_outbound().await.unwrap(), 1);
        assert_eq!(gateway.pump_outbound().await.unwrap(), 0);

        let env = expect_envelope(&mut peer).await;
        assert_eq!(env.topic_id, INTERNODE_COMMAND);
        assert_eq!(env.hops_remaining, 3);
        assert_eq!(EstimationCommand::decode(&env.payload).unwrap(), cmd);
    }

    #[tokio::test]
    async fn test_inbound_is_not_echoed_back() {
        let bus = node_bus();
        let (link, mut peer) = MemoryLink::pair("wireless", "peer");
        let mut config = GatewayConfig::new(WIRELESS);
        config.topics = vec![INTERNODE_COMMAND];
        let mut gateway = Gateway::new(config, link, bus.clone());
        let consumer = bus.subscribe_id(INTERNODE_COMMAND, SubscriptionScope::All).unwrap();

        let cmd = EstimationCommand::new(CommandKind::Shutdown, 0);
        gateway.handle_inbound(Envelope::new(INTERNODE_COMMAND, cmd.to_bytes().to_vec()));

        assert_eq!(consumer.try_take_if_new(), Some(cmd.to_bytes()));
        assert_eq!(gateway.pump_outbound().await.unwrap(), 0);
        expect_silence(&mut peer).await;
    }

    #[tokio::test]
    async fn test_forward_all_respects_exclude() {
        let bus = node_bus();
        let (link, _peer) = MemoryLink::pair("serial", "fc");
        let mut config = GatewayConfig::new(SERIAL);
        config.forward_all = true;
        config.exclude = vec![INTERNODE_COMMAND];
        let gateway = Gateway::new(config, link, bus);

        assert!(gateway.forwards(SELF_COMMAND));
        assert!(gateway.forwards(WIFI_AP));
        assert!(!gateway.forwards(INTERNODE_COMMAND));
    }

    #[tokio::test]
    async fn test_topic_report_adds_interest() {
        let bus = node_bus();
        let (link, mut peer) = MemoryLink::pair("wireless", "peer");
        let mut config = GatewayConfig::new(WIRELESS);
        config.exclude = vec![SELF_COMMAND];
        config.learnable = vec![WIFI_AP, SELF_COMMAND, 9999];
        let mut gateway = Gateway::new(config, link, bus.clone());
        assert!(!gateway.forwards(WIFI_AP));

        let report = TopicReport::new(vec![WIFI_AP, SELF_COMMAND, 9999]);
        gateway.handle_inbound(Envelope::topic_report(&report));

        assert_eq!(gateway.remote_interest(), vec![WIFI_AP]);
        assert!(gateway.forwards(WIFI_AP));
        // Excluded topics stay off the link even when asked for
        assert!(!gateway.forwards(SELF_COMMAND));

        bus.publish_raw(WIFI_AP, true.to_bytes());
        gateway.pump_outbound().await.unwrap();
        assert_eq!(expect_envelope(&mut peer).await.topic_id, WIFI_AP);
    }

    #[tokio::test]
    async fn test_report_cannot_pull_local_topics() {
        let bus = node_bus();
        let (link, mut peer) = MemoryLink::pair("wireless", "peer");
        let mut config = GatewayConfig::new(WIRELESS);
        config.topics = vec![INTERNODE_COMMAND];
        let mut gateway = Gateway::new(config, link, bus.clone());

        // The peer consumes its own local topics and says so
        let report = TopicReport::new(vec![SELF_COMMAND, WIFI_AP, INTERNODE_COMMAND]);
        gateway.handle_inbound(Envelope::topic_report(&report));

        assert!(gateway.remote_interest().is_empty());
        assert!(!gateway.forwards(SELF_COMMAND));
        assert!(!gateway.forwards(WIFI_AP));
        assert_eq!(gateway.counters().reports_in.load(Ordering::Relaxed), 1);

        let cmd = EstimationCommand::new(CommandKind::Startup, 0);
        bus.publish_raw(SELF_COMMAND, cmd.to_bytes());
        bus.publish_raw(WIFI_AP, true.to_bytes());
        assert_eq!(gateway.pump_outbound().await.unwrap(), 0);
        expect_silence(&mut peer).await;
    }

    #[tokio::test]
    async fn test_closed_link_stops_transmit() {
        let bus = node_bus();
        let (mut link, peer) = MemoryLink::pair("wireless", "peer");
        drop(peer);
        assert!(link.recv().await.unwrap().is_none());

        let mut config = GatewayConfig::new(WIRELESS);
        config.topics = vec![INTERNODE_COMMAND];
        let mut gateway = Gateway::new(config, link, bus.clone());

        bus.publish_raw(
            INTERNODE_COMMAND,
            EstimationCommand::new(CommandKind::Shutdown, 0).to_bytes(),
        );
        assert!(matches!(
            gateway.pump_outbound().await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(matches!(
            gateway.send_topic_report().await,
            Err(TransportError::ConnectionClosed)
        ));
        assert_eq!(gateway.counters().send_errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_sends_report_of_consumed_topics() {
        let bus = node_bus();
        let (link, mut peer) = MemoryLink::pair("wireless", "peer");
        let mut gateway = Gateway::new(GatewayConfig::new(WIRELESS), link, bus.clone());
        let _consumer = bus.subscribe_id(INTERNODE_COMMAND, SubscriptionScope::All).unwrap();

        gateway.send_topic_report().await.unwrap();

        let env = expect_envelope(&mut peer).await;
        assert_eq!(env.topic_id, TOPIC_REPORT_ID);
        assert_eq!(
            TopicReport::decode(&env.payload).unwrap().topics,
            vec![INTERNODE_COMMAND]
        );
    }

    struct Node {
        bus: Arc<Bus>,
        router: Arc<ExclusionRouter>,
        flight_computer: MemoryLink,
        peer: MemoryLink,
        shutdown: watch::Sender<bool>,
    }

    /// Node A: serial gateway to the flight computer, wireless gateway to the
    /// peer, inter-node command topic kept off the serial side.
    fn spawn_node() -> Node {
        let bus = node_bus();
        let router = Arc::new(ExclusionRouter::with_config(RouterConfig {
            forward_topic_reports: true,
            ..Default::default()
        }));
        assert!(router.add_excluded(INTERNODE_COMMAND));

        let (serial_link, flight_computer) = MemoryLink::pair("serial", "flight-computer");
        let (wireless_link, peer) = MemoryLink::pair("wireless", "peer");

        let mut serial_config = GatewayConfig::new(SERIAL);
        serial_config.forward_all = true;
        serial_config.exclude = vec![INTERNODE_COMMAND];
        let mut serial = Gateway::new(serial_config, serial_link, bus.clone());
        serial.attach(router.clone()).unwrap();

        let mut wireless_config = GatewayConfig::new(WIRELESS);
        wireless_config.topics = vec![INTERNODE_COMMAND];
        let mut wireless = Gateway::new(wireless_config, wireless_link, bus.clone());
        wireless.attach(router.clone()).unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(serial.run(shutdown_rx.clone()));
        tokio::spawn(wireless.run(shutdown_rx));

        Node {
            bus,
            router,
            flight_computer,
            peer,
            shutdown,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_excluded_command_never_reaches_serial() {
        let mut node = spawn_node();

        // Local publish on the inter-node command topic
        let cmd = EstimationCommand::new(CommandKind::StartRecording, 1);
        node.bus.publish_raw(INTERNODE_COMMAND, cmd.to_bytes());

        let env = expect_envelope(&mut node.peer).await;
        assert_eq!(env.topic_id, INTERNODE_COMMAND);
        expect_silence(&mut node.flight_computer).await;

        // The same topic arriving from the peer is not relayed to serial either
        node.peer
            .send(&Envelope::new(INTERNODE_COMMAND, cmd.to_bytes().to_vec()))
            .await
            .unwrap();
        expect_silence(&mut node.flight_computer).await;
        assert_eq!(node.router.stats().dropped_excluded, 1);

        node.shutdown.send(true).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_between_links_decrements_hops() {
        let mut node = spawn_node();

        node.peer
            .send(&Envelope::new(WIFI_AP, true.to_bytes().to_vec()).with_hops(2))
            .await
            .unwrap();

        let relayed = expect_envelope(&mut node.flight_computer).await;
        assert_eq!(relayed.topic_id, WIFI_AP);
        assert_eq!(relayed.hops_remaining, 1);

        // Not echoed back to the wireless side by the local publish
        expect_silence(&mut node.peer).await;

        // An envelope with no hops left is consumed locally but not relayed
        let ap = node.bus.subscribe_id(WIFI_AP, SubscriptionScope::All).unwrap();
        node.peer
            .send(&Envelope::new(WIFI_AP, false.to_bytes().to_vec()).with_hops(0))
            .await
            .unwrap();
        expect_silence(&mut node.flight_computer).await;
        assert_eq!(ap.try_take_if_new(), Some(false.to_bytes()));

        node.shutdown.send(true).unwrap();
    }
}
