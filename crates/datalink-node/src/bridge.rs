//! The bridge task.
//!
//! Each tick moves the latest values between the local estimation process,
//! this node's topics and the inter-node topics carried by the wireless
//! gateway. Every republish onto a topic the bridge itself subscribes to goes
//! through `publish_except`, so the bridge never sees its own output as new
//! input.

use datalink_core::{Bus, BusError, Subscriber, Topic};
use datalink_protocol::{EstimationCommand, EstimationState, EstimationTelemetry, Heartbeat, Payload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::ipc::{Endpoint, IpcError};
use crate::metrics;
use crate::topics::Topics;

/// Process endpoints used by the bridge.
pub struct ProcessEndpoints {
    pub telemetry: Endpoint<EstimationTelemetry>,
    pub command: Endpoint<EstimationCommand>,
    pub state: Endpoint<EstimationState>,
}

/// Values forwarded by each bridge step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub ticks: u64,
    pub telemetry: u64,
    pub state: u64,
    pub target_telemetry: u64,
    pub target_state: u64,
    pub peer_commands: u64,
    pub local_commands: u64,
    pub target_commands: u64,
    pub heartbeats_out: u64,
    pub heartbeats_in: u64,
    pub ipc_errors: u64,
}

/// The bridge.
pub struct Bridge {
    bus: Arc<Bus>,
    topics: Topics,
    process: ProcessEndpoints,
    internode_telemetry: Subscriber<EstimationTelemetry>,
    internode_state: Subscriber<EstimationState>,
    internode_command: Subscriber<EstimationCommand>,
    self_command: Subscriber<EstimationCommand>,
    target_command: Subscriber<EstimationCommand>,
    heartbeat_local: Subscriber<Heartbeat>,
    heartbeat_internode: Subscriber<Heartbeat>,
    stats: BridgeStats,
}

impl Bridge {
    /// Create a bridge and its subscriptions.
    ///
    /// # Errors
    ///
    /// Returns an error if a topic is not registered on `bus`.
    pub fn new(bus: Arc<Bus>, topics: Topics, process: ProcessEndpoints) -> Result<Self, BusError> {
        Ok(Self {
            internode_telemetry: bus.subscribe(&topics.internode_telemetry)?,
            internode_state: bus.subscribe(&topics.internode_state)?,
            internode_command: bus.subscribe(&topics.internode_command)?,
            self_command: bus.subscribe(&topics.self_command)?,
            target_command: bus.subscribe(&topics.target_command)?,
            heartbeat_local: bus.subscribe(&topics.heartbeat_local)?,
            heartbeat_internode: bus.subscribe(&topics.heartbeat_internode)?,
            bus,
            topics,
            process,
            stats: BridgeStats::default(),
        })
    }

    /// Get the forwarding statistics.
    #[must_use]
    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    fn mirror<T: Payload>(&self, topic: &Topic<T>, value: &T, own: &Subscriber<T>) -> usize {
        self.bus.publish_except(topic, value, own.subscription())
    }

    fn ipc_failed(&mut self, e: &IpcError) {
        self.stats.ipc_errors += 1;
        let channel = match e {
            IpcError::Io { channel, .. } | IpcError::Closed(channel) => *channel,
        };
        metrics::record_ipc_error(channel);
        debug!(error = %e, "Process channel error");
    }

    fn send_to_process(&mut self, command: &EstimationCommand) {
        if let Err(e) = self.process.command.try_send(command) {
            self.ipc_failed(&e);
        }
    }

    /// Run one forwarding pass.
    pub fn tick(&mut self) {
        self.stats.ticks += 1;

        // 1. Process telemetry to this node and the peer
        match self.process.telemetry.try_recv_latest() {
            Ok(Some(telemetry)) => {
                self.bus.publish(&self.topics.self_telemetry, &telemetry);
                self.mirror(&self.topics.internode_telemetry, &telemetry, &self.internode_telemetry);
                self.stats.telemetry += 1;
                metrics::record_forward("telemetry");
            }
            Ok(None) => {}
            Err(e) => self.ipc_failed(&e),
        }

        // 2. Process state, same pattern
        match self.process.state.try_recv_latest() {
            Ok(Some(state)) => {
                self.bus.publish(&self.topics.self_state, &state);
                self.mirror(&self.topics.internode_state, &state, &self.internode_state);
                self.stats.state += 1;
                metrics::record_forward("state");
            }
            Ok(None) => {}
            Err(e) => self.ipc_failed(&e),
        }

        // 3. Peer telemetry and state become target values
        if let Some(telemetry) = self.internode_telemetry.try_take_if_new() {
            self.bus.publish(&self.topics.target_telemetry, &telemetry);
            self.stats.target_telemetry += 1;
            metrics::record_forward("target_telemetry");
        }
        if let Some(state) = self.internode_state.try_take_if_new() {
            self.bus.publish(&self.topics.target_state, &state);
            self.stats.target_state += 1;
            metrics::record_forward("target_state");
        }

        // 4. Peer commands reach this node and its process
        if let Some(command) = self.internode_command.try_take_if_new() {
            trace!(kind = ?command.kind, "Peer command");
            self.mirror(&self.topics.self_command, &command, &self.self_command);
            self.send_to_process(&command);
            self.stats.peer_commands += 1;
            metrics::record_forward("peer_command");
        }

        // 5. Commands from the flight computer or local tools
        if let Some(command) = self.self_command.try_take_if_new() {
            trace!(kind = ?command.kind, "Local command");
            self.send_to_process(&command);
            self.stats.local_commands += 1;
            metrics::record_forward("local_command");
        }

        // 6. Commands for the target go to the peer
        if let Some(command) = self.target_command.try_take_if_new() {
            self.mirror(&self.topics.internode_command, &command, &self.internode_command);
            self.stats.target_commands += 1;
            metrics::record_forward("target_command");
        }

        // 7. Heartbeat both ways
        let local = self.heartbeat_local.try_take_if_new();
        let remote = self.heartbeat_internode.try_take_if_new();
        if let Some(heartbeat) = local {
            self.mirror(&self.topics.heartbeat_internode, &heartbeat, &self.heartbeat_internode);
            self.stats.heartbeats_out += 1;
            metrics::record_forward("heartbeat_out");
        }
        if let Some(heartbeat) = remote {
            self.mirror(&self.topics.heartbeat_local, &heartbeat, &self.heartbeat_local);
            self.stats.heartbeats_in += 1;
            metrics::record_forward("heartbeat_in");
        }
    }

    /// Tick every `period` until shutdown.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            period_ms = period.as_millis() as u64,
            telemetry = self.process.telemetry.channel(),
            command = self.process.command.channel(),
            state = self.process.state.channel(),
            "Bridge running"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.tick(),
            }
        }

        if self.stats.ipc_errors > 0 {
            warn!(errors = self.stats.ipc_errors, "Process channel errors during run");
        }
        info!(stats = ?self.stats(), "Bridge stopped");
    }
}
