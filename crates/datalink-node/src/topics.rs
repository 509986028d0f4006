//! Typed handles for the node's topics.

use crate::config::TopicMap;
use datalink_core::{Bus, BusError, Topic};
use datalink_protocol::{EstimationCommand, EstimationState, EstimationTelemetry, Heartbeat};

/// Every topic the node registers on its bus.
#[derive(Debug, Clone)]
pub struct Topics {
    pub self_telemetry: Topic<EstimationTelemetry>,
    pub self_command: Topic<EstimationCommand>,
    pub self_state: Topic<EstimationState>,
    pub target_telemetry: Topic<EstimationTelemetry>,
    pub target_command: Topic<EstimationCommand>,
    pub target_state: Topic<EstimationState>,
    pub internode_telemetry: Topic<EstimationTelemetry>,
    pub internode_command: Topic<EstimationCommand>,
    pub internode_state: Topic<EstimationState>,
    pub wifi_access_point: Topic<bool>,
    pub wifi_station: Topic<bool>,
    pub heartbeat_local: Topic<Heartbeat>,
    pub heartbeat_internode: Topic<Heartbeat>,
}

impl Topics {
    /// Register every topic of `map` on `bus`.
    ///
    /// # Errors
    ///
    /// Returns an error if an id is reserved or assigned twice.
    pub fn register(bus: &Bus, map: &TopicMap) -> Result<Self, BusError> {
        Ok(Self {
            self_telemetry: bus.register(map.self_telemetry, "self.telemetry")?,
            self_command: bus.register(map.self_command, "self.command")?,
            self_state: bus.register(map.self_state, "self.state")?,
            target_telemetry: bus.register(map.target_telemetry, "target.telemetry")?,
            target_command: bus.register(map.target_command, "target.command")?,
            target_state: bus.register(map.target_state, "target.state")?,
            internode_telemetry: bus.register(map.internode_telemetry, "internode.telemetry")?,
            internode_command: bus.register(map.internode_command, "internode.command")?,
            internode_state: bus.register(map.internode_state, "internode.state")?,
            wifi_access_point: bus.register(map.wifi_access_point, "wifi.access_point")?,
            wifi_station: bus.register(map.wifi_station, "wifi.station")?,
            heartbeat_local: bus.register(map.heartbeat_local, "heartbeat.local")?,
            heartbeat_internode: bus.register(map.heartbeat_internode, "heartbeat.internode")?,
        })
    }
}
