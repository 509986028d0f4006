//! Node startup and shutdown.
//!
//! Builds the bus, router, gateways, bridge and launcher from the
//! configuration, runs them as tasks and stops them on Ctrl-C.

use crate::bridge::{Bridge, ProcessEndpoints};
use crate::config::Config;
use crate::ipc::{Endpoint, UdpChannel};
use crate::launcher::Launcher;
use crate::metrics;
use crate::topics::Topics;
use anyhow::{Context, Result};
use datalink_core::{Bus, ExclusionRouter, Topic};
use datalink_protocol::Heartbeat;
use datalink_transport::{
    Gateway, GatewayConfig, GatewayCounters, Link, StreamLink, UdpConfig, UdpLink,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

type Task = (&'static str, Result<()>);

/// Bus, topics and router shared by every component of a node.
struct Core {
    bus: Arc<Bus>,
    topics: Topics,
    router: Arc<ExclusionRouter>,
}

impl Core {
    fn build(config: &Config) -> Result<Self> {
        let bus = Arc::new(Bus::new());
        let topics = Topics::register(&bus, &config.topics).context("Invalid topic map")?;

        let router = Arc::new(ExclusionRouter::with_config(config.router.router_config()));
        router
            .provision(&config.router.exclude)
            .context("Invalid router exclusion list")?;
        info!(
            excluded = ?router.excluded(),
            topic_reports = router.forwards_topic_reports(),
            "Router provisioned"
        );

        Ok(Self {
            bus,
            topics,
            router,
        })
    }

    fn gateway<L: Link>(&self, config: GatewayConfig, link: L) -> Result<Gateway<L>> {
        let mut gateway = Gateway::new(config, link, self.bus.clone());
        gateway
            .attach(self.router.clone())
            .context("Failed to attach gateway to router")?;
        Ok(gateway)
    }
}

/// Run the node until Ctrl-C or until every task has ended.
///
/// # Errors
///
/// Returns an error if any component fails to start.
pub async fn run(config: Config) -> Result<()> {
    let core = Core::build(&config)?;
    let (bus, topics, router) = (core.bus.clone(), core.topics.clone(), core.router.clone());

    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<Task> = JoinSet::new();
    let mut gateways: Vec<(&'static str, Arc<GatewayCounters>)> = Vec::new();

    if config.serial.enabled {
        let device = config.serial.device_path()?;
        let link = StreamLink::open_serial("serial", &device)
            .await
            .with_context(|| format!("Failed to open serial device {}", device.display()))?;
        let gateway = core.gateway(config.serial.gateway_config(), link)?;
        gateways.push(("serial", gateway.counters()));
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { ("serial", gateway.run(rx).await.map_err(Into::into)) });
    }

    if config.wireless.enabled {
        let udp = UdpConfig {
            bind_addr: config.wireless.bind_addr()?,
            peer_addr: config.wireless.peer_addr()?,
            peer_only: config.wireless.peer_only,
        };
        let link = UdpLink::bind("wireless", udp)
            .await
            .context("Failed to bind wireless link")?;
        let gateway = core.gateway(config.wireless.gateway_config(), link)?;
        gateways.push(("wireless", gateway.counters()));
        let rx = shutdown_rx.clone();
        tasks.spawn(async move { ("wireless", gateway.run(rx).await.map_err(Into::into)) });
    }

    if gateways.is_empty() {
        warn!("No gateway enabled, bridging local topics only");
    }

    let process = ProcessEndpoints {
        telemetry: Endpoint::new(UdpChannel::bind(config.ipc.telemetry_channel, &config.ipc).await?),
        command: Endpoint::new(UdpChannel::bind(config.ipc.command_channel, &config.ipc).await?),
        state: Endpoint::new(UdpChannel::bind(config.ipc.state_channel, &config.ipc).await?),
    };
    let bridge = Bridge::new(bus.clone(), topics.clone(), process)?;
    let tick = Duration::from_millis(config.bridge.tick_ms.max(1));
    let rx = shutdown_rx.clone();
    tasks.spawn(async move {
        bridge.run(tick, rx).await;
        ("bridge", Ok(()))
    });

    if config.launcher.enabled {
        let launcher = Launcher::new(&bus, &topics.self_command, config.launcher.clone())?;
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            launcher.run(tick, rx).await;
            ("launcher", Ok(()))
        });
    }

    if config.node.heartbeat_interval_ms > 0 {
        let period = Duration::from_millis(config.node.heartbeat_interval_ms);
        let (bus, topic, node_id) = (bus.clone(), topics.heartbeat_local.clone(), config.node.id);
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            emit_heartbeat(bus, topic, node_id, period, rx).await;
            ("heartbeat", Ok(()))
        });
    }

    if config.metrics.enabled {
        let period = Duration::from_millis(config.metrics.interval_ms.max(100));
        let (bus, router) = (bus.clone(), router.clone());
        let rx = shutdown_rx.clone();
        tasks.spawn(async move {
            export_stats(bus, router, gateways, period, rx).await;
            ("metrics", Ok(()))
        });
    }

    info!(node = %config.node.name, id = config.node.id, "Node running");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!("Shutdown requested");
                break;
            }
            joined = tasks.join_next() => match joined {
                Some(Ok((name, Ok(())))) => info!(task = name, "Task ended"),
                Some(Ok((name, Err(e)))) => error!(task = name, error = %e, "Task failed"),
                Some(Err(e)) => error!(error = %e, "Task panicked"),
                None => break,
            },
        }
    }

    // Receivers may all be gone already
    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        if let Ok((name, Err(e))) = joined {
            error!(task = name, error = %e, "Task failed during shutdown");
        }
    }

    info!(stats = ?router.stats(), "Node stopped");
    Ok(())
}

async fn emit_heartbeat(
    bus: Arc<Bus>,
    topic: Topic<Heartbeat>,
    node_id: u32,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut counter: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                counter = counter.wrapping_add(1);
                bus.publish(&topic, &Heartbeat { counter, node_id });
            }
        }
    }
}

async fn export_stats(
    bus: Arc<Bus>,
    router: Arc<ExclusionRouter>,
    gateways: Vec<(&'static str, Arc<GatewayCounters>)>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                metrics::export_router(&router.stats());
                metrics::export_bus(&bus.stats());
                for (name, counters) in &gateways {
                    metrics::export_gateway(name, counters);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicMap;
    use crate::ipc::{MemoryChannel, ProcessChannel};
    use datalink_protocol::{CommandKind, Envelope, EstimationCommand, Payload};
    use datalink_transport::MemoryLink;

    struct TestNode {
        core: Core,
        bridge: Bridge,
        flight_computer: MemoryLink,
        commands: MemoryChannel,
        _telemetry: MemoryChannel,
        _state: MemoryChannel,
    }

    /// A node built from the default configuration, its serial side on an
    /// in-memory flight computer and its wireless side on `wireless`.
    fn spawn_node(wireless: MemoryLink, shutdown: &watch::Receiver<bool>) -> TestNode {
        let config = Config::default();
        let core = Core::build(&config).unwrap();

        let (serial_link, flight_computer) = MemoryLink::pair("serial", "flight-computer");
        let serial = core.gateway(config.serial.gateway_config(), serial_link).unwrap();
        let wireless = core.gateway(config.wireless.gateway_config(), wireless).unwrap();
        tokio::spawn(serial.run(shutdown.clone()));
        tokio::spawn(wireless.run(shutdown.clone()));

        let (telemetry_end, telemetry) = MemoryChannel::pair(config.ipc.telemetry_channel);
        let (command_end, commands) = MemoryChannel::pair(config.ipc.command_channel);
        let (state_end, state) = MemoryChannel::pair(config.ipc.state_channel);
        let bridge = Bridge::new(
            core.bus.clone(),
            core.topics.clone(),
            ProcessEndpoints {
                telemetry: Endpoint::new(telemetry_end),
                command: Endpoint::new(command_end),
                state: Endpoint::new(state_end),
            },
        )
        .unwrap();

        TestNode {
            core,
            bridge,
            flight_computer,
            commands,
            _telemetry: telemetry,
            _state: state,
        }
    }

    fn spawn_pair(shutdown: &watch::Receiver<bool>) -> (TestNode, TestNode) {
        let (a_air, b_air) = MemoryLink::pair("wireless-a", "wireless-b");
        (spawn_node(a_air, shutdown), spawn_node(b_air, shutdown))
    }

    async fn run_ticks(a: &mut TestNode, b: &mut TestNode, ticks: usize) {
        for _ in 0..ticks {
            a.bridge.tick();
            b.bridge.tick();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn process_commands(node: &mut TestNode) -> Vec<EstimationCommand> {
        std::iter::from_fn(|| node.commands.try_recv_raw().unwrap())
            .map(|data| EstimationCommand::decode(&data).unwrap())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_command_runs_once_on_peer_only() {
        let (shutdown, rx) = watch::channel(false);
        let (mut a, mut b) = spawn_pair(&rx);

        // Long enough for both sides to exchange topic reports
        run_ticks(&mut a, &mut b, 150).await;

        let cmd = EstimationCommand::new(CommandKind::StartRecording, 42);
        let target_command = b.core.topics.target_command.id();
        b.flight_computer
            .send(&Envelope::new(target_command, cmd.to_bytes().to_vec()))
            .await
            .unwrap();
        run_ticks(&mut a, &mut b, 150).await;

        assert_eq!(process_commands(&mut a), vec![cmd]);
        assert!(process_commands(&mut b).is_empty());

        assert_eq!(b.bridge.stats().target_commands, 1);
        assert_eq!(b.bridge.stats().peer_commands, 0);
        assert_eq!(a.bridge.stats().peer_commands, 1);
        assert_eq!(a.bridge.stats().local_commands, 0);
        assert_eq!(a.bridge.stats().target_commands, 0);

        shutdown.send(true).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_crosses_once() {
        let (shutdown, rx) = watch::channel(false);
        let (mut a, mut b) = spawn_pair(&rx);
        run_ticks(&mut a, &mut b, 150).await;

        let seen_by_b = b.core.bus.subscribe(&b.core.topics.heartbeat_local).unwrap();
        let heartbeat = Heartbeat {
            counter: 1,
            node_id: 1,
        };
        a.core.bus.publish(&a.core.topics.heartbeat_local, &heartbeat);
        run_ticks(&mut a, &mut b, 150).await;

        assert_eq!(a.bridge.stats().heartbeats_out, 1);
        assert_eq!(a.bridge.stats().heartbeats_in, 0);
        assert_eq!(b.bridge.stats().heartbeats_in, 1);
        assert_eq!(b.bridge.stats().heartbeats_out, 0);
        assert_eq!(seen_by_b.try_take_if_new(), Some(heartbeat));
        assert_eq!(seen_by_b.try_take_if_new(), None);

        shutdown.send(true).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_counts_up() {
        let bus = Arc::new(Bus::new());
        let topics = Topics::register(&bus, &TopicMap::default()).unwrap();
        let watcher = bus.subscribe(&topics.heartbeat_local).unwrap();
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(emit_heartbeat(
            bus.clone(),
            topics.heartbeat_local.clone(),
            4,
            Duration::from_millis(100),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        let last = watcher.try_take_if_new().unwrap();
        assert_eq!(last.node_id, 4);
        assert_eq!(last.counter, 3);
    }
}
