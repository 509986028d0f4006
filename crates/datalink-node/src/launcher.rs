//! Estimation process launcher.
//!
//! Watches the self-command topic and starts the estimation program on a
//! startup command. While the program runs, the launcher's own command
//! subscription stays disabled, so commands published in the meantime do not
//! queue up a second launch.

use datalink_core::{Bus, BusError, Subscriber, Topic};
use datalink_protocol::{CommandKind, EstimationCommand};
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::LauncherConfig;
use crate::metrics;

/// Outcome of waiting for the estimation program.
#[derive(Debug)]
pub enum Launch {
    /// The program exited.
    Exited(ExitStatus),
    /// Shutdown was requested while it ran; it was killed.
    Interrupted,
}

/// The launcher task.
pub struct Launcher {
    config: LauncherConfig,
    commands: Subscriber<EstimationCommand>,
}

impl Launcher {
    /// Create a launcher subscribed to `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is not registered.
    pub fn new(
        bus: &Arc<Bus>,
        topic: &Topic<EstimationCommand>,
        config: LauncherConfig,
    ) -> Result<Self, BusError> {
        Ok(Self {
            config,
            commands: bus.subscribe(topic)?,
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.config.program);
        command.args(&self.config.args).kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(shellexpand::tilde(dir).as_ref());
        }
        command
    }

    /// Run the program and wait for it, with the command subscription
    /// suppressed until it exits.
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be started or waited on.
    pub async fn launch(&self, shutdown: &mut watch::Receiver<bool>) -> io::Result<Launch> {
        let _suppressed = self.commands.subscription().suppress();

        let mut child = self.command().spawn()?;
        metrics::record_launch();
        info!(program = %self.config.program, pid = child.id(), "Estimation process started");

        tokio::select! {
            status = child.wait() => Ok(Launch::Exited(status?)),
            _ = shutdown.changed() => {
                warn!(program = %self.config.program, "Stopping estimation process");
                child.kill().await?;
                Ok(Launch::Interrupted)
            }
        }
    }

    /// Serve startup commands until shutdown.
    pub async fn run(self, poll: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(program = %self.config.program, "Launcher waiting for startup command");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let Some(command) = self.commands.try_take_if_new() else {
                continue;
            };
            if command.kind != CommandKind::Startup {
                debug!(kind = ?command.kind, "Launcher ignoring command");
                continue;
            }

            match self.launch(&mut shutdown).await {
                Ok(Launch::Exited(status)) if status.success() => {
                    info!("Estimation process exited");
                }
                Ok(Launch::Exited(status)) => {
                    warn!(%status, "Estimation process failed");
                }
                Ok(Launch::Interrupted) => break,
                Err(e) => {
                    error!(program = %self.config.program, error = %e, "Failed to launch estimation process");
                }
            }
        }

        info!("Launcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(program: &str, args: &[&str]) -> (Arc<Bus>, Topic<EstimationCommand>, Launcher) {
        let bus = Arc::new(Bus::new());
        let topic = bus
            .register::<EstimationCommand>(1101, "self.command")
            .unwrap();
        let config = LauncherConfig {
            enabled: true,
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
        };
        let launcher = Launcher::new(&bus, &topic, config).unwrap();
        (bus, topic, launcher)
    }

    #[tokio::test]
    async fn test_subscription_suppressed_while_running() {
        let (bus, topic, launcher) = setup("sleep", &["0.3"]);
        let (_tx, mut rx) = watch::channel(false);

        let observe = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(!launcher.commands.subscription().is_enabled());
            bus.publish(&topic, &EstimationCommand::new(CommandKind::Startup, 0))
        };

        let (launched, delivered) = tokio::join!(launcher.launch(&mut rx), observe);

        assert!(matches!(launched.unwrap(), Launch::Exited(status) if status.success()));
        assert_eq!(delivered, 0);
        assert!(launcher.commands.subscription().is_enabled());
        assert!(launcher.commands.try_take_if_new().is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_restores_subscription() {
        let (_bus, _topic, launcher) = setup("/nonexistent/estimator", &[]);
        let (_tx, mut rx) = watch::channel(false);

        assert!(launcher.launch(&mut rx).await.is_err());
        assert!(launcher.commands.subscription().is_enabled());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_process() {
        let (_bus, _topic, launcher) = setup("sleep", &["30"]);
        let (tx, mut rx) = watch::channel(false);

        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };

        let (launched, ()) = tokio::join!(launcher.launch(&mut rx), stop);
        assert!(matches!(launched.unwrap(), Launch::Interrupted));
    }

    #[tokio::test]
    async fn test_run_survives_spawn_failure() {
        let (bus, topic, launcher) = setup("/nonexistent/estimator", &[]);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(launcher.run(Duration::from_millis(5), rx));

        bus.publish(&topic, &EstimationCommand::new(CommandKind::StopRecording, 0));
        bus.publish(&topic, &EstimationCommand::new(CommandKind::Startup, 0));
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
