//! NearLink agent demo entry point.
//!
//! Runs two simulated devices over an in-process loopback radio so the whole
//! discovery, arbitration and handshake flow can be watched end to end.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()                 -- TOML file + CLI overrides
//!  └─ LoopbackRadio
//!       ├─ device A: HandshakeService(LoopbackLink, SimulatedRanging)
//!       └─ device B: HandshakeService(LoopbackLink, SimulatedRanging)
//!  └─ event pump                    -- logs events until Ctrl-C or N updates
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use nearlink_agent::application::handshake_service::{
    AgentError, AgentEvent, HandshakeConfig, HandshakeService,
};
use nearlink_agent::application::ranging::RangingUpdate;
use nearlink_agent::infrastructure::loopback::LoopbackRadio;
use nearlink_agent::infrastructure::simulated_ranging::SimulatedRanging;
use nearlink_agent::infrastructure::storage::config::{self, AgentConfig};
use nearlink_core::{DeviceBeaconId, RolePreference};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(
    name = "nearlink-agent",
    about = "Runs two simulated NearLink devices through discovery and session handshake",
    version
)]
struct Cli {
    /// Config file.  Defaults to the platform config location.
    #[arg(long, env = "NEARLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Role preference for the first device: auto, controller or controlee.
    #[arg(long, value_parser = parse_role)]
    role: Option<RolePreference>,

    /// Log filter used when `RUST_LOG` is unset.  Overrides the config file.
    #[arg(long, env = "NEARLINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Ranging updates to print before exiting.  0 runs until Ctrl-C.
    #[arg(long, default_value_t = 10)]
    updates: u64,
}

fn parse_role(value: &str) -> Result<RolePreference, String> {
    match value.to_ascii_lowercase().as_str() {
        "auto" => Ok(RolePreference::Auto),
        "controller" => Ok(RolePreference::Controller),
        "controlee" => Ok(RolePreference::Controlee),
        other => Err(format!(
            "unknown role '{other}' (expected auto, controller or controlee)"
        )),
    }
}

struct Device {
    name: String,
    service: HandshakeService,
    events: mpsc::Receiver<AgentEvent>,
    task: JoinHandle<Result<(), AgentError>>,
}

fn start_device(
    radio: &LoopbackRadio,
    name: String,
    handshake: HandshakeConfig,
    update_interval: Duration,
) -> anyhow::Result<Device> {
    let transport = Arc::new(radio.attach(name.as_str()));
    let ranging = Arc::new(SimulatedRanging::random(update_interval)?);
    let (service, events) = HandshakeService::new(handshake, transport, ranging);

    let runner = service.clone();
    let task = tokio::spawn(async move { runner.run().await });
    info!(device = %name, beacon = %service.beacon_id(), "device started");

    Ok(Device {
        name,
        service,
        events,
        task,
    })
}

/// Logs `event` and returns `true` if it was a ranging measurement.
fn log_event(device: &str, event: &AgentEvent) -> bool {
    match event {
        AgentEvent::RoleAssigned { peer, role } => {
            info!(%device, %peer, %role, "role assigned");
        }
        AgentEvent::SessionStarted {
            peer,
            role,
            session_id,
        } => {
            info!(%device, %peer, %role, session_id, "session started");
        }
        AgentEvent::Ranging {
            peer,
            update:
                RangingUpdate::Position {
                    distance_m,
                    azimuth_deg,
                    ..
                },
        } => {
            info!(%device, %peer, distance_m, azimuth_deg, "ranging");
            return true;
        }
        AgentEvent::Ranging { peer, update } => {
            info!(%device, %peer, ?update, "ranging");
        }
        AgentEvent::Terminated { peer, reason } => {
            info!(%device, %peer, %reason, "handshake terminated");
        }
    }
    false
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config: AgentConfig = match &cli.config {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };

    // `RUST_LOG` wins over --log-level, which wins over the config file.
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.agent.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    info!("NearLink agent demo starting");

    let mut config_a = config.handshake_config();
    if let Some(role) = cli.role {
        config_a.role_preference = role;
    }
    let mut config_b = config.handshake_config();
    config_b.role_preference = RolePreference::Auto;
    if config_b.beacon_id == config_a.beacon_id {
        config_b.beacon_id = DeviceBeaconId(config_a.beacon_id.0.wrapping_add(1));
    }

    let interval = Duration::from_millis(config.demo.ranging_update_interval_ms);
    let radio = LoopbackRadio::new();
    let name_a = config.agent.device_name.clone();
    let name_b = format!("{name_a}-peer");
    let mut device_a = start_device(&radio, name_a, config_a, interval)?;
    let mut device_b = start_device(&radio, name_b, config_b, interval)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut measurements = 0u64;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown signal received");
                break;
            }
            Some(event) = device_a.events.recv() => {
                if log_event(&device_a.name, &event) {
                    measurements += 1;
                }
            }
            Some(event) = device_b.events.recv() => {
                if log_event(&device_b.name, &event) {
                    measurements += 1;
                }
            }
            else => break,
        }
        if cli.updates > 0 && measurements >= cli.updates {
            info!(measurements, "update limit reached");
            break;
        }
    }

    for mut device in [device_a, device_b] {
        device.service.shutdown().await;
        while let Ok(event) = device.events.try_recv() {
            log_event(&device.name, &event);
        }
        device.task.await??;
    }

    info!("NearLink agent demo stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        // Arrange / Act
        let cli = Cli::parse_from(["nearlink-agent"]);

        // Assert
        assert_eq!(cli.updates, 10);
        assert_eq!(cli.role, None);
    }

    #[test]
    fn test_cli_role_override() {
        let cli = Cli::parse_from(["nearlink-agent", "--role", "controlee"]);
        assert_eq!(cli.role, Some(RolePreference::Controlee));
    }

    #[test]
    fn test_cli_role_is_case_insensitive() {
        let cli = Cli::parse_from(["nearlink-agent", "--role", "Controller"]);
        assert_eq!(cli.role, Some(RolePreference::Controller));
    }

    #[test]
    fn test_cli_rejects_unknown_role() {
        let result = Cli::try_parse_from(["nearlink-agent", "--role", "leader"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_updates_override() {
        let cli = Cli::parse_from(["nearlink-agent", "--updates", "0"]);
        assert_eq!(cli.updates, 0);
    }

    #[test]
    fn test_log_event_counts_only_positions() {
        let position = AgentEvent::Ranging {
            peer: "b".into(),
            update: RangingUpdate::Position {
                distance_m: 1.0,
                azimuth_deg: 0.0,
                elevation_deg: None,
            },
        };
        let lost = AgentEvent::Ranging {
            peer: "b".into(),
            update: RangingUpdate::PeerDisconnected,
        };

        assert!(log_event("a", &position));
        assert!(!log_event("a", &lost));
    }
}
