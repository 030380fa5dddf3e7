mod config;
mod link;
mod robot;
mod transport;

use anyhow::Result;
use config::RobotConfig;
use ddd_shared::{queue, timing, DispatchGate, MonotonicClock, Orientation, SyncStateMachine};
use link::{LinkEvent, LinkServer};
use robot::{ControlLoop, SimulatedDock};
use transport::TcpTransportListener;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = RobotConfig::from_env()?;
    let orientation = Orientation::for_robot(config.robot_id);

    info!("Robot {} starting", config.robot_id);
    info!("  Listen: {}", config.listen_addr);
    info!("  Orientation: {:?}", orientation);
    info!("  Tick: {:?}", config.tick_interval);

    let clock = MonotonicClock::start();
    let (producer, consumer) = queue::channel::<{ timing::QUEUE_CAPACITY }>();

    // Wireless event context owns the producer end
    let sync = SyncStateMachine::new(clock, producer, config.prepare_timeout_ms());
    let listener = TcpTransportListener::bind(&config.listen_addr).await?;
    let (link, mut link_events) = LinkServer::new(listener, sync);
    let link_status = link.status();
    tokio::spawn(link.run());

    // Control loop owns the consumer end
    let gate = DispatchGate::new(consumer, orientation).with_drive_speed(config.drive_speed);
    let control = ControlLoop::new(
        gate,
        clock,
        SimulatedDock::after_ticks(config.dock_after_ticks),
    );
    let mut robot_state = control.subscribe();
    tokio::spawn(control.run(config.tick_interval));
    info!("Control loop started");

    // Main event loop
    loop {
        tokio::select! {
            event = link_events.recv() => match event {
                Some(LinkEvent::Connected { peer }) => {
                    info!("Leader connected: {}", peer);
                }
                Some(LinkEvent::Disconnected { peer, reason }) => {
                    warn!("Leader {} disconnected: {}", peer, reason);
                }
                Some(LinkEvent::AcceptFailed { reason }) => {
                    error!("Accept failed: {}", reason);
                }
                None => {
                    error!("Link task ended");
                    break;
                }
            },

            changed = robot_state.changed() => {
                if changed.is_err() {
                    error!("Control loop ended");
                    break;
                }
                let state = *robot_state.borrow_and_update();
                info!(
                    "State: mode={:?} led={} speed=({}, {}) link={}",
                    state.mode,
                    state.led_on,
                    state.left_speed,
                    state.right_speed,
                    if link_status.is_connected() { "up" } else { "down" },
                );
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
