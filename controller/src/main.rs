mod command;
mod config;
mod session;

use anyhow::{bail, Result};
use command::{RoundOutcome, SyncCoordinator};
use config::ControllerConfig;
use ddd_shared::{Action, MonotonicClock};
use session::SessionManager;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ControllerConfig::from_env()?;
    info!("Leader starting");
    for (id, addr) in config.peripherals.iter().enumerate() {
        info!("  Robot {}: {}", id, addr);
    }
    info!("  Prepare delay: {} ms, rounds: {}", config.prepare_delay_ms, config.rounds);

    let mut sessions = SessionManager::new(&config.peripherals, config.response_timeout);
    if !sessions.ensure_connected().await {
        bail!("could not reach every robot");
    }

    let mut leader = SyncCoordinator::new(
        sessions,
        MonotonicClock::start(),
        config.prepare_delay_ms,
        initial_sequence(),
    );

    leader.send_direct(Action::Go).await;
    info!("Waiting {:?} for the robots to dock", config.settle_time);
    sleep(config.settle_time).await;

    let mut committed = 0;
    for round in 0..config.rounds {
        if !leader.sessions_mut().ensure_connected().await {
            warn!("Round {} runs with a robot missing and will abort", round);
        }

        let action = if round % 2 == 0 {
            Action::DriveForward
        } else {
            Action::DriveBackward
        };

        match leader.run_round(action).await {
            RoundOutcome::Committed { sequence, target_ms, .. } => {
                committed += 1;
                info!("Round {}: seq={} {} at t={}", round, sequence, action, target_ms);
            }
            RoundOutcome::Aborted { sequence, reason } => {
                warn!("Round {}: seq={} aborted: {}", round, sequence, reason);
            }
            RoundOutcome::Diverged { sequence, failed } => {
                error!(
                    "Round {}: seq={} committed on some robots only, failed: {:?}",
                    round, sequence, failed
                );
            }
        }

        sleep(config.round_interval).await;
    }

    leader.send_direct(Action::DriveZero).await;
    info!("{}/{} rounds committed", committed, config.rounds);

    for session in leader.sessions().sessions() {
        let rtts = session.recorded_rtts();
        let mean = if rtts.is_empty() {
            0.0
        } else {
            rtts.iter().map(|&rtt| f64::from(rtt)).sum::<f64>() / rtts.len() as f64
        };
        info!(
            "Robot {} RTTs: {:?} (mean {:.1} ms)",
            session.id, rtts, mean
        );
    }

    leader.sessions_mut().disconnect_all().await;
    Ok(())
}

/// Start from an arbitrary sequence so a restarted leader does not collide
/// with a prepare a robot still holds
fn initial_sequence() -> u8 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u8)
        .unwrap_or(0)
}
