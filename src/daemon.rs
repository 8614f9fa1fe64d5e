//! Daemon lifecycle management for fpga-miner.
//!
//! Reads the configuration, spawns one worker task per logical compute unit,
//! and handles signals and graceful shutdown. Shutdown cancels the shared
//! token and then waits for every worker: a worker mid-cycle observes the
//! token at its next poll boundary, finishes the cycle (releasing the bus and
//! its work item), and only then exits, so no transport is torn down with a
//! conversation in flight.

use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::Config;
use crate::fpga::worker;
use crate::tracing::prelude::*;
use crate::transport::bus::SharedBus;
use crate::types::UnitId;
use crate::work::{dummy::DummySource, RestartSignal, Rig};

/// The main daemon.
pub struct Daemon {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        // An invalid configuration (bad clock range, malformed device list)
        // aborts startup before any device is opened.
        let config = Config::from_env()?;

        // Loopback collaborators stand in for the job-distribution frontend:
        // they generate deterministic work and log submissions, which is
        // enough to drive real hardware on a bench.
        let dummy = Arc::new(DummySource::new());
        let rig = Rig {
            source: dummy.clone(),
            sink: dummy.clone(),
            health: dummy.clone(),
            check: dummy,
        };

        let mut next_unit = 0;
        for device in &config.devices {
            for bus in SharedBus::for_units(device.slots) {
                let unit = UnitId(next_unit);
                next_unit += 1;
                self.tracker.spawn(worker::unit_task(
                    unit,
                    device.clone(),
                    config.scan_timeout,
                    bus,
                    rig.clone(),
                    RestartSignal::default(),
                    self.shutdown.clone(),
                ));
            }
        }
        self.tracker.close();

        info!(units = next_unit, "Started.");
        info!("For debugging, set RUST_LOG=fpga_miner=debug or trace.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        // Wait for shutdown signal
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
        }

        // Initiate shutdown and wait for every worker to finish its cycle.
        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}
