//! Per-unit worker task.
//!
//! One independent sequential worker per logical compute unit: open the
//! transport when needed, pull a work item, run the Idle→Done cycle, repeat.
//! The only thing workers share is the bus of a multi-slot device; shutdown
//! is cooperative, observed at poll boundaries, so a worker never abandons a
//! cycle while it holds the bus.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ClockRange, DeviceConfig};
use crate::tracing::prelude::*;
use crate::transport::{bus::SharedBus, serial::SerialLink};
use crate::types::{HashRate, UnitId};
use crate::work::{RestartSignal, Rig};

use super::freq::FrequencyController;
use super::protocol;
use super::scan::{self, ScanContext, ScanFailure};
use super::session::DeviceSession;
use super::DeviceClass;

/// Pause before re-attempting a failed transport open.
const REOPEN_DELAY: Duration = Duration::from_secs(5);

/// How often a unit logs its accounting summary.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Run one logical unit until shutdown (or a fatal device failure).
pub async fn unit_task(
    unit: UnitId,
    device: DeviceConfig,
    scan_timeout: Duration,
    bus: SharedBus,
    rig: Rig,
    restart: RestartSignal,
    shutdown: CancellationToken,
) {
    let mut session = DeviceSession::new(unit, scan_timeout);
    let mut freq = match device.class {
        DeviceClass::Multi => {
            let clock = device.clock.unwrap_or(ClockRange::DEFAULT);
            Some(FrequencyController::new(clock.default_step, clock.max_step))
        }
        DeviceClass::Single => None,
    };
    let mut stats = UnitStats::new();

    info!(
        unit = %unit,
        path = %device.path,
        class = %device.class,
        slot = bus.slot(),
        "unit worker started"
    );

    while !shutdown.is_cancelled() {
        if !session.is_open() {
            match SerialLink::open(&device.path).await {
                Ok(link) => {
                    info!(unit = %unit, path = %device.path, "transport open");
                    session.open_with(link);
                    if let Some(freq) = freq.as_ref() {
                        program_default_clock(&mut session, &bus, freq).await;
                    }
                }
                Err(e) => {
                    warn!(unit = %unit, error = %e, "transport open failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(REOPEN_DELAY) => continue,
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        let work = tokio::select! {
            work = rig.source.get_work(unit) => work,
            _ = shutdown.cancelled() => break,
        };
        restart.clear();

        let ctx = ScanContext {
            unit,
            source: rig.source.as_ref(),
            sink: rig.sink.as_ref(),
            health: rig.health.as_ref(),
            restart: &restart,
            shutdown: &shutdown,
        };

        match freq.as_mut() {
            Some(freq) => {
                match scan::run_multi_cycle(
                    &ctx,
                    &mut session,
                    &bus,
                    freq,
                    rig.check.as_ref(),
                    work,
                )
                .await
                {
                    Ok(report) => stats.record(report.hashes),
                    Err(ScanFailure::Overheat { drop_pct }) => {
                        error!(
                            unit = %unit,
                            drop_pct = format!("{drop_pct:.1}"),
                            "unit disabled after overheat"
                        );
                        break;
                    }
                }
            }
            None => {
                let report = scan::run_single_cycle(&ctx, &mut session, &bus, work).await;
                stats.record(report.hashes);
            }
        }

        stats.maybe_log(unit);
    }

    session.close();
    info!(unit = %unit, "unit worker stopped");
}

// Push the controller's starting step to a freshly opened device so the
// statistics and the hardware agree on the clock.
async fn program_default_clock(
    session: &mut DeviceSession<SerialLink>,
    bus: &SharedBus,
    freq: &FrequencyController,
) {
    let _bus = bus.acquire().await;
    if let Some(link) = session.link_mut() {
        match scan::send_frame(link, &protocol::encode_set_clock(freq.step())).await {
            Ok(()) => debug!(
                unit = %session.unit,
                step = freq.step(),
                mhz = freq.current_mhz(),
                "default clock step programmed"
            ),
            Err(e) => warn!(
                unit = %session.unit,
                error = %e,
                "failed to program default clock step"
            ),
        }
    }
}

/// Per-unit accounting, logged periodically.
struct UnitStats {
    started: Instant,
    last_log: Instant,
    total_hashes: u128,
    cycles: u64,
}

impl UnitStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_log: now,
            total_hashes: 0,
            cycles: 0,
        }
    }

    fn record(&mut self, hashes: u64) {
        self.total_hashes += hashes as u128;
        self.cycles += 1;
    }

    fn maybe_log(&mut self, unit: UnitId) {
        if self.last_log.elapsed() < STATUS_INTERVAL {
            return;
        }
        self.last_log = Instant::now();

        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            HashRate((self.total_hashes as f64 / elapsed) as u64)
        } else {
            HashRate(0)
        };
        info!(
            unit = %unit,
            uptime_s = elapsed as u64,
            rate = %rate.to_human_readable(),
            cycles = self.cycles,
            "unit status"
        );
    }
}
