//! Loopback collaborators for bring-up and bench testing.
//!
//! `DummySource` plays every role around the scan core: it generates
//! deterministic work items, logs submitted candidates, and keeps the health
//! counters. The checksum tag it computes is a cheap FNV-style mix, not the
//! real proof-of-work arithmetic; it exists so a bench device (or a shorted
//! TX/RX pair) exercises the full scan path without a pool attached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    CandidateCheck, HealthReporter, JobSource, SubmitSink, WorkItem, PAYLOAD_LEN,
};
use crate::tracing::prelude::*;
use crate::types::UnitId;

/// Pause between generated work items, so an idle bench rig doesn't spin.
const WORK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
pub struct DummySource {
    next_id: AtomicU64,
    comms_errors: AtomicU64,
    hardware_errors: AtomicU64,
    submitted: AtomicU64,
}

impl DummySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl JobSource for DummySource {
    async fn get_work(&self, unit: UnitId) -> WorkItem {
        tokio::time::sleep(WORK_INTERVAL).await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut midstate = [0u8; 32];
        for (i, b) in midstate.iter_mut().enumerate() {
            *b = (id as u8).wrapping_add(i as u8);
        }
        let mut payload = [0u8; PAYLOAD_LEN];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (id as u8) ^ (i as u8);
        }

        trace!(unit = %unit, work_id = id, "generated work");
        WorkItem {
            id,
            midstate,
            payload,
        }
    }

    fn release_work(&self, item: WorkItem) {
        trace!(work_id = item.id, "work released");
    }
}

#[async_trait]
impl SubmitSink for DummySource {
    async fn submit_candidate(&self, unit: UnitId, work: &WorkItem, candidate: u32) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        info!(
            unit = %unit,
            work_id = work.id,
            candidate = format!("{candidate:08x}"),
            "candidate submitted"
        );
    }
}

impl HealthReporter for DummySource {
    fn report_comms_error(&self, unit: UnitId) {
        let total = self.comms_errors.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(unit = %unit, total, "device communication error");
    }

    fn hardware_errors(&self, _unit: UnitId) -> u64 {
        self.hardware_errors.load(Ordering::Relaxed)
    }
}

impl CandidateCheck for DummySource {
    fn expected_tag(&self, work: &WorkItem, candidate: u32) -> u32 {
        // FNV-1a over the midstate and candidate. Stand-in for the real
        // verifier; a loopback device computes the same mix.
        let mut tag = 0x811c_9dc5u32;
        for &b in work.midstate.iter().chain(candidate.to_le_bytes().iter()) {
            tag ^= b as u32;
            tag = tag.wrapping_mul(0x0100_0193);
        }
        tag
    }
}
