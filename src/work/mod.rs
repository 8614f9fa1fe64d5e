//! Work items and the collaborator contracts around the scan core.
//!
//! The scan core neither creates work nor judges it: work items arrive from a
//! [`JobSource`], accepted candidates leave through a [`SubmitSink`], and the
//! proof-of-work arithmetic needed to sanity-check a candidate lives behind
//! [`CandidateCheck`]. The daemon wires real implementations in; tests wire
//! mocks. [`dummy`] provides a loopback implementation for bring-up.

pub mod dummy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::UnitId;

/// Size of a work payload. The scan core only ever touches fixed offsets
/// within it; the rest is opaque to us and owned by the job source.
pub const PAYLOAD_LEN: usize = 160;

/// Offset and length of the tail segment sent to single-candidate devices.
pub const TAIL_OFFSET: usize = 128;
pub const TAIL_LEN: usize = 12;

/// Extra-nonce region. Extra nonces are unsupported by the attached devices,
/// so this region is cleared before a job is framed.
pub const EXTRA_NONCE_OFFSET: usize = 144;
pub const EXTRA_NONCE_LEN: usize = 12;

/// One hash job, owned by the job source, borrowed by the scan core for the
/// duration of one cycle and released back when the cycle completes.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Source-assigned identifier, carried through logs and submissions.
    pub id: u64,
    /// Midstate-equivalent value for the job.
    pub midstate: [u8; 32],
    /// Opaque payload; the codec reads header words at fixed offsets.
    pub payload: [u8; PAYLOAD_LEN],
}

impl WorkItem {
    /// Clear the extra-nonce region ahead of framing.
    pub fn clear_extra_nonce(&mut self) {
        self.payload[EXTRA_NONCE_OFFSET..EXTRA_NONCE_OFFSET + EXTRA_NONCE_LEN].fill(0);
    }
}

/// Supplies work items, one per scan cycle.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Fetch the next work item for `unit`. May wait for work to arrive.
    async fn get_work(&self, unit: UnitId) -> WorkItem;

    /// Return a work item once its cycle is over, found or not.
    fn release_work(&self, item: WorkItem);
}

/// Receives accepted candidates. Fire and forget: validation against the
/// live chain happens upstream, not here.
#[async_trait]
pub trait SubmitSink: Send + Sync {
    async fn submit_candidate(&self, unit: UnitId, work: &WorkItem, candidate: u32);
}

/// Device-health collaborator.
///
/// Owns the per-unit hardware-error counter (the submission path upstream
/// increments it when a candidate turns out bogus), which the scan loop
/// samples to decide whether a cycle's rate estimate is trustworthy.
pub trait HealthReporter: Send + Sync {
    /// Record a transport framing failure on `unit`.
    fn report_comms_error(&self, unit: UnitId);

    /// Current hardware-error count for `unit`.
    fn hardware_errors(&self, unit: UnitId) -> u64;
}

/// Recomputes the checksum tag a healthy device would report for a candidate.
///
/// This is the only place the proof-of-work arithmetic touches the core, and
/// it is deliberately external: the core compares tags, it does not hash.
pub trait CandidateCheck: Send + Sync {
    fn expected_tag(&self, work: &WorkItem, candidate: u32) -> u32;
}

/// The full set of collaborators a unit worker runs against.
#[derive(Clone)]
pub struct Rig {
    pub source: Arc<dyn JobSource>,
    pub sink: Arc<dyn SubmitSink>,
    pub health: Arc<dyn HealthReporter>,
    pub check: Arc<dyn CandidateCheck>,
}

/// Externally settable restart flag, polled by the scan loop once per poll
/// iteration.
///
/// Raised by the work-distribution side when fresh work supersedes whatever a
/// device is currently scanning; observed within one poll interval.
#[derive(Clone, Default)]
pub struct RestartSignal(Arc<AtomicBool>);

impl RestartSignal {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_signal_latches_until_cleared() {
        let signal = RestartSignal::default();
        assert!(!signal.is_raised());

        let peer = signal.clone();
        peer.raise();
        assert!(signal.is_raised());
        assert!(signal.is_raised());

        signal.clear();
        assert!(!peer.is_raised());
    }

    #[test]
    fn clear_extra_nonce_only_touches_its_region() {
        let mut work = WorkItem {
            id: 1,
            midstate: [0xab; 32],
            payload: [0x5c; PAYLOAD_LEN],
        };
        work.clear_extra_nonce();

        assert!(work.payload[..EXTRA_NONCE_OFFSET].iter().all(|&b| b == 0x5c));
        assert!(work.payload[EXTRA_NONCE_OFFSET..EXTRA_NONCE_OFFSET + EXTRA_NONCE_LEN]
            .iter()
            .all(|&b| b == 0));
        assert!(work.payload[EXTRA_NONCE_OFFSET + EXTRA_NONCE_LEN..]
            .iter()
            .all(|&b| b == 0x5c));
    }
}
