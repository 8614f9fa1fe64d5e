//! Result classification for harvested frames.
//!
//! Multi-candidate devices repeat their best candidates across polls, report
//! noise when a core is mid-settle, and miscount under overclocking. The
//! classifier turns each raw result frame into at most two candidates worth
//! submitting, a hardware-error statistic for the clock controller, and a
//! search-exhaustion signal when the progress counter wraps.

use crate::work::{CandidateCheck, WorkItem};

use super::protocol::MultiResult;

/// Polls at the start of a cycle whose verification failures are ignored;
/// frames read while the job is still settling onto the device aren't
/// evidence of a clocking problem.
pub const SETTLE_POLLS: u32 = 2;

/// Rotating memory of the last two accepted candidates.
///
/// Devices re-report their best candidates on every poll, so a candidate
/// equal to either of the two most recent accepts is a repeat, not a find.
#[derive(Debug, Default)]
pub struct RecentCandidates {
    last: [u32; 2],
}

impl RecentCandidates {
    pub fn contains(&self, candidate: u32) -> bool {
        self.last.contains(&candidate)
    }

    pub fn record(&mut self, candidate: u32) {
        self.last[1] = self.last[0];
        self.last[0] = candidate;
    }
}

/// Progress counter with wraparound detection.
///
/// The counter is non-decreasing while the device still has search space
/// left; a decrease means the job is exhausted.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: u32,
}

/// What one observation of the progress counter means.
#[derive(Debug, PartialEq, Eq)]
pub enum ProgressStep {
    Advanced,
    Wrapped,
}

impl ProgressTracker {
    pub fn observe(&mut self, counter: u32) -> ProgressStep {
        if counter < self.last {
            ProgressStep::Wrapped
        } else {
            self.last = counter;
            ProgressStep::Advanced
        }
    }

    /// Highest position observed; 1:1 with hashes already traversed.
    pub fn total(&self) -> u32 {
        self.last
    }
}

/// Outcome of classifying one result frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Noise, a repeat, or a verification failure; nothing to do.
    Quiet,
    /// The device has walked its whole search space for this job.
    Exhausted,
    /// Candidates to forward, in slot order. Never more than two.
    Accepted(Vec<u32>),
}

/// Per-cycle classifier state for a multi-candidate device.
pub struct MultiClassifier<'a, C: CandidateCheck + ?Sized> {
    check: &'a C,
    recent: RecentCandidates,
    progress: ProgressTracker,
    polls: u32,
    hardware_errors: u32,
}

impl<'a, C: CandidateCheck + ?Sized> MultiClassifier<'a, C> {
    pub fn new(check: &'a C) -> Self {
        Self {
            check,
            recent: RecentCandidates::default(),
            progress: ProgressTracker::default(),
            polls: 0,
            hardware_errors: 0,
        }
    }

    /// Classify one decoded result frame against the work it answers.
    pub fn classify(&mut self, work: &WorkItem, frame: &MultiResult) -> FrameOutcome {
        self.polls += 1;

        // A zero counter, or one echoing the tag, is settle noise.
        if frame.progress == 0 || frame.progress == frame.tag {
            return FrameOutcome::Quiet;
        }

        // Tag mismatch means the device miscounted: a statistic, not a
        // fault, and not even that during the settle window.
        if self.check.expected_tag(work, frame.progress) != frame.tag {
            if self.polls > SETTLE_POLLS {
                self.hardware_errors += 1;
            }
            return FrameOutcome::Quiet;
        }

        if self.progress.observe(frame.progress) == ProgressStep::Wrapped {
            return FrameOutcome::Exhausted;
        }

        let mut accepted = Vec::new();
        for &candidate in &frame.best {
            if candidate == 0 || candidate == frame.tag {
                continue;
            }
            if self.recent.contains(candidate) {
                continue;
            }
            self.recent.record(candidate);
            accepted.push(candidate);
        }
        FrameOutcome::Accepted(accepted)
    }

    /// Hardware mismatches counted this cycle (settle window excluded).
    pub fn hardware_errors(&self) -> u32 {
        self.hardware_errors
    }

    /// Hash-count estimate for the cycle: the last good counter value.
    pub fn hashes(&self) -> u64 {
        self.progress.total() as u64
    }
}
