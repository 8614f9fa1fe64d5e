//! The scan loop: one full job cycle against a device.
//!
//! A cycle walks an explicit state machine:
//!
//! ```text
//! Idle -> Sent -> Polling -> (Draining | Overflow | Cancelled | TransportError) -> Done
//! ```
//!
//! Idle→Sent frames and transmits the job; Polling reads result frames under
//! a short bounded wait, hands each to the classifier, and submits accepted
//! candidates immediately. The cycle ends when the soft timeout drains, the
//! device exhausts its search space (multi-candidate only), a restart or
//! shutdown is observed, or the transport misbehaves. Whatever the path, the
//! work item is released exactly once and the cycle reports its hash-count
//! estimate.
//!
//! Two variants: single-candidate devices estimate hashes from elapsed time
//! against a rolling seconds-per-hash figure; multi-candidate devices report
//! their own progress counter and additionally feed the frequency controller
//! at cycle end.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::tracing::prelude::*;
use crate::transport::{bus::SharedBus, Transport, TransportError};
use crate::types::{HashRate, UnitId};
use crate::work::{CandidateCheck, HealthReporter, JobSource, SubmitSink, WorkItem};

use super::classify::{FrameOutcome, MultiClassifier};
use super::freq::FrequencyController;
use super::protocol;
use super::session::DeviceSession;

/// Bounded wait for one result read.
pub const RESULT_READ_WAIT: Duration = Duration::from_millis(100);

/// Multi-candidate devices are paced: this slice, repeated
/// [`POLL_SLICES`] times, separates one result poll from the next while
/// keeping restart latency at one slice.
pub const POLL_SLICE: Duration = Duration::from_millis(10);
pub const POLL_SLICES: u32 = 25;

/// Pause before retrying a failed multi-candidate transmit or read.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Terminal state of one scan cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    /// Soft timeout elapsed with the device still searching.
    Drained,
    /// The device exhausted its search space (progress counter wrapped).
    Overflow,
    /// A restart or shutdown was observed mid-poll.
    Cancelled,
    /// The transport failed; the session was closed and reported.
    TransportError,
}

/// What one cycle produced.
#[derive(Debug)]
pub struct CycleReport {
    pub end: CycleEnd,
    /// Hash-count estimate for the cycle; zero on transport errors.
    pub hashes: u64,
}

/// Fatal per-device failures: the unit should be disabled, not retried.
#[derive(Debug, Error)]
pub enum ScanFailure {
    #[error("device clock collapsed by {drop_pct:.1}%; overheat suspected")]
    Overheat { drop_pct: f64 },
}

/// The collaborators and signals one cycle runs against.
pub struct ScanContext<'a> {
    pub unit: UnitId,
    pub source: &'a dyn JobSource,
    pub sink: &'a dyn SubmitSink,
    pub health: &'a dyn HealthReporter,
    pub restart: &'a crate::work::RestartSignal,
    pub shutdown: &'a CancellationToken,
}

impl ScanContext<'_> {
    fn interrupted(&self) -> bool {
        self.restart.is_raised() || self.shutdown.is_cancelled()
    }
}

/// Run one cycle against a single-candidate device.
pub async fn run_single_cycle<L: Transport>(
    ctx: &ScanContext<'_>,
    session: &mut DeviceSession<L>,
    bus: &SharedBus,
    mut work: WorkItem,
) -> CycleReport {
    work.clear_extra_nonce();
    let (end, hashes) = single_cycle_inner(ctx, session, bus, &work).await;
    ctx.source.release_work(work);
    debug!(unit = %ctx.unit, outcome = ?end, hashes, "cycle complete");
    CycleReport { end, hashes }
}

async fn single_cycle_inner<L: Transport>(
    ctx: &ScanContext<'_>,
    session: &mut DeviceSession<L>,
    bus: &SharedBus,
    work: &WorkItem,
) -> (CycleEnd, u64) {
    // Idle -> Sent
    let frame = protocol::encode_single_job(work);
    let sent = {
        let _bus = bus.acquire().await;
        match session.link_mut() {
            None => Err(TransportError::Closed),
            Some(link) => send_frame(link, &frame).await,
        }
    };
    if let Err(e) = sent {
        error!(unit = %ctx.unit, error = %e, frame = frame.len(), "job transmit failed");
        session.close();
        ctx.health.report_comms_error(ctx.unit);
        return (CycleEnd::TransportError, 0);
    }

    // Sent -> Polling
    let started = Instant::now();
    let errors_at_start = ctx.health.hardware_errors(ctx.unit);
    trace!(unit = %ctx.unit, "scanning for nonces");

    let end = loop {
        if ctx.interrupted() {
            debug!(unit = %ctx.unit, "restart requested, ending scan");
            break CycleEnd::Cancelled;
        }

        let mut buf = [0u8; protocol::SINGLE_RESULT_LEN];
        let read = {
            let _bus = bus.acquire().await;
            match session.link_mut() {
                None => Err(TransportError::Closed),
                Some(link) => link.read(&mut buf, RESULT_READ_WAIT).await,
            }
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                error!(unit = %ctx.unit, error = %e, "result read failed");
                session.close();
                ctx.health.report_comms_error(ctx.unit);
                break CycleEnd::TransportError;
            }
        };

        if n == 0 {
            if started.elapsed() > session.timeout {
                debug!(
                    unit = %ctx.unit,
                    elapsed_s = started.elapsed().as_secs(),
                    "scan window drained"
                );
                break CycleEnd::Drained;
            }
            continue;
        }
        if n < buf.len() {
            error!(unit = %ctx.unit, read = n, want = buf.len(), "short result frame");
            session.close();
            ctx.health.report_comms_error(ctx.unit);
            break CycleEnd::TransportError;
        }

        let nonce = protocol::decode_single_result(&buf);
        info!(
            unit = %ctx.unit,
            nonce = format!("{nonce:08x}"),
            rate = %HashRate::from_seconds_per_hash(session.seconds_per_hash).to_human_readable(),
            "nonce found"
        );
        ctx.sink.submit_candidate(ctx.unit, work, nonce).await;

        // The nonce's position doubles as a search-space progress proxy.
        // Only adopt a new rate estimate while the cycle has been free of
        // hardware errors; a miscounting device poisons the figure.
        if ctx.health.hardware_errors(ctx.unit) == errors_at_start {
            session.seconds_per_hash = started.elapsed().as_secs_f64() / nonce as f64;
        }
    };

    // Done: elapsed time against the rolling seconds-per-hash estimate.
    let hashes = match end {
        CycleEnd::TransportError => 0,
        _ => (started.elapsed().as_secs_f64() / session.seconds_per_hash) as u64,
    };
    (end, hashes)
}

/// Run one cycle against a multi-candidate, frequency-tunable device.
///
/// On top of the scan itself this updates the frequency controller and issues
/// whatever clock command it decides on. An overheat verdict resets the
/// device and surfaces as a fatal [`ScanFailure`]; the caller should disable
/// the unit.
pub async fn run_multi_cycle<L: Transport>(
    ctx: &ScanContext<'_>,
    session: &mut DeviceSession<L>,
    bus: &SharedBus,
    freq: &mut FrequencyController,
    check: &dyn CandidateCheck,
    work: WorkItem,
) -> Result<CycleReport, ScanFailure> {
    let (end, hashes, overheat) = multi_cycle_inner(ctx, session, bus, freq, check, &work).await;
    ctx.source.release_work(work);
    debug!(unit = %ctx.unit, outcome = ?end, hashes, "cycle complete");
    match overheat {
        Some(drop_pct) => Err(ScanFailure::Overheat { drop_pct }),
        None => Ok(CycleReport { end, hashes }),
    }
}

async fn multi_cycle_inner<L: Transport>(
    ctx: &ScanContext<'_>,
    session: &mut DeviceSession<L>,
    bus: &SharedBus,
    freq: &mut FrequencyController,
    check: &dyn CandidateCheck,
    work: &WorkItem,
) -> (CycleEnd, u64, Option<f64>) {
    // Idle -> Sent, with one retry: a single flaky transmit is not worth
    // burning the whole cycle over.
    let frame = protocol::encode_multi_job(work);
    let sent = {
        let _bus = bus.acquire().await;
        match session.link_mut() {
            None => Err(TransportError::Closed),
            Some(link) => match send_frame(link, &frame).await {
                Ok(()) => Ok(()),
                Err(first) => {
                    warn!(unit = %ctx.unit, error = %first, "job transmit failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                    send_frame(link, &frame).await
                }
            },
        }
    };
    if let Err(e) = sent {
        error!(unit = %ctx.unit, error = %e, frame = frame.len(), "job transmit failed");
        session.close();
        ctx.health.report_comms_error(ctx.unit);
        return (CycleEnd::TransportError, 0, None);
    }

    // Sent -> Polling
    let started = Instant::now();
    let mut classifier = MultiClassifier::new(check);
    trace!(unit = %ctx.unit, "entering poll loop");

    let end = loop {
        // Pace the next poll in short slices so a restart is observed within
        // one slice, not one poll interval.
        let mut slices = 0;
        while slices < POLL_SLICES && !ctx.interrupted() {
            tokio::time::sleep(POLL_SLICE).await;
            slices += 1;
        }

        let mut buf = [0u8; protocol::MULTI_RESULT_LEN];
        let read = {
            let _bus = bus.acquire().await;
            match session.link_mut() {
                None => Err(TransportError::Closed),
                Some(link) => match link.read(&mut buf, RESULT_READ_WAIT).await {
                    Ok(n) => Ok(n),
                    Err(first) => {
                        warn!(unit = %ctx.unit, error = %first, "result read failed, retrying");
                        tokio::time::sleep(RETRY_DELAY).await;
                        link.read(&mut buf, RESULT_READ_WAIT).await
                    }
                },
            }
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                error!(unit = %ctx.unit, error = %e, "result read failed");
                session.close();
                ctx.health.report_comms_error(ctx.unit);
                break CycleEnd::TransportError;
            }
        };

        if ctx.interrupted() {
            debug!(unit = %ctx.unit, "new work available, ending scan");
            break CycleEnd::Cancelled;
        }

        freq.note_poll();

        if n == 0 {
            if started.elapsed() > session.timeout {
                break CycleEnd::Drained;
            }
            continue;
        }
        if n < buf.len() {
            error!(unit = %ctx.unit, read = n, want = buf.len(), "short result frame");
            session.close();
            ctx.health.report_comms_error(ctx.unit);
            break CycleEnd::TransportError;
        }

        let result = protocol::decode_multi_result(&buf);
        match classifier.classify(work, &result) {
            FrameOutcome::Quiet => {}
            FrameOutcome::Exhausted => {
                debug!(
                    unit = %ctx.unit,
                    progress = classifier.hashes(),
                    "search space exhausted"
                );
                break CycleEnd::Overflow;
            }
            FrameOutcome::Accepted(candidates) => {
                for candidate in candidates {
                    debug!(
                        unit = %ctx.unit,
                        candidate = format!("{candidate:08x}"),
                        "candidate accepted"
                    );
                    ctx.sink.submit_candidate(ctx.unit, work, candidate).await;
                }
            }
        }

        if started.elapsed() > session.timeout {
            debug!(
                unit = %ctx.unit,
                elapsed_s = started.elapsed().as_secs(),
                "scan window drained"
            );
            break CycleEnd::Drained;
        }
    };

    let hashes = classifier.hashes();
    let hw_errors = classifier.hardware_errors();
    if end == CycleEnd::TransportError {
        // No link left to retune against; statistics keep their last state.
        return (end, 0, None);
    }

    // Done: fold this cycle's errors into the step statistics and let the
    // controller pick the next step.
    freq.finish_cycle(hw_errors);
    let retune = freq.retune();

    if let Some(change) = retune.change {
        info!(
            unit = %ctx.unit,
            from = change.from,
            to = change.to,
            mhz = freq.current_mhz(),
            "clock step change"
        );
        let _bus = bus.acquire().await;
        if let Some(link) = session.link_mut() {
            if let Err(e) = send_frame(link, &protocol::encode_set_clock(change.to)).await {
                warn!(unit = %ctx.unit, error = %e, "failed to program clock step");
            }
        }
    }

    if let Some(overheat) = retune.overheat {
        {
            let _bus = bus.acquire().await;
            if let Some(link) = session.link_mut() {
                if let Err(e) = send_frame(link, &protocol::encode_reset()).await {
                    warn!(unit = %ctx.unit, error = %e, "failed to reset device");
                }
            }
        }
        error!(
            unit = %ctx.unit,
            drop_pct = format!("{:.1}", overheat.drop_pct),
            best = overheat.best,
            ceiling = overheat.ceiling,
            "clock collapse detected; device reset to prevent heat damage"
        );
        return (end, 0, Some(overheat.drop_pct));
    }

    (end, hashes, None)
}

/// Write one whole frame or report why not.
pub(crate) async fn send_frame<L: Transport>(
    link: &mut L,
    frame: &[u8],
) -> Result<(), TransportError> {
    match link.write(frame).await {
        Ok(n) if n == frame.len() => Ok(()),
        Ok(n) => Err(TransportError::ShortWrite {
            wanted: frame.len(),
            wrote: n,
        }),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fpga::session::DEFAULT_SECONDS_PER_HASH;
    use crate::work::{RestartSignal, PAYLOAD_LEN};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    const TAG: u32 = 0x7777_0001;

    enum ReadScript {
        Data(Vec<u8>),
        Timeout,
        Fail,
    }

    enum WriteScript {
        Short(usize),
        Fail,
    }

    #[derive(Default)]
    struct MockState {
        reads: VecDeque<ReadScript>,
        write_script: VecDeque<WriteScript>,
        writes: Vec<Vec<u8>>,
    }

    /// Scripted transport; an exhausted read script behaves like silence.
    #[derive(Clone, Default)]
    struct MockLink(Arc<Mutex<MockState>>);

    impl MockLink {
        fn push_read(&self, script: ReadScript) {
            self.0.lock().unwrap().reads.push_back(script);
        }

        fn push_write(&self, script: WriteScript) {
            self.0.lock().unwrap().write_script.push_back(script);
        }

        fn writes(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().writes.clone()
        }
    }

    #[async_trait]
    impl Transport for MockLink {
        async fn write(&mut self, bytes: &[u8]) -> Result<usize, TransportError> {
            let script = {
                let mut state = self.0.lock().unwrap();
                state.writes.push(bytes.to_vec());
                state.write_script.pop_front()
            };
            match script {
                None => Ok(bytes.len()),
                Some(WriteScript::Short(n)) => Ok(n),
                Some(WriteScript::Fail) => Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock write failure",
                ))),
            }
        }

        async fn read(&mut self, buf: &mut [u8], wait: Duration) -> Result<usize, TransportError> {
            let script = self.0.lock().unwrap().reads.pop_front();
            match script {
                Some(ReadScript::Data(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(ReadScript::Timeout) | None => {
                    tokio::time::sleep(wait).await;
                    Ok(0)
                }
                Some(ReadScript::Fail) => Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock read failure",
                ))),
            }
        }
    }

    /// All four collaborators in one mock.
    #[derive(Default)]
    struct MockRig {
        released: AtomicU32,
        submitted: Mutex<Vec<u32>>,
        comms_errors: AtomicU32,
        hardware_errors: AtomicU64,
        /// When set, every submission bumps the hardware-error counter, the
        /// way an upstream sink flags a bogus nonce.
        flag_submissions: AtomicBool,
    }

    #[async_trait]
    impl JobSource for MockRig {
        async fn get_work(&self, _unit: UnitId) -> WorkItem {
            blank_work()
        }

        fn release_work(&self, _item: WorkItem) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SubmitSink for MockRig {
        async fn submit_candidate(&self, _unit: UnitId, _work: &WorkItem, candidate: u32) {
            self.submitted.lock().unwrap().push(candidate);
            if self.flag_submissions.load(Ordering::SeqCst) {
                self.hardware_errors.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl HealthReporter for MockRig {
        fn report_comms_error(&self, _unit: UnitId) {
            self.comms_errors.fetch_add(1, Ordering::SeqCst);
        }

        fn hardware_errors(&self, _unit: UnitId) -> u64 {
            self.hardware_errors.load(Ordering::SeqCst)
        }
    }

    impl CandidateCheck for MockRig {
        fn expected_tag(&self, _work: &WorkItem, _candidate: u32) -> u32 {
            TAG
        }
    }

    fn blank_work() -> WorkItem {
        WorkItem {
            id: 1,
            midstate: [0; 32],
            payload: [0; PAYLOAD_LEN],
        }
    }

    fn multi_frame(progress: u32, best: [u32; 2]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(protocol::MULTI_RESULT_LEN);
        frame.extend(progress.to_le_bytes());
        frame.extend(best[0].to_le_bytes());
        frame.extend(best[1].to_le_bytes());
        frame.extend(TAG.to_le_bytes());
        frame
    }

    struct Fixture {
        rig: Arc<MockRig>,
        restart: RestartSignal,
        shutdown: CancellationToken,
        bus: SharedBus,
        link: MockLink,
        session: DeviceSession<MockLink>,
    }

    impl Fixture {
        fn new(timeout: Duration) -> Self {
            let link = MockLink::default();
            let mut session = DeviceSession::new(UnitId(0), timeout);
            session.open_with(link.clone());
            Self {
                rig: Arc::new(MockRig::default()),
                restart: RestartSignal::default(),
                shutdown: CancellationToken::new(),
                bus: SharedBus::for_units(1).remove(0),
                link,
                session,
            }
        }

    }

    // Free function over disjoint fixture fields, so the context can coexist
    // with a mutable borrow of the session.
    fn ctx<'a>(
        rig: &'a MockRig,
        restart: &'a RestartSignal,
        shutdown: &'a CancellationToken,
    ) -> ScanContext<'a> {
        ScanContext {
            unit: UnitId(0),
            source: rig,
            sink: rig,
            health: rig,
            restart,
            shutdown,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_cycle_submits_and_reestimates_rate() {
        let mut fx = Fixture::new(Duration::from_secs(1));
        fx.link.push_read(ReadScript::Timeout);
        fx.link
            .push_read(ReadScript::Data(0x0000_1000u32.to_be_bytes().to_vec()));

        let report =
            run_single_cycle(&ctx(&fx.rig, &fx.restart, &fx.shutdown), &mut fx.session, &fx.bus, blank_work()).await;

        assert_eq!(report.end, CycleEnd::Drained);
        assert_eq!(*fx.rig.submitted.lock().unwrap(), vec![0x1000]);
        assert_eq!(fx.rig.released.load(Ordering::SeqCst), 1);

        // The nonce arrived 100ms in, so the estimate becomes 0.1s / 0x1000,
        // and draining at ~1.1s credits about 45k hashes.
        let expect_hs = 0.1 / 4096.0;
        assert!((fx.session.seconds_per_hash - expect_hs).abs() < 1e-9);
        assert!(report.hashes > 40_000 && report.hashes < 50_000);
    }

    #[tokio::test(start_paused = true)]
    async fn single_cycle_rate_survives_hardware_errors() {
        let mut fx = Fixture::new(Duration::from_millis(300));
        fx.rig.flag_submissions.store(true, Ordering::SeqCst);
        fx.link
            .push_read(ReadScript::Data(0x0000_1000u32.to_be_bytes().to_vec()));

        run_single_cycle(&ctx(&fx.rig, &fx.restart, &fx.shutdown), &mut fx.session, &fx.bus, blank_work()).await;

        // The submission flagged a hardware error, so the estimate must not
        // have been adopted.
        assert_eq!(fx.session.seconds_per_hash, DEFAULT_SECONDS_PER_HASH);
    }

    #[tokio::test(start_paused = true)]
    async fn single_cycle_cancels_promptly_and_releases_once() {
        let mut fx = Fixture::new(Duration::from_secs(10));
        fx.restart.raise();

        let report =
            run_single_cycle(&ctx(&fx.rig, &fx.restart, &fx.shutdown), &mut fx.session, &fx.bus, blank_work()).await;

        assert_eq!(report.end, CycleEnd::Cancelled);
        assert_eq!(report.hashes, 0);
        assert_eq!(fx.rig.released.load(Ordering::SeqCst), 1);
        assert!(fx.rig.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn single_cycle_short_write_is_a_transport_error() {
        let mut fx = Fixture::new(Duration::from_secs(1));
        fx.link.push_write(WriteScript::Short(10));

        let report =
            run_single_cycle(&ctx(&fx.rig, &fx.restart, &fx.shutdown), &mut fx.session, &fx.bus, blank_work()).await;

        assert_eq!(report.end, CycleEnd::TransportError);
        assert_eq!(report.hashes, 0);
        assert_eq!(fx.rig.comms_errors.load(Ordering::SeqCst), 1);
        assert_eq!(fx.rig.released.load(Ordering::SeqCst), 1);
        assert!(!fx.session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn single_cycle_short_read_is_a_transport_error() {
        let mut fx = Fixture::new(Duration::from_secs(1));
        fx.link.push_read(ReadScript::Data(vec![0xab, 0xcd]));

        let report =
            run_single_cycle(&ctx(&fx.rig, &fx.restart, &fx.shutdown), &mut fx.session, &fx.bus, blank_work()).await;

        assert_eq!(report.end, CycleEnd::TransportError);
        assert_eq!(report.hashes, 0);
        assert_eq!(fx.rig.comms_errors.load(Ordering::SeqCst), 1);
        assert!(!fx.session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn multi_cycle_harvests_dedupes_and_detects_overflow() {
        let mut fx = Fixture::new(Duration::from_secs(10));
        let mut freq = FrequencyController::new(3, 6);

        const A: u32 = 0x1111_0000;
        const B: u32 = 0x2222_0000;
        fx.link.push_read(ReadScript::Data(multi_frame(10, [A, 0])));
        fx.link.push_read(ReadScript::Data(multi_frame(20, [A, B])));
        fx.link.push_read(ReadScript::Data(multi_frame(15, [0, 0])));

        let rig = Arc::clone(&fx.rig);
        let report = run_multi_cycle(
            &ctx(&fx.rig, &fx.restart, &fx.shutdown),
            &mut fx.session,
            &fx.bus,
            &mut freq,
            rig.as_ref(),
            blank_work(),
        )
        .await
        .expect("no fatal failure");

        assert_eq!(report.end, CycleEnd::Overflow);
        // Estimate is the last non-decreasing counter value.
        assert_eq!(report.hashes, 20);
        // A reported twice is forwarded once.
        assert_eq!(*fx.rig.submitted.lock().unwrap(), vec![A, B]);
        assert_eq!(fx.rig.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_cycle_cancel_releases_exactly_once() {
        let mut fx = Fixture::new(Duration::from_secs(10));
        let mut freq = FrequencyController::new(3, 6);
        fx.restart.raise();

        let rig = Arc::clone(&fx.rig);
        let report = run_multi_cycle(
            &ctx(&fx.rig, &fx.restart, &fx.shutdown),
            &mut fx.session,
            &fx.bus,
            &mut freq,
            rig.as_ref(),
            blank_work(),
        )
        .await
        .expect("no fatal failure");

        assert_eq!(report.end, CycleEnd::Cancelled);
        assert_eq!(report.hashes, 0);
        assert_eq!(fx.rig.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn multi_cycle_transmit_fails_after_one_retry() {
        let mut fx = Fixture::new(Duration::from_secs(1));
        let mut freq = FrequencyController::new(3, 6);
        fx.link.push_write(WriteScript::Short(10));
        fx.link.push_write(WriteScript::Fail);

        let rig = Arc::clone(&fx.rig);
        let report = run_multi_cycle(
            &ctx(&fx.rig, &fx.restart, &fx.shutdown),
            &mut fx.session,
            &fx.bus,
            &mut freq,
            rig.as_ref(),
            blank_work(),
        )
        .await
        .expect("transport errors are not fatal");

        assert_eq!(report.end, CycleEnd::TransportError);
        assert_eq!(report.hashes, 0);
        // Both attempts hit the wire.
        assert_eq!(fx.link.writes().len(), 2);
        assert_eq!(fx.rig.comms_errors.load(Ordering::SeqCst), 1);
        assert_eq!(fx.rig.released.load(Ordering::SeqCst), 1);
        assert!(!fx.session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn multi_cycle_programs_a_clock_change() {
        let mut fx = Fixture::new(Duration::from_millis(300));
        // The current step has gone lossy; the controller should step down
        // and program the device.
        let mut freq = FrequencyController::new(3, 6);
        freq.inject_stats(3, 500.0, 0.6, 0.04);

        fx.link.push_read(ReadScript::Data(multi_frame(10, [0, 0])));

        let rig = Arc::clone(&fx.rig);
        let report = run_multi_cycle(
            &ctx(&fx.rig, &fx.restart, &fx.shutdown),
            &mut fx.session,
            &fx.bus,
            &mut freq,
            rig.as_ref(),
            blank_work(),
        )
        .await
        .expect("no fatal failure");

        assert_eq!(report.end, CycleEnd::Drained);
        assert_eq!(report.hashes, 10);
        assert_eq!(freq.step(), 2);
        let writes = fx.link.writes();
        assert_eq!(
            writes.last().unwrap().as_slice(),
            &protocol::encode_set_clock(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn multi_cycle_overheat_resets_device_and_is_fatal() {
        let mut fx = Fixture::new(Duration::from_millis(100));
        // Heavy history above the default extends the recent ceiling to 12
        // while everything above step 2 has gone bad: a collapse.
        let mut freq = FrequencyController::new(8, 12);
        for step in 9..=12 {
            freq.inject_stats(step, 300.0, 0.5, 0.5);
        }
        for step in 3..=8 {
            freq.inject_stats(step, 300.0, 0.4, 0.4);
        }

        let rig = Arc::clone(&fx.rig);
        let result = run_multi_cycle(
            &ctx(&fx.rig, &fx.restart, &fx.shutdown),
            &mut fx.session,
            &fx.bus,
            &mut freq,
            rig.as_ref(),
            blank_work(),
        )
        .await;

        match result {
            Err(ScanFailure::Overheat { drop_pct }) => assert!(drop_pct > 0.0),
            other => panic!("expected overheat, got {other:?}"),
        }
        // The reset frame was the last thing on the wire, and the work item
        // still came back exactly once.
        let writes = fx.link.writes();
        assert_eq!(writes.last().unwrap().as_slice(), &protocol::encode_reset());
        assert_eq!(fx.rig.released.load(Ordering::SeqCst), 1);
    }
}
