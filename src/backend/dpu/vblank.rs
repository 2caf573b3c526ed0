//! Bounded waits for hardware frame completion
//!
//! A dead output must never stall the commit pipeline. Every wait on the hardware is bounded
//! by a number of frame periods, an expired wait escalates into an asynchronous recovery of
//! the crtc that runs on its own thread and reports back through the event notifier.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info, info_span, warn};

use super::{
    event::{DpuEvent, EventSink},
    hw::{CrtcBackend, RecoveryReason, TriggerState},
    state::CrtcIndex,
};

/// Frame periods after which a vblank wait is abandoned
pub const VBLANK_TIMEOUT_FRAMES: u64 = 12;
/// Frame periods after which a vblank wait is reported as slow
pub const VBLANK_WARN_FRAMES: u64 = 6;

const RECOVERY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Timeouts of the vblank and frame start waits of a crtc
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankTimeouts {
    /// Waits are abandoned after this duration
    pub hard: Duration,
    /// Waits are reported as slow after this duration
    pub warn: Duration,
}

impl VblankTimeouts {
    /// Timeouts at the given refresh rate, multiplied by `scale` for emulated hardware
    pub fn new(refresh: u32, scale: u32) -> Self {
        let refresh = refresh.max(1) as u64;
        let scale = scale.max(1) as u64;
        VblankTimeouts {
            hard: Duration::from_millis(VBLANK_TIMEOUT_FRAMES * 1000 * scale / refresh),
            warn: Duration::from_millis(VBLANK_WARN_FRAMES * 1000 * scale / refresh),
        }
    }
}

/// Result of a bounded hardware wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The hardware reported in time
    Completed,
    /// The hardware reported, but only after the warn threshold
    Slow,
    /// The crtc was recovering, the wait was skipped or deferred
    Recovering,
    /// The wait expired and a recovery got requested
    TimedOut,
}

/// Wait for the vblank counter of a crtc to move past `since`
#[profiling::function]
pub(crate) fn wait_for_vblank(
    crtc: CrtcIndex,
    backend: &dyn CrtcBackend,
    since: u64,
    timeouts: VblankTimeouts,
    recovery: &RecoveryHandler,
) -> WaitOutcome {
    let start = Instant::now();
    if backend.wait_vblank(since, timeouts.hard) {
        let elapsed = start.elapsed();
        if elapsed > timeouts.warn {
            warn!(?crtc, ?elapsed, threshold = ?timeouts.warn, "Slow vblank");
            return WaitOutcome::Slow;
        }
        return WaitOutcome::Completed;
    }

    error!(?crtc, timeout = ?timeouts.hard, since, "Timed out waiting for vblank");
    backend.dump();
    if backend.is_recovering() {
        debug!(?crtc, "Crtc is already recovering, skipping recovery request");
        return WaitOutcome::Recovering;
    }
    recovery.request(crtc, RecoveryReason::VblankTimeout);
    WaitOutcome::TimedOut
}

/// Wait for the hardware to latch the flushed configuration of a crtc
///
/// While a recovery is in progress the frame start cannot happen, the wait polls for the
/// recovery to finish instead (bounded by the same timeout).
#[profiling::function]
pub(crate) fn wait_for_framestart(
    crtc: CrtcIndex,
    backend: &dyn CrtcBackend,
    timeouts: VblankTimeouts,
    mask_trigger: bool,
    recovery: &RecoveryHandler,
) -> WaitOutcome {
    let start = Instant::now();
    if backend.is_recovering() {
        while backend.is_recovering() && start.elapsed() < timeouts.hard {
            thread::sleep(RECOVERY_POLL_INTERVAL);
        }
        debug!(?crtc, waited = ?start.elapsed(), "Deferred frame start wait to recovery");
        return WaitOutcome::Recovering;
    }

    let started = backend.wait_framestart(timeouts.hard);
    if mask_trigger {
        backend.set_trigger(TriggerState::Mask);
    }
    if started {
        let elapsed = start.elapsed();
        if elapsed > timeouts.warn {
            warn!(?crtc, ?elapsed, threshold = ?timeouts.warn, "Slow frame start");
            return WaitOutcome::Slow;
        }
        return WaitOutcome::Completed;
    }

    error!(?crtc, timeout = ?timeouts.hard, "Timed out waiting for frame start");
    backend.dump();
    if backend.is_recovering() {
        return WaitOutcome::Recovering;
    }
    recovery.request(crtc, RecoveryReason::FramestartTimeout);
    WaitOutcome::TimedOut
}

#[derive(Debug)]
struct RecoveryRequest {
    crtc: CrtcIndex,
    reason: RecoveryReason,
}

/// Runs crtc recoveries off the commit path
///
/// At most one request per crtc is queued at any time, further requests for the same crtc
/// are dropped until the queued one ran.
#[derive(Debug)]
pub(crate) struct RecoveryHandler {
    sender: Mutex<Option<mpsc::Sender<RecoveryRequest>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<Vec<AtomicBool>>,
}

impl RecoveryHandler {
    pub(crate) fn spawn(crtcs: Vec<Arc<dyn CrtcBackend>>, events: Arc<EventSink>) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<RecoveryRequest>();
        let pending: Arc<Vec<AtomicBool>> = Arc::new((0..crtcs.len()).map(|_| AtomicBool::new(false)).collect());
        let thread_pending = pending.clone();

        let thread = thread::Builder::new()
            .name("dpu-recovery".into())
            .spawn(move || {
                let span = info_span!("dpu_recovery");
                let _guard = span.enter();
                for request in receiver {
                    let Some(backend) = crtcs.get(request.crtc.0 as usize) else {
                        continue;
                    };
                    info!(crtc = ?request.crtc, reason = ?request.reason, "Recovering crtc");
                    match backend.recover(request.reason) {
                        Ok(()) => events.send(
                            DpuEvent::Recovery {
                                crtc: request.crtc,
                                reason: request.reason,
                            },
                            None,
                        ),
                        Err(err) => error!(crtc = ?request.crtc, "Recovery failed: {}", err),
                    }
                    thread_pending[request.crtc.0 as usize].store(false, Ordering::Release);
                }
            })?;

        Ok(RecoveryHandler {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
            pending,
        })
    }

    /// Queue a recovery of `crtc`
    ///
    /// Returns `false` if a recovery of this crtc is already queued or the handler is shut down.
    pub(crate) fn request(&self, crtc: CrtcIndex, reason: RecoveryReason) -> bool {
        let Some(pending) = self.pending.get(crtc.0 as usize) else {
            return false;
        };
        if pending.swap(true, Ordering::AcqRel) {
            debug!(?crtc, "Recovery already queued");
            return false;
        }
        let sent = self
            .sender
            .lock()
            .unwrap()
            .as_ref()
            .map(|sender| sender.send(RecoveryRequest { crtc, reason }).is_ok())
            .unwrap_or(false);
        if !sent {
            pending.store(false, Ordering::Release);
        }
        sent
    }

    /// Finish queued recoveries and stop the thread
    pub(crate) fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                error!("Recovery thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dpu::{error::BackendError, event::event_channel, state::Mode};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn timeouts_follow_refresh() {
        let t = VblankTimeouts::new(60, 1);
        assert_eq!(t.hard, Duration::from_millis(200));
        assert_eq!(t.warn, Duration::from_millis(100));

        let t = VblankTimeouts::new(120, 1);
        assert_eq!(t.hard, Duration::from_millis(100));
        assert_eq!(t.warn, Duration::from_millis(50));

        let t = VblankTimeouts::new(60, 10);
        assert_eq!(t.hard, Duration::from_secs(2));
    }

    #[derive(Default)]
    struct DeadCrtc {
        recovering: AtomicBool,
        recoveries: AtomicUsize,
    }

    impl CrtcBackend for DeadCrtc {
        fn enable(&self, _mode: &Mode) -> Result<(), BackendError> {
            Ok(())
        }
        fn disable(&self) -> Result<(), BackendError> {
            Ok(())
        }
        fn atomic_begin(&self) {}
        fn atomic_flush(&self) {}
        fn has_vblank(&self) -> bool {
            true
        }
        fn vblank_count(&self) -> u64 {
            0
        }
        fn wait_vblank(&self, _since: u64, _timeout: Duration) -> bool {
            false
        }
        fn wait_framestart(&self, _timeout: Duration) -> bool {
            false
        }
        fn set_trigger(&self, _state: TriggerState) {}
        fn is_recovering(&self) -> bool {
            self.recovering.load(Ordering::SeqCst)
        }
        fn recover(&self, _reason: RecoveryReason) -> Result<(), BackendError> {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn update_bts_fps(&self, _refresh: u32) {}
        fn check_svsync_start(&self) {}
    }

    #[test]
    fn timeout_requests_recovery_once() {
        let crtc = Arc::new(DeadCrtc::default());
        let (sink, _notifier) = event_channel(1);
        let handler = RecoveryHandler::spawn(vec![crtc.clone() as Arc<dyn CrtcBackend>], Arc::new(sink)).unwrap();
        let timeouts = VblankTimeouts::new(1000, 1);

        crtc.recovering.store(true, Ordering::SeqCst);
        let outcome = wait_for_vblank(CrtcIndex(0), &*crtc, 0, timeouts, &handler);
        assert_eq!(outcome, WaitOutcome::Recovering);

        crtc.recovering.store(false, Ordering::SeqCst);
        let outcome = wait_for_vblank(CrtcIndex(0), &*crtc, 0, timeouts, &handler);
        assert_eq!(outcome, WaitOutcome::TimedOut);

        handler.shutdown();
        assert_eq!(crtc.recoveries.load(Ordering::SeqCst), 1);
        assert!(!handler.request(CrtcIndex(0), RecoveryReason::VblankTimeout));
    }
}
