//! Commit of checked transactions
//!
//! [`commit`] turns a [`CheckedTransaction`] into the live state of the device and starts
//! the [commit tail](tail), which programs the hardware. Everything before the state swap
//! may fail and leaves the device untouched. After the swap the transaction runs to
//! completion, hardware failures are logged and handed to the recovery.
//!
//! The tail runs
//! - on the dedicated worker thread of the crtc, for non-blocking commits touching one crtc,
//! - on a shared queue, for non-blocking commits touching several crtcs,
//! - inline otherwise.
//!
//! Worker threads ask for realtime scheduling, see [`DpuConfig::worker_priority`](super::DpuConfig::worker_priority).

use std::{
    sync::{atomic::AtomicBool, Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use tracing::{debug, error, info_span, instrument, trace, warn};

use super::{
    error::Error,
    hw::Framebuffer,
    state::{CheckedTransaction, Committed, CommittedTransaction, CrtcIndex},
    window::WindowMask,
    DeviceInner,
};
use crate::utils::Serial;

mod scheduler;
pub(crate) mod tail;

pub(crate) use self::scheduler::Schedulers;

#[derive(Debug, Default)]
struct SignalState {
    flip_done: bool,
    hw_done: bool,
}

/// Completion tracking of one crtc of a commit
#[derive(Debug, Default)]
pub(crate) struct CommitSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl CommitSignal {
    pub(crate) fn complete_flip(&self) {
        self.state.lock().unwrap().flip_done = true;
        self.cond.notify_all();
    }

    pub(crate) fn complete_hw(&self) {
        self.state.lock().unwrap().hw_done = true;
        self.cond.notify_all();
    }

    pub(crate) fn is_hw_done(&self) -> bool {
        self.state.lock().unwrap().hw_done
    }

    fn wait(&self, timeout: Option<Duration>, done: impl Fn(&SignalState) -> bool) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        while !done(&state) {
            match deadline {
                None => state = self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self.cond.wait_timeout(state, deadline - now).unwrap().0;
                }
            }
        }
        true
    }

    pub(crate) fn wait_flip_done(&self, timeout: Option<Duration>) -> bool {
        self.wait(timeout, |s| s.flip_done)
    }

    pub(crate) fn wait_hw_done(&self, timeout: Option<Duration>) -> bool {
        self.wait(timeout, |s| s.hw_done)
    }
}

/// Handle to a commit that passed the state swap
///
/// Dropping the handle does not affect the commit.
#[derive(Debug, Clone)]
pub struct CommitHandle {
    serial: Serial,
    signals: Vec<(CrtcIndex, Arc<CommitSignal>)>,
    fake_commit: Option<Arc<CommitSignal>>,
}

impl CommitHandle {
    /// Serial of the commit
    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Crtcs touched by the commit
    pub fn crtcs(&self) -> impl Iterator<Item = CrtcIndex> + '_ {
        self.signals.iter().map(|(crtc, _)| *crtc)
    }

    fn all(&self) -> impl Iterator<Item = &Arc<CommitSignal>> {
        self.signals.iter().map(|(_, s)| s).chain(self.fake_commit.iter())
    }

    /// Wait until the new frame is on screen on every crtc of the commit
    ///
    /// Returns `false` if the timeout expired first, `None` waits without bound.
    pub fn wait_flip_done(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.all().all(|s| s.wait_flip_done(deadline.map(|d| d.saturating_duration_since(Instant::now()))))
    }

    /// Wait until the commit stopped touching the hardware
    ///
    /// Returns `false` if the timeout expired first, `None` waits without bound.
    pub fn wait_hw_done(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.all().all(|s| s.wait_hw_done(deadline.map(|d| d.saturating_duration_since(Instant::now()))))
    }

    /// Whether the commit stopped touching the hardware
    pub fn is_hw_done(&self) -> bool {
        self.all().all(|s| s.is_hw_done())
    }
}

/// Last commit swapped in per crtc, guarded by the swap lock
#[derive(Debug)]
pub(crate) struct SwapState {
    pub(crate) serial: crate::utils::SerialCounter,
    pub(crate) last_commit: Vec<Option<Arc<CommitSignal>>>,
}

impl SwapState {
    pub(crate) fn new(crtc_count: usize) -> Self {
        SwapState {
            serial: crate::utils::SerialCounter::new(),
            last_commit: vec![None; crtc_count],
        }
    }
}

fn unpin(framebuffers: &[Arc<dyn Framebuffer>]) {
    for fb in framebuffers {
        fb.cleanup();
    }
}

fn same_fb(a: &Option<Arc<dyn Framebuffer>>, b: &Option<Arc<dyn Framebuffer>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Make a checked transaction the live state of the device and run its commit tail
#[instrument(level = "debug", parent = &device.span, skip(device, checked))]
#[profiling::function]
pub(crate) fn commit(
    device: &Arc<DeviceInner>,
    checked: CheckedTransaction,
    nonblock: bool,
) -> Result<CommitHandle, Error> {
    let mut state = checked.0;
    if device.is_detached() {
        return Err(Error::DeviceDetached);
    }

    // setup
    let crtcs: Vec<CrtcIndex> = state.crtcs.keys().copied().collect();
    let signals: IndexMap<CrtcIndex, Arc<CommitSignal>> = crtcs
        .iter()
        .map(|crtc| (*crtc, Arc::new(CommitSignal::default())))
        .collect();
    let crtcless = state.planes.values().any(|p| p.new.crtc().is_none() && p.old.crtc().is_none())
        || state
            .connectors
            .values()
            .any(|c| c.new.crtc().is_none() && c.old.crtc().is_none());
    let fake_commit = (crtcless || crtcs.is_empty()).then(|| Arc::new(CommitSignal::default()));

    // prepare
    let mut pinned: Vec<Arc<dyn Framebuffer>> = Vec::new();
    let incoming = state
        .planes
        .values()
        .filter(|p| !same_fb(&p.old.fb, &p.new.fb))
        .filter_map(|p| p.new.fb.clone())
        .chain(
            state
                .connectors
                .values()
                .filter_map(|c| c.new.writeback_job.as_ref().map(|job| job.fb.clone())),
        )
        .collect::<Vec<_>>();
    for fb in incoming {
        if let Err(err) = fb.prepare() {
            unpin(&pinned);
            return Err(Error::access("Failed to prepare framebuffer", err));
        }
        pinned.push(fb);
    }

    // swap
    let committed = {
        let mut swap = device.swap.lock().unwrap();
        if let Err(err) = device.verify_fresh(&state) {
            unpin(&pinned);
            return Err(err);
        }

        for crtc in &crtcs {
            if let Some(previous) = swap.last_commit.get(crtc.0 as usize).and_then(|s| s.clone()) {
                if !previous.is_hw_done() {
                    trace!(?crtc, "Waiting for previous commit to reach hw_done");
                    previous.wait_hw_done(None);
                }
            }
        }

        let serial = swap.serial.next_serial();
        let mut live = device.live.write().unwrap();
        let crtc_states = std::mem::take(&mut state.crtcs)
            .into_iter()
            .map(|(crtc, t)| {
                let new = Arc::new(t.new);
                live.crtcs[crtc.0 as usize] = new.clone();
                (crtc, Committed { old: t.old, new })
            })
            .collect();
        let plane_states = std::mem::take(&mut state.planes)
            .into_iter()
            .map(|(plane, t)| {
                let new = Arc::new(t.new);
                live.planes.insert(plane, new.clone());
                (plane, Committed { old: t.old, new })
            })
            .collect();
        let connector_states: IndexMap<_, Committed<_>> = std::mem::take(&mut state.connectors)
            .into_iter()
            .map(|(connector, t)| {
                let new = Arc::new(t.new);
                live.connectors.insert(connector, new.clone());
                (connector, Committed { old: t.old, new })
            })
            .collect();
        // reservations are owned by the live state from here on
        state.reservations.clear();

        // a capture that is replaced or loses its crtc is released with the old framebuffers
        let mut abandoned_writeback = Vec::new();
        {
            let mut pending = device.pending_writeback.lock().unwrap();
            for (connector, c) in &connector_states {
                let abandoned = match c.new.writeback_job.as_ref() {
                    Some(job) => pending.insert(*connector, job.fb.clone()),
                    None if c.new.crtc().is_none() => pending.shift_remove(connector),
                    None => None,
                };
                if let Some(fb) = abandoned {
                    debug!(?connector, "Abandoning unfinished writeback job");
                    abandoned_writeback.push(fb);
                }
            }
        }

        for (crtc, signal) in &signals {
            if let Some(slot) = swap.last_commit.get_mut(crtc.0 as usize) {
                *slot = Some(signal.clone());
            }
        }

        // freed windows of other crtcs may still wait for their frame start
        let reservations = live
            .crtcs
            .iter()
            .map(|c| {
                let freed = if signals.contains_key(&c.crtc()) {
                    c.freed_windows()
                } else {
                    WindowMask::empty()
                };
                (c.crtc(), c.reserved_windows().union(freed))
            })
            .collect::<Vec<_>>();
        drop(live);
        if !device.allocator.assert_disjoint(reservations) {
            error!(%serial, "Window bookkeeping is inconsistent after swap");
        }

        Arc::new(CommittedTransaction {
            serial,
            flags: state.flags,
            crtcs: crtc_states,
            planes: plane_states,
            connectors: connector_states,
            signals: signals.clone(),
            fake_commit: fake_commit.clone(),
            abandoned_writeback,
            tail_started: AtomicBool::new(false),
        })
    };
    drop(state);
    debug!(serial = %committed.serial, ?crtcs, "Transaction swapped in");

    let handle = CommitHandle {
        serial: committed.serial,
        signals: signals.into_iter().collect(),
        fake_commit,
    };

    let scheduler = match device.schedulers.select(&crtcs) {
        Some(scheduler) if nonblock => scheduler,
        _ => {
            tail::run(device, &committed);
            return Ok(handle);
        }
    };

    let job_device = device.clone();
    let job_txn = committed.clone();
    let job = Box::new(move || {
        let span = info_span!(parent: &job_device.span, "commit_worker");
        let _guard = span.enter();
        tail::run(&job_device, &job_txn);
    });
    if let Err(job) = scheduler.schedule(job) {
        warn!(serial = %committed.serial, "Commit workers are gone, running commit tail inline");
        job();
    }
    Ok(handle)
}
