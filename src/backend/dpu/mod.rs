//! Atomic display commits on a display processing unit
//!
//! This module provides a [`DpuDevice`], which validates and commits display transactions
//! for all crtcs of one DPU. The register level programming is done by the hardware
//! backends passed in at [`DpuDevice::attach`], see the [`hw`] module.
//!
//! ## How to use it
//!
//! ### Initialization
//!
//! Describe the capabilities of the hardware in a [`DpuConfig`] and hand it to
//! [`DpuDevice::attach`] together with the [`Backends`](hw::Backends). Attaching returns the
//! device and a [`DpuDeviceNotifier`], an [`EventSource`](calloop::EventSource) delivering
//! [`DpuEvent`]s once commits reached the screen or a crtc was recovered.
//!
//! ### Transactions
//!
//! A transaction is built with [`DpuDevice::begin`] by modifying the states of crtcs, planes
//! and connectors. [`DpuDevice::check`] validates the transaction and reserves the hardware
//! windows it needs, [`DpuDevice::commit`] makes it the live state and programs the hardware,
//! either blocking or on a worker thread.
//!
//! ```rust,ignore
//! let mut state = device.begin(CommitFlags::ALLOW_MODESET)?;
//! let crtc = state.crtc_state_mut(CrtcIndex(0))?;
//! crtc.active = true;
//! crtc.mode = Mode::new(1080, 2400, 60);
//! state.set_connector_crtc(ConnectorId(0), Some(CrtcIndex(0)))?;
//!
//! state.set_plane_crtc(PlaneId(0), Some(CrtcIndex(0)))?;
//! let plane = state.plane_state_mut(PlaneId(0))?;
//! plane.fb = Some(framebuffer);
//! plane.src = Rectangle::from_size((1080, 2400));
//! plane.dst = Rectangle::from_size((1080, 2400));
//!
//! let checked = device.check(state)?;
//! let handle = device.commit(checked, true)?;
//! handle.wait_flip_done(None);
//! ```
//!
//! Dropping a transaction that was not committed returns the windows reserved for it.
//!
//! ### Detaching
//!
//! Dropping the [`DpuDevice`] detaches it. Queued commits are finished before the worker
//! threads are joined, later calls on transactions of the device fail with
//! [`Error::DeviceDetached`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock,
};

use indexmap::IndexMap;
use tracing::{debug, info, info_span, instrument, trace};

pub mod check;
pub mod commit;
mod config;
mod error;
mod event;
pub mod fence;
pub mod hw;
pub mod state;
pub mod vblank;
pub mod window;
pub mod zpos;

pub use self::commit::CommitHandle;
pub use self::config::{CrtcConfig, DpuConfig, DEFAULT_REFRESH, DEFAULT_WORKER_PRIORITY};
pub use self::error::{AccessError, BackendError, Error};
pub use self::event::{DpuDeviceNotifier, DpuEvent, EventMetadata};

use self::{
    commit::{Schedulers, SwapState},
    event::EventSink,
    hw::{Backends, Framebuffer},
    state::{
        AtomicState, CheckedTransaction, CommitFlags, ConnectorId, ConnectorState, CrtcIndex, CrtcState,
        LiveState, PlaneId, PlaneState,
    },
    vblank::RecoveryHandler,
    window::{WindowAllocator, WindowConfigTable, WindowMask},
};

#[derive(Debug)]
pub(crate) struct DeviceInner {
    pub(crate) config: DpuConfig,
    pub(crate) backends: Backends,
    pub(crate) allocator: WindowAllocator,
    pub(crate) live: RwLock<LiveState>,
    pub(crate) swap: Mutex<SwapState>,
    pub(crate) bw_tables: Mutex<Vec<WindowConfigTable>>,
    pub(crate) pending_writeback: Mutex<IndexMap<ConnectorId, Arc<dyn Framebuffer>>>,
    pub(crate) events: Arc<EventSink>,
    pub(crate) recovery: RecoveryHandler,
    pub(crate) schedulers: Schedulers,
    tui: Vec<AtomicBool>,
    detached: AtomicBool,
    pub(crate) span: tracing::Span,
}

impl DeviceInner {
    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn is_tui_active(&self, crtc: CrtcIndex) -> bool {
        self.tui
            .get(crtc.0 as usize)
            .map(|tui| tui.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub(crate) fn emit_vblank(&self, crtc: CrtcIndex, user_data: Option<u64>) {
        self.events.send(DpuEvent::VBlank(crtc), user_data);
    }

    /// Verify no other commit replaced an object of `state` since it was duplicated
    pub(crate) fn verify_fresh(&self, state: &AtomicState) -> Result<(), Error> {
        let live = self.live.read().unwrap();
        for (crtc, t) in &state.crtcs {
            match live.crtcs.get(crtc.0 as usize) {
                Some(current) if Arc::ptr_eq(current, &t.old) => {}
                _ => return Err(Error::StaleState(format!("{:?}", crtc))),
            }
        }
        for (plane, t) in &state.planes {
            match live.planes.get(plane) {
                Some(current) if Arc::ptr_eq(current, &t.old) => {}
                _ => return Err(Error::StaleState(format!("{:?}", plane))),
            }
        }
        for (connector, t) in &state.connectors {
            match live.connectors.get(connector) {
                Some(current) if Arc::ptr_eq(current, &t.old) => {}
                _ => return Err(Error::StaleState(format!("{:?}", connector))),
            }
        }
        Ok(())
    }
}

/// An attached display processing unit
#[derive(Debug)]
pub struct DpuDevice {
    inner: Arc<DeviceInner>,
}

impl DpuDevice {
    /// Attach to a DPU with the given capabilities and hardware backends
    ///
    /// Spawns the commit workers of the device. The returned notifier has to be inserted into
    /// an event loop to receive [`DpuEvent`]s.
    pub fn attach(config: DpuConfig, backends: Backends) -> Result<(DpuDevice, DpuDeviceNotifier), Error> {
        let span = info_span!("dpu", crtcs = config.crtc_count(), windows = config.window_count);
        let _guard = span.enter();

        config.validate()?;
        if backends.crtcs.len() != config.crtc_count() {
            return Err(Error::InvalidConfig("every configured crtc needs exactly one backend"));
        }
        if backends.planes.iter().any(|p| p.id.0 >= 64) {
            return Err(Error::InvalidConfig("plane ids must be below 64"));
        }
        if backends.connectors.iter().any(|c| c.id.0 >= 32) {
            return Err(Error::InvalidConfig("connector ids must be below 32"));
        }
        let crtc_in_range = |crtc: &CrtcIndex| (crtc.0 as usize) < config.crtc_count();
        if !backends
            .planes
            .iter()
            .flat_map(|p| p.possible_crtcs.iter())
            .chain(backends.connectors.iter().flat_map(|c| c.possible_crtcs.iter()))
            .all(crtc_in_range)
        {
            return Err(Error::InvalidConfig("possible crtcs refer to a missing crtc"));
        }

        let live = LiveState {
            crtcs: (0..config.crtc_count())
                .map(|idx| Arc::new(CrtcState::new(CrtcIndex(idx as u8))))
                .collect(),
            planes: backends
                .planes
                .iter()
                .map(|p| (p.id, Arc::new(PlaneState::new(p.id))))
                .collect(),
            connectors: backends
                .connectors
                .iter()
                .map(|c| (c.id, Arc::new(ConnectorState::new(c.id, c.kind))))
                .collect(),
        };

        let (events, notifier) = event::event_channel(config.crtc_count());
        let events = Arc::new(events);
        let recovery = RecoveryHandler::spawn(backends.crtcs.clone(), events.clone())
            .map_err(|err| Error::access("Failed to spawn the recovery thread", Box::new(err)))?;
        let schedulers = Schedulers::spawn(config.crtc_count(), config.shared_queue_workers, config.worker_priority)
            .map_err(|err| Error::access("Failed to spawn the commit workers", Box::new(err)))?;

        info!(
            planes = backends.planes.len(),
            connectors = backends.connectors.len(),
            dual_blender = ?config.dual_blender,
            "Attached dpu"
        );
        drop(_guard);

        let inner = DeviceInner {
            allocator: WindowAllocator::new(config.window_count),
            live: RwLock::new(live),
            swap: Mutex::new(SwapState::new(config.crtc_count())),
            bw_tables: Mutex::new(vec![WindowConfigTable::default(); config.crtc_count()]),
            pending_writeback: Mutex::new(IndexMap::new()),
            events,
            recovery,
            schedulers,
            tui: (0..config.crtc_count()).map(|_| AtomicBool::new(false)).collect(),
            detached: AtomicBool::new(false),
            backends,
            config,
            span,
        };
        Ok((
            DpuDevice {
                inner: Arc::new(inner),
            },
            notifier,
        ))
    }

    /// Capabilities of the device
    pub fn config(&self) -> &DpuConfig {
        &self.inner.config
    }

    /// Start a new transaction
    pub fn begin(&self, flags: CommitFlags) -> Result<AtomicState, Error> {
        if self.inner.is_detached() {
            return Err(Error::DeviceDetached);
        }
        Ok(AtomicState::new(self.inner.clone(), flags))
    }

    /// Validate a transaction
    ///
    /// On success the windows needed by the transaction are reserved until the returned
    /// [`CheckedTransaction`] is committed or dropped.
    #[instrument(level = "debug", parent = &self.inner.span, skip(self, state))]
    pub fn check(&self, mut state: AtomicState) -> Result<CheckedTransaction, Error> {
        if self.inner.is_detached() {
            return Err(Error::DeviceDetached);
        }
        if !Arc::ptr_eq(&state.device, &self.inner) {
            return Err(Error::UnknownObject("transaction of another device".into()));
        }
        check::check(&mut state)?;
        trace!(?state, "Transaction checked");
        Ok(CheckedTransaction(state))
    }

    /// Make a checked transaction the live state and program the hardware
    ///
    /// A blocking commit returns once the hardware finished the commit, a non-blocking one as
    /// soon as the state was swapped in. Errors are only returned for failures before the
    /// swap, in which case the device state is unchanged.
    pub fn commit(&self, checked: CheckedTransaction, nonblock: bool) -> Result<CommitHandle, Error> {
        if !Arc::ptr_eq(&checked.device, &self.inner) {
            return Err(Error::UnknownObject("transaction of another device".into()));
        }
        commit::commit(&self.inner, checked, nonblock)
    }

    /// Current state of a crtc
    pub fn crtc_state(&self, crtc: CrtcIndex) -> Option<Arc<CrtcState>> {
        self.inner.live.read().unwrap().crtcs.get(crtc.0 as usize).cloned()
    }

    /// Current state of a plane
    pub fn plane_state(&self, plane: PlaneId) -> Option<Arc<PlaneState>> {
        self.inner.live.read().unwrap().planes.get(&plane).cloned()
    }

    /// Current state of a connector
    pub fn connector_state(&self, connector: ConnectorId) -> Option<Arc<ConnectorState>> {
        self.inner.live.read().unwrap().connectors.get(&connector).cloned()
    }

    /// Windows currently not reserved by any crtc
    pub fn available_windows(&self) -> WindowMask {
        self.inner.allocator.available()
    }

    /// Window configuration currently programmed for a crtc
    pub fn window_config(&self, crtc: CrtcIndex) -> Option<WindowConfigTable> {
        self.inner.bw_tables.lock().unwrap().get(crtc.0 as usize).cloned()
    }

    /// Hand a crtc to or take it back from a trusted UI session
    ///
    /// Transactions touching the crtc are rejected while the session owns it.
    pub fn set_tui(&self, crtc: CrtcIndex, active: bool) {
        if let Some(tui) = self.inner.tui.get(crtc.0 as usize) {
            debug!(parent: &self.inner.span, ?crtc, active, "Trusted UI state changed");
            tui.store(active, Ordering::Release);
        }
    }

    /// Whether a writeback job is queued on the connector
    pub fn writeback_pending(&self, connector: ConnectorId) -> bool {
        self.inner.pending_writeback.lock().unwrap().contains_key(&connector)
    }

    /// Mark the writeback job of a connector as captured
    ///
    /// Releases the capture buffer.
    pub fn writeback_done(&self, connector: ConnectorId) {
        if let Some(fb) = self.inner.pending_writeback.lock().unwrap().shift_remove(&connector) {
            trace!(parent: &self.inner.span, ?connector, "Writeback finished");
            fb.cleanup();
        }
    }

    /// Detach from the device
    ///
    /// Finishes all queued commits and stops the worker threads.
    pub fn detach(&self) {
        if self.inner.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.inner.span.enter();
        self.inner.schedulers.shutdown();
        self.inner.recovery.shutdown();
        info!("Detached dpu");
    }
}

impl Drop for DpuDevice {
    fn drop(&mut self) {
        self.detach();
    }
}
