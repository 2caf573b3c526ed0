use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use dpu_atomic::{
    backend::dpu::{
        hw::{
            BandwidthBackend, BandwidthRequest, Backends, ConnectorDescriptor, CrtcBackend, EncoderBackend,
            Framebuffer, HibernationBackend, LinkPhase, PlaneBackend, PlaneDescriptor, RecoveryReason,
            TriggerState,
        },
        state::{ConnectorId, ConnectorKind, CrtcIndex, Mode, PlaneId, PlaneState},
        window::{WindowConfig, WindowConfigTable},
        BackendError,
    },
    utils::{Buffer, Size},
};
use dpu_atomic::reexports::drm_fourcc::DrmFourcc;
use tracing::{debug, info, trace};

#[derive(Debug)]
pub struct SimFramebuffer {
    pub name: String,
    pub size: Size<Buffer>,
    pins: AtomicUsize,
}

impl SimFramebuffer {
    pub fn new(name: impl Into<String>, size: Size<Buffer>) -> Arc<SimFramebuffer> {
        Arc::new(SimFramebuffer {
            name: name.into(),
            size,
            pins: AtomicUsize::new(0),
        })
    }
}

impl Framebuffer for SimFramebuffer {
    fn format(&self) -> DrmFourcc {
        DrmFourcc::Xrgb8888
    }

    fn size(&self) -> Size<Buffer> {
        self.size
    }

    fn prepare(&self) -> Result<(), BackendError> {
        let pins = self.pins.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(fb = %self.name, pins, "pinned");
        Ok(())
    }

    fn cleanup(&self) {
        let pins = self.pins.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(fb = %self.name, pins, "unpinned");
    }
}

/// Timing generator producing a vblank every frame period
#[derive(Debug)]
struct SimCrtc {
    crtc: CrtcIndex,
    refresh: Mutex<u32>,
    vblanks: AtomicU64,
}

impl SimCrtc {
    fn frame(&self) -> Duration {
        Duration::from_micros(1_000_000 / (*self.refresh.lock().unwrap()).max(1) as u64)
    }
}

impl CrtcBackend for SimCrtc {
    fn enable(&self, mode: &Mode) -> Result<(), BackendError> {
        info!(crtc = ?self.crtc, ?mode, "timing generator on");
        *self.refresh.lock().unwrap() = mode.vrefresh;
        Ok(())
    }

    fn disable(&self) -> Result<(), BackendError> {
        info!(crtc = ?self.crtc, "timing generator off");
        Ok(())
    }

    fn atomic_begin(&self) {}

    fn atomic_flush(&self) {
        trace!(crtc = ?self.crtc, "shadow registers latched");
    }

    fn has_vblank(&self) -> bool {
        true
    }

    fn vblank_count(&self) -> u64 {
        self.vblanks.load(Ordering::Acquire)
    }

    fn wait_vblank(&self, _since: u64, timeout: Duration) -> bool {
        let frame = self.frame();
        if frame > timeout {
            return false;
        }
        thread::sleep(frame);
        self.vblanks.fetch_add(1, Ordering::AcqRel);
        true
    }

    fn wait_framestart(&self, _timeout: Duration) -> bool {
        true
    }

    fn set_trigger(&self, state: TriggerState) {
        trace!(crtc = ?self.crtc, ?state, "trigger");
    }

    fn is_recovering(&self) -> bool {
        false
    }

    fn recover(&self, reason: RecoveryReason) -> Result<(), BackendError> {
        info!(crtc = ?self.crtc, ?reason, "reset");
        Ok(())
    }

    fn update_bts_fps(&self, refresh: u32) {
        *self.refresh.lock().unwrap() = refresh;
    }

    fn check_svsync_start(&self) {}
}

#[derive(Debug)]
struct SimPlane(PlaneId);

impl PlaneBackend for SimPlane {
    fn check(&self, state: &PlaneState, _mode: &Mode) -> Result<(), &'static str> {
        if state.src.size.w > 4096 || state.src.size.h > 4096 {
            return Err("source exceeds line buffer");
        }
        Ok(())
    }

    fn update(&self, config: &WindowConfig) -> Result<(), BackendError> {
        trace!(plane = ?self.0, window = ?config.window, dst = ?config.dst, "plane update");
        Ok(())
    }

    fn disable(&self) -> Result<(), BackendError> {
        trace!(plane = ?self.0, "plane off");
        Ok(())
    }
}

#[derive(Debug)]
struct SimPanel(ConnectorId);

impl EncoderBackend for SimPanel {
    fn mode_valid(&self, mode: &Mode) -> bool {
        mode.vrefresh <= 120
    }

    fn supports_seamless(&self, old: &Mode, new: &Mode) -> bool {
        old.same_resolution(new)
    }

    fn pre_enable(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn reset_link(&self, phase: LinkPhase) -> Result<(), BackendError> {
        debug!(connector = ?self.0, ?phase, "link reset");
        Ok(())
    }

    fn enable(&self) -> Result<(), BackendError> {
        info!(connector = ?self.0, "panel on");
        Ok(())
    }

    fn disable(&self) -> Result<(), BackendError> {
        info!(connector = ?self.0, "panel off");
        Ok(())
    }

    fn post_disable(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[derive(Debug)]
struct SimBandwidth;

impl BandwidthBackend for SimBandwidth {
    fn calc_bw(&self, _crtc: CrtcIndex, table: &WindowConfigTable, mode: &Mode) -> Result<BandwidthRequest, BackendError> {
        let per_frame: u64 = table
            .windows
            .iter()
            .map(|w| w.dst.size.w.max(0) as u64 * w.dst.size.h.max(0) as u64 * 4)
            .sum();
        let total_kbps = per_frame * mode.vrefresh.max(1) as u64 / 1000;
        Ok(BandwidthRequest {
            peak_kbps: total_kbps,
            total_kbps,
        })
    }

    fn update_bw(&self, crtc: CrtcIndex, request: &BandwidthRequest, post_commit: bool) {
        trace!(?crtc, ?request, post_commit, "bandwidth");
    }

    fn release_bw(&self, crtc: CrtcIndex) {
        trace!(?crtc, "bandwidth released");
    }
}

#[derive(Debug)]
struct SimHibernation;

impl HibernationBackend for SimHibernation {
    fn block(&self, _crtc: CrtcIndex) {}

    fn unblock(&self, _crtc: CrtcIndex) {}

    fn trig_reset(&self, _crtc: CrtcIndex) {}
}

/// Backends of a simulated device with one panel per crtc
pub fn backends(crtcs: usize, planes: u8) -> Backends {
    let all = (0..crtcs).map(|idx| CrtcIndex(idx as u8)).collect::<Vec<_>>();
    Backends {
        crtcs: all
            .iter()
            .map(|crtc| {
                Arc::new(SimCrtc {
                    crtc: *crtc,
                    refresh: Mutex::new(60),
                    vblanks: AtomicU64::new(0),
                }) as Arc<dyn CrtcBackend>
            })
            .collect(),
        planes: (0..planes)
            .map(|id| PlaneDescriptor {
                id: PlaneId(id),
                possible_crtcs: all.clone(),
                backend: Arc::new(SimPlane(PlaneId(id))),
            })
            .collect(),
        connectors: all
            .iter()
            .map(|crtc| ConnectorDescriptor {
                id: ConnectorId(crtc.0),
                kind: ConnectorKind::Dsi,
                possible_crtcs: vec![*crtc],
                encoder: Arc::new(SimPanel(ConnectorId(crtc.0))),
            })
            .collect(),
        bandwidth: Arc::new(SimBandwidth),
        hibernation: Arc::new(SimHibernation),
        freq_hop: None,
    }
}
