#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use dpu_atomic::reexports::drm_fourcc::DrmFourcc;
use dpu_atomic::{
    backend::dpu::{
        fence::{Fence, Interrupted},
        hw::{
            BandwidthBackend, BandwidthRequest, Backends, ConnectorDescriptor, CrtcBackend, EncoderBackend,
            Framebuffer, FreqHopBackend, HibernationBackend, LinkPhase, PlaneBackend, PlaneDescriptor, RecoveryReason,
            TriggerState,
        },
        state::{AtomicState, ConnectorId, ConnectorKind, CrtcIndex, Mode, PlaneId, PlaneState},
        window::{WindowConfig, WindowConfigTable},
        BackendError, DpuConfig, DpuDevice, DpuDeviceNotifier,
    },
    utils::{Buffer, Rectangle, Size},
};

pub const MODE: Mode = Mode::new(1080, 2400, 60);

pub fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ordered record of all backend calls
#[derive(Debug, Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub fn position(&self, entry: &str) -> usize {
        self.entries()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("`{}` missing from {:#?}", entry, self.entries()))
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|e| e == entry)
    }

    /// Polls until `entry` shows up, returns `false` on timeout
    pub fn wait_for(&self, entry: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.contains(entry) {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }

    /// Asserts that the given entries appear in this order
    pub fn assert_order(&self, entries: &[&str]) {
        let positions = entries.iter().map(|e| self.position(e)).collect::<Vec<_>>();
        assert!(
            positions.windows(2).all(|w| w[0] < w[1]),
            "expected order {:#?}, got {:#?}",
            entries,
            self.entries()
        );
    }
}

#[derive(Debug)]
pub struct MockFb {
    pub protected: bool,
    pub fail_prepare: bool,
    pub pins: AtomicI32,
}

impl MockFb {
    pub fn new() -> Arc<MockFb> {
        Arc::new(MockFb {
            protected: false,
            fail_prepare: false,
            pins: AtomicI32::new(0),
        })
    }

    pub fn protected() -> Arc<MockFb> {
        Arc::new(MockFb {
            protected: true,
            fail_prepare: false,
            pins: AtomicI32::new(0),
        })
    }

    pub fn broken() -> Arc<MockFb> {
        Arc::new(MockFb {
            protected: false,
            fail_prepare: true,
            pins: AtomicI32::new(0),
        })
    }

    pub fn pins(&self) -> i32 {
        self.pins.load(Ordering::SeqCst)
    }
}

impl Framebuffer for MockFb {
    fn format(&self) -> DrmFourcc {
        DrmFourcc::Xrgb8888
    }

    fn size(&self) -> Size<Buffer> {
        Size::new(1080, 2400)
    }

    fn protected(&self) -> bool {
        self.protected
    }

    fn prepare(&self) -> Result<(), BackendError> {
        if self.fail_prepare {
            return Err("out of iommu space".into());
        }
        self.pins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cleanup(&self) {
        self.pins.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockCrtc {
    pub idx: u8,
    pub log: Log,
    pub vblank: AtomicU64,
    pub has_vblank: AtomicBool,
    pub stalled: AtomicBool,
    pub recovering: AtomicBool,
    /// Frame start waits block while this is set
    pub hold_framestart: AtomicBool,
}

impl CrtcBackend for MockCrtc {
    fn enable(&self, mode: &Mode) -> Result<(), BackendError> {
        self.log.push(format!("crtc{}.enable({}x{})", self.idx, mode.hdisplay, mode.vdisplay));
        Ok(())
    }

    fn disable(&self) -> Result<(), BackendError> {
        self.log.push(format!("crtc{}.disable", self.idx));
        Ok(())
    }

    fn atomic_begin(&self) {
        self.log.push(format!("crtc{}.atomic_begin", self.idx));
    }

    fn atomic_flush(&self) {
        self.log.push(format!("crtc{}.atomic_flush", self.idx));
    }

    fn has_vblank(&self) -> bool {
        self.has_vblank.load(Ordering::SeqCst)
    }

    fn vblank_count(&self) -> u64 {
        self.vblank.load(Ordering::SeqCst)
    }

    fn wait_vblank(&self, _since: u64, _timeout: Duration) -> bool {
        self.log.push(format!("crtc{}.wait_vblank", self.idx));
        if self.stalled.load(Ordering::SeqCst) {
            return false;
        }
        self.vblank.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn wait_framestart(&self, _timeout: Duration) -> bool {
        self.log.push(format!("crtc{}.wait_framestart", self.idx));
        while self.hold_framestart.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        !self.stalled.load(Ordering::SeqCst)
    }

    fn set_trigger(&self, state: TriggerState) {
        self.log.push(format!("crtc{}.trigger({:?})", self.idx, state));
    }

    fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    fn recover(&self, reason: RecoveryReason) -> Result<(), BackendError> {
        self.log.push(format!("crtc{}.recover({:?})", self.idx, reason));
        self.stalled.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn update_bts_fps(&self, refresh: u32) {
        self.log.push(format!("crtc{}.bts_fps({})", self.idx, refresh));
    }

    fn check_svsync_start(&self) {
        self.log.push(format!("crtc{}.svsync", self.idx));
    }
}

#[derive(Debug)]
pub struct MockPlane {
    pub id: u8,
    pub log: Log,
}

impl PlaneBackend for MockPlane {
    fn check(&self, _state: &PlaneState, _mode: &Mode) -> Result<(), &'static str> {
        Ok(())
    }

    fn update(&self, config: &WindowConfig) -> Result<(), BackendError> {
        self.log.push(format!("plane{}.update(win{})", self.id, config.window.0));
        Ok(())
    }

    fn disable(&self) -> Result<(), BackendError> {
        self.log.push(format!("plane{}.disable", self.id));
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockEncoder {
    pub id: u8,
    pub log: Log,
    pub seamless: bool,
}

impl EncoderBackend for MockEncoder {
    fn mode_valid(&self, mode: &Mode) -> bool {
        mode.hdisplay <= 4096 && mode.vdisplay <= 4096
    }

    fn supports_seamless(&self, _old: &Mode, _new: &Mode) -> bool {
        self.seamless
    }

    fn pre_enable(&self) -> Result<(), BackendError> {
        self.log.push(format!("enc{}.pre_enable", self.id));
        Ok(())
    }

    fn reset_link(&self, phase: LinkPhase) -> Result<(), BackendError> {
        self.log.push(format!("enc{}.reset({:?})", self.id, phase));
        Ok(())
    }

    fn enable(&self) -> Result<(), BackendError> {
        self.log.push(format!("enc{}.enable", self.id));
        Ok(())
    }

    fn disable(&self) -> Result<(), BackendError> {
        self.log.push(format!("enc{}.disable", self.id));
        Ok(())
    }

    fn post_disable(&self) -> Result<(), BackendError> {
        self.log.push(format!("enc{}.post_disable", self.id));
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockBandwidth {
    pub log: Log,
    pub tables: Mutex<Vec<(CrtcIndex, WindowConfigTable)>>,
}

impl BandwidthBackend for MockBandwidth {
    fn calc_bw(&self, crtc: CrtcIndex, table: &WindowConfigTable, _mode: &Mode) -> Result<BandwidthRequest, BackendError> {
        self.log.push(format!(
            "bw.calc(crtc{}, windows={}, writeback={})",
            crtc.0,
            table.windows.len(),
            table.writeback.is_some()
        ));
        self.tables.lock().unwrap().push((crtc, table.clone()));
        let kbps = table.windows.len() as u64 * 1000;
        Ok(BandwidthRequest {
            peak_kbps: kbps,
            total_kbps: kbps,
        })
    }

    fn update_bw(&self, crtc: CrtcIndex, _request: &BandwidthRequest, post_commit: bool) {
        self.log.push(format!("bw.update(crtc{}, {})", crtc.0, post_commit));
    }

    fn release_bw(&self, crtc: CrtcIndex) {
        self.log.push(format!("bw.release(crtc{})", crtc.0));
    }
}

#[derive(Debug)]
pub struct MockHibernation {
    pub log: Log,
}

impl HibernationBackend for MockHibernation {
    fn block(&self, crtc: CrtcIndex) {
        self.log.push(format!("hib.block(crtc{})", crtc.0));
    }

    fn unblock(&self, crtc: CrtcIndex) {
        self.log.push(format!("hib.unblock(crtc{})", crtc.0));
    }

    fn trig_reset(&self, crtc: CrtcIndex) {
        self.log.push(format!("hib.trig_reset(crtc{})", crtc.0));
    }
}

#[derive(Debug)]
pub struct MockFreqHop {
    pub log: Log,
}

impl FreqHopBackend for MockFreqHop {
    fn set_freq_hop(&self, crtc: CrtcIndex, enable: bool) {
        self.log.push(format!("hop.set(crtc{}, {})", crtc.0, enable));
    }

    fn update_freq_hop(&self, crtc: CrtcIndex, khz: u32) -> Result<(), BackendError> {
        self.log.push(format!("hop.update(crtc{}, {})", crtc.0, khz));
        Ok(())
    }
}

/// Fence that never signals on its own, only the unbounded wait completes it
#[derive(Debug, Default)]
pub struct StalledFence {
    pub signaled: Mutex<bool>,
    pub waits: AtomicI32,
}

/// Shared handle to a [`StalledFence`], attached to plane states
#[derive(Debug, Clone, Default)]
pub struct SharedFence(pub Arc<StalledFence>);

impl Fence for SharedFence {
    fn is_signaled(&self) -> bool {
        *self.0.signaled.lock().unwrap()
    }

    fn wait_timeout(&self, _timeout: Duration) -> Result<bool, Interrupted> {
        self.0.waits.fetch_add(1, Ordering::SeqCst);
        Ok(self.is_signaled())
    }

    fn wait(&self) -> Result<(), Interrupted> {
        self.0.waits.fetch_add(1, Ordering::SeqCst);
        *self.0.signaled.lock().unwrap() = true;
        Ok(())
    }

    fn producer(&self) -> String {
        "gpu-ring-0".into()
    }
}

/// Layout of the simulated device
///
/// Connector 0 is a DSI panel on crtc 0, connector `n` is a DP sink on crtc `n`.
#[derive(Debug, Clone)]
pub struct Layout {
    pub windows: u32,
    pub crtcs: usize,
    pub planes: u8,
    pub dual_blender: Option<CrtcIndex>,
    /// Encoders accept mode switches without a full modeset
    pub seamless: bool,
    /// Adds a writeback connector with the id `crtcs`, possible on every crtc
    pub writeback: bool,
    /// Adds a frequency hopping backend
    pub freq_hop: bool,
}

impl Default for Layout {
    fn default() -> Self {
        Layout {
            windows: 8,
            crtcs: 1,
            planes: 4,
            dual_blender: None,
            seamless: false,
            writeback: false,
            freq_hop: false,
        }
    }
}

#[derive(Debug)]
pub struct Harness {
    pub device: DpuDevice,
    pub notifier: Option<DpuDeviceNotifier>,
    pub log: Log,
    pub crtcs: Vec<Arc<MockCrtc>>,
    pub bandwidth: Arc<MockBandwidth>,
}

impl Harness {
    pub fn new(layout: Layout) -> Harness {
        let mut config = DpuConfig::new(layout.windows, layout.crtcs, layout.dual_blender);
        config.shared_queue_workers = 2;
        Harness::with_config(layout, config)
    }

    pub fn with_config(layout: Layout, config: DpuConfig) -> Harness {
        init_logs();
        let log = Log::default();
        let all_crtcs = (0..layout.crtcs).map(|i| CrtcIndex(i as u8)).collect::<Vec<_>>();

        let crtcs = (0..layout.crtcs)
            .map(|idx| {
                Arc::new(MockCrtc {
                    idx: idx as u8,
                    log: log.clone(),
                    vblank: AtomicU64::new(0),
                    has_vblank: AtomicBool::new(true),
                    stalled: AtomicBool::new(false),
                    recovering: AtomicBool::new(false),
                    hold_framestart: AtomicBool::new(false),
                })
            })
            .collect::<Vec<_>>();
        let planes = (0..layout.planes)
            .map(|id| PlaneDescriptor {
                id: PlaneId(id),
                possible_crtcs: all_crtcs.clone(),
                backend: Arc::new(MockPlane { id, log: log.clone() }),
            })
            .collect();
        let mut connectors = (0..layout.crtcs)
            .map(|idx| ConnectorDescriptor {
                id: ConnectorId(idx as u8),
                kind: if idx == 0 {
                    ConnectorKind::Dsi
                } else {
                    ConnectorKind::DisplayPort
                },
                possible_crtcs: vec![CrtcIndex(idx as u8)],
                encoder: Arc::new(MockEncoder {
                    id: idx as u8,
                    log: log.clone(),
                    seamless: layout.seamless,
                }),
            })
            .collect::<Vec<_>>();
        if layout.writeback {
            connectors.push(ConnectorDescriptor {
                id: ConnectorId(layout.crtcs as u8),
                kind: ConnectorKind::Writeback,
                possible_crtcs: all_crtcs,
                encoder: Arc::new(MockEncoder {
                    id: layout.crtcs as u8,
                    log: log.clone(),
                    seamless: false,
                }),
            });
        }
        let bandwidth = Arc::new(MockBandwidth {
            log: log.clone(),
            tables: Mutex::new(Vec::new()),
        });

        let backends = Backends {
            crtcs: crtcs.iter().map(|c| c.clone() as Arc<dyn CrtcBackend>).collect(),
            planes,
            connectors,
            bandwidth: bandwidth.clone(),
            hibernation: Arc::new(MockHibernation { log: log.clone() }),
            freq_hop: layout
                .freq_hop
                .then(|| Arc::new(MockFreqHop { log: log.clone() }) as Arc<dyn FreqHopBackend>),
        };
        let (device, notifier) = DpuDevice::attach(config, backends).expect("attach");
        Harness {
            device,
            notifier: Some(notifier),
            log,
            crtcs,
            bandwidth,
        }
    }
}

pub fn as_fb(fb: &Arc<MockFb>) -> Arc<dyn Framebuffer> {
    fb.clone()
}

/// Show `fb` fullscreen on `plane` of `crtc`
pub fn show_plane(state: &mut AtomicState, plane: PlaneId, crtc: CrtcIndex, fb: &Arc<MockFb>, zpos: u32) {
    state.set_plane_crtc(plane, Some(crtc)).unwrap();
    let p = state.plane_state_mut(plane).unwrap();
    p.fb = Some(as_fb(fb));
    p.src = Rectangle::from_size((1080, 2400));
    p.dst = Rectangle::from_size((1080, 2400));
    p.zpos = zpos;
}

/// Enable `crtc` with its own connector
pub fn enable_crtc(state: &mut AtomicState, crtc: CrtcIndex) {
    let c = state.crtc_state_mut(crtc).unwrap();
    c.active = true;
    c.mode = MODE;
    state.set_connector_crtc(ConnectorId(crtc.0), Some(crtc)).unwrap();
}
