//! Interfaces of the hardware blocks driven by the commit pipeline
//!
//! Register programming of the individual display blocks is not part of this crate. Each
//! kind of block is represented by a trait, implementations are handed to
//! [`DpuDevice::attach`](super::DpuDevice::attach) through [`Backends`] and only ever called
//! through these traits.
//!
//! All backends are shared between the committing thread and the commit workers and must
//! therefore be [`Send`] and [`Sync`].

use std::{fmt, sync::Arc, time::Duration};

use downcast_rs::{impl_downcast, Downcast};
use drm_fourcc::DrmFourcc;

use crate::utils::{Buffer, Size};

use super::{
    error::BackendError,
    state::{ConnectorId, ConnectorKind, CrtcIndex, Mode, PlaneId, PlaneState},
    window::{WindowConfig, WindowConfigTable},
};

/// A buffer that can be scanned out by a plane or captured into by writeback
pub trait Framebuffer: fmt::Debug + Send + Sync + Downcast {
    /// Pixel format of the buffer
    fn format(&self) -> DrmFourcc;

    /// Dimensions of the buffer
    fn size(&self) -> Size<Buffer>;

    /// Whether the buffer is stored compressed
    fn compressed(&self) -> bool {
        false
    }

    /// Whether the buffer holds protected content
    fn protected(&self) -> bool {
        false
    }

    /// Pin the buffer for scanout
    fn prepare(&self) -> Result<(), BackendError>;

    /// Release a pin taken by [`Framebuffer::prepare`]
    fn cleanup(&self);
}
impl_downcast!(Framebuffer);

/// Trigger state of a command-mode crtc
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerState {
    /// Frames are started by the hardware trigger
    Unmask,
    /// The hardware trigger is suppressed
    Mask,
}

/// Reason a recovery of a crtc was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryReason {
    /// No vblank arrived within the hard timeout
    VblankTimeout,
    /// The frame did not start within the hard timeout
    FramestartTimeout,
}

/// Phases of the link reset sequence run while enabling an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkPhase {
    /// Low power idle reset
    Lpi,
    /// Low power 11 reset
    Lp11,
    /// Transition to high speed mode
    HsTransition,
}

impl LinkPhase {
    /// Phases in the order they are applied
    pub const SEQUENCE: [LinkPhase; 3] = [LinkPhase::Lpi, LinkPhase::Lp11, LinkPhase::HsTransition];
}

/// Memory bandwidth demand of a crtc configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BandwidthRequest {
    /// Peak bandwidth of the most demanding scanline, in kB/s
    pub peak_kbps: u64,
    /// Average bandwidth over a frame, in kB/s
    pub total_kbps: u64,
}

/// Hardware plane (DPP) block
pub trait PlaneBackend: Send + Sync {
    /// Validate format, scaling and rotation of a plane state on a crtc running `mode`
    fn check(&self, state: &PlaneState, mode: &Mode) -> Result<(), &'static str>;

    /// Program the window feeding this plane
    fn update(&self, config: &WindowConfig) -> Result<(), BackendError>;

    /// Stop scanning out this plane
    fn disable(&self) -> Result<(), BackendError>;
}

/// Crtc (DECON) block
pub trait CrtcBackend: Send + Sync {
    /// Power up the timing generator with the given mode
    fn enable(&self, mode: &Mode) -> Result<(), BackendError>;

    /// Power down the timing generator
    fn disable(&self) -> Result<(), BackendError>;

    /// Start a shadow register update
    fn atomic_begin(&self);

    /// Finish a shadow register update, latching it at the next frame start
    fn atomic_flush(&self);

    /// Whether the crtc produces vblank interrupts in its current configuration
    fn has_vblank(&self) -> bool;

    /// Current vblank counter
    fn vblank_count(&self) -> u64;

    /// Wait until the vblank counter moved past `since`
    ///
    /// Returns `false` if the timeout expired first.
    fn wait_vblank(&self, since: u64, timeout: Duration) -> bool;

    /// Wait until the hardware latched the flushed configuration
    ///
    /// Returns `false` if the timeout expired first.
    fn wait_framestart(&self, timeout: Duration) -> bool;

    /// Mask or unmask the frame trigger
    fn set_trigger(&self, state: TriggerState);

    /// Whether a recovery of this crtc is in progress
    fn is_recovering(&self) -> bool;

    /// Reset the crtc after a failure
    fn recover(&self, reason: RecoveryReason) -> Result<(), BackendError>;

    /// Inform the bandwidth scheduler about a new refresh rate
    fn update_bts_fps(&self, refresh: u32);

    /// Arm the self-vsync detection for the next frame
    fn check_svsync_start(&self);

    /// Dump the state of the block for diagnostics
    fn dump(&self) {}
}

/// Encoder and bridge chain in front of a connector
pub trait EncoderBackend: Send + Sync {
    /// Whether the sink accepts the mode
    fn mode_valid(&self, mode: &Mode) -> bool;

    /// Whether switching from `old` to `new` is possible without a full modeset
    fn supports_seamless(&self, _old: &Mode, _new: &Mode) -> bool {
        false
    }

    /// Prepare the link before the crtc starts
    fn pre_enable(&self) -> Result<(), BackendError>;

    /// Run one phase of the link reset sequence
    fn reset_link(&self, phase: LinkPhase) -> Result<(), BackendError>;

    /// Start transmitting
    fn enable(&self) -> Result<(), BackendError>;

    /// Stop transmitting
    fn disable(&self) -> Result<(), BackendError>;

    /// Power down the link after the crtc stopped
    fn post_disable(&self) -> Result<(), BackendError>;
}

/// Bandwidth (BTS) accounting
pub trait BandwidthBackend: Send + Sync {
    /// Compute the demand of a window configuration
    fn calc_bw(&self, crtc: CrtcIndex, table: &WindowConfigTable, mode: &Mode) -> Result<BandwidthRequest, BackendError>;

    /// Apply the demand of a crtc
    ///
    /// Called with `post_commit == false` before the planes are programmed, raising the
    /// bandwidth if needed, and with `true` once the frame started, lowering it again.
    fn update_bw(&self, crtc: CrtcIndex, request: &BandwidthRequest, post_commit: bool);

    /// Drop all demand of a disabled crtc
    fn release_bw(&self, crtc: CrtcIndex);
}

/// Display hibernation control
pub trait HibernationBackend: Send + Sync {
    /// Keep the crtc out of hibernation
    fn block(&self, crtc: CrtcIndex);

    /// Allow the crtc to hibernate again
    fn unblock(&self, crtc: CrtcIndex);

    /// Restart the idle timer after a frame
    fn trig_reset(&self, crtc: CrtcIndex);
}

/// Link clock frequency hopping
pub trait FreqHopBackend: Send + Sync {
    /// Switch the hop request of a crtc on or off
    fn set_freq_hop(&self, crtc: CrtcIndex, enable: bool);

    /// Request a new link clock frequency in kHz
    fn update_freq_hop(&self, crtc: CrtcIndex, khz: u32) -> Result<(), BackendError>;
}

/// A plane of the device
#[derive(Clone)]
pub struct PlaneDescriptor {
    /// Handle of the plane
    pub id: PlaneId,
    /// Crtcs the plane can feed
    pub possible_crtcs: Vec<CrtcIndex>,
    /// Hardware block of the plane
    pub backend: Arc<dyn PlaneBackend>,
}

/// A connector of the device
#[derive(Clone)]
pub struct ConnectorDescriptor {
    /// Handle of the connector
    pub id: ConnectorId,
    /// Kind of the connector
    pub kind: ConnectorKind,
    /// Crtcs the connector can be driven by
    pub possible_crtcs: Vec<CrtcIndex>,
    /// Encoder in front of the connector
    pub encoder: Arc<dyn EncoderBackend>,
}

/// All hardware blocks of a device
#[derive(Clone)]
pub struct Backends {
    /// Crtc blocks, indexed by [`CrtcIndex`]
    pub crtcs: Vec<Arc<dyn CrtcBackend>>,
    /// Planes of the device
    pub planes: Vec<PlaneDescriptor>,
    /// Connectors of the device
    pub connectors: Vec<ConnectorDescriptor>,
    /// Bandwidth accounting
    pub bandwidth: Arc<dyn BandwidthBackend>,
    /// Hibernation control
    pub hibernation: Arc<dyn HibernationBackend>,
    /// Frequency hopping, if the links support it
    pub freq_hop: Option<Arc<dyn FreqHopBackend>>,
}

impl fmt::Debug for PlaneDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaneDescriptor")
            .field("id", &self.id)
            .field("possible_crtcs", &self.possible_crtcs)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for ConnectorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("possible_crtcs", &self.possible_crtcs)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends")
            .field("crtcs", &self.crtcs.len())
            .field("planes", &self.planes.iter().map(|p| p.id).collect::<Vec<_>>())
            .field(
                "connectors",
                &self.connectors.iter().map(|c| (c.id, c.kind)).collect::<Vec<_>>(),
            )
            .field("freq_hop", &self.freq_hop.is_some())
            .finish_non_exhaustive()
    }
}

impl Backends {
    pub(crate) fn crtc(&self, crtc: CrtcIndex) -> Option<&Arc<dyn CrtcBackend>> {
        self.crtcs.get(crtc.0 as usize)
    }

    pub(crate) fn plane(&self, plane: PlaneId) -> Option<&PlaneDescriptor> {
        self.planes.iter().find(|p| p.id == plane)
    }

    pub(crate) fn connector(&self, connector: ConnectorId) -> Option<&ConnectorDescriptor> {
        self.connectors.iter().find(|c| c.id == connector)
    }
}
