//! Transaction state of the display pipeline
//!
//! An [`AtomicState`] collects the desired state of every crtc, plane and connector touched
//! by one update. Objects enter the transaction by duplicating the live state of the device,
//! the previous live state is kept next to the new one for the whole lifetime of the
//! transaction.
//!
//! A transaction moves through three stages, each represented by its own type:
//!
//! - [`AtomicState`] is mutable and owned by the caller while it is built and checked,
//! - [`CheckedTransaction`] is the result of a successful [`DpuDevice::check`](super::DpuDevice::check)
//!   and the only thing [`DpuDevice::commit`](super::DpuDevice::commit) accepts,
//! - [`CommittedTransaction`] is immutable and shared between the caller and the worker
//!   executing the commit once the state has been swapped in.

use std::{
    fmt,
    sync::{atomic::AtomicBool, Arc},
};

use bitflags::bitflags;
use indexmap::{map::Entry, IndexMap};
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::utils::{Physical, Rectangle, Serial, Size};

use super::{
    check::CheckStage,
    commit::CommitSignal,
    error::Error,
    hw::Framebuffer,
    window::WindowMask,
    DeviceInner,
};

mod connector;
mod crtc;
mod plane;

pub use self::connector::{ConnectorKind, ConnectorState, WritebackJob};
pub use self::crtc::{CrtcState, CrtcStateFlags, EventRequest};
pub use self::plane::{FenceSlot, PlaneState, SplitSegment};

/// Index of a crtc, doubling as its physical output index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CrtcIndex(pub u8);

/// Handle of a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaneId(pub u8);

/// Handle of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectorId(pub u8);

macro_rules! handle_mask {
    ($(#[$meta:meta])* $name:ident, $handle:ident, $bits:ty) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($bits);

        impl $name {
            /// Mask without any member
            pub const fn empty() -> Self {
                $name(0)
            }

            /// Raw bits of the mask
            pub fn bits(&self) -> $bits {
                self.0
            }

            /// Whether the mask has no members
            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            /// Number of members
            pub fn count(&self) -> u32 {
                self.0.count_ones()
            }

            /// Whether the handle is a member
            pub fn contains(&self, handle: $handle) -> bool {
                (handle.0 as u32) < <$bits>::BITS && self.0 & (1 << handle.0) != 0
            }

            /// Add a member
            pub fn insert(&mut self, handle: $handle) {
                self.0 |= 1 << handle.0;
            }

            /// Remove a member
            pub fn remove(&mut self, handle: $handle) {
                self.0 &= !(1 << handle.0);
            }

            /// Iterate the members in ascending order
            pub fn iter(&self) -> impl Iterator<Item = $handle> {
                let bits = self.0;
                (0..<$bits>::BITS as u8)
                    .filter(move |idx| bits & (1 << idx) != 0)
                    .map($handle)
            }
        }

        impl FromIterator<$handle> for $name {
            fn from_iter<I: IntoIterator<Item = $handle>>(iter: I) -> Self {
                let mut mask = $name::empty();
                for handle in iter {
                    mask.insert(handle);
                }
                mask
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_set().entries(self.iter().map(|h| h.0)).finish()
            }
        }
    };
}

handle_mask!(
    /// Set of planes, indexed by [`PlaneId`]
    PlaneMask,
    PlaneId,
    u64
);
handle_mask!(
    /// Set of connectors, indexed by [`ConnectorId`]
    ConnectorMask,
    ConnectorId,
    u32
);

/// Display timing of a crtc
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mode {
    /// Horizontal active pixels
    pub hdisplay: u16,
    /// Vertical active lines
    pub vdisplay: u16,
    /// Refresh rate in Hz, `0` if unknown
    pub vrefresh: u32,
}

impl Mode {
    /// Create a new mode
    pub const fn new(hdisplay: u16, vdisplay: u16, vrefresh: u32) -> Self {
        Mode {
            hdisplay,
            vdisplay,
            vrefresh,
        }
    }

    /// Active area of the mode
    pub fn size(&self) -> Size<Physical> {
        Size::new(self.hdisplay as i32, self.vdisplay as i32)
    }

    /// Active area of the mode, located at the origin
    pub fn rect(&self) -> Rectangle<Physical> {
        Rectangle::from_size(self.size())
    }

    /// Whether the mode describes a scannable frame
    pub fn is_valid(&self) -> bool {
        self.hdisplay > 0 && self.vdisplay > 0
    }

    /// Refresh rate, substituting `default` for modes reporting zero
    pub fn refresh_or(&self, default: u32) -> u32 {
        if self.vrefresh == 0 {
            default
        } else {
            self.vrefresh
        }
    }

    /// Whether both modes have the same active area
    pub fn same_resolution(&self, other: &Mode) -> bool {
        self.hdisplay == other.hdisplay && self.vdisplay == other.vdisplay
    }
}

bitflags! {
    /// Flags of a transaction
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommitFlags: u32 {
        /// The transaction may perform full modesets
        const ALLOW_MODESET = 1 << 0;
        /// The transaction only moves the cursor, vblank waits are skipped
        const LEGACY_CURSOR = 1 << 1;
    }
}

/// Live state of all objects of a device
#[derive(Debug, Clone)]
pub(crate) struct LiveState {
    pub crtcs: Vec<Arc<CrtcState>>,
    pub planes: IndexMap<PlaneId, Arc<PlaneState>>,
    pub connectors: IndexMap<ConnectorId, Arc<ConnectorState>>,
}

/// Old and new state of one object inside a transaction being built
#[derive(Debug)]
pub(crate) struct Transition<T> {
    pub old: Arc<T>,
    pub new: T,
}

/// A display transaction being built or checked
///
/// Created by [`DpuDevice::begin`](super::DpuDevice::begin). Windows reserved while checking
/// belong to the transaction and are returned to the pool if it is dropped without being
/// committed.
pub struct AtomicState {
    pub(crate) device: Arc<DeviceInner>,
    pub(crate) flags: CommitFlags,
    pub(crate) crtcs: IndexMap<CrtcIndex, Transition<CrtcState>>,
    pub(crate) planes: IndexMap<PlaneId, Transition<PlaneState>>,
    pub(crate) connectors: IndexMap<ConnectorId, Transition<ConnectorState>>,
    pub(crate) stage: CheckStage,
    pub(crate) reservations: SmallVec<[(CrtcIndex, WindowMask); 4]>,
}

impl fmt::Debug for AtomicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicState")
            .field("flags", &self.flags)
            .field("crtcs", &self.crtcs.keys().collect::<Vec<_>>())
            .field("planes", &self.planes.keys().collect::<Vec<_>>())
            .field("connectors", &self.connectors.keys().collect::<Vec<_>>())
            .field("stage", &self.stage)
            .field("reservations", &self.reservations)
            .finish()
    }
}

impl AtomicState {
    pub(crate) fn new(device: Arc<DeviceInner>, flags: CommitFlags) -> Self {
        AtomicState {
            device,
            flags,
            crtcs: IndexMap::new(),
            planes: IndexMap::new(),
            connectors: IndexMap::new(),
            stage: CheckStage::Init,
            reservations: SmallVec::new(),
        }
    }

    /// Flags of this transaction
    pub fn flags(&self) -> CommitFlags {
        self.flags
    }

    /// Replace the flags of this transaction
    pub fn set_flags(&mut self, flags: CommitFlags) {
        self.flags = flags;
    }

    /// Stage the check pipeline reached for this transaction
    pub fn stage(&self) -> CheckStage {
        self.stage
    }

    /// Crtcs part of this transaction
    pub fn crtcs(&self) -> impl Iterator<Item = CrtcIndex> + '_ {
        self.crtcs.keys().copied()
    }

    /// Planes part of this transaction
    pub fn planes(&self) -> impl Iterator<Item = PlaneId> + '_ {
        self.planes.keys().copied()
    }

    /// Connectors part of this transaction
    pub fn connectors(&self) -> impl Iterator<Item = ConnectorId> + '_ {
        self.connectors.keys().copied()
    }

    /// Get the new state of a crtc, adding it to the transaction if necessary
    pub fn crtc_state_mut(&mut self, crtc: CrtcIndex) -> Result<&mut CrtcState, Error> {
        match self.crtcs.entry(crtc) {
            Entry::Occupied(entry) => Ok(&mut entry.into_mut().new),
            Entry::Vacant(entry) => {
                let old = self
                    .device
                    .live
                    .read()
                    .unwrap()
                    .crtcs
                    .get(crtc.0 as usize)
                    .cloned()
                    .ok_or_else(|| Error::UnknownObject(format!("{:?}", crtc)))?;
                trace!(?crtc, "Adding crtc to transaction");
                let new = old.duplicate();
                Ok(&mut entry.insert(Transition { old, new }).new)
            }
        }
    }

    /// Get the new state of a plane, adding it to the transaction if necessary
    pub fn plane_state_mut(&mut self, plane: PlaneId) -> Result<&mut PlaneState, Error> {
        match self.planes.entry(plane) {
            Entry::Occupied(entry) => Ok(&mut entry.into_mut().new),
            Entry::Vacant(entry) => {
                let old = self
                    .device
                    .live
                    .read()
                    .unwrap()
                    .planes
                    .get(&plane)
                    .cloned()
                    .ok_or_else(|| Error::UnknownObject(format!("{:?}", plane)))?;
                trace!(?plane, "Adding plane to transaction");
                let new = old.duplicate();
                Ok(&mut entry.insert(Transition { old, new }).new)
            }
        }
    }

    /// Get the new state of a connector, adding it to the transaction if necessary
    pub fn connector_state_mut(&mut self, connector: ConnectorId) -> Result<&mut ConnectorState, Error> {
        match self.connectors.entry(connector) {
            Entry::Occupied(entry) => Ok(&mut entry.into_mut().new),
            Entry::Vacant(entry) => {
                let old = self
                    .device
                    .live
                    .read()
                    .unwrap()
                    .connectors
                    .get(&connector)
                    .cloned()
                    .ok_or_else(|| Error::UnknownObject(format!("{:?}", connector)))?;
                trace!(?connector, "Adding connector to transaction");
                let new = old.duplicate();
                Ok(&mut entry.insert(Transition { old, new }).new)
            }
        }
    }

    /// New state of a crtc, if part of the transaction
    pub fn crtc_state(&self, crtc: CrtcIndex) -> Option<&CrtcState> {
        self.crtcs.get(&crtc).map(|t| &t.new)
    }

    /// Previous state of a crtc, if part of the transaction
    pub fn old_crtc_state(&self, crtc: CrtcIndex) -> Option<&CrtcState> {
        self.crtcs.get(&crtc).map(|t| &*t.old)
    }

    /// New state of a plane, if part of the transaction
    pub fn plane_state(&self, plane: PlaneId) -> Option<&PlaneState> {
        self.planes.get(&plane).map(|t| &t.new)
    }

    /// Previous state of a plane, if part of the transaction
    pub fn old_plane_state(&self, plane: PlaneId) -> Option<&PlaneState> {
        self.planes.get(&plane).map(|t| &*t.old)
    }

    /// New state of a connector, if part of the transaction
    pub fn connector_state(&self, connector: ConnectorId) -> Option<&ConnectorState> {
        self.connectors.get(&connector).map(|t| &t.new)
    }

    /// Bind a plane to a crtc, or unbind it with `None`
    ///
    /// Both the previous and the new crtc are added to the transaction.
    pub fn set_plane_crtc(&mut self, plane: PlaneId, crtc: Option<CrtcIndex>) -> Result<(), Error> {
        let previous = self.plane_state_mut(plane)?.crtc;
        if previous == crtc {
            return Ok(());
        }
        // resolve the new crtc first, an unknown one must leave the transaction untouched
        if let Some(crtc) = crtc {
            self.crtc_state_mut(crtc)?;
        }
        if let Some(previous) = previous {
            let state = self.crtc_state_mut(previous)?;
            state.plane_mask.remove(plane);
            state.planes_changed = true;
        }
        if let Some(crtc) = crtc {
            let state = self.crtc_state_mut(crtc)?;
            state.plane_mask.insert(plane);
            state.planes_changed = true;
        }
        self.plane_state_mut(plane)?.crtc = crtc;
        Ok(())
    }

    /// Bind a connector to a crtc, or unbind it with `None`
    ///
    /// Both the previous and the new crtc are added to the transaction.
    pub fn set_connector_crtc(&mut self, connector: ConnectorId, crtc: Option<CrtcIndex>) -> Result<(), Error> {
        let previous = self.connector_state_mut(connector)?.crtc;
        if previous == crtc {
            return Ok(());
        }
        // resolve the new crtc first, an unknown one must leave the transaction untouched
        if let Some(crtc) = crtc {
            self.crtc_state_mut(crtc)?;
        }
        if let Some(previous) = previous {
            let state = self.crtc_state_mut(previous)?;
            state.connector_mask.remove(connector);
            state.connectors_changed = true;
        }
        if let Some(crtc) = crtc {
            let state = self.crtc_state_mut(crtc)?;
            state.connector_mask.insert(connector);
            state.connectors_changed = true;
        }
        self.connector_state_mut(connector)?.crtc = crtc;
        Ok(())
    }

    /// New states of the planes bound to a crtc that are part of the transaction
    pub(crate) fn planes_on(&self, crtc: CrtcIndex) -> impl Iterator<Item = &PlaneState> + '_ {
        let mask = self.crtcs.get(&crtc).map(|t| t.new.plane_mask).unwrap_or_default();
        self.planes
            .values()
            .map(|t| &t.new)
            .filter(move |p| mask.contains(p.plane))
    }

    /// Return windows reserved by a check that never got committed
    pub(crate) fn release_reservations(&mut self) {
        for (crtc, mask) in self.reservations.drain(..) {
            trace!(?crtc, ?mask, "Returning tentatively reserved windows");
            self.device.allocator.release(mask);
        }
    }
}

impl Drop for AtomicState {
    fn drop(&mut self) {
        if !self.reservations.is_empty() {
            warn!(
                reservations = ?self.reservations,
                "Dropping transaction that still holds windows, returning them"
            );
            self.release_reservations();
        }
    }
}

/// A transaction that passed [`DpuDevice::check`](super::DpuDevice::check)
#[derive(Debug)]
pub struct CheckedTransaction(pub(crate) AtomicState);

impl std::ops::Deref for CheckedTransaction {
    type Target = AtomicState;

    fn deref(&self) -> &AtomicState {
        &self.0
    }
}

/// Old and new state of one object of a committed transaction
#[derive(Debug, Clone)]
pub(crate) struct Committed<T> {
    pub old: Arc<T>,
    pub new: Arc<T>,
}

/// A transaction that became the live state of the device
///
/// Shared between the committing thread and the worker running the commit tail; the last
/// reference keeps all old states (and thereby the framebuffers they pin) alive.
#[derive(Debug)]
pub struct CommittedTransaction {
    pub(crate) serial: Serial,
    pub(crate) flags: CommitFlags,
    pub(crate) crtcs: IndexMap<CrtcIndex, Committed<CrtcState>>,
    pub(crate) planes: IndexMap<PlaneId, Committed<PlaneState>>,
    pub(crate) connectors: IndexMap<ConnectorId, Committed<ConnectorState>>,
    pub(crate) signals: IndexMap<CrtcIndex, Arc<CommitSignal>>,
    pub(crate) fake_commit: Option<Arc<CommitSignal>>,
    pub(crate) abandoned_writeback: Vec<Arc<dyn Framebuffer>>,
    pub(crate) tail_started: AtomicBool,
}

impl CommittedTransaction {
    /// Serial of the commit
    pub fn serial(&self) -> Serial {
        self.serial
    }

    /// Flags the transaction was committed with
    pub fn flags(&self) -> CommitFlags {
        self.flags
    }

    /// Crtcs touched by the commit
    pub fn crtcs(&self) -> impl Iterator<Item = CrtcIndex> + '_ {
        self.crtcs.keys().copied()
    }

    /// New state of a crtc of this commit
    pub fn crtc_state(&self, crtc: CrtcIndex) -> Option<&CrtcState> {
        self.crtcs.get(&crtc).map(|c| &*c.new)
    }

    /// Previous state of a crtc of this commit
    pub fn old_crtc_state(&self, crtc: CrtcIndex) -> Option<&CrtcState> {
        self.crtcs.get(&crtc).map(|c| &*c.old)
    }

    /// New state of a plane of this commit
    pub fn plane_state(&self, plane: PlaneId) -> Option<&PlaneState> {
        self.planes.get(&plane).map(|p| &*p.new)
    }

    /// New state of a connector of this commit
    pub fn connector_state(&self, connector: ConnectorId) -> Option<&ConnectorState> {
        self.connectors.get(&connector).map(|c| &*c.new)
    }
}

impl Drop for CommittedTransaction {
    fn drop(&mut self) {
        trace!(serial = %self.serial, "Releasing committed transaction");
    }
}
