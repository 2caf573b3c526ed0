use bitflags::bitflags;

use crate::utils::{Physical, Rectangle};

use super::{ConnectorMask, CrtcIndex, Mode, PlaneMask};
use crate::backend::dpu::{
    hw::BandwidthRequest,
    window::{WindowConfigTable, WindowMask},
};

bitflags! {
    /// Per-transaction flags of a crtc state
    ///
    /// These are reset whenever the state is duplicated into a new transaction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CrtcStateFlags: u32 {
        /// Windows were added to the reservation of this crtc during check
        const WIN_INSERTED = 1 << 0;
        /// Nothing visible changes on this crtc, hardware programming is skipped
        const SKIP_UPDATE = 1 << 1;
        /// Normalized zpos was recomputed, window assignment must be re-evaluated
        const ZPOS_CHANGED = 1 << 2;
        /// The mode change is applied without a full modeset
        const SEAMLESS_MODESET = 1 << 3;
    }
}

/// Completion event requested by a client for this crtc
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRequest {
    /// Opaque value handed back with the event
    pub user_data: u64,
}

/// State of a single crtc within a transaction
#[derive(Debug, Clone)]
pub struct CrtcState {
    pub(crate) crtc: CrtcIndex,
    /// Whether the crtc is scanning out
    pub active: bool,
    /// Display mode of the crtc
    pub mode: Mode,
    /// Panel self refresh is currently active
    pub self_refresh_active: bool,
    /// Requested link clock frequency (kHz) for frequency hopping
    pub freq_hop: Option<u32>,
    pub(crate) plane_mask: PlaneMask,
    pub(crate) connector_mask: ConnectorMask,
    pub(crate) reserved_win_mask: WindowMask,
    pub(crate) visible_win_mask: WindowMask,
    pub(crate) freed_win_mask: WindowMask,
    pub(crate) flags: CrtcStateFlags,
    pub(crate) mode_changed: bool,
    pub(crate) active_changed: bool,
    pub(crate) connectors_changed: bool,
    pub(crate) planes_changed: bool,
    pub(crate) partial_region: Option<Rectangle<Physical>>,
    pub(crate) event: Option<EventRequest>,
    pub(crate) bandwidth: Option<BandwidthRequest>,
    pub(crate) window_config: WindowConfigTable,
}

impl CrtcState {
    pub(crate) fn new(crtc: CrtcIndex) -> Self {
        CrtcState {
            crtc,
            active: false,
            mode: Mode::default(),
            self_refresh_active: false,
            freq_hop: None,
            plane_mask: PlaneMask::empty(),
            connector_mask: ConnectorMask::empty(),
            reserved_win_mask: WindowMask::empty(),
            visible_win_mask: WindowMask::empty(),
            freed_win_mask: WindowMask::empty(),
            flags: CrtcStateFlags::empty(),
            mode_changed: false,
            active_changed: false,
            connectors_changed: false,
            planes_changed: false,
            partial_region: None,
            event: None,
            bandwidth: None,
            window_config: WindowConfigTable::default(),
        }
    }

    /// Copy of this state as the starting point of a new transaction
    pub(crate) fn duplicate(&self) -> Self {
        CrtcState {
            freed_win_mask: WindowMask::empty(),
            flags: CrtcStateFlags::empty(),
            mode_changed: false,
            active_changed: false,
            connectors_changed: false,
            planes_changed: false,
            event: None,
            ..self.clone()
        }
    }

    /// Crtc this state belongs to
    pub fn crtc(&self) -> CrtcIndex {
        self.crtc
    }

    /// Planes currently bound to this crtc
    pub fn plane_mask(&self) -> PlaneMask {
        self.plane_mask
    }

    /// Connectors currently bound to this crtc
    pub fn connector_mask(&self) -> ConnectorMask {
        self.connector_mask
    }

    /// Windows reserved for this crtc
    pub fn reserved_windows(&self) -> WindowMask {
        self.reserved_win_mask
    }

    /// Windows actually scanning out a plane (or the color fill)
    pub fn visible_windows(&self) -> WindowMask {
        self.visible_win_mask
    }

    /// Windows given up by this state, returned to the pool after frame start
    pub fn freed_windows(&self) -> WindowMask {
        self.freed_win_mask
    }

    /// Transaction flags
    pub fn flags(&self) -> CrtcStateFlags {
        self.flags
    }

    /// Region of the display updated by this transaction, if partial update is in use
    pub fn partial_region(&self) -> Option<Rectangle<Physical>> {
        self.partial_region
    }

    /// Bandwidth computed for this state during check
    pub fn bandwidth(&self) -> Option<&BandwidthRequest> {
        self.bandwidth.as_ref()
    }

    /// Per-window configuration handed to the bandwidth backend
    pub fn window_config(&self) -> &WindowConfigTable {
        &self.window_config
    }

    /// Request a completion event for the next commit of this state
    pub fn request_event(&mut self, user_data: u64) {
        self.event = Some(EventRequest { user_data });
    }

    /// Whether the transaction requires a full modeset of this crtc
    pub fn needs_modeset(&self) -> bool {
        self.mode_changed || self.active_changed || self.connectors_changed
    }

    pub(crate) fn seamless(&self) -> bool {
        self.flags.contains(CrtcStateFlags::SEAMLESS_MODESET)
    }

    pub(crate) fn skip_update(&self) -> bool {
        self.flags.contains(CrtcStateFlags::SKIP_UPDATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dpu::window::WindowMask;

    #[test]
    fn duplicate_clears_transient_fields() {
        let mut state = CrtcState::new(CrtcIndex(0));
        state.active = true;
        state.reserved_win_mask = WindowMask::from_bits(0b0011);
        state.freed_win_mask = WindowMask::from_bits(0b0100);
        state.flags = CrtcStateFlags::WIN_INSERTED | CrtcStateFlags::ZPOS_CHANGED;
        state.mode_changed = true;
        state.request_event(7);

        let dup = state.duplicate();
        assert!(dup.active);
        assert_eq!(dup.reserved_windows(), WindowMask::from_bits(0b0011));
        assert!(dup.freed_windows().is_empty());
        assert!(dup.flags().is_empty());
        assert!(!dup.needs_modeset());
        assert!(dup.event.is_none());
    }
}
