use std::sync::{Arc, Mutex};

use crate::utils::{Buffer, Physical, Rectangle, Transform};

use super::{CrtcIndex, PlaneId};
use crate::backend::dpu::{fence::Fence, hw::Framebuffer, window::WindowId};

/// Split-segment descriptor of a plane on a dual-blender crtc
///
/// Tells the zpos normalizer which of the two blenders composes the plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SplitSegment {
    /// Blender position, `0` for the left and `2` for the right blender
    pub position: u8,
}

impl SplitSegment {
    /// Position of planes routed to the left blender
    pub const LEFT: u8 = 0;
    /// Position of planes routed to the right blender
    pub const RIGHT: u8 = 2;
}

/// Holder of the producer fence of a plane
///
/// The fence is owned by exactly one state. A duplicated state starts without
/// a fence and waiting on a fence consumes it.
#[derive(Default)]
pub struct FenceSlot(Mutex<Option<Arc<dyn Fence>>>);

impl FenceSlot {
    /// Remove the fence from the slot
    pub fn take(&self) -> Option<Arc<dyn Fence>> {
        self.0.lock().unwrap().take()
    }

    /// Whether a fence still waits to be consumed
    pub fn is_pending(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }

    fn set(&self, fence: Option<Arc<dyn Fence>>) {
        *self.0.lock().unwrap() = fence;
    }
}

impl Clone for FenceSlot {
    fn clone(&self) -> Self {
        FenceSlot::default()
    }
}

impl std::fmt::Debug for FenceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FenceSlot").field(&*self.0.lock().unwrap()).finish()
    }
}

/// State of a single plane within a transaction
#[derive(Debug, Clone)]
pub struct PlaneState {
    pub(crate) plane: PlaneId,
    pub(crate) crtc: Option<CrtcIndex>,
    /// Attached framebuffer
    pub fb: Option<Arc<dyn Framebuffer>>,
    /// Source [`Rectangle`] of the attached framebuffer
    pub src: Rectangle<Buffer>,
    /// Destination [`Rectangle`] on the crtc
    pub dst: Rectangle<Physical>,
    /// Transform applied while scanning out
    pub transform: Transform,
    /// Plane alpha, `0xffff` is opaque
    pub alpha: u16,
    /// Solid color (ARGB8888) shown instead of a framebuffer
    pub colormap: Option<u32>,
    /// Requested layer order
    pub zpos: u32,
    /// Blender routing hint on dual-blender crtcs
    pub split: Option<SplitSegment>,
    pub(crate) normalized_zpos: u32,
    pub(crate) visible: bool,
    pub(crate) window: Option<WindowId>,
    pub(crate) fence: FenceSlot,
}

impl PlaneState {
    pub(crate) fn new(plane: PlaneId) -> Self {
        PlaneState {
            plane,
            crtc: None,
            fb: None,
            src: Rectangle::default(),
            dst: Rectangle::default(),
            transform: Transform::Normal,
            alpha: u16::MAX,
            colormap: None,
            zpos: 0,
            split: None,
            normalized_zpos: 0,
            visible: false,
            window: None,
            fence: FenceSlot::default(),
        }
    }

    /// Copy of this state as the starting point of a new transaction
    ///
    /// The producer fence is not carried over.
    pub(crate) fn duplicate(&self) -> Self {
        self.clone()
    }

    /// Plane this state belongs to
    pub fn plane(&self) -> PlaneId {
        self.plane
    }

    /// Crtc the plane is bound to
    pub fn crtc(&self) -> Option<CrtcIndex> {
        self.crtc
    }

    /// Layer order after normalization
    pub fn normalized_zpos(&self) -> u32 {
        self.normalized_zpos
    }

    /// Whether the plane contributes to the composed frame
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Whether the plane is a solid color fill without framebuffer
    pub fn is_colormap(&self) -> bool {
        self.colormap.is_some() && self.fb.is_none()
    }

    /// Window scanning out this plane
    pub fn window(&self) -> Option<WindowId> {
        self.window
    }

    /// Attach the producer fence guarding the framebuffer
    pub fn set_fence(&mut self, fence: impl Fence + 'static) {
        self.fence.set(Some(Arc::new(fence)));
    }

    /// Producer fence slot of this state
    pub fn fence(&self) -> &FenceSlot {
        &self.fence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dpu::fence::{Fence, Interrupted};
    use std::time::Duration;

    #[derive(Debug)]
    struct Signaled;

    impl Fence for Signaled {
        fn is_signaled(&self) -> bool {
            true
        }
        fn wait_timeout(&self, _timeout: Duration) -> Result<bool, Interrupted> {
            Ok(true)
        }
        fn wait(&self) -> Result<(), Interrupted> {
            Ok(())
        }
        fn producer(&self) -> String {
            "test".into()
        }
    }

    #[test]
    fn duplicate_drops_fence() {
        let mut state = PlaneState::new(PlaneId(1));
        state.set_fence(Signaled);
        assert!(state.fence().is_pending());

        let dup = state.duplicate();
        assert!(!dup.fence().is_pending());
        assert!(state.fence().is_pending());
    }

    #[test]
    fn fence_is_consumed_once() {
        let mut state = PlaneState::new(PlaneId(1));
        state.set_fence(Signaled);
        let fence = state.fence().take().unwrap();
        assert!(fence.downcast_ref::<Signaled>().is_some());
        assert!(state.fence().take().is_none());
    }
}
