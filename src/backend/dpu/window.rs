//! Hardware window arbitration
//!
//! The DPU composes every crtc out of a fixed number of hardware windows shared by all
//! crtcs of the device. Free windows live in a single pool owned by the [`WindowAllocator`],
//! which is created when the device is attached and dropped when it is detached.
//!
//! A crtc holds its windows in the `reserved` mask of its state. While checking a
//! transaction a crtc may grow (windows leave the pool immediately) or shrink (windows move
//! to the `freed` mask of the new state and only return to the pool once the commit passed
//! frame start, as the outgoing frame may still read from them).
//!
//! The allocator only does bitmask arithmetic under its lock, callers never block on
//! hardware while holding it.

use std::{fmt, sync::Mutex};

use drm_fourcc::DrmFourcc;
use smallvec::SmallVec;
use tracing::{error, trace};

use crate::utils::{Buffer, Physical, Rectangle, Size, Transform};

use super::state::{CrtcIndex, CrtcState, PlaneId, PlaneState, WritebackJob};

/// Maximum number of windows a device may expose
pub const MAX_WINDOWS: u32 = u32::BITS;

/// Index of a hardware window
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId(pub u8);

/// End of the window mask an allocation starts scanning from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScanDirection {
    /// Prefer the lowest free window
    #[default]
    Low,
    /// Prefer the highest free window
    High,
}

impl ScanDirection {
    /// The opposite direction
    pub fn reverse(self) -> Self {
        match self {
            ScanDirection::Low => ScanDirection::High,
            ScanDirection::High => ScanDirection::Low,
        }
    }
}

/// Set of hardware windows
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WindowMask(u32);

impl WindowMask {
    /// Mask without any window
    pub const fn empty() -> Self {
        WindowMask(0)
    }

    /// Mask with the lowest `count` windows set
    pub const fn all(count: u32) -> Self {
        if count >= MAX_WINDOWS {
            WindowMask(u32::MAX)
        } else {
            WindowMask((1 << count) - 1)
        }
    }

    /// Mask from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        WindowMask(bits)
    }

    /// Raw bits of the mask
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Whether no window is set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of windows in the mask
    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Whether the window is in the mask
    pub fn contains(&self, window: WindowId) -> bool {
        (window.0 as u32) < MAX_WINDOWS && self.0 & (1 << window.0) != 0
    }

    /// Add a window
    pub fn insert(&mut self, window: WindowId) {
        self.0 |= 1 << window.0;
    }

    /// Union of both masks
    pub fn union(self, other: WindowMask) -> WindowMask {
        WindowMask(self.0 | other.0)
    }

    /// Windows set in both masks
    pub fn intersection(self, other: WindowMask) -> WindowMask {
        WindowMask(self.0 & other.0)
    }

    /// Windows of `self` not set in `other`
    pub fn difference(self, other: WindowMask) -> WindowMask {
        WindowMask(self.0 & !other.0)
    }

    /// Whether both masks share no window
    pub fn is_disjoint(&self, other: WindowMask) -> bool {
        self.0 & other.0 == 0
    }

    /// Iterate the windows of the mask, starting at the given end
    pub fn iter(&self, direction: ScanDirection) -> impl Iterator<Item = WindowId> {
        let bits = self.0;
        let ascending = direction == ScanDirection::Low;
        (0..MAX_WINDOWS as u8)
            .map(move |idx| if ascending { idx } else { MAX_WINDOWS as u8 - 1 - idx })
            .filter(move |idx| bits & (1 << idx) != 0)
            .map(WindowId)
    }

    /// Pick `count` windows of this mask scanning from the given end
    ///
    /// Returns `None` if the mask holds fewer than `count` windows.
    pub fn take(&self, count: u32, direction: ScanDirection) -> Option<WindowMask> {
        if self.count() < count {
            return None;
        }
        Some(self.iter(direction).take(count as usize).collect())
    }
}

impl FromIterator<WindowId> for WindowMask {
    fn from_iter<I: IntoIterator<Item = WindowId>>(iter: I) -> Self {
        let mut mask = WindowMask::empty();
        for window in iter {
            mask.insert(window);
        }
        mask
    }
}

impl fmt::Debug for WindowMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WindowMask({:#010x})", self.0)
    }
}

/// Pool of free hardware windows of a device
#[derive(Debug)]
pub struct WindowAllocator {
    window_count: u32,
    pool: Mutex<WindowMask>,
}

impl WindowAllocator {
    /// Create a pool with all `window_count` windows free
    pub fn new(window_count: u32) -> Self {
        WindowAllocator {
            window_count: window_count.min(MAX_WINDOWS),
            pool: Mutex::new(WindowMask::all(window_count)),
        }
    }

    /// Number of windows of the device
    pub fn window_count(&self) -> u32 {
        self.window_count
    }

    /// Currently free windows
    pub fn available(&self) -> WindowMask {
        *self.pool.lock().unwrap()
    }

    /// Take `delta` windows out of the pool
    ///
    /// Returns an empty mask and leaves the pool untouched if fewer than `delta` windows
    /// are free.
    #[profiling::function]
    pub fn allocate(&self, delta: u32, direction: ScanDirection) -> WindowMask {
        let mut pool = self.pool.lock().unwrap();
        match pool.take(delta, direction) {
            Some(mask) => {
                *pool = pool.difference(mask);
                trace!(?mask, remaining = ?*pool, "Allocated windows");
                mask
            }
            None => WindowMask::empty(),
        }
    }

    /// Return windows to the pool
    #[profiling::function]
    pub fn release(&self, mask: WindowMask) {
        if mask.is_empty() {
            return;
        }
        let mut pool = self.pool.lock().unwrap();
        if !pool.is_disjoint(mask) {
            error!(?mask, pool = ?*pool, "Releasing windows that are already free");
        }
        *pool = pool.union(mask).intersection(WindowMask::all(self.window_count));
        trace!(?mask, pool = ?*pool, "Released windows");
    }

    /// Verify the pool is disjoint from every reservation and the reservations from each other
    ///
    /// Violations are logged, the return value tells whether the invariant holds.
    pub fn assert_disjoint(&self, reservations: impl IntoIterator<Item = (CrtcIndex, WindowMask)>) -> bool {
        let pool = self.available();
        let mut seen = WindowMask::empty();
        let mut consistent = true;
        for (crtc, reserved) in reservations {
            if !reserved.is_disjoint(pool) {
                error!(?crtc, ?reserved, ?pool, "Reserved windows are also in the free pool");
                consistent = false;
            }
            if !reserved.is_disjoint(seen) {
                error!(?crtc, ?reserved, others = ?seen, "Windows reserved by more than one crtc");
                consistent = false;
            }
            seen = seen.union(reserved);
        }
        if seen.count() + pool.count() > self.window_count {
            error!(reserved = ?seen, ?pool, "More windows accounted than the hardware has");
            consistent = false;
        }
        consistent
    }
}

/// Number of windows a crtc needs for the given plane states
///
/// Every visible plane scanning out a framebuffer takes one window. Color fill planes are
/// composed by the blender directly. An active crtc without any such plane still needs a
/// window for the background fill.
pub fn required_count<'a>(crtc: &CrtcState, planes: impl IntoIterator<Item = &'a PlaneState>) -> u32 {
    if !crtc.active {
        return 0;
    }
    let mask = crtc.plane_mask();
    let count = planes
        .into_iter()
        .filter(|p| mask.contains(p.plane()) && p.is_visible() && !p.is_colormap())
        .map(|p| p.plane())
        .collect::<super::state::PlaneMask>()
        .count();
    count.max(1)
}

/// Split a reservation down to `required` windows
///
/// Returns the kept and the freed windows. Windows are given up from the end opposite to
/// the scan direction, so the ones the crtc would pick first stay.
pub fn shrink(reserved: WindowMask, required: u32, direction: ScanDirection) -> (WindowMask, WindowMask) {
    let excess = reserved.count().saturating_sub(required);
    let freed = reserved.take(excess, direction.reverse()).unwrap_or_default();
    (reserved.difference(freed), freed)
}

/// Hand the reserved windows of a crtc to its planes
///
/// Visible framebuffer planes are ordered by their normalized zpos and get windows in scan
/// order. Returns the set of windows actually in use, which for a crtc composed only of
/// color fills is its first window.
pub fn assign_windows<'a>(
    crtc: &CrtcState,
    planes: impl IntoIterator<Item = &'a mut PlaneState>,
    direction: ScanDirection,
) -> WindowMask {
    let mut planes: SmallVec<[&mut PlaneState; 8]> = planes
        .into_iter()
        .filter(|p| crtc.plane_mask().contains(p.plane()))
        .collect();
    planes.sort_by_key(|p| (p.normalized_zpos(), p.plane()));

    let mut windows = crtc.reserved_windows().iter(direction);
    let mut visible = WindowMask::empty();
    for plane in planes {
        plane.window = None;
        if !plane.is_visible() || plane.is_colormap() {
            continue;
        }
        if let Some(window) = windows.next() {
            plane.window = Some(window);
            visible.insert(window);
        }
    }
    if visible.is_empty() && crtc.active {
        if let Some(window) = crtc.reserved_windows().iter(direction).next() {
            visible.insert(window);
        }
    }
    visible
}

/// Configuration of one hardware window, as seen by the bandwidth backend
#[derive(Debug, Clone, PartialEq)]
pub struct WindowConfig {
    /// Window being programmed
    pub window: WindowId,
    /// Plane feeding the window, `None` for the background fill
    pub plane: Option<PlaneId>,
    /// Source area of the framebuffer
    pub src: Rectangle<Buffer>,
    /// Destination area on the crtc
    pub dst: Rectangle<Physical>,
    /// Framebuffer format, `None` for a color fill
    pub format: Option<DrmFourcc>,
    /// Transform applied while scanning out
    pub transform: Transform,
    /// Framebuffer is stored compressed
    pub compressed: bool,
    /// Plane alpha
    pub alpha: u16,
    /// Solid color of a color fill window
    pub colormap: Option<u32>,
    /// Blend order of the window
    pub zpos: u32,
}

/// Configuration of the writeback path of a crtc
#[derive(Debug, Clone, PartialEq)]
pub struct WritebackConfig {
    /// Format of the capture buffer
    pub format: DrmFourcc,
    /// Size of the capture buffer
    pub size: Size<Buffer>,
}

/// Per-crtc table of window configurations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowConfigTable {
    /// Windows ordered by blend order
    pub windows: SmallVec<[WindowConfig; 8]>,
    /// Writeback capture, if one is queued
    pub writeback: Option<WritebackConfig>,
}

impl WindowConfigTable {
    /// Build the table for a crtc whose windows are already assigned
    pub fn build<'a>(
        crtc: &CrtcState,
        planes: impl IntoIterator<Item = &'a PlaneState>,
        writeback: Option<&WritebackJob>,
    ) -> Self {
        let mut windows: SmallVec<[WindowConfig; 8]> = planes
            .into_iter()
            .filter(|p| crtc.plane_mask().contains(p.plane()))
            .filter_map(|p| {
                let window = p.window()?;
                let fb = p.fb.as_ref()?;
                Some(WindowConfig {
                    window,
                    plane: Some(p.plane()),
                    src: p.src,
                    dst: p.dst,
                    format: Some(fb.format()),
                    transform: p.transform,
                    compressed: fb.compressed(),
                    alpha: p.alpha,
                    colormap: None,
                    zpos: p.normalized_zpos(),
                })
            })
            .collect();
        windows.sort_by_key(|w| w.zpos);

        if windows.is_empty() && crtc.active {
            if let Some(window) = crtc.visible_windows().iter(ScanDirection::Low).next() {
                windows.push(WindowConfig {
                    window,
                    plane: None,
                    src: Rectangle::default(),
                    dst: crtc.mode.rect(),
                    format: None,
                    transform: Transform::Normal,
                    compressed: false,
                    alpha: u16::MAX,
                    colormap: Some(0xff00_0000),
                    zpos: 0,
                });
            }
        }

        WindowConfigTable {
            windows,
            writeback: writeback.map(|job| WritebackConfig {
                format: job.fb.format(),
                size: job.fb.size(),
            }),
        }
    }

    /// Whether the table configures nothing
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty() && self.writeback.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dpu::state::{CrtcIndex, Mode, PlaneId};

    fn crtc_with(planes: &[u8]) -> CrtcState {
        let mut crtc = CrtcState::new(CrtcIndex(0));
        crtc.active = true;
        crtc.mode = Mode::new(1080, 2400, 60);
        for p in planes {
            crtc.plane_mask.insert(PlaneId(*p));
        }
        crtc
    }

    fn plane(id: u8, visible: bool, colormap: bool) -> PlaneState {
        let mut plane = PlaneState::new(PlaneId(id));
        plane.crtc = Some(CrtcIndex(0));
        plane.visible = visible;
        if colormap {
            plane.colormap = Some(0xff00ff00);
        }
        plane
    }

    #[test]
    fn take_respects_direction() {
        let mask = WindowMask::from_bits(0b1011_0110);
        assert_eq!(mask.take(2, ScanDirection::Low), Some(WindowMask::from_bits(0b0000_0110)));
        assert_eq!(mask.take(2, ScanDirection::High), Some(WindowMask::from_bits(0b1010_0000)));
        assert_eq!(mask.take(6, ScanDirection::Low), None);
        assert_eq!(mask.take(0, ScanDirection::High), Some(WindowMask::empty()));
    }

    #[test]
    fn allocate_and_release() {
        let alloc = WindowAllocator::new(6);
        assert_eq!(alloc.available(), WindowMask::from_bits(0b11_1111));

        let low = alloc.allocate(2, ScanDirection::Low);
        assert_eq!(low, WindowMask::from_bits(0b00_0011));
        let high = alloc.allocate(2, ScanDirection::High);
        assert_eq!(high, WindowMask::from_bits(0b11_0000));
        assert_eq!(alloc.available(), WindowMask::from_bits(0b00_1100));

        alloc.release(low);
        assert_eq!(alloc.available(), WindowMask::from_bits(0b00_1111));
        assert!(alloc.assert_disjoint([(CrtcIndex(1), high)]));
    }

    #[test]
    fn insufficient_windows_leave_pool_untouched() {
        let alloc = WindowAllocator::new(4);
        let taken = alloc.allocate(2, ScanDirection::Low);
        assert_eq!(alloc.available().count(), 2);

        let denied = alloc.allocate(3, ScanDirection::Low);
        assert!(denied.is_empty());
        assert_eq!(alloc.available(), WindowMask::all(4).difference(taken));
    }

    #[test]
    fn colormap_only_crtc_needs_one_window() {
        let crtc = crtc_with(&[0]);
        let planes = [plane(0, true, true)];
        assert_eq!(required_count(&crtc, &planes), 1);
    }

    #[test]
    fn required_count_ignores_foreign_and_hidden_planes() {
        let crtc = crtc_with(&[0, 1, 2]);
        let planes = [
            plane(0, true, false),
            plane(1, false, false),
            plane(2, true, true),
            plane(3, true, false),
        ];
        assert_eq!(required_count(&crtc, &planes), 1);

        let planes = [plane(0, true, false), plane(1, true, false)];
        assert_eq!(required_count(&crtc, &planes), 2);
        assert_eq!(required_count(&crtc, &planes), 2);

        let mut inactive = crtc_with(&[0, 1]);
        inactive.active = false;
        assert_eq!(required_count(&inactive, &planes), 0);
    }

    #[test]
    fn shrink_frees_from_the_far_end() {
        let reserved = WindowMask::from_bits(0b0111);
        let (kept, freed) = shrink(reserved, 1, ScanDirection::Low);
        assert_eq!(kept, WindowMask::from_bits(0b0001));
        assert_eq!(freed, WindowMask::from_bits(0b0110));

        let (kept, freed) = shrink(reserved, 2, ScanDirection::High);
        assert_eq!(kept, WindowMask::from_bits(0b0110));
        assert_eq!(freed, WindowMask::from_bits(0b0001));

        let (kept, freed) = shrink(reserved, 5, ScanDirection::Low);
        assert_eq!(kept, reserved);
        assert!(freed.is_empty());
    }

    #[test]
    fn shrink_then_grow_restores_count() {
        let alloc = WindowAllocator::new(8);
        let reserved = alloc.allocate(3, ScanDirection::Low);
        let free_before = alloc.available().count();

        let (kept, freed) = shrink(reserved, 1, ScanDirection::Low);
        // freed windows come back only after frame start
        assert_eq!(alloc.available().count(), free_before);
        alloc.release(freed);

        let grown = alloc.allocate(2, ScanDirection::Low);
        let reserved = kept.union(grown);
        assert_eq!(reserved.count(), 3);
        assert_eq!(alloc.available().count(), free_before);
    }

    #[test]
    fn pool_invariants_hold_across_sequences() {
        const WINDOWS: u32 = 8;
        let alloc = WindowAllocator::new(WINDOWS);
        let directions = [ScanDirection::Low, ScanDirection::High, ScanDirection::Low];
        let mut reserved = [WindowMask::empty(); 3];
        let mut seed: u32 = 0x2545_f491;

        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let crtc = (seed % 3) as usize;
            let target = (seed >> 8) % 5;
            let current = reserved[crtc].count();

            if target > current {
                let grown = alloc.allocate(target - current, directions[crtc]);
                if !grown.is_empty() {
                    reserved[crtc] = reserved[crtc].union(grown);
                }
            } else {
                let (kept, freed) = shrink(reserved[crtc], target, directions[crtc]);
                reserved[crtc] = kept;
                alloc.release(freed);
            }

            let total: u32 = reserved.iter().map(|m| m.count()).sum();
            assert!(total <= WINDOWS);
            assert!(alloc.assert_disjoint(
                reserved.iter().enumerate().map(|(i, m)| (CrtcIndex(i as u8), *m))
            ));
        }
    }

    #[test]
    fn windows_follow_normalized_zpos() {
        let mut crtc = crtc_with(&[0, 1, 2]);
        crtc.reserved_win_mask = WindowMask::from_bits(0b1100);
        let mut planes = [plane(0, true, false), plane(1, true, true), plane(2, true, false)];
        planes[0].normalized_zpos = 2;
        planes[1].normalized_zpos = 0;
        planes[2].normalized_zpos = 1;

        let visible = assign_windows(&crtc, planes.iter_mut(), ScanDirection::High);
        assert_eq!(visible, WindowMask::from_bits(0b1100));
        assert_eq!(planes[2].window(), Some(WindowId(3)));
        assert_eq!(planes[0].window(), Some(WindowId(2)));
        assert_eq!(planes[1].window(), None);
    }

    #[test]
    fn colormap_crtc_uses_fill_window() {
        let mut crtc = crtc_with(&[0]);
        crtc.reserved_win_mask = WindowMask::from_bits(0b0010);
        let mut planes = [plane(0, true, true)];

        let visible = assign_windows(&crtc, planes.iter_mut(), ScanDirection::Low);
        crtc.visible_win_mask = visible;
        assert_eq!(visible, WindowMask::from_bits(0b0010));

        let table = WindowConfigTable::build(&crtc, &planes, None);
        assert_eq!(table.windows.len(), 1);
        assert_eq!(table.windows[0].plane, None);
        assert_eq!(table.windows[0].dst, crtc.mode.rect());
    }
}
