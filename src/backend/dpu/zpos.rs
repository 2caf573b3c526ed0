//! Layer order normalization
//!
//! Clients may use any zpos values, the hardware wants a dense blend order starting at zero.
//!
//! A dual-blender crtc drives the left and the right half of a wide panel from two blenders.
//! Every plane composed by the left blender has to come before every plane of the right
//! blender, independent of its zpos.

use smallvec::SmallVec;

use super::state::{CrtcState, CrtcStateFlags, Mode, PlaneState, SplitSegment};

/// Blender a plane of a dual-blender crtc is routed to
///
/// An explicit split descriptor wins, otherwise planes starting in the right half of the
/// mode belong to the right blender.
pub fn blender_position(plane: &PlaneState, mode: &Mode) -> u8 {
    match plane.split {
        Some(split) if split.position == SplitSegment::RIGHT => SplitSegment::RIGHT,
        Some(_) => SplitSegment::LEFT,
        None if plane.dst.loc.x >= mode.hdisplay as i32 / 2 => SplitSegment::RIGHT,
        None => SplitSegment::LEFT,
    }
}

/// Assign the normalized zpos of all planes bound to `crtc`
///
/// Planes not bound to the crtc are left untouched. Sets
/// [`CrtcStateFlags::ZPOS_CHANGED`] when running for a dual-blender crtc or when any
/// assignment changed.
#[profiling::function]
pub fn normalize<'a>(
    crtc: &mut CrtcState,
    planes: impl IntoIterator<Item = &'a mut PlaneState>,
    dual_blender: bool,
) {
    let mode = crtc.mode;
    let mask = crtc.plane_mask();
    let mut planes: SmallVec<[(u8, &mut PlaneState); 8]> = planes
        .into_iter()
        .filter(|p| mask.contains(p.plane()))
        .map(|p| {
            let position = if dual_blender {
                blender_position(p, &mode)
            } else {
                0
            };
            (position, p)
        })
        .collect();
    planes.sort_by_key(|(position, p)| (*position, p.zpos, p.plane()));

    let mut changed = dual_blender;
    for (rank, (_, plane)) in planes.into_iter().enumerate() {
        let rank = rank as u32;
        if plane.normalized_zpos != rank {
            plane.normalized_zpos = rank;
            changed = true;
        }
    }
    if changed {
        crtc.flags.insert(CrtcStateFlags::ZPOS_CHANGED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dpu::state::{CrtcIndex, PlaneId};
    use crate::utils::Rectangle;

    fn setup(planes: &[(u8, u32, i32, Option<u8>)]) -> (CrtcState, Vec<PlaneState>) {
        let mut crtc = CrtcState::new(CrtcIndex(1));
        crtc.active = true;
        crtc.mode = Mode::new(2560, 1440, 60);
        let planes = planes
            .iter()
            .map(|&(id, zpos, x, split)| {
                crtc.plane_mask.insert(PlaneId(id));
                let mut plane = PlaneState::new(PlaneId(id));
                plane.zpos = zpos;
                plane.dst = Rectangle::from_loc_and_size((x, 0), (640, 1440));
                plane.split = split.map(|position| SplitSegment { position });
                plane
            })
            .collect();
        (crtc, planes)
    }

    fn order(planes: &[PlaneState]) -> Vec<(u8, u32)> {
        let mut order: Vec<_> = planes.iter().map(|p| (p.plane().0, p.normalized_zpos())).collect();
        order.sort_by_key(|(_, z)| *z);
        order
    }

    #[test]
    fn left_blender_precedes_right() {
        let (mut crtc, mut planes) = setup(&[
            (0, 7, 1280, None),
            (1, 0, 1920, None),
            (2, 9, 0, None),
            (3, 3, 640, Some(SplitSegment::RIGHT)),
            (4, 1, 1500, Some(SplitSegment::LEFT)),
        ]);
        normalize(&mut crtc, planes.iter_mut(), true);

        assert_eq!(order(&planes), vec![(4, 0), (2, 1), (1, 2), (3, 3), (0, 4)]);
        assert!(crtc.flags().contains(CrtcStateFlags::ZPOS_CHANGED));

        let left_max = planes
            .iter()
            .filter(|p| blender_position(p, &crtc.mode) == SplitSegment::LEFT)
            .map(|p| p.normalized_zpos())
            .max()
            .unwrap();
        let right_min = planes
            .iter()
            .filter(|p| blender_position(p, &crtc.mode) == SplitSegment::RIGHT)
            .map(|p| p.normalized_zpos())
            .min()
            .unwrap();
        assert!(left_max < right_min);
    }

    #[test]
    fn ties_are_broken_by_plane_id() {
        let (mut crtc, mut planes) = setup(&[(5, 2, 0, None), (3, 2, 0, None), (4, 1, 0, None)]);
        normalize(&mut crtc, planes.iter_mut(), false);
        assert_eq!(order(&planes), vec![(4, 0), (3, 1), (5, 2)]);
    }

    #[test]
    fn normalization_is_deterministic() {
        let (mut crtc, mut planes) = setup(&[(0, 4, 2000, None), (1, 4, 10, None), (2, 0, 1300, None)]);
        normalize(&mut crtc, planes.iter_mut(), true);
        let first = order(&planes);

        crtc.flags = CrtcStateFlags::empty();
        normalize(&mut crtc, planes.iter_mut(), false);
        normalize(&mut crtc, planes.iter_mut(), true);
        assert_eq!(order(&planes), first);
    }

    #[test]
    fn unchanged_order_keeps_flag_clear() {
        let (mut crtc, mut planes) = setup(&[(0, 0, 0, None), (1, 1, 0, None)]);
        planes[1].normalized_zpos = 1;
        normalize(&mut crtc, planes.iter_mut(), false);
        assert!(!crtc.flags().contains(CrtcStateFlags::ZPOS_CHANGED));
    }
}
