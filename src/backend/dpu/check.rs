//! Validation of display transactions
//!
//! [`check`] runs a fixed sequence of stages over an [`AtomicState`]. Every stage only
//! touches the new states inside the transaction, with one exception: growing the window
//! reservation of a crtc takes windows out of the device pool right away. These windows
//! belong to the transaction until it is committed and are returned if any later stage
//! fails or the transaction is dropped.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use super::{
    error::Error,
    state::{AtomicState, CommitFlags, ConnectorKind, CrtcIndex, CrtcStateFlags, PlaneState, WritebackJob},
    window::{self, WindowConfigTable},
    zpos,
};
use crate::utils::{Physical, Rectangle};

/// Stages of the check pipeline, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CheckStage {
    /// Nothing was checked yet
    Init,
    /// Objects implicitly affected by the transaction were pulled in
    AffectedObjectsAdded,
    /// Trusted UI ownership and content protection were verified
    SecureChecked,
    /// Modes and connector routing were validated
    ModesetChecked,
    /// The partial update region was computed
    PartialUpdatePrepared,
    /// Blend order was normalized
    ZposNormalized,
    /// Plane configurations were validated
    PlanesChecked,
    /// Windows were reserved and the bandwidth computed
    WindowsAllocated,
    /// Self refresh was left
    SelfRefreshAltered,
    /// The transaction is ready to be committed
    Done,
    /// A stage rejected the transaction
    Failed,
}

/// Run the check pipeline over `state`
///
/// On failure the stage of the transaction is [`CheckStage::Failed`], all windows reserved
/// during this call are back in the pool and the error names the failed stage.
#[profiling::function]
pub(crate) fn check(state: &mut AtomicState) -> Result<(), Error> {
    let stages: [(CheckStage, fn(&mut AtomicState) -> Result<(), Error>); 8] = [
        (CheckStage::AffectedObjectsAdded, add_affected_objects),
        (CheckStage::SecureChecked, check_secure),
        (CheckStage::ModesetChecked, check_modeset),
        (CheckStage::PartialUpdatePrepared, prepare_partial_update),
        (CheckStage::ZposNormalized, normalize_zpos),
        (CheckStage::PlanesChecked, check_planes),
        (CheckStage::WindowsAllocated, allocate_windows),
        (CheckStage::SelfRefreshAltered, alter_self_refresh),
    ];

    for (stage, run) in stages {
        if let Err(err) = run(state) {
            debug!(?stage, "Atomic check failed: {}", err);
            state.stage = CheckStage::Failed;
            state.release_reservations();
            return Err(Error::CheckFailed {
                stage,
                source: Box::new(err),
            });
        }
        trace!(?stage, "Atomic check stage passed");
        state.stage = stage;
    }
    state.stage = CheckStage::Done;
    Ok(())
}

fn add_affected_objects(state: &mut AtomicState) -> Result<(), Error> {
    let bound: SmallVec<[CrtcIndex; 4]> = state
        .planes
        .values()
        .flat_map(|t| [t.old.crtc(), t.new.crtc()])
        .chain(state.connectors.values().flat_map(|t| [t.old.crtc(), t.new.crtc()]))
        .flatten()
        .collect();
    for crtc in bound {
        state.crtc_state_mut(crtc)?;
    }

    for t in state.crtcs.values_mut() {
        t.new.mode_changed |= t.new.mode != t.old.mode;
        t.new.active_changed |= t.new.active != t.old.active;
    }

    let crtcs: SmallVec<[(CrtcIndex, bool); 4]> = state
        .crtcs
        .iter()
        .map(|(crtc, t)| (*crtc, t.new.needs_modeset()))
        .collect();
    let (live_planes, live_connectors) = {
        let live = state.device.live.read().unwrap();
        let planes: SmallVec<[_; 16]> = live.planes.values().map(|p| (p.plane(), p.crtc())).collect();
        let connectors: SmallVec<[_; 8]> = live
            .connectors
            .values()
            .map(|c| (c.connector(), c.crtc(), c.kind()))
            .collect();
        (planes, connectors)
    };
    let pending_writeback: SmallVec<[_; 2]> = state
        .device
        .pending_writeback
        .lock()
        .unwrap()
        .keys()
        .copied()
        .collect();

    for (crtc, modeset) in crtcs {
        for (plane, _) in live_planes.iter().filter(|(_, c)| *c == Some(crtc)) {
            state.plane_state_mut(*plane)?;
        }
        for (connector, bound, kind) in &live_connectors {
            if *bound != Some(crtc) {
                continue;
            }
            if modeset {
                state.connector_state_mut(*connector)?;
            } else if *kind == ConnectorKind::Writeback
                && pending_writeback.contains(connector)
                && !state.connectors.contains_key(connector)
            {
                debug!(?crtc, ?connector, "Pulling writeback connector with pending job into transaction");
                state.connector_state_mut(*connector)?;
            }
        }
    }
    Ok(())
}

fn check_secure(state: &mut AtomicState) -> Result<(), Error> {
    for crtc in state.crtcs.keys() {
        if state.device.is_tui_active(*crtc) {
            return Err(Error::TuiActive(*crtc));
        }
    }

    for (crtc, t) in &state.crtcs {
        let captured = state.connectors.values().any(|c| {
            c.new.crtc() == Some(*crtc) && c.new.is_writeback() && c.new.writeback_job.is_some()
        });
        if !captured {
            continue;
        }
        let protected = state
            .planes
            .values()
            .map(|p| &p.new)
            .filter(|p| t.new.plane_mask().contains(p.plane()))
            .find(|p| p.fb.as_ref().map(|fb| fb.protected()).unwrap_or(false));
        if let Some(plane) = protected {
            return Err(Error::SecureViolation {
                crtc: *crtc,
                plane: plane.plane(),
            });
        }
    }
    Ok(())
}

fn check_modeset(state: &mut AtomicState) -> Result<(), Error> {
    let device = state.device.clone();
    let allow_modeset = state.flags.contains(CommitFlags::ALLOW_MODESET);

    for t in state.connectors.values() {
        let connector = t.new.connector();
        if let Some(crtc) = t.new.crtc() {
            let descriptor = device
                .backends
                .connector(connector)
                .ok_or_else(|| Error::UnknownObject(format!("{:?}", connector)))?;
            if !descriptor.possible_crtcs.contains(&crtc) {
                return Err(Error::ConnectorNotCompatible(crtc, connector));
            }
        }
    }

    for (crtc, t) in state.crtcs.iter_mut() {
        let new = &mut t.new;
        if new.active {
            if !new.mode.is_valid() {
                return Err(Error::InvalidMode {
                    crtc: *crtc,
                    mode: new.mode,
                });
            }
            if new.connector_mask().is_empty() {
                return Err(Error::NoConnectors(*crtc));
            }
        }

        let encoders: SmallVec<[_; 2]> = new
            .connector_mask()
            .iter()
            .filter_map(|c| device.backends.connector(c))
            .collect();
        if new.active {
            for descriptor in &encoders {
                if !descriptor.encoder.mode_valid(&new.mode) {
                    return Err(Error::ModeNotSuitable {
                        connector: descriptor.id,
                        mode: new.mode,
                    });
                }
            }
        }

        if new.mode_changed
            && !new.active_changed
            && !new.connectors_changed
            && t.old.active
            && new.active
            && encoders
                .iter()
                .all(|d| d.encoder.supports_seamless(&t.old.mode, &new.mode))
        {
            debug!(?crtc, old = ?t.old.mode, new = ?new.mode, "Switching mode seamlessly");
            new.flags.insert(CrtcStateFlags::SEAMLESS_MODESET);
        }

        if new.needs_modeset() && !new.seamless() && !allow_modeset {
            return Err(Error::ModesetNotAllowed(*crtc));
        }
    }
    Ok(())
}

fn plane_changed(old: &PlaneState, new: &PlaneState) -> bool {
    let fb_changed = match (&old.fb, &new.fb) {
        (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
        (None, None) => false,
        _ => true,
    };
    fb_changed
        || old.crtc() != new.crtc()
        || old.src != new.src
        || old.dst != new.dst
        || old.transform != new.transform
        || old.alpha != new.alpha
        || old.colormap != new.colormap
        || old.zpos != new.zpos
        || new.fence().is_pending()
}

fn prepare_partial_update(state: &mut AtomicState) -> Result<(), Error> {
    let config = &state.device.config;
    for (crtc, t) in state.crtcs.iter_mut() {
        let partial = config.crtc(*crtc).map(|c| c.partial_update).unwrap_or(false);
        let new = &mut t.new;
        if !partial || !new.active {
            new.partial_region = None;
            continue;
        }

        let full_modeset = new.needs_modeset() && !new.seamless();
        let resized = new.seamless() && !new.mode.same_resolution(&t.old.mode);
        if full_modeset || resized {
            trace!(?crtc, "Reinitializing partial update region");
            new.partial_region = Some(new.mode.rect());
            continue;
        }

        let damage = state
            .planes
            .values()
            .filter(|p| p.old.crtc() == Some(*crtc) || p.new.crtc() == Some(*crtc))
            .filter(|p| plane_changed(&p.old, &p.new))
            .fold(Rectangle::<Physical>::default(), |damage, p| {
                let old = if p.old.crtc() == Some(*crtc) { p.old.dst } else { Rectangle::default() };
                let new = if p.new.crtc() == Some(*crtc) { p.new.dst } else { Rectangle::default() };
                damage.merge(old).merge(new)
            });
        let damage = damage.intersection(new.mode.rect()).filter(|d| !d.is_empty());

        match damage {
            Some(damage) => new.partial_region = Some(damage),
            None if !new.mode_changed && new.event.is_none() => {
                trace!(?crtc, "No damage, skipping hardware update");
                new.partial_region = None;
                new.flags.insert(CrtcStateFlags::SKIP_UPDATE);
            }
            None => new.partial_region = Some(new.mode.rect()),
        }
    }
    Ok(())
}

fn normalize_zpos(state: &mut AtomicState) -> Result<(), Error> {
    let config = &state.device.config;
    for (crtc, t) in state.crtcs.iter_mut() {
        let dual_blender = config.is_dual_blender(*crtc);
        let mask = t.new.plane_mask();
        let reordered = state
            .planes
            .values()
            .filter(|p| mask.contains(p.new.plane()))
            .any(|p| {
                p.old.zpos != p.new.zpos
                    || (dual_blender && (p.old.dst.loc.x != p.new.dst.loc.x || p.old.split != p.new.split))
            });
        if !t.new.planes_changed && mask == t.old.plane_mask() && !reordered && !t.new.mode_changed {
            continue;
        }
        zpos::normalize(
            &mut t.new,
            state.planes.values_mut().map(|p| &mut p.new),
            dual_blender,
        );
    }
    Ok(())
}

fn check_planes(state: &mut AtomicState) -> Result<(), Error> {
    let device = state.device.clone();
    for t in state.planes.values_mut() {
        let plane = &mut t.new;
        let Some(crtc) = plane.crtc() else {
            plane.visible = false;
            plane.window = None;
            continue;
        };
        let descriptor = device
            .backends
            .plane(plane.plane())
            .ok_or_else(|| Error::UnknownObject(format!("{:?}", plane.plane())))?;
        if !descriptor.possible_crtcs.contains(&crtc) {
            return Err(Error::PlaneNotCompatible(crtc, plane.plane()));
        }

        let crtc_state = &state
            .crtcs
            .get(&crtc)
            .ok_or_else(|| Error::UnknownObject(format!("{:?}", crtc)))?
            .new;
        if !crtc_state.plane_mask().contains(plane.plane()) {
            debug!(?crtc, plane = ?plane.plane(), "Plane is not part of its crtc, hiding it");
            plane.visible = false;
            plane.window = None;
            continue;
        }
        let has_content = plane.fb.is_some() || plane.colormap.is_some();
        plane.visible = has_content && crtc_state.active && plane.dst.overlaps(crtc_state.mode.rect());
        if !plane.visible {
            continue;
        }

        if plane.fb.is_some() && plane.src.is_empty() {
            return Err(Error::PlaneCheck {
                plane: plane.plane(),
                reason: "empty source rectangle",
            });
        }
        descriptor
            .backend
            .check(plane, &crtc_state.mode)
            .map_err(|reason| Error::PlaneCheck {
                plane: plane.plane(),
                reason,
            })?;
    }
    Ok(())
}

fn allocate_windows(state: &mut AtomicState) -> Result<(), Error> {
    let device = state.device.clone();
    let mut crtcs: SmallVec<[CrtcIndex; 4]> = state.crtcs.keys().copied().collect();
    crtcs.sort();

    for crtc in crtcs {
        let direction = device.config.scan_direction(crtc);
        let Some(t) = state.crtcs.get_mut(&crtc) else {
            continue;
        };
        let new = &mut t.new;
        let required = window::required_count(new, state.planes.values().map(|p| &p.new));
        let reserved = new.reserved_windows();
        let current = reserved.count();

        if required > current {
            let grown = device.allocator.allocate(required - current, direction);
            if grown.is_empty() {
                let available = device.allocator.available();
                return Err(Error::NoWindows {
                    crtc,
                    required,
                    reserved,
                    available,
                });
            }
            debug!(?crtc, ?grown, required, "Reserving windows");
            new.reserved_win_mask = reserved.union(grown);
            new.flags.insert(CrtcStateFlags::WIN_INSERTED);
            state.reservations.push((crtc, grown));
        } else if required < current {
            let (kept, freed) = window::shrink(reserved, required, direction);
            debug!(?crtc, ?freed, required, "Releasing windows after frame start");
            new.reserved_win_mask = kept;
            new.freed_win_mask = new.freed_win_mask.union(freed);
        }

        new.visible_win_mask =
            window::assign_windows(new, state.planes.values_mut().map(|p| &mut p.new), direction);

        // a capture still running from an earlier commit keeps its bandwidth
        let writeback = state
            .connectors
            .values()
            .map(|c| &c.new)
            .find(|c| c.crtc() == Some(crtc) && c.is_writeback())
            .and_then(|c| {
                c.writeback_job.clone().or_else(|| {
                    let pending = device.pending_writeback.lock().unwrap();
                    pending.get(&c.connector()).map(|fb| WritebackJob { fb: fb.clone() })
                })
            });
        let table = WindowConfigTable::build(new, state.planes.values().map(|p| &p.new), writeback.as_ref());

        if new.active {
            let request = device
                .backends
                .bandwidth
                .calc_bw(crtc, &table, &new.mode)
                .map_err(|err| Error::access("Bandwidth calculation failed", err))?;
            trace!(?crtc, ?request, "Computed bandwidth");
            new.bandwidth = Some(request);
        } else {
            new.bandwidth = None;
        }
        new.window_config = table;
    }
    Ok(())
}

fn alter_self_refresh(state: &mut AtomicState) -> Result<(), Error> {
    for (crtc, t) in state.crtcs.iter_mut() {
        if t.new.self_refresh_active {
            trace!(?crtc, "Leaving self refresh");
            t.new.self_refresh_active = false;
        }
    }
    Ok(())
}
