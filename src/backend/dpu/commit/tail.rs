//! The ordered hardware commit of a swapped-in transaction
//!
//! The tail never fails. Backend errors are logged, stalled hardware is handed to the
//! recovery, and the commit always reaches hw_done so later commits can proceed.

use std::sync::{atomic::Ordering, Arc};

use smallvec::SmallVec;
use tracing::{debug, error, info_span, trace, warn};

use crate::backend::dpu::{
    fence,
    hw::{CrtcBackend, LinkPhase, TriggerState},
    state::{CommitFlags, CommittedTransaction, CrtcIndex, CrtcState},
    vblank::{self, VblankTimeouts},
    window::WindowConfigTable,
    DeviceInner,
};

fn log_err(result: Result<(), crate::backend::dpu::error::BackendError>, crtc: CrtcIndex, what: &str) {
    if let Err(err) = result {
        error!(?crtc, "{} failed: {}", what, err);
    }
}

fn full_modeset(state: &CrtcState) -> bool {
    state.needs_modeset() && !state.seamless()
}

/// Run the commit tail of `txn`
///
/// Only the first call for a transaction does anything.
#[profiling::function]
pub(crate) fn run(device: &DeviceInner, txn: &CommittedTransaction) {
    if txn.tail_started.swap(true, Ordering::AcqRel) {
        error!(serial = %txn.serial, "Commit tail started twice, ignoring");
        return;
    }
    let span = info_span!(parent: &device.span, "commit_tail", serial = %txn.serial);
    let _guard = span.enter();

    let crtc_backend = |crtc: CrtcIndex| -> Option<&Arc<dyn CrtcBackend>> {
        let backend = device.backends.crtc(crtc);
        if backend.is_none() {
            error!(?crtc, "No backend for crtc");
        }
        backend
    };
    let refresh = |state: &CrtcState| state.mode.refresh_or(device.config.default_refresh);

    // producer fences
    for plane in txn.planes.values() {
        let rate = plane
            .new
            .crtc()
            .and_then(|crtc| txn.crtc_state(crtc))
            .map(refresh)
            .unwrap_or(device.config.default_refresh);
        fence::wait_plane_fence(&plane.new, rate);
    }

    // hibernation stays blocked until the commit left the hardware
    let hibernation = device.backends.hibernation.clone();
    let blocked: SmallVec<[CrtcIndex; 4]> = txn.crtcs.keys().copied().collect();
    for crtc in &blocked {
        hibernation.block(*crtc);
    }
    let hibernation_guard = scopeguard::guard(blocked, move |blocked| {
        for crtc in blocked {
            hibernation.unblock(crtc);
        }
    });

    // modeset disables
    for (crtc, c) in &txn.crtcs {
        if !c.old.active || !(full_modeset(&c.new) || !c.new.active) {
            continue;
        }
        let Some(backend) = crtc_backend(*crtc) else {
            continue;
        };
        debug!(?crtc, "Disabling crtc");
        for plane in txn.planes.values().filter(|p| p.old.crtc() == Some(*crtc) && p.old.window().is_some()) {
            if let Some(descriptor) = device.backends.plane(plane.old.plane()) {
                log_err(descriptor.backend.disable(), *crtc, "Plane disable");
            }
        }
        let encoders: SmallVec<[_; 2]> = c
            .old
            .connector_mask()
            .iter()
            .filter_map(|connector| device.backends.connector(connector))
            .collect();
        for descriptor in &encoders {
            log_err(descriptor.encoder.disable(), *crtc, "Encoder disable");
        }
        log_err(backend.disable(), *crtc, "Crtc disable");
        for descriptor in &encoders {
            log_err(descriptor.encoder.post_disable(), *crtc, "Encoder post disable");
        }
    }

    // writeback window config
    {
        let mut tables = device.bw_tables.lock().unwrap();
        for (crtc, c) in &txn.crtcs {
            if let Some(table) = tables.get_mut(crtc.0 as usize) {
                if table.writeback != c.new.window_config().writeback {
                    trace!(?crtc, writeback = ?c.new.window_config().writeback, "Updating writeback config");
                    table.writeback = c.new.window_config().writeback.clone();
                }
            }
        }
    }

    // modeset enables
    for (crtc, c) in &txn.crtcs {
        if !c.new.active || !(full_modeset(&c.new) || !c.old.active) {
            continue;
        }
        let Some(backend) = crtc_backend(*crtc) else {
            continue;
        };
        debug!(?crtc, mode = ?c.new.mode, "Enabling crtc");
        log_err(backend.enable(&c.new.mode), *crtc, "Crtc enable");
        for connector in c.new.connector_mask().iter() {
            let Some(descriptor) = device.backends.connector(connector) else {
                continue;
            };
            log_err(descriptor.encoder.pre_enable(), *crtc, "Encoder pre enable");
            for phase in LinkPhase::SEQUENCE {
                log_err(descriptor.encoder.reset_link(phase), *crtc, "Link reset");
            }
            log_err(descriptor.encoder.enable(), *crtc, "Encoder enable");
        }
    }

    // frequency hopping
    let hopping: SmallVec<[CrtcIndex; 2]> = match device.backends.freq_hop.as_ref() {
        Some(freq_hop) => txn
            .crtcs
            .iter()
            .filter_map(|(crtc, c)| {
                let khz = c.new.freq_hop.filter(|khz| c.new.active && c.old.freq_hop != Some(*khz))?;
                freq_hop.set_freq_hop(*crtc, true);
                log_err(freq_hop.update_freq_hop(*crtc, khz), *crtc, "Frequency hop");
                Some(*crtc)
            })
            .collect(),
        None => SmallVec::new(),
    };

    // pre-commit bandwidth
    let updating: SmallVec<[CrtcIndex; 4]> = txn
        .crtcs
        .iter()
        .filter(|(_, c)| c.new.active && !c.new.skip_update())
        .map(|(crtc, _)| *crtc)
        .collect();
    {
        let mut tables = device.bw_tables.lock().unwrap();
        for crtc in &updating {
            let c = &txn.crtcs[crtc];
            if let Some(table) = tables.get_mut(crtc.0 as usize) {
                *table = c.new.window_config().clone();
            }
            if let Some(request) = c.new.bandwidth() {
                device.backends.bandwidth.update_bw(*crtc, request, false);
            }
        }
    }

    // plane commit
    for crtc in &updating {
        let c = &txn.crtcs[crtc];
        let Some(backend) = crtc_backend(*crtc) else {
            continue;
        };
        backend.atomic_begin();
        for plane in txn.planes.values() {
            let was_here = plane.old.crtc() == Some(*crtc) && plane.old.window().is_some();
            let is_here = plane.new.crtc() == Some(*crtc) && plane.new.window().is_some();
            let Some(descriptor) = device.backends.plane(plane.new.plane()) else {
                continue;
            };
            if is_here {
                let config = c
                    .new
                    .window_config()
                    .windows
                    .iter()
                    .find(|w| w.plane == Some(plane.new.plane()));
                match config {
                    Some(config) => log_err(descriptor.backend.update(config), *crtc, "Plane update"),
                    None => warn!(?crtc, plane = ?plane.new.plane(), "Plane has a window but no configuration"),
                }
            } else if was_here {
                log_err(descriptor.backend.disable(), *crtc, "Plane disable");
            }
        }
        backend.atomic_flush();
        if c.old.mode.vrefresh != c.new.mode.vrefresh {
            backend.update_bts_fps(refresh(&c.new));
        }
        if device.config.crtc(*crtc).map(|cfg| cfg.trigger_mask).unwrap_or(false) {
            backend.set_trigger(TriggerState::Unmask);
        }
        backend.check_svsync_start();
    }

    if let Some(fake) = txn.fake_commit.as_ref() {
        fake.complete_flip();
        fake.complete_hw();
    }

    // crtcs that will never produce a vblank for this commit
    let mut signaled: SmallVec<[CrtcIndex; 4]> = SmallVec::new();
    for (crtc, c) in &txn.crtcs {
        let has_vblank = c.new.active && crtc_backend(*crtc).map(|b| b.has_vblank()).unwrap_or(false);
        if has_vblank && !c.new.skip_update() {
            continue;
        }
        trace!(?crtc, "Synthesizing completion event");
        if let Some(event) = c.new.event {
            device.emit_vblank(*crtc, Some(event.user_data));
        }
        if let Some(signal) = txn.signals.get(crtc) {
            signal.complete_flip();
        }
        signaled.push(*crtc);
    }

    // vblank
    if !txn.flags.contains(CommitFlags::LEGACY_CURSOR) {
        for crtc in updating.iter().filter(|crtc| !signaled.contains(*crtc)) {
            let Some(backend) = crtc_backend(*crtc) else {
                continue;
            };
            let timeouts = VblankTimeouts::new(refresh(&txn.crtcs[crtc].new), device.config.timeout_scale);
            let since = backend.vblank_count();
            vblank::wait_for_vblank(*crtc, backend.as_ref(), since, timeouts, &device.recovery);
        }
    }

    // frame start
    for crtc in &updating {
        let Some(backend) = crtc_backend(*crtc) else {
            continue;
        };
        let timeouts = VblankTimeouts::new(refresh(&txn.crtcs[crtc].new), device.config.timeout_scale);
        let mask = device.config.crtc(*crtc).map(|cfg| cfg.trigger_mask).unwrap_or(false);
        vblank::wait_for_framestart(*crtc, backend.as_ref(), timeouts, mask, &device.recovery);
    }

    // frame start post-processing
    for (crtc, c) in &txn.crtcs {
        let freed = c.new.freed_windows();
        if !freed.is_empty() {
            trace!(?crtc, ?freed, "Returning freed windows to the pool");
            device.allocator.release(freed);
        }
        device.backends.hibernation.trig_reset(*crtc);
        if signaled.contains(crtc) {
            continue;
        }
        if let Some(event) = c.new.event {
            device.emit_vblank(*crtc, Some(event.user_data));
        }
        if let Some(signal) = txn.signals.get(crtc) {
            signal.complete_flip();
        }
    }

    // post-commit bandwidth
    {
        let mut tables = device.bw_tables.lock().unwrap();
        for (crtc, c) in &txn.crtcs {
            if updating.contains(crtc) {
                if let Some(request) = c.new.bandwidth() {
                    device.backends.bandwidth.update_bw(*crtc, request, true);
                }
            } else if !c.new.active && c.old.active {
                device.backends.bandwidth.release_bw(*crtc);
                if let Some(table) = tables.get_mut(crtc.0 as usize) {
                    *table = WindowConfigTable::default();
                }
            }
        }
    }

    if let Some(freq_hop) = device.backends.freq_hop.as_ref() {
        for crtc in hopping {
            freq_hop.set_freq_hop(crtc, false);
        }
    }

    drop(hibernation_guard);

    for signal in txn.signals.values() {
        signal.complete_hw();
    }

    // old framebuffers leave the hardware
    for plane in txn.planes.values() {
        if let Some(old) = plane.old.fb.as_ref() {
            let replaced = plane.new.fb.as_ref().map(|new| !Arc::ptr_eq(old, new)).unwrap_or(true);
            if replaced {
                old.cleanup();
            }
        }
    }
    for fb in &txn.abandoned_writeback {
        fb.cleanup();
    }
    debug!("Commit tail done");
}
