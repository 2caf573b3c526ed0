use std::{sync::Arc, time::Duration};

use dpu_atomic::{
    backend::dpu::{
        hw::Framebuffer,
        state::{CommitFlags, ConnectorId, CrtcIndex, Mode, PlaneId},
        DpuConfig, DpuDevice, DpuEvent, Error,
    },
    reexports::calloop::{EventLoop, LoopSignal},
    utils::{Rectangle, Size},
};
use tracing::{error, info, warn};

mod hw;

use hw::SimFramebuffer;

const MODE: Mode = Mode::new(1080, 2400, 60);

struct Sim {
    device: DpuDevice,
    buffers: Vec<Arc<SimFramebuffer>>,
    frames: u32,
    target: u32,
    signal: LoopSignal,
}

impl Sim {
    fn next_buffer(&self) -> Arc<dyn Framebuffer> {
        self.buffers[self.frames as usize % self.buffers.len()].clone()
    }

    fn modeset(&mut self) -> Result<(), Error> {
        let crtc = CrtcIndex(0);
        let mut state = self.device.begin(CommitFlags::ALLOW_MODESET)?;
        let crtc_state = state.crtc_state_mut(crtc)?;
        crtc_state.active = true;
        crtc_state.mode = MODE;
        crtc_state.request_event(0);
        state.set_connector_crtc(ConnectorId(0), Some(crtc))?;

        state.set_plane_crtc(PlaneId(0), Some(crtc))?;
        let fb = self.next_buffer();
        let plane = state.plane_state_mut(PlaneId(0))?;
        plane.fb = Some(fb);
        plane.src = Rectangle::from_size((1080, 2400));
        plane.dst = Rectangle::from_size((1080, 2400));

        // a status bar on top
        state.set_plane_crtc(PlaneId(1), Some(crtc))?;
        let plane = state.plane_state_mut(PlaneId(1))?;
        plane.fb = Some(SimFramebuffer::new("status-bar", Size::new(1080, 96)));
        plane.src = Rectangle::from_size((1080, 96));
        plane.dst = Rectangle::from_size((1080, 96));
        plane.zpos = 1;

        let checked = self.device.check(state)?;
        self.device.commit(checked, false)?;
        Ok(())
    }

    fn flip(&mut self) -> Result<(), Error> {
        let mut state = self.device.begin(CommitFlags::empty())?;
        state.crtc_state_mut(CrtcIndex(0))?.request_event(self.frames as u64);
        let fb = self.next_buffer();
        state.plane_state_mut(PlaneId(0))?.fb = Some(fb);
        let checked = self.device.check(state)?;
        self.device.commit(checked, true)?;
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().init();
    }

    let mut target = 120;
    let mut dual_blender = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-f" | "--frames" => {
                if let Some(frames) = args.next().and_then(|f| f.parse().ok()) {
                    target = frames;
                }
            }
            "--dual-blender" => dual_blender = Some(CrtcIndex(0)),
            other => warn!("Ignoring unknown argument {}", other),
        }
    }

    let config = DpuConfig::new(8, 1, dual_blender);
    let (device, notifier) = DpuDevice::attach(config, hw::backends(1, 4))?;

    let mut event_loop: EventLoop<'_, Sim> = EventLoop::try_new()?;
    event_loop
        .handle()
        .insert_source(notifier, |event, metadata, sim| match event {
            DpuEvent::VBlank(crtc) => {
                sim.frames += 1;
                if sim.frames % 60 == 0 {
                    info!(?crtc, sequence = metadata.sequence, frame = ?metadata.user_data, "Presented");
                }
                if sim.frames >= sim.target {
                    sim.signal.stop();
                } else if let Err(err) = sim.flip() {
                    error!("Page flip failed: {}", err);
                    sim.signal.stop();
                }
            }
            DpuEvent::Recovery { crtc, reason } => warn!(?crtc, ?reason, "Crtc was recovered"),
        })
        .map_err(|err| err.error)?;

    let mut sim = Sim {
        device,
        buffers: (0..3)
            .map(|idx| SimFramebuffer::new(format!("scanout-{}", idx), Size::new(1080, 2400)))
            .collect(),
        frames: 0,
        target,
        signal: event_loop.get_signal(),
    };
    sim.modeset()?;
    info!(
        windows = ?sim.device.crtc_state(CrtcIndex(0)).map(|c| c.reserved_windows()),
        "Display running"
    );

    event_loop.run(Some(Duration::from_millis(100)), &mut sim, |_| {})?;
    info!(frames = sim.frames, "Done");
    Ok(())
}
