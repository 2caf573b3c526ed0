//! Capability data of a display processing unit

use super::{
    error::Error,
    state::CrtcIndex,
    window::{ScanDirection, MAX_WINDOWS},
};

/// Refresh rate substituted for modes that do not report one
pub const DEFAULT_REFRESH: u32 = 60;

/// Realtime priority of the commit workers
pub const DEFAULT_WORKER_PRIORITY: i32 = 87;

/// Capabilities of a single crtc
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcConfig {
    /// End of the window mask the crtc allocates from
    pub scan_direction: ScanDirection,
    /// The panel accepts partial frame updates
    pub partial_update: bool,
    /// The frame trigger is masked while waiting for frame start
    pub trigger_mask: bool,
}

impl Default for CrtcConfig {
    fn default() -> Self {
        CrtcConfig {
            scan_direction: ScanDirection::Low,
            partial_update: false,
            trigger_mask: false,
        }
    }
}

/// Configuration of a [`DpuDevice`](super::DpuDevice)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpuConfig {
    /// Number of hardware windows shared by all crtcs
    pub window_count: u32,
    /// Per-crtc capabilities, indexed by [`CrtcIndex`]
    pub crtcs: Vec<CrtcConfig>,
    /// Crtc driving a panel through two blenders
    pub dual_blender: Option<CrtcIndex>,
    /// Refresh rate assumed for modes reporting zero
    pub default_refresh: u32,
    /// Factor applied to hardware timeouts, for slow emulated hardware
    pub timeout_scale: u32,
    /// Worker threads of the queue running multi-crtc commits
    pub shared_queue_workers: usize,
    /// `SCHED_FIFO` priority requested by the commit workers, `None` keeps default scheduling
    ///
    /// Raising the priority needs `CAP_SYS_NICE`, without it the workers log a warning and
    /// run with default scheduling.
    pub worker_priority: Option<i32>,
}

impl Default for DpuConfig {
    fn default() -> Self {
        DpuConfig {
            window_count: 8,
            crtcs: vec![CrtcConfig::default()],
            dual_blender: None,
            default_refresh: DEFAULT_REFRESH,
            timeout_scale: 1,
            shared_queue_workers: 2,
            worker_priority: Some(DEFAULT_WORKER_PRIORITY),
        }
    }
}

impl DpuConfig {
    /// Configuration for `crtc_count` crtcs sharing `window_count` windows
    ///
    /// A dual-blender crtc allocates from the high end of the window mask, all other
    /// crtcs from the low end. This keeps the wide crtc from fragmenting the windows
    /// of the others.
    pub fn new(window_count: u32, crtc_count: usize, dual_blender: Option<CrtcIndex>) -> Self {
        let crtcs = (0..crtc_count)
            .map(|idx| CrtcConfig {
                scan_direction: if dual_blender == Some(CrtcIndex(idx as u8)) {
                    ScanDirection::High
                } else {
                    ScanDirection::Low
                },
                ..CrtcConfig::default()
            })
            .collect();
        DpuConfig {
            window_count,
            crtcs,
            dual_blender,
            ..DpuConfig::default()
        }
    }

    /// Number of crtcs of the device
    pub fn crtc_count(&self) -> usize {
        self.crtcs.len()
    }

    /// Capabilities of a crtc
    pub fn crtc(&self, crtc: CrtcIndex) -> Option<&CrtcConfig> {
        self.crtcs.get(crtc.0 as usize)
    }

    /// Allocation direction of a crtc
    pub fn scan_direction(&self, crtc: CrtcIndex) -> ScanDirection {
        self.crtc(crtc).map(|c| c.scan_direction).unwrap_or_default()
    }

    /// Whether the crtc is composed by two blenders
    pub fn is_dual_blender(&self, crtc: CrtcIndex) -> bool {
        self.dual_blender == Some(crtc)
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<(), Error> {
        if self.window_count == 0 || self.window_count > MAX_WINDOWS {
            return Err(Error::InvalidConfig("window count must be between 1 and 32"));
        }
        if self.crtcs.is_empty() || self.crtcs.len() > u8::MAX as usize {
            return Err(Error::InvalidConfig("crtc count must be between 1 and 255"));
        }
        if let Some(crtc) = self.dual_blender {
            if crtc.0 as usize >= self.crtcs.len() {
                return Err(Error::InvalidConfig("dual-blender crtc does not exist"));
            }
        }
        if self.default_refresh == 0 {
            return Err(Error::InvalidConfig("default refresh rate must not be zero"));
        }
        if self.timeout_scale == 0 {
            return Err(Error::InvalidConfig("timeout scale must not be zero"));
        }
        if self.shared_queue_workers == 0 {
            return Err(Error::InvalidConfig("shared queue needs at least one worker"));
        }
        if matches!(self.worker_priority, Some(priority) if !(1..=99).contains(&priority)) {
            return Err(Error::InvalidConfig("worker priority must be between 1 and 99"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_blender_scans_high() {
        let config = DpuConfig::new(16, 3, Some(CrtcIndex(1)));
        assert!(config.validate().is_ok());
        assert_eq!(config.scan_direction(CrtcIndex(0)), ScanDirection::Low);
        assert_eq!(config.scan_direction(CrtcIndex(1)), ScanDirection::High);
        assert_eq!(config.scan_direction(CrtcIndex(2)), ScanDirection::Low);
    }

    #[test]
    fn rejects_inconsistent_data() {
        assert!(DpuConfig::new(33, 1, None).validate().is_err());
        assert!(DpuConfig::new(0, 1, None).validate().is_err());
        assert!(DpuConfig::new(8, 0, None).validate().is_err());
        assert!(DpuConfig::new(8, 2, Some(CrtcIndex(2))).validate().is_err());

        let config = DpuConfig {
            timeout_scale: 0,
            ..DpuConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = DpuConfig {
            worker_priority: Some(0),
            ..DpuConfig::default()
        };
        assert!(config.validate().is_err());
        let config = DpuConfig {
            worker_priority: None,
            ..DpuConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
