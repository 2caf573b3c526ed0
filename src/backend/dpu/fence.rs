//! Synchronization with buffer producers
//!
//! Every plane state may carry the fence of the producer that renders into its
//! framebuffer. The commit tail waits for these fences before touching the hardware.
//!
//! The wait is first bounded to a few frame periods so a stalled producer is reported,
//! afterwards it continues without bound. Scanning out a buffer that is still being written
//! is never an option.

use std::{
    error::Error,
    fmt,
    time::{Duration, Instant},
};

use downcast_rs::{impl_downcast, Downcast};
use tracing::{trace, warn};

use super::state::PlaneState;

/// Number of frame periods a producer may take before it is reported
pub const FENCE_TIMEOUT_FRAMES: u64 = 5;

/// Waiting for the fence was interrupted for an unknown reason.
///
/// This does not mean that the fence is signalled or not, neither that
/// any timeout was reached. Waiting should be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Wait for Fence was interrupted")
    }
}
impl Error for Interrupted {}

/// A fence that will be signaled in finite time
pub trait Fence: std::fmt::Debug + Send + Sync + Downcast {
    /// Queries the state of the fence
    fn is_signaled(&self) -> bool;

    /// Blocks the current thread until the fence is signaled or the timeout expired
    ///
    /// Returns whether the fence got signaled.
    fn wait_timeout(&self, timeout: Duration) -> Result<bool, Interrupted>;

    /// Blocks the current thread until the fence is signaled
    fn wait(&self) -> Result<(), Interrupted>;

    /// Name of the producer signaling this fence, used for diagnostics
    fn producer(&self) -> String;
}
impl_downcast!(Fence);

/// Diagnostic timeout for a producer fence at the given refresh rate
///
/// Rounds up to whole milliseconds, `refresh` must not be zero.
pub fn fence_timeout(refresh: u32) -> Duration {
    let refresh = refresh.max(1) as u64;
    Duration::from_millis((FENCE_TIMEOUT_FRAMES * 1000 + refresh - 1) / refresh)
}

/// Wait for the producer fence of a plane state, if it still carries one
///
/// The fence is taken out of the state, so a second call for the same state returns
/// immediately.
#[profiling::function]
pub fn wait_plane_fence(plane: &PlaneState, refresh: u32) {
    let Some(fence) = plane.fence().take() else {
        return;
    };
    if fence.is_signaled() {
        return;
    }

    let timeout = fence_timeout(refresh);
    let start = Instant::now();
    match fence.wait_timeout(timeout) {
        Ok(true) => {
            trace!(plane = ?plane.plane(), elapsed = ?start.elapsed(), "Fence signaled");
            return;
        }
        Ok(false) => warn!(
            plane = ?plane.plane(),
            producer = %fence.producer(),
            elapsed = ?start.elapsed(),
            ?timeout,
            "Fence not signaled in time, waiting without timeout"
        ),
        Err(Interrupted) => warn!(
            plane = ?plane.plane(),
            producer = %fence.producer(),
            elapsed = ?start.elapsed(),
            "Fence wait interrupted, waiting without timeout"
        ),
    }

    while fence.wait().is_err() {
        trace!(plane = ?plane.plane(), "Fence wait interrupted, retrying");
    }
    trace!(plane = ?plane.plane(), elapsed = ?start.elapsed(), "Fence signaled late");
}
