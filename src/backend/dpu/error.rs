use rustix::io::Errno;

use super::{
    check::CheckStage,
    state::{ConnectorId, CrtcIndex, Mode, PlaneId},
    window::WindowMask,
};

/// Boxed error produced by one of the hardware backends
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error produced by a hardware backend, annotated with what the core was doing
#[derive(Debug, thiserror::Error)]
#[error("Backend error: {errmsg} ({source})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Underlying backend error
    #[source]
    pub source: BackendError,
}

/// Errors thrown by the [`DpuDevice`](super::DpuDevice) while checking or
/// committing a transaction.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device has been detached, no further transactions are accepted
    #[error("Device is detached, operation rejected")]
    DeviceDetached,
    /// The configuration passed to attach is inconsistent
    #[error("Invalid device configuration: {0}")]
    InvalidConfig(&'static str),
    /// The transaction refers to an object the device does not know
    #[error("Unknown object `{0}`")]
    UnknownObject(String),
    /// A backend call failed
    #[error(transparent)]
    Access(#[from] AccessError),
    /// An enabled crtc has no usable mode
    #[error("Mode `{mode:?}` is invalid for enabled crtc `{crtc:?}`")]
    InvalidMode {
        /// Crtc
        crtc: CrtcIndex,
        /// Rejected mode
        mode: Mode,
    },
    /// A connector refused the mode of its crtc
    #[error("Mode `{mode:?}` is not compatible with connector `{connector:?}`")]
    ModeNotSuitable {
        /// Connector
        connector: ConnectorId,
        /// Rejected mode
        mode: Mode,
    },
    /// This operation would result in an enabled crtc without connectors.
    #[error("Crtc `{0:?}` would be enabled without connectors, which is not accepted")]
    NoConnectors(CrtcIndex),
    /// A plane was bound to a crtc it cannot feed
    #[error("Plane `{1:?}` is not compatible for use with crtc `{0:?}`")]
    PlaneNotCompatible(CrtcIndex, PlaneId),
    /// A connector was bound to a crtc that cannot drive it
    #[error("Connector `{1:?}` is not compatible for use with crtc `{0:?}`")]
    ConnectorNotCompatible(CrtcIndex, ConnectorId),
    /// The plane configuration was refused
    #[error("Plane `{plane:?}` rejected: {reason}")]
    PlaneCheck {
        /// Plane
        plane: PlaneId,
        /// Why the configuration is invalid
        reason: &'static str,
    },
    /// Not enough free hardware windows to satisfy the transaction
    #[error(
        "No windows available on crtc `{crtc:?}`: {required} required, {reserved:?} reserved, {available:?} free"
    )]
    NoWindows {
        /// Crtc requesting windows
        crtc: CrtcIndex,
        /// Windows the crtc needs in total
        required: u32,
        /// Windows the crtc already holds
        reserved: WindowMask,
        /// Windows left in the pool
        available: WindowMask,
    },
    /// A trusted UI session owns the crtc
    #[error("Crtc `{0:?}` is owned by a trusted UI session")]
    TuiActive(CrtcIndex),
    /// Protected content would reach a capture path
    #[error("Protected buffer on plane `{plane:?}` cannot be routed to writeback on crtc `{crtc:?}`")]
    SecureViolation {
        /// Crtc
        crtc: CrtcIndex,
        /// Plane carrying the protected buffer
        plane: PlaneId,
    },
    /// The transaction needs a full modeset but was not allowed to perform one
    #[error("Crtc `{0:?}` requires a modeset, but the transaction does not allow it")]
    ModesetNotAllowed(CrtcIndex),
    /// Another transaction changed an object since this one was built
    #[error("State of `{0}` changed since the transaction was built, rebuild and retry")]
    StaleState(String),
    /// The check pipeline failed in the given stage
    #[error("Atomic check failed in stage {stage:?}")]
    CheckFailed {
        /// Stage that failed
        stage: CheckStage,
        /// Underlying reason
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn access(errmsg: &'static str, source: BackendError) -> Self {
        Error::Access(AccessError { errmsg, source })
    }

    /// Returns the error without check pipeline annotations
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::CheckFailed { source, .. } => source.root_cause(),
            x => x,
        }
    }

    /// Kernel-style error code for the error, as reported by the failed system call
    pub fn errno(&self) -> Errno {
        match self {
            Error::CheckFailed { source, .. } => source.errno(),
            Error::DeviceDetached => Errno::NODEV,
            Error::InvalidConfig(_) | Error::UnknownObject(_) => Errno::INVAL,
            Error::Access(_) => Errno::IO,
            Error::InvalidMode { .. }
            | Error::ModeNotSuitable { .. }
            | Error::NoConnectors(_)
            | Error::PlaneNotCompatible(..)
            | Error::ConnectorNotCompatible(..)
            | Error::PlaneCheck { .. }
            | Error::ModesetNotAllowed(_) => Errno::INVAL,
            Error::NoWindows { .. } => Errno::NOSPC,
            Error::TuiActive(_) => Errno::BUSY,
            Error::SecureViolation { .. } => Errno::PERM,
            Error::StaleState(_) => Errno::DEADLK,
        }
    }
}
