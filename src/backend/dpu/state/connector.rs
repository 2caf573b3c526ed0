use std::sync::Arc;

use super::{ConnectorId, CrtcIndex};
use crate::backend::dpu::hw::Framebuffer;

/// Kind of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    /// MIPI DSI panel
    Dsi,
    /// DisplayPort sink
    DisplayPort,
    /// Memory writeback of the composed frame
    Writeback,
}

/// Capture job of a writeback connector
#[derive(Debug, Clone)]
pub struct WritebackJob {
    /// Framebuffer receiving the composed frame
    pub fb: Arc<dyn Framebuffer>,
}

/// State of a single connector within a transaction
#[derive(Debug, Clone)]
pub struct ConnectorState {
    pub(crate) connector: ConnectorId,
    pub(crate) kind: ConnectorKind,
    pub(crate) crtc: Option<CrtcIndex>,
    /// New capture job, only valid for writeback connectors
    pub writeback_job: Option<WritebackJob>,
}

impl ConnectorState {
    pub(crate) fn new(connector: ConnectorId, kind: ConnectorKind) -> Self {
        ConnectorState {
            connector,
            kind,
            crtc: None,
            writeback_job: None,
        }
    }

    /// Copy of this state as the starting point of a new transaction
    ///
    /// A queued writeback job belongs to the commit that queued it.
    pub(crate) fn duplicate(&self) -> Self {
        ConnectorState {
            writeback_job: None,
            ..self.clone()
        }
    }

    /// Connector this state belongs to
    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    /// Kind of the connector
    pub fn kind(&self) -> ConnectorKind {
        self.kind
    }

    /// Crtc driving the connector
    pub fn crtc(&self) -> Option<CrtcIndex> {
        self.crtc
    }

    /// Whether this is a writeback connector
    pub fn is_writeback(&self) -> bool {
        self.kind == ConnectorKind::Writeback
    }
}
