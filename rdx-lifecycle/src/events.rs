//! Defines the public report types broadcast by the `Server`.
//!
//! The lifecycle channel of the bus is the internal coordination protocol;
//! these reports are its observable summary. Subscribe with
//! [`Server::subscribe_reports`](crate::server::Server::subscribe_reports).

use crate::common::{ComponentId, Phase, ServerState};
use crate::error::PhaseFailure;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// One step of a phase dispatch.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: Phase,
    pub kind: ReportKind,
    pub at: DateTime<Utc>,
}

/// What happened.
#[derive(Debug, Clone)]
pub enum ReportKind {
    /// `server.<phase>` is about to be published; `order` is the prepared
    /// completion order.
    Dispatched { order: Vec<ComponentId> },
    /// A component published `<id>.<phase>.success`.
    ComponentSucceeded { component: ComponentId, payload: Value },
    /// A component published `<id>.<phase>.error`.
    ComponentFailed { failure: PhaseFailure },
    /// Every component completed the phase; the server moved to `state`.
    Completed { state: ServerState },
    /// The phase failed; the server moved to `state`.
    Failed { state: ServerState, reason: String },
}

impl PhaseReport {
    pub(crate) fn now(phase: Phase, kind: ReportKind) -> Self {
        Self {
            phase,
            kind,
            at: Utc::now(),
        }
    }

    /// The component this report is about, if it is about a single one.
    pub fn component(&self) -> Option<&str> {
        match &self.kind {
            ReportKind::ComponentSucceeded { component, .. } => Some(component),
            ReportKind::ComponentFailed { failure } => Some(&failure.sender),
            _ => None,
        }
    }

    /// `true` for the report that closes a dispatch.
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, ReportKind::Completed { .. } | ReportKind::Failed { .. })
    }
}
