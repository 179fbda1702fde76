//! Error types used by the lifecycle core.
//!
//! - [`LifecycleError`]: failures of the registry, the dependency graph and
//!   the server dispatcher.
//! - [`PhaseFailure`]: a single component's failed phase, as carried on the
//!   bus in `<id>.<phase>.error` messages.
//! - [`BusError`]: failures of a channel request/response round-trip.

use crate::common::{ComponentId, Phase, ServerState};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Raised when a [`Deferred`](crate::deferred::Deferred) is dropped before it
/// was settled.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("deferred value was dropped before it settled")]
pub struct Abandoned;

/// What made a component's phase fail.
#[derive(Debug, Clone)]
pub enum FailureCause {
    /// The component's own phase method returned an error or panicked.
    Method(Arc<anyhow::Error>),
    /// A declared dependency failed the same phase first.
    Dependency(Box<PhaseFailure>),
    /// The handler was disposed while the phase was in flight.
    Disposed,
}

/// A component phase failure, attributed to the component that reports it.
///
/// `sender` is always the id of the component whose handler published the
/// error, so wildcard subscribers can tell who failed without parsing topics.
#[derive(Debug, Clone)]
pub struct PhaseFailure {
    pub sender: ComponentId,
    pub phase: Phase,
    pub cause: FailureCause,
}

impl PhaseFailure {
    pub fn method(sender: impl Into<ComponentId>, phase: Phase, error: anyhow::Error) -> Self {
        Self {
            sender: sender.into(),
            phase,
            cause: FailureCause::Method(Arc::new(error)),
        }
    }

    pub fn dependency(sender: impl Into<ComponentId>, phase: Phase, upstream: PhaseFailure) -> Self {
        Self {
            sender: sender.into(),
            phase,
            cause: FailureCause::Dependency(Box::new(upstream)),
        }
    }

    /// Re-attributes this failure to `sender`, as done when a dependency's
    /// error message reaches a dependent handler.
    pub fn with_sender(mut self, sender: impl Into<ComponentId>) -> Self {
        self.sender = sender.into();
        self
    }

    /// The component at the bottom of the cause chain, the one that actually broke.
    pub fn root_sender(&self) -> &str {
        match &self.cause {
            FailureCause::Dependency(upstream) => upstream.root_sender(),
            _ => &self.sender,
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self.cause {
            FailureCause::Method(_) => "phase_method_failed",
            FailureCause::Dependency(_) => "phase_dependency_failed",
            FailureCause::Disposed => "phase_handler_disposed",
        }
    }
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "component '{}' failed to {}", self.sender, self.phase)?;
        match &self.cause {
            FailureCause::Method(err) => write!(f, ": {:#}", err),
            FailureCause::Dependency(upstream) => write!(f, " <- {}", upstream),
            FailureCause::Disposed => f.write_str(": handler disposed"),
        }
    }
}

impl std::error::Error for PhaseFailure {}

/// Errors produced by the registry, the dependency graph and the dispatcher.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// A component failed the dispatched phase.
    #[error(transparent)]
    Phase(#[from] PhaseFailure),

    /// One or more components failed a best-effort teardown phase.
    #[error("{} component(s) failed to {phase}: {}", .failures.len(), join_senders(.failures))]
    Teardown {
        phase: Phase,
        failures: Vec<PhaseFailure>,
    },

    /// A second component tried to register under an existing id.
    #[error("duplicated component id '{id}'")]
    DuplicateComponent { id: ComponentId },

    /// Component ids end up inside topic strings, so they must be plain words.
    #[error("invalid component id '{id}': ids must not contain '.', '*' or '#'")]
    InvalidComponentId { id: ComponentId },

    /// The catalog has no factory for a kind named in the configuration.
    #[error("unknown component kind '{kind}'")]
    UnknownComponentKind { kind: String },

    /// A catalog factory failed to build its component.
    #[error("failed to construct component '{kind}'")]
    Construction {
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    /// A component declared a dependency that is not registered.
    #[error("component '{component}' depends on unregistered '{dependency}' for {phase}")]
    UnknownDependency {
        component: ComponentId,
        dependency: ComponentId,
        phase: Phase,
    },

    /// The declared dependencies for a phase can never all be satisfied.
    #[error("dependency cycle during {phase} among {members:?}")]
    DependencyCycle {
        phase: Phase,
        members: Vec<ComponentId>,
    },

    /// The server was asked to run a phase its current state does not allow.
    #[error("cannot {phase} while server is {from}")]
    InvalidTransition { from: ServerState, phase: Phase },

    /// A pending result was dropped without being settled.
    #[error(transparent)]
    Abandoned(#[from] Abandoned),

    /// Configuration could not be loaded or deserialized.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl LifecycleError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            LifecycleError::Phase(failure) => failure.as_label(),
            LifecycleError::Teardown { .. } => "teardown_failed",
            LifecycleError::DuplicateComponent { .. } => "duplicate_component",
            LifecycleError::InvalidComponentId { .. } => "invalid_component_id",
            LifecycleError::UnknownComponentKind { .. } => "unknown_component_kind",
            LifecycleError::Construction { .. } => "construction_failed",
            LifecycleError::UnknownDependency { .. } => "unknown_dependency",
            LifecycleError::DependencyCycle { .. } => "dependency_cycle",
            LifecycleError::InvalidTransition { .. } => "invalid_transition",
            LifecycleError::Abandoned(_) => "abandoned",
            LifecycleError::Config(_) => "config",
        }
    }

    /// The component blamed for a phase failure, if this is one.
    pub fn sender(&self) -> Option<&str> {
        match self {
            LifecycleError::Phase(failure) => Some(&failure.sender),
            LifecycleError::Teardown { failures, .. } => failures.first().map(|f| f.sender.as_str()),
            _ => None,
        }
    }
}

fn join_senders(failures: &[PhaseFailure]) -> String {
    failures
        .iter()
        .map(|f| f.sender.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors produced by a channel request/response round-trip.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Every responder handle was dropped without replying.
    #[error("no responder replied to '{topic}'")]
    NoResponder { topic: String },

    /// The responder rejected the request.
    #[error("request '{topic}' rejected: {reason}")]
    Rejected { topic: String, reason: String },

    #[doc(hidden)]
    #[error(transparent)]
    Abandoned(#[from] Abandoned),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_chain_keeps_root_sender() {
        let root = PhaseFailure::method("a", Phase::Start, anyhow::anyhow!("boom"));
        let wrapped = PhaseFailure::dependency("b", Phase::Start, root);
        assert_eq!(wrapped.sender, "b");
        assert_eq!(wrapped.root_sender(), "a");
        assert_eq!(
            wrapped.to_string(),
            "component 'b' failed to start <- component 'a' failed to start: boom"
        );
        assert_eq!(wrapped.as_label(), "phase_dependency_failed");
    }

    #[test]
    fn lifecycle_error_exposes_sender() {
        let err: LifecycleError =
            PhaseFailure::method("a", Phase::Init, anyhow::anyhow!("nope")).into();
        assert_eq!(err.sender(), Some("a"));
        assert_eq!(err.as_label(), "phase_method_failed");
        assert_eq!(
            LifecycleError::DuplicateComponent { id: "a".into() }.sender(),
            None
        );
    }
}
