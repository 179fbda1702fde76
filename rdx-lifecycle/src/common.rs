//! Contains common, primitive types shared by every part of the lifecycle core.
//!
//! This module defines the lifecycle [`Phase`] enum, the server-level
//! [`ServerState`] machine, the identifier aliases used for components and bus
//! subscribers, and the helpers that build and parse the topic strings which
//! form the wire format of the internal bus.

use serde::Deserialize;
use slotmap::new_key_type;
use std::fmt;
use std::str::FromStr;

/// A stable, human-readable component identifier (e.g. `"token-factory"`).
pub type ComponentId = String;

new_key_type! {
    /// Uniquely identifies a single subscription inside a channel's table.
    ///
    /// Keys are never reused, so a stale key held after an unsubscribe can not
    /// accidentally refer to a newer subscription.
    pub struct SubscriptionKey;
}

/// One of the four lifecycle phases every component goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Init,
    Start,
    Stop,
    Destroy,
}

impl Phase {
    /// All phases, in their natural order.
    pub const ALL: [Phase; 4] = [Phase::Init, Phase::Start, Phase::Stop, Phase::Destroy];

    /// The lowercase name used in topics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Start => "start",
            Phase::Stop => "stop",
            Phase::Destroy => "destroy",
        }
    }

    /// `stop` and `destroy` walk the components in reverse registration order.
    pub fn is_teardown(self) -> bool {
        matches!(self, Phase::Stop | Phase::Destroy)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Phase::Init),
            "start" => Ok(Phase::Start),
            "stop" => Ok(Phase::Stop),
            "destroy" => Ok(Phase::Destroy),
            other => Err(format!("unknown lifecycle phase '{}'", other)),
        }
    }
}

/// The server's position in the fixed lifecycle sequence.
///
/// ```text
/// Uninitialized ─init─► Initialized ─start─► Started ─stop─► Stopped ─destroy─► Destroyed
///                            │                   ▲               │
///                            │                   └─────start─────┘
///                            └──────────────destroy──────────────────────────► Destroyed
/// ```
///
/// A failed dispatch leaves the server in `Failed`, from which only `stop`
/// and `destroy` are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
    Destroyed,
    Failed(Phase),
}

impl ServerState {
    /// Returns the state reached when `phase` completes, or `None` when the
    /// phase may not be entered from this state.
    pub fn next(self, phase: Phase) -> Option<ServerState> {
        use ServerState::*;
        match (self, phase) {
            (Uninitialized, Phase::Init) => Some(Initialized),
            (Initialized | Stopped, Phase::Start) => Some(Started),
            (Started | Failed(_), Phase::Stop) => Some(Stopped),
            (Initialized | Stopped | Failed(_), Phase::Destroy) => Some(Destroyed),
            _ => None,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Uninitialized => f.write_str("uninitialized"),
            ServerState::Initialized => f.write_str("initialized"),
            ServerState::Started => f.write_str("started"),
            ServerState::Stopped => f.write_str("stopped"),
            ServerState::Destroyed => f.write_str("destroyed"),
            ServerState::Failed(phase) => write!(f, "failed ({})", phase),
        }
    }
}

/// Builders and parsers for the topic strings of the lifecycle channel.
pub mod topics {
    use super::Phase;

    /// Identity the server subscribes and publishes under.
    pub const SERVER: &str = "server";

    /// `server.<phase>`: the phase-start trigger.
    pub fn server(phase: Phase) -> String {
        format!("{}.{}", SERVER, phase)
    }

    /// `<id>.<phase>.success`
    pub fn success(id: &str, phase: Phase) -> String {
        format!("{}.{}.success", id, phase)
    }

    /// `<id>.<phase>.error`
    pub fn error(id: &str, phase: Phase) -> String {
        format!("{}.{}.error", id, phase)
    }

    /// Wildcard pattern matching every component's success report.
    pub const ANY_SUCCESS: &str = "#.success";

    /// Wildcard pattern matching every component's error report.
    pub const ANY_ERROR: &str = "#.error";

    /// Extracts the sender id, the leading segment of a completion topic.
    pub fn sender(topic: &str) -> &str {
        topic.split('.').next().unwrap_or(topic)
    }

    /// Extracts the phase segment of a `<id>.<phase>.<outcome>` topic.
    pub fn phase(topic: &str) -> Option<Phase> {
        topic.split('.').nth(1).and_then(|p| p.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_its_name() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>(), Ok(phase));
        }
        assert!("restart".parse::<Phase>().is_err());
    }

    #[test]
    fn state_machine_allows_restart_but_not_double_init() {
        let s = ServerState::Uninitialized.next(Phase::Init).unwrap();
        assert_eq!(s, ServerState::Initialized);
        assert_eq!(s.next(Phase::Init), None);
        let started = s.next(Phase::Start).unwrap();
        let stopped = started.next(Phase::Stop).unwrap();
        assert_eq!(stopped.next(Phase::Start), Some(ServerState::Started));
        assert_eq!(stopped.next(Phase::Destroy), Some(ServerState::Destroyed));
        assert_eq!(ServerState::Destroyed.next(Phase::Init), None);
        assert_eq!(
            ServerState::Failed(Phase::Start).next(Phase::Stop),
            Some(ServerState::Stopped)
        );
    }

    #[test]
    fn topics_encode_sender_and_phase() {
        let t = topics::success("token-factory", Phase::Start);
        assert_eq!(t, "token-factory.start.success");
        assert_eq!(topics::sender(&t), "token-factory");
        assert_eq!(topics::phase(&t), Some(Phase::Start));
        assert_eq!(topics::server(Phase::Destroy), "server.destroy");
        assert_eq!(topics::phase("server"), None);
    }
}
