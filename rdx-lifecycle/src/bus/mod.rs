//! The in-process event bus.
//!
//! This module replaces direct calls between subsystems: components publish
//! and subscribe to topics on named [`Channel`]s, and the lifecycle core uses
//! the `lifecycle` channel to coordinate phases.
//!
//! The bus is fail-open. Unknown topics, missing subscribers and failing
//! callbacks are logged, never returned to the publisher, so one broken
//! subscriber can not wedge delivery to the others.

mod channel;
mod topic;

pub use channel::{callback, Callback, Channel, Envelope, Message, Responder};
pub use topic::TopicPattern;

pub(crate) use channel::panic_message;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Names of the channels created together with every bus.
pub mod channels {
    pub const LIFECYCLE: &str = "lifecycle";
    pub const WORKSPACE: &str = "workspace";
    pub const SESSION: &str = "session";
    pub const SOCKET: &str = "socket";

    pub const PRESET: [&str; 4] = [LIFECYCLE, WORKSPACE, SESSION, SOCKET];
}

/// A set of named channels.
///
/// The bus is an explicit object: the server creates one and hands it by
/// `Arc` to the registry and to every component it builds.
pub struct EventBus {
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl EventBus {
    /// Creates a bus with the preset channels already open.
    pub fn new() -> Self {
        let bus = Self {
            channels: Mutex::new(HashMap::new()),
        };
        for name in channels::PRESET {
            bus.channel(name);
        }
        bus
    }

    /// Returns the channel called `name`, creating it on first use.
    pub fn channel(&self, name: &str) -> Arc<Channel> {
        self.lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("opening bus channel '{}'", name);
                Arc::new(Channel::new(name))
            })
            .clone()
    }

    /// Shortcut for the `lifecycle` channel.
    pub fn lifecycle(&self) -> Arc<Channel> {
        self.channel(channels::LIFECYCLE)
    }

    /// Disposes the channel called `name`. Returns `false` if it did not exist.
    pub fn remove_channel(&self, name: &str) -> bool {
        match self.lock().remove(name) {
            Some(channel) => {
                channel.dispose();
                true
            }
            None => false,
        }
    }

    /// Names of the open channels, sorted.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Disposes every channel. Used only at full server teardown.
    pub fn reset(&self) {
        let drained: Vec<Arc<Channel>> = self.lock().drain().map(|(_, ch)| ch).collect();
        for channel in &drained {
            channel.dispose();
        }
        debug!("event bus reset, {} channel(s) disposed", drained.len());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Channel>>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_channels_exist_and_lookups_are_shared() {
        let bus = EventBus::new();
        assert_eq!(
            bus.channel_names(),
            vec!["lifecycle", "session", "socket", "workspace"]
        );
        let a = bus.channel("custom");
        let b = bus.channel("custom");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&bus.lifecycle(), &bus.channel(channels::LIFECYCLE)));
    }

    #[test]
    fn reset_drops_every_subscription() {
        let bus = EventBus::new();
        let lifecycle = bus.lifecycle();
        lifecycle.subscribe_one("x", "#", |_, _| Ok(()));
        bus.reset();
        assert!(bus.channel_names().is_empty());
        assert_eq!(lifecycle.subscription_count(), 0);
        assert!(!bus.remove_channel("lifecycle"));
    }
}
