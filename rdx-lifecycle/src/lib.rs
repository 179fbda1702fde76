//! # Lifecycle
//!
//! Dependency-ordered lifecycle coordination for the components of a
//! long-running server.
//!
//! A server hosts a set of components (token factory, authenticator,
//! registries, HTTP and socket services, ...). Each of them goes through the
//! same four phases, and within a phase a component may only run once the
//! components it depends on have finished that phase.
//!
//! ## Core Concepts
//!
//! - **EventBus**: Named channels carrying topic-addressed messages. The
//!   `lifecycle` channel is the coordination protocol: `server.<phase>`
//!   starts a phase, `<id>.<phase>.success` and `<id>.<phase>.error` report
//!   completion.
//! - **Lifecycle Event Handler**: One per component and phase. It waits for
//!   the component's dependencies, calls the phase method and publishes the
//!   outcome. A dependency failure is propagated without calling the method.
//! - **ComponentRegistry**: Owns the components and their handlers, and lets
//!   components look each other up.
//! - **Server**: Walks the state machine, publishes each phase and waits until
//!   every component has reported back.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use lifecycle::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // 1. Describe the components and their start dependencies.
//!     let catalog = ComponentCatalog::new()
//!         .with("tokens", |_env| {
//!             Ok(FnComponent::builder("tokens").build() as Arc<dyn Component>)
//!         })
//!         .with("http", |_env| {
//!             let http = FnComponent::builder("http")
//!                 .depends_on(Phase::Start, ["tokens"])
//!                 .on(Phase::Start, |_ctx| async { Ok(json!({ "port": 5000 })) })
//!                 .build();
//!             Ok(http as Arc<dyn Component>)
//!         });
//!
//!     // 2. Build the server and watch its reports.
//!     let server = Server::new(ServerConfig::default(), &catalog)?;
//!     let mut reports = server.subscribe_reports();
//!     tokio::spawn(async move {
//!         while let Ok(report) = reports.recv().await {
//!             println!("{:?}", report.kind);
//!         }
//!     });
//!
//!     // 3. Drive the phases.
//!     server.init().await?;
//!     server.start().await?;
//!     server.stop().await?;
//!     server.destroy().await?;
//!     Ok(())
//! }
//! ```

pub const SERVER_NAME: &str = "Lifecycle Server";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Declare all the modules in the crate.
pub mod bus;
pub mod common;
pub mod component;
pub mod components;
pub mod config;
pub mod deferred;
pub mod error;
pub mod events;
pub mod graph;
pub mod handler;
pub mod registry;
pub mod server;

/// A prelude module for easy importing of the most common lifecycle types.
pub mod prelude {
    pub use crate::bus::{Channel, EventBus, Message};
    pub use crate::common::{topics, ComponentId, Phase, ServerState};
    pub use crate::component::{Component, ComponentLookup, PhaseContext, PhaseFuture};
    pub use crate::components::catalog::{ComponentCatalog, ComponentEnv};
    pub use crate::components::func::FnComponent;
    pub use crate::config::{ServerConfig, TeardownPolicy};
    pub use crate::deferred::{Deferred, DeferredMap};
    pub use crate::error::{BusError, LifecycleError, PhaseFailure};
    pub use crate::events::{PhaseReport, ReportKind};
    pub use crate::server::Server;
}
