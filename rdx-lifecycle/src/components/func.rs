//! Closure-backed components.
//!
//! [`FnComponent`] lets an embedder (or a test) describe a component inline:
//! an id, per-phase dependency lists and one async closure per phase it
//! cares about. Each phase call creates a fresh future from the closure, so
//! any state shared between phases has to live in an explicit `Arc`.
//!
//! ```rust
//! use lifecycle::prelude::*;
//! use serde_json::json;
//!
//! let http = FnComponent::builder("http-service")
//!     .depends_on(Phase::Start, ["token-factory"])
//!     .on(Phase::Start, |ctx| async move {
//!         Ok(json!({ "after": ctx.dependencies.len() }))
//!     })
//!     .build();
//! assert_eq!(http.id(), "http-service");
//! ```

use crate::common::{ComponentId, Phase};
use crate::component::{immediate, Component, PhaseContext, PhaseFuture, PhaseResult};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A boxed phase closure.
pub type PhaseFn = Arc<dyn Fn(PhaseContext) -> PhaseFuture<'static> + Send + Sync>;

/// A component whose phase methods are closures.
pub struct FnComponent {
    id: ComponentId,
    dependencies: HashMap<Phase, Vec<ComponentId>>,
    methods: HashMap<Phase, PhaseFn>,
}

impl FnComponent {
    pub fn builder(id: impl Into<ComponentId>) -> FnComponentBuilder {
        FnComponentBuilder {
            inner: FnComponent {
                id: id.into(),
                dependencies: HashMap::new(),
                methods: HashMap::new(),
            },
        }
    }

    fn run(&self, ctx: PhaseContext) -> PhaseFuture<'_> {
        match self.methods.get(&ctx.phase) {
            Some(method) => method(ctx),
            None => immediate(Value::Null),
        }
    }
}

impl Component for FnComponent {
    fn id(&self) -> &str {
        &self.id
    }

    fn dependencies(&self, phase: Phase) -> Vec<ComponentId> {
        self.dependencies.get(&phase).cloned().unwrap_or_default()
    }

    fn init(&self, ctx: PhaseContext) -> PhaseFuture<'_> {
        self.run(ctx)
    }

    fn start(&self, ctx: PhaseContext) -> PhaseFuture<'_> {
        self.run(ctx)
    }

    fn stop(&self, ctx: PhaseContext) -> PhaseFuture<'_> {
        self.run(ctx)
    }

    fn destroy(&self, ctx: PhaseContext) -> PhaseFuture<'_> {
        self.run(ctx)
    }
}

impl std::fmt::Debug for FnComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut phases: Vec<&str> = self.methods.keys().map(|p| p.as_str()).collect();
        phases.sort_unstable();
        f.debug_struct("FnComponent")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("phases", &phases)
            .finish()
    }
}

/// Builder returned by [`FnComponent::builder`].
pub struct FnComponentBuilder {
    inner: FnComponent,
}

impl FnComponentBuilder {
    /// Adds dependencies for `phase`. Repeated calls accumulate.
    pub fn depends_on<I, S>(mut self, phase: Phase, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ComponentId>,
    {
        self.inner
            .dependencies
            .entry(phase)
            .or_default()
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Sets the method for `phase`, replacing any earlier one.
    pub fn on<F, Fut>(mut self, phase: Phase, f: F) -> Self
    where
        F: Fn(PhaseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PhaseResult> + Send + 'static,
    {
        let method: PhaseFn =
            Arc::new(move |ctx: PhaseContext| -> PhaseFuture<'static> { Box::pin(f(ctx)) });
        self.inner.methods.insert(phase, method);
        self
    }

    pub fn build(self) -> Arc<FnComponent> {
        Arc::new(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unset_phases_succeed_with_null() {
        let c = FnComponent::builder("plain").build();
        assert_eq!(c.init(PhaseContext::new(Phase::Init)).await.unwrap(), Value::Null);
        assert!(c.dependencies(Phase::Stop).is_empty());
    }

    #[tokio::test]
    async fn test_closures_and_dependencies_are_per_phase() {
        let c = FnComponent::builder("svc")
            .depends_on(Phase::Start, ["a"])
            .depends_on(Phase::Start, ["b".to_string()])
            .on(Phase::Start, |ctx| async move { Ok(json!(ctx.phase.as_str())) })
            .build();
        assert_eq!(c.dependencies(Phase::Start), vec!["a", "b"]);
        assert!(c.dependencies(Phase::Init).is_empty());
        let out = c.start(PhaseContext::new(Phase::Start)).await.unwrap();
        assert_eq!(out, json!("start"));
        assert_eq!(c.stop(PhaseContext::new(Phase::Stop)).await.unwrap(), Value::Null);
    }
}
