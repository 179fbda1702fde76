//! The contract every server subsystem implements to take part in the lifecycle.

use crate::common::{ComponentId, Phase};
use crate::registry::ComponentRegistry;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::{Arc, Weak};

/// The outcome of a phase method. The value is republished on the bus as the
/// payload of `<id>.<phase>.success`.
pub type PhaseResult = anyhow::Result<Value>;

/// Phase methods return boxed futures so `Component` stays object-safe.
pub type PhaseFuture<'a> = BoxFuture<'a, PhaseResult>;

/// Input handed to a phase method.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub phase: Phase,
    /// Payloads reported by the declared dependencies, in declaration order.
    pub dependencies: Vec<(ComponentId, Value)>,
}

impl PhaseContext {
    pub fn new(phase: Phase) -> Self {
        Self {
            phase,
            dependencies: Vec::new(),
        }
    }

    /// The payload a dependency reported for this phase, if any.
    pub fn dependency(&self, id: &str) -> Option<&Value> {
        self.dependencies
            .iter()
            .find(|(dep, _)| dep == id)
            .map(|(_, value)| value)
    }
}

/// A server subsystem with a stable id and optional phase methods.
///
/// Every phase method defaults to immediate success with a `null` payload,
/// so a component only overrides the phases it cares about. Components never
/// call each other's phase methods: the server drives them through the bus.
pub trait Component: Send + Sync + 'static {
    /// Stable identifier; becomes the first segment of the component's topics.
    fn id(&self) -> &str;

    /// Ids of the components that must finish `phase` before this one starts it.
    fn dependencies(&self, _phase: Phase) -> Vec<ComponentId> {
        Vec::new()
    }

    /// Receives the registry lookup once the component has been registered.
    fn attach(&self, _lookup: ComponentLookup) {}

    fn init(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        immediate(Value::Null)
    }

    fn start(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        immediate(Value::Null)
    }

    fn stop(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        immediate(Value::Null)
    }

    fn destroy(&self, _ctx: PhaseContext) -> PhaseFuture<'_> {
        immediate(Value::Null)
    }

    /// Releases whatever the component holds besides its lifecycle handlers.
    /// Called by [`ComponentRegistry::destroy`].
    fn dispose(&self) {}
}

/// A phase future that is already complete.
pub fn immediate(value: Value) -> PhaseFuture<'static> {
    Box::pin(futures::future::ready(Ok(value)))
}

/// Calls the phase method matching `ctx.phase`.
pub(crate) fn call_phase(component: &dyn Component, ctx: PhaseContext) -> PhaseFuture<'_> {
    match ctx.phase {
        Phase::Init => component.init(ctx),
        Phase::Start => component.start(ctx),
        Phase::Stop => component.stop(ctx),
        Phase::Destroy => component.destroy(ctx),
    }
}

/// The registry's lookup-by-id capability, injected into every registered
/// component.
///
/// Holds only a weak reference: the registry owns components, components
/// never own the registry.
#[derive(Clone)]
pub struct ComponentLookup {
    registry: Weak<ComponentRegistry>,
}

impl ComponentLookup {
    pub(crate) fn new(registry: Weak<ComponentRegistry>) -> Self {
        Self { registry }
    }

    /// A lookup that never finds anything.
    pub fn detached() -> Self {
        Self {
            registry: Weak::new(),
        }
    }

    /// Finds a sibling component. `None` if unknown or if the registry is gone.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Component>> {
        self.registry.upgrade()?.get_component(id)
    }
}

impl std::fmt::Debug for ComponentLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentLookup")
            .field("attached", &(self.registry.strong_count() > 0))
            .finish()
    }
}
