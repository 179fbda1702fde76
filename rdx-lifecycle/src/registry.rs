//! The component registry: id to component map and owner of every lifecycle
//! handler.

use crate::bus::EventBus;
use crate::common::{ComponentId, Phase};
use crate::component::{Component, ComponentLookup};
use crate::components::catalog::{ComponentCatalog, ComponentEnv};
use crate::config::{ServerConfig, TeardownPolicy};
use crate::error::LifecycleError;
use crate::graph::DependencyGraph;
use crate::handler::LifecycleEventHandler;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, info, warn};

struct Entry {
    component: Arc<dyn Component>,
    handlers: Vec<LifecycleEventHandler>,
}

/// Holds every registered component, in registration order, together with
/// its four lifecycle handlers.
///
/// The registry is always handled through an `Arc`; components receive a
/// [`ComponentLookup`] that refers back to it weakly.
pub struct ComponentRegistry {
    bus: Arc<EventBus>,
    policy: TeardownPolicy,
    this: Weak<ComponentRegistry>,
    entries: RwLock<Vec<Entry>>,
}

impl ComponentRegistry {
    /// Creates an empty registry whose handlers live on `bus`'s lifecycle
    /// channel.
    pub fn new(bus: Arc<EventBus>, policy: TeardownPolicy) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            bus,
            policy,
            this: this.clone(),
            entries: RwLock::new(Vec::new()),
        })
    }

    /// Instantiates and registers every kind of `catalog` that `config` does
    /// not disable, in catalog order.
    ///
    /// Any failure aborts the whole initialization; components added before
    /// the failure stay registered and are cleaned up by [`destroy`](Self::destroy).
    pub fn init(&self, catalog: &ComponentCatalog, config: &Arc<ServerConfig>) -> Result<usize, LifecycleError> {
        for (kind, settings) in &config.components {
            if settings.enabled && !catalog.contains(kind) {
                return Err(LifecycleError::UnknownComponentKind { kind: kind.clone() });
            }
        }

        let mut added = 0;
        for (kind, factory) in catalog.iter() {
            if !config.is_enabled(kind) {
                info!("Component kind '{}' is disabled by configuration.", kind);
                continue;
            }
            let env = ComponentEnv::new(kind, self.bus.clone(), config.clone());
            let component = factory(&env).map_err(|source| LifecycleError::Construction {
                kind: kind.to_string(),
                source,
            })?;
            if self.add_component(component, false)? {
                added += 1;
            }
        }
        info!("Component registry initialized with {} component(s).", added);
        Ok(added)
    }

    /// Registers `component`, creating and attaching its lifecycle handlers
    /// and injecting the lookup capability.
    ///
    /// A second component with the same id is an error unless
    /// `ignore_duplicated` is set, in which case the first one is kept and
    /// `Ok(false)` is returned.
    ///
    /// # Panics
    ///
    /// Panics if the component's id is empty.
    pub fn add_component(
        &self,
        component: Arc<dyn Component>,
        ignore_duplicated: bool,
    ) -> Result<bool, LifecycleError> {
        let id = component.id().to_string();
        assert!(!id.is_empty(), "component should have an id");
        if id.contains(&['.', '*', '#'][..]) {
            return Err(LifecycleError::InvalidComponentId { id });
        }

        let handlers = {
            let mut entries = self.write();
            if entries.iter().any(|e| e.component.id() == id) {
                if ignore_duplicated {
                    debug!("ignores duplicated component id '{}'", id);
                    return Ok(false);
                }
                return Err(LifecycleError::DuplicateComponent { id });
            }
            let lifecycle = self.bus.lifecycle();
            let handlers: Vec<LifecycleEventHandler> = Phase::ALL
                .iter()
                .map(|&phase| {
                    LifecycleEventHandler::new(component.clone(), lifecycle.clone(), phase, self.policy)
                })
                .collect();
            entries.push(Entry {
                component: component.clone(),
                handlers: handlers.clone(),
            });
            handlers
        };

        // Subscriptions and the lookup hook run outside the registry lock so a
        // component may look up its siblings from `attach`.
        for handler in &handlers {
            handler.attach();
        }
        component.attach(self.lookup());
        debug!("registered component '{}'", id);
        Ok(true)
    }

    pub fn get_component(&self, id: &str) -> Option<Arc<dyn Component>> {
        self.read()
            .iter()
            .find(|e| e.component.id() == id)
            .map(|e| e.component.clone())
    }

    /// Ids in registration order.
    pub fn component_ids(&self) -> Vec<ComponentId> {
        self.read()
            .iter()
            .map(|e| e.component.id().to_string())
            .collect()
    }

    /// Components in registration order.
    pub fn components(&self) -> Vec<Arc<dyn Component>> {
        self.read().iter().map(|e| e.component.clone()).collect()
    }

    /// The handler driving `phase` for component `id`.
    pub fn handler(&self, id: &str, phase: Phase) -> Option<LifecycleEventHandler> {
        self.read()
            .iter()
            .find(|e| e.component.id() == id)
            .and_then(|e| e.handlers.iter().find(|h| h.phase() == phase).cloned())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of the declared dependencies of every registered component.
    pub fn dependency_graph(&self) -> DependencyGraph {
        DependencyGraph::from_components(&self.components())
    }

    /// A lookup capability bound to this registry.
    pub fn lookup(&self) -> ComponentLookup {
        ComponentLookup::new(self.this.clone())
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Disposes every handler and every component and empties the registry.
    /// No phase method is called.
    pub fn destroy(&self) {
        let entries: Vec<Entry> = self.write().drain(..).collect();
        for entry in entries.iter().rev() {
            for handler in &entry.handlers {
                handler.dispose();
            }
            entry.component.dispose();
        }
        if entries.is_empty() {
            warn!("destroying an empty component registry");
        } else {
            info!("Component registry destroyed ({} component(s) disposed).", entries.len());
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::func::FnComponent;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn registry() -> Arc<ComponentRegistry> {
        ComponentRegistry::new(Arc::new(EventBus::new()), TeardownPolicy::Strict)
    }

    #[test]
    fn test_add_component_attaches_four_handlers() {
        let registry = registry();
        assert!(registry.add_component(FnComponent::builder("a").build(), false).unwrap());
        assert_eq!(registry.component_ids(), vec!["a"]);
        for phase in Phase::ALL {
            let handler = registry.handler("a", phase).unwrap();
            assert_eq!(handler.name(), format!("a/{}/handler", phase));
        }
        assert_eq!(registry.bus().lifecycle().subscription_count(), 4);
    }

    #[test]
    fn test_duplicates_fail_unless_ignored() {
        let registry = registry();
        let first = FnComponent::builder("a").build();
        registry.add_component(first.clone(), false).unwrap();
        let err = registry
            .add_component(FnComponent::builder("a").build(), false)
            .unwrap_err();
        assert_eq!(err.as_label(), "duplicate_component");
        assert!(!registry
            .add_component(FnComponent::builder("a").build(), true)
            .unwrap());
        let kept = registry.get_component("a").unwrap();
        assert_eq!(
            Arc::as_ptr(&kept) as *const (),
            Arc::as_ptr(&first) as *const ()
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_ids_with_topic_syntax_are_rejected() {
        let registry = registry();
        for bad in ["a.b", "a*", "#"] {
            let err = registry
                .add_component(FnComponent::builder(bad).build(), false)
                .unwrap_err();
            assert_eq!(err.as_label(), "invalid_component_id");
        }
        assert!(registry.is_empty());
    }

    #[test]
    #[should_panic(expected = "component should have an id")]
    fn test_empty_id_is_a_programming_error() {
        registry()
            .add_component(FnComponent::builder("").build(), false)
            .ok();
    }

    struct Sibling {
        id: &'static str,
        lookup: Mutex<Option<ComponentLookup>>,
        disposed: AtomicBool,
    }

    impl Component for Sibling {
        fn id(&self) -> &str {
            self.id
        }

        fn attach(&self, lookup: ComponentLookup) {
            *self.lookup.lock().unwrap() = Some(lookup);
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_lookup_finds_siblings_until_registry_is_dropped() {
        let registry = registry();
        let sibling = Arc::new(Sibling {
            id: "sibling",
            lookup: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        registry.add_component(sibling.clone(), false).unwrap();
        registry.add_component(FnComponent::builder("other").build(), false).unwrap();

        let lookup = sibling.lookup.lock().unwrap().clone().unwrap();
        assert_eq!(lookup.get("other").unwrap().id(), "other");
        assert!(lookup.get("missing").is_none());

        registry.destroy();
        assert!(sibling.disposed.load(Ordering::SeqCst));
        assert!(registry.is_empty());
        assert_eq!(registry.bus().lifecycle().subscription_count(), 0);
        assert!(lookup.get("other").is_none());

        drop(registry);
        assert!(lookup.get("sibling").is_none());
    }

    #[test]
    fn test_init_builds_enabled_catalog_kinds() {
        let registry = registry();
        let mut catalog = ComponentCatalog::new();
        catalog.register("one", |_env| Ok(FnComponent::builder("one").build() as Arc<dyn Component>));
        catalog.register("two", |env| {
            let id = env.option("id").unwrap_or("two").to_string();
            Ok(FnComponent::builder(id).build() as Arc<dyn Component>)
        });
        catalog.register("three", |_env| Ok(FnComponent::builder("three").build() as Arc<dyn Component>));
        let config = ServerConfig::from_toml(
            r#"
            [components.two.options]
            id = "renamed"
            [components.three]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(registry.init(&catalog, &Arc::new(config)).unwrap(), 2);
        assert_eq!(registry.component_ids(), vec!["one", "renamed"]);
    }

    #[test]
    fn test_init_fails_on_factory_error_and_unknown_kind() {
        let mut catalog = ComponentCatalog::new();
        catalog.register("broken", |_env| Err(anyhow::anyhow!("missing binary")));
        let err = registry()
            .init(&catalog, &Arc::new(ServerConfig::default()))
            .unwrap_err();
        assert_eq!(err.as_label(), "construction_failed");

        let config = ServerConfig::from_toml("[components.ghost]\nenabled = true").unwrap();
        let err = registry()
            .init(&ComponentCatalog::new(), &Arc::new(config))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::UnknownComponentKind { ref kind } if kind == "ghost"));
    }
}
