//! The compile-time table of component factories.

use super::builtin;
use crate::bus::EventBus;
use crate::component::Component;
use crate::config::ServerConfig;
use std::sync::Arc;

/// Builds one component. Failing here aborts registry initialization.
pub type Factory = Arc<dyn Fn(&ComponentEnv) -> anyhow::Result<Arc<dyn Component>> + Send + Sync>;

/// Everything a factory may use to build its component.
pub struct ComponentEnv {
    kind: String,
    bus: Arc<EventBus>,
    config: Arc<ServerConfig>,
}

impl ComponentEnv {
    pub fn new(kind: &str, bus: Arc<EventBus>, config: Arc<ServerConfig>) -> Self {
        Self {
            kind: kind.to_string(),
            bus,
            config,
        }
    }

    /// The catalog kind being built.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// A factory option from `[components.<kind>.options]`.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.config.option(&self.kind, key)
    }
}

/// An ordered kind → factory table.
///
/// Order matters: the registry instantiates kinds in catalog order, and that
/// registration order breaks ties in the dispatch order of every phase.
#[derive(Clone, Default)]
pub struct ComponentCatalog {
    entries: Vec<(String, Factory)>,
}

impl ComponentCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stand-in IDE server subsystems, see [`builtin`].
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        builtin::register_all(&mut catalog);
        catalog
    }

    /// Adds `kind`, or replaces its factory in place if it is already known.
    pub fn register<F>(&mut self, kind: &str, factory: F) -> &mut Self
    where
        F: Fn(&ComponentEnv) -> anyhow::Result<Arc<dyn Component>> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(factory);
        match self.entries.iter_mut().find(|(k, _)| k == kind) {
            Some((_, existing)) => *existing = factory,
            None => self.entries.push((kind.to_string(), factory)),
        }
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, kind: &str, factory: F) -> Self
    where
        F: Fn(&ComponentEnv) -> anyhow::Result<Arc<dyn Component>> + Send + Sync + 'static,
    {
        self.register(kind, factory);
        self
    }

    /// Applies `overrides` on top of this catalog: known kinds get the
    /// override's factory, new kinds are appended.
    pub fn merge(&mut self, overrides: ComponentCatalog) -> &mut Self {
        for (kind, factory) in overrides.entries {
            match self.entries.iter_mut().find(|(k, _)| *k == kind) {
                Some((_, existing)) => *existing = factory,
                None => self.entries.push((kind, factory)),
            }
        }
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Factory)> {
        self.entries.iter().map(|(k, f)| (k.as_str(), f))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::func::FnComponent;

    fn plain(id: &'static str) -> impl Fn(&ComponentEnv) -> anyhow::Result<Arc<dyn Component>> {
        move |_env| Ok(FnComponent::builder(id).build() as Arc<dyn Component>)
    }

    #[test]
    fn test_merge_overrides_in_place_and_appends_new_kinds() {
        let mut base = ComponentCatalog::new().with("a", plain("a")).with("b", plain("b"));
        let overrides = ComponentCatalog::new().with("extra", plain("extra")).with("a", plain("a2"));
        base.merge(overrides);
        assert_eq!(base.kinds().collect::<Vec<_>>(), vec!["a", "b", "extra"]);

        let env = ComponentEnv::new("a", Arc::new(EventBus::new()), Arc::new(ServerConfig::default()));
        let (_, factory) = base.iter().next().unwrap();
        assert_eq!(factory(&env).unwrap().id(), "a2");
    }

    #[test]
    fn test_builtin_catalog_lists_the_server_subsystems() {
        let catalog = ComponentCatalog::builtin();
        assert_eq!(
            catalog.kinds().collect::<Vec<_>>(),
            vec![
                "token-factory",
                "authenticator",
                "workspace-registry",
                "alias-registry",
                "session-registry",
                "http-service",
                "socket-service",
            ]
        );
    }
}
