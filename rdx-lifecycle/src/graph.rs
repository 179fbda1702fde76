//! The per-phase dependency graph of the registered components.
//!
//! Handlers resolve dependencies by waiting for bus messages, which means a
//! dependency on an unregistered id, or a cycle, would simply never settle.
//! The dispatcher validates the graph before publishing `server.<phase>` so
//! such a declaration fails fast instead of stalling the phase.

use crate::common::{ComponentId, Phase};
use crate::component::Component;
use crate::error::LifecycleError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct Node {
    id: ComponentId,
    dependencies: HashMap<Phase, Vec<ComponentId>>,
}

/// A snapshot of every component's declared dependencies, per phase, in
/// registration order.
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<ComponentId, usize>,
}

impl DependencyGraph {
    /// Builds the graph from components given in registration order.
    pub fn from_components<'a, I>(components: I) -> Self
    where
        I: IntoIterator<Item = &'a Arc<dyn Component>>,
    {
        let mut graph = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        };
        for component in components {
            let dependencies = Phase::ALL
                .iter()
                .map(|&phase| {
                    let mut deps: Vec<ComponentId> = Vec::new();
                    for dep in component.dependencies(phase) {
                        if !deps.contains(&dep) {
                            deps.push(dep);
                        }
                    }
                    (phase, deps)
                })
                .collect();
            graph
                .index
                .insert(component.id().to_string(), graph.nodes.len());
            graph.nodes.push(Node {
                id: component.id().to_string(),
                dependencies,
            });
        }
        graph
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids in registration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.id.as_str())
    }

    /// Dependencies `id` declared for `phase`; empty for unknown ids.
    pub fn dependencies(&self, id: &str, phase: Phase) -> &[ComponentId] {
        self.index
            .get(id)
            .and_then(|&i| self.nodes[i].dependencies.get(&phase))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Checks that every dependency of `phase` is registered and that the
    /// dependencies contain no cycle.
    pub fn validate(&self, phase: Phase) -> Result<(), LifecycleError> {
        self.order(phase).map(|_| ())
    }

    /// The order in which `phase` can complete: every component comes after
    /// all of its dependencies.
    ///
    /// Among components that are ready at the same time, `init` and `start`
    /// prefer registration order while `stop` and `destroy` prefer the
    /// reverse, so independent components tear down last-in first-out.
    pub fn order(&self, phase: Phase) -> Result<Vec<ComponentId>, LifecycleError> {
        let deps = self.resolve(phase)?;
        let n = self.nodes.len();

        let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (node, node_deps) in deps.iter().enumerate() {
            for &dep in node_deps {
                dependents[dep].push(node);
            }
        }

        let rank = |i: usize| if phase.is_teardown() { n - 1 - i } else { i };
        let mut done = vec![false; n];
        let mut order = Vec::with_capacity(n);
        while order.len() < n {
            let next = (0..n)
                .filter(|&i| !done[i] && pending[i] == 0)
                .min_by_key(|&i| rank(i));
            let Some(next) = next else {
                return Err(LifecycleError::DependencyCycle {
                    phase,
                    members: self.find_cycle(&deps, &done),
                });
            };
            done[next] = true;
            order.push(self.nodes[next].id.clone());
            for &dependent in &dependents[next] {
                pending[dependent] -= 1;
            }
        }
        Ok(order)
    }

    /// Dependencies of `phase` as node indices, failing on unknown ids.
    #[doc(hidden)]
    fn resolve(&self, phase: Phase) -> Result<Vec<Vec<usize>>, LifecycleError> {
        self.nodes
            .iter()
            .map(|node| {
                node.dependencies
                    .get(&phase)
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                    .iter()
                    .map(|dep| {
                        self.index
                            .get(dep)
                            .copied()
                            .ok_or_else(|| LifecycleError::UnknownDependency {
                                component: node.id.clone(),
                                dependency: dep.clone(),
                                phase,
                            })
                    })
                    .collect()
            })
            .collect()
    }

    /// Every node left unfinished by Kahn's walk still has an unfinished
    /// dependency, so following those edges must loop.
    #[doc(hidden)]
    fn find_cycle(&self, deps: &[Vec<usize>], done: &[bool]) -> Vec<ComponentId> {
        let Some(start) = (0..self.nodes.len()).find(|&i| !done[i]) else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut seen = HashSet::from([start]);
        let mut current = start;
        loop {
            let Some(&next) = deps[current].iter().find(|&&d| !done[d]) else {
                return path.iter().map(|&i| self.nodes[i].id.clone()).collect();
            };
            if !seen.insert(next) {
                let from = path.iter().position(|&i| i == next).unwrap_or(0);
                return path[from..]
                    .iter()
                    .map(|&i| self.nodes[i].id.clone())
                    .collect();
            }
            path.push(next);
            current = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::func::FnComponent;

    fn graph(specs: &[(&str, Phase, &[&str])]) -> DependencyGraph {
        let mut ids: Vec<&str> = Vec::new();
        for (id, _, _) in specs {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        let components: Vec<Arc<dyn Component>> = ids
            .iter()
            .map(|id| {
                let mut builder = FnComponent::builder(*id);
                for (owner, phase, deps) in specs {
                    if owner == id {
                        builder = builder.depends_on(*phase, deps.iter().copied());
                    }
                }
                builder.build() as Arc<dyn Component>
            })
            .collect();
        DependencyGraph::from_components(&components)
    }

    #[test]
    fn test_independent_components_follow_registration_order() {
        let g = graph(&[("a", Phase::Init, &[]), ("b", Phase::Init, &[]), ("c", Phase::Init, &[])]);
        assert_eq!(g.order(Phase::Init).unwrap(), vec!["a", "b", "c"]);
        assert_eq!(g.order(Phase::Start).unwrap(), vec!["a", "b", "c"]);
        assert_eq!(g.order(Phase::Stop).unwrap(), vec!["c", "b", "a"]);
        assert_eq!(g.order(Phase::Destroy).unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_dependencies_come_first() {
        let g = graph(&[
            ("http", Phase::Start, &["auth", "tokens"]),
            ("auth", Phase::Start, &[]),
            ("tokens", Phase::Start, &[]),
            ("tokens", Phase::Stop, &["http"]),
        ]);
        assert_eq!(g.order(Phase::Start).unwrap(), vec!["auth", "tokens", "http"]);
        assert_eq!(g.order(Phase::Stop).unwrap(), vec!["auth", "http", "tokens"]);
        assert_eq!(g.dependencies("http", Phase::Start), ["auth", "tokens"]);
        assert!(g.dependencies("nope", Phase::Start).is_empty());
    }

    #[test]
    fn test_unknown_dependency_is_reported() {
        let g = graph(&[("a", Phase::Start, &["ghost"])]);
        assert!(g.validate(Phase::Init).is_ok());
        match g.validate(Phase::Start) {
            Err(LifecycleError::UnknownDependency { component, dependency, phase }) => {
                assert_eq!(component, "a");
                assert_eq!(dependency, "ghost");
                assert_eq!(phase, Phase::Start);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_cycle_names_only_its_members() {
        let g = graph(&[
            ("x", Phase::Init, &["a"]),
            ("a", Phase::Init, &["b"]),
            ("b", Phase::Init, &["a"]),
        ]);
        match g.order(Phase::Init) {
            Err(LifecycleError::DependencyCycle { phase, mut members }) => {
                assert_eq!(phase, Phase::Init);
                members.sort();
                assert_eq!(members, vec!["a", "b"]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let g = graph(&[("a", Phase::Stop, &["a"])]);
        assert!(matches!(
            g.validate(Phase::Stop),
            Err(LifecycleError::DependencyCycle { .. })
        ));
    }
}
