//! The per-component, per-phase lifecycle event handler.
//!
//! Every registered component gets one [`LifecycleEventHandler`] for each
//! [`Phase`]. The handler turns the server's `server.<phase>` trigger into a
//! call of the component's phase method, but only after every dependency
//! declared for that phase has reported `<dep>.<phase>.success` on the
//! lifecycle channel. The outcome is published back as
//! `<id>.<phase>.success` or `<id>.<phase>.error`.
//!
//! Components therefore never call each other: the dependency graph is
//! resolved entirely through bus messages.

use crate::bus::{callback, panic_message, Channel, Envelope, Message};
use crate::common::{topics, ComponentId, Phase};
use crate::component::{call_phase, Component, PhaseContext};
use crate::config::TeardownPolicy;
use crate::deferred::Deferred;
use crate::error::{Abandoned, FailureCause, PhaseFailure};
use futures::future::try_join_all;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace, warn};

/// Observable state of one dependency in a handler's mask.
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyState {
    /// No round has asked for this dependency yet.
    Idle,
    /// The current round is waiting for the dependency's report.
    Waiting,
    /// The dependency reported success with this payload.
    Settled(Value),
}

enum MaskEntry {
    Idle,
    Waiting(Deferred<Value, WaitError>),
    Settled(Value),
}

#[derive(Debug)]
enum WaitError {
    Failed(PhaseFailure),
    Abandoned,
}

impl From<Abandoned> for WaitError {
    fn from(_: Abandoned) -> Self {
        WaitError::Abandoned
    }
}

struct HandlerInner {
    name: String,
    owner_id: ComponentId,
    phase: Phase,
    dependencies: Vec<ComponentId>,
    policy: TeardownPolicy,
    channel: Arc<Channel>,
    owner: Mutex<Option<Arc<dyn Component>>>,
    mask: Mutex<Vec<(ComponentId, MaskEntry)>>,
    handling: AtomicBool,
    disposed: AtomicBool,
}

/// Drives one phase of one component.
///
/// Cloning yields another handle to the same handler.
#[derive(Clone)]
pub struct LifecycleEventHandler {
    inner: Arc<HandlerInner>,
}

// Public API implementation block.
impl LifecycleEventHandler {
    /// Creates the handler for `owner`'s `phase`. Nothing is subscribed until
    /// [`attach`](Self::attach) is called.
    pub fn new(
        owner: Arc<dyn Component>,
        channel: Arc<Channel>,
        phase: Phase,
        policy: TeardownPolicy,
    ) -> Self {
        let owner_id = owner.id().to_string();
        let mut dependencies: Vec<ComponentId> = Vec::new();
        for dep in owner.dependencies(phase) {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }
        let mask = dependencies
            .iter()
            .map(|dep| (dep.clone(), MaskEntry::Idle))
            .collect();
        Self {
            inner: Arc::new(HandlerInner {
                name: format!("{}/{}/handler", owner_id, phase),
                owner_id,
                phase,
                dependencies,
                policy,
                channel,
                owner: Mutex::new(Some(owner)),
                mask: Mutex::new(mask),
                handling: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribes to `server.<phase>` and to the success and error reports of
    /// every dependency for this phase.
    pub fn attach(&self) {
        let phase = self.inner.phase;
        let mut bindings = Vec::with_capacity(1 + 2 * self.inner.dependencies.len());

        let weak = Arc::downgrade(&self.inner);
        bindings.push((
            topics::server(phase),
            callback(move |_msg: &Message, _env: &Envelope| match weak.upgrade() {
                Some(inner) => HandlerInner::on_server_event(&inner),
                None => Ok(()),
            }),
        ));

        for dep in &self.inner.dependencies {
            let weak: Weak<HandlerInner> = Arc::downgrade(&self.inner);
            let id = dep.clone();
            bindings.push((
                topics::success(dep, phase),
                callback(move |msg, _env| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_dependency_success(&id, msg);
                    }
                    Ok(())
                }),
            ));

            let weak: Weak<HandlerInner> = Arc::downgrade(&self.inner);
            let id = dep.clone();
            bindings.push((
                topics::error(dep, phase),
                callback(move |msg, _env| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_dependency_error(&id, msg);
                    }
                    Ok(())
                }),
            ));
        }

        self.inner.channel.subscribe(&self.inner.name, bindings);
        trace!("{} attached", self.inner.name);
    }

    /// Unsubscribes, abandons any pending dependency wait and releases the
    /// owner. Safe to call more than once.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.channel.unsubscribe(&self.inner.name);
        // Dropping the Waiting deferreds completes their promises with
        // `Abandoned`, which an in-flight round reports as a disposal.
        self.inner.lock_mask().clear();
        self.inner.lock_owner().take();
        debug!("{} disposed", self.inner.name);
    }

    /// `<id>/<phase>/handler`; also the handler's bus subscriber identity.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase
    }

    /// Dependency ids for this phase, without duplicates, in declaration order.
    pub fn dependencies(&self) -> &[ComponentId] {
        &self.inner.dependencies
    }

    /// `true` from the phase trigger until the outcome has been published.
    pub fn is_handling(&self) -> bool {
        self.inner.handling.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// A snapshot of the dependency mask, in declaration order.
    pub fn mask(&self) -> Vec<(ComponentId, DependencyState)> {
        self.inner
            .lock_mask()
            .iter()
            .map(|(id, entry)| {
                let state = match entry {
                    MaskEntry::Idle => DependencyState::Idle,
                    MaskEntry::Waiting(_) => DependencyState::Waiting,
                    MaskEntry::Settled(value) => DependencyState::Settled(value.clone()),
                };
                (id.clone(), state)
            })
            .collect()
    }
}

// Core implementation block for internal logic.
impl HandlerInner {
    #[doc(hidden)]
    fn on_server_event(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        assert!(
            !self.handling.swap(true, Ordering::SeqCst),
            "{} received {} while the previous round is still running",
            self.name,
            topics::server(self.phase)
        );

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                self.handling.store(false, Ordering::SeqCst);
                anyhow::bail!("{} can not run outside a tokio runtime: {}", self.name, err);
            }
        };

        // A fresh deferred per dependency, so reports from an earlier round
        // can never satisfy this one.
        let waits = {
            let mut mask = self.lock_mask();
            let mut waits = Vec::with_capacity(mask.len());
            for (id, entry) in mask.iter_mut() {
                let deferred = Deferred::new();
                let promise = deferred.promise();
                *entry = MaskEntry::Waiting(deferred);
                let id = id.clone();
                waits.push(async move { promise.await.map(|value| (id, value)) });
            }
            waits
        };
        trace!("{} waiting for {} dependency(ies)", self.name, waits.len());

        let inner = self.clone();
        runtime.spawn(async move {
            let dependencies = try_join_all(waits);
            let outcome = inner.run_round(dependencies).await;
            inner.handling.store(false, Ordering::SeqCst);
            inner.report(outcome);
        });
        Ok(())
    }

    #[doc(hidden)]
    async fn run_round<F>(&self, dependencies: F) -> Result<Value, PhaseFailure>
    where
        F: std::future::Future<Output = Result<Vec<(ComponentId, Value)>, WaitError>>,
    {
        let dependencies = match dependencies.await {
            Ok(dependencies) => dependencies,
            Err(WaitError::Failed(upstream)) => {
                return Err(PhaseFailure::dependency(
                    self.owner_id.clone(),
                    self.phase,
                    upstream,
                ));
            }
            Err(WaitError::Abandoned) => return Err(self.disposed_failure()),
        };

        let Some(owner) = self.owner() else {
            return Err(self.disposed_failure());
        };
        let ctx = PhaseContext {
            phase: self.phase,
            dependencies,
        };
        // The async block makes a panic in the synchronous part of the method
        // land inside `catch_unwind` too.
        let call = AssertUnwindSafe(async { call_phase(owner.as_ref(), ctx).await });
        match call.catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(PhaseFailure::method(self.owner_id.clone(), self.phase, err)),
            Err(panic) => Err(PhaseFailure::method(
                self.owner_id.clone(),
                self.phase,
                anyhow::anyhow!("{} method panicked: {}", self.phase, panic_message(panic.as_ref())),
            )),
        }
    }

    #[doc(hidden)]
    fn report(&self, outcome: Result<Value, PhaseFailure>) {
        match outcome {
            Ok(value) => {
                debug!("{} succeeded", self.name);
                self.channel.publish(
                    topics::success(&self.owner_id, self.phase),
                    Message::Data(value),
                );
            }
            Err(failure) => {
                warn!("{} failed [{}]: {}", self.name, failure.as_label(), failure);
                self.channel.publish(
                    topics::error(&self.owner_id, self.phase),
                    Message::Failure(failure),
                );
            }
        }
    }

    #[doc(hidden)]
    fn on_dependency_success(&self, dependency: &str, message: &Message) {
        let value = message.clone().into_value();
        let mut mask = self.lock_mask();
        let Some((_, entry)) = mask.iter_mut().find(|(id, _)| id == dependency) else {
            return;
        };
        if let MaskEntry::Waiting(deferred) = &*entry {
            deferred.resolve(value.clone());
        } else {
            trace!("{} ignores stale success of '{}'", self.name, dependency);
            return;
        }
        *entry = MaskEntry::Settled(value);
        trace!("{} got {} from '{}'", self.name, self.phase, dependency);
    }

    #[doc(hidden)]
    fn on_dependency_error(&self, dependency: &str, message: &Message) {
        let failure = match message.failure() {
            Some(failure) => failure.clone().with_sender(dependency),
            None => PhaseFailure::method(
                dependency,
                self.phase,
                anyhow::anyhow!("reported an error without details"),
            ),
        };
        let mut mask = self.lock_mask();
        let Some((_, entry)) = mask.iter_mut().find(|(id, _)| id == dependency) else {
            return;
        };
        let MaskEntry::Waiting(deferred) = &*entry else {
            trace!("{} ignores stale error of '{}'", self.name, dependency);
            return;
        };
        let next = if self.phase.is_teardown() && self.policy == TeardownPolicy::BestEffort {
            warn!(
                "{} proceeds although '{}' failed: {}",
                self.name, dependency, failure
            );
            deferred.resolve(Value::Null);
            MaskEntry::Settled(Value::Null)
        } else {
            deferred.reject(WaitError::Failed(failure));
            MaskEntry::Idle
        };
        *entry = next;
    }

    fn disposed_failure(&self) -> PhaseFailure {
        PhaseFailure {
            sender: self.owner_id.clone(),
            phase: self.phase,
            cause: FailureCause::Disposed,
        }
    }

    fn owner(&self) -> Option<Arc<dyn Component>> {
        self.lock_owner().clone()
    }

    fn lock_owner(&self) -> MutexGuard<'_, Option<Arc<dyn Component>>> {
        self.owner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_mask(&self) -> MutexGuard<'_, Vec<(ComponentId, MaskEntry)>> {
        self.mask.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::func::FnComponent;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Forwards every completion report on `channel` into an mpsc queue.
    fn reports(channel: &Channel) -> mpsc::UnboundedReceiver<(String, Message)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tx_err = tx.clone();
        channel.subscribe(
            "test-observer",
            [
                (
                    topics::ANY_SUCCESS,
                    callback(move |msg, env| {
                        tx.send((env.topic().to_string(), msg.clone())).ok();
                        Ok(())
                    }),
                ),
                (
                    topics::ANY_ERROR,
                    callback(move |msg, env| {
                        tx_err.send((env.topic().to_string(), msg.clone())).ok();
                        Ok(())
                    }),
                ),
            ],
        );
        rx
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<(String, Message)>) -> (String, Message) {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a report")
            .expect("report stream closed")
    }

    #[tokio::test]
    async fn test_handler_without_dependencies_runs_immediately() {
        let channel = Arc::new(Channel::new("lifecycle"));
        let mut rx = reports(&channel);
        let a = FnComponent::builder("a")
            .on(Phase::Init, |_ctx| async { Ok(json!("ready")) })
            .build();
        let handler = LifecycleEventHandler::new(a, channel.clone(), Phase::Init, TeardownPolicy::Strict);
        handler.attach();
        assert_eq!(handler.name(), "a/init/handler");

        channel.publish(topics::server(Phase::Init), Message::Empty);
        let (topic, msg) = next(&mut rx).await;
        assert_eq!(topic, "a.init.success");
        assert_eq!(msg.data(), Some(&json!("ready")));
        assert!(!handler.is_handling());
    }

    #[tokio::test]
    async fn test_handler_waits_for_dependency_and_passes_payload() {
        let channel = Arc::new(Channel::new("lifecycle"));
        let mut rx = reports(&channel);
        let b = FnComponent::builder("b")
            .depends_on(Phase::Start, ["a"])
            .on(Phase::Start, |ctx| async move {
                Ok(json!({ "saw": ctx.dependency("a").cloned() }))
            })
            .build();
        let handler = LifecycleEventHandler::new(b, channel.clone(), Phase::Start, TeardownPolicy::Strict);
        handler.attach();

        channel.publish(topics::server(Phase::Start), Message::Empty);
        tokio::task::yield_now().await;
        assert!(handler.is_handling());
        assert_eq!(handler.mask(), vec![("a".to_string(), DependencyState::Waiting)]);

        channel.publish(topics::success("a", Phase::Start), Message::Data(json!(7)));
        let (topic, _) = next(&mut rx).await;
        assert_eq!(topic, "a.start.success");
        let (topic, msg) = next(&mut rx).await;
        assert_eq!(topic, "b.start.success");
        assert_eq!(msg.data(), Some(&json!({ "saw": 7 })));
        assert_eq!(
            handler.mask(),
            vec![("a".to_string(), DependencyState::Settled(json!(7)))]
        );
    }

    #[tokio::test]
    async fn test_dependency_error_skips_owner_and_wraps_cause() {
        let channel = Arc::new(Channel::new("lifecycle"));
        let mut rx = reports(&channel);
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let b = FnComponent::builder("b")
            .depends_on(Phase::Init, ["a"])
            .on(Phase::Init, move |_ctx| {
                flag.store(true, Ordering::SeqCst);
                async { Ok(Value::Null) }
            })
            .build();
        let handler = LifecycleEventHandler::new(b, channel.clone(), Phase::Init, TeardownPolicy::Strict);
        handler.attach();

        channel.publish(topics::server(Phase::Init), Message::Empty);
        let upstream = PhaseFailure::method("a", Phase::Init, anyhow::anyhow!("disk full"));
        channel.publish(topics::error("a", Phase::Init), Message::Failure(upstream));

        let (topic, _) = next(&mut rx).await;
        assert_eq!(topic, "a.init.error");
        let (topic, msg) = next(&mut rx).await;
        assert_eq!(topic, "b.init.error");
        let failure = msg.failure().unwrap();
        assert_eq!(failure.sender, "b");
        assert_eq!(failure.root_sender(), "a");
        assert!(matches!(failure.cause, FailureCause::Dependency(_)));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_best_effort_teardown_runs_owner_despite_dependency_error() {
        let channel = Arc::new(Channel::new("lifecycle"));
        let mut rx = reports(&channel);
        let b = FnComponent::builder("b")
            .depends_on(Phase::Stop, ["a"])
            .on(Phase::Stop, |_ctx| async { Ok(json!("stopped")) })
            .build();
        let handler =
            LifecycleEventHandler::new(b, channel.clone(), Phase::Stop, TeardownPolicy::BestEffort);
        handler.attach();

        channel.publish(topics::server(Phase::Stop), Message::Empty);
        let upstream = PhaseFailure::method("a", Phase::Stop, anyhow::anyhow!("stuck"));
        channel.publish(topics::error("a", Phase::Stop), Message::Failure(upstream));

        next(&mut rx).await;
        let (topic, msg) = next(&mut rx).await;
        assert_eq!(topic, "b.stop.success");
        assert_eq!(msg.data(), Some(&json!("stopped")));
    }

    #[tokio::test]
    async fn test_failing_and_panicking_methods_are_reported() {
        let channel = Arc::new(Channel::new("lifecycle"));
        let mut rx = reports(&channel);
        let a = FnComponent::builder("a")
            .on(Phase::Init, |_ctx| async { Err(anyhow::anyhow!("no config")) })
            .build();
        let b = FnComponent::builder("b")
            .on(Phase::Init, |_ctx| async { panic!("boom") })
            .build();
        for owner in [a, b] {
            LifecycleEventHandler::new(owner, channel.clone(), Phase::Init, TeardownPolicy::Strict)
                .attach();
        }
        channel.publish(topics::server(Phase::Init), Message::Empty);

        let mut seen = vec![next(&mut rx).await, next(&mut rx).await];
        seen.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(seen[0].0, "a.init.error");
        assert_eq!(seen[1].0, "b.init.error");
        let a_failure = seen[0].1.failure().unwrap();
        assert_eq!(a_failure.to_string(), "component 'a' failed to init: no config");
        let b_failure = seen[1].1.failure().unwrap();
        assert!(b_failure.to_string().contains("panicked: boom"));
    }

    #[tokio::test]
    async fn test_stale_reports_are_ignored() {
        let channel = Arc::new(Channel::new("lifecycle"));
        let b = FnComponent::builder("b").depends_on(Phase::Init, ["a"]).build();
        let handler = LifecycleEventHandler::new(b, channel.clone(), Phase::Init, TeardownPolicy::Strict);
        handler.attach();
        // No round in progress: the report must not settle anything.
        channel.publish(topics::success("a", Phase::Init), Message::Data(json!(1)));
        assert_eq!(handler.mask(), vec![("a".to_string(), DependencyState::Idle)]);
        assert!(!handler.is_handling());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_abandons_pending_round() {
        let channel = Arc::new(Channel::new("lifecycle"));
        let mut rx = reports(&channel);
        let b = FnComponent::builder("b").depends_on(Phase::Init, ["a"]).build();
        let handler = LifecycleEventHandler::new(b, channel.clone(), Phase::Init, TeardownPolicy::Strict);
        handler.attach();
        assert_eq!(channel.patterns_of("b/init/handler").len(), 3);

        channel.publish(topics::server(Phase::Init), Message::Empty);
        handler.dispose();
        handler.dispose();
        assert!(handler.is_disposed());
        assert!(channel.patterns_of("b/init/handler").is_empty());

        let (topic, msg) = next(&mut rx).await;
        assert_eq!(topic, "b.init.error");
        assert!(matches!(msg.failure().unwrap().cause, FailureCause::Disposed));
    }
}
