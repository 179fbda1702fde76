//! The server-level dispatcher that drives the lifecycle phases.

use crate::bus::{callback, EventBus, Message};
use crate::common::{topics, ComponentId, Phase, ServerState};
use crate::components::catalog::ComponentCatalog;
use crate::config::{ServerConfig, TeardownPolicy};
use crate::deferred::DeferredMap;
use crate::error::{LifecycleError, PhaseFailure};
use crate::events::{PhaseReport, ReportKind};
use crate::registry::ComponentRegistry;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, error, info, trace, warn};

const REPORT_CAPACITY: usize = 256;

/// The phase currently being dispatched and the per-component results it
/// waits for.
struct PendingPhase {
    round: u64,
    phase: Phase,
    results: DeferredMap<Value, LifecycleError>,
}

type PendingSlot = Arc<Mutex<Option<PendingPhase>>>;

type Completions = FuturesUnordered<BoxFuture<'static, (String, Result<Value, LifecycleError>)>>;

/// One dispatch of a phase and the completions it has not consumed yet.
struct Round {
    id: u64,
    completions: Completions,
}

/// Drops the installed round only if it is still `round`.
fn clear_pending(pending: &PendingSlot, round: u64) {
    let mut slot = lock(pending);
    if slot.as_ref().map_or(false, |p| p.round == round) {
        slot.take();
    }
}

/// The lifecycle server.
///
/// Owns the event bus and the component registry, and turns each lifecycle
/// request into one `server.<phase>` publication plus a wait for every
/// component's completion message. `Server` is a cheap handle: clones share
/// the same bus, registry and state.
#[derive(Clone)]
pub struct Server {
    config: Arc<ServerConfig>,
    bus: Arc<EventBus>,
    registry: Arc<ComponentRegistry>,
    state: Arc<Mutex<ServerState>>,
    // Serialises phases: at most one dispatch is in flight.
    dispatching: Arc<tokio::sync::Mutex<()>>,
    pending: PendingSlot,
    rounds: Arc<AtomicU64>,
    report_sender: broadcast::Sender<PhaseReport>,
}

// Core implementation block for internal logic.
impl Server {
    /// Builds the bus and the registry and instantiates every enabled kind of
    /// `catalog`. A construction failure is fatal and leaves nothing behind.
    pub fn new(config: ServerConfig, catalog: &ComponentCatalog) -> Result<Self, LifecycleError> {
        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new());
        let registry = ComponentRegistry::new(bus.clone(), config.lifecycle.teardown);
        let (report_sender, _) = broadcast::channel(REPORT_CAPACITY);
        let server = Self {
            config: config.clone(),
            bus: bus.clone(),
            registry: registry.clone(),
            state: Arc::new(Mutex::new(ServerState::Uninitialized)),
            dispatching: Arc::new(tokio::sync::Mutex::new(())),
            pending: Arc::new(Mutex::new(None)),
            rounds: Arc::new(AtomicU64::new(0)),
            report_sender,
        };
        server.listen();

        if let Err(err) = registry.init(catalog, &config) {
            error!("component registry initialization failed: {}", err);
            registry.destroy();
            bus.reset();
            return Err(err);
        }
        info!(
            "Server '{}' created with {} component(s).",
            config.server_name,
            registry.len()
        );
        Ok(server)
    }

    /// Subscribes, once, to every component's completion reports.
    #[doc(hidden)]
    fn listen(&self) {
        let pending = self.pending.clone();
        let reports = self.report_sender.clone();
        let on_success = callback(move |msg, env| {
            let payload = msg.clone().into_value();
            Self::on_completion(&pending, &reports, env.topic(), Ok(payload));
            Ok(())
        });

        let pending = self.pending.clone();
        let reports = self.report_sender.clone();
        let on_error = callback(move |msg, env| {
            let topic = env.topic();
            let failure = match (msg.failure(), topics::phase(topic)) {
                (Some(failure), _) => failure.clone(),
                (None, Some(phase)) => PhaseFailure::method(
                    topics::sender(topic),
                    phase,
                    anyhow::anyhow!("reported an error without details"),
                ),
                (None, None) => return Ok(()),
            };
            Self::on_completion(&pending, &reports, topic, Err(failure));
            Ok(())
        });

        self.bus.lifecycle().subscribe(
            topics::SERVER,
            [(topics::ANY_SUCCESS, on_success), (topics::ANY_ERROR, on_error)],
        );
    }

    /// Settles the pending entry of the reporting component. Reports for
    /// another phase, unknown ids, or already settled entries are ignored.
    #[doc(hidden)]
    fn on_completion(
        pending: &PendingSlot,
        reports: &broadcast::Sender<PhaseReport>,
        topic: &str,
        outcome: Result<Value, PhaseFailure>,
    ) {
        let Some(phase) = topics::phase(topic) else {
            return;
        };
        let sender = topics::sender(topic);
        let slot = lock(pending);
        let entry = slot
            .as_ref()
            .filter(|p| p.phase == phase)
            .and_then(|p| p.results.get(sender))
            .filter(|deferred| !deferred.is_settled());
        let Some(deferred) = entry else {
            trace!("ignoring '{}' outside of its dispatch", topic);
            return;
        };

        // Reported before settling so the terminal report follows it.
        let kind = match &outcome {
            Ok(payload) => ReportKind::ComponentSucceeded {
                component: sender.to_string(),
                payload: payload.clone(),
            },
            Err(failure) => ReportKind::ComponentFailed {
                failure: failure.clone(),
            },
        };
        reports.send(PhaseReport::now(phase, kind)).ok();
        match outcome {
            Ok(payload) => deferred.resolve(payload),
            Err(failure) => deferred.reject(LifecycleError::Phase(failure)),
        };
    }

    /// Publishes `server.<phase>` and waits until every registered component
    /// has completed the phase.
    ///
    /// `init` and `start` (and teardown under [`TeardownPolicy::Strict`])
    /// fail on the first component error. Under
    /// [`TeardownPolicy::BestEffort`], `stop` and `destroy` wait for every
    /// component and report all failures together.
    ///
    /// Returns the round alongside the outcome; after a short-circuited
    /// failure it still holds the members that have not reported yet.
    async fn dispatch_lifecycle_event(
        &self,
        phase: Phase,
    ) -> (Result<(), LifecycleError>, Option<Round>) {
        let order = match self.dispatch_order(phase) {
            Ok(order) => order,
            Err(err) => return (Err(err), None),
        };
        let results: DeferredMap<Value, LifecycleError> =
            DeferredMap::from_keys(order.iter().cloned());
        let mut completions: Completions = FuturesUnordered::new();
        for key in results.keys() {
            if let Some(deferred) = results.get(key) {
                let promise = deferred.promise();
                let key = key.to_string();
                completions.push(async move { (key, promise.await) }.boxed());
            }
        }
        let best_effort =
            phase.is_teardown() && self.config.lifecycle.teardown == TeardownPolicy::BestEffort;

        let id = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish_phase(id, phase, order, results);

        let mut failures = Vec::new();
        loop {
            let next = completions.next().await;
            match next {
                None => break,
                Some((_, Ok(_))) => {}
                Some((_, Err(LifecycleError::Phase(failure)))) if best_effort => {
                    failures.push(failure)
                }
                Some((_, Err(err))) => return (Err(err), Some(Round { id, completions })),
            }
        }
        let outcome = if failures.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Teardown { phase, failures })
        };
        (outcome, Some(Round { id, completions }))
    }

    #[doc(hidden)]
    fn publish_phase(
        &self,
        round: u64,
        phase: Phase,
        order: Vec<ComponentId>,
        results: DeferredMap<Value, LifecycleError>,
    ) {
        *lock(&self.pending) = Some(PendingPhase {
            round,
            phase,
            results,
        });
        self.report_sender
            .send(PhaseReport::now(phase, ReportKind::Dispatched { order }))
            .ok();
        self.bus.lifecycle().publish(topics::server(phase), Message::Empty);
    }

    /// Retires `round`. Members still running keep the round installed, and
    /// the dispatch lock held, until each of them has reported.
    #[doc(hidden)]
    fn finish_round(
        &self,
        phase: Phase,
        round: Option<Round>,
        dispatching: OwnedMutexGuard<()>,
    ) {
        let Some(mut round) = round else {
            return;
        };
        // The bus is gone after destroy; nothing is left to report.
        if round.completions.is_empty() || phase == Phase::Destroy {
            clear_pending(&self.pending, round.id);
            return;
        }
        debug!(
            "{} component(s) still finishing '{}'; next phase waits for them",
            round.completions.len(),
            phase
        );
        let pending = self.pending.clone();
        tokio::spawn(async move {
            while round.completions.next().await.is_some() {}
            clear_pending(&pending, round.id);
            drop(dispatching);
        });
    }

    #[doc(hidden)]
    async fn run_phase(&self, phase: Phase) -> Result<(), LifecycleError> {
        let dispatching = self.dispatching.clone().lock_owned().await;
        let from = self.state();
        let Some(next) = from.next(phase) else {
            return Err(LifecycleError::InvalidTransition { from, phase });
        };

        info!(
            "Dispatching '{}' to {} component(s)...",
            phase,
            self.registry.len()
        );
        let (outcome, round) = self.dispatch_lifecycle_event(phase).await;

        if phase == Phase::Destroy {
            self.registry.destroy();
            self.bus.reset();
        }
        let state = match &outcome {
            Ok(()) => next,
            // A destroyed registry can not be dispatched to again.
            Err(_) if phase == Phase::Destroy => ServerState::Destroyed,
            Err(_) => ServerState::Failed(phase),
        };
        *lock(&self.state) = state;

        let kind = match &outcome {
            Ok(()) => {
                info!("Phase '{}' completed; server is {}.", phase, state);
                ReportKind::Completed { state }
            }
            Err(err) => {
                warn!("Phase '{}' failed [{}]: {}", phase, err.as_label(), err);
                ReportKind::Failed {
                    state,
                    reason: err.to_string(),
                }
            }
        };
        self.report_sender.send(PhaseReport::now(phase, kind)).ok();
        self.finish_round(phase, round, dispatching);
        outcome
    }
}

// Public API implementation block.
impl Server {
    pub async fn init(&self) -> Result<(), LifecycleError> {
        self.run_phase(Phase::Init).await
    }

    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.run_phase(Phase::Start).await
    }

    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.run_phase(Phase::Stop).await
    }

    /// Runs the `destroy` phase, then disposes the registry and every bus
    /// channel. The server can not be used afterwards.
    pub async fn destroy(&self) -> Result<(), LifecycleError> {
        self.run_phase(Phase::Destroy).await
    }

    /// `stop` followed by `start`.
    pub async fn restart(&self) -> Result<(), LifecycleError> {
        self.stop().await?;
        self.start().await
    }

    /// Runs `phase` if the current state allows it.
    pub async fn run(&self, phase: Phase) -> Result<(), LifecycleError> {
        self.run_phase(phase).await
    }

    /// The order in which components are expected to complete `phase`.
    /// Fails if the declared dependencies are unknown or cyclic.
    pub fn dispatch_order(&self, phase: Phase) -> Result<Vec<ComponentId>, LifecycleError> {
        self.registry.dependency_graph().order(phase)
    }

    pub fn state(&self) -> ServerState {
        *lock(&self.state)
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Subscribes to the stream of [`PhaseReport`]s.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<PhaseReport> {
        self.report_sender.subscribe()
    }
}

fn lock<V>(m: &Mutex<V>) -> MutexGuard<'_, V> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
