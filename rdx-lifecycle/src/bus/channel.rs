//! A single named pub/sub namespace of the [`EventBus`](super::EventBus).

use super::topic::TopicPattern;
use crate::common::SubscriptionKey;
use crate::deferred::Deferred;
use crate::error::{BusError, PhaseFailure};
use serde_json::Value;
use slotmap::SlotMap;
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

/// The payload carried by a published message.
#[derive(Debug, Clone)]
pub enum Message {
    /// No data, e.g. the `server.<phase>` trigger.
    Empty,
    /// An opaque JSON payload.
    Data(Value),
    /// A component phase failure, attributed via its `sender`.
    Failure(PhaseFailure),
}

impl Message {
    pub fn data(&self) -> Option<&Value> {
        match self {
            Message::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&PhaseFailure> {
        match self {
            Message::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    /// The JSON payload, with `Empty` mapped to `null`.
    pub fn into_value(self) -> Value {
        match self {
            Message::Data(value) => value,
            _ => Value::Null,
        }
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::Data(value)
    }
}

/// Delivery metadata handed to every callback alongside the message.
#[derive(Debug, Clone)]
pub struct Envelope {
    channel: Arc<str>,
    topic: String,
    responder: Option<Responder>,
}

impl Envelope {
    /// The exact topic that was published (patterns may be wildcarded).
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Present when the message was sent with [`Channel::request`].
    pub fn responder(&self) -> Option<&Responder> {
        self.responder.as_ref()
    }
}

/// The reply path of a [`Channel::request`].
///
/// Clone it to reply later from another task. The request completes with
/// [`BusError::NoResponder`] once every clone is dropped without a reply.
#[derive(Clone)]
pub struct Responder {
    topic: String,
    deferred: Arc<Deferred<Message, BusError>>,
}

impl Responder {
    /// Completes the request with `message`. Returns `false` if already answered.
    pub fn resolve(&self, message: Message) -> bool {
        self.deferred.resolve(message)
    }

    /// Fails the request. Returns `false` if already answered.
    pub fn reject(&self, reason: impl Into<String>) -> bool {
        self.deferred.reject(BusError::Rejected {
            topic: self.topic.clone(),
            reason: reason.into(),
        })
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("topic", &self.topic)
            .field("answered", &self.deferred.is_settled())
            .finish()
    }
}

/// A subscription callback. Errors and panics are logged and swallowed by the
/// channel; they never reach the publisher or the other subscribers.
pub type Callback = Arc<dyn Fn(&Message, &Envelope) -> anyhow::Result<()> + Send + Sync>;

/// Wraps a closure as a [`Callback`].
pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Message, &Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Subscription {
    subscriber: String,
    pattern: TopicPattern,
    callback: Callback,
}

#[derive(Default)]
struct ChannelState {
    subscriptions: SlotMap<SubscriptionKey, Subscription>,
    // Registration order; slotmap iteration order is by slot, not by age.
    order: Vec<SubscriptionKey>,
    queue: VecDeque<(Message, Envelope)>,
    draining: bool,
}

impl ChannelState {
    fn matching(&self, topic: &str) -> Vec<(String, Callback)> {
        self.order
            .iter()
            .filter_map(|key| self.subscriptions.get(*key))
            .filter(|sub| sub.pattern.matches(topic))
            .map(|sub| (sub.subscriber.clone(), sub.callback.clone()))
            .collect()
    }
}

/// A named topic namespace.
///
/// Deliveries on one channel are totally ordered. A message published while
/// the channel is already delivering (from inside a callback, or from another
/// task) is queued and handed out, in publish order, by whoever is delivering
/// once the current message has reached all of its subscribers.
pub struct Channel {
    name: Arc<str>,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            state: Mutex::new(ChannelState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delivers `message` to every subscription whose pattern matches `topic`,
    /// in registration order. Publishing with no subscribers is a no-op.
    pub fn publish(&self, topic: impl Into<String>, message: Message) {
        let envelope = Envelope {
            channel: self.name.clone(),
            topic: topic.into(),
            responder: None,
        };
        self.enqueue(message, envelope);
    }

    /// Publishes `message` with a reply path and waits for the responder.
    ///
    /// The returned future is independent of the channel; no timeout applies.
    pub fn request(
        &self,
        topic: impl Into<String>,
        message: Message,
    ) -> impl Future<Output = Result<Message, BusError>> + Send + 'static {
        let topic = topic.into();
        let deferred = Arc::new(Deferred::new());
        let promise = deferred.promise();
        let envelope = Envelope {
            channel: self.name.clone(),
            topic: topic.clone(),
            responder: Some(Responder {
                topic: topic.clone(),
                deferred,
            }),
        };
        self.enqueue(message, envelope);
        async move {
            promise.await.map_err(|err| match err {
                BusError::Abandoned(_) => BusError::NoResponder { topic },
                other => other,
            })
        }
    }

    /// Registers one subscription per `(pattern, callback)` binding for
    /// `subscriber`.
    ///
    /// Subscribing a pattern the subscriber already holds replaces that
    /// subscription's callback in place.
    pub fn subscribe<I, P>(&self, subscriber: &str, bindings: I) -> Vec<SubscriptionKey>
    where
        I: IntoIterator<Item = (P, Callback)>,
        P: Into<TopicPattern>,
    {
        let mut state = self.lock();
        let mut keys = Vec::new();
        for (pattern, callback) in bindings {
            let pattern = pattern.into();
            let existing = state.order.iter().copied().find(|key| {
                state
                    .subscriptions
                    .get(*key)
                    .map_or(false, |s| s.subscriber == subscriber && s.pattern == pattern)
            });
            match existing {
                Some(key) => {
                    debug!(
                        "[{}] '{}' re-subscribed to '{}', replacing callback",
                        self.name, subscriber, pattern
                    );
                    if let Some(sub) = state.subscriptions.get_mut(key) {
                        sub.callback = callback;
                    }
                    keys.push(key);
                }
                None => {
                    trace!("[{}] '{}' subscribed to '{}'", self.name, subscriber, pattern);
                    let key = state.subscriptions.insert(Subscription {
                        subscriber: subscriber.to_string(),
                        pattern,
                        callback,
                    });
                    state.order.push(key);
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Convenience wrapper for a single binding.
    pub fn subscribe_one<F>(&self, subscriber: &str, pattern: &str, f: F) -> SubscriptionKey
    where
        F: Fn(&Message, &Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let keys = self.subscribe(subscriber, [(pattern, callback(f))]);
        keys[0]
    }

    /// Removes every subscription owned by `subscriber`. Returns how many were
    /// removed; calling it again is a harmless no-op.
    pub fn unsubscribe(&self, subscriber: &str) -> usize {
        let mut state = self.lock();
        let state = &mut *state;
        let before = state.subscriptions.len();
        state.subscriptions.retain(|_, sub| sub.subscriber != subscriber);
        let subscriptions = &state.subscriptions;
        state.order.retain(|key| subscriptions.contains_key(*key));
        let removed = before - state.subscriptions.len();
        if removed == 0 {
            debug!("[{}] '{}' had no subscriptions to remove", self.name, subscriber);
        } else {
            trace!("[{}] removed {} subscription(s) of '{}'", self.name, removed, subscriber);
        }
        removed
    }

    /// Number of live subscriptions on this channel.
    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Patterns currently held by `subscriber`, in registration order.
    pub fn patterns_of(&self, subscriber: &str) -> Vec<String> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|key| state.subscriptions.get(*key))
            .filter(|sub| sub.subscriber == subscriber)
            .map(|sub| sub.pattern.as_str().to_string())
            .collect()
    }

    /// Drops every subscription and any undelivered message.
    pub(crate) fn dispose(&self) {
        let mut state = self.lock();
        state.subscriptions.clear();
        state.order.clear();
        state.queue.clear();
    }

    fn enqueue(&self, message: Message, envelope: Envelope) {
        {
            let mut state = self.lock();
            state.queue.push_back((message, envelope));
            if state.draining {
                return;
            }
            state.draining = true;
        }
        self.drain();
    }

    #[doc(hidden)]
    fn drain(&self) {
        loop {
            let (message, envelope, targets) = {
                let mut state = self.lock();
                match state.queue.pop_front() {
                    Some((message, envelope)) => {
                        let targets = state.matching(envelope.topic());
                        (message, envelope, targets)
                    }
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            if targets.is_empty() {
                trace!("[{}] no subscriber for '{}'", self.name, envelope.topic());
            }
            for (subscriber, callback) in targets {
                self.deliver(&subscriber, &callback, &message, &envelope);
            }
        }
    }

    #[doc(hidden)]
    fn deliver(&self, subscriber: &str, callback: &Callback, message: &Message, envelope: &Envelope) {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(message, envelope)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(
                "[{}] subscriber '{}' failed on '{}': {:#}",
                self.name,
                subscriber,
                envelope.topic(),
                err
            ),
            Err(panic) => error!(
                "[{}] subscriber '{}' panicked on '{}': {}",
                self.name,
                subscriber,
                envelope.topic(),
                panic_message(panic.as_ref())
            ),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        // Callbacks never run under this lock, so poisoning can only come from
        // a panic inside the channel's own bookkeeping.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> Callback {
        let log = log.clone();
        callback(move |_msg, env| {
            log.lock().unwrap().push(format!("{}:{}", label, env.topic()));
            Ok(())
        })
    }

    #[test]
    fn delivers_in_registration_order_with_exact_topic() {
        let channel = Channel::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        channel.subscribe("x", [("#.success", recorder(&log, "x"))]);
        channel.subscribe("y", [("a.init.success", recorder(&log, "y"))]);
        channel.publish("a.init.success", Message::Empty);
        channel.publish("nobody.listens", Message::Empty);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["x:a.init.success", "y:a.init.success"]
        );
    }

    #[test]
    fn unsubscribe_removes_every_binding_and_is_idempotent() {
        let channel = Channel::new("test");
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = hits.clone();
        let h2 = hits.clone();
        channel.subscribe(
            "x",
            [
                ("t1", callback(move |_, _| { h1.fetch_add(1, Ordering::SeqCst); Ok(()) })),
                ("t2", callback(move |_, _| { h2.fetch_add(1, Ordering::SeqCst); Ok(()) })),
            ],
        );
        channel.subscribe_one("other", "t1", |_, _| Ok(()));
        assert_eq!(channel.unsubscribe("x"), 2);
        assert_eq!(channel.unsubscribe("x"), 0);
        channel.publish("t1", Message::Empty);
        channel.publish("t2", Message::Empty);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(channel.subscription_count(), 1);
    }

    #[test]
    fn resubscribing_same_pattern_replaces_the_callback() {
        let channel = Channel::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        channel.subscribe("x", [("t", recorder(&log, "old"))]);
        channel.subscribe("x", [("t", recorder(&log, "new"))]);
        assert_eq!(channel.patterns_of("x"), vec!["t"]);
        channel.publish("t", Message::Empty);
        assert_eq!(*log.lock().unwrap(), vec!["new:t"]);
    }

    #[test]
    fn failing_subscribers_do_not_affect_others() {
        let channel = Channel::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        channel.subscribe_one("err", "t", |_, _| Err(anyhow::anyhow!("nope")));
        channel.subscribe_one("panic", "t", |_, _| panic!("subscriber blew up"));
        channel.subscribe("ok", [("t", recorder(&log, "ok"))]);
        channel.publish("t", Message::Empty);
        channel.publish("t", Message::Empty);
        assert_eq!(*log.lock().unwrap(), vec!["ok:t", "ok:t"]);
    }

    #[test]
    fn reentrant_publish_is_delivered_after_the_current_message() {
        let channel = Arc::new(Channel::new("test"));
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner = channel.clone();
        channel.subscribe_one("relay", "first", move |_, _| {
            inner.publish("second", Message::Empty);
            Ok(())
        });
        channel.subscribe("late", [("#", recorder(&log, "late"))]);
        channel.publish("first", Message::Empty);
        // "late" must see "first" before "second" even though "second" was
        // published while "first" was still being delivered.
        assert_eq!(*log.lock().unwrap(), vec!["late:first", "late:second"]);
    }

    #[tokio::test]
    async fn request_is_answered_by_the_responder() {
        let channel = Channel::new("test");
        channel.subscribe_one("echo", "echo.request", |msg, env| {
            if let Some(responder) = env.responder() {
                responder.resolve(msg.clone());
            }
            Ok(())
        });
        let reply = channel
            .request("echo.request", Message::Data(serde_json::json!({"ping": 1})))
            .await
            .unwrap();
        assert_eq!(reply.data(), Some(&serde_json::json!({"ping": 1})));
    }

    #[tokio::test]
    async fn request_without_responder_fails() {
        let channel = Channel::new("test");
        let err = channel.request("void", Message::Empty).await.unwrap_err();
        assert_eq!(err, BusError::NoResponder { topic: "void".into() });

        channel.subscribe_one("rejecting", "deny", |_, env| {
            if let Some(responder) = env.responder() {
                responder.reject("not allowed");
            }
            Ok(())
        });
        let err = channel.request("deny", Message::Empty).await.unwrap_err();
        assert_eq!(
            err,
            BusError::Rejected { topic: "deny".into(), reason: "not allowed".into() }
        );
    }
}
