use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use strum_macros::{Display, EnumString, IntoStaticStr};
use thiserror::Error as ThisError;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::command::Charset;
use crate::frame::Frame;
use crate::reply::Completion;

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    #[error("at least one channel or pattern is required")]
    NoTopics,
}

/// The literal first element of a pub/sub array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
enum Action {
    Message,
    Pmessage,
    Subscribe,
    Unsubscribe,
    Psubscribe,
    Punsubscribe,
}

/// The four commands that change subscription state. Each topic argument is confirmed by its own
/// event, echoing the command keyword in lowercase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SubscriptionKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
}

impl SubscriptionKind {
    pub fn keyword(&self) -> &'static str {
        self.into()
    }

    pub fn is_unsubscribe(&self) -> bool {
        matches!(self, Self::Unsubscribe | Self::PUnsubscribe)
    }

    pub fn topic_kind(&self) -> TopicKind {
        match self {
            Self::Subscribe | Self::Unsubscribe => TopicKind::Channel,
            Self::PSubscribe | Self::PUnsubscribe => TopicKind::Pattern,
        }
    }

    /// Matches a command keyword, case-insensitively.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        [
            Self::Subscribe,
            Self::Unsubscribe,
            Self::PSubscribe,
            Self::PUnsubscribe,
        ]
        .into_iter()
        .find(|kind| kind.keyword().eq_ignore_ascii_case(keyword))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Channel,
    Pattern,
}

/// A published message. `pattern` is set when it was delivered through a pattern subscription,
/// as echoed by the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub pattern: Option<String>,
    pub payload: Bytes,
}

/// Confirmation of one topic in a subscription change, with the server's count of active
/// subscriptions after applying it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionEvent {
    pub kind: SubscriptionKind,
    /// `None` when unsubscribing from everything while nothing was subscribed.
    pub topic: Option<String>,
    pub active: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Message(Message),
    SubscriptionChange(SubscriptionEvent),
    Reply(Frame),
}

/// Sorts an inbound value into a published message, a subscription confirmation, or an ordinary
/// reply. Arrays that merely look similar (wrong length, wrong element types) are replies.
pub fn classify(frame: Frame, charset: Charset) -> Inbound {
    let inbound = match &frame {
        Frame::Array(items) if items.len() >= 3 => classify_array(items, charset),
        _ => None,
    };

    inbound.unwrap_or(Inbound::Reply(frame))
}

fn classify_array(items: &[Frame], charset: Charset) -> Option<Inbound> {
    let action: Action = match &items[0] {
        Frame::Bulk(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok()?,
        Frame::Simple(s) => Action::from_str(s).ok()?,
        _ => return None,
    };

    let kind = match action {
        Action::Message => {
            let [_, channel, payload] = items else {
                return None;
            };
            return Some(Inbound::Message(Message {
                channel: text(channel, charset)?,
                pattern: None,
                payload: payload_of(payload)?,
            }));
        }
        Action::Pmessage => {
            let [_, pattern, channel, payload] = items else {
                return None;
            };
            return Some(Inbound::Message(Message {
                channel: text(channel, charset)?,
                pattern: Some(text(pattern, charset)?),
                payload: payload_of(payload)?,
            }));
        }
        Action::Subscribe => SubscriptionKind::Subscribe,
        Action::Unsubscribe => SubscriptionKind::Unsubscribe,
        Action::Psubscribe => SubscriptionKind::PSubscribe,
        Action::Punsubscribe => SubscriptionKind::PUnsubscribe,
    };

    let [_, topic, Frame::Integer(active)] = items else {
        return None;
    };
    let topic = match topic {
        Frame::Null => None,
        topic => Some(text(topic, charset)?),
    };

    Some(Inbound::SubscriptionChange(SubscriptionEvent {
        kind,
        topic,
        active: *active,
    }))
}

fn text(frame: &Frame, charset: Charset) -> Option<String> {
    match frame {
        Frame::Bulk(bytes) => Some(charset.decode(bytes).into_owned()),
        Frame::Simple(s) => Some(s.clone()),
        _ => None,
    }
}

fn payload_of(frame: &Frame) -> Option<Bytes> {
    match frame {
        Frame::Bulk(bytes) => Some(bytes.clone()),
        Frame::Simple(s) => Some(Bytes::from(s.clone())),
        _ => None,
    }
}

/// How many events a subscription change waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expected {
    Events(usize),
    /// Unsubscribing from everything: done once the server reports no active subscriptions.
    UntilNoneActive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// No command of this kind is waiting for events.
    Untracked,
    Pending { accumulated: usize },
    Satisfied { active: i64 },
}

#[derive(Debug, Default)]
struct KindState {
    expected: VecDeque<Expected>,
    accumulated: usize,
}

/// Counts subscription events per kind against what the oldest command of that kind expects.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    kinds: HashMap<SubscriptionKind, KindState>,
}

impl SubscriptionTracker {
    pub fn expect(&mut self, kind: SubscriptionKind, expected: Expected) {
        self.kinds.entry(kind).or_default().expected.push_back(expected);
    }

    pub fn record(&mut self, event: &SubscriptionEvent) -> Progress {
        let state = self.kinds.entry(event.kind).or_default();
        let Some(expected) = state.expected.front().copied() else {
            return Progress::Untracked;
        };

        state.accumulated += 1;

        let satisfied = match expected {
            Expected::Events(count) => state.accumulated >= count,
            Expected::UntilNoneActive => event.active == 0,
        };

        if satisfied {
            state.expected.pop_front();
            state.accumulated = 0;
            Progress::Satisfied {
                active: event.active,
            }
        } else {
            Progress::Pending {
                accumulated: state.accumulated,
            }
        }
    }

    /// Drops the oldest expectation of `kind`, for a command that failed before being satisfied.
    pub fn abandon(&mut self, kind: SubscriptionKind) {
        if let Some(state) = self.kinds.get_mut(&kind) {
            state.expected.pop_front();
            state.accumulated = 0;
        }
    }

    pub fn clear(&mut self) {
        self.kinds.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        self.kinds.values().all(|state| state.expected.is_empty())
    }
}

/// Receives published messages. Called from a dedicated task, one message at a time, in the order
/// messages arrived on the connection.
pub trait Listener: Send + Sync + 'static {
    fn on_message(&self, message: &Message);
}

impl<F> Listener for F
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    fn on_message(&self, message: &Message) {
        self(message)
    }
}

/// A registered listener. Handles compare equal when they point to the same listener, so the same
/// handle must be used to add and later remove it.
#[derive(Clone)]
pub struct ListenerHandle(Arc<dyn Listener>);

impl ListenerHandle {
    pub fn new(listener: impl Listener) -> Self {
        Self(Arc::new(listener))
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for ListenerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ListenerHandle {}

impl Hash for ListenerHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state)
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerHandle({:p})", self.addr())
    }
}

#[derive(Debug, Default)]
struct Registry {
    channels: HashMap<String, HashSet<ListenerHandle>>,
    patterns: HashMap<String, HashSet<ListenerHandle>>,
}

impl Registry {
    fn topics(&mut self, kind: TopicKind) -> &mut HashMap<String, HashSet<ListenerHandle>> {
        match kind {
            TopicKind::Channel => &mut self.channels,
            TopicKind::Pattern => &mut self.patterns,
        }
    }
}

/// Listeners per channel and per pattern, shared between the connection and the application.
#[derive(Clone, Debug, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `listener` for every topic. Adding twice is a no-op.
    pub fn add<S: AsRef<str>>(
        &self,
        kind: TopicKind,
        listener: &ListenerHandle,
        topics: &[S],
    ) -> Result<(), Error> {
        if topics.is_empty() {
            return Err(Error::NoTopics);
        }

        let mut registry = self.lock();
        for topic in topics {
            registry
                .topics(kind)
                .entry(topic.as_ref().to_string())
                .or_default()
                .insert(listener.clone());
        }

        Ok(())
    }

    /// Deregisters `listener` from every given topic, or from all topics of `kind` when none are
    /// given. Removing an absent listener is a no-op.
    pub fn remove<S: AsRef<str>>(&self, kind: TopicKind, listener: &ListenerHandle, topics: &[S]) {
        let mut registry = self.lock();
        let map = registry.topics(kind);

        if topics.is_empty() {
            map.retain(|_, listeners| {
                listeners.remove(listener);
                !listeners.is_empty()
            });
            return;
        }

        for topic in topics {
            let topic = topic.as_ref();
            if let Some(listeners) = map.get_mut(topic) {
                listeners.remove(listener);
                if listeners.is_empty() {
                    map.remove(topic);
                }
            }
        }
    }

    /// A snapshot of the listeners for `topic`; later registry changes do not affect it.
    pub fn listeners(&self, kind: TopicKind, topic: &str) -> Vec<ListenerHandle> {
        self.lock()
            .topics(kind)
            .get(topic)
            .map(|listeners| listeners.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn topics(&self, kind: TopicKind) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().topics(kind).keys().cloned().collect();
        topics.sort();
        topics
    }
}

type Delivery = (Vec<ListenerHandle>, Message);

/// Hands messages to listeners on the application runtime so the connection reader never runs
/// user code.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Dispatcher {
    pub(crate) fn spawn(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();

        runtime.spawn(async move {
            while let Some((listeners, message)) = rx.recv().await {
                for listener in listeners {
                    let delivered =
                        panic::catch_unwind(AssertUnwindSafe(|| listener.0.on_message(&message)));
                    if delivered.is_err() {
                        error!(channel = %message.channel, "listener panicked while handling message");
                    }
                }
            }
        });

        Self { tx }
    }

    fn dispatch(&self, listeners: Vec<ListenerHandle>, message: Message) {
        if self.tx.send((listeners, message)).is_err() {
            warn!("listener dispatch task is gone; dropping message");
        }
    }
}

/// Pub/sub state of one connection.
#[derive(Debug)]
pub(crate) struct Multiplexer {
    tracker: SubscriptionTracker,
    registry: ListenerRegistry,
    dispatcher: Dispatcher,
    charset: Charset,
}

impl Multiplexer {
    pub(crate) fn new(registry: ListenerRegistry, dispatcher: Dispatcher, charset: Charset) -> Self {
        Self {
            tracker: SubscriptionTracker::default(),
            registry,
            dispatcher,
            charset,
        }
    }

    pub(crate) fn classify(&self, frame: Frame) -> Inbound {
        classify(frame, self.charset)
    }

    /// Delivers to the pattern's listeners for pattern messages, to the channel's otherwise.
    pub(crate) fn publish(&self, message: Message) {
        let listeners = match &message.pattern {
            Some(pattern) => self.registry.listeners(TopicKind::Pattern, pattern),
            None => self.registry.listeners(TopicKind::Channel, &message.channel),
        };

        if listeners.is_empty() {
            warn!(
                channel = %message.channel,
                pattern = ?message.pattern,
                "no listener registered for published message"
            );
            return;
        }

        self.dispatcher.dispatch(listeners, message);
    }

    pub(crate) fn expect(&mut self, request: &SubscriptionRequest) {
        self.tracker.expect(request.kind, request.expected);
    }

    /// Applies a confirmation on behalf of the command that owns it: the listener follows the
    /// echoed topic, then the event counts toward the command's expectation.
    pub(crate) fn confirm(&mut self, event: &SubscriptionEvent, request: &SubscriptionRequest) -> Progress {
        if let Some(topic) = &event.topic {
            let kind = event.kind.topic_kind();
            if event.kind.is_unsubscribe() {
                self.registry.remove(kind, &request.listener, &[topic]);
            } else if let Err(err) = self.registry.add(kind, &request.listener, &[topic]) {
                error!("failed to register listener: {}", err);
            }
        }

        let progress = self.tracker.record(event);
        debug!(kind = %event.kind, topic = ?event.topic, active = event.active, ?progress, "subscription event");
        progress
    }

    pub(crate) fn abandon(&mut self, kind: SubscriptionKind) {
        self.tracker.abandon(kind);
    }

    pub(crate) fn reset(&mut self) {
        self.tracker.clear();
    }
}

/// An outstanding subscribe/unsubscribe command. Resolves with the active subscription count once
/// every expected event has arrived.
#[derive(Debug)]
pub(crate) struct SubscriptionRequest {
    pub(crate) kind: SubscriptionKind,
    pub(crate) expected: Expected,
    pub(crate) listener: ListenerHandle,
    pub(crate) completion: Completion,
}
