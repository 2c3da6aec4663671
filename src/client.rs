use bytes::Bytes;
use futures::stream::{self, Stream, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::codec::RespCodec;
use crate::command::{Arg, Command, FromFrame};
use crate::commands::{Llen, Memory, Ping, Scan, ScanResponse};
use crate::config::Config;
use crate::connection::{Connection, Request};
use crate::pairing::{PairingEngine, Pending};
use crate::pubsub::{
    self, Dispatcher, Expected, ListenerHandle, ListenerRegistry, Multiplexer, SubscriptionKind,
    SubscriptionRequest, TopicKind,
};
use crate::reply::{CommandError, Reply};
use crate::transaction::Transaction;
use crate::Error;

/// A handle to one connection. Cheap to clone; every clone pipelines over the same connection,
/// which closes once all clones are dropped and no reply is outstanding.
#[derive(Clone, Debug)]
pub struct Client {
    requests: mpsc::UnboundedSender<Request>,
    codec: RespCodec,
    registry: ListenerRegistry,
}

impl Client {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let stream = TcpStream::connect(&config.address).await?;
        stream.set_nodelay(true)?;

        info!("Connected to {}", stream.peer_addr()?);

        Ok(Self::with_transport(stream, config))
    }

    /// Runs the protocol over an already established byte stream.
    ///
    /// Panics when called outside a tokio runtime and no runtime is configured.
    pub fn with_transport<T>(transport: T, config: &Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let runtime = config.runtime_handle();
        let codec = RespCodec::new(config.charset).with_max_frame_size(config.max_frame_size);
        let registry = ListenerRegistry::new();

        let pubsub = Multiplexer::new(
            registry.clone(),
            Dispatcher::spawn(&runtime),
            config.charset,
        );
        let (requests, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(transport, codec.clone(), PairingEngine::new(pubsub), rx);
        runtime.spawn(connection.run());

        Self {
            requests,
            codec,
            registry,
        }
    }

    /// Sends a command and returns its pending reply. Commands from all clones are written in
    /// submission order.
    pub fn submit<T>(&self, command: Command<T>) -> Reply<T> {
        if let Some(kind) = subscription_keyword(command.name()) {
            return Reply::failed(CommandError::Usage(format!(
                "{} must be sent with the subscription methods",
                kind
            )));
        }

        let (args, convert) = command.into_parts();
        let payload = match self.codec.encode_to_bytes(&args) {
            Ok(payload) => payload,
            Err(err) => return Reply::failed(err.into()),
        };

        let (completion, reply) = Reply::pending(convert);
        self.send(Request::new(payload, vec![Pending::Reply(completion)]));
        reply
    }

    /// Runs `f` against a [`Transaction`] and sends the queued commands as a single MULTI/EXEC
    /// block once it returns. Replies obtained inside `f` resolve when EXEC does.
    pub fn transaction<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Transaction) -> R,
    {
        let mut transaction = Transaction::new(self.codec.clone());
        let result = f(&mut transaction);

        if let Some(request) = transaction.into_request() {
            self.send(request);
        }

        result
    }

    /// Subscribes `listener` to `channels`. Resolves with the number of active subscriptions once
    /// the server confirmed every channel.
    pub fn subscribe<S: AsRef<str>>(&self, listener: &ListenerHandle, channels: &[S]) -> Reply<i64> {
        self.change_subscription(SubscriptionKind::Subscribe, listener, channels)
    }

    /// Unsubscribes from `channels`, or from every channel when none are given.
    pub fn unsubscribe<S: AsRef<str>>(
        &self,
        listener: &ListenerHandle,
        channels: &[S],
    ) -> Reply<i64> {
        self.change_subscription(SubscriptionKind::Unsubscribe, listener, channels)
    }

    pub fn psubscribe<S: AsRef<str>>(
        &self,
        listener: &ListenerHandle,
        patterns: &[S],
    ) -> Reply<i64> {
        self.change_subscription(SubscriptionKind::PSubscribe, listener, patterns)
    }

    /// Unsubscribes from `patterns`, or from every pattern when none are given.
    pub fn punsubscribe<S: AsRef<str>>(
        &self,
        listener: &ListenerHandle,
        patterns: &[S],
    ) -> Reply<i64> {
        self.change_subscription(SubscriptionKind::PUnsubscribe, listener, patterns)
    }

    fn change_subscription<S: AsRef<str>>(
        &self,
        kind: SubscriptionKind,
        listener: &ListenerHandle,
        topics: &[S],
    ) -> Reply<i64> {
        let expected = match (topics.len(), kind.is_unsubscribe()) {
            (0, true) => Expected::UntilNoneActive,
            (0, false) => {
                return Reply::failed(CommandError::Usage(format!(
                    "{} requires at least one topic",
                    kind
                )))
            }
            (count, _) => Expected::Events(count),
        };

        let args: Vec<Arg> = std::iter::once(Arg::from(kind.keyword()))
            .chain(topics.iter().map(|topic| Arg::from(topic.as_ref())))
            .collect();
        let payload = match self.codec.encode_to_bytes(&args) {
            Ok(payload) => payload,
            Err(err) => return Reply::failed(err.into()),
        };

        let (completion, reply) = Reply::pending(Box::new(i64::from_frame));
        let request = SubscriptionRequest {
            kind,
            expected,
            listener: listener.clone(),
            completion,
        };
        self.send(Request::new(payload, vec![Pending::Subscription(request)]));
        reply
    }

    /// Registers `listener` for messages on `channels` without changing what the connection is
    /// subscribed to.
    pub fn add_channel_listener<S: AsRef<str>>(
        &self,
        listener: &ListenerHandle,
        channels: &[S],
    ) -> Result<(), pubsub::Error> {
        self.registry.add(TopicKind::Channel, listener, channels)
    }

    /// Deregisters `listener` from `channels`, or from every channel when none are given.
    pub fn remove_channel_listener<S: AsRef<str>>(&self, listener: &ListenerHandle, channels: &[S]) {
        self.registry.remove(TopicKind::Channel, listener, channels)
    }

    pub fn add_pattern_listener<S: AsRef<str>>(
        &self,
        listener: &ListenerHandle,
        patterns: &[S],
    ) -> Result<(), pubsub::Error> {
        self.registry.add(TopicKind::Pattern, listener, patterns)
    }

    pub fn remove_pattern_listener<S: AsRef<str>>(&self, listener: &ListenerHandle, patterns: &[S]) {
        self.registry.remove(TopicKind::Pattern, listener, patterns)
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.registry
    }

    pub fn ping(&self, payload: Option<Bytes>) -> Reply<Bytes> {
        self.submit(Ping::new(payload).into())
    }

    pub fn llen(&self, key: impl Into<Arg>) -> Reply<i64> {
        self.submit(Llen::new(key).into())
    }

    pub fn memory_usage(&self, key: impl Into<Arg>) -> Reply<Option<i64>> {
        self.submit(Memory::usage(key).into())
    }

    pub fn scan(&self, scan: Scan) -> Reply<ScanResponse> {
        self.submit(scan.into())
    }

    /// Every key matching `pattern`, fetched page by page with SCAN until the cursor wraps around
    /// to `0`. Keys are decoded with the configured charset.
    pub fn scan_keys(
        &self,
        pattern: Option<String>,
        count: Option<u64>,
    ) -> impl Stream<Item = Result<String, CommandError>> + Send + 'static {
        let client = self.clone();
        let charset = self.codec.charset();

        let first = Scan {
            pattern: pattern.clone(),
            count,
            ..Scan::start()
        };

        stream::try_unfold(Some(first), move |scan| {
            let client = client.clone();
            let pattern = pattern.clone();
            async move {
                let Some(scan) = scan else {
                    return Ok(None);
                };

                let page = client.scan(scan).await?;
                debug!(keys = page.keys.len(), cursor = %page.cursor.escape_ascii(), "scan page");

                let keys = page
                    .keys
                    .iter()
                    .map(|key| Ok::<_, CommandError>(charset.decode(key).into_owned()))
                    .collect::<Vec<_>>();
                let next = (!page.is_last()).then(|| Scan {
                    pattern,
                    count,
                    ..Scan::new(page.cursor.clone())
                });

                Ok::<_, CommandError>(Some((stream::iter(keys), next)))
            }
        })
        .try_flatten()
    }

    fn send(&self, request: Request) {
        if let Err(mpsc::error::SendError(request)) = self.requests.send(request) {
            request.abort(&CommandError::ConnectionClosed);
        }
    }
}

fn subscription_keyword(name: &Arg) -> Option<SubscriptionKind> {
    match name {
        Arg::Str(s) => SubscriptionKind::from_keyword(s),
        Arg::Bytes(b) => std::str::from_utf8(b)
            .ok()
            .and_then(SubscriptionKind::from_keyword),
        _ => None,
    }
}
