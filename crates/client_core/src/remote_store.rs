use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use shared::{
    domain::{CounterField, CounterRecord, SubscriptionId, UserId},
    protocol::{ClientRequest, IncrementRequest, IncrementResponse, ServerEvent},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    error::{check_response, ClientError, Result},
    store::{Canceller, CounterStore, Subscription},
};

/// Backoff applied between consecutive failed connection attempts of the counter feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Consecutive failures tolerated before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }
}

enum Delivery {
    Record(mpsc::UnboundedSender<Option<CounterRecord>>),
    Collection(mpsc::UnboundedSender<Vec<CounterRecord>>),
}

struct Entry {
    request: ClientRequest,
    sink: Delivery,
}

#[derive(Default)]
struct Registry {
    next_id: i64,
    entries: HashMap<SubscriptionId, Entry>,
    /// Set once the feed has given up; nothing registers after that.
    closed: bool,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RemoteCanceller {
    registry: Weak<Mutex<Registry>>,
    commands: mpsc::UnboundedSender<ClientRequest>,
}

impl Canceller for RemoteCanceller {
    fn cancel(&self, id: SubscriptionId) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).entries.remove(&id);
        }
        // A closed feed has nothing left to unsubscribe from.
        let _ = self.commands.send(ClientRequest::Unsubscribe {
            subscription_id: id,
        });
    }
}

/// Counter store backed by the tally server: increments over HTTP, subscriptions over one
/// shared websocket that reconnects by itself.
#[derive(Clone)]
pub struct RemoteCounterStore {
    http: reqwest::Client,
    base_url: String,
    actor: UserId,
    registry: Arc<Mutex<Registry>>,
    commands: mpsc::UnboundedSender<ClientRequest>,
}

impl RemoteCounterStore {
    /// Starts the feed task for `actor` and returns immediately; the socket is opened in
    /// the background.
    pub fn connect(
        server_url: &str,
        actor: UserId,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        let base_url = server_url.trim_end_matches('/').to_string();
        let ws_url = feed_url(&base_url, actor)?;
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (commands, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_feed(ws_url, Arc::clone(&registry), command_rx, policy));

        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            actor,
            registry,
            commands,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn open<T: Send + 'static>(
        &self,
        build: impl FnOnce(SubscriptionId) -> ClientRequest,
        sink: impl FnOnce(mpsc::UnboundedSender<T>) -> Delivery,
    ) -> Result<Subscription<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = {
            let mut registry = lock(&self.registry);
            if registry.closed {
                return Err(feed_unavailable());
            }
            registry.next_id += 1;
            let id = SubscriptionId(registry.next_id);
            let request = build(id);
            registry.entries.insert(
                id,
                Entry {
                    request: request.clone(),
                    sink: sink(tx),
                },
            );
            request
        };

        let id = request.subscription_id();
        if self.commands.send(request).is_err() {
            lock(&self.registry).entries.remove(&id);
            return Err(feed_unavailable());
        }
        let canceller = Arc::new(RemoteCanceller {
            registry: Arc::downgrade(&self.registry),
            commands: self.commands.clone(),
        });
        Ok(Subscription::from_receiver(id, rx, canceller))
    }
}

fn feed_unavailable() -> ClientError {
    ClientError::Unavailable("counter feed has shut down".to_string())
}

fn feed_url(base_url: &str, actor: UserId) -> Result<Url> {
    let invalid = |reason: String| ClientError::InvalidServerUrl {
        url: base_url.to_string(),
        reason,
    };
    let mut url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other:?}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid("cannot switch to a websocket scheme".to_string()))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", &actor.0.to_string());
    Ok(url)
}

enum FeedExit {
    Shutdown,
    Disconnected(String),
}

async fn run_feed(
    ws_url: Url,
    registry: Arc<Mutex<Registry>>,
    mut commands: mpsc::UnboundedReceiver<ClientRequest>,
    policy: ReconnectPolicy,
) {
    let mut failures = 0u32;
    loop {
        match connect_async(ws_url.as_str()).await {
            Ok((socket, _)) => {
                info!(url = %ws_url, "counter feed connected");
                failures = 0;
                match pump(socket, &registry, &mut commands).await {
                    FeedExit::Shutdown => {
                        debug!("counter feed shut down");
                        return;
                    }
                    FeedExit::Disconnected(reason) => {
                        warn!(%reason, "counter feed disconnected");
                    }
                }
            }
            Err(error) => warn!(url = %ws_url, %error, "counter feed connect failed"),
        }

        failures += 1;
        if !policy.allows_retry(failures) {
            error!(failures, "counter feed giving up; ending all subscriptions");
            let mut registry = lock(&registry);
            registry.closed = true;
            registry.entries.clear();
            return;
        }

        let delay = policy.delay_for(failures);
        debug!(failures, delay_ms = delay.as_millis() as u64, "counter feed backing off");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        // Requests queued while offline are replayed from the registry on reconnect.
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => {
                    if command.is_none() {
                        return;
                    }
                }
            }
        }
    }
}

async fn pump<S>(
    socket: S,
    registry: &Mutex<Registry>,
    commands: &mut mpsc::UnboundedReceiver<ClientRequest>,
) -> FeedExit
where
    S: Stream<Item = std::result::Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let (mut writer, mut reader) = socket.split();

    let replay: Vec<ClientRequest> = lock(registry)
        .entries
        .values()
        .map(|entry| entry.request.clone())
        .collect();
    for request in &replay {
        if let Err(error) = send_request(&mut writer, request).await {
            return FeedExit::Disconnected(error.to_string());
        }
    }
    // Subscribes still queued in `commands` went out with the replay.
    let mut replayed: HashSet<SubscriptionId> =
        replay.iter().map(ClientRequest::subscription_id).collect();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(request) => {
                    let is_subscribe = !matches!(request, ClientRequest::Unsubscribe { .. });
                    if is_subscribe && replayed.remove(&request.subscription_id()) {
                        continue;
                    }
                    if let Err(error) = send_request(&mut writer, &request).await {
                        return FeedExit::Disconnected(error.to_string());
                    }
                }
                None => {
                    let _ = writer.close().await;
                    return FeedExit::Shutdown;
                }
            },
            message = reader.next() => match message {
                Some(Ok(Message::Text(text))) => dispatch(registry, &text),
                Some(Ok(Message::Close(_))) | None => {
                    return FeedExit::Disconnected("closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return FeedExit::Disconnected(error.to_string()),
            },
        }
    }
}

async fn send_request<W>(writer: &mut W, request: &ClientRequest) -> std::result::Result<(), WsError>
where
    W: Sink<Message, Error = WsError> + Unpin,
{
    match serde_json::to_string(request) {
        Ok(text) => writer.send(Message::Text(text)).await,
        Err(error) => {
            error!(%error, "failed to encode counter feed request");
            Ok(())
        }
    }
}

fn dispatch(registry: &Mutex<Registry>, text: &str) {
    let event = match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => event,
        Err(error) => {
            warn!(%error, "invalid counter feed event");
            return;
        }
    };

    let mut registry = lock(registry);
    let (id, closed) = match event {
        ServerEvent::RecordSnapshot {
            subscription_id,
            record,
        } => match registry.entries.get(&subscription_id) {
            Some(Entry {
                sink: Delivery::Record(sink),
                ..
            }) => (subscription_id, sink.send(record).is_err()),
            _ => (subscription_id, false),
        },
        ServerEvent::CollectionSnapshot {
            subscription_id,
            records,
        } => match registry.entries.get(&subscription_id) {
            Some(Entry {
                sink: Delivery::Collection(sink),
                ..
            }) => (subscription_id, sink.send(records).is_err()),
            _ => (subscription_id, false),
        },
        ServerEvent::Error(error) => {
            warn!(code = ?error.code, message = %error.message, "counter feed reported an error");
            return;
        }
    };
    if closed {
        registry.entries.remove(&id);
    }
}

#[async_trait]
impl CounterStore for RemoteCounterStore {
    async fn subscribe_record(
        &self,
        user_id: UserId,
    ) -> Result<Subscription<Option<CounterRecord>>> {
        self.open(
            |subscription_id| ClientRequest::SubscribeRecord {
                subscription_id,
                user_id,
            },
            Delivery::Record,
        )
    }

    async fn subscribe_collection(
        &self,
        order_by: &CounterField,
    ) -> Result<Subscription<Vec<CounterRecord>>> {
        let order_by = order_by.clone();
        self.open(
            |subscription_id| ClientRequest::SubscribeCollection {
                subscription_id,
                order_by,
            },
            Delivery::Collection,
        )
    }

    async fn atomic_increment(
        &self,
        user_id: UserId,
        field: &CounterField,
        delta: i64,
    ) -> Result<i64> {
        let response = self
            .http
            .post(format!(
                "{}/records/{}/counters/{}/increment",
                self.base_url, user_id.0, field
            ))
            .query(&[("user_id", self.actor.0)])
            .json(&IncrementRequest { delta })
            .send()
            .await?;
        let body: IncrementResponse = check_response(response).await?.json().await?;
        Ok(body.value)
    }
}

#[cfg(test)]
#[path = "tests/remote_store_tests.rs"]
mod tests;
