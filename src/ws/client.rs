use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::frames::{
    ping_message, post_message, subscribe_message, unsubscribe_message, ConnectionState, Frame,
    FrameHandler, PostKind,
};
use crate::config::WsConfig;
use crate::error::{Error, Result};

type HandlerList = Vec<Arc<dyn FrameHandler>>;

#[derive(Default)]
struct Handlers {
    by_channel: HashMap<String, HandlerList>,
    wildcard: HandlerList,
}

/// Item on the dispatch queue. Local frames only reach wildcard handlers.
struct Dispatch {
    frame: Frame,
    local: bool,
}

/// A sent post; `data` is filled in once the response arrives
struct PendingPost {
    posted: Instant,
    data: Option<Value>,
}

impl PendingPost {
    fn new() -> Self {
        Self {
            posted: Instant::now(),
            data: None,
        }
    }
}

struct Tasks {
    connection: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

struct Inner {
    url: String,
    config: WsConfig,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    outbound: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    send_lock: Mutex<()>,
    handlers: StdRwLock<Handlers>,
    pending: StdMutex<HashMap<u64, PendingPost>>,
    pending_notify: Notify,
    next_post_id: AtomicU64,
    next_sub_id: AtomicU64,
    subscriptions: StdMutex<HashMap<u64, Value>>,
    tasks: Mutex<Option<Tasks>>,
}

/// Reconnecting publish/subscribe client with correlated `post` requests
///
/// One connection task owns the socket: it writes everything queued on the
/// serialized send path, reads inbound frames, resolves `post` responses
/// into the pending table and queues every frame for the dispatch task,
/// which runs handlers one frame at a time. Cloning shares the connection.
#[derive(Clone)]
pub struct WsClient {
    inner: Arc<Inner>,
}

impl WsClient {
    pub fn new(url: impl Into<String>, config: WsConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                config,
                state,
                shutdown,
                closed: AtomicBool::new(false),
                outbound: StdMutex::new(None),
                send_lock: Mutex::new(()),
                handlers: StdRwLock::new(Handlers::default()),
                pending: StdMutex::new(HashMap::new()),
                pending_notify: Notify::new(),
                next_post_id: AtomicU64::new(1),
                next_sub_id: AtomicU64::new(1),
                subscriptions: StdMutex::new(HashMap::new()),
                tasks: Mutex::new(None),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Start the background connection loop
    ///
    /// Waits up to `connect_grace_ms` for the socket to open. Not reaching
    /// OPEN in time is logged, not returned: sends wait again on their own.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        {
            let mut tasks = self.inner.tasks.lock().await;
            if tasks.is_some() {
                return Ok(());
            }

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (dispatch_tx, dispatch_rx) = mpsc::channel(self.inner.config.dispatch_queue.max(1));
            *lock(&self.inner.outbound) = Some(out_tx);

            let connection = tokio::spawn(connection_loop(self.inner.clone(), out_rx, dispatch_tx));
            let dispatcher = tokio::spawn(dispatch_loop(self.inner.clone(), dispatch_rx));
            *tasks = Some(Tasks {
                connection,
                dispatcher,
            });
        }

        if !self.wait_open(self.inner.config.connect_grace()).await {
            warn!(url = %self.inner.url, "⚠️  WebSocket not open after grace period, continuing in background");
        }
        Ok(())
    }

    /// Stop reconnecting, close the socket and release every waiter
    ///
    /// Idempotent. Background tasks are joined with a bounded timeout.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks = self.inner.tasks.lock().await.take();
        if tasks.is_some() {
            self.inner.state.send_replace(ConnectionState::Closing);
        }
        self.inner.shutdown.send_replace(true);
        lock(&self.inner.outbound).take();
        self.inner.pending_notify.notify_waiters();

        if let Some(tasks) = tasks {
            let join = self.inner.config.close_join();
            join_bounded("connection", tasks.connection, join).await;
            join_bounded("dispatcher", tasks.dispatcher, join).await;
        }

        self.inner.state.send_replace(ConnectionState::Disconnected);
        info!(url = %self.inner.url, "WebSocket client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn add_handler(&self, channel: impl Into<String>, handler: Arc<dyn FrameHandler>) {
        write(&self.inner.handlers)
            .by_channel
            .entry(channel.into())
            .or_default()
            .push(handler);
    }

    pub fn add_wildcard_handler(&self, handler: Arc<dyn FrameHandler>) {
        write(&self.inner.handlers).wildcard.push(handler);
    }

    /// Subscribe and return a local handle used to unsubscribe later
    ///
    /// The subscription is replayed automatically after every reconnect.
    pub async fn subscribe(&self, subscription: Value) -> Result<u64> {
        self.send(subscribe_message(&subscription)).await?;

        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.subscriptions).insert(id, subscription);
        Ok(id)
    }

    /// Returns `false` for an unknown handle
    pub async fn unsubscribe(&self, id: u64) -> Result<bool> {
        let Some(subscription) = lock(&self.inner.subscriptions).get(&id).cloned() else {
            return Ok(false);
        };

        self.send(unsubscribe_message(&subscription)).await?;
        lock(&self.inner.subscriptions).remove(&id);
        Ok(true)
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(ping_message()).await
    }

    /// Send an info request; returns its id without waiting for the reply
    ///
    /// The response is kept for `await_post` until `pending_ttl_secs` after
    /// the post, then dropped.
    pub async fn post_info(&self, payload: Value) -> Result<u64> {
        self.post(PostKind::Info, payload).await
    }

    /// Send a signed action; returns its id without waiting for the reply
    pub async fn post_action(&self, payload: Value) -> Result<u64> {
        self.post(PostKind::Action, payload).await
    }

    async fn post(&self, kind: PostKind, payload: Value) -> Result<u64> {
        let id = self.inner.next_post_id.fetch_add(1, Ordering::SeqCst);
        {
            let ttl = self.inner.config.pending_ttl();
            let mut pending = lock(&self.inner.pending);
            let before = pending.len();
            pending.retain(|_, p| p.posted.elapsed() < ttl);
            if pending.len() < before {
                debug!(evicted = before - pending.len(), "Dropped expired post responses");
            }
            pending.insert(id, PendingPost::new());
        }

        if let Err(e) = self.send(post_message(id, kind, payload)).await {
            lock(&self.inner.pending).remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Wait for the `data` of the post response matching `id`
    ///
    /// Returns `None` on timeout, for an id that was never posted or has
    /// expired, or once the client is closed.
    pub async fn await_post(&self, id: u64, timeout: Option<Duration>) -> Option<Value> {
        let wait = async {
            loop {
                let notified = self.inner.pending_notify.notified();
                {
                    let mut pending = lock(&self.inner.pending);
                    match pending.get(&id).map(|p| p.data.is_some()) {
                        None => return None,
                        Some(true) => return pending.remove(&id).and_then(|p| p.data),
                        Some(false) if self.is_closed() => {
                            pending.remove(&id);
                            return None;
                        }
                        Some(false) => {}
                    }
                }
                notified.await;
            }
        };

        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok().flatten(),
            None => wait.await,
        };

        if result.is_none() {
            lock(&self.inner.pending).remove(&id);
        }
        result
    }

    /// Post an info request and wait for its response payload
    pub async fn request_info(&self, payload: Value, timeout: Duration) -> Result<Value> {
        let id = self.post_info(payload).await?;
        let data = self
            .await_post(id, Some(timeout))
            .await
            .ok_or_else(|| Error::Remote(format!("no response to info request {}", id)))?;
        unwrap_response(data)
    }

    /// Serialized send path
    async fn send(&self, message: Value) -> Result<()> {
        let _guard = self.inner.send_lock.lock().await;

        if self.is_closed() {
            return Err(Error::Closed);
        }
        if !self.is_open() && !self.wait_open(self.inner.config.send_wait()).await {
            return Err(Error::NotConnected);
        }

        let tx = lock(&self.inner.outbound)
            .clone()
            .ok_or(Error::NotConnected)?;
        tx.send(message.to_string()).map_err(|_| Error::NotConnected)
    }

    async fn wait_open(&self, limit: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        let opened = async move {
            rx.wait_for(|s| *s == ConnectionState::Open)
                .await
                .map(|_| ())
        };
        matches!(tokio::time::timeout(limit, opened).await, Ok(Ok(())))
    }
}

/// Extract the payload of a post response, turning `{"type":"error"}` into `Err`
pub fn unwrap_response(data: Value) -> Result<Value> {
    let response = data
        .get("response")
        .ok_or_else(|| Error::Parse(format!("post response without body: {}", data)))?;

    match response.get("type").and_then(Value::as_str) {
        Some("error") => Err(Error::Remote(
            response
                .get("payload")
                .map(|p| p.to_string())
                .unwrap_or_default(),
        )),
        Some("info") => Ok(response
            .get("payload")
            .and_then(|p| p.get("data"))
            .cloned()
            .unwrap_or(Value::Null)),
        _ => Ok(response.get("payload").cloned().unwrap_or(Value::Null)),
    }
}

// ============== Background tasks ==============

async fn connection_loop(
    inner: Arc<Inner>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    dispatch_tx: mpsc::Sender<Dispatch>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut attempt: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        attempt = attempt.wrapping_add(1);
        inner.state.send_replace(ConnectionState::Connecting);
        debug!(url = %inner.url, attempt, "Connecting WebSocket");

        let connected = tokio::select! {
            res = tokio_tungstenite::connect_async(inner.url.as_str()) => Some(res),
            _ = stopped(&mut shutdown) => None,
        };

        match connected {
            None => break,
            Some(Err(e)) => {
                warn!(url = %inner.url, attempt, "❌ WebSocket connect failed: {}", e);
                emit_error(&dispatch_tx, format!("connect failed: {}", e)).await;
            }
            Some(Ok((stream, _))) => {
                let (mut write, mut read) = stream.split();

                // Replay before announcing OPEN so new subscribes cannot race the replay
                let replay: Vec<Value> = lock(&inner.subscriptions).values().cloned().collect();
                let mut healthy = true;
                for subscription in &replay {
                    let text = subscribe_message(subscription).to_string();
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        warn!("Resubscribe failed: {}", e);
                        healthy = false;
                        break;
                    }
                }

                if healthy {
                    inner.state.send_replace(ConnectionState::Open);
                    info!(url = %inner.url, attempt, resubscribed = replay.len(), "✅ WebSocket connected");

                    let mut ping = tokio::time::interval(inner.config.ping_interval());
                    ping.tick().await;

                    // Frames waiting for room on the dispatch queue; reads and writes keep going meanwhile
                    let mut backlog: VecDeque<Dispatch> = VecDeque::new();
                    let high_water = inner.config.dispatch_queue.max(1);

                    loop {
                        tokio::select! {
                            _ = stopped(&mut shutdown) => {
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                            permit = dispatch_tx.reserve(), if !backlog.is_empty() => {
                                let Ok(permit) = permit else { break };
                                if let Some(item) = backlog.pop_front() {
                                    permit.send(item);
                                }
                            }
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Some(frame) = Frame::parse(&text) {
                                            resolve_post(&inner, &frame);
                                            backlog.push_back(Dispatch { frame, local: false });
                                            if backlog.len() == high_water {
                                                warn!(backlog = high_water, "⚠️  Handlers falling behind, frames queued");
                                            }
                                        } else {
                                            debug!("Dropping untagged frame: {}", text.as_str());
                                        }
                                    }
                                    Some(Ok(Message::Ping(payload))) => {
                                        let _ = write.send(Message::Pong(payload)).await;
                                    }
                                    Some(Ok(Message::Close(frame))) => {
                                        info!("WebSocket closed by server: {:?}", frame);
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        error!("WebSocket read error: {}", e);
                                        emit_error(&dispatch_tx, e.to_string()).await;
                                        break;
                                    }
                                    None => break,
                                }
                            }
                            outgoing = out_rx.recv() => {
                                let Some(text) = outgoing else { break };
                                if let Err(e) = write.send(Message::Text(text.into())).await {
                                    error!("WebSocket send error: {}", e);
                                    emit_error(&dispatch_tx, e.to_string()).await;
                                    break;
                                }
                            }
                            _ = ping.tick() => {
                                let text = ping_message().to_string();
                                if let Err(e) = write.send(Message::Text(text.into())).await {
                                    warn!("Ping failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }

                    // Frames already read are still delivered unless we are stopping
                    if !*shutdown.borrow() {
                        for item in backlog.drain(..) {
                            if dispatch_tx.send(item).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        inner.state.send_replace(ConnectionState::Disconnected);

        if *shutdown.borrow() || !inner.config.auto_reconnect {
            break;
        }

        let delay = inner.config.reconnect_delay();
        debug!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(&mut shutdown) => break,
        }
    }

    inner.state.send_replace(ConnectionState::Disconnected);
    debug!(url = %inner.url, "Connection loop stopped");
}

async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<Dispatch>) {
    while let Some(Dispatch { frame, local }) = rx.recv().await {
        let (channel_handlers, wildcard) = {
            let handlers = read(&inner.handlers);
            let by_channel = if local {
                Vec::new()
            } else {
                handlers
                    .by_channel
                    .get(&frame.channel)
                    .cloned()
                    .unwrap_or_default()
            };
            (by_channel, handlers.wildcard.clone())
        };

        for handler in channel_handlers.iter().chain(wildcard.iter()) {
            match AssertUnwindSafe(handler.handle(&frame)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(channel = %frame.channel, "Handler error: {}", e),
                Err(panic) => error!(channel = %frame.channel, "Handler panicked: {}", panic_message(&*panic)),
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Store a post response for its waiter; unmatched ids are dropped
fn resolve_post(inner: &Inner, frame: &Frame) {
    let Some(id) = frame.post_id() else { return };

    let mut pending = lock(&inner.pending);
    if let Some(slot) = pending.get_mut(&id) {
        slot.data = Some(frame.data.clone());
        drop(pending);
        inner.pending_notify.notify_waiters();
    }
}

async fn emit_error(dispatch_tx: &mpsc::Sender<Dispatch>, message: String) {
    let _ = dispatch_tx
        .send(Dispatch {
            frame: Frame::error(message),
            local: true,
        })
        .await;
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn join_bounded(name: &str, handle: JoinHandle<()>, limit: Duration) {
    let abort = handle.abort_handle();
    if tokio::time::timeout(limit, handle).await.is_err() {
        warn!("{} task did not stop within {:?}, aborting", name, limit);
        abort.abort();
    }
}

// Poisoning only follows a panic elsewhere; keep serving with the inner data.
fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &StdRwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &StdRwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}
