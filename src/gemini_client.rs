//! Gemini Live session client
//!
//! Owns the duplex WebSocket. The socket is split into a sink, drained by a
//! single writer task so that `send` order is wire order, and a stream read by
//! a reader task that demultiplexes frames onto the session's [`EventBus`].

use crate::events::{EventBus, EventKind, OutboundChunk, Subscription};
use crate::gemini::{ClientMessage, LiveConfig, LiveError, Result, ServerMessage};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long a local disconnect waits for the close frame to flush.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Errored,
}

impl SessionState {
    /// Whether the session still holds (or is acquiring) the channel.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Disconnecting)
    }
}

struct SessionInner {
    id: u64,
    config: LiveConfig,
    state_tx: watch::Sender<SessionState>,
    outbound: mpsc::UnboundedSender<Message>,
    bus: EventBus,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one connected session. Cheap to clone; every component that
/// sends or listens gets its own clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Open the channel, send the setup frame and wait for `setupComplete`.
    async fn open(config: LiveConfig) -> Result<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (state_tx, _) = watch::channel(SessionState::Connecting);

        let ws = match connect_with_retry(&config).await {
            Ok(ws) => ws,
            Err(e) => {
                state_tx.send_replace(SessionState::Errored);
                return Err(e);
            }
        };
        let (sink, mut stream) = ws.split();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(id, sink, outbound_rx));

        let inner = Arc::new(SessionInner {
            id,
            config,
            state_tx,
            outbound,
            bus: EventBus::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(vec![writer]),
        });

        if let Err(e) = handshake(&inner, &mut stream).await {
            error!("Session {} setup failed: {}", id, e);
            let _ = inner.outbound.send(Message::Close(None));
            inner.state_tx.send_replace(SessionState::Errored);
            return Err(e);
        }

        inner.state_tx.send_replace(SessionState::Connected);
        info!("Session {} connected (model {})", id, inner.config.model);

        let reader = tokio::spawn(run_reader(inner.clone(), stream));
        inner.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(reader);

        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &LiveConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Resolves once the session is no longer connected.
    pub async fn closed(&self) {
        let mut state = self.inner.state_tx.subscribe();
        let _ = state.wait_for(|s| *s != SessionState::Connected).await;
    }

    /// Subscribe to inbound events of the given kinds (all kinds when empty).
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.inner.bus.subscribe(kinds)
    }

    /// Queue a chunk for delivery. Fire-and-forget; chunks go out in call order.
    pub fn send(&self, chunk: OutboundChunk) -> Result<()> {
        if !self.is_connected() {
            return Err(LiveError::NotConnected);
        }
        let kind = chunk.kind();
        let json = serde_json::to_string(&ClientMessage::from(chunk))?;
        debug!("Queueing {} message ({} bytes)", kind, json.len());
        self.inner
            .outbound
            .send(Message::text(json))
            .map_err(|_| LiveError::NotConnected)
    }

    /// Close the channel. Safe to call in any state.
    pub async fn disconnect(&self) {
        let proceed = self.inner.state_tx.send_if_modified(|state| match state {
            SessionState::Connecting | SessionState::Connected => {
                *state = SessionState::Disconnecting;
                true
            }
            _ => false,
        });
        if !proceed {
            return;
        }

        info!("Disconnecting session {}", self.inner.id);
        let _ = self.inner.outbound.send(Message::Close(None));
        self.inner.cancel.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, task).await.is_err() {
                warn!("Session {} task did not stop in time; aborting", self.inner.id);
                abort.abort();
            }
        }

        self.inner.bus.close();
        self.inner.state_tx.send_replace(SessionState::Disconnected);
        info!("Session {} disconnected", self.inner.id);
    }
}

/// Owner of the single active session.
#[derive(Default)]
pub struct LiveClient {
    active: Option<Session>,
}

impl LiveClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new session. Fails with [`LiveError::SessionActive`] while the
    /// previous session still holds its channel.
    pub async fn connect(&mut self, config: LiveConfig) -> Result<Session> {
        if let Some(session) = &self.active {
            if session.state().is_live() {
                return Err(LiveError::SessionActive);
            }
        }
        let session = Session::open(config).await?;
        self.active = Some(session.clone());
        Ok(session)
    }

    /// The most recent session, whatever its state.
    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref()
    }

    pub async fn disconnect(&mut self) {
        if let Some(session) = self.active.take() {
            session.disconnect().await;
        }
    }
}

async fn connect_with_retry(config: &LiveConfig) -> Result<WsStream> {
    if config.url.is_empty() {
        return Err(LiveError::Config("no WebSocket URL configured".into()));
    }

    let attempts = config.reconnect_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        info!("Connecting to Gemini Live API (attempt {}/{})", attempt, attempts);
        match connect_async(config.url.as_str()).await {
            Ok((ws, resp)) => {
                debug!("WebSocket connection response: {:?}", resp.status());
                return Ok(ws);
            }
            Err(e) => {
                warn!("Connection attempt {} failed: {}", attempt, e);
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(config.reconnect_delay).await;
                }
            }
        }
    }

    Err(LiveError::Connection(match last_error {
        Some(e) => e.to_string(),
        None => "no connection attempt made".to_string(),
    }))
}

async fn handshake(inner: &SessionInner, stream: &mut WsSource) -> Result<()> {
    let setup = ClientMessage::Setup(inner.config.setup_message());
    let json = serde_json::to_string(&setup)?;
    info!("Sending setup message with model: {}", inner.config.model);
    inner
        .outbound
        .send(Message::text(json))
        .map_err(|_| LiveError::Connection("writer stopped before setup".into()))?;

    let wait = async {
        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.as_str().to_owned(),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| "no reason".to_string());
                    return Err(LiveError::Connection(format!("setup rejected: {reason}")));
                }
                Ok(_) => continue,
                Err(e) => return Err(LiveError::Connection(e.to_string())),
            };
            match ServerMessage::parse(&text) {
                Ok(msg) if msg.is_setup_complete() => return Ok(()),
                Ok(_) => debug!("Ignoring frame received before setupComplete"),
                Err(e) => warn!("{}", e),
            }
        }
        Err(LiveError::Connection("connection closed during setup".into()))
    };

    tokio::time::timeout(inner.config.setup_timeout, wait)
        .await
        .map_err(|_| LiveError::Connection("timeout waiting for setupComplete".into()))?
}

async fn run_writer(id: u64, mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            error!("Session {} failed to send message: {}", id, e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
    debug!("Session {} writer stopped", id);
}

async fn run_reader(inner: Arc<SessionInner>, mut stream: WsSource) {
    info!("Session {} inbound task started", inner.id);

    let end_state = loop {
        let message = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break None,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => handle_frame(&inner.bus, text.as_str()),
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_frame(&inner.bus, text),
                Err(_) => debug!("Dropping non-UTF-8 binary frame ({} bytes)", bytes.len()),
            },
            Some(Ok(Message::Close(frame))) => {
                info!("WebSocket closed by server: {:?}", frame);
                break Some(SessionState::Disconnected);
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("WebSocket error: {}", e);
                break Some(SessionState::Errored);
            }
            None => {
                info!("WebSocket stream ended");
                break Some(SessionState::Disconnected);
            }
        }
    };

    if let Some(end_state) = end_state {
        // Remote close: stop the writer and notify observers.
        inner.cancel.cancel();
        let _ = inner.outbound.send(Message::Close(None));
        inner.bus.close();
        inner.state_tx.send_if_modified(|state| {
            if *state == SessionState::Connected {
                *state = end_state;
                true
            } else {
                false
            }
        });
    }

    info!("Session {} inbound task terminated", inner.id);
}

fn handle_frame(bus: &EventBus, text: &str) {
    match ServerMessage::parse(text) {
        Ok(message) => {
            let events = message.into_events();
            if events.is_empty() {
                debug!("Dropping frame of unhandled kind: {}", truncate(text, 120));
            }
            for event in events {
                bus.publish(event);
            }
        }
        Err(e) => warn!("{}; raw frame: {}", e, truncate(text, 200)),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
