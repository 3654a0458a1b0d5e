//! Outbound chunks, inbound events and the typed event bus that routes
//! inbound events to their subscribers.

use crate::gemini::FunctionResponse;
use serde::Deserialize;
use smallvec::SmallVec;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// MIME type of microphone audio sent upstream.
pub const PCM_16K_MIME_TYPE: &str = "audio/pcm;rate=16000";
/// MIME type of sampled video frames.
pub const JPEG_MIME_TYPE: &str = "image/jpeg";

/// A media payload with its MIME descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl MediaChunk {
    /// 16 kHz, 16-bit little-endian mono PCM.
    pub fn pcm16k(data: Vec<u8>) -> Self {
        Self {
            mime_type: PCM_16K_MIME_TYPE.to_string(),
            data,
        }
    }

    pub fn jpeg(data: Vec<u8>) -> Self {
        Self {
            mime_type: JPEG_MIME_TYPE.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// A complete user text turn.
    ClientText(String),
    /// The microphone stopped; the server may flush cached audio.
    AudioStreamEnd,
}

/// Everything a producer can hand to the session for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundChunk {
    AudioChunk(MediaChunk),
    VideoFrame(MediaChunk),
    ToolResponse(Vec<FunctionResponse>),
    Control(ControlMessage),
}

impl OutboundChunk {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AudioChunk(_) => "audio",
            Self::VideoFrame(_) => "video",
            Self::ToolResponse(_) => "tool_response",
            Self::Control(_) => "control",
        }
    }
}

/// A function invocation requested by the model.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Event received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Model speech (PCM, usually 24 kHz)
    AudioOut { data: Vec<u8>, mime_type: String },
    TextOut { text: String },
    ToolCall { function_calls: Vec<FunctionCall> },
    ToolCallCancellation { ids: Vec<String> },
    TurnComplete,
    /// The model was interrupted by user activity
    Interrupted,
    InputTranscription { text: String },
    OutputTranscription { text: String },
    /// Server will disconnect soon
    GoAway { time_left: Option<String> },
    Error { message: String },
}

/// Discriminant of [`InboundEvent`] used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AudioOut,
    TextOut,
    ToolCall,
    ToolCallCancellation,
    TurnComplete,
    Interrupted,
    InputTranscription,
    OutputTranscription,
    GoAway,
    Error,
}

impl InboundEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AudioOut { .. } => EventKind::AudioOut,
            Self::TextOut { .. } => EventKind::TextOut,
            Self::ToolCall { .. } => EventKind::ToolCall,
            Self::ToolCallCancellation { .. } => EventKind::ToolCallCancellation,
            Self::TurnComplete => EventKind::TurnComplete,
            Self::Interrupted => EventKind::Interrupted,
            Self::InputTranscription { .. } => EventKind::InputTranscription,
            Self::OutputTranscription { .. } => EventKind::OutputTranscription,
            Self::GoAway { .. } => EventKind::GoAway,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

struct Subscriber {
    id: u64,
    /// Empty means every kind.
    kinds: SmallVec<[EventKind; 4]>,
    tx: mpsc::UnboundedSender<InboundEvent>,
}

impl Subscriber {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    closed: bool,
    subscribers: Vec<Subscriber>,
}

/// Publish/subscribe hub for inbound events, keyed by [`EventKind`].
///
/// Each subscriber has its own unbounded queue, so a slow consumer never
/// loses tool calls and events arrive in publish order.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given kinds, or to everything when `kinds` is empty.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        // A closed bus hands out subscriptions that end immediately.
        if !inner.closed {
            inner.subscribers.push(Subscriber {
                id,
                kinds: kinds.iter().copied().collect(),
                tx,
            });
        }
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every interested subscriber. Returns the number of
    /// subscribers it reached.
    pub fn publish(&self, event: InboundEvent) -> usize {
        let kind = event.kind();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = 0;
        for sub in inner.subscribers.iter().filter(|s| s.wants(kind)) {
            if sub.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            debug!("No subscriber for {:?} event", kind);
        }
        delivered
    }

    /// Drop every subscriber; their `recv` returns `None` once drained.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.subscribers.iter().filter(|s| !s.tx.is_closed()).count()
    }
}

/// Receiving end of a bus subscription. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<InboundEvent>,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    /// Next event, or `None` once the session has ended.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<InboundEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.subscribers.retain(|s| s.id != self.id);
        }
    }
}
