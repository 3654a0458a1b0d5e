//! Test fixtures: a loopback Live server and fake media devices.

use crate::gemini::{LiveConfig, LiveError, Result};
use crate::media_in::{
    AudioFormat, FacingMode, MediaDevices, Microphone, MicrophoneStream, VideoSource, VideoSourceKind,
};

use futures_util::{SinkExt, StreamExt};
use image::{Rgba, RgbaImage};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Client configuration pointing at a loopback server.
pub fn test_config(url: &str) -> LiveConfig {
    LiveConfig {
        url: url.to_string(),
        setup_timeout: Duration::from_secs(2),
        reconnect_attempts: 1,
        reconnect_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy)]
enum SetupReply {
    Complete,
    Reject,
    Silent,
}

/// Loopback stand-in for the Live service.
pub struct MockServer {
    pub url: String,
    connections: mpsc::UnboundedReceiver<MockConnection>,
}

impl MockServer {
    /// Answers every setup frame with `setupComplete`.
    pub async fn start() -> Self {
        Self::spawn(SetupReply::Complete).await
    }

    /// Closes the socket in response to setup.
    pub async fn start_rejecting() -> Self {
        Self::spawn(SetupReply::Reject).await
    }

    /// Never answers setup.
    pub async fn start_silent() -> Self {
        Self::spawn(SetupReply::Silent).await
    }

    async fn spawn(reply: SetupReply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let url = format!("ws://{}", listener.local_addr().expect("local addr"));
        let (conn_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        serve(ws, reply, conn_tx).await;
                    }
                });
            }
        });

        Self { url, connections }
    }

    /// The next session that completed its setup exchange.
    pub async fn next_connection(&mut self) -> MockConnection {
        tokio::time::timeout(FRAME_TIMEOUT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("server stopped")
    }
}

async fn serve(
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    reply: SetupReply,
    conn_tx: mpsc::UnboundedSender<MockConnection>,
) {
    let (mut sink, mut stream) = ws.split();

    let setup = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(text.as_str()) {
                Ok(value) => break value,
                Err(_) => continue,
            },
            Some(Ok(_)) => continue,
            _ => return,
        }
    };

    match reply {
        SetupReply::Complete => {
            let _ = sink.send(Message::text(r#"{"setupComplete":{}}"#)).await;
        }
        SetupReply::Reject => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "invalid setup".into(),
                })))
                .await;
        }
        SetupReply::Silent => {}
    }

    let (from_client_tx, from_client) = mpsc::unbounded_channel();
    let (to_client, mut to_client_rx) = mpsc::unbounded_channel();
    let _ = conn_tx.send(MockConnection {
        setup,
        from_client,
        to_client,
    });

    let mut outbound_open = true;
    loop {
        tokio::select! {
            message = to_client_rx.recv(), if outbound_open => match message {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => outbound_open = false,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                        let _ = from_client_tx.send(value);
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}

/// Server side of one accepted session.
pub struct MockConnection {
    /// The setup frame the client sent.
    pub setup: Value,
    from_client: mpsc::UnboundedReceiver<Value>,
    to_client: mpsc::UnboundedSender<Message>,
}

impl MockConnection {
    /// Next JSON frame from the client, waiting up to two seconds.
    pub async fn next_frame(&mut self) -> Option<Value> {
        self.next_frame_within(FRAME_TIMEOUT).await
    }

    pub async fn next_frame_within(&mut self, wait: Duration) -> Option<Value> {
        tokio::time::timeout(wait, self.from_client.recv()).await.ok().flatten()
    }

    /// Collect frames until `wait` passes without one arriving.
    pub async fn drain(&mut self, wait: Duration) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame_within(wait).await {
            frames.push(frame);
        }
        frames
    }

    pub fn send_json(&self, value: Value) {
        let _ = self.to_client.send(Message::text(value.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(Message::text(text));
    }

    pub fn close(&self) {
        let _ = self.to_client.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        })));
    }
}

#[derive(Default)]
struct MicShared {
    stream: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
    opens: AtomicUsize,
    releases: AtomicUsize,
}

/// Microphone whose blocks are pushed from the test.
pub struct FakeMicrophone {
    format: AudioFormat,
    shared: Arc<MicShared>,
}

#[derive(Clone)]
pub struct MicHandle {
    shared: Arc<MicShared>,
}

impl FakeMicrophone {
    pub fn new(format: AudioFormat) -> (Self, MicHandle) {
        let shared = Arc::new(MicShared::default());
        (
            Self {
                format,
                shared: shared.clone(),
            },
            MicHandle { shared },
        )
    }
}

impl Microphone for FakeMicrophone {
    fn open(&mut self) -> Result<MicrophoneStream> {
        let (tx, rx) = mpsc::channel(64);
        *self.shared.stream.lock().unwrap() = Some(tx);
        self.shared.opens.fetch_add(1, Ordering::SeqCst);

        let shared = self.shared.clone();
        Ok(MicrophoneStream::new(self.format, rx, move || {
            shared.stream.lock().unwrap().take();
            shared.releases.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

impl MicHandle {
    /// Deliver a block to the open stream. Returns false when the device is closed.
    pub async fn push(&self, block: Vec<f32>) -> bool {
        let tx = self.shared.stream.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(block).await.is_ok(),
            None => false,
        }
    }

    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.shared.releases.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct DeviceLog {
    grabs: Mutex<Vec<VideoSourceKind>>,
    opened: Mutex<Vec<VideoSourceKind>>,
    releases: AtomicUsize,
    unavailable: Mutex<Vec<VideoSourceKind>>,
}

/// Solid-colour frames of a fixed size.
pub struct FakeVideoSource {
    kind: VideoSourceKind,
    width: u32,
    height: u32,
    log: Arc<DeviceLog>,
}

impl VideoSource for FakeVideoSource {
    fn kind(&self) -> VideoSourceKind {
        self.kind
    }

    fn grab(&mut self) -> Result<Option<RgbaImage>> {
        self.log.grabs.lock().unwrap().push(self.kind);
        Ok(Some(RgbaImage::from_pixel(self.width, self.height, Rgba([40, 90, 160, 255]))))
    }
}

impl Drop for FakeVideoSource {
    fn drop(&mut self) {
        self.log.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Device provider handing out [`FakeVideoSource`]s. Clones share their log.
#[derive(Clone)]
pub struct FakeDevices {
    width: u32,
    height: u32,
    log: Arc<DeviceLog>,
}

impl FakeDevices {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            log: Arc::new(DeviceLog::default()),
        }
    }

    /// Make acquiring `kind` fail with `DeviceUnavailable`.
    pub fn set_unavailable(&self, kind: VideoSourceKind) {
        self.log.unavailable.lock().unwrap().push(kind);
    }

    pub fn releases(&self) -> usize {
        self.log.releases.load(Ordering::SeqCst)
    }

    pub fn grab_log(&self) -> Vec<VideoSourceKind> {
        self.log.grabs.lock().unwrap().clone()
    }

    pub fn opened(&self) -> Vec<VideoSourceKind> {
        self.log.opened.lock().unwrap().clone()
    }

    fn acquire(&self, kind: VideoSourceKind) -> Result<Box<dyn VideoSource>> {
        if self.log.unavailable.lock().unwrap().contains(&kind) {
            return Err(LiveError::DeviceUnavailable(format!("{kind:?} unavailable")));
        }
        self.log.opened.lock().unwrap().push(kind);
        Ok(Box::new(FakeVideoSource {
            kind,
            width: self.width,
            height: self.height,
            log: self.log.clone(),
        }))
    }
}

impl MediaDevices for FakeDevices {
    fn camera(&mut self, facing: FacingMode) -> Result<Box<dyn VideoSource>> {
        self.acquire(VideoSourceKind::Camera(facing))
    }

    fn screen(&mut self) -> Result<Box<dyn VideoSource>> {
        self.acquire(VideoSourceKind::Screen)
    }
}
