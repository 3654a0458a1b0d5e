//! Session state controller
//!
//! Ties the session client, the capture pipelines and the tool dispatcher
//! together behind the handful of operations a control surface needs.

use crate::events::{ControlMessage, EventKind, InboundEvent, OutboundChunk};
use crate::gemini::{LiveConfig, LiveError, Result};
use crate::gemini_client::{LiveClient, Session};
use crate::media_in::audio::rms;
use crate::media_in::{
    AudioPipeline, AudioPipelineConfig, CaptureState, FacingMode, MediaDevices, Microphone, VideoPipeline,
    VideoPipelineConfig, VideoSourceKind,
};
use crate::tools::{DispatcherConfig, ToolDispatcher, ToolRegistry};

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Connecting,
    Connected,
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Drives one live conversation: connect, stream, answer tools, disconnect.
pub struct SessionController {
    config: LiveConfig,
    registry: Arc<ToolRegistry>,
    microphone: Box<dyn Microphone>,
    devices: Box<dyn MediaDevices>,
    client: LiveClient,
    session: Option<Session>,
    audio: AudioPipeline,
    video: VideoPipeline,
    dispatcher_config: DispatcherConfig,
    dispatcher: Option<ToolDispatcher>,
    supervisor: Option<Supervisor>,
    state_tx: watch::Sender<ControllerState>,
    output_volume_tx: watch::Sender<f32>,
    muted: bool,
    video_selection: Option<VideoSourceKind>,
    facing: FacingMode,
}

impl SessionController {
    pub fn new(
        config: LiveConfig,
        registry: ToolRegistry,
        microphone: Box<dyn Microphone>,
        devices: Box<dyn MediaDevices>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            microphone,
            devices,
            client: LiveClient::new(),
            session: None,
            audio: AudioPipeline::default(),
            video: VideoPipeline::default(),
            dispatcher_config: DispatcherConfig::default(),
            dispatcher: None,
            supervisor: None,
            state_tx: watch::channel(ControllerState::Idle).0,
            output_volume_tx: watch::channel(0.0).0,
            muted: false,
            video_selection: None,
            facing: FacingMode::default(),
        }
    }

    pub fn with_audio_config(mut self, config: AudioPipelineConfig) -> Self {
        self.audio = AudioPipeline::new(config);
        self
    }

    pub fn with_video_config(mut self, config: VideoPipelineConfig) -> Self {
        self.video = VideoPipeline::new(config);
        self
    }

    pub fn with_dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Open a session and start streaming. A no-op while already connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state() != ControllerState::Idle {
            return Ok(());
        }
        // Tear down whatever a remote close left behind.
        self.teardown().await;
        self.state_tx.send_replace(ControllerState::Connecting);

        let mut config = self.config.clone();
        for declaration in self.registry.declarations() {
            if !config.tools.iter().any(|t| t.name == declaration.name) {
                config.tools.push(declaration);
            }
        }

        let session = match self.client.connect(config).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Connect failed: {}", e);
                self.state_tx.send_replace(ControllerState::Idle);
                return Err(e);
            }
        };

        self.dispatcher = Some(ToolDispatcher::spawn(
            &session,
            self.registry.clone(),
            self.dispatcher_config.clone(),
        ));

        self.audio.set_muted(self.muted);
        if let Err(e) = self.audio.start(self.microphone.as_mut(), &session).await {
            warn!("Microphone not streaming: {}", e);
        }

        if let Some(kind) = self.video_selection {
            if let Err(e) = self.attach_video(kind, &session).await {
                warn!("Video source {:?} not streaming: {}", kind, e);
                self.video_selection = None;
            }
        }

        self.state_tx.send_replace(ControllerState::Connected);
        self.supervisor = Some(spawn_supervisor(
            &session,
            self.state_tx.clone(),
            self.output_volume_tx.clone(),
        ));
        self.session = Some(session);
        info!("Controller connected");
        Ok(())
    }

    /// Stop every pipeline, then close the session. A no-op while idle.
    pub async fn disconnect(&mut self) {
        if self.session.is_none() && self.state() == ControllerState::Idle {
            return;
        }
        self.teardown().await;
        self.state_tx.send_replace(ControllerState::Idle);
        info!("Controller disconnected");
    }

    async fn teardown(&mut self) {
        self.video.detach().await;
        self.audio.stop().await;
        self.dispatcher = None;
        self.supervisor = None;
        self.client.disconnect().await;
        self.session = None;
        self.output_volume_tx.send_replace(0.0);
    }

    /// Muting keeps the microphone open but stops sending audio.
    pub fn set_muted(&mut self, muted: bool) {
        if self.muted != muted {
            info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        }
        self.muted = muted;
        self.audio.set_muted(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Select the video source, or none. While connected the old source is
    /// released before the new one is acquired.
    pub async fn set_video_source(&mut self, kind: Option<VideoSourceKind>) -> Result<()> {
        let session = self.connected_session();
        if kind == self.video_selection && (session.is_none() || self.video.active_source() == kind) {
            return Ok(());
        }

        self.video.detach().await;
        self.video_selection = kind;
        if let Some(VideoSourceKind::Camera(facing)) = kind {
            self.facing = facing;
        }

        if let (Some(kind), Some(session)) = (kind, session) {
            if let Err(e) = self.attach_video(kind, &session).await {
                self.video_selection = None;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Flip between the user- and environment-facing camera.
    pub async fn switch_camera(&mut self) -> Result<()> {
        self.facing = self.facing.toggled();
        info!("Camera facing {:?}", self.facing);
        match self.video_selection {
            Some(VideoSourceKind::Camera(_)) => self.set_video_source(Some(VideoSourceKind::Camera(self.facing))).await,
            _ => Ok(()),
        }
    }

    /// Send a complete user text turn.
    pub fn send_text(&self, text: &str) -> Result<()> {
        let session = self.connected_session().ok_or(LiveError::NotConnected)?;
        session.send(OutboundChunk::Control(ControlMessage::ClientText(text.to_string())))
    }

    pub fn state(&self) -> ControllerState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ControllerState> {
        self.state_tx.subscribe()
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn video_source(&self) -> Option<VideoSourceKind> {
        self.video_selection
    }

    pub fn facing(&self) -> FacingMode {
        self.facing
    }

    pub fn audio_capture_state(&self) -> CaptureState {
        self.audio.capture_state()
    }

    pub fn video_capture_state(&self) -> CaptureState {
        self.video.capture_state()
    }

    /// Microphone level for the UI.
    pub fn input_volume(&self) -> watch::Receiver<f32> {
        self.audio.volume()
    }

    /// Level of the model's speech for the UI.
    pub fn output_volume(&self) -> watch::Receiver<f32> {
        self.output_volume_tx.subscribe()
    }

    fn connected_session(&self) -> Option<Session> {
        self.session.as_ref().filter(|s| s.is_connected()).cloned()
    }

    async fn attach_video(&mut self, kind: VideoSourceKind, session: &Session) -> Result<()> {
        let source = self.devices.open(kind)?;
        self.video.attach(source, session).await
    }
}

fn spawn_supervisor(
    session: &Session,
    state_tx: watch::Sender<ControllerState>,
    output_volume_tx: watch::Sender<f32>,
) -> Supervisor {
    let cancel = CancellationToken::new();
    let mut events = session.subscribe(&[EventKind::AudioOut, EventKind::TurnComplete, EventKind::Interrupted]);
    let session = session.clone();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = session.closed() => break,
                event = events.recv() => match event {
                    Some(InboundEvent::AudioOut { data, .. }) => {
                        output_volume_tx.send_replace(pcm16_level(&data));
                    }
                    Some(_) => {
                        output_volume_tx.send_replace(0.0);
                    }
                    None => break,
                },
            }
        }

        warn!("Session {} ended ({:?}); returning to idle", session.id(), session.state());
        output_volume_tx.send_replace(0.0);
        state_tx.send_replace(ControllerState::Idle);
    });

    Supervisor { cancel, task }
}

/// RMS of 16-bit little-endian PCM, normalised to `0.0..=1.0`.
fn pcm16_level(data: &[u8]) -> f32 {
    let samples: Vec<f32> = data
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
        .collect();
    rms(&samples).min(1.0)
}
