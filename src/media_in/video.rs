//! Periodic video frame sampling
//!
//! Grabs a frame from the attached [`VideoSource`] on every tick, downscales
//! it, encodes it as JPEG and sends it to the session. Frames are sampled
//! rather than streamed; the default rate is one frame every two seconds.

use crate::events::{MediaChunk, OutboundChunk};
use crate::gemini::{LiveError, Result};
use crate::gemini_client::Session;
use crate::media_in::CaptureState;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, RgbaImage};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Which way a camera faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

impl FacingMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSourceKind {
    Camera(FacingMode),
    Screen,
}

/// A source of still frames. Dropping it releases the device.
pub trait VideoSource: Send {
    fn kind(&self) -> VideoSourceKind;

    /// The current frame, or `None` when no frame is available yet.
    /// May block for the duration of one capture.
    fn grab(&mut self) -> Result<Option<RgbaImage>>;
}

/// Acquires video sources from the host.
pub trait MediaDevices: Send {
    fn camera(&mut self, facing: FacingMode) -> Result<Box<dyn VideoSource>>;

    fn screen(&mut self) -> Result<Box<dyn VideoSource>>;

    fn open(&mut self, kind: VideoSourceKind) -> Result<Box<dyn VideoSource>> {
        match kind {
            VideoSourceKind::Camera(facing) => self.camera(facing),
            VideoSourceKind::Screen => self.screen(),
        }
    }
}

/// A JPEG-encoded, downscaled frame.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Scale `frame` by `scale` in both dimensions and encode it as JPEG.
///
/// Returns `None` when a scaled dimension rounds down to zero.
pub fn encode_frame(frame: &RgbaImage, scale: f32, quality: u8) -> Result<Option<EncodedFrame>> {
    let width = (frame.width() as f32 * scale) as u32;
    let height = (frame.height() as f32 * scale) as u32;
    if width == 0 || height == 0 {
        return Ok(None);
    }

    let scaled = if (width, height) == frame.dimensions() {
        frame.clone()
    } else {
        imageops::resize(frame, width, height, FilterType::Triangle)
    };
    let rgb = DynamicImage::ImageRgba8(scaled).into_rgb8();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)?;

    Ok(Some(EncodedFrame { jpeg, width, height }))
}

#[derive(Debug, Clone)]
pub struct VideoPipelineConfig {
    pub frame_interval: Duration,
    /// Linear scale applied before encoding
    pub scale: f32,
    /// JPEG quality, 1-100
    pub jpeg_quality: u8,
}

impl Default for VideoPipelineConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_secs(2),
            scale: 0.25,
            jpeg_quality: 100,
        }
    }
}

struct ActiveSource {
    kind: VideoSourceKind,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Samples the attached video source into the session.
pub struct VideoPipeline {
    config: VideoPipelineConfig,
    state_tx: watch::Sender<CaptureState>,
    active: Option<ActiveSource>,
}

impl Default for VideoPipeline {
    fn default() -> Self {
        Self::new(VideoPipelineConfig::default())
    }
}

impl VideoPipeline {
    pub fn new(config: VideoPipelineConfig) -> Self {
        Self {
            config,
            state_tx: watch::channel(CaptureState::Idle).0,
            active: None,
        }
    }

    /// Start sampling `source`. The previously attached source is stopped
    /// and released first.
    pub async fn attach(&mut self, source: Box<dyn VideoSource>, session: &Session) -> Result<()> {
        self.detach().await;
        if !session.is_connected() {
            return Err(LiveError::NotConnected);
        }

        let kind = source.kind();
        let cancel = CancellationToken::new();
        info!("Video sampling started: {:?} every {:?}", kind, self.config.frame_interval);

        self.state_tx.send_replace(CaptureState::Capturing);
        let task = tokio::spawn(run_sampler(
            source,
            session.clone(),
            self.config.clone(),
            self.state_tx.clone(),
            cancel.clone(),
        ));
        self.active = Some(ActiveSource { kind, cancel, task });
        Ok(())
    }

    /// Stop sampling and release the source. Idempotent.
    pub async fn detach(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            if let Err(e) = active.task.await {
                error!("Video sampler task failed: {}", e);
            }
            info!("Video source {:?} detached", active.kind);
        }
        self.state_tx.send_replace(CaptureState::Idle);
    }

    /// Kind of the attached source while it is being sampled.
    pub fn active_source(&self) -> Option<VideoSourceKind> {
        match self.capture_state() {
            CaptureState::Capturing => self.active.as_ref().map(|a| a.kind),
            CaptureState::Idle => None,
        }
    }

    pub fn capture_state(&self) -> CaptureState {
        *self.state_tx.borrow()
    }

    pub fn watch_capture_state(&self) -> watch::Receiver<CaptureState> {
        self.state_tx.subscribe()
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            active.task.abort();
        }
    }
}

async fn run_sampler(
    mut source: Box<dyn VideoSource>,
    session: Session,
    config: VideoPipelineConfig,
    state_tx: watch::Sender<CaptureState>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut frames_sent = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = session.closed() => {
                info!("Session left Connected; stopping video sampling");
                break;
            }
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let (scale, quality) = (config.scale, config.jpeg_quality);
        let grabbed = tokio::task::spawn_blocking(move || {
            let frame = source
                .grab()
                .and_then(|frame| frame.map(|f| encode_frame(&f, scale, quality)).transpose())
                .map(Option::flatten);
            (source, frame)
        })
        .await;

        let frame = match grabbed {
            Ok((returned, frame)) => {
                source = returned;
                frame
            }
            Err(e) => {
                // The source went down with the task.
                error!("Frame capture task panicked: {}", e);
                state_tx.send_replace(CaptureState::Idle);
                return;
            }
        };

        if cancel.is_cancelled() || !session.is_connected() {
            break;
        }

        match frame {
            Ok(Some(frame)) => {
                debug!(
                    "Frame {}x{}: {} KB in {:?}",
                    frame.width,
                    frame.height,
                    frame.jpeg.len() / 1024,
                    started.elapsed()
                );
                match session.send(OutboundChunk::VideoFrame(MediaChunk::jpeg(frame.jpeg))) {
                    Ok(()) => frames_sent += 1,
                    Err(e) => debug!("Dropping video frame: {}", e),
                }
            }
            Ok(None) => debug!("No frame this tick"),
            Err(e) => warn!("Frame capture failed: {}", e),
        }
    }

    drop(source);
    state_tx.send_replace(CaptureState::Idle);
    info!("Video sampling stopped after {} frames", frames_sent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini_client::LiveClient;
    use crate::testing::{test_config, FakeDevices, MockServer};
    use base64::Engine;

    fn fast() -> VideoPipelineConfig {
        VideoPipelineConfig {
            frame_interval: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_frame_scales_to_quarter() {
        let frame = RgbaImage::from_pixel(640, 480, image::Rgba([10, 200, 30, 255]));
        let encoded = encode_frame(&frame, 0.25, 100).unwrap().unwrap();
        assert_eq!((encoded.width, encoded.height), (160, 120));
        assert_eq!(&encoded.jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory_with_format(&encoded.jpeg, image::ImageFormat::Jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (160, 120));
    }

    #[test]
    fn test_encode_frame_skips_zero_dimension() {
        let frame = RgbaImage::new(3, 400);
        assert!(encode_frame(&frame, 0.25, 90).unwrap().is_none());
    }

    #[test]
    fn test_facing_toggle() {
        assert_eq!(FacingMode::User.toggled(), FacingMode::Environment);
        assert_eq!(FacingMode::Environment.toggled(), FacingMode::User);
    }

    #[tokio::test]
    async fn test_first_frame_is_immediate_and_jpeg() {
        let mut server = MockServer::start().await;
        let session = LiveClient::new().connect(test_config(&server.url)).await.unwrap();
        let mut conn = server.next_connection().await;
        let mut devices = FakeDevices::new(400, 300);

        let mut pipeline = VideoPipeline::new(VideoPipelineConfig {
            frame_interval: Duration::from_secs(60),
            ..Default::default()
        });
        pipeline.attach(devices.screen().unwrap(), &session).await.unwrap();
        assert_eq!(pipeline.active_source(), Some(VideoSourceKind::Screen));

        let frame = conn.next_frame().await.unwrap();
        assert_eq!(frame["realtimeInput"]["mediaChunks"][0]["mimeType"], "image/jpeg");
        // Nothing more until the next tick.
        assert!(conn.next_frame_within(Duration::from_millis(200)).await.is_none());

        pipeline.detach().await;
        assert_eq!(pipeline.capture_state(), CaptureState::Idle);
        assert_eq!(devices.releases(), 1);
        pipeline.detach().await;
        assert_eq!(devices.releases(), 1);
    }

    #[tokio::test]
    async fn test_default_cadence_one_quarter_frame_per_two_seconds() {
        let config = VideoPipelineConfig::default();
        assert_eq!(config.frame_interval, Duration::from_secs(2));
        assert_eq!(config.scale, 0.25);

        let mut server = MockServer::start().await;
        let session = LiveClient::new().connect(test_config(&server.url)).await.unwrap();
        let mut conn = server.next_connection().await;
        let mut devices = FakeDevices::new(400, 300);

        let mut pipeline = VideoPipeline::new(config);
        pipeline.attach(devices.screen().unwrap(), &session).await.unwrap();

        let started = Instant::now();
        let mut arrivals = Vec::new();
        while let Some(remaining) = Duration::from_millis(4500).checked_sub(started.elapsed()) {
            let Some(frame) = conn.next_frame_within(remaining).await else {
                break;
            };
            let data = frame["realtimeInput"]["mediaChunks"][0]["data"].as_str().unwrap();
            let jpeg = base64::engine::general_purpose::STANDARD.decode(data).unwrap();
            let decoded = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (100, 75));
            arrivals.push(started.elapsed());
        }

        // Ticks at 0, 2 and 4 seconds.
        assert!((2..=3).contains(&arrivals.len()), "got {} frames", arrivals.len());
        assert!(arrivals[0] < Duration::from_millis(500));
        for pair in arrivals.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1900), "frames {:?} apart", pair[1] - pair[0]);
        }

        pipeline.detach().await;
    }

    #[tokio::test]
    async fn test_attach_replaces_previous_source() {
        let mut server = MockServer::start().await;
        let session = LiveClient::new().connect(test_config(&server.url)).await.unwrap();
        let _conn = server.next_connection().await;
        let mut devices = FakeDevices::new(64, 64);

        let mut pipeline = VideoPipeline::new(fast());
        pipeline.attach(devices.camera(FacingMode::User).unwrap(), &session).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        pipeline.attach(devices.screen().unwrap(), &session).await.unwrap();
        // The camera was released before the screen started.
        assert_eq!(devices.releases(), 1);
        assert_eq!(pipeline.active_source(), Some(VideoSourceKind::Screen));

        let grabs = devices.grab_log();
        let first_screen = grabs.iter().position(|k| *k == VideoSourceKind::Screen);
        let last_camera = grabs.iter().rposition(|k| matches!(k, VideoSourceKind::Camera(_)));
        if let (Some(screen), Some(camera)) = (first_screen, last_camera) {
            assert!(camera < screen);
        }

        pipeline.detach().await;
        assert_eq!(devices.releases(), 2);
    }

    #[tokio::test]
    async fn test_stops_when_session_disconnects() {
        let server = MockServer::start().await;
        let session = LiveClient::new().connect(test_config(&server.url)).await.unwrap();
        let mut devices = FakeDevices::new(64, 64);

        let mut pipeline = VideoPipeline::new(fast());
        let mut state = pipeline.watch_capture_state();
        pipeline.attach(devices.screen().unwrap(), &session).await.unwrap();

        session.disconnect().await;
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == CaptureState::Idle))
            .await
            .expect("sampler went idle")
            .unwrap();
        assert_eq!(devices.releases(), 1);
        assert_eq!(pipeline.active_source(), None);

        let err = pipeline.attach(devices.screen().unwrap(), &session).await.unwrap_err();
        assert!(matches!(err, LiveError::NotConnected));
    }
}
