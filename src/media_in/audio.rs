//! Microphone capture pipeline
//!
//! Reads f32 blocks from a [`Microphone`], converts them to 16 kHz mono 16-bit
//! PCM, re-cuts them into fixed-size chunks and streams those to the session.
//! A separate ticker publishes a decaying input level for the UI.

use crate::events::{ControlMessage, MediaChunk, OutboundChunk};
use crate::gemini::{LiveError, Result};
use crate::gemini_client::{Session, SessionState};
use crate::media_in::CaptureState;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sample rate expected by the Live API.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Native format of a device stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }
}

/// An open microphone. Blocks are interleaved f32 in the native format.
/// The device is released when the stream is dropped.
pub struct MicrophoneStream {
    format: AudioFormat,
    blocks: mpsc::Receiver<Vec<f32>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl MicrophoneStream {
    pub fn new(
        format: AudioFormat,
        blocks: mpsc::Receiver<Vec<f32>>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            format,
            blocks,
            release: Some(Box::new(release)),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Next block, or `None` once the device has gone away.
    pub async fn next_block(&mut self) -> Option<Vec<f32>> {
        self.blocks.recv().await
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.blocks.close();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Audio input device provider
pub trait Microphone: Send {
    fn open(&mut self) -> Result<MicrophoneStream>;
}

/// Placeholder for hosts without an audio backend.
#[derive(Debug, Default)]
pub struct UnavailableMicrophone;

impl Microphone for UnavailableMicrophone {
    fn open(&mut self) -> Result<MicrophoneStream> {
        Err(LiveError::DeviceUnavailable("no microphone backend compiled in".into()))
    }
}

/// Root mean square of a block of samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Converts native device blocks into fixed-size 16 kHz PCM chunks.
pub struct PcmChunker {
    channels: usize,
    /// Input samples consumed per output sample.
    step: f64,
    /// Read position into `history`.
    pos: f64,
    history: Vec<f32>,
    pending: Vec<i16>,
    block_samples: usize,
}

impl PcmChunker {
    pub fn new(input: AudioFormat, block_duration: Duration) -> Self {
        let block_samples = (TARGET_SAMPLE_RATE as u128 * block_duration.as_micros() / 1_000_000) as usize;
        Self {
            channels: input.channels.max(1) as usize,
            step: input.sample_rate as f64 / TARGET_SAMPLE_RATE as f64,
            pos: 0.0,
            history: Vec::new(),
            pending: Vec::with_capacity(block_samples * 2),
            block_samples: block_samples.max(1),
        }
    }

    /// Samples per output chunk.
    pub fn block_samples(&self) -> usize {
        self.block_samples
    }

    /// Feed one device block and collect every completed chunk as little-endian bytes.
    pub fn push(&mut self, block: &[f32]) -> Vec<Vec<u8>> {
        let mono = to_mono(block, self.channels);
        self.resample_into_pending(&mono);

        let mut chunks = Vec::new();
        while self.pending.len() >= self.block_samples {
            let bytes = self
                .pending
                .drain(..self.block_samples)
                .flat_map(i16::to_le_bytes)
                .collect();
            chunks.push(bytes);
        }
        chunks
    }

    /// Discard partially assembled audio.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
        self.history.clear();
        self.pos = 0.0;
    }

    fn resample_into_pending(&mut self, mono: &[f32]) {
        if self.step == 1.0 {
            self.pending.extend(mono.iter().map(|&s| quantize(s)));
            return;
        }

        // Linear interpolation, carrying the tail over to the next block.
        self.history.extend_from_slice(mono);
        while self.pos + 1.0 < self.history.len() as f64 {
            let idx = self.pos as usize;
            let frac = (self.pos - idx as f64) as f32;
            let sample = self.history[idx] + (self.history[idx + 1] - self.history[idx]) * frac;
            self.pending.push(quantize(sample));
            self.pos += self.step;
        }

        let consumed = (self.pos as usize).min(self.history.len());
        self.history.drain(..consumed);
        self.pos -= consumed as f64;
    }
}

fn to_mono(block: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return block.to_vec();
    }
    block
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn quantize(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

#[derive(Debug, Clone)]
pub struct AudioPipelineConfig {
    /// Duration of each outbound chunk
    pub block_duration: Duration,
    /// Period of the volume meter
    pub meter_interval: Duration,
    /// Factor applied to the previous meter value each tick
    pub meter_decay: f32,
}

impl Default for AudioPipelineConfig {
    fn default() -> Self {
        Self {
            block_duration: Duration::from_millis(40),
            meter_interval: Duration::from_millis(100),
            meter_decay: 0.8,
        }
    }
}

/// Streams microphone audio to a session while it is connected.
pub struct AudioPipeline {
    config: AudioPipelineConfig,
    muted: Arc<AtomicBool>,
    /// Last block RMS as f32 bits
    level: Arc<AtomicU32>,
    state_tx: watch::Sender<CaptureState>,
    volume_tx: watch::Sender<f32>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
    session: Option<Session>,
}

impl Default for AudioPipeline {
    fn default() -> Self {
        Self::new(AudioPipelineConfig::default())
    }
}

impl AudioPipeline {
    pub fn new(config: AudioPipelineConfig) -> Self {
        Self {
            config,
            muted: Arc::new(AtomicBool::new(false)),
            level: Arc::new(AtomicU32::new(0)),
            state_tx: watch::channel(CaptureState::Idle).0,
            volume_tx: watch::channel(0.0).0,
            cancel: None,
            tasks: Vec::new(),
            session: None,
        }
    }

    /// Open the microphone and start streaming to `session`.
    ///
    /// Any previous run is stopped and its stream released before the device
    /// is opened again. Fails with `DeviceUnavailable` when the microphone
    /// cannot be opened and with `NotConnected` when the session is not
    /// connected.
    pub async fn start(&mut self, microphone: &mut dyn Microphone, session: &Session) -> Result<()> {
        self.halt().await;
        if !session.is_connected() {
            return Err(LiveError::NotConnected);
        }

        let stream = microphone.open()?;
        let format = stream.format();
        info!(
            "Audio capture started: {} Hz, {} ch -> {} Hz mono, {:?} chunks",
            format.sample_rate, format.channels, TARGET_SAMPLE_RATE, self.config.block_duration
        );

        let cancel = CancellationToken::new();
        self.level.store(0f32.to_bits(), Ordering::Relaxed);
        self.state_tx.send_replace(CaptureState::Capturing);

        let capture = CaptureLoop {
            stream,
            chunker: PcmChunker::new(format, self.config.block_duration),
            session: session.clone(),
            muted: self.muted.clone(),
            level: self.level.clone(),
            state_tx: self.state_tx.clone(),
            cancel: cancel.clone(),
        };
        self.tasks.push(tokio::spawn(capture.run()));
        self.tasks.push(tokio::spawn(run_meter(
            self.config.clone(),
            self.muted.clone(),
            self.level.clone(),
            self.volume_tx.clone(),
            cancel.clone(),
        )));

        self.cancel = Some(cancel);
        self.session = Some(session.clone());
        Ok(())
    }

    /// Release the microphone. Safe to repeat and safe without a prior start.
    pub async fn stop(&mut self) {
        if let Some(session) = self.halt().await {
            if session.state() == SessionState::Connected {
                if let Err(e) = session.send(OutboundChunk::Control(ControlMessage::AudioStreamEnd)) {
                    debug!("Could not send audio stream end: {}", e);
                }
            }
        }
    }

    /// Cancel and join the running tasks, so the stream is dropped on return.
    /// Yields the session of the run that was active, if any.
    async fn halt(&mut self) -> Option<Session> {
        let was_running = self.cancel.is_some();
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        self.level.store(0f32.to_bits(), Ordering::Relaxed);
        self.state_tx.send_replace(CaptureState::Idle);
        self.volume_tx.send_replace(0.0);
        self.session.take().filter(|_| was_running)
    }

    /// While muted the device stays open but nothing is sent.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn capture_state(&self) -> CaptureState {
        *self.state_tx.borrow()
    }

    pub fn watch_capture_state(&self) -> watch::Receiver<CaptureState> {
        self.state_tx.subscribe()
    }

    /// Decaying input level in `0.0..=1.0`.
    pub fn volume(&self) -> watch::Receiver<f32> {
        self.volume_tx.subscribe()
    }

    fn cancel_tasks(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.state_tx.send_replace(CaptureState::Idle);
        self.session = None;
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.cancel_tasks();
    }
}

struct CaptureLoop {
    stream: MicrophoneStream,
    chunker: PcmChunker,
    session: Session,
    muted: Arc<AtomicBool>,
    level: Arc<AtomicU32>,
    state_tx: watch::Sender<CaptureState>,
    cancel: CancellationToken,
}

impl CaptureLoop {
    async fn run(mut self) {
        let mut chunks_sent = 0u64;

        loop {
            let block = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.session.closed() => {
                    info!("Session left Connected; stopping audio capture");
                    break;
                }
                block = self.stream.next_block() => block,
            };

            let Some(block) = block else {
                warn!("Microphone stream ended");
                break;
            };

            // A block that raced with stop is dropped here.
            if self.cancel.is_cancelled() || *self.state_tx.borrow() != CaptureState::Capturing {
                continue;
            }

            if self.muted.load(Ordering::Relaxed) {
                self.level.store(0f32.to_bits(), Ordering::Relaxed);
                self.chunker.clear_pending();
                continue;
            }

            self.level.store(rms(&block).to_bits(), Ordering::Relaxed);
            for chunk in self.chunker.push(&block) {
                match self.session.send(OutboundChunk::AudioChunk(MediaChunk::pcm16k(chunk))) {
                    Ok(()) => chunks_sent += 1,
                    Err(e) => {
                        debug!("Dropping audio chunk: {}", e);
                        break;
                    }
                }
            }
        }

        let Self {
            stream,
            level,
            state_tx,
            cancel,
            ..
        } = self;
        drop(stream);
        // Stops the meter too, which then publishes a zero level.
        level.store(0f32.to_bits(), Ordering::Relaxed);
        cancel.cancel();
        state_tx.send_replace(CaptureState::Idle);
        info!("Audio capture stopped after {} chunks", chunks_sent);
    }
}

async fn run_meter(
    config: AudioPipelineConfig,
    muted: Arc<AtomicBool>,
    level: Arc<AtomicU32>,
    volume_tx: watch::Sender<f32>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(config.meter_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut volume = 0.0f32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        volume = if muted.load(Ordering::Relaxed) {
            0.0
        } else {
            let latest = f32::from_bits(level.load(Ordering::Relaxed));
            latest.max(volume * config.meter_decay)
        };
        volume_tx.send_replace(volume);
    }
    volume_tx.send_replace(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini_client::LiveClient;
    use crate::testing::{test_config, FakeMicrophone, MockServer};

    fn pcm_of(frame: &serde_json::Value) -> Option<usize> {
        let chunk = frame["realtimeInput"]["mediaChunks"].get(0)?;
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(chunk["data"].as_str()?)
            .ok()?;
        Some(bytes.len())
    }

    #[test]
    fn test_chunker_passthrough_block_size() {
        let mut chunker = PcmChunker::new(AudioFormat::new(16_000, 1), Duration::from_millis(40));
        assert_eq!(chunker.block_samples(), 640);

        assert!(chunker.push(&[0.0; 600]).is_empty());
        let chunks = chunker.push(&[0.5; 700]);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == 1280));
        // First chunk starts with the silent samples.
        assert_eq!(&chunks[0][..2], &[0, 0]);
        assert_eq!(i16::from_le_bytes([chunks[1][0], chunks[1][1]]), (0.5 * 32767.0) as i16);
    }

    #[test]
    fn test_chunker_downmixes_and_resamples() {
        let mut chunker = PcmChunker::new(AudioFormat::new(48_000, 2), Duration::from_millis(40));
        // 100 ms of stereo audio at 48 kHz: left 1.0, right 0.0.
        let block: Vec<f32> = (0..4800).flat_map(|_| [1.0, 0.0]).collect();
        let chunks = chunker.push(&block);

        // 100 ms at 16 kHz is 1600 samples: two full 640-sample chunks.
        assert_eq!(chunks.len(), 2);
        let sample = i16::from_le_bytes([chunks[0][10], chunks[0][11]]);
        assert_eq!(sample, (0.5 * 32767.0) as i16);

        let more = chunker.push(&block);
        assert_eq!(more.len(), 3);
    }

    #[test]
    fn test_chunker_clips_and_clears() {
        let mut chunker = PcmChunker::new(AudioFormat::new(16_000, 1), Duration::from_millis(10));
        let chunks = chunker.push(&[2.0; 160]);
        assert_eq!(i16::from_le_bytes([chunks[0][0], chunks[0][1]]), i16::MAX);

        chunker.push(&[0.1; 100]);
        chunker.clear_pending();
        assert!(chunker.push(&[0.1; 100]).is_empty());
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_start_fails_when_device_unavailable() {
        let server = MockServer::start().await;
        let session = LiveClient::new().connect(test_config(&server.url)).await.unwrap();
        let mut pipeline = AudioPipeline::default();

        let err = pipeline.start(&mut UnavailableMicrophone, &session).await.unwrap_err();
        assert!(matches!(err, LiveError::DeviceUnavailable(_)));
        assert_eq!(pipeline.capture_state(), CaptureState::Idle);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_streams_chunks_and_stops_with_stream_end() {
        let mut server = MockServer::start().await;
        let session = LiveClient::new().connect(test_config(&server.url)).await.unwrap();
        let mut conn = server.next_connection().await;
        let (mut mic, handle) = FakeMicrophone::new(AudioFormat::new(16_000, 1));

        let mut pipeline = AudioPipeline::default();
        pipeline.start(&mut mic, &session).await.unwrap();
        assert_eq!(pipeline.capture_state(), CaptureState::Capturing);
        assert_eq!(handle.opens(), 1);

        handle.push(vec![0.25; 1280]).await;
        assert_eq!(pcm_of(&conn.next_frame().await.unwrap()), Some(1280));
        assert_eq!(pcm_of(&conn.next_frame().await.unwrap()), Some(1280));

        pipeline.stop().await;
        assert_eq!(pipeline.capture_state(), CaptureState::Idle);
        assert_eq!(handle.releases(), 1);
        let end = conn.next_frame().await.unwrap();
        assert_eq!(end["realtimeInput"]["audioStreamEnd"], true);

        // Repeated stop is a no-op.
        pipeline.stop().await;
        assert_eq!(handle.releases(), 1);
    }

    #[tokio::test]
    async fn test_mute_holds_device_and_sends_nothing() {
        let mut server = MockServer::start().await;
        let session = LiveClient::new().connect(test_config(&server.url)).await.unwrap();
        let mut conn = server.next_connection().await;
        let (mut mic, handle) = FakeMicrophone::new(AudioFormat::new(16_000, 1));

        let mut pipeline = AudioPipeline::default();
        pipeline.set_muted(true);
        pipeline.start(&mut mic, &session).await.unwrap();

        handle.push(vec![0.5; 640]).await;
        handle.push(vec![0.5; 640]).await;
        assert!(conn.next_frame_within(Duration::from_millis(200)).await.is_none());
        assert_eq!(handle.releases(), 0);
        assert_eq!(*pipeline.volume().borrow(), 0.0);

        pipeline.set_muted(false);
        handle.push(vec![0.5; 640]).await;
        assert_eq!(pcm_of(&conn.next_frame().await.unwrap()), Some(1280));
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_meter_reports_and_decays() {
        let server = MockServer::start().await;
        let session = LiveClient::new().connect(test_config(&server.url)).await.unwrap();
        let (mut mic, handle) = FakeMicrophone::new(AudioFormat::new(16_000, 1));

        let mut pipeline = AudioPipeline::new(AudioPipelineConfig {
            meter_interval: Duration::from_millis(20),
            ..Default::default()
        });
        let mut volume = pipeline.volume();
        pipeline.start(&mut mic, &session).await.unwrap();

        handle.push(vec![0.5; 640]).await;
        tokio::time::timeout(Duration::from_secs(2), volume.wait_for(|v| (*v - 0.5).abs() < 1e-3))
            .await
            .expect("meter reached the block level")
            .unwrap();

        pipeline.stop().await;
        assert_eq!(*volume.borrow(), 0.0);
    }

    #[tokio::test]
    async fn test_stops_when_session_disconnects() {
        let server = MockServer::start().await;
        let session = LiveClient::new().connect(test_config(&server.url)).await.unwrap();
        let (mut mic, handle) = FakeMicrophone::new(AudioFormat::new(16_000, 1));

        let mut pipeline = AudioPipeline::default();
        let mut capture = pipeline.watch_capture_state();
        pipeline.start(&mut mic, &session).await.unwrap();

        session.disconnect().await;
        tokio::time::timeout(Duration::from_secs(2), capture.wait_for(|s| *s == CaptureState::Idle))
            .await
            .expect("capture went idle")
            .unwrap();
        assert_eq!(handle.releases(), 1);

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_meter_drops_to_zero_when_session_ends() {
        let server = MockServer::start().await;
        let session = LiveClient::new().connect(test_config(&server.url)).await.unwrap();
        let (mut mic, handle) = FakeMicrophone::new(AudioFormat::new(16_000, 1));

        let mut pipeline = AudioPipeline::new(AudioPipelineConfig {
            meter_interval: Duration::from_millis(20),
            ..Default::default()
        });
        let mut volume = pipeline.volume();
        pipeline.start(&mut mic, &session).await.unwrap();

        handle.push(vec![0.5; 640]).await;
        tokio::time::timeout(Duration::from_secs(2), volume.wait_for(|v| *v > 0.4))
            .await
            .expect("meter rose")
            .unwrap();

        session.disconnect().await;
        tokio::time::timeout(Duration::from_secs(2), volume.wait_for(|v| *v == 0.0))
            .await
            .expect("meter fell to zero")
            .unwrap();

        // Nothing is left running to raise it again.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*volume.borrow(), 0.0);
        assert_eq!(pipeline.capture_state(), CaptureState::Idle);
        pipeline.stop().await;
    }

    /// Counts how many streams are open at once.
    #[derive(Default)]
    struct ExclusiveMicrophone {
        open: Arc<AtomicU32>,
        peak: Arc<AtomicU32>,
        _senders: Vec<mpsc::Sender<Vec<f32>>>,
    }

    impl Microphone for ExclusiveMicrophone {
        fn open(&mut self) -> Result<MicrophoneStream> {
            let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(4);
            self._senders.push(tx);
            let open = self.open.clone();
            Ok(MicrophoneStream::new(AudioFormat::new(16_000, 1), rx, move || {
                open.fetch_sub(1, Ordering::SeqCst);
            }))
        }
    }

    #[tokio::test]
    async fn test_restart_releases_before_reopening() {
        let server = MockServer::start().await;
        let session = LiveClient::new().connect(test_config(&server.url)).await.unwrap();
        let mut mic = ExclusiveMicrophone::default();

        let mut pipeline = AudioPipeline::default();
        pipeline.start(&mut mic, &session).await.unwrap();
        tokio::task::yield_now().await;
        pipeline.start(&mut mic, &session).await.unwrap();
        assert_eq!(pipeline.capture_state(), CaptureState::Capturing);

        assert_eq!(mic.peak.load(Ordering::SeqCst), 1);
        assert_eq!(mic.open.load(Ordering::SeqCst), 1);

        pipeline.stop().await;
        assert_eq!(mic.open.load(Ordering::SeqCst), 0);
    }
}
