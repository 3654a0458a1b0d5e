//! PulseAudio microphone backend
//!
//! Records f32 samples through PulseAudio's simple API on a dedicated thread
//! and hands fixed-size blocks to the async side over a bounded channel.

use crate::gemini::{LiveError, Result};
use crate::media_in::{AudioFormat, Microphone, MicrophoneStream};

use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::Retval;
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Blocks buffered between the capture thread and the pipeline.
const BLOCK_QUEUE: usize = 32;

/// A PulseAudio source as reported by the server.
#[derive(Debug, Clone)]
pub struct PulseSource {
    pub name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Monitor of a playback sink rather than a capture device
    pub is_monitor: bool,
}

/// Microphone recorded through PulseAudio.
#[derive(Debug, Clone)]
pub struct PulseMicrophone {
    app_name: String,
    /// Source name; `None` records from the default source.
    device: Option<String>,
    format: AudioFormat,
    block_duration: Duration,
}

impl PulseMicrophone {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            device: None,
            format: AudioFormat::new(16_000, 1),
            block_duration: Duration::from_millis(20),
        }
    }

    pub fn with_device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    /// Ask the server for a specific capture format; it resamples as needed.
    pub fn with_format(mut self, format: AudioFormat) -> Self {
        self.format = format;
        self
    }

    /// List the capture sources known to the PulseAudio server.
    pub fn list_sources() -> Result<Vec<PulseSource>> {
        let unavailable = |msg: &str| LiveError::DeviceUnavailable(msg.to_string());

        let mut mainloop = Mainloop::new().ok_or_else(|| unavailable("failed to create PulseAudio mainloop"))?;
        let mut context =
            Context::new(&mainloop, "intellisolve-sources").ok_or_else(|| unavailable("failed to create PulseAudio context"))?;
        context
            .connect(None, ContextFlagSet::NOFLAGS, None)
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot reach PulseAudio: {e}")))?;

        loop {
            match mainloop.iterate(true) {
                IterateResult::Quit(_) | IterateResult::Err(_) => return Err(unavailable("PulseAudio mainloop failed")),
                IterateResult::Success(_) => {}
            }
            match context.get_state() {
                ContextState::Ready => break,
                ContextState::Failed | ContextState::Terminated => {
                    return Err(unavailable("PulseAudio connection failed"));
                }
                _ => {}
            }
        }

        let sources = Rc::new(RefCell::new(Vec::new()));
        let done = Rc::new(RefCell::new(false));
        let (sources_cb, done_cb) = (sources.clone(), done.clone());

        let _op = context.introspect().get_source_info_list(move |result| match result {
            ListResult::Item(info) => {
                let name = info.name.as_ref().map(|s| s.to_string()).unwrap_or_default();
                sources_cb.borrow_mut().push(PulseSource {
                    is_monitor: info.monitor_of_sink.is_some() || name.contains("monitor"),
                    description: info.description.as_ref().map(|s| s.to_string()).unwrap_or_default(),
                    sample_rate: info.sample_spec.rate,
                    channels: info.sample_spec.channels,
                    name,
                });
            }
            ListResult::End => *done_cb.borrow_mut() = true,
            ListResult::Error => {
                error!("Error listing PulseAudio sources");
                *done_cb.borrow_mut() = true;
            }
        });

        while !*done.borrow() {
            match mainloop.iterate(true) {
                IterateResult::Quit(_) | IterateResult::Err(_) => return Err(unavailable("PulseAudio mainloop failed")),
                IterateResult::Success(_) => {}
            }
        }

        context.disconnect();
        mainloop.quit(Retval(0));
        let list = sources.borrow().clone();
        Ok(list)
    }
}

impl Microphone for PulseMicrophone {
    fn open(&mut self) -> Result<MicrophoneStream> {
        let (tx, rx) = mpsc::channel(BLOCK_QUEUE);
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let stop = Arc::new(AtomicBool::new(false));

        let settings = self.clone();
        let thread_stop = stop.clone();
        std::thread::Builder::new()
            .name("pulse-capture".into())
            .spawn(move || record(settings, tx, ready_tx, thread_stop))
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot spawn capture thread: {e}")))?;

        match wait_blocking(|| ready_rx.recv()) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(LiveError::DeviceUnavailable(e)),
            Err(_) => return Err(LiveError::DeviceUnavailable("capture thread exited".into())),
        }

        Ok(MicrophoneStream::new(self.format, rx, move || {
            stop.store(true, Ordering::Relaxed);
        }))
    }
}

/// Run a blocking wait without stalling other tasks on a multi-threaded runtime.
fn wait_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn record(
    settings: PulseMicrophone,
    tx: mpsc::Sender<Vec<f32>>,
    ready: std::sync::mpsc::SyncSender<std::result::Result<(), String>>,
    stop: Arc<AtomicBool>,
) {
    let format = settings.format;
    let spec = Spec {
        format: Format::F32le,
        channels: format.channels as u8,
        rate: format.sample_rate,
    };
    if !spec.is_valid() {
        let _ = ready.send(Err(format!("unsupported capture format {format:?}")));
        return;
    }

    let simple = match Simple::new(
        None,
        &settings.app_name,
        Direction::Record,
        settings.device.as_deref(),
        "microphone",
        &spec,
        None,
        None,
    ) {
        Ok(simple) => simple,
        Err(e) => {
            let _ = ready.send(Err(format!("failed to open PulseAudio source: {e}")));
            return;
        }
    };
    info!(
        "PulseAudio capture opened on {} ({} Hz, {} ch)",
        settings.device.as_deref().unwrap_or("default source"),
        format.sample_rate,
        format.channels
    );
    let _ = ready.send(Ok(()));

    let frames = (format.sample_rate as u128 * settings.block_duration.as_micros() / 1_000_000) as usize;
    let mut buffer = vec![0u8; frames.max(1) * format.channels as usize * 4];

    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = simple.read(&mut buffer) {
            error!("PulseAudio read failed: {}", e);
            break;
        }
        let block = buffer
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        if tx.blocking_send(block).is_err() {
            break;
        }
    }
    debug!("PulseAudio capture thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_open_wait_leaves_runtime_responsive() {
        let ticks = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<()>(1);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            let _ = ready_tx.send(());
        });
        assert!(wait_blocking(|| ready_rx.recv()).is_ok());

        assert!(ticks.load(Ordering::Relaxed) > 2);
        ticker.abort();
    }

    #[tokio::test]
    async fn test_blocking_wait_on_current_thread_runtime() {
        assert_eq!(wait_blocking(|| 7), 7);
    }
}
