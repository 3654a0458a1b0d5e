//! Primary-monitor screen source backed by `xcap`.

use crate::gemini::{LiveError, Result};
use crate::media_in::{VideoSource, VideoSourceKind};
use image::RgbaImage;
use tracing::{debug, info};
use xcap::Monitor;

/// Captures the primary monitor (or the first one when none is primary).
pub struct ScreenSource {
    monitor_name: String,
}

impl ScreenSource {
    pub fn primary() -> Result<Self> {
        let monitor = find_monitor(None)?;
        let name = monitor.name().unwrap_or_else(|_| "Unknown".to_string());
        info!(
            "Using monitor: {} ({}x{}, primary: {})",
            name,
            monitor.width().unwrap_or(0),
            monitor.height().unwrap_or(0),
            monitor.is_primary().unwrap_or(false)
        );
        Ok(Self { monitor_name: name })
    }

    pub fn monitor_name(&self) -> &str {
        &self.monitor_name
    }
}

impl VideoSource for ScreenSource {
    fn kind(&self) -> VideoSourceKind {
        VideoSourceKind::Screen
    }

    fn grab(&mut self) -> Result<Option<RgbaImage>> {
        // Monitors are looked up per grab so hot-plugging does not strand the source.
        let monitor = find_monitor(Some(&self.monitor_name))?;
        let image = monitor
            .capture_image()
            .map_err(|e| LiveError::DeviceUnavailable(format!("screen capture failed: {e}")))?;
        debug!("Captured {}x{} screen frame", image.width(), image.height());
        Ok(Some(image))
    }
}

fn find_monitor(name: Option<&str>) -> Result<Monitor> {
    let monitors = Monitor::all().map_err(|e| LiveError::DeviceUnavailable(format!("cannot list monitors: {e}")))?;

    let by_name = name.and_then(|wanted| {
        monitors
            .iter()
            .find(|m| m.name().map(|n| n == wanted).unwrap_or(false))
            .cloned()
    });
    by_name
        .or_else(|| monitors.iter().find(|m| m.is_primary().unwrap_or(false)).cloned())
        .or_else(|| monitors.first().cloned())
        .ok_or_else(|| LiveError::DeviceUnavailable("no monitors found".into()))
}
