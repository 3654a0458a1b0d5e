//! Media input pipelines and device abstractions

pub mod audio;
pub mod video;

pub use audio::{
    AudioFormat, AudioPipeline, AudioPipelineConfig, Microphone, MicrophoneStream, PcmChunker,
    UnavailableMicrophone,
};
pub use video::{
    encode_frame, EncodedFrame, FacingMode, MediaDevices, VideoPipeline, VideoPipelineConfig, VideoSource,
    VideoSourceKind,
};

use crate::gemini::{LiveError, Result};

/// Whether a pipeline is currently streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Capturing,
}

/// Video sources available on this host. Screen capture needs the `capture`
/// feature; cameras are not supported natively.
#[derive(Debug, Default)]
pub struct NativeDevices;

impl MediaDevices for NativeDevices {
    fn camera(&mut self, facing: FacingMode) -> Result<Box<dyn VideoSource>> {
        Err(LiveError::DeviceUnavailable(format!("no {facing:?} camera backend")))
    }

    #[cfg(feature = "capture")]
    fn screen(&mut self) -> Result<Box<dyn VideoSource>> {
        Ok(Box::new(crate::screen::ScreenSource::primary()?))
    }

    #[cfg(not(feature = "capture"))]
    fn screen(&mut self) -> Result<Box<dyn VideoSource>> {
        Err(LiveError::DeviceUnavailable("screen capture feature not enabled".into()))
    }
}
