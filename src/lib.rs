//! IntelliSolve live session engine
//!
//! A client for the Gemini Live `BidiGenerateContent` API that streams
//! microphone audio and sampled video frames to the model, receives audio,
//! text and tool calls back, and answers those tool calls.

#![forbid(unsafe_code)]

/// PulseAudio microphone backend (enabled with the "pulse" feature)
#[cfg(feature = "pulse")]
pub mod audio;
pub mod controller;
pub mod events;
/// Wire protocol, configuration and errors
pub mod gemini;
pub mod gemini_client;
pub mod media_in;
/// Screen capture source (enabled with the "capture" feature)
#[cfg(feature = "capture")]
pub mod screen;
pub mod tools;

#[cfg(test)]
mod testing;

pub use controller::{ControllerState, SessionController};
pub use events::{EventKind, InboundEvent, OutboundChunk};
pub use gemini::{LiveConfig, LiveError, Result};
pub use gemini_client::{LiveClient, Session, SessionState};
pub use tools::{handler_fn, Schema, ToolDeclaration, ToolHandler, ToolRegistry};
