//! Reachy Bridge - Voice bridge between a Reachy Mini robot and an AI gateway
//!
//! This library provides:
//! - Microphone capture with silence segmentation and wake word gating
//! - Pluggable speech-to-text and text-to-speech backends
//! - A persistent, reconnecting gateway session
//! - Robot actions with synchronized speech and motion
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  ConversationLoop                   │
//! │   listen → transcribe → send → await → respond      │
//! └───────┬──────────────┬──────────────┬───────────────┘
//!         │              │              │
//! ┌───────▼──────┐ ┌─────▼────────┐ ┌───▼───────────────┐
//! │ AudioCapture │ │GatewaySession│ │ ActionExecutor    │
//! │ Transcriber  │ │  (WebSocket) │ │ Speaker / Robot   │
//! └──────────────┘ └──────────────┘ └───────────────────┘
//! ```

pub mod config;
pub mod conversation;
pub mod demo;
pub mod error;
pub mod gateway;
pub mod robot;
pub mod voice;

pub use config::Config;
pub use conversation::{ConversationLoop, LoopOptions, LoopState, Turn, TurnStatus};
pub use error::{Error, Result};
