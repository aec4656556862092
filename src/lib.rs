//! # conf-media
//!
//! Media-session lifecycle and audio-mixing core for realtime conferencing
//! clients.
//!
//! `conf-media` turns a capture source into an encoded outgoing stream,
//! turns inbound streams into rendered audio, and combines simultaneous
//! contributions into per-listener mix-minus-self output with live level
//! metering. Device discovery, transport framing, and codec implementations
//! are collaborators plugged in at trait seams ([`MediaDevice`],
//! [`InboundSource`], [`Stage`]).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conf_media::{
//!     level_listener, MediaDirection, MediaSession, MixerDevice, SessionConfig,
//! };
//! use std::sync::Arc;
//!
//! // One session per stream; the device comes from your enumeration layer.
//! let session = MediaSession::new(device, SessionConfig::default());
//! session.start(MediaDirection::SendRecv);
//!
//! // Encoded media for the transport, inbound streams for rendering.
//! let outgoing = session.output().await;
//! session.add_stream(inbound_stream);
//!
//! // Conference mixing: sessions created from one MixerDevice share the
//! // capture and hear everyone but themselves.
//! let mixer = MixerDevice::new(device)?;
//! let a = mixer.create_session()?;
//! a.set_local_level_listener(Some(level_listener(|level| {
//!     // drive the mic meter
//! })));
//! let mix_for_a = a.read_local_output();
//! ```
//!
//! ## Architecture
//!
//! - **Pipeline worker**: each pipeline runs on its own Tokio task; state
//!   transitions are delivered as callbacks on that task, never
//!   synchronously on the caller.
//! - **Pull output**: a lock-free ring buffer decouples the worker from the
//!   transport's pull pace.
//! - **Mix-minus-self**: every mixer output excludes exactly one
//!   contributor, so participants never hear their own capture.
//! - **Copy-on-write listeners**: level notification at ~50/s snapshots an
//!   immutable listener list and never holds a structural lock.

// Audio code requires intentional numeric casts between sample widths
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

mod chunk;
pub mod device;
mod direction;
mod error;
mod event;
pub mod format;
mod level;
mod mixer;
mod pipeline;
mod playback;
mod session;
mod ssrc;

pub use chunk::AudioChunk;
pub use device::{
    CaptureHandle, CaptureSource, DeviceRegistry, InboundSource, MediaDevice, MockCapture,
    MockDevice, MockInbound, MockRenderer, Renderer,
};
pub use direction::MediaDirection;
pub use error::MediaError;
pub use event::{
    level_listener, session_event_callback, LevelListener, SessionEvent, SessionEventCallback,
    SsrcChangeCallback,
};
pub use format::{AudioFormat, MediaFormat, MediaKind, VideoFormat};
pub use level::{measure_level, LevelCache, LevelDispatcher, MAX_AUDIO_LEVEL, MIN_AUDIO_LEVEL};
pub use mixer::{
    AudioMixer, MixContributor, MixerDevice, MixerSession, RawBufferObserver, SharedCapture,
};
pub use pipeline::{
    ContentType, Pipeline, PipelineConfig, PipelineEvent, PipelineEventCallback, PipelineOutput,
    PipelineState, SharedOutput, Stage, StageFactory,
};
pub use playback::{PlaybackListener, PlaybackRegistry};
pub use session::{MediaSession, SessionConfig};
pub use ssrc::SsrcRegistry;
