#![forbid(unsafe_code)]

//! Adaptive media playback engine.
//!
//! Given a media URL, a presentation element and a transport, the
//! [`orchestrator::StreamOrchestrator`] fetches and refreshes the manifest,
//! opens the presentation source, provisions per-track sinks, spawns one
//! [`buffer::AdaptationBuffer`] per (period, track), and merges buffering,
//! adaptive-bitrate decisions, timing, speed, stalls and content protection
//! into a single stream of [`aulos_events::StreamEvent`] values.
//!
//! The presentation element, the transport and the CDM are seams: the host
//! implements [`element::MediaElement`], [`pipeline::Transport`] and
//! `aulos_drm::Cdm` over its platform. [`mock`] provides scripted
//! implementations of all three for tests.

pub mod buffer;
pub mod element;
pub mod errors;
pub mod ledger;
pub mod manifest;
pub mod mock;
pub mod options;
pub mod orchestrator;
pub mod pipeline;
pub mod surface;
pub mod text;
pub mod timing;

pub use aulos_events::{ErrorCode, ErrorKind, ErrorReport, EventBus, StreamEvent, TimeRange, TrackType};
pub use errors::{PlayerError, PlayerResult};
pub use options::{PlayerOptions, StartAt};
pub use orchestrator::{PlayerHandle, StreamOrchestrator};
