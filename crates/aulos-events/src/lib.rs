#![forbid(unsafe_code)]

//! Playback event taxonomy and broadcast bus.
//!
//! Every subsystem of the engine publishes into a cloned [`EventBus`]; the
//! host application subscribes once and observes the whole playback
//! lifecycle as a single ordered stream of [`StreamEvent`] values.

mod bus;
mod error;
mod event;
mod types;

pub use bus::EventBus;
pub use error::{ErrorCode, ErrorKind, ErrorReport};
pub use event::StreamEvent;
pub use types::{TimeRange, TrackType};
