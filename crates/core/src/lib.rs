//! Multi-track ambient loop player.
//!
//! An [`Engine`] owns a set of tracks, each looping a region of its audio
//! seamlessly through a [`PlaybackBackend`]. Everything is measured against
//! the output's [`AudioClock`](ambi_engine::AudioClock) and driven by
//! [`Engine::poll`] on the owning thread.

pub mod backend;
mod config;
mod crossfade;
mod engine;
mod error;
mod events;
mod loader;
mod timers;
mod track;

pub use backend::{
    BackendContext, DualBufferCrossfade, PlaybackBackend, SingleBufferLoop, StartFrom,
    TimerTarget, create_backend,
};
pub use config::{EngineConfig, PeaksConfig, SchedulingConfig};
pub use crossfade::{CrossfadePlan, CrossfadeScheduler, Head, SchedulerState};
pub use engine::{CrossfadeTarget, Engine};
pub use error::{EngineError, LoadError, ScheduleError};
pub use events::EngineEvent;
pub use timers::{TimerId, TimerQueue};
pub use track::{Track, TrackSource, TrackState};

pub use ambi_engine::{AudioClock, AudioOutput};
pub use ambi_peaks::ExtractMode;
pub use ambi_transport::{AudioArc, BackendMode, LoopRegion, PeakSummary, TrackId};
