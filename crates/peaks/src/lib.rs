//! Waveform overview extraction.
//!
//! A [`PeakSummary`] is computed by one shared chunked reduction
//! ([`PeakJob`]) that can run on the calling thread ([`CooperativeStrategy`])
//! or on a dedicated worker ([`WorkerStrategy`]). [`PeakExtractor`] falls
//! back from the worker to the calling thread when the worker fails.

mod cooperative;
mod reduce;
mod task;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ambi_transport::{AudioArc, PeakSummary};
use serde::{Deserialize, Serialize};

pub use cooperative::CooperativeStrategy;
pub use reduce::PeakJob;
pub use task::{PeakPoll, PeakTask};
pub use worker::WorkerStrategy;

/// Samples per chunk when the caller does not say otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 200_000;

/// Where the reduction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractMode {
    /// On a worker thread, falling back to the calling thread on failure.
    #[default]
    Parallel,
    /// On the calling thread, yielding between chunks.
    Cooperative,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("invalid peak input: {0}")]
    InvalidInput(&'static str),

    #[error("extraction cancelled")]
    Cancelled,

    #[error("peak worker failed: {0}")]
    Worker(String),

    #[error("peak worker unavailable: {0}")]
    WorkerUnavailable(String),
}

/// Channel data to summarise. Channels are shared, not copied, so a worker
/// can own its view of them outright.
#[derive(Debug, Clone)]
pub struct PeakInput {
    pub channel0: Option<Arc<[f32]>>,
    pub channel1: Option<Arc<[f32]>>,
    pub total_samples: usize,
    pub bins: usize,
}

impl PeakInput {
    /// Take the first two channels of `audio`.
    pub fn from_audio(audio: &AudioArc, bins: usize) -> Self {
        Self {
            channel0: audio.channel_data(0),
            channel1: audio.channel_data(1),
            total_samples: audio.frames(),
            bins,
        }
    }

    fn validate(&self) -> Result<(), ExtractionError> {
        if self.bins == 0 {
            return Err(ExtractionError::InvalidInput("bins must be at least 1"));
        }
        if self.total_samples == 0 {
            return Ok(());
        }
        let Some(left) = &self.channel0 else {
            return Err(ExtractionError::InvalidInput("no channel data"));
        };
        if left.len() < self.total_samples {
            return Err(ExtractionError::InvalidInput("channel 0 is shorter than total_samples"));
        }
        if let Some(right) = &self.channel1 {
            if right.len() < self.total_samples {
                return Err(ExtractionError::InvalidInput("channel 1 is shorter than total_samples"));
            }
        }
        Ok(())
    }
}

/// Shared cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub chunk_size: usize,
    pub cancel: CancelToken,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            cancel: CancelToken::new(),
        }
    }
}

/// One way of running a [`PeakJob`] to completion.
pub trait PeakStrategy {
    fn extract(
        &self,
        input: &PeakInput,
        options: &ExtractOptions,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<PeakSummary, ExtractionError>;
}

/// Try `primary`; on any failure other than cancellation, run `fallback`
/// with the same input.
pub struct FallbackStrategy<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackStrategy<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

impl<P: PeakStrategy, F: PeakStrategy> PeakStrategy for FallbackStrategy<P, F> {
    fn extract(
        &self,
        input: &PeakInput,
        options: &ExtractOptions,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<PeakSummary, ExtractionError> {
        match self.primary.extract(input, options, on_progress) {
            Ok(summary) => Ok(summary),
            Err(ExtractionError::Cancelled) => Err(ExtractionError::Cancelled),
            Err(err) => {
                log::warn!("peak extraction falling back: {err}");
                self.fallback.extract(input, options, on_progress)
            }
        }
    }
}

pub struct PeakExtractor {
    strategy: Box<dyn PeakStrategy + Send + Sync>,
    mode: ExtractMode,
}

impl PeakExtractor {
    pub fn new(mode: ExtractMode) -> Self {
        let strategy: Box<dyn PeakStrategy + Send + Sync> = match mode {
            ExtractMode::Parallel => Box::new(FallbackStrategy::new(
                WorkerStrategy::new(),
                CooperativeStrategy::new(),
            )),
            ExtractMode::Cooperative => Box::new(CooperativeStrategy::new()),
        };
        Self { strategy, mode }
    }

    pub fn mode(&self) -> ExtractMode {
        self.mode
    }

    pub fn extract(
        &self,
        input: &PeakInput,
        options: &ExtractOptions,
    ) -> Result<PeakSummary, ExtractionError> {
        self.strategy.extract(input, options, &mut |_| {})
    }

    pub fn extract_with_progress(
        &self,
        input: &PeakInput,
        options: &ExtractOptions,
        mut on_progress: impl FnMut(f32),
    ) -> Result<PeakSummary, ExtractionError> {
        self.strategy.extract(input, options, &mut on_progress)
    }

    /// Start a non-blocking extraction in this extractor's mode.
    pub fn spawn(&self, input: PeakInput, options: ExtractOptions) -> PeakTask {
        PeakTask::spawn(self.mode, input, options)
    }
}
