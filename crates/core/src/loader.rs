//! Background track loading.
//!
//! Decoding and resampling run on one named thread; the engine picks up
//! results from `poll`, so every state change stays on the owner's thread.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};

use ambi_transport::{AudioArc, TrackId};

use crate::error::LoadError;
use crate::track::TrackSource;

pub(crate) struct LoadRequest {
    pub(crate) id: TrackId,
    pub(crate) generation: u64,
    pub(crate) source: TrackSource,
}

pub(crate) struct LoadOutcome {
    pub(crate) id: TrackId,
    pub(crate) generation: u64,
    pub(crate) result: Result<AudioArc, LoadError>,
}

pub(crate) struct Loader {
    request_tx: Sender<LoadRequest>,
    result_rx: Receiver<LoadOutcome>,
    _handle: JoinHandle<()>,
}

impl Loader {
    pub(crate) fn spawn(sample_rate: u32) -> Result<Self, LoadError> {
        let (request_tx, request_rx) = mpsc::channel::<LoadRequest>();
        let (result_tx, result_rx) = mpsc::channel::<LoadOutcome>();

        let handle = thread::Builder::new()
            .name("ambi-loader".to_string())
            .spawn(move || loader_thread(request_rx, result_tx, sample_rate))
            .map_err(|err| {
                log::error!("failed to spawn loader thread: {err}");
                LoadError::LoaderUnavailable
            })?;

        Ok(Self {
            request_tx,
            result_rx,
            _handle: handle,
        })
    }

    /// Queue a load. Returns the request back if the thread has gone away.
    pub(crate) fn request(&self, request: LoadRequest) -> Result<(), LoadRequest> {
        self.request_tx.send(request).map_err(|e| e.0)
    }

    /// Next finished load, if any. Fails once the thread has exited and
    /// every result it sent has been taken.
    pub(crate) fn try_recv(&self) -> Result<Option<LoadOutcome>, LoadError> {
        match self.result_rx.try_recv() {
            Ok(outcome) => Ok(Some(outcome)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                log::error!("loader thread exited");
                Err(LoadError::LoaderUnavailable)
            }
        }
    }

    /// A loader whose thread takes one request and then panics.
    #[cfg(test)]
    pub(crate) fn crashing() -> Self {
        let (request_tx, request_rx) = mpsc::channel::<LoadRequest>();
        let (result_tx, result_rx) = mpsc::channel::<LoadOutcome>();
        let handle = thread::spawn(move || {
            let _results = result_tx;
            if request_rx.recv().is_ok() {
                panic!("decoder blew up");
            }
        });
        Self {
            request_tx,
            result_rx,
            _handle: handle,
        }
    }
}

fn loader_thread(requests: Receiver<LoadRequest>, results: Sender<LoadOutcome>, sample_rate: u32) {
    log::debug!("loader thread started");

    // ends when the engine drops its sender
    while let Ok(request) = requests.recv() {
        log::debug!("loading track {}", request.id);
        let result = prepare(request.source, sample_rate);
        let outcome = LoadOutcome {
            id: request.id,
            generation: request.generation,
            result,
        };
        if results.send(outcome).is_err() {
            break;
        }
    }

    log::debug!("loader thread stopped");
}

/// Decode `source` and bring it to the output sample rate.
pub(crate) fn prepare(source: TrackSource, sample_rate: u32) -> Result<AudioArc, LoadError> {
    let audio = match source {
        TrackSource::File(path) => ambi_decode::decode_file(&path)?,
        TrackSource::Bytes { data, extension } => {
            ambi_decode::decode_bytes(data, extension.as_deref())?
        }
        TrackSource::Decoded(audio) => audio,
    };

    if audio.is_empty() {
        return Err(LoadError::Empty);
    }

    audio
        .resample(sample_rate)
        .map_err(|e| LoadError::Resample(format!("{e:#}")))
}
