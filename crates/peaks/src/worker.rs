use std::sync::mpsc::{self, Receiver};

use ambi_transport::PeakSummary;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::reduce::{PeakJob, run_to_end};
use crate::{ExtractOptions, ExtractionError, PeakInput, PeakStrategy};

pub(crate) enum WorkerMessage {
    Progress(f32),
    Done(PeakSummary),
    Failed(ExtractionError),
}

/// A single-thread pool running one job. Dropping it terminates the thread
/// once the job returns.
pub(crate) struct PeakWorker {
    _pool: ThreadPool,
    pub(crate) messages: Receiver<WorkerMessage>,
}

impl PeakWorker {
    pub(crate) fn spawn(input: PeakInput, options: &ExtractOptions) -> Result<Self, ExtractionError> {
        let job = PeakJob::new(input, options.chunk_size)?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(1)
            .thread_name(|i| format!("ambi-peaks-{i}"))
            .panic_handler(|_| log::error!("peak worker panicked"))
            .build()
            .map_err(|e| ExtractionError::WorkerUnavailable(e.to_string()))?;

        let (tx, rx) = mpsc::channel();
        let cancel = options.cancel.clone();

        pool.spawn(move || {
            let result = run_to_end(job, &cancel, |progress| {
                let _ = tx.send(WorkerMessage::Progress(progress));
            });
            let _ = tx.send(match result {
                Ok(summary) => WorkerMessage::Done(summary),
                Err(err) => WorkerMessage::Failed(err),
            });
        });

        Ok(Self {
            _pool: pool,
            messages: rx,
        })
    }

    /// A worker whose messages are fed by the caller.
    #[cfg(test)]
    pub(crate) fn from_messages(messages: Receiver<WorkerMessage>) -> Self {
        let pool = ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .expect("thread pool");
        Self {
            _pool: pool,
            messages,
        }
    }
}

/// Runs the reduction on a dedicated worker thread; the caller blocks on its
/// messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStrategy;

impl WorkerStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl PeakStrategy for WorkerStrategy {
    fn extract(
        &self,
        input: &PeakInput,
        options: &ExtractOptions,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<PeakSummary, ExtractionError> {
        let worker = PeakWorker::spawn(input.clone(), options)?;

        loop {
            match worker.messages.recv() {
                Ok(WorkerMessage::Progress(progress)) => on_progress(progress),
                Ok(WorkerMessage::Done(summary)) => return Ok(summary),
                Ok(WorkerMessage::Failed(err)) => return Err(err),
                Err(_) => {
                    return Err(ExtractionError::Worker(
                        "worker exited without a result".into(),
                    ));
                }
            }
        }
    }
}
