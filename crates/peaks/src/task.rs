use std::sync::mpsc::TryRecvError;

use ambi_transport::PeakSummary;

use crate::reduce::PeakJob;
use crate::worker::{PeakWorker, WorkerMessage};
use crate::{ExtractMode, ExtractOptions, ExtractionError, PeakInput};

#[derive(Debug, Clone, PartialEq)]
pub enum PeakPoll {
    /// Nothing new since the last poll.
    Pending,
    Progress(f32),
    Done(PeakSummary),
    Failed(ExtractionError),
}

enum TaskState {
    Worker(PeakWorker),
    Cooperative(PeakJob),
    Failed(ExtractionError),
    Finished,
}

/// An extraction the owner advances by polling, for hosts that must not block.
///
/// A worker task only drains messages when polled. A cooperative task (or a
/// worker task that fell back) reduces one chunk per poll. Once `Done` or
/// `Failed` has been returned the task reports `Pending` forever. Reported
/// progress never goes backwards, even when a fallback starts over.
pub struct PeakTask {
    state: TaskState,
    input: PeakInput,
    options: ExtractOptions,
    reported: f32,
}

impl PeakTask {
    pub fn spawn(mode: ExtractMode, input: PeakInput, options: ExtractOptions) -> Self {
        let state = match mode {
            ExtractMode::Parallel => match PeakWorker::spawn(input.clone(), &options) {
                Ok(worker) => TaskState::Worker(worker),
                Err(err @ ExtractionError::InvalidInput(_)) => TaskState::Failed(err),
                Err(err) => {
                    log::warn!("peak worker unavailable, extracting cooperatively: {err}");
                    cooperative(&input, &options)
                }
            },
            ExtractMode::Cooperative => cooperative(&input, &options),
        };

        Self {
            state,
            input,
            options,
            reported: 0.0,
        }
    }

    pub fn cancel(&self) {
        self.options.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TaskState::Finished)
    }

    pub fn poll(&mut self) -> PeakPoll {
        match std::mem::replace(&mut self.state, TaskState::Finished) {
            TaskState::Worker(worker) => self.poll_worker(worker),
            TaskState::Cooperative(mut job) => {
                if self.options.cancel.is_cancelled() {
                    return PeakPoll::Failed(ExtractionError::Cancelled);
                }
                let progress = job.step();
                if job.is_done() {
                    PeakPoll::Done(job.finish())
                } else {
                    self.state = TaskState::Cooperative(job);
                    self.report(Some(progress))
                }
            }
            TaskState::Failed(err) => PeakPoll::Failed(err),
            TaskState::Finished => PeakPoll::Pending,
        }
    }

    fn poll_worker(&mut self, worker: PeakWorker) -> PeakPoll {
        let mut latest = None;
        loop {
            match worker.messages.try_recv() {
                Ok(WorkerMessage::Progress(progress)) => latest = Some(progress),
                Ok(WorkerMessage::Done(summary)) => return PeakPoll::Done(summary),
                Ok(WorkerMessage::Failed(ExtractionError::Cancelled)) => {
                    return PeakPoll::Failed(ExtractionError::Cancelled);
                }
                Ok(WorkerMessage::Failed(err)) => {
                    self.fall_back(err);
                    return self.report(latest);
                }
                Err(TryRecvError::Empty) => {
                    self.state = TaskState::Worker(worker);
                    return self.report(latest);
                }
                Err(TryRecvError::Disconnected) => {
                    self.fall_back(ExtractionError::Worker(
                        "worker exited without a result".into(),
                    ));
                    return self.report(latest);
                }
            }
        }
    }

    fn report(&mut self, progress: Option<f32>) -> PeakPoll {
        match progress {
            Some(p) if p > self.reported => {
                self.reported = p;
                PeakPoll::Progress(p)
            }
            _ => PeakPoll::Pending,
        }
    }

    fn fall_back(&mut self, err: ExtractionError) {
        log::warn!("peak worker failed, extracting cooperatively: {err}");
        self.state = cooperative(&self.input, &self.options);
    }
}

impl Drop for PeakTask {
    fn drop(&mut self) {
        if !self.is_finished() {
            self.cancel();
        }
    }
}

fn cooperative(input: &PeakInput, options: &ExtractOptions) -> TaskState {
    match PeakJob::new(input.clone(), options.chunk_size) {
        Ok(job) => TaskState::Cooperative(job),
        Err(err) => TaskState::Failed(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn ramp_input(len: usize, bins: usize) -> PeakInput {
        PeakInput {
            channel0: Some((0..len).map(|i| i as f32 / len as f32).collect()),
            channel1: None,
            total_samples: len,
            bins,
        }
    }

    fn options(chunk_size: usize) -> ExtractOptions {
        ExtractOptions {
            chunk_size,
            ..Default::default()
        }
    }

    fn poll_until_settled(task: &mut PeakTask) -> (Vec<f32>, PeakPoll) {
        let mut progress = Vec::new();
        for _ in 0..10_000 {
            match task.poll() {
                PeakPoll::Pending => std::thread::sleep(Duration::from_millis(1)),
                PeakPoll::Progress(p) => progress.push(p),
                settled => return (progress, settled),
            }
        }
        panic!("peak task never settled");
    }

    #[test]
    fn test_cooperative_task_one_chunk_per_poll() {
        let mut task = PeakTask::spawn(ExtractMode::Cooperative, ramp_input(100, 10), options(25));

        assert_eq!(task.poll(), PeakPoll::Progress(0.25));
        assert_eq!(task.poll(), PeakPoll::Progress(0.5));
        assert_eq!(task.poll(), PeakPoll::Progress(0.75));
        assert!(matches!(task.poll(), PeakPoll::Done(summary) if summary.len() == 10));
        assert_eq!(task.poll(), PeakPoll::Pending);
        assert!(task.is_finished());
    }

    #[test]
    fn test_worker_task_matches_cooperative() {
        let mut worker = PeakTask::spawn(ExtractMode::Parallel, ramp_input(5000, 64), options(512));
        let mut local = PeakTask::spawn(ExtractMode::Cooperative, ramp_input(5000, 64), options(512));

        let (_, from_worker) = poll_until_settled(&mut worker);
        let (_, from_local) = poll_until_settled(&mut local);

        assert!(matches!(from_worker, PeakPoll::Done(_)));
        assert_eq!(from_worker, from_local);
    }

    #[test]
    fn test_cancelled_task() {
        let mut task = PeakTask::spawn(ExtractMode::Cooperative, ramp_input(100, 10), options(10));
        task.poll();
        task.cancel();

        assert_eq!(task.poll(), PeakPoll::Failed(ExtractionError::Cancelled));
    }

    #[test]
    fn test_fallback_progress_never_goes_backwards() {
        let (tx, rx) = std::sync::mpsc::channel();
        tx.send(WorkerMessage::Progress(0.5)).unwrap();
        tx.send(WorkerMessage::Failed(ExtractionError::Worker("lost".into())))
            .unwrap();
        let mut task = PeakTask {
            state: TaskState::Worker(PeakWorker::from_messages(rx)),
            input: ramp_input(100, 10),
            options: options(25),
            reported: 0.0,
        };

        assert_eq!(task.poll(), PeakPoll::Progress(0.5));
        // the cooperative restart covers 0.25 and 0.5 again silently
        assert_eq!(task.poll(), PeakPoll::Pending);
        assert_eq!(task.poll(), PeakPoll::Pending);
        assert_eq!(task.poll(), PeakPoll::Progress(0.75));
        assert!(matches!(task.poll(), PeakPoll::Done(summary) if summary.len() == 10));
    }

    #[test]
    fn test_invalid_input_fails_without_fallback() {
        let input = PeakInput {
            channel0: Some(Arc::from(&[0.0; 4][..])),
            channel1: None,
            total_samples: 8,
            bins: 2,
        };
        let mut task = PeakTask::spawn(ExtractMode::Parallel, input, options(4));

        assert!(matches!(task.poll(), PeakPoll::Failed(ExtractionError::InvalidInput(_))));
    }
}
