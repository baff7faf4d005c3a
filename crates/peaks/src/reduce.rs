use ambi_transport::PeakSummary;

use crate::{CancelToken, ExtractionError, PeakInput};

/// The min/max reduction, advanced one chunk at a time.
///
/// Every execution strategy drives this same type, so their results are
/// identical by construction.
pub struct PeakJob {
    input: PeakInput,
    step: usize,
    chunk_size: usize,
    processed: usize,
    peaks: Vec<(f32, f32)>,
}

impl PeakJob {
    pub fn new(input: PeakInput, chunk_size: usize) -> Result<Self, ExtractionError> {
        input.validate()?;

        let total = input.total_samples;
        let step = (total / input.bins).max(1);
        let bins = if total == 0 {
            0
        } else {
            input.bins.min(total.div_ceil(step))
        };

        Ok(Self {
            input,
            step,
            chunk_size: chunk_size.max(1),
            processed: 0,
            peaks: vec![(1.0, -1.0); bins],
        })
    }

    pub fn is_done(&self) -> bool {
        self.processed >= self.input.total_samples
    }

    pub fn progress(&self) -> f32 {
        if self.input.total_samples == 0 {
            return 1.0;
        }
        self.processed as f32 / self.input.total_samples as f32
    }

    /// Reduce the next chunk and return the progress reached.
    pub fn step(&mut self) -> f32 {
        let total = self.input.total_samples;
        let end = (self.processed + self.chunk_size).min(total);
        let last_bin = self.peaks.len().saturating_sub(1);

        if let Some(left) = self.input.channel0.as_deref() {
            let right = self.input.channel1.as_deref();
            for j in self.processed..end {
                let a = left[j];
                let b = right.map_or(a, |r| r[j]);
                let v = (a + b) * 0.5;

                let bin = &mut self.peaks[(j / self.step).min(last_bin)];
                if v < bin.0 {
                    bin.0 = v;
                }
                if v > bin.1 {
                    bin.1 = v;
                }
            }
        }

        self.processed = end;
        self.progress()
    }

    pub fn finish(self) -> PeakSummary {
        PeakSummary::new(self.peaks, self.step)
    }
}

/// Run `job` to the end, calling `on_chunk` with the progress after each
/// chunk. Cancellation is checked before every chunk.
pub(crate) fn run_to_end(
    mut job: PeakJob,
    cancel: &CancelToken,
    mut on_chunk: impl FnMut(f32),
) -> Result<PeakSummary, ExtractionError> {
    while !job.is_done() {
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }
        on_chunk(job.step());
    }
    Ok(job.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn mono(samples: &[f32], bins: usize) -> PeakInput {
        PeakInput {
            channel0: Some(Arc::from(samples)),
            channel1: None,
            total_samples: samples.len(),
            bins,
        }
    }

    fn run(mut job: PeakJob) -> PeakSummary {
        while !job.is_done() {
            job.step();
        }
        job.finish()
    }

    #[test]
    fn test_known_sequence() {
        let input = mono(&[0.1, -0.1, 0.5, -0.5, 0.9, -0.9, 0.0, 0.0], 4);
        let summary = run(PeakJob::new(input, 3).unwrap());

        assert_eq!(
            summary.peaks(),
            &[(-0.1, 0.1), (-0.5, 0.5), (-0.9, 0.9), (0.0, 0.0)]
        );
        assert_eq!(summary.samples_per_bin(), 2);
    }

    #[test]
    fn test_stereo_is_averaged() {
        let input = PeakInput {
            channel0: Some(Arc::from(&[1.0, 0.0][..])),
            channel1: Some(Arc::from(&[0.0, -1.0][..])),
            total_samples: 2,
            bins: 1,
        };
        let summary = run(PeakJob::new(input, 16).unwrap());

        assert_eq!(summary.peaks(), &[(-0.5, 0.5)]);
    }

    #[test]
    fn test_remainder_folds_into_last_bin() {
        // 10 samples / 4 bins: step 2, the last bin takes samples 6..10
        let samples = [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.1, 0.2, 0.3, -0.4];
        let summary = run(PeakJob::new(mono(&samples, 4), 100).unwrap());

        assert_eq!(summary.len(), 4);
        assert_eq!(summary.peaks()[3], (-0.4, 0.3));
    }

    #[test]
    fn test_more_bins_than_samples() {
        let summary = run(PeakJob::new(mono(&[0.5, -0.5, 0.25], 16), 100).unwrap());

        assert_eq!(summary.peaks(), &[(0.5, 0.5), (-0.5, -0.5), (0.25, 0.25)]);
    }

    #[test]
    fn test_progress_per_chunk() {
        let mut job = PeakJob::new(mono(&[0.0; 10], 2), 4).unwrap();

        assert_eq!(job.step(), 0.4);
        assert_eq!(job.step(), 0.8);
        assert_eq!(job.step(), 1.0);
        assert!(job.is_done());
    }

    #[test]
    fn test_empty_input() {
        let job = PeakJob::new(mono(&[], 8), 4).unwrap();

        assert!(job.is_done());
        assert_eq!(job.progress(), 1.0);
        assert!(job.finish().is_empty());
    }
}
