use ambi_transport::PeakSummary;

use crate::reduce::{PeakJob, run_to_end};
use crate::{ExtractOptions, ExtractionError, PeakInput, PeakStrategy};

/// Runs the reduction on the calling thread, yielding after every chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct CooperativeStrategy;

impl CooperativeStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl PeakStrategy for CooperativeStrategy {
    fn extract(
        &self,
        input: &PeakInput,
        options: &ExtractOptions,
        on_progress: &mut dyn FnMut(f32),
    ) -> Result<PeakSummary, ExtractionError> {
        let job = PeakJob::new(input.clone(), options.chunk_size)?;
        run_to_end(job, &options.cancel, |progress| {
            on_progress(progress);
            std::thread::yield_now();
        })
    }
}
