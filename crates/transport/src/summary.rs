/// Fixed-resolution min/max overview of a signal, used to draw waveforms.
///
/// Each `(min, max)` pair covers `samples_per_bin` consecutive frames of the
/// channel-averaged signal; the last pair also absorbs any remainder.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakSummary {
    peaks: Vec<(f32, f32)>,
    samples_per_bin: usize,
}

impl PeakSummary {
    pub fn new(peaks: Vec<(f32, f32)>, samples_per_bin: usize) -> Self {
        Self {
            peaks,
            samples_per_bin,
        }
    }

    pub fn peaks(&self) -> &[(f32, f32)] {
        &self.peaks
    }

    pub fn samples_per_bin(&self) -> usize {
        self.samples_per_bin
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn into_peaks(self) -> Vec<(f32, f32)> {
        self.peaks
    }
}
