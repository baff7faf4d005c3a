mod region;
mod summary;

use std::sync::Arc;

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use serde::{Deserialize, Serialize};

pub use region::LoopRegion;
pub use summary::PeakSummary;

/// Shared, immutable audio sample data.
///
/// `AudioArc` stores interleaved samples in an `Arc<[f32]>`, so cloning only
/// bumps a reference count. Both heads of a crossfading track, the output
/// voices they spawn and the peak extractor all read the same decoded buffer
/// without copying it.
///
/// # Memory Layout
///
/// ```text
/// AudioArc (24 bytes on stack)
/// ├─ samples: Arc<[f32]> (16 bytes) ────> Heap: [f32; N]
/// ├─ sample_rate: u32 (4 bytes)
/// └─ channels: u16 (2 bytes)
/// ```
///
/// # Examples
///
/// ```
/// use ambi_transport::AudioArc;
///
/// let audio = AudioArc::new(vec![0.0, 0.5, 1.0, 0.5], 44100, 2);
/// let shared = audio.clone();
/// assert_eq!(audio.frames(), 2);
/// assert_eq!(shared.frames(), 2);
/// ```
#[derive(Clone)]
pub struct AudioArc {
    /// Raw interleaved samples stored in a reference-counted slice.
    samples: Arc<[f32]>,
    /// Sample rate in Hz (e.g., 44100, 48000)
    sample_rate: u32,
    /// Number of interleaved channels (e.g., 1 for mono, 2 for stereo)
    channels: u16,
}

impl AudioArc {
    /// Create a new `AudioArc` from owned interleaved sample data.
    ///
    /// # Panics
    ///
    /// Panics if `channels` is 0 or if `samples.len()` is not divisible by `channels`.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self::from_arc(Arc::from(samples), sample_rate, channels)
    }

    /// Create an `AudioArc` from an existing `Arc<[f32]>` without reallocating.
    ///
    /// # Panics
    ///
    /// Panics if `channels` is 0 or if `samples.len()` is not divisible by `channels`.
    pub fn from_arc(samples: Arc<[f32]>, sample_rate: u32, channels: u16) -> Self {
        assert!(channels > 0, "channels must be greater than 0");
        assert_eq!(
            samples.len() % channels as usize,
            0,
            "samples.len() must be divisible by channels"
        );
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Interleaved samples, e.g. `[L, R, L, R, ...]` for stereo.
    #[inline]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn samples_arc(&self) -> &Arc<[f32]> {
        &self.samples
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of frames (samples per channel).
    #[inline]
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Total number of samples (frames * channels).
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Sample at `frame` for output channel `channel`, folding extra output
    /// channels onto the source (`channel % channels`). Out-of-range frames read
    /// as silence.
    #[inline]
    pub fn sample_at(&self, frame: usize, channel: usize) -> f32 {
        let channels = self.channels as usize;
        self.samples
            .get(frame * channels + channel % channels)
            .copied()
            .unwrap_or(0.0)
    }

    /// Iterate over one channel's samples.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is >= `self.channels()`.
    ///
    /// # Examples
    ///
    /// ```
    /// use ambi_transport::AudioArc;
    ///
    /// let audio = AudioArc::new(vec![0.0, 1.0, 0.5, 1.5], 44100, 2);
    /// let right: Vec<f32> = audio.channel(1).collect();
    /// assert_eq!(right, vec![1.0, 1.5]);
    /// ```
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = f32> + '_ {
        assert!(
            channel < self.channels as usize,
            "channel index out of bounds"
        );
        let channels = self.channels as usize;
        (0..self.frames()).map(move |frame| self.samples[frame * channels + channel])
    }

    /// De-interleave one channel into its own shared slice, or `None` if the
    /// channel does not exist.
    pub fn channel_data(&self, channel: usize) -> Option<Arc<[f32]>> {
        if channel >= self.channels as usize {
            return None;
        }
        Some(self.channel(channel).collect())
    }

    /// Resample this audio to a target sample rate.
    ///
    /// If the audio is already at the target rate this is a refcount bump.
    pub fn resample(&self, target_sample_rate: u32) -> anyhow::Result<Self> {
        if self.sample_rate == target_sample_rate {
            return Ok(self.clone());
        }

        resample_audio_arc(self, target_sample_rate)
    }
}

impl std::fmt::Debug for AudioArc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioArc")
            .field("frames", &self.frames())
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("duration_secs", &self.duration_secs())
            .finish()
    }
}

/// Opaque track identity. Either supplied by the caller or generated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TrackId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TrackId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a track realises its loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// One self-overlapping looped voice. Default and fallback.
    #[default]
    SingleBufferLoop,
    /// Two alternating heads scheduled against the audio clock.
    DualBufferCrossfade,
}

/// Clamp a gain to `[0, 1]`; NaN and infinities become 0.
pub fn clamp_gain(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Resample an `AudioArc` to a target sample rate with sinc interpolation.
///
/// # Examples
///
/// ```
/// use ambi_transport::{AudioArc, resample_audio_arc};
///
/// let audio = AudioArc::new(vec![0.0; 44100], 44100, 1);
/// let resampled = resample_audio_arc(&audio, 48000).unwrap();
/// assert_eq!(resampled.sample_rate(), 48000);
/// ```
pub fn resample_audio_arc(audio: &AudioArc, target_sample_rate: u32) -> anyhow::Result<AudioArc> {
    if audio.sample_rate == target_sample_rate {
        return Ok(audio.clone());
    }
    if audio.is_empty() {
        return Ok(AudioArc::new(Vec::new(), target_sample_rate, audio.channels));
    }

    let channels = audio.channels as usize;
    let input_frames = audio.frames();

    let resample_ratio = target_sample_rate as f64 / audio.sample_rate as f64;
    let output_frames = (input_frames as f64 * resample_ratio).ceil() as usize;

    // rubato wants one Vec per channel
    let mut input_channels = vec![Vec::with_capacity(input_frames); channels];
    for frame in audio.samples().chunks_exact(channels) {
        for (ch, sample) in frame.iter().enumerate() {
            input_channels[ch].push(*sample);
        }
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler =
        SincFixedIn::<f32>::new(resample_ratio, 2.0, params, input_frames, channels)?;

    let output_channels = resampler.process(&input_channels, None)?;

    let mut output_samples = Vec::with_capacity(output_frames * channels);
    for frame_idx in 0..output_channels[0].len() {
        for channel in &output_channels {
            output_samples.push(channel[frame_idx]);
        }
    }

    Ok(AudioArc::new(
        output_samples,
        target_sample_rate,
        audio.channels,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn generate_sine_wave(
        frequency: f32,
        sample_rate: u32,
        duration_secs: f32,
        channels: u16,
    ) -> AudioArc {
        let num_frames = (sample_rate as f32 * duration_secs) as usize;
        let mut samples = Vec::with_capacity(num_frames * channels as usize);

        for i in 0..num_frames {
            let t = i as f32 / sample_rate as f32;
            let sample = (2.0 * PI * frequency * t).sin();
            for _ in 0..channels {
                samples.push(sample);
            }
        }

        AudioArc::new(samples, sample_rate, channels)
    }

    #[test]
    fn test_audio_arc_new() {
        let audio = AudioArc::new(vec![0.0, 0.1, 0.2, 0.3], 44100, 2);

        assert_eq!(audio.sample_rate(), 44100);
        assert_eq!(audio.channels(), 2);
        assert_eq!(audio.frames(), 2);
        assert_eq!(audio.len(), 4);
        assert!(!audio.is_empty());
    }

    #[test]
    #[should_panic(expected = "channels must be greater than 0")]
    fn test_audio_arc_zero_channels() {
        AudioArc::new(vec![0.0], 44100, 0);
    }

    #[test]
    #[should_panic(expected = "samples.len() must be divisible by channels")]
    fn test_audio_arc_invalid_length() {
        AudioArc::new(vec![0.0, 0.1, 0.2, 0.3, 0.4], 44100, 2);
    }

    #[test]
    fn test_clone_shares_samples() {
        let audio = AudioArc::new(vec![0.0; 1000], 44100, 2);
        let head_b = audio.clone();

        assert_eq!(Arc::strong_count(audio.samples_arc()), 2);
        assert!(Arc::ptr_eq(audio.samples_arc(), head_b.samples_arc()));
    }

    #[test]
    fn test_sample_at_folds_channels_and_pads_silence() {
        let mono = AudioArc::new(vec![0.25, 0.5], 44100, 1);
        assert_eq!(mono.sample_at(1, 0), 0.5);
        assert_eq!(mono.sample_at(1, 1), 0.5);
        assert_eq!(mono.sample_at(2, 0), 0.0);

        let stereo = AudioArc::new(vec![0.1, 0.2, 0.3, 0.4], 44100, 2);
        assert_eq!(stereo.sample_at(1, 1), 0.4);
        assert_eq!(stereo.sample_at(1, 3), 0.4);
    }

    #[test]
    fn test_channel_data_deinterleaves() {
        let audio = AudioArc::new(vec![0.0, 1.0, 0.5, 1.5, 0.25, 1.25], 44100, 2);

        let left = audio.channel_data(0).unwrap();
        let right = audio.channel_data(1).unwrap();
        assert_eq!(&left[..], &[0.0, 0.5, 0.25]);
        assert_eq!(&right[..], &[1.0, 1.5, 1.25]);
        assert!(audio.channel_data(2).is_none());
    }

    #[test]
    fn test_duration() {
        let audio = AudioArc::new(vec![0.0; 44100 * 2], 44100, 2);
        assert!((audio.duration_secs() - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_resample_same_rate_is_cheap() {
        let audio = generate_sine_wave(440.0, 44100, 0.1, 2);
        let resampled = audio.resample(44100).unwrap();

        assert_eq!(resampled.len(), audio.len());
        assert!(Arc::ptr_eq(audio.samples_arc(), resampled.samples_arc()));
    }

    #[test]
    fn test_resample_upsampling_length() {
        let audio = generate_sine_wave(440.0, 44100, 0.1, 2);
        let resampled = audio.resample(48000).unwrap();

        assert_eq!(resampled.sample_rate(), 48000);
        assert_eq!(resampled.channels(), 2);

        let expected_frames = (audio.frames() as f64 * 48000.0 / 44100.0) as usize;
        let tolerance = (expected_frames as f64 * 0.03) as i64;
        let diff = (resampled.frames() as i64 - expected_frames as i64).abs();
        assert!(
            diff <= tolerance,
            "expected ~{} frames, got {}",
            expected_frames,
            resampled.frames()
        );
    }

    #[test]
    fn test_resample_empty() {
        let audio = AudioArc::new(Vec::new(), 22050, 2);
        let resampled = audio.resample(48000).unwrap();
        assert!(resampled.is_empty());
        assert_eq!(resampled.sample_rate(), 48000);
    }

    #[test]
    fn test_clamp_gain() {
        assert_eq!(clamp_gain(0.5), 0.5);
        assert_eq!(clamp_gain(-0.2), 0.0);
        assert_eq!(clamp_gain(3.0), 1.0);
        assert_eq!(clamp_gain(f32::NAN), 0.0);
        assert_eq!(clamp_gain(f32::INFINITY), 0.0);
        assert_eq!(clamp_gain(f32::NEG_INFINITY), 0.0);
    }

    #[test]
    fn test_track_id_display() {
        let id = TrackId::from("rain");
        assert_eq!(id.to_string(), "rain");
        assert_eq!(id.as_str(), "rain");
    }

    #[test]
    fn test_debug_format() {
        let audio = AudioArc::new(vec![0.0; 44100], 44100, 1);
        let debug_str = format!("{:?}", audio);

        assert!(debug_str.contains("AudioArc"));
        assert!(debug_str.contains("duration_secs"));
    }
}
