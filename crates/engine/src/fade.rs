//! Equal-power fade curves.
//!
//! A head fading out with [`fade_out`] while another fades in with [`fade_in`]
//! over the same window satisfies `in² + out² = 1`, so the overlap keeps
//! roughly constant perceived loudness.

use std::f32::consts::FRAC_PI_2;

/// Incoming gain at fade progress `t` in `[0, 1]`.
#[inline]
pub fn fade_in(t: f32) -> f32 {
    (t.clamp(0.0, 1.0) * FRAC_PI_2).sin()
}

/// Outgoing gain at fade progress `t` in `[0, 1]`.
#[inline]
pub fn fade_out(t: f32) -> f32 {
    (t.clamp(0.0, 1.0) * FRAC_PI_2).cos()
}

/// Gain of a voice `elapsed` frames into a `length`-frame span with the given
/// fade lengths. Outside the span the gain is 0.
pub fn envelope(elapsed: u64, length: u64, fade_in_frames: u64, fade_out_frames: u64) -> f32 {
    if elapsed >= length {
        return 0.0;
    }
    let mut gain = 1.0;
    if fade_in_frames > 0 && elapsed < fade_in_frames {
        gain *= fade_in(elapsed as f32 / fade_in_frames as f32);
    }
    let remaining = length - elapsed;
    if fade_out_frames > 0 && remaining <= fade_out_frames {
        gain *= fade_out(1.0 - remaining as f32 / fade_out_frames as f32);
    }
    gain
}
