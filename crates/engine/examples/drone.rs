//! Loop a synthesised chord on the default device for a few seconds.

use std::time::Duration;

use ambi_engine::{AudioClock, AudioOutput, BusId, DeviceOutput, Playback, PlaybackRequest};
use ambi_transport::{AudioArc, LoopRegion};

fn main() -> anyhow::Result<()> {
    let rate = 48000;
    let samples = (0..rate * 2)
        .map(|i| {
            let t = i as f32 / rate as f32;
            [110.0, 165.0, 220.0]
                .iter()
                .map(|f| (t * f * std::f32::consts::TAU).sin() * 0.15)
                .sum::<f32>()
        })
        .collect();
    let mut output = DeviceOutput::open(16)?;
    let audio = AudioArc::new(samples, rate as u32, 1).resample(output.sample_rate())?;
    let region = LoopRegion::full(audio.duration_secs()).ok_or_else(|| anyhow::anyhow!("empty"))?;
    output.schedule(PlaybackRequest {
        audio,
        bus: BusId(0),
        at: output.now() + 0.05,
        offset: 0.0,
        playback: Playback::Looped {
            region,
            overlap: 0.25,
            fade_in: 0.5,
        },
    })?;

    for _ in 0..300 {
        output.maintain();
        std::thread::sleep(Duration::from_millis(16));
    }
    println!("played {:.2}s", output.now());
    Ok(())
}
