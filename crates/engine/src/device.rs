use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use basedrop::{Collector, Handle, Shared};
use cpal::{
    FromSample, SizedSample,
    traits::{DeviceTrait, HostTrait, StreamTrait},
};

use crate::{
    AudioClock, AudioOutput, BusId, MAX_BUSES, MixerCommand, MixerStatus, OutputError,
    PlaybackRequest, Voice, VoiceId, VoiceMixer,
};

const COMMAND_CAPACITY: usize = 1024;
const STATUS_CAPACITY: usize = 1024;

/// The default output device, mixed on the cpal callback thread.
///
/// The clock counts frames the callback has rendered, so `now()` stands
/// still while the stream is not pulling audio.
pub struct DeviceOutput {
    // declared first so the callback (and the voices it owns) go before the collector
    _stream: cpal::Stream,
    commands: rtrb::Producer<MixerCommand>,
    status: rtrb::Consumer<MixerStatus>,
    frames: Arc<AtomicU64>,
    sample_rate: u32,
    channels: usize,
    max_voices: usize,
    live: HashSet<VoiceId>,
    next_voice: u64,
    collector: Collector,
    handle: Handle,
}

impl DeviceOutput {
    pub fn open(max_voices: usize) -> anyhow::Result<Self> {
        let collector = Collector::new();
        let handle = collector.handle();

        let (command_tx, command_rx) = rtrb::RingBuffer::<MixerCommand>::new(COMMAND_CAPACITY);
        let (status_tx, status_rx) = rtrb::RingBuffer::<MixerStatus>::new(STATUS_CAPACITY);
        let frames = Arc::new(AtomicU64::new(0));

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("no output device found"))?;

        let config = device.default_output_config()?;
        let stream_config: cpal::StreamConfig = config.clone().into();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        let mixer = VoiceMixer::new(sample_rate, channels, max_voices);

        let stream = match config.sample_format() {
            cpal::SampleFormat::F32 => build_stream::<f32>(
                &device,
                &stream_config,
                mixer,
                command_rx,
                status_tx,
                frames.clone(),
            )?,
            cpal::SampleFormat::I16 => build_stream::<i16>(
                &device,
                &stream_config,
                mixer,
                command_rx,
                status_tx,
                frames.clone(),
            )?,
            sample_format => anyhow::bail!("unsupported sample format '{sample_format}'"),
        };

        stream.play()?;

        log::info!(
            "opened output device '{}' at {} Hz, {} channels",
            device.name().unwrap_or_else(|_| "unknown".into()),
            sample_rate,
            channels
        );

        Ok(Self {
            _stream: stream,
            commands: command_tx,
            status: status_rx,
            frames,
            sample_rate,
            channels,
            max_voices,
            live: HashSet::new(),
            next_voice: 0,
            collector,
            handle,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Voices scheduled and not yet reported finished.
    pub fn live_voices(&self) -> usize {
        self.live.len()
    }

    fn send(&mut self, command: MixerCommand) -> Result<(), OutputError> {
        self.commands
            .push(command)
            .map_err(|_| OutputError::QueueFull)
    }
}

impl AudioClock for DeviceOutput {
    fn now(&self) -> f64 {
        self.frames.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }
}

impl AudioOutput for DeviceOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn schedule(&mut self, request: PlaybackRequest) -> Result<VoiceId, OutputError> {
        request.validate()?;
        if self.live.len() >= self.max_voices {
            return Err(OutputError::VoiceLimit(self.max_voices));
        }

        let id = VoiceId(self.next_voice);
        self.next_voice += 1;

        let audio = Shared::new(&self.handle, request.audio.clone());
        let voice = Voice::new(id, &request, self.sample_rate, audio);
        self.send(MixerCommand::Start(voice))?;
        self.live.insert(id);
        Ok(id)
    }

    fn cancel(&mut self, voice: VoiceId) {
        if !self.live.contains(&voice) {
            return;
        }
        if self.send(MixerCommand::Stop(voice)).is_err() {
            log::warn!("command queue full, voice {} not cancelled", voice.0);
        }
    }

    fn set_bus_gain(&mut self, bus: BusId, gain: f32) {
        if bus.0 as usize >= MAX_BUSES {
            log::warn!("bus {} out of range, gain dropped", bus.0);
            return;
        }
        if self.send(MixerCommand::BusGain(bus, gain)).is_err() {
            log::warn!("command queue full, bus {} gain dropped", bus.0);
        }
    }

    fn set_master_gain(&mut self, gain: f32) {
        if self.send(MixerCommand::MasterGain(gain)).is_err() {
            log::warn!("command queue full, master gain dropped");
        }
    }

    fn maintain(&mut self) {
        while let Ok(status) = self.status.pop() {
            match status {
                MixerStatus::Finished(id) => {
                    self.live.remove(&id);
                }
                MixerStatus::Rejected(id) => {
                    self.live.remove(&id);
                    log::warn!("mixer rejected voice {}: voice pool full", id.0);
                }
            }
        }
        self.collector.collect();
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mixer: VoiceMixer,
    mut command_rx: rtrb::Consumer<MixerCommand>,
    mut status_tx: rtrb::Producer<MixerStatus>,
    frames: Arc<AtomicU64>,
) -> anyhow::Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut scratch: Vec<f32> = Vec::with_capacity(8192);

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            while let Ok(command) = command_rx.pop() {
                if let Some(status) = mixer.handle(command) {
                    let _ = status_tx.push(status);
                }
            }

            scratch.resize(data.len(), 0.0);
            mixer.render(&mut scratch, |status| {
                let _ = status_tx.push(status);
            });

            for (out, sample) in data.iter_mut().zip(scratch.iter()) {
                *out = T::from_sample(*sample);
            }

            frames.store(mixer.frame(), Ordering::Release);
        },
        |err| log::error!("stream error: {err}"),
        None,
    )?;

    Ok(stream)
}
