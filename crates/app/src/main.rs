mod config;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ambi_core::{BackendMode, Engine, EngineConfig, EngineEvent, ExtractMode, TrackSource};
use ambi_engine::DeviceOutput;
use ambi_peaks::{ExtractOptions, PeakExtractor, PeakInput};
use ambi_render::{OfflineOutput, write_wav};
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use config::Config;

/// Interval between engine polls while playing live.
const POLL_INTERVAL: Duration = Duration::from_millis(16);
/// Offline render step; also the poll interval on the rendered clock.
const RENDER_STEP: f64 = 0.01;

#[derive(Parser, Debug)]
#[command(name = "ambi", version, about = "Seamless multi-track ambient loop player")]
struct Cli {
    /// Config file to read instead of the default location
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Loop backend for every track
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendArg>,

    /// Loop crossfade in seconds
    #[arg(long, global = true)]
    crossfade: Option<f64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Loop files on the default output device
    Play {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Stop after this many seconds instead of playing forever
        #[arg(long)]
        seconds: Option<f64>,

        /// Master volume, 0.0 to 1.0
        #[arg(long, default_value_t = 1.0)]
        volume: f32,

        /// Loop start in seconds, for every track
        #[arg(long)]
        loop_start: Option<f64>,

        /// Loop end in seconds, for every track
        #[arg(long)]
        loop_end: Option<f64>,
    },
    /// Bounce the loop set to a WAV file
    Render {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short, long, value_name = "FILE")]
        out: PathBuf,

        #[arg(long, default_value_t = 30.0)]
        seconds: f64,

        #[arg(long)]
        sample_rate: Option<u32>,
    },
    /// Print the waveform summary of a file
    Peaks {
        file: PathBuf,

        #[arg(long)]
        bins: Option<usize>,

        /// Extract on this thread instead of a worker
        #[arg(long)]
        cooperative: bool,
    },
    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Single,
    Dual,
}

impl From<BackendArg> for BackendMode {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Single => BackendMode::SingleBufferLoop,
            BackendArg::Dual => BackendMode::DualBufferCrossfade,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref());
    apply_overrides(&mut config.engine, &cli);

    match cli.command {
        Command::Play {
            files,
            seconds,
            volume,
            loop_start,
            loop_end,
        } => {
            let region = (loop_start.is_some() || loop_end.is_some())
                .then(|| (loop_start.unwrap_or(0.0), loop_end));
            play(config.engine, &files, seconds, volume, region)
        }
        Command::Render {
            files,
            out,
            seconds,
            sample_rate,
        } => {
            let sample_rate = sample_rate.unwrap_or(config.render.sample_rate);
            render(config.engine, &files, &out, seconds, sample_rate, config.render.channels)
        }
        Command::Peaks {
            file,
            bins,
            cooperative,
        } => {
            let mode = if cooperative {
                ExtractMode::Cooperative
            } else {
                config.engine.peaks.mode
            };
            peaks(&file, bins.unwrap_or(config.engine.peaks.bins), mode, config.engine.peaks.chunk_size)
        }
        Command::InitConfig { force } => init_config(cli.config.as_deref(), force),
    }
}

fn apply_overrides(engine: &mut EngineConfig, cli: &Cli) {
    if let Some(backend) = cli.backend {
        engine.backend = backend.into();
    }
    if let Some(crossfade) = cli.crossfade {
        engine.crossfade = crossfade;
    }
}

fn play(
    config: EngineConfig,
    files: &[PathBuf],
    seconds: Option<f64>,
    volume: f32,
    region: Option<(f64, Option<f64>)>,
) -> anyhow::Result<()> {
    let output = DeviceOutput::open(config.max_voices)?;
    let mut engine = Engine::new(output, config)?;
    engine.set_master_volume(volume);

    let sources = files.iter().map(|f| (TrackSource::File(f.clone()), None));
    engine.load_tracks(sources)?;
    engine.play_all(true);

    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));
    loop {
        for event in engine.poll() {
            if let (EngineEvent::TrackReady { id }, Some((start, end))) = (&event, region) {
                if let Err(err) = engine.set_loop_region(id, start, end) {
                    log::warn!("track {id}: {err}");
                }
            }
            report(&event);
        }

        if engine.tracks().next().is_none() {
            anyhow::bail!("no track could be loaded");
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    engine.stop_all();
    // let the release ramps play out
    std::thread::sleep(Duration::from_millis(50));
    Ok(())
}

fn render(
    config: EngineConfig,
    files: &[PathBuf],
    out: &Path,
    seconds: f64,
    sample_rate: u32,
    channels: u16,
) -> anyhow::Result<()> {
    let output = OfflineOutput::with_max_voices(sample_rate, channels, config.max_voices);
    let mut engine = Engine::new(output, config)?;

    for file in files {
        engine
            .load_track(TrackSource::File(file.clone()), None)
            .with_context(|| format!("loading {}", file.display()))?;
    }
    engine.play_all(true);

    let steps = (seconds.max(0.0) / RENDER_STEP).round() as usize;
    for _ in 0..steps {
        engine.output_mut().advance(RENDER_STEP);
        for event in engine.poll() {
            report(&event);
        }
    }
    engine.stop_all();
    engine.poll();
    engine.output_mut().advance(RENDER_STEP);

    let audio = engine.output().to_audio();
    write_wav(&audio, out)?;
    log::info!(
        "rendered {:.2}s of {} track(s) to {}",
        audio.duration_secs(),
        files.len(),
        out.display()
    );
    Ok(())
}

fn peaks(file: &Path, bins: usize, mode: ExtractMode, chunk_size: usize) -> anyhow::Result<()> {
    let audio = ambi_decode::decode_file(file)?;
    let input = PeakInput::from_audio(&audio, bins);
    let options = ExtractOptions {
        chunk_size,
        ..Default::default()
    };

    let started = Instant::now();
    let summary = PeakExtractor::new(mode).extract_with_progress(&input, &options, |p| {
        log::debug!("peaks {:.0}%", p * 100.0)
    })?;
    log::info!(
        "{} bins of {} samples in {:?}",
        summary.len(),
        summary.samples_per_bin(),
        started.elapsed()
    );

    for (min, max) in summary.peaks() {
        println!("{min:.4}\t{max:.4}");
    }
    Ok(())
}

fn init_config(path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::default_path().context("no config directory on this platform")?,
    };
    if path.exists() && !force {
        anyhow::bail!("{} exists, pass --force to overwrite", path.display());
    }
    Config::default().save(&path)?;
    println!("{}", path.display());
    Ok(())
}

fn report(event: &EngineEvent) {
    match event {
        EngineEvent::LoadFailed { id, error } => log::error!("track {id}: {error}"),
        EngineEvent::PlaybackFailed { id, error } => log::error!("track {id}: {error}"),
        EngineEvent::PeaksFailed { id, error } => log::warn!("track {id}: peaks: {error}"),
        EngineEvent::PeaksProgress { .. } => {}
        other => log::debug!("{other:?}"),
    }
}
