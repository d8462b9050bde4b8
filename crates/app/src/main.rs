use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use rhythm_engine_core::{
    Clock, EngineConfig, EventQueue, LiveInput, ManualClock, RecordingState, RhythmEngine,
    SystemClock,
};
use tracing_subscriber::EnvFilter;

const SAMPLE_RATE: f64 = 48_000.0;
const HIT_LENGTH: f64 = 0.030;

fn main() -> rhythm_engine_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Metronome {
            config,
            tempo,
            beats,
            poly,
            seconds,
        } => run_metronome(config.as_deref(), tempo, beats, poly, seconds),
        Commands::Practice {
            config,
            tempo,
            beats,
            bars,
            jitter_ms,
            seed,
        } => run_practice(config.as_deref(), tempo, beats, bars, jitter_ms, seed),
    }
}

fn load_config(path: Option<&Path>) -> rhythm_engine_core::Result<EngineConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            EngineConfig::load(path)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn apply_timing<C: Clock>(
    engine: &mut RhythmEngine<C, EventQueue>,
    tempo: Option<f64>,
    beats: Option<u32>,
) {
    if let Some(beats) = beats {
        engine.set_signature(beats);
    }
    if let Some(tempo) = tempo {
        engine.set_tempo(tempo);
    }
}

fn run_metronome(
    config: Option<&Path>,
    tempo: Option<f64>,
    beats: Option<u32>,
    poly: Option<u32>,
    seconds: f64,
) -> rhythm_engine_core::Result<()> {
    let config = load_config(config)?;
    let eval_period = config.scheduler.eval_period;
    let render_period = config.scheduler.render_period;
    let mut engine = RhythmEngine::new(SystemClock::start(), EventQueue::new(), config)?;

    apply_timing(&mut engine, tempo, beats);
    if let Some(poly) = poly {
        engine.set_polyrhythm(true);
        engine.set_poly_beats(poly);
    }

    let snapshot = engine.snapshot();
    tracing::info!(
        period = snapshot.primary.note_period,
        beats = snapshot.primary.beats_per_bar,
        poly = snapshot.secondary.map(|s| s.beats_per_bar),
        seconds,
        "starting metronome"
    );

    engine.start();
    // The two ticks keep separate deadlines; the loop sleeps until whichever
    // comes first.
    let mut next_schedule = engine.now();
    let mut next_render = next_schedule;
    loop {
        let now = engine.now();
        if now >= seconds {
            break;
        }
        if now >= next_schedule {
            engine.scheduler_tick();
            next_schedule += eval_period;
            if next_schedule <= now {
                next_schedule = now + eval_period;
            }
        }
        if now >= next_render {
            let frame = engine.render_tick();
            for played in engine.sink_mut().drain_due(now) {
                tracing::info!(
                    sound = %played.sound,
                    at = format_args!("{:.3}", played.at),
                    late_ms = format_args!("{:.1}", (now - played.at) * 1_000.0),
                    pendulum = format_args!("{:+.2}", frame.pendulum),
                    "click"
                );
            }
            next_render += render_period;
            if next_render <= now {
                next_render = now + render_period;
            }
        }
        let wait = next_schedule.min(next_render) - engine.now();
        if wait > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(wait));
        }
    }

    engine.stop();
    tracing::info!(scheduled = engine.sink().scheduled_count(), "metronome stopped");
    Ok(())
}

fn run_practice(
    config: Option<&Path>,
    tempo: Option<f64>,
    beats: Option<u32>,
    bars: Option<u32>,
    jitter_ms: f64,
    seed: u64,
) -> rhythm_engine_core::Result<()> {
    let config = load_config(config)?;
    let render_period = config.scheduler.render_period;
    let latency = config.recorder.input_latency;
    let input = LiveInput::new(config.analyzer.clone())?;
    let clock = ManualClock::new(0.0);
    let mut engine =
        RhythmEngine::new(clock.clone(), EventQueue::new(), config)?.with_input(input.clone());

    apply_timing(&mut engine, tempo, beats);
    if let Some(bars) = bars {
        engine.set_bars(bars);
    }

    if !engine.start_recording() {
        return Err("could not start the practice take".into());
    }

    // The simulated performer plays every scored beat with some timing error;
    // the analyser hears each hit after the input latency.
    let mut rng = SimpleRng::new(seed);
    let hits: Vec<f64> = engine
        .recording_window()
        .map(|window| window.scheduled.clone())
        .unwrap_or_default()
        .into_iter()
        .map(|beat| beat + (rng.next_f64() * 2.0 - 1.0) * jitter_ms / 1_000.0 + latency)
        .collect();
    tracing::info!(hits = hits.len(), jitter_ms, "simulating practice take");

    let mut frame_index: u64 = 0;
    let mut previous = 0.0;
    loop {
        frame_index += 1;
        let now = frame_index as f64 * render_period;
        clock.set(now);
        input.push_samples(&synthesize(previous, now, &hits, &mut rng))?;
        previous = now;

        let frame = engine.render_tick();
        for played in engine.sink_mut().drain_due(now) {
            tracing::debug!(sound = %played.sound, at = played.at, "click");
        }
        if frame.logged_onset {
            tracing::debug!(at = now, power = frame.detector.power, "onset logged");
        }
        if frame.recording == RecordingState::Idle {
            break;
        }
    }

    let report = engine
        .accuracy_report()
        .ok_or("practice take produced no window")?;
    tracing::info!(
        hits = report.hits,
        missed = report.missed,
        extra = report.extra,
        mean_abs_ms = report.mean_abs_offset.map(|o| o * 1_000.0),
        "practice take scored"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Renders the PCM between two render ticks: short noise bursts where a hit
/// lands, silence elsewhere.
fn synthesize(from: f64, to: f64, hits: &[f64], rng: &mut SimpleRng) -> Vec<f32> {
    let first = (from * SAMPLE_RATE).round() as u64;
    let last = (to * SAMPLE_RATE).round() as u64;
    (first..last)
        .map(|index| {
            let t = index as f64 / SAMPLE_RATE;
            let sounding = hits.iter().any(|&hit| t >= hit && t < hit + HIT_LENGTH);
            if sounding {
                (rng.next_f64() * 2.0 - 1.0) as f32 * 0.6
            } else {
                0.0
            }
        })
        .collect()
}

// xorshift64, good enough for timing jitter and noise bursts.
struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    fn next_f64(&mut self) -> f64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Lookahead metronome, polyrhythms and rhythm practice", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the metronome in real time and log every click as it fires.
    Metronome {
        /// JSON engine configuration.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Beats per minute.
        #[arg(short, long)]
        tempo: Option<f64>,
        /// Beats per bar.
        #[arg(short, long)]
        beats: Option<u32>,
        /// Enable a polyrhythm with this many secondary beats per bar.
        #[arg(short, long)]
        poly: Option<u32>,
        /// How long to run, in seconds.
        #[arg(short, long, default_value_t = 8.0)]
        seconds: f64,
    },
    /// Score a simulated practice take against the count-in schedule.
    Practice {
        /// JSON engine configuration.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Beats per minute.
        #[arg(short, long)]
        tempo: Option<f64>,
        /// Beats per bar.
        #[arg(short = 'B', long)]
        beats: Option<u32>,
        /// Scored bars after the count-in.
        #[arg(short, long)]
        bars: Option<u32>,
        /// Maximum timing error of the simulated performer.
        #[arg(long, default_value_t = 25.0)]
        jitter_ms: f64,
        /// Seed for the simulated performer.
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
}
