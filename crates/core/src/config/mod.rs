use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::timeline::secondary_slots;
use crate::{Result, RhythmError};

/// Top-level configuration structure for the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub analyzer: AnalyzerConfig,
    pub detector: DetectorConfig,
    pub recorder: RecorderConfig,
}

impl EngineConfig {
    /// Parses a JSON document. Missing sections and fields fall back to the
    /// defaults, then the result is validated.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.analyzer.validate()?;
        self.detector.validate()?;
        self.recorder.validate()
    }
}

/// Metronome and polyrhythm timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Beats per minute shared by the metronome and the practice recorder.
    pub tempo: f64,
    pub beats_per_bar: u32,
    /// Beats the secondary track plays across one primary bar.
    pub poly_beats: u32,
    /// Cadence of the scheduler tick, which is also the lookahead horizon.
    pub eval_period: f64,
    /// Cadence of the rendering tick that drives onset sampling.
    pub render_period: f64,
    pub max_tempo: f64,
    pub max_beats_per_bar: u32,
    /// Upper bound on the secondary track's slot count.
    pub max_poly_beats: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tempo: 120.0,
            beats_per_bar: 4,
            poly_beats: 6,
            eval_period: 0.100,
            render_period: 1.0 / 60.0,
            max_tempo: 250.0,
            max_beats_per_bar: 32,
            max_poly_beats: 32,
        }
    }
}

impl SchedulerConfig {
    pub fn poly_ratio(&self) -> f64 {
        self.poly_beats as f64 / self.beats_per_bar.max(1) as f64
    }

    /// Checks a tempo against the configured range.
    pub fn check_tempo(&self, bpm: f64) -> Result<f64> {
        if bpm.is_finite() && bpm > 0.0 && bpm <= self.max_tempo {
            Ok(bpm)
        } else {
            Err(RhythmError::invalid("tempo", bpm))
        }
    }

    pub fn check_signature(&self, beats_per_bar: u32) -> Result<u32> {
        if beats_per_bar > 0 && beats_per_bar <= self.max_beats_per_bar {
            Ok(beats_per_bar)
        } else {
            Err(RhythmError::invalid("beats_per_bar", beats_per_bar))
        }
    }

    /// Checks a secondary ratio against a primary bar of `primary_beats`. The
    /// resulting slot count must stay within `max_poly_beats`.
    pub fn check_poly_ratio(&self, primary_beats: u32, ratio: f64) -> Result<f64> {
        let fits = ratio.is_finite()
            && ratio > 0.0
            && secondary_slots(primary_beats, ratio) <= self.max_poly_beats as usize;
        if fits {
            Ok(ratio)
        } else {
            Err(RhythmError::invalid("poly_ratio", ratio))
        }
    }

    fn validate(&self) -> Result<()> {
        if !(self.max_tempo.is_finite() && self.max_tempo > 0.0) {
            return Err(RhythmError::invalid("max_tempo", self.max_tempo));
        }
        self.check_tempo(self.tempo)?;
        self.check_signature(self.beats_per_bar)?;
        if self.poly_beats == 0 || self.poly_beats > self.max_poly_beats {
            return Err(RhythmError::invalid("poly_beats", self.poly_beats));
        }
        positive("eval_period", self.eval_period)?;
        positive("render_period", self.render_period)
    }
}

/// Input analyser settings. These mirror a browser style analyser node: a
/// fixed transform size, no smoothing and a fixed decibel window that maps
/// magnitudes onto a byte scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub fft_size: usize,
    pub smoothing: f32,
    pub min_db: f32,
    pub max_db: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            smoothing: 0.0,
            min_db: -50.0,
            max_db: 0.0,
        }
    }
}

impl AnalyzerConfig {
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    fn validate(&self) -> Result<()> {
        if self.fft_size < 32 || !self.fft_size.is_power_of_two() {
            return Err(RhythmError::invalid("fft_size", self.fft_size));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(RhythmError::invalid("smoothing", self.smoothing));
        }
        if !(self.min_db.is_finite() && self.max_db.is_finite() && self.min_db < self.max_db) {
            return Err(RhythmError::invalid(
                "decibel range",
                format!("{}..{}", self.min_db, self.max_db),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Summed byte magnitude that must be exceeded to count as an onset.
    pub sensitivity: f64,
    /// Refractory window as a fraction of one beat.
    pub temporal_sensitivity: f64,
    /// Bin count above which the summed range is proportionally capped.
    pub reference_bins: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sensitivity: 200.0,
            temporal_sensitivity: 1.0 / 3.0,
            reference_bins: 1024,
        }
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<()> {
        if !(self.sensitivity.is_finite() && self.sensitivity >= 0.0) {
            return Err(RhythmError::invalid("sensitivity", self.sensitivity));
        }
        if !(self.temporal_sensitivity.is_finite() && self.temporal_sensitivity >= 0.0) {
            return Err(RhythmError::invalid(
                "temporal_sensitivity",
                self.temporal_sensitivity,
            ));
        }
        if self.reference_bins == 0 {
            return Err(RhythmError::invalid("reference_bins", self.reference_bins));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Scored bars; one extra count-in bar is always played first.
    pub bars: u32,
    /// Delay between a physical hit and its appearance in the analyser.
    pub input_latency: f64,
    pub max_bars: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            bars: 4,
            input_latency: 0.100,
            max_bars: 64,
        }
    }
}

impl RecorderConfig {
    pub fn check_bars(&self, bars: u32) -> Result<u32> {
        if bars > 0 && bars <= self.max_bars {
            Ok(bars)
        } else {
            Err(RhythmError::invalid("bars", bars))
        }
    }

    fn validate(&self) -> Result<()> {
        self.check_bars(self.bars)?;
        if !(self.input_latency.is_finite() && self.input_latency >= 0.0) {
            return Err(RhythmError::invalid("input_latency", self.input_latency));
        }
        Ok(())
    }
}

fn positive(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(RhythmError::invalid(name, value))
    }
}
