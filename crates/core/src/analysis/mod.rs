use serde::Serialize;

use crate::{DetectorConfig, InputAnalyzer};

/// Result of one detector sample, taken once per rendering tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DetectorReading {
    pub time: f64,
    /// Summed byte magnitude over the capped bin range.
    pub power: f64,
    pub onset: bool,
    /// False when no input is attached or the read failed.
    pub available: bool,
}

/// Energy threshold onset detector with a refractory window.
///
/// The refractory window is a fraction of the current beat length, so one
/// physical hit that rings across several analyser frames only counts once.
#[derive(Debug, Clone)]
pub struct OnsetDetector {
    config: DetectorConfig,
    beat_spacing: f64,
    last_onset: Option<f64>,
    bins: Vec<u8>,
    latest: DetectorReading,
}

impl OnsetDetector {
    pub fn new(config: DetectorConfig, seconds_per_beat: f64) -> Self {
        let beat_spacing = config.temporal_sensitivity * seconds_per_beat;
        Self {
            config,
            beat_spacing,
            last_onset: None,
            bins: Vec::new(),
            latest: DetectorReading::default(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn beat_spacing(&self) -> f64 {
        self.beat_spacing
    }

    pub fn set_seconds_per_beat(&mut self, seconds_per_beat: f64) {
        self.beat_spacing = self.config.temporal_sensitivity * seconds_per_beat;
    }

    pub fn last_onset(&self) -> Option<f64> {
        self.last_onset
    }

    pub fn latest(&self) -> DetectorReading {
        self.latest
    }

    /// Forgets the previous onset so the next hit is accepted immediately.
    pub fn reset(&mut self) {
        self.last_onset = None;
    }

    /// Reads one spectrum snapshot and runs it through [`Self::observe`]. A
    /// missing input or a failed read counts as zero power.
    pub fn sample<A>(&mut self, now: f64, input: Option<&mut A>) -> DetectorReading
    where
        A: InputAnalyzer + ?Sized,
    {
        let (power, available) = match input {
            Some(input) => {
                let fft_size = input.fft_size();
                self.bins.resize(input.bin_count(), 0);
                match input.sample_magnitudes(&mut self.bins) {
                    Ok(()) => (
                        band_power(&self.bins, fft_size, self.config.reference_bins),
                        true,
                    ),
                    Err(err) => {
                        if self.latest.available {
                            tracing::warn!(%err, "input sample failed, treating as silence");
                        }
                        (0.0, false)
                    }
                }
            }
            None => (0.0, false),
        };

        let onset = self.observe(now, power);
        self.latest = DetectorReading {
            time: now,
            power,
            onset,
            available,
        };
        self.latest
    }

    /// Accepts an onset when `power` exceeds the sensitivity and the previous
    /// accepted onset lies more than one refractory window in the past.
    pub fn observe(&mut self, now: f64, power: f64) -> bool {
        if power <= self.config.sensitivity {
            return false;
        }
        let clear = self
            .last_onset
            .map(|last| now > last + self.beat_spacing)
            .unwrap_or(true);
        if clear {
            self.last_onset = Some(now);
            tracing::trace!(now, power, "onset");
        }
        clear
    }
}

/// Sums the magnitude bins. Above `reference_bins` the range shrinks in
/// proportion to the transform size so large transforms do not inflate power.
pub fn band_power(bins: &[u8], fft_size: usize, reference_bins: usize) -> f64 {
    let mut limit = bins.len();
    if limit > reference_bins && fft_size > 0 {
        limit = (limit * 2 * reference_bins / fft_size).min(bins.len());
    }
    bins[..limit].iter().map(|&b| b as f64).sum()
}
