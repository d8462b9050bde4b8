use std::collections::VecDeque;
use std::f32::consts::PI;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{AnalyzerConfig, Result, RhythmError};

/// Source of frequency magnitude snapshots for a live input stream.
///
/// Each call fills `bins` with the current spectrum on a byte scale, the
/// way a browser analyser node reports it. Implementations return
/// [`RhythmError::InputUnavailable`] when no stream is attached.
pub trait InputAnalyzer {
    fn fft_size(&self) -> usize;

    fn bin_count(&self) -> usize {
        self.fft_size() / 2
    }

    fn sample_magnitudes(&mut self, bins: &mut [u8]) -> Result<()>;
}

impl<A: InputAnalyzer + ?Sized> InputAnalyzer for Box<A> {
    fn fft_size(&self) -> usize {
        (**self).fft_size()
    }

    fn bin_count(&self) -> usize {
        (**self).bin_count()
    }

    fn sample_magnitudes(&mut self, bins: &mut [u8]) -> Result<()> {
        (**self).sample_magnitudes(bins)
    }
}

/// Windowed FFT over the most recent `fft_size` samples pushed into it.
pub struct SpectrumAnalyzer {
    config: AnalyzerConfig,
    history: VecDeque<f32>,
    smoothed: Vec<f32>,
    fft: FftResources,
}

impl SpectrumAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self> {
        let size = config.fft_size;
        if size < 2 || !size.is_power_of_two() {
            return Err(RhythmError::invalid("fft_size", size));
        }

        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(size);
        let fft = FftResources {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        };

        Ok(Self {
            history: VecDeque::with_capacity(size),
            smoothed: vec![0.0; config.bin_count()],
            config,
            fft,
        })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Appends PCM samples, keeping only the latest transform window.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let size = self.fft.size;
        let skip = samples.len().saturating_sub(size);
        self.history.extend(&samples[skip..]);
        while self.history.len() > size {
            self.history.pop_front();
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.smoothed.iter_mut().for_each(|value| *value = 0.0);
    }

    fn analyse(&mut self, bins: &mut [u8]) -> Result<()> {
        let size = self.fft.size;
        // Silence stands in for samples that have not arrived yet.
        let missing = size - self.history.len();
        for (index, slot) in self.fft.input.iter_mut().enumerate() {
            let sample = if index < missing {
                0.0
            } else {
                self.history[index - missing]
            };
            *slot = sample * hann_value(index, size);
        }

        let fft = &mut self.fft;
        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let tau = self.config.smoothing;
        let range = self.config.max_db - self.config.min_db;
        for (index, bin) in bins.iter_mut().take(self.smoothed.len()).enumerate() {
            let magnitude = fft.spectrum[index].norm() / size as f32;
            let smoothed = tau * self.smoothed[index] + (1.0 - tau) * magnitude;
            self.smoothed[index] = smoothed;

            let db = 20.0 * smoothed.log10();
            let scaled = 255.0 * (db - self.config.min_db) / range;
            *bin = if scaled.is_nan() {
                0
            } else {
                scaled.clamp(0.0, 255.0) as u8
            };
        }
        Ok(())
    }
}

impl InputAnalyzer for SpectrumAnalyzer {
    fn fft_size(&self) -> usize {
        self.fft.size
    }

    fn sample_magnitudes(&mut self, bins: &mut [u8]) -> Result<()> {
        self.analyse(bins)
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("config", &self.config)
            .field("buffered", &self.history.len())
            .field("fft", &self.fft)
            .finish()
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

struct LiveShared {
    analyzer: SpectrumAnalyzer,
    connected: bool,
}

/// Shared, thread-safe view over a [`SpectrumAnalyzer`]. A capture callback
/// pushes samples through one clone while the engine samples through another.
#[derive(Clone)]
pub struct LiveInput {
    shared: Arc<Mutex<LiveShared>>,
    fft_size: usize,
}

impl LiveInput {
    pub fn new(config: AnalyzerConfig) -> Result<Self> {
        let analyzer = SpectrumAnalyzer::new(config)?;
        let fft_size = analyzer.fft_size();
        Ok(Self {
            shared: Arc::new(Mutex::new(LiveShared {
                analyzer,
                connected: true,
            })),
            fft_size,
        })
    }

    /// Feeds a block of floating point samples from the capture side.
    pub fn push_samples(&self, samples: &[f32]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut shared = self.lock()?;
        if !shared.connected {
            return Err(RhythmError::InputUnavailable("input stream disconnected"));
        }
        shared.analyzer.push_samples(samples);
        Ok(())
    }

    /// Marks the stream as gone, e.g. when the device disappears or access is
    /// revoked. Subsequent samples report [`RhythmError::InputUnavailable`].
    pub fn disconnect(&self) -> Result<()> {
        let mut shared = self.lock()?;
        shared.connected = false;
        shared.analyzer.reset();
        Ok(())
    }

    pub fn is_connected(&self) -> Result<bool> {
        Ok(self.lock()?.connected)
    }

    fn lock(&self) -> Result<MutexGuard<'_, LiveShared>> {
        self.shared
            .lock()
            .map_err(|_| RhythmError::msg("live input has been poisoned"))
    }
}

impl InputAnalyzer for LiveInput {
    fn fft_size(&self) -> usize {
        self.fft_size
    }

    fn sample_magnitudes(&mut self, bins: &mut [u8]) -> Result<()> {
        let mut shared = self.lock()?;
        if !shared.connected {
            return Err(RhythmError::InputUnavailable("input stream disconnected"));
        }
        shared.analyzer.sample_magnitudes(bins)
    }
}

impl fmt::Debug for LiveInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveInput")
            .field("fft_size", &self.fft_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn silence_maps_to_zero_bins() {
        let mut analyzer = SpectrumAnalyzer::new(AnalyzerConfig::default()).unwrap();
        analyzer.push_samples(&[0.0; 512]);
        let mut bins = vec![7u8; analyzer.bin_count()];
        analyzer.sample_magnitudes(&mut bins).unwrap();
        assert!(bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn loud_tone_peaks_in_its_bin() {
        let config = AnalyzerConfig::default();
        let mut analyzer = SpectrumAnalyzer::new(config).unwrap();
        // Bin 16 of a 256 point transform at 48 kHz sits at 3 kHz.
        analyzer.push_samples(&sine(3_000.0, 48_000.0, 256, 1.0));
        let mut bins = vec![0u8; analyzer.bin_count()];
        analyzer.sample_magnitudes(&mut bins).unwrap();

        let peak = bins
            .iter()
            .enumerate()
            .max_by_key(|(_, value)| **value)
            .map(|(index, _)| index)
            .unwrap();
        assert_eq!(peak, 16);
        assert!(bins[16] > 150);
        assert!(bins[60] < bins[16]);
    }

    #[test]
    fn keeps_only_latest_window() {
        let mut analyzer = SpectrumAnalyzer::new(AnalyzerConfig::default()).unwrap();
        analyzer.push_samples(&sine(3_000.0, 48_000.0, 1024, 1.0));
        analyzer.push_samples(&[0.0; 256]);
        let mut bins = vec![0u8; analyzer.bin_count()];
        analyzer.sample_magnitudes(&mut bins).unwrap();
        assert!(bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_non_power_of_two_sizes() {
        let config = AnalyzerConfig {
            fft_size: 300,
            ..AnalyzerConfig::default()
        };
        assert!(SpectrumAnalyzer::new(config).is_err());
    }

    #[test]
    fn disconnected_live_input_is_unavailable() {
        let input = LiveInput::new(AnalyzerConfig::default()).unwrap();
        let mut reader = input.clone();
        input.push_samples(&[0.5; 128]).unwrap();

        let mut bins = vec![0u8; reader.bin_count()];
        reader.sample_magnitudes(&mut bins).unwrap();

        input.disconnect().unwrap();
        assert!(!input.is_connected().unwrap());
        let err = reader.sample_magnitudes(&mut bins).unwrap_err();
        assert!(matches!(err, RhythmError::InputUnavailable(_)));
        assert!(input.push_samples(&[0.5; 8]).is_err());
    }
}
