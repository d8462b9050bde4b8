use serde::{Deserialize, Serialize};

use crate::sink::{Sink, SinkHandle, SoundId, Voice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    Idle,
    Recording,
}

/// Scheduled reference and detected onsets for one practice take.
///
/// `scheduled` holds only the scored beats; the count-in bar that precedes
/// them is played but never scored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingWindow {
    pub start_time: f64,
    pub stop_time: f64,
    pub note_period: f64,
    pub beats_per_bar: u32,
    pub scheduled: Vec<f64>,
    pub detected: Vec<f64>,
}

impl RecordingWindow {
    /// Lays out `(bars + 1) * beats_per_bar` clicks from `start_time` and
    /// returns the window together with the clicks to arm on the sink.
    pub fn layout(
        start_time: f64,
        tempo: f64,
        bars: u32,
        beats_per_bar: u32,
    ) -> (Self, Vec<(f64, SoundId)>) {
        let note_period = 60.0 / tempo;
        let total = (bars as usize + 1) * beats_per_bar as usize;
        let mut clicks = Vec::with_capacity(total);
        let mut scheduled = Vec::with_capacity(total.saturating_sub(beats_per_bar as usize));

        for index in 0..total {
            let time = start_time + index as f64 * note_period;
            if index >= beats_per_bar as usize {
                scheduled.push(time);
            }
            let sound = if index % beats_per_bar as usize == 0 {
                SoundId::accented(Voice::Tick)
            } else {
                SoundId::plain(Voice::Tick)
            };
            clicks.push((time, sound));
        }

        let stop_time = scheduled.last().map(|last| last + note_period).unwrap_or(start_time);
        let window = Self {
            start_time,
            stop_time,
            note_period,
            beats_per_bar,
            scheduled,
            detected: Vec::new(),
        };
        (window, clicks)
    }

    /// True while `now` lies in `[first scored beat, stop_time)`.
    pub fn accepts(&self, now: f64) -> bool {
        match self.scheduled.first() {
            Some(&first) => now >= first && now < self.stop_time,
            None => false,
        }
    }

    pub fn is_bar_start(&self, index: usize) -> bool {
        self.beats_per_bar > 0 && index % self.beats_per_bar as usize == 0
    }

    /// Fraction of the displayed timeline elapsed at `now`. The timeline starts
    /// one period before the first scored beat and ends at `stop_time`.
    pub fn progress(&self, now: f64) -> f64 {
        let Some(&first) = self.scheduled.first() else {
            return 0.0;
        };
        let begin = first - self.note_period;
        let span = self.stop_time - begin;
        if span <= 0.0 {
            return 0.0;
        }
        ((now - begin) / span).clamp(0.0, 1.0)
    }

    /// Pairs every scored beat with the closest unused onset no further than
    /// half a period away, after removing the input latency from each onset.
    pub fn report(&self, input_latency: f64) -> AccuracyReport {
        let tolerance = self.note_period * 0.5;
        let mut used = vec![false; self.detected.len()];
        let mut beats = Vec::with_capacity(self.scheduled.len());

        for &scheduled in &self.scheduled {
            let best = self
                .detected
                .iter()
                .enumerate()
                .filter(|(index, _)| !used[*index])
                .map(|(index, &time)| (index, time, time - input_latency - scheduled))
                .filter(|(_, _, offset)| offset.abs() <= tolerance)
                .min_by(|a, b| a.2.abs().total_cmp(&b.2.abs()));

            beats.push(match best {
                Some((index, detected, offset)) => {
                    used[index] = true;
                    BeatAccuracy {
                        scheduled,
                        detected: Some(detected),
                        offset: Some(offset),
                    }
                }
                None => BeatAccuracy {
                    scheduled,
                    detected: None,
                    offset: None,
                },
            });
        }

        let offsets: Vec<f64> = beats.iter().filter_map(|beat| beat.offset).collect();
        let hits = offsets.len();
        let (mean_offset, mean_abs_offset) = if hits > 0 {
            let n = hits as f64;
            (
                Some(offsets.iter().sum::<f64>() / n),
                Some(offsets.iter().map(|o| o.abs()).sum::<f64>() / n),
            )
        } else {
            (None, None)
        };

        AccuracyReport {
            hits,
            missed: beats.len() - hits,
            extra: self.detected.len() - hits,
            mean_offset,
            mean_abs_offset,
            beats,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeatAccuracy {
    pub scheduled: f64,
    pub detected: Option<f64>,
    /// Positive when the performer was late.
    pub offset: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyReport {
    pub beats: Vec<BeatAccuracy>,
    pub hits: usize,
    pub missed: usize,
    pub extra: usize,
    pub mean_offset: Option<f64>,
    pub mean_abs_offset: Option<f64>,
}

/// Practice recorder: plays a count-in plus the scored bars, logs detected
/// onsets that land inside the window and stops on its own once the window
/// has passed.
#[derive(Debug)]
pub struct AccuracyRecorder {
    tempo: f64,
    beats_per_bar: u32,
    bars: u32,
    state: RecordingState,
    window: Option<RecordingWindow>,
    armed: Vec<SinkHandle>,
}

impl AccuracyRecorder {
    pub fn new(tempo: f64, beats_per_bar: u32, bars: u32) -> Self {
        Self {
            tempo,
            beats_per_bar,
            bars,
            state: RecordingState::Idle,
            window: None,
            armed: Vec::new(),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecordingState::Recording
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn bars(&self) -> u32 {
        self.bars
    }

    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar
    }

    /// Most recent window. It survives the return to idle so it can still be
    /// inspected and drawn.
    pub fn window(&self) -> Option<&RecordingWindow> {
        self.window.as_ref()
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    // The setters below only take effect on the next start; callers stop the
    // recorder first.

    pub fn set_tempo(&mut self, tempo: f64) {
        self.tempo = tempo;
    }

    pub fn set_beats_per_bar(&mut self, beats_per_bar: u32) {
        self.beats_per_bar = beats_per_bar;
    }

    pub fn set_bars(&mut self, bars: u32) {
        self.bars = bars;
    }

    /// Starts a fresh take at `now`: clears both logs, lays out the schedule
    /// and arms every click on the sink. Returns false when the current
    /// parameters cannot produce a schedule.
    pub fn start<S: Sink + ?Sized>(&mut self, now: f64, sink: &mut S) -> bool {
        self.stop(sink);
        if !(self.tempo.is_finite() && self.tempo > 0.0) || self.beats_per_bar == 0 || self.bars == 0 {
            tracing::warn!(
                tempo = self.tempo,
                beats = self.beats_per_bar,
                bars = self.bars,
                "cannot start recording with these parameters"
            );
            return false;
        }

        let (window, clicks) = RecordingWindow::layout(now, self.tempo, self.bars, self.beats_per_bar);
        self.armed = clicks
            .into_iter()
            .map(|(time, sound)| sink.schedule(sound, time))
            .collect();
        tracing::debug!(
            start = window.start_time,
            stop = window.stop_time,
            clicks = self.armed.len(),
            "recording started"
        );
        self.window = Some(window);
        self.state = RecordingState::Recording;
        true
    }

    /// Stops the take and cancels every armed click. Stopping while idle does
    /// nothing. Returns whether a take was running.
    pub fn stop<S: Sink + ?Sized>(&mut self, sink: &mut S) -> bool {
        if self.state == RecordingState::Idle {
            return false;
        }
        for handle in self.armed.drain(..) {
            sink.cancel(handle);
        }
        self.state = RecordingState::Idle;
        tracing::debug!(
            detected = self.window.as_ref().map(|w| w.detected.len()).unwrap_or(0),
            "recording stopped"
        );
        true
    }

    /// Ends the take once the clock has passed the stop time.
    pub fn poll<S: Sink + ?Sized>(&mut self, now: f64, sink: &mut S) -> bool {
        let expired = self.is_recording()
            && self
                .window
                .as_ref()
                .map(|window| now > window.stop_time)
                .unwrap_or(false);
        if expired {
            self.stop(sink);
        }
        expired
    }

    /// Logs an onset if a take is running and `now` is inside its window.
    pub fn log_onset(&mut self, now: f64) -> bool {
        if !self.is_recording() {
            return false;
        }
        match self.window.as_mut() {
            Some(window) if window.accepts(now) => {
                window.detected.push(now);
                true
            }
            _ => false,
        }
    }
}
