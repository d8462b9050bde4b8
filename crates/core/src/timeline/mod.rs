use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::polyrhythm::{PolyrhythmMerger, PolyrhythmState};
use crate::sink::{SoundId, Voice};
use crate::{Result, RhythmError};

/// Lead applied when playback starts so the first beat is imminent instead of
/// a full period away.
pub const START_OFFSET: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackState {
    Stopped,
    Playing,
}

/// Trigger emitted by the scheduler and forwarded to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub track: TrackKind,
    pub time: f64,
    pub beat_index: u64,
    pub slot: usize,
    pub sound: SoundId,
}

/// One rhythmic voice: a tempo derived period, the time of the last emitted
/// beat and the running beat counter. The slot table length is the number
/// of beats in one bar of this track.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    tempo: f64,
    ratio: f64,
    note_period: f64,
    last_emit: f64,
    beat_index: u64,
    voices: Vec<Voice>,
    default_voice: Voice,
}

impl Track {
    pub fn new(tempo: f64, ratio: f64, slots: usize, voice: Voice) -> Self {
        Self {
            tempo,
            ratio,
            note_period: note_period(tempo, ratio),
            last_emit: 0.0,
            beat_index: 0,
            voices: vec![voice; slots],
            default_voice: voice,
        }
    }

    pub fn primary(tempo: f64, beats_per_bar: u32) -> Self {
        Self::new(tempo, 1.0, beats_per_bar as usize, Voice::Tick)
    }

    pub fn secondary(tempo: f64, primary_beats: u32, ratio: f64) -> Self {
        Self::new(tempo, ratio, secondary_slots(primary_beats, ratio), Voice::Chime)
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn note_period(&self) -> f64 {
        self.note_period
    }

    pub fn last_emit(&self) -> f64 {
        self.last_emit
    }

    pub fn beat_index(&self) -> u64 {
        self.beat_index
    }

    pub fn beats_per_bar(&self) -> usize {
        self.voices.len()
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn next_due(&self) -> f64 {
        self.last_emit + self.note_period
    }

    /// A track with no slots or a degenerate period never emits.
    pub fn is_runnable(&self) -> bool {
        !self.voices.is_empty() && self.note_period.is_finite() && self.note_period > 0.0
    }

    /// Positions the track so its first beat falls [`START_OFFSET`] after `now`.
    pub fn arm(&mut self, now: f64) {
        self.last_emit = now - self.note_period + START_OFFSET;
        self.beat_index = 0;
    }

    pub fn reset(&mut self) {
        self.last_emit = 0.0;
        self.beat_index = 0;
    }

    pub fn retime(&mut self, tempo: f64, ratio: f64) {
        self.tempo = tempo;
        self.ratio = ratio;
        self.note_period = note_period(tempo, ratio);
        self.reset();
    }

    /// Rebuilds the slot table with the default voice.
    pub fn resize(&mut self, slots: usize) {
        self.voices = vec![self.default_voice; slots];
        self.reset();
    }

    pub fn set_voice(&mut self, slot: usize, voice: Voice) -> bool {
        match self.voices.get_mut(slot) {
            Some(entry) => {
                *entry = voice;
                true
            }
            None => false,
        }
    }

    /// Drops beats that fell due more than `grace` before `now`. Returns how
    /// many were skipped; they are never replayed. Beats that are late by less
    /// than `grace` stay queued and go out on the next emit.
    pub fn skip_missed(&mut self, now: f64, grace: f64) -> u64 {
        if !self.is_runnable() {
            return 0;
        }
        let cutoff = now - grace;
        let mut skipped = 0;
        while self.next_due() < cutoff {
            self.last_emit += self.note_period;
            self.beat_index += 1;
            skipped += 1;
        }
        skipped
    }

    /// Emits the next beat and advances the track by one period.
    pub fn emit(&mut self, kind: TrackKind) -> TriggerEvent {
        let slot = (self.beat_index % self.voices.len() as u64) as usize;
        let voice = self.voices[slot];
        let sound = if slot == 0 {
            SoundId::accented(voice)
        } else {
            SoundId::plain(voice)
        };
        let event = TriggerEvent {
            track: kind,
            time: self.next_due(),
            beat_index: self.beat_index,
            slot,
            sound,
        };
        self.last_emit += self.note_period;
        self.beat_index += 1;
        event
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            note_period: self.note_period,
            last_emit: self.last_emit,
            next_due: self.next_due(),
            beat_index: self.beat_index,
            beats_per_bar: self.voices.len(),
        }
    }
}

pub fn note_period(tempo: f64, ratio: f64) -> f64 {
    60.0 / (tempo * ratio)
}

/// Slot count of a secondary track, rounded up for fractional ratios.
pub fn secondary_slots(primary_beats: u32, ratio: f64) -> usize {
    let beats = primary_beats as f64 * ratio;
    if beats.is_finite() && beats > 0.0 {
        (beats - 1e-9).ceil().max(1.0) as usize
    } else {
        0
    }
}

/// Read-only copy of one track, handed to the rendering path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub note_period: f64,
    pub last_emit: f64,
    pub next_due: f64,
    pub beat_index: u64,
    pub beats_per_bar: usize,
}

impl TrackSnapshot {
    /// Slot of the most recently emitted beat.
    pub fn current_slot(&self) -> Option<usize> {
        if self.beat_index == 0 || self.beats_per_bar == 0 {
            return None;
        }
        Some(((self.beat_index - 1) % self.beats_per_bar as u64) as usize)
    }

    /// Pendulum swing in `[-1, 1]`, completing one half swing per beat and
    /// reversing direction on alternate beats.
    pub fn pendulum(&self, now: f64) -> f64 {
        if !(self.note_period.is_finite() && self.note_period > 0.0) {
            return 0.0;
        }
        let mut elapsed = now - self.last_emit;
        if elapsed < 0.0 {
            elapsed += self.note_period;
        }
        let swing = (elapsed * PI / self.note_period).sin();
        if self.beat_index % 2 == 1 {
            -swing
        } else {
            swing
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduleSnapshot {
    pub playback: PlaybackState,
    pub primary: TrackSnapshot,
    pub secondary: Option<TrackSnapshot>,
}

/// Fixed cadence scheduler. Every tick emits the beats falling inside the
/// lookahead horizon so the sink always receives them before they are due.
#[derive(Debug, Clone)]
pub struct LookaheadScheduler {
    horizon: f64,
    playback: PlaybackState,
    primary: Track,
    poly: PolyrhythmState,
}

impl LookaheadScheduler {
    pub fn new(tempo: f64, beats_per_bar: u32, poly_ratio: f64, horizon: f64) -> Self {
        Self {
            horizon,
            playback: PlaybackState::Stopped,
            primary: Track::primary(tempo, beats_per_bar),
            poly: PolyrhythmState::new(tempo, beats_per_bar, poly_ratio),
        }
    }

    pub fn playback(&self) -> PlaybackState {
        self.playback
    }

    pub fn is_playing(&self) -> bool {
        self.playback == PlaybackState::Playing
    }

    pub fn horizon(&self) -> f64 {
        self.horizon
    }

    pub fn primary(&self) -> &Track {
        &self.primary
    }

    pub fn polyrhythm(&self) -> &PolyrhythmState {
        &self.poly
    }

    pub fn start(&mut self, now: f64) {
        self.primary.arm(now);
        if self.poly.is_enabled() {
            self.poly.secondary_mut().arm(now);
        }
        self.playback = PlaybackState::Playing;
        tracing::debug!(now, "metronome started");
    }

    /// Stops playback and zeroes both tracks. Returns whether it was playing.
    pub fn stop(&mut self) -> bool {
        let was_playing = self.is_playing();
        self.playback = PlaybackState::Stopped;
        self.primary.reset();
        self.poly.secondary_mut().reset();
        if was_playing {
            tracing::debug!("metronome stopped");
        }
        was_playing
    }

    pub fn set_tempo(&mut self, tempo: f64) -> Result<()> {
        if !(tempo.is_finite() && tempo > 0.0) {
            return Err(RhythmError::invalid("tempo", tempo));
        }
        self.stop();
        self.primary.retime(tempo, 1.0);
        self.poly.retime(tempo);
        Ok(())
    }

    pub fn set_signature(&mut self, beats_per_bar: u32) -> Result<()> {
        if beats_per_bar == 0 {
            return Err(RhythmError::invalid("beats_per_bar", beats_per_bar));
        }
        self.stop();
        self.primary.resize(beats_per_bar as usize);
        self.poly.resize(beats_per_bar);
        Ok(())
    }

    pub fn set_poly_ratio(&mut self, ratio: f64) -> Result<()> {
        if !(ratio.is_finite() && ratio > 0.0) {
            return Err(RhythmError::invalid("poly_ratio", ratio));
        }
        self.stop();
        let beats = self.primary.beats_per_bar() as u32;
        self.poly.set_ratio(self.primary.tempo(), beats, ratio);
        Ok(())
    }

    pub fn set_polyrhythm(&mut self, enabled: bool) {
        self.stop();
        self.poly.set_enabled(enabled);
    }

    pub fn set_voice(&mut self, track: TrackKind, slot: usize, voice: Voice) -> bool {
        match track {
            TrackKind::Primary => self.primary.set_voice(slot, voice),
            TrackKind::Secondary => self.poly.secondary_mut().set_voice(slot, voice),
        }
    }

    /// Emits every beat due before `now + horizon`. A tick that runs late by
    /// less than one horizon still emits the overdue beats; after a longer
    /// host stall the beats older than that are skipped rather than played
    /// late.
    pub fn tick(&mut self, now: f64) -> Vec<TriggerEvent> {
        let mut events = Vec::new();
        if !self.is_playing() || !(self.horizon.is_finite() && self.horizon > 0.0) {
            return events;
        }
        let horizon_end = now + self.horizon;

        if self.poly.is_enabled() {
            let secondary = self.poly.secondary_mut();
            let skipped = (
                self.primary.skip_missed(now, self.horizon),
                secondary.skip_missed(now, self.horizon),
            );
            if skipped != (0, 0) {
                tracing::warn!(
                    primary = skipped.0,
                    secondary = skipped.1,
                    "scheduler stalled, skipping beats"
                );
            }
            events.extend(PolyrhythmMerger::new(&mut self.primary, secondary, horizon_end));
        } else {
            if !self.primary.is_runnable() {
                return events;
            }
            let skipped = self.primary.skip_missed(now, self.horizon);
            if skipped > 0 {
                tracing::warn!(skipped, "scheduler stalled, skipping beats");
            }
            while self.primary.next_due() < horizon_end {
                events.push(self.primary.emit(TrackKind::Primary));
            }
        }
        events
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        ScheduleSnapshot {
            playback: self.playback,
            primary: self.primary.snapshot(),
            secondary: self
                .poly
                .is_enabled()
                .then(|| self.poly.secondary().snapshot()),
        }
    }
}
