use serde::Serialize;

use crate::analysis::{DetectorReading, OnsetDetector};
use crate::clock::Clock;
use crate::record::{AccuracyRecorder, AccuracyReport, RecordingState, RecordingWindow};
use crate::sink::{Sink, SinkHandle, Voice};
use crate::timeline::{LookaheadScheduler, ScheduleSnapshot, TrackKind, TriggerEvent};
use crate::{EngineConfig, InputAnalyzer, Result};

/// Everything the presentation layer needs for one rendering tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EngineFrame {
    pub time: f64,
    pub schedule: ScheduleSnapshot,
    /// Pendulum position in `[-1, 1]`, zero while stopped.
    pub pendulum: f64,
    pub detector: DetectorReading,
    pub recording: RecordingState,
    /// Fraction of the recording timeline elapsed, if a take exists.
    pub progress: Option<f64>,
    /// True when this tick appended an onset to the accuracy log.
    pub logged_onset: bool,
}

#[derive(Debug, Clone, Copy)]
struct ArmedTrigger {
    time: f64,
    handle: SinkHandle,
}

/// Metronome, polyrhythm and practice recorder driven by two periodic ticks.
///
/// [`RhythmEngine::scheduler_tick`] runs on a coarse timer (about every
/// 100 ms) and hands upcoming beats to the sink ahead of time.
/// [`RhythmEngine::render_tick`] runs at display rate, samples the input for
/// onsets and returns a copy of the schedule for drawing. Both assume a
/// single thread; nothing in the rendering path mutates schedule state.
pub struct RhythmEngine<C: Clock, S: Sink> {
    clock: C,
    sink: S,
    input: Option<Box<dyn InputAnalyzer>>,
    config: EngineConfig,
    scheduler: LookaheadScheduler,
    armed: Vec<ArmedTrigger>,
    detector: OnsetDetector,
    recorder: AccuracyRecorder,
}

impl<C: Clock, S: Sink> RhythmEngine<C, S> {
    pub fn new(clock: C, sink: S, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let timing = &config.scheduler;
        let scheduler = LookaheadScheduler::new(
            timing.tempo,
            timing.beats_per_bar,
            timing.poly_ratio(),
            timing.eval_period,
        );
        let detector = OnsetDetector::new(config.detector.clone(), 60.0 / timing.tempo);
        let recorder = AccuracyRecorder::new(timing.tempo, timing.beats_per_bar, config.recorder.bars);

        Ok(Self {
            clock,
            sink,
            input: None,
            config,
            scheduler,
            armed: Vec::new(),
            detector,
            recorder,
        })
    }

    /// Attaches the live input used for onset detection.
    pub fn with_input(mut self, input: impl InputAnalyzer + 'static) -> Self {
        self.set_input(input);
        self
    }

    pub fn set_input(&mut self, input: impl InputAnalyzer + 'static) {
        self.input = Some(Box::new(input));
    }

    /// Drops the input; the engine keeps running as a plain metronome.
    pub fn clear_input(&mut self) {
        self.input = None;
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    /// Configuration the engine was built with. Later parameter edits are
    /// reflected in the scheduler and recorder, not here.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn scheduler(&self) -> &LookaheadScheduler {
        &self.scheduler
    }

    pub fn detector(&self) -> &OnsetDetector {
        &self.detector
    }

    pub fn recorder(&self) -> &AccuracyRecorder {
        &self.recorder
    }

    pub fn recording_window(&self) -> Option<&RecordingWindow> {
        self.recorder.window()
    }

    pub fn accuracy_report(&self) -> Option<AccuracyReport> {
        self.recorder
            .window()
            .map(|window| window.report(self.config.recorder.input_latency))
    }

    pub fn snapshot(&self) -> ScheduleSnapshot {
        self.scheduler.snapshot()
    }

    pub fn is_playing(&self) -> bool {
        self.scheduler.is_playing()
    }

    /// Starts the metronome. Returns false if it was already playing.
    pub fn start(&mut self) -> bool {
        if self.scheduler.is_playing() {
            return false;
        }
        let now = self.clock.now();
        self.scheduler.start(now);
        true
    }

    /// Stops the metronome and cancels every beat already handed to the sink.
    /// Stopping while stopped does nothing.
    pub fn stop(&mut self) -> bool {
        if !self.scheduler.stop() {
            return false;
        }
        for armed in self.armed.drain(..) {
            self.sink.cancel(armed.handle);
        }
        true
    }

    pub fn toggle(&mut self) -> bool {
        if self.is_playing() {
            self.stop();
        } else {
            self.start();
        }
        self.is_playing()
    }

    /// Coarse timer driver: forwards every beat inside the lookahead horizon
    /// to the sink and returns them.
    pub fn scheduler_tick(&mut self) -> Vec<TriggerEvent> {
        let now = self.clock.now();
        self.armed.retain(|armed| armed.time > now);

        let events = self.scheduler.tick(now);
        for event in &events {
            let handle = self.sink.schedule(event.sound, event.time);
            self.armed.push(ArmedTrigger {
                time: event.time,
                handle,
            });
            tracing::trace!(
                track = ?event.track,
                time = event.time,
                slot = event.slot,
                sound = %event.sound,
                "beat scheduled"
            );
        }
        events
    }

    /// Display rate driver: samples the input, logs onsets that fall inside
    /// the recording window and ends the take once it has expired.
    pub fn render_tick(&mut self) -> EngineFrame {
        let now = self.clock.now();
        let detector = self.detector.sample(now, self.input.as_deref_mut());
        let logged_onset = detector.onset && self.recorder.log_onset(now);

        if self.recorder.poll(now, &mut self.sink) {
            tracing::info!(
                detected = self.recorder.window().map(|w| w.detected.len()).unwrap_or(0),
                "recording window finished"
            );
        }

        let schedule = self.scheduler.snapshot();
        let pendulum = if self.scheduler.is_playing() {
            schedule.primary.pendulum(now)
        } else {
            0.0
        };

        EngineFrame {
            time: now,
            schedule,
            pendulum,
            detector,
            recording: self.recorder.state(),
            progress: self.recorder.window().map(|window| window.progress(now)),
            logged_onset,
        }
    }

    /// Begins a practice take at the current time. Any running take is
    /// cancelled and replaced.
    pub fn start_recording(&mut self) -> bool {
        let now = self.clock.now();
        self.detector
            .set_seconds_per_beat(60.0 / self.recorder.tempo());
        self.detector.reset();
        self.recorder.start(now, &mut self.sink)
    }

    pub fn stop_recording(&mut self) -> bool {
        self.recorder.stop(&mut self.sink)
    }

    pub fn set_tempo(&mut self, bpm: f64) -> bool {
        let checked = self.config.scheduler.check_tempo(bpm);
        self.reconfigure(checked, |engine, bpm| {
            engine.scheduler.set_tempo(bpm)?;
            engine.recorder.set_tempo(bpm);
            engine.detector.set_seconds_per_beat(60.0 / bpm);
            Ok(())
        })
    }

    pub fn set_signature(&mut self, beats_per_bar: u32) -> bool {
        let checked = self.config.scheduler.check_signature(beats_per_bar);
        self.reconfigure(checked, |engine, beats| {
            engine.scheduler.set_signature(beats)?;
            engine.recorder.set_beats_per_bar(beats);
            Ok(())
        })
    }

    /// Sets the secondary to primary beat ratio, e.g. `1.5` for three against
    /// two. Ratios that would give the secondary bar more than
    /// `max_poly_beats` slots are rejected.
    pub fn set_poly_ratio(&mut self, ratio: f64) -> bool {
        let primary = self.scheduler.primary().beats_per_bar() as u32;
        let checked = self.config.scheduler.check_poly_ratio(primary, ratio);
        self.reconfigure(checked, |engine, ratio| engine.scheduler.set_poly_ratio(ratio))
    }

    /// Sets how many secondary beats share one primary bar.
    pub fn set_poly_beats(&mut self, beats: u32) -> bool {
        let primary = self.scheduler.primary().beats_per_bar();
        if beats == 0 || primary == 0 {
            tracing::warn!(beats, primary, "ignoring polyrhythm beat count");
            return false;
        }
        self.set_poly_ratio(beats as f64 / primary as f64)
    }

    pub fn set_polyrhythm(&mut self, enabled: bool) -> bool {
        self.reconfigure(Ok(enabled), |engine, enabled| {
            engine.scheduler.set_polyrhythm(enabled);
            Ok(())
        })
    }

    /// Number of scored bars in the next practice take.
    pub fn set_bars(&mut self, bars: u32) -> bool {
        let checked = self.config.recorder.check_bars(bars);
        self.reconfigure(checked, |engine, bars| {
            engine.recorder.set_bars(bars);
            Ok(())
        })
    }

    /// Picks the voice for one beat slot. Takes effect from the next emitted
    /// beat and does not interrupt playback.
    pub fn set_beat_sound(&mut self, track: TrackKind, slot: usize, voice: Voice) -> bool {
        self.scheduler.set_voice(track, slot, voice)
    }

    /// Shared path for every parameter edit: an invalid value is logged and
    /// ignored, a valid one first stops playback and recording.
    fn reconfigure<T, F>(&mut self, checked: Result<T>, apply: F) -> bool
    where
        F: FnOnce(&mut Self, T) -> Result<()>,
    {
        let value = match checked {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(%err, "ignoring parameter change");
                return false;
            }
        };

        self.stop();
        self.stop_recording();
        match apply(self, value) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%err, "parameter change rejected");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::sink::EventQueue;
    use crate::timeline::PlaybackState;
    use crate::{AnalyzerConfig, LiveInput};

    /// Input whose every bin reads the shared level.
    struct Level(Rc<Cell<u8>>);

    impl InputAnalyzer for Level {
        fn fft_size(&self) -> usize {
            256
        }

        fn sample_magnitudes(&mut self, bins: &mut [u8]) -> Result<()> {
            bins.iter_mut().for_each(|b| *b = self.0.get());
            Ok(())
        }
    }

    fn engine() -> (ManualClock, RhythmEngine<ManualClock, EventQueue>) {
        let clock = ManualClock::new(0.0);
        let engine = RhythmEngine::new(clock.clone(), EventQueue::new(), EngineConfig::default()).unwrap();
        (clock, engine)
    }

    fn practice_engine() -> (ManualClock, Rc<Cell<u8>>, RhythmEngine<ManualClock, EventQueue>) {
        let (clock, mut engine) = engine();
        assert!(engine.set_tempo(90.0));
        let level = Rc::new(Cell::new(0));
        engine.set_input(Level(level.clone()));
        (clock, level, engine)
    }

    /// Render ticks at 60 Hz over `[from, to)`, with a spike on the first
    /// tick at or after each time in `spikes`.
    fn render(
        clock: &ManualClock,
        level: &Rc<Cell<u8>>,
        engine: &mut RhythmEngine<ManualClock, EventQueue>,
        from: f64,
        to: f64,
        spikes: &[f64],
    ) {
        let first = (from * 60.0).round() as i64;
        let last = (to * 60.0).round() as i64;
        let mut pending = spikes.iter().peekable();
        for frame in first..last {
            let now = frame as f64 / 60.0;
            clock.set(now);
            let spike = pending.next_if(|&&at| now >= at).is_some();
            level.set(if spike { 40 } else { 0 });
            engine.render_tick();
        }
    }

    #[test]
    fn rejects_invalid_configuration() {
        let mut config = EngineConfig::default();
        config.scheduler.eval_period = 0.0;
        assert!(RhythmEngine::new(ManualClock::default(), EventQueue::new(), config).is_err());
    }

    #[test]
    fn runs_scheduler_only_without_input() {
        let (clock, mut engine) = engine();
        assert!(engine.start());
        assert!(!engine.start());
        let mut emitted = 0;
        for i in 0..20 {
            clock.set(i as f64 * 0.1);
            emitted += engine.scheduler_tick().len();
            let frame = engine.render_tick();
            assert!(!frame.detector.available);
            assert_eq!(frame.schedule.playback, PlaybackState::Playing);
        }
        // 120 bpm for two seconds.
        assert_eq!(emitted, 4);
        assert_eq!(engine.sink().scheduled_count(), 4);
    }

    #[test]
    fn tempo_change_stops_and_cancels_pending_beats() {
        let (clock, mut engine) = engine();
        engine.start();
        clock.set(0.0);
        let events = engine.scheduler_tick();
        assert_eq!(events.len(), 1);
        assert_eq!(engine.sink().pending().len(), 1);

        assert!(engine.set_tempo(100.0));
        assert!(!engine.is_playing());
        assert!(engine.sink().pending().is_empty());
        assert_eq!(engine.sink().cancelled_count(), 1);

        for i in 1..20 {
            clock.set(i as f64 * 0.1);
            assert!(engine.scheduler_tick().is_empty());
        }
        engine.start();
        let events = engine.scheduler_tick();
        assert_eq!(events.len(), 1);
        assert!((engine.snapshot().primary.note_period - 0.6).abs() < 1e-12);
    }

    #[test]
    fn invalid_edits_are_ignored_without_stopping() {
        let (_clock, mut engine) = engine();
        engine.start();
        assert!(!engine.set_tempo(-5.0));
        assert!(!engine.set_tempo(f64::NAN));
        assert!(!engine.set_tempo(400.0));
        assert!(!engine.set_signature(0));
        assert!(!engine.set_poly_ratio(0.0));
        assert!(!engine.set_poly_beats(0));
        assert!(!engine.set_bars(0));
        assert!(engine.is_playing());
        assert_eq!(engine.scheduler().primary().tempo(), 120.0);
    }

    #[test]
    fn oversized_counts_and_ratios_are_ignored() {
        let (_clock, mut engine) = engine();
        engine.start();
        assert!(!engine.set_poly_ratio(1e30));
        assert!(!engine.set_poly_ratio(8.5));
        assert!(!engine.set_poly_beats(u32::MAX));
        assert!(!engine.set_poly_beats(33));
        assert!(!engine.set_signature(u32::MAX));
        assert!(!engine.set_bars(u32::MAX));
        assert!(engine.is_playing());

        let poly = engine.scheduler().polyrhythm();
        assert_eq!(poly.secondary().beats_per_bar(), 6);
        assert!((poly.ratio() - 1.5).abs() < 1e-12);
        assert_eq!(engine.scheduler().primary().beats_per_bar(), 4);
        assert_eq!(engine.recorder().bars(), 4);

        // The largest accepted values still produce a bounded take.
        assert!(engine.set_poly_beats(32));
        assert!(engine.set_bars(64));
        assert!(engine.start_recording());
        assert_eq!(engine.sink().pending().len(), 65 * 4);
    }

    #[test]
    fn every_edit_forces_stop() {
        let (_clock, mut engine) = engine();
        type Edit = fn(&mut RhythmEngine<ManualClock, EventQueue>) -> bool;
        let edits: [Edit; 5] = [
            |e| e.set_tempo(80.0),
            |e| e.set_signature(3),
            |e| e.set_poly_beats(5),
            |e| e.set_polyrhythm(true),
            |e| e.set_bars(2),
        ];
        for edit in edits {
            engine.start();
            engine.start_recording();
            assert!(edit(&mut engine));
            assert!(!engine.is_playing());
            assert_eq!(engine.recorder().state(), RecordingState::Idle);
        }
        assert_eq!(engine.recorder().bars(), 2);
        assert_eq!(engine.scheduler().polyrhythm().secondary().beats_per_bar(), 5);
    }

    #[test]
    fn sound_choice_does_not_stop_playback() {
        let (clock, mut engine) = engine();
        engine.start();
        assert!(engine.set_beat_sound(TrackKind::Primary, 1, Voice::Cymbal));
        assert!(engine.is_playing());
        let mut sounds = Vec::new();
        for i in 0..10 {
            clock.set(i as f64 * 0.1);
            sounds.extend(engine.scheduler_tick().into_iter().map(|e| e.sound));
        }
        assert_eq!(sounds[1].voice, Voice::Cymbal);
    }

    #[test]
    fn polyrhythm_reaches_the_sink_in_due_order() {
        let (clock, mut engine) = engine();
        assert!(engine.set_polyrhythm(true));
        assert!(engine.set_poly_beats(6));
        engine.start();
        let mut events = Vec::new();
        for i in 0..20 {
            clock.set(i as f64 * 0.1);
            events.extend(engine.scheduler_tick());
        }
        let primary = events.iter().filter(|e| e.track == TrackKind::Primary).count();
        let secondary = events.iter().filter(|e| e.track == TrackKind::Secondary).count();
        assert_eq!(primary, 4);
        assert_eq!(secondary, 6);
        assert_eq!(events[0].track, TrackKind::Primary);
        assert_eq!(events[1].track, TrackKind::Secondary);
    }

    #[test]
    fn refractory_window_merges_close_spikes() {
        let (clock, level, mut engine) = practice_engine();
        clock.set(0.0);
        assert!(engine.start_recording());
        let spacing = engine.detector().beat_spacing();
        assert!((spacing - 2.0 / 9.0).abs() < 1e-12);

        // First scored beat is at 2.667 s.
        render(&clock, &level, &mut engine, 0.0, 6.0, &[3.0, 3.1, 5.0, 5.3]);

        let detected = &engine.recording_window().unwrap().detected;
        assert_eq!(detected.len(), 3);
        assert!((detected[0] - 3.0).abs() < 1e-9);
        assert!((detected[1] - 5.0).abs() < 1e-9);
        assert!((detected[2] - 5.3).abs() < 1e-9);
    }

    #[test]
    fn onsets_outside_window_are_not_logged() {
        let (clock, level, mut engine) = practice_engine();
        clock.set(0.0);
        engine.start_recording();
        render(&clock, &level, &mut engine, 0.0, 15.0, &[1.0, 2.0, 14.0]);
        assert!(engine.recording_window().unwrap().detected.is_empty());
        assert!(engine.detector().last_onset().is_some());
    }

    #[test]
    fn recording_stops_itself_after_the_window() {
        let (clock, level, mut engine) = practice_engine();
        clock.set(0.0);
        engine.start_recording();
        assert_eq!(engine.sink().pending().len(), 20);

        let mut finished_at = None;
        for frame in 0..1200 {
            let now = frame as f64 / 60.0;
            clock.set(now);
            let _ = engine.sink_mut().drain_due(now);
            level.set(0);
            if engine.render_tick().recording == RecordingState::Idle {
                finished_at = Some(now);
                break;
            }
        }

        let finished_at = finished_at.expect("recording should end on its own");
        assert!((finished_at - 40.0 / 3.0).abs() < 1.0 / 30.0);
        let window = engine.recording_window().unwrap();
        assert_eq!(window.scheduled.len(), 16);
        assert!(engine.sink().pending().is_empty());
        assert_eq!(engine.recorder().armed_count(), 0);
    }

    #[test]
    fn manual_stop_cancels_remaining_clicks_once() {
        let (clock, _level, mut engine) = practice_engine();
        clock.set(0.0);
        engine.start_recording();
        clock.set(2.1);
        let played = engine.sink_mut().drain_due(2.1).len();
        assert_eq!(played, 4);

        assert!(engine.stop_recording());
        assert_eq!(engine.sink().cancelled_count(), 16);
        assert!(!engine.stop_recording());
        assert!(!engine.stop());
        assert_eq!(engine.sink().cancelled_count(), 16);
        assert!(engine.accuracy_report().is_some());
    }

    #[test]
    fn disconnected_input_degrades_to_metronome() {
        let (clock, mut engine) = engine();
        let input = LiveInput::new(AnalyzerConfig::default()).unwrap();
        engine.set_input(input.clone());
        input.push_samples(&[0.25; 256]).unwrap();
        engine.start();

        assert!(engine.render_tick().detector.available);
        input.disconnect().unwrap();
        for i in 1..10 {
            clock.set(i as f64 * 0.1);
            engine.scheduler_tick();
            let frame = engine.render_tick();
            assert!(!frame.detector.available);
            assert_eq!(frame.detector.power, 0.0);
        }
        assert!(engine.is_playing());
        assert!(engine.sink().scheduled_count() > 0);
    }

    #[test]
    fn pendulum_is_still_when_stopped() {
        let (clock, mut engine) = engine();
        clock.set(0.3);
        assert_eq!(engine.render_tick().pendulum, 0.0);
        engine.start();
        engine.scheduler_tick();
        clock.set(0.55);
        let frame = engine.render_tick();
        assert!(frame.pendulum.abs() > 0.0);
        assert!(frame.pendulum.abs() <= 1.0);
    }
}
