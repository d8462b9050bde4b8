//! Secondary track state and the earliest-due merge of two tracks.

use crate::timeline::{secondary_slots, Track, TrackKind, TriggerEvent};

/// Secondary track plus the flag that decides whether it plays. The track
/// keeps its ratio while disabled so re-enabling restores the same rhythm.
#[derive(Debug, Clone)]
pub struct PolyrhythmState {
    enabled: bool,
    secondary: Track,
}

impl PolyrhythmState {
    pub fn new(tempo: f64, primary_beats: u32, ratio: f64) -> Self {
        Self {
            enabled: false,
            secondary: Track::secondary(tempo, primary_beats, ratio),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn ratio(&self) -> f64 {
        self.secondary.ratio()
    }

    pub fn secondary(&self) -> &Track {
        &self.secondary
    }

    pub(crate) fn secondary_mut(&mut self) -> &mut Track {
        &mut self.secondary
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.secondary.reset();
    }

    pub(crate) fn retime(&mut self, tempo: f64) {
        let ratio = self.secondary.ratio();
        self.secondary.retime(tempo, ratio);
    }

    pub(crate) fn resize(&mut self, primary_beats: u32) {
        self.secondary
            .resize(secondary_slots(primary_beats, self.secondary.ratio()));
    }

    /// Recomputes period and slot count together; the caller stops playback
    /// first so the change never lands on a running stream.
    pub(crate) fn set_ratio(&mut self, tempo: f64, primary_beats: u32, ratio: f64) {
        self.secondary.retime(tempo, ratio);
        self.secondary.resize(secondary_slots(primary_beats, ratio));
    }
}

/// Drains two tracks up to a horizon, always emitting whichever track is due
/// first. On an exact tie the primary track goes first.
#[derive(Debug)]
pub struct PolyrhythmMerger<'a> {
    primary: &'a mut Track,
    secondary: &'a mut Track,
    horizon_end: f64,
}

impl<'a> PolyrhythmMerger<'a> {
    pub fn new(primary: &'a mut Track, secondary: &'a mut Track, horizon_end: f64) -> Self {
        Self {
            primary,
            secondary,
            horizon_end,
        }
    }

    fn due(track: &Track, horizon_end: f64) -> Option<f64> {
        if !track.is_runnable() {
            return None;
        }
        let due = track.next_due();
        (due < horizon_end).then_some(due)
    }
}

impl Iterator for PolyrhythmMerger<'_> {
    type Item = TriggerEvent;

    fn next(&mut self) -> Option<TriggerEvent> {
        let primary = Self::due(self.primary, self.horizon_end);
        let secondary = Self::due(self.secondary, self.horizon_end);
        let kind = match (primary, secondary) {
            (Some(p), Some(s)) if s < p => TrackKind::Secondary,
            (Some(_), _) => TrackKind::Primary,
            (None, Some(_)) => TrackKind::Secondary,
            (None, None) => return None,
        };
        Some(match kind {
            TrackKind::Primary => self.primary.emit(kind),
            TrackKind::Secondary => self.secondary.emit(kind),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Voice;
    use crate::timeline::LookaheadScheduler;

    #[test]
    fn three_against_two_interleaves_by_due_time() {
        // 120 bpm primary, secondary at 3:2.
        let mut primary = Track::primary(120.0, 2);
        let mut secondary = Track::secondary(120.0, 2, 1.5);
        let mut events = Vec::new();
        for tick in 0..6 {
            let now = tick as f64 * 0.25;
            events.extend(PolyrhythmMerger::new(&mut primary, &mut secondary, now + 0.25));
        }

        let order: Vec<TrackKind> = events.iter().map(|e| e.track).collect();
        use TrackKind::{Primary as P, Secondary as S};
        assert_eq!(order, vec![S, P, S, P, S, S]);

        let expected = [1.0 / 3.0, 0.5, 2.0 / 3.0, 1.0, 1.0, 4.0 / 3.0];
        for (event, want) in events.iter().zip(expected) {
            assert!((event.time - want).abs() < 1e-9, "{} != {}", event.time, want);
        }
    }

    #[test]
    fn simultaneous_beats_put_primary_first() {
        let mut primary = Track::primary(60.0, 4);
        let mut secondary = Track::secondary(60.0, 4, 2.0);
        let events: Vec<_> = PolyrhythmMerger::new(&mut primary, &mut secondary, 1.01).collect();
        let tagged: Vec<(TrackKind, f64)> = events.iter().map(|e| (e.track, e.time)).collect();
        assert_eq!(
            tagged,
            vec![(TrackKind::Secondary, 0.5), (TrackKind::Primary, 1.0), (TrackKind::Secondary, 1.0)]
        );
    }

    #[test]
    fn each_track_stays_evenly_spaced() {
        let mut sched = LookaheadScheduler::new(100.0, 4, 5.0 / 4.0, 0.1);
        sched.set_polyrhythm(true);
        sched.start(0.0);
        let mut events = Vec::new();
        for i in 0..300 {
            events.extend(sched.tick(i as f64 * 0.1));
        }
        for (kind, period) in [(TrackKind::Primary, 0.6), (TrackKind::Secondary, 0.48)] {
            let times: Vec<f64> = events.iter().filter(|e| e.track == kind).map(|e| e.time).collect();
            assert!(times.len() > 40);
            for pair in times.windows(2) {
                assert!((pair[1] - pair[0] - period).abs() < 1e-9);
            }
        }
        // Global emission order never goes backwards.
        for pair in events.windows(2) {
            assert!(pair[1].time >= pair[0].time);
        }
    }

    #[test]
    fn secondary_bar_accents_on_its_own_downbeat() {
        let mut sched = LookaheadScheduler::new(120.0, 4, 1.5, 0.1);
        sched.set_polyrhythm(true);
        sched.start(0.0);
        let mut secondary = Vec::new();
        for i in 0..40 {
            secondary.extend(
                sched
                    .tick(i as f64 * 0.1)
                    .into_iter()
                    .filter(|e| e.track == TrackKind::Secondary),
            );
        }
        let slots: Vec<usize> = secondary.iter().take(7).map(|e| e.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5, 0]);
        assert!(secondary[0].sound.accent);
        assert!(secondary[6].sound.accent);
        assert_eq!(secondary[1].sound.voice, Voice::Chime);
    }

    #[test]
    fn ratio_change_recomputes_and_resets_both_tracks() {
        let mut sched = LookaheadScheduler::new(120.0, 4, 1.5, 0.1);
        sched.set_polyrhythm(true);
        sched.start(10.0);
        let _ = sched.tick(10.0);
        assert!(sched.primary().last_emit() > 0.0);

        sched.set_poly_ratio(5.0 / 4.0).unwrap();
        assert!(!sched.is_playing());
        assert_eq!(sched.primary().last_emit(), 0.0);
        assert_eq!(sched.polyrhythm().secondary().last_emit(), 0.0);
        assert_eq!(sched.polyrhythm().secondary().beats_per_bar(), 5);
        assert!((sched.polyrhythm().secondary().note_period() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn disabled_polyrhythm_is_absent_from_snapshot() {
        let mut sched = LookaheadScheduler::new(120.0, 4, 1.5, 0.1);
        assert!(sched.snapshot().secondary.is_none());
        sched.set_polyrhythm(true);
        assert!(sched.snapshot().secondary.is_some());
        assert!(sched.polyrhythm().is_enabled());
    }
}
