//! Core library for the Rhythm Engine.
//!
//! The crate schedules metronome clicks ahead of time against a monotonic
//! clock, optionally layers a polyrhythmic second track on top, and scores a
//! performer's onsets from a live input against a scheduled reference. Each
//! module owns one subsystem; [`RhythmEngine`] wires them to the external
//! clock, audio sink and input analyser.

pub mod analysis;
pub mod audio;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod polyrhythm;
pub mod record;
pub mod sink;
pub mod timeline;

pub use analysis::{DetectorReading, OnsetDetector};
pub use audio::{InputAnalyzer, LiveInput, SpectrumAnalyzer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AnalyzerConfig, DetectorConfig, EngineConfig, RecorderConfig, SchedulerConfig};
pub use engine::{EngineFrame, RhythmEngine};
pub use error::{Result, RhythmError};
pub use polyrhythm::{PolyrhythmMerger, PolyrhythmState};
pub use record::{AccuracyRecorder, AccuracyReport, BeatAccuracy, RecordingState, RecordingWindow};
pub use sink::{EventQueue, QueuedSound, Sink, SinkHandle, SoundId, Voice};
pub use timeline::{
    LookaheadScheduler, PlaybackState, ScheduleSnapshot, Track, TrackKind, TrackSnapshot,
    TriggerEvent,
};
