use std::fmt;

use serde::{Deserialize, Serialize};

/// Sample family played for a beat slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Voice {
    Tick,
    Chime,
    Cymbal,
}

/// Sound requested from the sink. The accent flag selects the high-pitched
/// variant of the voice and is set on the first slot of every bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SoundId {
    pub voice: Voice,
    pub accent: bool,
}

impl SoundId {
    pub fn plain(voice: Voice) -> Self {
        Self {
            voice,
            accent: false,
        }
    }

    pub fn accented(voice: Voice) -> Self {
        Self {
            voice,
            accent: true,
        }
    }
}

impl fmt::Display for SoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.voice {
            Voice::Tick => "tick",
            Voice::Chime => "chime",
            Voice::Cymbal => "cymbal",
        };
        if self.accent {
            write!(f, "{name}_high")
        } else {
            f.write_str(name)
        }
    }
}

/// Opaque token returned by [`Sink::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkHandle(pub u64);

/// Audio output that plays sounds at absolute clock times on its own
/// timeline. Cancelling an unknown or already played handle does nothing.
pub trait Sink {
    fn schedule(&mut self, sound: SoundId, at: f64) -> SinkHandle;
    fn cancel(&mut self, handle: SinkHandle);
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn schedule(&mut self, sound: SoundId, at: f64) -> SinkHandle {
        (**self).schedule(sound, at)
    }

    fn cancel(&mut self, handle: SinkHandle) {
        (**self).cancel(handle)
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn schedule(&mut self, sound: SoundId, at: f64) -> SinkHandle {
        (**self).schedule(sound, at)
    }

    fn cancel(&mut self, handle: SinkHandle) {
        (**self).cancel(handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueuedSound {
    pub handle: SinkHandle,
    pub sound: SoundId,
    pub at: f64,
}

/// In-memory sink. Sounds wait in a queue until [`EventQueue::drain_due`]
/// hands them to whatever actually produces audio.
#[derive(Debug, Default)]
pub struct EventQueue {
    pending: Vec<QueuedSound>,
    next_handle: u64,
    scheduled: usize,
    cancelled: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every sound due at or before `now`, in time order.
    pub fn drain_due(&mut self, now: f64) -> Vec<QueuedSound> {
        let mut due = Vec::new();
        self.pending.retain(|queued| {
            if queued.at <= now {
                due.push(*queued);
                false
            } else {
                true
            }
        });
        due.sort_by(|a, b| a.at.total_cmp(&b.at).then(a.handle.cmp(&b.handle)));
        due
    }

    pub fn pending(&self) -> &[QueuedSound] {
        &self.pending
    }

    /// Total number of sounds ever scheduled.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled
    }

    /// Number of cancellations that removed a pending sound.
    pub fn cancelled_count(&self) -> usize {
        self.cancelled
    }
}

impl Sink for EventQueue {
    fn schedule(&mut self, sound: SoundId, at: f64) -> SinkHandle {
        let handle = SinkHandle(self.next_handle);
        self.next_handle += 1;
        self.scheduled += 1;
        self.pending.push(QueuedSound { handle, sound, at });
        handle
    }

    fn cancel(&mut self, handle: SinkHandle) {
        let before = self.pending.len();
        self.pending.retain(|queued| queued.handle != handle);
        self.cancelled += before - self.pending.len();
    }
}
