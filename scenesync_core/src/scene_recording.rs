//! Scene recording: a timestamped log of every event raised on a bus.
//!
//! A recording starts from a [`SceneInfo`] seed (so it can be played back
//! on an empty scene), then appends everything the bus carries. Batches are
//! handed off with [`SceneRecording::flush`], which swaps the log for an
//! empty one under the lock so concurrent appends are never lost or
//! duplicated.

use crate::event_bus::{EventBus, HandlerId};
use crate::events::Event;
use crate::lock;
use crate::scene_info::SceneInfo;
use scenesync_env::SceneContext;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Recording persistence errors
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed recording entry: {0}")]
    Codec(#[from] serde_json::Error),
}

/// One recorded event and when it happened relative to the recording start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingEntry {
    pub elapsed: Duration,
    pub event: Event,
}

/// Live recorder for one bus.
pub struct SceneRecording<Ctx: SceneContext> {
    context: Arc<Ctx>,
    log: Arc<Mutex<Vec<RecordingEntry>>>,
    subscription: Option<HandlerId>,
    started_at: Duration,
}

impl<Ctx: SceneContext> SceneRecording<Ctx> {
    pub fn new(context: Arc<Ctx>) -> Self {
        Self {
            context,
            log: Arc::new(Mutex::new(Vec::new())),
            subscription: None,
            started_at: Duration::ZERO,
        }
    }

    /// Starts recording `bus`, seeded with `seed` at time zero.
    ///
    /// A recording already in progress is stopped and discarded first.
    pub fn start(&mut self, bus: &EventBus, seed: &SceneInfo) {
        self.stop(bus);

        let started_at = self.context.now();
        self.started_at = started_at;
        {
            let mut log = lock(&self.log);
            log.clear();
            let seeded = seed.content_events().iter().chain(seed.view_events());
            log.extend(seeded.map(|event| RecordingEntry {
                elapsed: Duration::ZERO,
                event: event.clone(),
            }));
        }

        let context = self.context.clone();
        let log = self.log.clone();
        self.subscription = Some(bus.register_generic(move |event| {
            let elapsed = context.now().saturating_sub(started_at);
            lock(&log).push(RecordingEntry {
                elapsed,
                event: event.clone(),
            });
        }));
        info!(seeded = self.len(), "Recording started");
    }

    /// Stops appending. Entries recorded so far stay until flushed.
    pub fn stop(&mut self, bus: &EventBus) -> bool {
        match self.subscription.take() {
            Some(id) => {
                bus.unregister_generic(id);
                debug!(entries = self.len(), "Recording stopped");
                true
            }
            None => false,
        }
    }

    /// Takes every entry recorded so far, leaving an empty log.
    pub fn flush(&self) -> Vec<RecordingEntry> {
        std::mem::take(&mut *lock(&self.log))
    }

    pub fn is_recording(&self) -> bool {
        self.subscription.is_some()
    }

    /// Clock reading when the current recording started.
    pub fn started_at(&self) -> Duration {
        self.started_at
    }

    pub fn len(&self) -> usize {
        lock(&self.log).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.log).is_empty()
    }
}

/// Destination for flushed batches.
pub trait RecordingSink {
    fn write_batch(&mut self, batch: &[RecordingEntry]) -> Result<(), RecordingError>;
}

/// Writes one JSON object per entry, one entry per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: usize,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Entries written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RecordingSink for JsonLinesSink<W> {
    fn write_batch(&mut self, batch: &[RecordingEntry]) -> Result<(), RecordingError> {
        for entry in batch {
            serde_json::to_writer(&mut self.writer, entry)?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;
        self.written += batch.len();
        Ok(())
    }
}

/// Reads a recording written by [`JsonLinesSink`]. Blank lines are skipped.
pub fn read_json_lines<R: BufRead>(reader: R) -> Result<Vec<RecordingEntry>, RecordingError> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

/// Plays a recording back through a bus, driven by the caller's clock.
///
/// Every event is raised with the replay origin, so live sessions apply it
/// no matter who authored it.
#[derive(Debug, Default)]
pub struct RecordingPlayer {
    pending: VecDeque<RecordingEntry>,
    started_at: Option<Duration>,
    played: usize,
}

impl RecordingPlayer {
    pub fn new(mut entries: Vec<RecordingEntry>) -> Self {
        entries.sort_by_key(|entry| entry.elapsed);
        Self {
            pending: entries.into(),
            started_at: None,
            played: 0,
        }
    }

    /// Starts the playback clock at `now`.
    pub fn start(&mut self, now: Duration) {
        self.started_at = Some(now);
    }

    /// Raises every entry due by `now`. Starts the playback clock if it was
    /// not started. Returns how many entries were raised.
    pub fn advance(&mut self, now: Duration, bus: &EventBus) -> usize {
        let started_at = *self.started_at.get_or_insert(now);
        let position = now.saturating_sub(started_at);

        let mut raised = 0;
        while self
            .pending
            .front()
            .is_some_and(|entry| entry.elapsed <= position)
        {
            if let Some(entry) = self.pending.pop_front() {
                bus.raise(&entry.event.as_replay());
                raised += 1;
            }
        }
        self.played += raised;
        raised
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn played(&self) -> usize {
        self.played
    }

    pub fn is_finished(&self) -> bool {
        self.pending.is_empty()
    }
}
