//! Telemetry source for the conning stream
//!
//! Sentences are buffered up front and drained onto the telemetry sub-stream at
//! a fixed cadence. The drain is a cancellable repeating task: dropping the
//! [`DrainTask`] cancels it, and the owner checks the stream is still live
//! before writing each sentence it yields.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::model::stream::StreamId;

/// A short recorded track used when no sentence file is configured.
pub const SAMPLE_TRACK: &[&str] = &[
    "$GPRMC,083559.00,A,6009.0823,N,02457.2771,E,11.2,246.3,191026,,,A*61",
    "$GPGGA,083559.00,6009.0823,N,02457.2771,E,1,09,0.9,12.4,M,18.1,M,,*50",
    "$HEHDT,244.8,T*25",
    "$GPVTG,246.3,T,,M,11.2,N,20.7,K,A*09",
    "$IIROT,-1.4,A*0E",
    "$IIRSA,2.5,A,,*28",
    "$IIVBW,11.1,0.2,A,11.0,0.1,A*41",
    "$GPRMC,083600.00,A,6009.0781,N,02457.2635,E,11.3,246.1,191026,,,A*6B",
    "$HEHDT,244.6,T*2B",
    "$GPGGA,083600.00,6009.0781,N,02457.2635,E,1,09,0.9,12.3,M,18.1,M,,*5E",
];

/// Ordered sentences waiting to be shared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentenceBuffer {
    sentences: VecDeque<String>,
}

impl SentenceBuffer {
    pub fn new<I, S>(sentences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sentences: sentences.into_iter().map(Into::into).collect(),
        }
    }

    pub fn sample() -> Self {
        Self::new(SAMPLE_TRACK.iter().copied())
    }

    /// Reads one sentence per non-empty line.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        ))
    }

    pub fn pop_front(&mut self) -> Option<String> {
        self.sentences.pop_front()
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    /// A copy of what is buffered, leaving the buffer intact.
    pub fn snapshot(&self) -> VecDeque<String> {
        self.sentences.clone()
    }
}

/// Yields one sentence per `interval` until its queue is empty.
#[derive(Debug)]
pub struct DrainTask {
    stream: StreamId,
    pending: VecDeque<String>,
    interval: Duration,
    next: Option<Instant>,
}

impl DrainTask {
    /// The first sentence is due one `interval` after `now`.
    pub fn new(stream: StreamId, pending: VecDeque<String>, interval: Duration, now: Instant) -> Self {
        let next = (!pending.is_empty()).then(|| now + interval);
        Self {
            stream,
            pending,
            interval,
            next,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn is_finished(&self) -> bool {
        self.next.is_none()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.next
    }

    /// Returns the sentence due at `now`, if any, and schedules the next one.
    pub fn handle_timeout(&mut self, now: Instant) -> Option<String> {
        let due = self.next?;
        if now < due {
            return None;
        }
        let sentence = self.pending.pop_front();
        self.next = (!self.pending.is_empty()).then(|| now + self.interval);
        sentence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_track_is_valid_nmea() {
        for sentence in SAMPLE_TRACK {
            let (body, checksum) = sentence[1..].split_once('*').unwrap();
            let computed = body.bytes().fold(0u8, |acc, b| acc ^ b);
            assert_eq!(format!("{computed:02X}"), checksum, "{sentence}");
        }
    }

    #[test]
    fn drain_yields_one_sentence_per_tick() {
        let start = Instant::now();
        let second = Duration::from_secs(1);
        let mut drain = DrainTask::new(
            StreamId(1),
            SentenceBuffer::new(["a", "b", "c"]).snapshot(),
            second,
            start,
        );

        assert_eq!(drain.poll_timeout(), Some(start + second));
        assert_eq!(drain.handle_timeout(start), None);
        assert_eq!(drain.handle_timeout(start + second).as_deref(), Some("a"));
        assert_eq!(drain.handle_timeout(start + second), None);
        assert_eq!(drain.handle_timeout(start + second * 2).as_deref(), Some("b"));
        assert!(!drain.is_finished());
        assert_eq!(drain.handle_timeout(start + second * 3).as_deref(), Some("c"));
        assert!(drain.is_finished());
        assert_eq!(drain.handle_timeout(start + second * 4), None);
    }

    #[test]
    fn empty_drain_is_finished_immediately() {
        let drain = DrainTask::new(
            StreamId(1),
            VecDeque::new(),
            Duration::from_secs(1),
            Instant::now(),
        );
        assert!(drain.is_finished());
        assert_eq!(drain.poll_timeout(), None);
    }

    #[test]
    fn snapshot_leaves_buffer_intact() {
        let mut buffer = SentenceBuffer::sample();
        let first = buffer.pop_front();
        assert_eq!(first.as_deref(), Some(SAMPLE_TRACK[0]));
        assert_eq!(buffer.snapshot().len(), SAMPLE_TRACK.len() - 1);
        assert_eq!(buffer.len(), SAMPLE_TRACK.len() - 1);
    }
}
