use std::time::{Duration, Instant};

use super::message::{DataRecord, Message};

/// Accumulates records and releases them as one `RegularData` message.
///
/// With a zero timeout every push produces a message. Otherwise the batch is
/// released by the first push (or [`BatchingBuffer::poll_flush`]) after the
/// timeout has elapsed since the previous flush.
#[derive(Debug)]
pub struct BatchingBuffer {
    records: Vec<DataRecord>,
    timeout: Duration,
    last_flush: Instant,
}

impl BatchingBuffer {
    pub fn new(timeout: Duration) -> Self {
        Self::starting_at(timeout, Instant::now())
    }

    /// Create a buffer whose flush clock starts at `now`.
    pub fn starting_at(timeout: Duration, now: Instant) -> Self {
        Self {
            records: Vec::new(),
            timeout,
            last_flush: now,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Append a record, returning a batch if the flush policy fires.
    pub fn push(&mut self, record: DataRecord, now: Instant) -> Option<Message> {
        self.records.push(record);
        self.poll_flush(now)
    }

    /// Release the batch if it is due.
    pub fn poll_flush(&mut self, now: Instant) -> Option<Message> {
        if self.timeout.is_zero() || now.saturating_duration_since(self.last_flush) > self.timeout {
            self.flush_at(now)
        } else {
            None
        }
    }

    /// Release whatever is buffered, regardless of the timeout.
    pub fn flush(&mut self) -> Option<Message> {
        self.flush_at(Instant::now())
    }

    fn flush_at(&mut self, now: Instant) -> Option<Message> {
        if self.records.is_empty() {
            return None;
        }
        self.last_flush = now;
        Some(Message::RegularData(std::mem::take(&mut self.records)))
    }
}
