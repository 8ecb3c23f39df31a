//! Live-streaming ordered buffer (spec §6 "a live decoder may buffer
//! recently-seen events and release them once a watermark minus a grace
//! delay has passed, bounding memory by dropping the oldest buffered event
//! first when full").
//!
//! Unlike [`super::merge`], which assumes every source has already finished
//! producing its events, a live decoder sees events trickle in from
//! multiple tracebuffers with no guarantee they arrive time-ordered across
//! sources. `OrderedBuffer` holds what it has seen so far and only lets a
//! caller drain events once it's confident (within `delay_ns`) that nothing
//! older will still arrive.

use super::Event;

/// Accumulates events out of arrival order and releases them in
/// `timestamp_ns` order once they're older than the current watermark minus
/// `delay_ns`. Bounded to `capacity` buffered events; past that, the
/// newest-by-timestamp buffered event is dropped to make room (spec §6:
/// "bounded, oldest-drop" -- "oldest" here means furthest from being
/// releasable, i.e. the one with the highest timestamp).
pub struct OrderedBuffer {
    /// Always sorted ascending by `timestamp_ns`.
    buffered: Vec<Event>,
    capacity: usize,
    delay_ns: u64,
    watermark_ns: u64,
    dropped: u64,
}

impl OrderedBuffer {
    pub fn new(capacity: usize, delay_ns: u64) -> Self {
        Self {
            buffered: Vec::with_capacity(capacity),
            capacity,
            delay_ns,
            watermark_ns: 0,
            dropped: 0,
        }
    }

    /// Number of events dropped so far because the buffer was at capacity
    /// when a newer event arrived.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Admits one newly-arrived event, advancing the watermark and evicting
    /// the buffered event furthest from release if now over capacity.
    pub fn push(&mut self, event: Event) {
        self.watermark_ns = self.watermark_ns.max(event.timestamp_ns);
        let pos = self
            .buffered
            .partition_point(|buffered| buffered.timestamp_ns <= event.timestamp_ns);
        self.buffered.insert(pos, event);
        if self.buffered.len() > self.capacity {
            self.buffered.pop();
            self.dropped += 1;
        }
    }

    /// Drains every buffered event older than `watermark - delay_ns`, in
    /// `timestamp_ns` order.
    pub fn drain_ready(&mut self) -> Vec<Event> {
        let threshold = self.watermark_ns.saturating_sub(self.delay_ns);
        let split = self
            .buffered
            .partition_point(|event| event.timestamp_ns <= threshold);
        self.buffered.drain(..split).collect()
    }

    /// Flushes every remaining buffered event, regardless of watermark, for
    /// use once the stream has ended.
    pub fn drain_all(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.buffered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::EventKind;

    fn event(tracebuffer: &str, ordinal: u64, timestamp_ns: u64) -> Event {
        Event {
            kind: EventKind::Static,
            tracebuffer: tracebuffer.to_string(),
            ordinal,
            timestamp_ns,
            pid: 0,
            tid: 0,
            source_file: String::new(),
            source_line: 0,
            rendered_message: String::new(),
            raw_bytes: None,
        }
    }

    #[test]
    fn releases_only_once_past_the_watermark_delay() {
        let mut buffer = OrderedBuffer::new(16, 100);
        buffer.push(event("a", 0, 50));
        buffer.push(event("a", 1, 80));
        assert!(buffer.drain_ready().is_empty());
        buffer.push(event("a", 2, 200));
        let ready = buffer.drain_ready();
        let timestamps: Vec<u64> = ready.iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(timestamps, vec![50, 80]);
    }

    #[test]
    fn drain_all_flushes_remaining_events_in_order() {
        let mut buffer = OrderedBuffer::new(16, 1_000_000);
        buffer.push(event("a", 0, 30));
        buffer.push(event("a", 1, 10));
        buffer.push(event("a", 2, 20));
        let all = buffer.drain_all();
        let timestamps: Vec<u64> = all.iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
    }

    #[test]
    fn overflow_drops_the_newest_arrival_and_counts_it() {
        let mut buffer = OrderedBuffer::new(2, 1_000_000);
        buffer.push(event("a", 0, 10));
        buffer.push(event("a", 1, 20));
        buffer.push(event("a", 2, 30));
        assert_eq!(buffer.dropped(), 1);
        let all = buffer.drain_all();
        let timestamps: Vec<u64> = all.iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(timestamps, vec![10, 20]);
    }
}
