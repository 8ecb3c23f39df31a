//! K-way merge across tracebuffers (spec §6 "merge by `timestamp_ns`, ties
//! broken by `(tracebuffer name, ordinal)`").

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use super::Event;

/// One entry in the merge heap: the next not-yet-emitted event from a
/// single source, plus which source it came from (so we know where to pull
/// the next one once this one is emitted).
struct HeapItem<I> {
    event: Event,
    source: usize,
    iter: I,
}

impl<I> PartialEq for HeapItem<I> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_key() == other.cmp_key()
    }
}
impl<I> Eq for HeapItem<I> {}

impl<I> HeapItem<I> {
    fn cmp_key(&self) -> (u64, &str, u64) {
        (self.event.timestamp_ns, &self.event.tracebuffer, self.event.ordinal)
    }
}

impl<I> PartialOrd for HeapItem<I> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<I> Ord for HeapItem<I> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // `BinaryHeap` is a max-heap; reverse so the earliest event sorts
        // highest and comes out first.
        other.cmp_key().cmp(&self.cmp_key())
    }
}

/// Merges any number of per-tracebuffer event iterators (typically
/// [`super::TracebufferSnapshot`]s) into a single stream ordered by
/// `timestamp_ns`, ties broken by `(tracebuffer, ordinal)` (spec §6).
///
/// Each source must itself already yield events in non-decreasing ordinal
/// order, which every [`super::TracebufferSnapshot`] does by construction.
pub fn merge<I>(sources: Vec<I>) -> impl Iterator<Item = Event>
where
    I: Iterator<Item = Event>,
{
    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (source, mut iter) in sources.into_iter().enumerate() {
        if let Some(event) = iter.next() {
            heap.push(HeapItem { event, source, iter });
        }
    }
    std::iter::from_fn(move || {
        let HeapItem { event, source, mut iter } = heap.pop()?;
        if let Some(next_event) = iter.next() {
            heap.push(HeapItem {
                event: next_event,
                source,
                iter,
            });
        }
        Some(event)
    })
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
    fn merges_in_timestamp_order_across_sources() {
        let a = vec![event("a", 0, 10), event("a", 1, 30)].into_iter();
        let b = vec![event("b", 0, 20), event("b", 1, 40)].into_iter();
        let merged: Vec<Event> = merge(vec![a, b]).collect();
        let timestamps: Vec<u64> = merged.iter().map(|e| e.timestamp_ns).collect();
        assert_eq!(timestamps, vec![10, 20, 30, 40]);
    }

    #[test]
    fn ties_break_on_tracebuffer_name_then_ordinal() {
        let a = vec![event("alpha", 0, 100)].into_iter();
        let b = vec![event("beta", 0, 100)].into_iter();
        let merged: Vec<Event> = merge(vec![b, a]).collect();
        assert_eq!(merged[0].tracebuffer, "alpha");
        assert_eq!(merged[1].tracebuffer, "beta");
    }

    #[test]
    fn empty_sources_produce_no_events() {
        let empty: Vec<std::vec::IntoIter<Event>> = Vec::new();
        assert_eq!(merge(empty).count(), 0);
    }
}
