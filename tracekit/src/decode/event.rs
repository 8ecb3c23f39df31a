//! Decoded event shape (spec §4.7): one `Event` per successfully (or
//! unsuccessfully) decoded ring-buffer record.

/// Where a record's metadata came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    /// Catalog entry came from a build-time-supplied `CatalogSource`.
    Static,
    /// Catalog entry was synthesised at emit time and resolved through the
    /// unique stack.
    Dynamic,
    /// Integrity or shape failure; `rendered_message` carries a
    /// human-readable summary, not the event's real payload.
    Error,
}

/// One decoded record (spec §4.7 `Event { kind, tracebuffer, ordinal,
/// timestamp_ns, pid, tid, source_file, source_line, rendered_message }`).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    pub kind: EventKind,
    pub tracebuffer: String,
    /// Position of this record within its tracebuffer's stream, counted
    /// from the snapshot's starting cursor; used as the merge tie-break.
    pub ordinal: u64,
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub source_file: String,
    pub source_line: u32,
    pub rendered_message: String,
    /// Set on `Error` events that still had recoverable record bytes to
    /// point to (spec §4.6 "yields an `Error` event carrying the raw
    /// bytes"): an argument-width mismatch, an unresolvable catalog
    /// offset, or a body that failed its CRC. `None` when there was
    /// nothing to recover, or for non-`Error` kinds.
    pub raw_bytes: Option<Vec<u8>>,
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use super::*;

    #[test]
    fn serde_round_trips_through_json() {
        let event = Event {
            kind: EventKind::Error,
            tracebuffer: "scenario5".to_string(),
            ordinal: 3,
            timestamp_ns: 123,
            pid: 1,
            tid: 1,
            source_file: "src/main.rs".to_string(),
            source_line: 42,
            rendered_message: "record body failed CRC validation".to_string(),
            raw_bytes: Some(vec![1, 2, 3, 4]),
        };
        let json = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(event, decoded);
    }
}
