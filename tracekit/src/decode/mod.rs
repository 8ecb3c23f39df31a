//! Offline decoder (spec §6): reads a tracebuffer file written by the
//! emit path and turns its ring-buffer records into [`Event`]s.
//!
//! The decoder never touches the live cursors a concurrent emitter is
//! advancing: [`TracebufferSnapshot::open`] captures `last_valid`/`next_free`
//! once and walks that fixed range with a local cursor, so decoding the same
//! file twice (or decoding while a producer keeps appending past the
//! snapshot) yields the same event sequence every time (spec §6 "decoding
//! is deterministic"). This is why it reimplements the
//! `SEARCH_MAGIC -> VALIDATE_HEAD_CRC -> VALIDATE_BODY_CRC -> ACCEPT` walk
//! from [`crate::ring_buffer`] instead of calling `RingBuffer::get`, which
//! mutates `last_valid` and would race a live producer or drain the buffer
//! out from under a second decode pass.

pub mod event;
pub mod merge;
pub mod ordered;

use std::path::Path;
use std::sync::Arc;

use tracekit_common::{
    CatalogKind, RECORD_FRAME_OVERHEAD, RECORD_HEAD_SIZE, RECORD_MAGIC, RING_BUFFER_HEADER_SIZE,
    RING_BUFFER_VERSION,
};

pub use event::{Event, EventKind};
pub use merge::merge;
pub use ordered::OrderedBuffer;

use crate::catalog::{CatalogEntry, CatalogSource};
use crate::codec::{self, ArgValue};
use crate::error::{DecodeError, DecodeResult};
use crate::mapping::{self, MappedRegion};
use crate::os::OsAdapter;
use crate::record;
use crate::ring_buffer::{crc8_region, read_u16_at, read_u8_at};
use crate::unique_stack::UniqueStack;

use std::sync::atomic::Ordering;

/// One step of the decode-side scan over a fixed `[cursor, end)` range.
enum RawStep {
    Resync,
    /// Carries the record's body bytes even though its CRC didn't validate,
    /// so the resulting `Error` event can still point at them (spec §4.6
    /// "Error ... carrying the raw bytes").
    BadBodyCrc(Vec<u8>),
    Record(Vec<u8>),
}

/// A one-shot, read-only walk over the records an emitter had published at
/// the moment [`Self::open`] was called (spec §6).
pub struct TracebufferSnapshot {
    name: String,
    region: Arc<MappedRegion>,
    body_size: u64,
    stack: UniqueStack,
    catalog: Arc<dyn CatalogSource>,
    cursor: u64,
    end: u64,
    ordinal: u64,
}

impl TracebufferSnapshot {
    /// Opens `path` as a decoder would see the tracebuffer an emitter bound
    /// with `ring_space_size` (the same value passed to
    /// [`crate::tracebuffer::Tracebuffer::bind`]), resolving static catalog
    /// entries through `catalog` and dynamic ones through the file's own
    /// unique stack.
    pub fn open(
        path: &Path,
        name: &str,
        ring_space_size: u64,
        catalog: Arc<dyn CatalogSource>,
        os: Arc<dyn OsAdapter>,
    ) -> DecodeResult<Self> {
        if ring_space_size < RING_BUFFER_HEADER_SIZE as u64 {
            return Err(DecodeError::InvalidTracebuffer(format!(
                "ring space size {ring_space_size} smaller than header"
            )));
        }
        let region = Arc::new(mapping::open_existing(path)?);
        if region.len() < ring_space_size {
            return Err(DecodeError::InvalidTracebuffer(format!(
                "file shorter ({}) than declared ring space ({ring_space_size})",
                region.len()
            )));
        }
        let body_size = ring_space_size - RING_BUFFER_HEADER_SIZE as u64;

        let (version, declared_body, last_valid, next_free) = region.with_ptr(|base, _len| {
            let header = unsafe { &*(base as *const tracekit_common::RingBufferHeader) };
            (
                header.version.load(Ordering::Acquire),
                header.body_size.load(Ordering::Acquire),
                header.last_valid.load(Ordering::Acquire),
                header.next_free.load(Ordering::Acquire),
            )
        });
        if version != RING_BUFFER_VERSION || declared_body != body_size {
            return Err(DecodeError::InvalidTracebuffer(format!(
                "ring buffer header mismatch for {name:?}: version={version} body_size={declared_body}"
            )));
        }

        let stack = UniqueStack::open(Arc::clone(&region), ring_space_size, os)
            .map_err(|e| DecodeError::InvalidTracebuffer(e.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            region,
            body_size,
            stack,
            catalog,
            cursor: last_valid,
            end: next_free,
            ordinal: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn next_ordinal(&mut self) -> u64 {
        let ordinal = self.ordinal;
        self.ordinal += 1;
        ordinal
    }

    fn raw_step(&mut self) -> Option<RawStep> {
        if self.cursor == self.end {
            return None;
        }
        let body_size = self.body_size;
        let cursor = self.cursor;
        let end = self.end;
        let (step, next_cursor) = self.region.with_ptr(|base, _len| {
            let body = unsafe { base.add(RING_BUFFER_HEADER_SIZE) };
            decode_step(body, body_size, cursor, end)
        });
        self.cursor = next_cursor;
        Some(step)
    }

    fn error(
        &mut self,
        timestamp_ns: u64,
        pid: u32,
        tid: u32,
        message: String,
        raw_bytes: Option<Vec<u8>>,
    ) -> Event {
        let ordinal = self.next_ordinal();
        Event {
            kind: EventKind::Error,
            tracebuffer: self.name.clone(),
            ordinal,
            timestamp_ns,
            pid,
            tid,
            source_file: String::new(),
            source_line: 0,
            rendered_message: message,
            raw_bytes,
        }
    }

    fn resolve_dynamic(&self, relative_offset: u32) -> Option<Arc<CatalogEntry>> {
        let absolute = self.stack.absolute_offset(relative_offset);
        let bytes = self.stack.read_verified(absolute)?;
        CatalogEntry::deserialize(&bytes).map(Arc::new)
    }

    fn resolve(&mut self, raw: &[u8]) -> Event {
        let Some((prefix, arg_blob)) = record::decode_prefix(raw) else {
            return self.error(
                0,
                0,
                0,
                "truncated record prefix".to_string(),
                Some(raw.to_vec()),
            );
        };

        let (entry, kind) = match self.catalog.entry(&self.name, prefix.catalog_offset) {
            Some(entry) => (Some(entry), EventKind::Static),
            None => match self.resolve_dynamic(prefix.catalog_offset) {
                Some(entry) => (Some(entry), EventKind::Dynamic),
                None => (None, EventKind::Error),
            },
        };
        let Some(entry) = entry else {
            return self.error(
                prefix.timestamp_ns,
                prefix.pid,
                prefix.tid,
                format!("no catalog entry at offset {}", prefix.catalog_offset),
                Some(arg_blob.to_vec()),
            );
        };

        let (ok, message) = render_entry(&entry, arg_blob);
        if !ok {
            return self.error(
                prefix.timestamp_ns,
                prefix.pid,
                prefix.tid,
                message,
                Some(arg_blob.to_vec()),
            );
        }
        let ordinal = self.next_ordinal();
        Event {
            kind,
            tracebuffer: self.name.clone(),
            ordinal,
            timestamp_ns: prefix.timestamp_ns,
            pid: prefix.pid,
            tid: prefix.tid,
            source_file: entry.source_file.clone(),
            source_line: entry.source_line,
            rendered_message: message,
            raw_bytes: None,
        }
    }
}

impl Iterator for TracebufferSnapshot {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            match self.raw_step()? {
                RawStep::Resync => continue,
                RawStep::BadBodyCrc(raw) => {
                    return Some(self.error(
                        0,
                        0,
                        0,
                        "record body failed CRC validation".to_string(),
                        Some(raw),
                    ));
                }
                RawStep::Record(raw) => return Some(self.resolve(&raw)),
            }
        }
    }
}

/// Decodes the argument blob against `entry`'s declared types and renders
/// the result. `Ok` half of the tuple mirrors `TypeCheck::flex` semantics:
/// a mismatch never panics, it just produces an `Error`-worthy message.
fn render_entry(entry: &CatalogEntry, arg_blob: &[u8]) -> (bool, String) {
    let mut args = Vec::with_capacity(entry.arg_types.len());
    let mut cursor = 0usize;
    for ty in &entry.arg_types {
        match arg_blob.get(cursor..).and_then(|rest| codec::decode_arg(*ty, rest)) {
            Some((value, consumed)) => {
                args.push(value);
                cursor += consumed;
            }
            None => return (false, format!("truncated argument of type {ty:?}")),
        }
    }

    match entry.kind {
        CatalogKind::Printf => match codec::render(&entry.format_or_label, &args) {
            Some(rendered) => (true, rendered),
            None => (
                false,
                format!(
                    "format/argument mismatch rendering \"{}\"",
                    entry.format_or_label
                ),
            ),
        },
        CatalogKind::Dump => {
            let bytes = match args.first() {
                Some(ArgValue::Dump(bytes)) => bytes.clone(),
                _ => return (false, "dump tracepoint missing its payload argument".to_string()),
            };
            let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
            (
                true,
                format!("{}: {} bytes [{}]", entry.format_or_label, bytes.len(), hex.join(" ")),
            )
        }
    }
}

/// One step of the `SEARCH_MAGIC -> VALIDATE_HEAD_CRC -> VALIDATE_BODY_CRC
/// -> ACCEPT` walk over `[cursor, end)`, without mutating any shared state;
/// mirrors [`crate::ring_buffer`]'s internal `scan_step` one-for-one, minus
/// the header-atomic side effects that function uses for live eviction.
fn decode_step(body: *mut u8, body_size: u64, cursor: u64, end: u64) -> (RawStep, u64) {
    let occupied = (end + body_size - cursor) % body_size;

    let magic = read_u8_at(body, body_size, cursor);
    if magic != RECORD_MAGIC {
        return (RawStep::Resync, (cursor + 1) % body_size);
    }
    if occupied < RECORD_FRAME_OVERHEAD as u64 {
        return (RawStep::Resync, (cursor + 1) % body_size);
    }

    let body_len = read_u16_at(body, body_size, cursor + 1) as u64;
    let head_crc_stored = read_u8_at(body, body_size, cursor + 3);
    let head_crc_computed = crc8_region(body, body_size, cursor, 3);
    if head_crc_stored != head_crc_computed {
        return (RawStep::Resync, (cursor + 1) % body_size);
    }

    let frame_len = RECORD_FRAME_OVERHEAD as u64 + body_len;
    if frame_len > occupied {
        return (RawStep::Resync, (cursor + 1) % body_size);
    }

    let body_crc_stored = read_u8_at(body, body_size, cursor + 4 + body_len);
    let body_crc_computed = crc8_region(body, body_size, cursor + 4, body_len);
    if body_crc_stored != body_crc_computed {
        // Still worth recovering: the bytes failed their CRC, not their
        // bounds check, so they're readable even if not trustworthy.
        let mut raw = vec![0u8; body_len as usize];
        for (i, slot) in raw.iter_mut().enumerate() {
            *slot = read_u8_at(body, body_size, cursor + 4 + i as u64);
        }
        // Matches `ring_buffer::scan_step`'s own `DroppedBadHead` advance: skip
        // past the head we already validated rather than re-reading it.
        return (RawStep::BadBodyCrc(raw), (cursor + RECORD_HEAD_SIZE as u64) % body_size);
    }

    let mut raw = vec![0u8; body_len as usize];
    for (i, slot) in raw.iter_mut().enumerate() {
        *slot = read_u8_at(body, body_size, cursor + 4 + i as u64);
    }
    (RawStep::Record(raw), (cursor + frame_len) % body_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::codec::IntoArg;
    use crate::config::Config;
    use crate::os::UnixOsAdapter;
    use crate::tracebuffer::Tracebuffer;
    use tracekit_common::ArgType;

    fn catalog_with(tracebuffer: &str, entry: CatalogEntry) -> (Arc<dyn CatalogSource>, u32) {
        let mut catalog = StaticCatalog::new();
        catalog.register(tracebuffer, 0, entry);
        (Arc::new(catalog), 0)
    }

    #[test]
    fn decodes_a_simple_static_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            tracing_path: dir.path().to_path_buf(),
            verbosity: Default::default(),
        };
        let tb = Tracebuffer::bind_with(
            "decodetest",
            4096,
            &config,
            Arc::new(UnixOsAdapter),
        )
        .unwrap();

        let mut body = Vec::new();
        record::encode_prefix(
            record::RecordPrefix {
                pid: 1,
                tid: 2,
                timestamp_ns: 100,
                catalog_offset: 0,
            },
            &mut body,
        );
        let mut arg = Vec::new();
        7u32.encode_into(&mut arg);
        body.extend_from_slice(&arg);
        tb.ring().put(&body);

        let (catalog, offset) = catalog_with(
            "decodetest",
            CatalogEntry {
                kind: CatalogKind::Printf,
                source_file: "src/main.rs".to_string(),
                source_line: 9,
                arg_types: vec![ArgType::U32],
                format_or_label: "n=%u".to_string(),
                flex: false,
            },
        );
        assert_eq!(offset, 0);

        let path = dir.path().join("decodetest.clltk_trace");
        let snapshot = TracebufferSnapshot::open(
            &path,
            "decodetest",
            4096,
            catalog,
            Arc::new(UnixOsAdapter),
        )
        .unwrap();
        let events: Vec<Event> = snapshot.collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Static);
        assert_eq!(events[0].rendered_message, "n=7");
        assert_eq!(events[0].pid, 1);
        assert_eq!(events[0].timestamp_ns, 100);
    }

    #[test]
    fn decodes_a_dynamic_record_through_the_unique_stack() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            tracing_path: dir.path().to_path_buf(),
            verbosity: Default::default(),
        };
        let tb = Tracebuffer::bind_with(
            "decodedyn",
            4096,
            &config,
            Arc::new(UnixOsAdapter),
        )
        .unwrap();

        crate::emit::emit_dynamic(
            "decodedyn",
            "src/dyn.rs",
            5,
            None,
            None,
            "hello %s",
            &[&"world".to_string() as &dyn crate::codec::IntoArg],
        );

        let path = dir.path().join("decodedyn.clltk_trace");
        let empty_catalog: Arc<dyn CatalogSource> = Arc::new(StaticCatalog::new());
        let snapshot = TracebufferSnapshot::open(
            &path,
            "decodedyn",
            4096,
            empty_catalog,
            Arc::new(UnixOsAdapter),
        )
        .unwrap();
        let events: Vec<Event> = snapshot.collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Dynamic);
        assert_eq!(events[0].rendered_message, "hello world");
        assert_eq!(events[0].source_line, 5);
    }

    #[test]
    fn corrupted_body_yields_one_error_event_and_resyncs() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            tracing_path: dir.path().to_path_buf(),
            verbosity: Default::default(),
        };
        let tb = Tracebuffer::bind_with(
            "decodecorrupt",
            4096,
            &config,
            Arc::new(UnixOsAdapter),
        )
        .unwrap();

        let (catalog, _) = catalog_with(
            "decodecorrupt",
            CatalogEntry {
                kind: CatalogKind::Printf,
                source_file: "src/main.rs".to_string(),
                source_line: 1,
                arg_types: vec![],
                format_or_label: "tick".to_string(),
                flex: false,
            },
        );

        let mut body = Vec::new();
        record::encode_prefix(
            record::RecordPrefix {
                pid: 1,
                tid: 1,
                timestamp_ns: 1,
                catalog_offset: 0,
            },
            &mut body,
        );
        tb.ring().put(&body);
        tb.ring().put(&body);

        let path = dir.path().join("decodecorrupt.clltk_trace");
        // Flip a byte inside the first record's body, through a second
        // mapping of the same file, so its body CRC fails.
        let raw_region = mapping::open_existing(&path).unwrap();
        raw_region.with_ptr(|base, _len| unsafe {
            *base.add(RING_BUFFER_HEADER_SIZE + 4) ^= 0xFF;
        });

        let snapshot = TracebufferSnapshot::open(
            &path,
            "decodecorrupt",
            4096,
            catalog,
            Arc::new(UnixOsAdapter),
        )
        .unwrap();
        let events: Vec<Event> = snapshot.collect();
        assert!(events.iter().any(|e| e.kind == EventKind::Static));
        let error = events.iter().find(|e| e.kind == EventKind::Error).unwrap();
        let raw = error.raw_bytes.as_ref().expect("bad body CRC should retain raw bytes");
        assert_eq!(raw.len(), body.len());
        assert_ne!(raw, &body, "corrupted byte should be visible in the retained raw bytes");
    }

    #[test]
    fn argument_width_mismatch_yields_error_with_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            tracing_path: dir.path().to_path_buf(),
            verbosity: Default::default(),
        };
        let tb = Tracebuffer::bind_with(
            "decodewidthmismatch",
            4096,
            &config,
            Arc::new(UnixOsAdapter),
        )
        .unwrap();

        // Catalog claims a u64 argument, but the record only carries a u8.
        let (catalog, _) = catalog_with(
            "decodewidthmismatch",
            CatalogEntry {
                kind: CatalogKind::Printf,
                source_file: "src/main.rs".to_string(),
                source_line: 1,
                arg_types: vec![ArgType::U64],
                format_or_label: "n=%lu".to_string(),
                flex: false,
            },
        );

        let mut body = Vec::new();
        record::encode_prefix(
            record::RecordPrefix {
                pid: 1,
                tid: 1,
                timestamp_ns: 1,
                catalog_offset: 0,
            },
            &mut body,
        );
        let mut arg = Vec::new();
        7u8.encode_into(&mut arg);
        body.extend_from_slice(&arg);
        tb.ring().put(&body);

        let path = dir.path().join("decodewidthmismatch.clltk_trace");
        let snapshot = TracebufferSnapshot::open(
            &path,
            "decodewidthmismatch",
            4096,
            catalog,
            Arc::new(UnixOsAdapter),
        )
        .unwrap();
        let events: Vec<Event> = snapshot.collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Error);
        let raw = events[0]
            .raw_bytes
            .as_ref()
            .expect("width mismatch should retain raw argument bytes");
        assert_eq!(raw, &arg);
    }
}
