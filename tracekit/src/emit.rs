//! Static and dynamic record-emission paths (spec §4.5): owns the record
//! layout written into a tracebuffer's ring buffer. The emit path never
//! surfaces errors to its caller (spec §7) — every failure mode here drops
//! the record and lets the ring buffer's own counters account for it.
//!
//! Signal-safety (spec §9): encoding writes into a thread-local scratch
//! buffer reused across calls rather than a fresh heap allocation every
//! time, approximating the "pre-allocated thread-local buffer sized to
//! `UINT16_MAX`" the spec calls for. True async-signal safety would also
//! require the registry/catalog lookups below to be lock-free; this port
//! accepts that gap for `emit_dynamic`'s first call at a given site (the
//! same one-time-cost shape as the type-check cache in `codec.rs`) and
//! records it in DESIGN.md rather than pretending otherwise.

use std::cell::RefCell;

use tracekit_common::ArgType;

use crate::codec::{self, Dump, IntoArg};
use crate::record::{self, RecordPrefix, MAX_EMIT_BODY, RECORD_PREFIX_SIZE};
use crate::tracebuffer::Tracebuffer;
use crate::tracepoint::TracepointSlot;

thread_local! {
    static SCRATCH: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(u16::MAX as usize));
}

/// Static `emit_printf(tb, catalog_entry, args...)` (spec §4.5).
pub fn emit_printf(tb: &Tracebuffer, slot: &TracepointSlot, args: &[&dyn IntoArg]) {
    let os = tb.os();
    let timestamp_ns = os.now_ns();
    let pid = os.pid();
    let tid = os.tid();

    let mut arg_types: Vec<ArgType> = Vec::with_capacity(args.len());
    let mut chunks: Vec<Vec<u8>> = Vec::with_capacity(args.len());
    for arg in args {
        let mut buf = Vec::new();
        arg.encode_into(&mut buf);
        arg_types.push(arg.arg_type());
        chunks.push(buf);
    }

    let catalog_offset = slot.offset(tb.name(), &arg_types);

    let mut total: usize = chunks.iter().map(Vec::len).sum();
    // Truncate variable-length args from the right until it fits (spec
    // §4.5 step 4); no truncation flag is recorded, matching the spec.
    while RECORD_PREFIX_SIZE + total > MAX_EMIT_BODY && !chunks.is_empty() {
        total -= chunks.pop().unwrap().len();
    }

    SCRATCH.with(|scratch| {
        let mut body = scratch.borrow_mut();
        body.clear();
        record::encode_prefix(
            RecordPrefix {
                pid,
                tid,
                timestamp_ns,
                catalog_offset,
            },
            &mut body,
        );
        for chunk in &chunks {
            body.extend_from_slice(chunk);
        }
        tb.ring().put(&body);
    });
}

/// Static `emit_dump(tb, label_entry, ptr, n)` (spec §4.5): payload is a
/// 4-byte length followed by `n` raw bytes, encoded the same way any other
/// `dump`-typed argument would be, with no other arguments alongside it.
pub fn emit_dump(tb: &Tracebuffer, slot: &TracepointSlot, data: &[u8]) {
    let args: [&dyn IntoArg; 1] = [&Dump(data)];
    emit_printf(tb, slot, &args);
}

/// Dynamic `emit_dynamic(name, source_file, source_line, pid_override,
/// tid_override, format, args...)` (spec §4.5): looks up the tracebuffer
/// by name (no-op if absent) and synthesises its catalog entry on the fly,
/// storing the format string and the serialized entry itself in the
/// unique stack.
#[allow(clippy::too_many_arguments)]
pub fn emit_dynamic(
    name: &str,
    source_file: &str,
    source_line: u32,
    pid_override: Option<u32>,
    tid_override: Option<u32>,
    format: &str,
    args: &[&dyn IntoArg],
) {
    let Some(tb) = Tracebuffer::lookup(name) else {
        return;
    };

    let mut arg_types: Vec<ArgType> = Vec::with_capacity(args.len());
    let mut chunks: Vec<Vec<u8>> = Vec::with_capacity(args.len());
    for arg in args {
        let mut buf = Vec::new();
        arg.encode_into(&mut buf);
        arg_types.push(arg.arg_type());
        chunks.push(buf);
    }

    let catalog_offset = match tb.dynamic_offset(source_file, source_line, format) {
        Some(offset) => offset,
        None => {
            // Same cross-check as the static path (spec §4.6): the format
            // string's derived tags win over the caller's when they
            // disagree, and `flex` records that for the decoder.
            let format_derived = codec::format_derived_types(format);
            let (effective_types, flex) = if format_derived != arg_types {
                (format_derived, true)
            } else {
                (arg_types.clone(), false)
            };
            let entry = crate::catalog::CatalogEntry {
                kind: tracekit_common::CatalogKind::Printf,
                source_file: source_file.to_string(),
                source_line,
                arg_types: effective_types,
                format_or_label: format.to_string(),
                flex,
            };
            // The entry itself is serialized and stored in the unique
            // stack; its relative offset becomes the record's
            // `catalog_offset` (spec §4.5 step 2).
            let Ok(absolute) = tb.stack().add(&entry.serialize()) else {
                return;
            };
            let offset = tb.stack().relative_offset(absolute);
            tb.cache_dynamic_offset(source_file, source_line, format, offset);
            offset
        }
    };

    let os = tb.os();
    let timestamp_ns = os.now_ns();
    let pid = pid_override.unwrap_or_else(|| os.pid());
    let tid = tid_override.unwrap_or_else(|| os.tid());

    let mut total: usize = chunks.iter().map(Vec::len).sum();
    while RECORD_PREFIX_SIZE + total > MAX_EMIT_BODY && !chunks.is_empty() {
        total -= chunks.pop().unwrap().len();
    }

    SCRATCH.with(|scratch| {
        let mut body = scratch.borrow_mut();
        body.clear();
        record::encode_prefix(
            RecordPrefix {
                pid,
                tid,
                timestamp_ns,
                catalog_offset,
            },
            &mut body,
        );
        for chunk in &chunks {
            body.extend_from_slice(chunk);
        }
        tb.ring().put(&body);
    });
}
