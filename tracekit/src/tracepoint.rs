//! Per-call-site tracepoint metadata and the default, in-process catalog
//! that assigns it a stable offset (spec §9 "generate one catalog entry
//! per call site... producing, at compile time, `{tags[], format, file,
//! line}`").
//!
//! A real deployment supplies its own build-time-generated `CatalogSource`
//! (out of scope here, per spec §1); this module is the standalone
//! fallback the [`crate::tracepoint!`] macro and tests use when no such
//! toolchain step exists, registering each call site's entry into a
//! process-wide [`StaticCatalog`] the first time it fires and caching the
//! offset locally afterwards so steady-state emission never touches the
//! registry lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::{Lazy, OnceCell};
use tracekit_common::{ArgType, CatalogKind};

use crate::catalog::{CatalogEntry, CatalogSource, StaticCatalog};
use crate::codec::{self, TypeCheck};

struct DefaultRegistry {
    catalog: StaticCatalog,
    next_offset: HashMap<String, u32>,
}

static REGISTRY: Lazy<Mutex<DefaultRegistry>> = Lazy::new(|| {
    Mutex::new(DefaultRegistry {
        catalog: StaticCatalog::new(),
        next_offset: HashMap::new(),
    })
});

fn register(tracebuffer: &str, entry: CatalogEntry) -> u32 {
    let mut guard = REGISTRY.lock().unwrap();
    let offset = *guard
        .next_offset
        .entry(tracebuffer.to_string())
        .and_modify(|n| *n += 1)
        .or_insert(0);
    guard.catalog.register(tracebuffer, offset, entry);
    offset
}

/// [`CatalogSource`] view onto the process-wide default registry, for
/// decoders running in the same process as the emitter (the common case in
/// this crate's own test suite and for embedders that don't ship a
/// separate build-time catalog).
pub struct DefaultCatalogSource;

impl CatalogSource for DefaultCatalogSource {
    fn entry(&self, tracebuffer: &str, offset: u32) -> Option<Arc<CatalogEntry>> {
        REGISTRY.lock().unwrap().catalog.entry(tracebuffer, offset)
    }
}

/// Static metadata for one `tracepoint!`/`dump_tracepoint!` call site: the
/// source location and format/label are compile-time constants, while the
/// catalog offset and the format/caller type cross-check are resolved (and
/// cached) the first time the call site actually emits.
pub struct TracepointSlot {
    kind: CatalogKind,
    source_file: &'static str,
    source_line: u32,
    format_or_label: &'static str,
    offset: OnceCell<u32>,
    type_check: OnceCell<TypeCheck>,
}

impl TracepointSlot {
    pub const fn new(
        kind: CatalogKind,
        source_file: &'static str,
        source_line: u32,
        format_or_label: &'static str,
    ) -> Self {
        Self {
            kind,
            source_file,
            source_line,
            format_or_label,
            offset: OnceCell::new(),
            type_check: OnceCell::new(),
        }
    }

    pub fn format_or_label(&self) -> &'static str {
        self.format_or_label
    }

    /// Resolves this call site's catalog offset within `tracebuffer`,
    /// registering it into the default catalog on first use. For a
    /// `Printf` site, the one-time format/caller cross-check (spec §4.6)
    /// decides whether the registered `arg_types` come from the caller or
    /// from parsing the format string: on mismatch the format wins, and
    /// the entry's `flex` flag records that for the decoder.
    pub fn offset(&self, tracebuffer: &str, arg_types: &[ArgType]) -> u32 {
        *self.offset.get_or_init(|| {
            let (effective_types, flex) = match self.kind {
                CatalogKind::Printf => {
                    let check = self.type_check(arg_types);
                    if check.flex {
                        (check.format_derived.clone(), true)
                    } else {
                        (arg_types.to_vec(), false)
                    }
                }
                CatalogKind::Dump => (arg_types.to_vec(), false),
            };
            register(
                tracebuffer,
                CatalogEntry {
                    kind: self.kind,
                    source_file: self.source_file.to_string(),
                    source_line: self.source_line,
                    arg_types: effective_types,
                    format_or_label: self.format_or_label.to_string(),
                    flex,
                },
            )
        })
    }

    /// The cached format/caller type cross-check (spec §4.6), computed
    /// once per call site.
    pub fn type_check(&self, caller_types: &[ArgType]) -> &TypeCheck {
        codec::check_or_cache(&self.type_check, self.format_or_label, caller_types)
    }
}

/// Builds a static `printf`-kind tracepoint's `{tags[], format, file,
/// line}` tuple at the call site and emits it (spec §4.5/§9). Expands to
/// a call to [`crate::emit::emit_printf`]; arguments are borrowed, never
/// boxed, so expansion allocates nothing beyond what `IntoArg::encode_into`
/// itself needs.
#[macro_export]
macro_rules! tracepoint {
    ($tb:expr, $format:expr $(, $arg:expr)* $(,)?) => {{
        static SLOT: $crate::tracepoint::TracepointSlot = $crate::tracepoint::TracepointSlot::new(
            $crate::__private::CatalogKind::Printf,
            file!(),
            line!(),
            $format,
        );
        let args: &[&dyn $crate::codec::IntoArg] = &[$(&$arg),*];
        $crate::emit::emit_printf($tb, &SLOT, args)
    }};
}

/// Builds a static `dump`-kind tracepoint and emits a raw byte payload
/// with a label (spec §4.5 `emit_dump`).
#[macro_export]
macro_rules! dump_tracepoint {
    ($tb:expr, $label:expr, $data:expr) => {{
        static SLOT: $crate::tracepoint::TracepointSlot = $crate::tracepoint::TracepointSlot::new(
            $crate::__private::CatalogKind::Dump,
            file!(),
            line!(),
            $label,
        );
        $crate::emit::emit_dump($tb, &SLOT, $data)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_is_stable_and_increments_per_tracebuffer() {
        let slot = TracepointSlot::new(CatalogKind::Printf, "src/x.rs", 10, "hello %u");
        let first = slot.offset("buf-a", &[ArgType::U32]);
        let second = slot.offset("buf-a", &[ArgType::U32]);
        assert_eq!(first, second);

        let other_slot = TracepointSlot::new(CatalogKind::Printf, "src/x.rs", 20, "world %s");
        let other = other_slot.offset("buf-a", &[ArgType::String]);
        assert_ne!(first, other);
    }

    #[test]
    fn default_catalog_source_resolves_registered_entries() {
        let slot = TracepointSlot::new(CatalogKind::Printf, "src/y.rs", 1, "n=%d");
        let offset = slot.offset("buf-b", &[ArgType::I32]);
        let source = DefaultCatalogSource;
        let entry = source.entry("buf-b", offset).unwrap();
        assert_eq!(entry.source_line, 1);
        assert_eq!(entry.format_or_label, "n=%d");
    }
}
