//! Metadata catalog: compile-time-recorded, write-once tracepoint
//! descriptors, keyed per tracebuffer name (spec §4.4).
//!
//! The catalog's on-disk/in-memory representation is intentionally
//! decoupled from how it got produced: a build-time code generator writing
//! a static array is out of scope (spec §1), so this module only defines
//! the entry shape and the `CatalogSource` trait the decoder consumes it
//! through, plus one reference implementation (`StaticCatalog`) good
//! enough for tests and for programs that register their own tracepoints
//! by hand instead of through a toolchain step.

use std::collections::HashMap;
use std::sync::Arc;

use tracekit_common::{ArgType, CatalogKind, CATALOG_ENTRY_MAGIC};

/// One compile-time-recorded tracepoint descriptor (spec §3/§4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CatalogEntry {
    pub kind: CatalogKind,
    pub source_file: String,
    pub source_line: u32,
    /// Effective argument tags used to decode this entry's records. When
    /// `flex` is set these came from parsing `format_or_label`'s `%`
    /// directives, not from the caller's actual argument types (spec §4.6:
    /// "on mismatch, the tags from the format string win, and a flag is
    /// set so the decoder knows").
    pub arg_types: Vec<ArgType>,
    /// Format string for `Printf`, label for `Dump`.
    pub format_or_label: String,
    /// Set when `arg_types` came from the format string rather than the
    /// caller, because the one-time cross-check (spec §4.6) found them in
    /// disagreement.
    pub flex: bool,
}

impl CatalogEntry {
    /// Magic-tagged, length-prefixed byte encoding used when a dynamic
    /// tracepoint synthesises its own entry and stores it in the unique
    /// stack (spec §4.5 "the entry itself is serialized").
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(CATALOG_ENTRY_MAGIC);
        out.push(self.kind as u8);
        out.push(self.flex as u8);
        out.extend_from_slice(&self.source_line.to_le_bytes());
        out.push(self.arg_types.len() as u8);
        out.extend(self.arg_types.iter().map(|t| *t as u8));
        let file_bytes = self.source_file.as_bytes();
        out.extend_from_slice(&(file_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(file_bytes);
        let label_bytes = self.format_or_label.as_bytes();
        out.extend_from_slice(&(label_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(label_bytes);
        out
    }

    /// Inverse of [`Self::serialize`]. Returns `None` on any structural
    /// violation; the decoder treats that as `InvalidMeta` (spec §7).
    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        let mut cursor = 0usize;
        let next = |cursor: &mut usize, n: usize| -> Option<&[u8]> {
            let slice = bytes.get(*cursor..*cursor + n)?;
            *cursor += n;
            Some(slice)
        };
        if *next(&mut cursor, 1)?.first()? != CATALOG_ENTRY_MAGIC {
            return None;
        }
        let kind = CatalogKind::from_tag(*next(&mut cursor, 1)?.first()?)?;
        let flex = *next(&mut cursor, 1)?.first()? != 0;
        let source_line = u32::from_le_bytes(next(&mut cursor, 4)?.try_into().ok()?);
        let arg_count = *next(&mut cursor, 1)?.first()? as usize;
        let mut arg_types = Vec::with_capacity(arg_count);
        for _ in 0..arg_count {
            arg_types.push(ArgType::from_tag(*next(&mut cursor, 1)?.first()?)?);
        }
        let file_len = u32::from_le_bytes(next(&mut cursor, 4)?.try_into().ok()?) as usize;
        let source_file = String::from_utf8(next(&mut cursor, file_len)?.to_vec()).ok()?;
        let label_len = u32::from_le_bytes(next(&mut cursor, 4)?.try_into().ok()?) as usize;
        let format_or_label = String::from_utf8(next(&mut cursor, label_len)?.to_vec()).ok()?;
        Some(Self {
            kind,
            source_file,
            source_line,
            arg_types,
            format_or_label,
            flex,
        })
    }
}

/// Supplies, per tracebuffer name, the catalog entries captured for it at
/// load time (spec §6 "catalog source"). Entries are located by offset
/// within the name's region, matching what the emit path stores in each
/// record's `catalog_offset` field.
pub trait CatalogSource: Send + Sync {
    fn entry(&self, tracebuffer: &str, offset: u32) -> Option<Arc<CatalogEntry>>;
}

/// Reference catalog: a process-held map of `(tracebuffer, offset) ->
/// entry`, populated by a build step or by hand. Write-once per the
/// spec's invariant — `register` only inserts, it never overwrites.
#[derive(Default)]
pub struct StaticCatalog {
    entries: HashMap<(String, u32), Arc<CatalogEntry>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entry` under `(tracebuffer, offset)`. A second call with
    /// the same key is a no-op: the catalog is write-once.
    pub fn register(&mut self, tracebuffer: &str, offset: u32, entry: CatalogEntry) {
        self.entries
            .entry((tracebuffer.to_string(), offset))
            .or_insert_with(|| Arc::new(entry));
    }
}

impl CatalogSource for StaticCatalog {
    fn entry(&self, tracebuffer: &str, offset: u32) -> Option<Arc<CatalogEntry>> {
        self.entries.get(&(tracebuffer.to_string(), offset)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CatalogEntry {
        CatalogEntry {
            kind: CatalogKind::Printf,
            source_file: "src/main.rs".to_string(),
            source_line: 42,
            arg_types: vec![ArgType::String, ArgType::U32],
            format_or_label: "hello %s %u".to_string(),
            flex: false,
        }
    }

    #[test]
    fn serialize_round_trips() {
        let entry = sample();
        let bytes = entry.serialize();
        let decoded = CatalogEntry::deserialize(&bytes).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn serialize_round_trips_the_flex_flag() {
        let mut entry = sample();
        entry.flex = true;
        let bytes = entry.serialize();
        let decoded = CatalogEntry::deserialize(&bytes).unwrap();
        assert!(decoded.flex);
    }

    #[test]
    #[cfg(feature = "serde")]
    fn serde_round_trips_through_json() {
        let mut entry = sample();
        entry.flex = true;
        let json = serde_json::to_string(&entry).unwrap();
        let decoded: CatalogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(entry, decoded);
    }

    #[test]
    fn deserialize_rejects_truncated_input() {
        let entry = sample();
        let bytes = entry.serialize();
        assert!(CatalogEntry::deserialize(&bytes[..bytes.len() - 3]).is_none());
    }

    #[test]
    fn deserialize_rejects_wrong_magic() {
        let mut bytes = sample().serialize();
        bytes[0] = b'[';
        assert!(CatalogEntry::deserialize(&bytes).is_none());
    }

    #[test]
    fn static_catalog_is_write_once() {
        let mut catalog = StaticCatalog::new();
        catalog.register("buf", 0, sample());
        let mut other = sample();
        other.source_line = 99;
        catalog.register("buf", 0, other);
        assert_eq!(catalog.entry("buf", 0).unwrap().source_line, 42);
        assert!(catalog.entry("buf", 1).is_none());
        assert!(catalog.entry("other", 0).is_none());
    }
}
