//! Emitted-record body layout shared by the emit path and the decoder
//! (spec §3 "Emitted record"): `pid (4) | tid (4) | timestamp_ns (8) |
//! catalog_offset (4) | arg_blob`.

use tracekit_common::MAX_RECORD_BODY;

/// Fixed portion of a record body, ahead of `arg_blob`.
pub const RECORD_PREFIX_SIZE: usize = 4 + 4 + 8 + 4;

/// Largest `arg_blob` a record's total body can carry, leaving the 8-byte
/// margin spec §4.5 step 4 asks for ("exceeds `UINT16_MAX - 8`").
pub const MAX_EMIT_BODY: usize = MAX_RECORD_BODY - 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPrefix {
    pub pid: u32,
    pub tid: u32,
    pub timestamp_ns: u64,
    pub catalog_offset: u32,
}

/// Writes `pid | tid | timestamp_ns | catalog_offset` into `out`, ahead of
/// whatever argument bytes the caller appends.
pub fn encode_prefix(prefix: RecordPrefix, out: &mut Vec<u8>) {
    out.extend_from_slice(&prefix.pid.to_le_bytes());
    out.extend_from_slice(&prefix.tid.to_le_bytes());
    out.extend_from_slice(&prefix.timestamp_ns.to_le_bytes());
    out.extend_from_slice(&prefix.catalog_offset.to_le_bytes());
}

/// Splits a decoded ring-buffer record body into its fixed prefix and the
/// remaining `arg_blob`. `None` on truncation — the caller surfaces this as
/// a shape failure, never panics (spec §7).
pub fn decode_prefix(body: &[u8]) -> Option<(RecordPrefix, &[u8])> {
    let pid = u32::from_le_bytes(body.get(0..4)?.try_into().ok()?);
    let tid = u32::from_le_bytes(body.get(4..8)?.try_into().ok()?);
    let timestamp_ns = u64::from_le_bytes(body.get(8..16)?.try_into().ok()?);
    let catalog_offset = u32::from_le_bytes(body.get(16..20)?.try_into().ok()?);
    let rest = body.get(20..)?;
    Some((
        RecordPrefix {
            pid,
            tid,
            timestamp_ns,
            catalog_offset,
        },
        rest,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_round_trips() {
        let prefix = RecordPrefix {
            pid: 123,
            tid: 456,
            timestamp_ns: 0xDEAD_BEEF,
            catalog_offset: 7,
        };
        let mut buf = Vec::new();
        encode_prefix(prefix, &mut buf);
        buf.extend_from_slice(b"extra-args");
        let (decoded, rest) = decode_prefix(&buf).unwrap();
        assert_eq!(decoded, prefix);
        assert_eq!(rest, b"extra-args");
    }

    #[test]
    fn truncated_prefix_fails_closed() {
        assert!(decode_prefix(&[1, 2, 3]).is_none());
    }
}
