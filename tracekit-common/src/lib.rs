//! Wire-format types shared between the tracekit emitter and the decoder.
//!
//! Every type here mirrors a byte-exact on-disk layout. Layouts that embed
//! atomics (the two region headers) are plain `#[repr(C)]` structs accessed
//! through raw pointers into a shared mapping, the same way a file-backed
//! ring buffer is normally built in Rust — atomics aren't `Copy`, so these
//! headers are read and written through the pointer directly rather than
//! through a `Pod` cast. The catalog entry exchanged between a catalog
//! source and the decoder has its own hand-rolled, versioned wire codec
//! (see `tracekit::catalog`), since it carries variable-length fields a
//! fixed-layout cast can't express.

use std::sync::atomic::{AtomicU32, AtomicU64};

/// First byte of every ring-buffer record frame.
pub const RECORD_MAGIC: u8 = 0x7E;

/// `magic (1) + body_size (2) + head_crc8 (1)`.
pub const RECORD_HEAD_SIZE: usize = 4;
/// Trailing `body_crc8`.
pub const RECORD_TRAILER_SIZE: usize = 1;
/// Per-record overhead that does not count toward the caller's payload.
pub const RECORD_FRAME_OVERHEAD: usize = RECORD_HEAD_SIZE + RECORD_TRAILER_SIZE;

/// Largest body a single ring-buffer record may declare (`u16` field width).
pub const MAX_RECORD_BODY: usize = u16::MAX as usize;

/// `md5 (16) + reserved (8) + body_size (4) + header_crc8 (1)`.
pub const UNIQUE_STACK_ENTRY_HEADER_SIZE: usize = 16 + 8 + 4 + 1;

pub const RING_BUFFER_HEADER_SIZE: usize = 160;
pub const UNIQUE_STACK_HEADER_SIZE: usize = 120;

/// File extension for a userspace tracebuffer.
pub const USER_TRACE_EXT: &str = "clltk_trace";
/// File extension for a kernel-side tracebuffer.
pub const KERNEL_TRACE_EXT: &str = "clltk_ktrace";

/// Tracebuffer name pattern: `^[A-Za-z][A-Za-z0-9_]{0,255}$`.
pub fn is_valid_tracebuffer_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() {
        return false;
    }
    let rest_len = name.len() - first.len_utf8();
    if rest_len > 255 {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Opaque cross-process mutex embedded in both region headers.
///
/// Implements the ticket-lock-with-heartbeat strategy from the design
/// notes: `locked` is the ticket currently being served, `ticket_next` is
/// the next ticket to hand out, `owner_pid`/`owner_heartbeat_ns` let a
/// blocked waiter detect a dead holder and steal the lock.
#[repr(C)]
pub struct CrossProcessMutex {
    pub ticket_serving: AtomicU64,
    pub ticket_next: AtomicU64,
    pub owner_pid: AtomicU32,
    pub owner_alive: AtomicU32,
    pub owner_heartbeat_ns: AtomicU64,
    pub reserved: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<CrossProcessMutex>() == 64);
const _: () = assert!(std::mem::align_of::<CrossProcessMutex>() <= 8);

impl CrossProcessMutex {
    pub const fn zeroed() -> Self {
        Self {
            ticket_serving: AtomicU64::new(0),
            ticket_next: AtomicU64::new(0),
            owner_pid: AtomicU32::new(0),
            owner_alive: AtomicU32::new(0),
            owner_heartbeat_ns: AtomicU64::new(0),
            reserved: [0; 32],
        }
    }
}

/// Current on-disk version of the ring-buffer region.
pub const RING_BUFFER_VERSION: u64 = 1;
/// Current on-disk version of the unique-stack region.
pub const UNIQUE_STACK_VERSION: u64 = 1;

/// `ring_buffer_header`, byte-exact, 160 bytes.
#[repr(C)]
pub struct RingBufferHeader {
    pub version: AtomicU64,
    pub mutex: CrossProcessMutex,
    pub body_size: AtomicU64,
    pub wrapped: AtomicU64,
    pub dropped: AtomicU64,
    pub entries: AtomicU64,
    pub next_free: AtomicU64,
    pub last_valid: AtomicU64,
    pub reserved: [u8; 40],
}

const _: () = assert!(std::mem::size_of::<RingBufferHeader>() == RING_BUFFER_HEADER_SIZE);

/// # Safety
/// Every field is either an atomic (internally synchronised) or a byte
/// array never interpreted as anything but raw bytes; the struct carries
/// no non-atomic aliasing state.
unsafe impl Send for RingBufferHeader {}
/// # Safety
/// See `Send` above — all cross-thread access goes through the atomics or
/// the embedded `CrossProcessMutex`.
unsafe impl Sync for RingBufferHeader {}

impl RingBufferHeader {
    pub const fn zeroed() -> Self {
        Self {
            version: AtomicU64::new(0),
            mutex: CrossProcessMutex::zeroed(),
            body_size: AtomicU64::new(0),
            wrapped: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            entries: AtomicU64::new(0),
            next_free: AtomicU64::new(0),
            last_valid: AtomicU64::new(0),
            reserved: [0; 40],
        }
    }
}

/// `unique_stack_header`, byte-exact, 120 bytes.
#[repr(C)]
pub struct UniqueStackHeader {
    pub version: AtomicU64,
    pub mutex: CrossProcessMutex,
    pub reserved: [u8; 40],
    pub body_size: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<UniqueStackHeader>() == UNIQUE_STACK_HEADER_SIZE);

/// # Safety
/// See `RingBufferHeader`'s impls; the same reasoning applies.
unsafe impl Send for UniqueStackHeader {}
/// # Safety
/// See `RingBufferHeader`'s impls; the same reasoning applies.
unsafe impl Sync for UniqueStackHeader {}

impl UniqueStackHeader {
    pub const fn zeroed() -> Self {
        Self {
            version: AtomicU64::new(0),
            mutex: CrossProcessMutex::zeroed(),
            reserved: [0; 40],
            body_size: AtomicU64::new(0),
        }
    }
}

/// Closed set of argument type tags (spec §3/§4.6). `Unknown` only ever
/// arises from a foreign or corrupt catalog source on the decode side —
/// the emit-side `IntoArg` trait has no implementation that produces it.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ArgType {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    U64 = 6,
    I64 = 7,
    U128 = 8,
    I128 = 9,
    F32 = 10,
    F64 = 11,
    String = 12,
    Dump = 13,
    Pointer = 14,
    Unknown = 15,
}

impl ArgType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::U64,
            7 => Self::I64,
            8 => Self::U128,
            9 => Self::I128,
            10 => Self::F32,
            11 => Self::F64,
            12 => Self::String,
            13 => Self::Dump,
            14 => Self::Pointer,
            15 => Self::Unknown,
            _ => return None,
        })
    }

    /// Fixed encoded width, or `None` for the two variable-length kinds.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::U64 | Self::I64 | Self::F64 | Self::Pointer => Some(8),
            Self::U128 | Self::I128 => Some(16),
            Self::String | Self::Dump => None,
            Self::Unknown => None,
        }
    }

    pub fn is_variable_length(self) -> bool {
        matches!(self, Self::String | Self::Dump)
    }
}

/// Catalog entry kind (spec §4.4).
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CatalogKind {
    Printf = 0,
    Dump = 1,
}

impl CatalogKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Printf),
            1 => Some(Self::Dump),
            _ => None,
        }
    }
}

/// Magic byte marking the start of a serialized catalog entry, per spec
/// §4.4 (`magic='{'`).
pub const CATALOG_ENTRY_MAGIC: u8 = b'{';

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes_are_byte_exact() {
        assert_eq!(std::mem::size_of::<RingBufferHeader>(), 160);
        assert_eq!(std::mem::size_of::<UniqueStackHeader>(), 120);
        assert_eq!(std::mem::size_of::<CrossProcessMutex>(), 64);
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_tracebuffer_name("a"));
        assert!(is_valid_tracebuffer_name("Trace_1"));
        assert!(!is_valid_tracebuffer_name(""));
        assert!(!is_valid_tracebuffer_name("1trace"));
        assert!(!is_valid_tracebuffer_name("bad-name"));
        assert!(!is_valid_tracebuffer_name(&"a".repeat(257)));
        assert!(is_valid_tracebuffer_name(&"a".repeat(256)));
    }

    #[test]
    fn arg_type_round_trips_through_tag() {
        for tag in 0u8..=15 {
            let ty = ArgType::from_tag(tag).unwrap();
            assert_eq!(ty as u8, tag);
        }
        assert!(ArgType::from_tag(16).is_none());
    }

    #[test]
    fn fixed_widths_match_spec_table() {
        assert_eq!(ArgType::U8.fixed_width(), Some(1));
        assert_eq!(ArgType::I128.fixed_width(), Some(16));
        assert_eq!(ArgType::Pointer.fixed_width(), Some(8));
        assert_eq!(ArgType::String.fixed_width(), None);
        assert_eq!(ArgType::Dump.fixed_width(), None);
    }

    #[test]
    #[cfg(feature = "serde")]
    fn arg_type_and_catalog_kind_round_trip_through_json() {
        let json = serde_json::to_string(&ArgType::Pointer).unwrap();
        assert_eq!(serde_json::from_str::<ArgType>(&json).unwrap(), ArgType::Pointer);

        let json = serde_json::to_string(&CatalogKind::Dump).unwrap();
        assert_eq!(serde_json::from_str::<CatalogKind>(&json).unwrap(), CatalogKind::Dump);
    }
}
