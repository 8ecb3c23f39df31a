//! Fixed-capacity, single-producer-multi-reader ring buffer (spec §4.1).
//!
//! Body access goes through the shared [`MappedRegion`](crate::mapping::MappedRegion)
//! that also backs the unique stack living further along the same file, the
//! same pattern `easternanemone-rust-daq`'s `RingBuffer` uses for its header
//! pointer: cursors are plain atomics in the mapped header so another
//! process mapping the same file observes every update without IPC. Because
//! the unique stack can grow that file at runtime (spec §4.2), a ring
//! buffer never caches a base pointer across calls — every operation asks
//! `MappedRegion` for one and holds its read lock for the operation's full
//! duration, so a concurrent growth can't swap the mapping out from under
//! an in-flight read or write.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracekit_common::{RingBufferHeader, RING_BUFFER_HEADER_SIZE, RECORD_FRAME_OVERHEAD,
    RECORD_MAGIC, RING_BUFFER_VERSION, MAX_RECORD_BODY};

use crate::crc8::{crc8, crc8_update};
use crate::error::{TraceError, TraceResult};
use crate::mapping::MappedRegion;
use crate::mutex;
use crate::os::OsAdapter;

/// Minimum usable region: header plus at least one byte of body.
pub const MIN_REGION_SIZE: u64 = RING_BUFFER_HEADER_SIZE as u64 + 1;

enum ScanStep {
    /// Buffer empty, nothing to scan.
    Empty,
    /// One byte of garbage skipped; not counted as a drop.
    Resynced,
    /// A structurally valid head was found but its body CRC failed; the
    /// head (not the whole frame) was dropped.
    DroppedBadHead,
    /// A fully valid record sits at the (pre-call) `last_valid`.
    Valid { body_len: u64, frame_len: u64 },
}

/// Holds the region and OS adapter by `Arc` rather than borrowing them: a
/// `Tracebuffer` owns one mapping shared by both its ring buffer and its
/// unique stack, and needs to hand out `RingBuffer`/`UniqueStack` views
/// without a self-referential struct.
pub struct RingBuffer {
    region: Arc<MappedRegion>,
    header_offset: u64,
    body_size: u64,
    os: Arc<dyn OsAdapter>,
}

impl RingBuffer {
    /// Runs `f` with a live reference to the header and a base pointer to
    /// the body, both derived from the region's *current* mapping, for the
    /// duration of one logical operation.
    fn with_header_body<R>(&self, f: impl FnOnce(&RingBufferHeader, *mut u8) -> R) -> R {
        self.region.with_ptr(|base, _len| {
            let header_ptr = unsafe { base.add(self.header_offset as usize) } as *const RingBufferHeader;
            let header = unsafe { &*header_ptr };
            let body = unsafe { base.add(self.header_offset as usize + RING_BUFFER_HEADER_SIZE) };
            f(header, body)
        })
    }

    /// `init(space, space_size)`: zero-initialises the header and sizes
    /// the body. Fails if `space_size <= sizeof(header) + 1`.
    ///
    /// `header_offset` is this ring buffer's byte offset within `region`'s
    /// backing file; the body immediately follows its header.
    pub fn init(
        region: Arc<MappedRegion>,
        header_offset: u64,
        space_size: u64,
        os: Arc<dyn OsAdapter>,
    ) -> TraceResult<Self> {
        if space_size < MIN_REGION_SIZE {
            return Err(TraceError::RegionTooSmall(space_size));
        }
        let body_size = space_size - RING_BUFFER_HEADER_SIZE as u64;
        region.with_ptr(|base, _len| unsafe {
            std::ptr::write_bytes(base.add(header_offset as usize), 0, RING_BUFFER_HEADER_SIZE);
        });
        let rb = Self { region, header_offset, body_size, os };
        rb.with_header_body(|header, _body| {
            header.version.store(RING_BUFFER_VERSION, Ordering::Relaxed);
            header.body_size.store(body_size, Ordering::Relaxed);
            header.next_free.store(0, Ordering::Relaxed);
            header.last_valid.store(0, Ordering::Release);
        });
        Ok(rb)
    }

    /// `open(space)`: reopens a pre-initialised region, validating version
    /// and that its declared `body_size` fits inside `space_size`.
    pub fn open(
        region: Arc<MappedRegion>,
        header_offset: u64,
        space_size: u64,
        os: Arc<dyn OsAdapter>,
    ) -> TraceResult<Self> {
        if space_size < MIN_REGION_SIZE {
            return Err(TraceError::RegionTooSmall(space_size));
        }
        let body_size = space_size - RING_BUFFER_HEADER_SIZE as u64;
        let rb = Self { region, header_offset, body_size, os };
        rb.with_header_body(|header, _body| -> TraceResult<()> {
            let version = header.version.load(Ordering::Acquire);
            if version != RING_BUFFER_VERSION {
                return Err(TraceError::InvalidTracebuffer(format!(
                    "ring buffer version {version}, expected {RING_BUFFER_VERSION}"
                )));
            }
            let declared = header.body_size.load(Ordering::Acquire);
            if declared != body_size {
                return Err(TraceError::InvalidTracebuffer(format!(
                    "ring buffer body_size {declared} does not fit region of {space_size}"
                )));
            }
            Ok(())
        })?;
        Ok(rb)
    }

    pub fn capacity(&self) -> u64 {
        self.body_size
    }

    pub fn occupied(&self) -> u64 {
        self.with_header_body(|header, _body| occupied_of(header, self.body_size))
    }

    pub fn available(&self) -> u64 {
        self.body_size - self.occupied()
    }

    pub fn wrapped(&self) -> u64 {
        self.with_header_body(|header, _body| header.wrapped.load(Ordering::Relaxed))
    }

    pub fn dropped(&self) -> u64 {
        self.with_header_body(|header, _body| header.dropped.load(Ordering::Relaxed))
    }

    pub fn entries(&self) -> u64 {
        self.with_header_body(|header, _body| header.entries.load(Ordering::Relaxed))
    }

    /// `put(src, len)`: atomic publication of one record.
    pub fn put(&self, src: &[u8]) -> usize {
        if src.is_empty() || src.len() > MAX_RECORD_BODY {
            return 0;
        }
        let frame_total = RECORD_FRAME_OVERHEAD as u64 + src.len() as u64;
        if src.len() as u64 > self.body_size.saturating_sub(RECORD_FRAME_OVERHEAD as u64) {
            return 0;
        }

        self.with_header_body(|header, body| {
            let _guard = mutex::lock(&header.mutex, &self.os);

            while available_of(header, self.body_size) < frame_total {
                match scan_step(header, body, self.body_size) {
                    ScanStep::Empty => break,
                    ScanStep::Resynced | ScanStep::DroppedBadHead => continue,
                    ScanStep::Valid { frame_len, .. } => {
                        let last_valid = header.last_valid.load(Ordering::Acquire);
                        header
                            .last_valid
                            .store((last_valid + frame_len) % self.body_size, Ordering::Release);
                        saturating_add(&header.dropped, 1);
                    }
                }
            }

            let next_free = header.next_free.load(Ordering::Relaxed);
            let head_crc = crc8(&[RECORD_MAGIC, src.len() as u8, (src.len() >> 8) as u8]);
            write_u8_at(body, self.body_size, next_free, RECORD_MAGIC);
            write_u8_at(body, self.body_size, next_free + 1, src.len() as u8);
            write_u8_at(body, self.body_size, next_free + 2, (src.len() >> 8) as u8);
            write_u8_at(body, self.body_size, next_free + 3, head_crc);
            copy_in(body, self.body_size, next_free + 4, src);
            let body_crc = crc8(src);
            write_u8_at(body, self.body_size, next_free + 4 + src.len() as u64, body_crc);

            advance_next_free(header, self.body_size, frame_total);
            saturating_add(&header.entries, 1);
            self.os.cache_flush(&[]);

            src.len()
        })
    }

    /// `get(dst, max)`: removes and copies out the oldest valid record.
    pub fn get(&self, dst: &mut [u8]) -> usize {
        self.with_header_body(|header, body| {
            let _guard = mutex::lock(&header.mutex, &self.os);
            loop {
                match scan_step(header, body, self.body_size) {
                    ScanStep::Empty => return 0,
                    ScanStep::Resynced | ScanStep::DroppedBadHead => continue,
                    ScanStep::Valid { body_len, frame_len } => {
                        if (dst.len() as u64) < body_len {
                            return 0;
                        }
                        let last_valid = header.last_valid.load(Ordering::Acquire);
                        copy_out(body, self.body_size, &mut dst[..body_len as usize], last_valid + 4);
                        header
                            .last_valid
                            .store((last_valid + frame_len) % self.body_size, Ordering::Release);
                        return body_len as usize;
                    }
                }
            }
        })
    }

    /// `clear()`: sets `last_valid := next_free` and adds the number of
    /// records that were occupying the buffer to `dropped`. Implemented by
    /// running the same scan the eviction loop in `put` uses until the
    /// cursor reaches `next_free`, so corrupt trailing bytes resync away
    /// for free rather than needing special-casing.
    pub fn clear(&self) {
        self.with_header_body(|header, body| {
            let _guard = mutex::lock(&header.mutex, &self.os);
            loop {
                match scan_step(header, body, self.body_size) {
                    ScanStep::Empty => break,
                    ScanStep::Resynced | ScanStep::DroppedBadHead => continue,
                    ScanStep::Valid { frame_len, .. } => {
                        let last_valid = header.last_valid.load(Ordering::Acquire);
                        header
                            .last_valid
                            .store((last_valid + frame_len) % self.body_size, Ordering::Release);
                        saturating_add(&header.dropped, 1);
                    }
                }
            }
        })
    }
}

fn occupied_of(header: &RingBufferHeader, body_size: u64) -> u64 {
    let next_free = header.next_free.load(Ordering::Acquire);
    let last_valid = header.last_valid.load(Ordering::Acquire);
    (next_free + body_size - last_valid) % body_size
}

fn available_of(header: &RingBufferHeader, body_size: u64) -> u64 {
    body_size - occupied_of(header, body_size)
}

/// Read-modify primitives below are `pub(crate)`: the decoder (`decode`
/// module) reads the same wrapping body layout non-destructively, over a
/// cursor pair it owns locally instead of the header's atomics, and reuses
/// these instead of duplicating the wraparound arithmetic.
pub(crate) fn read_u8_at(body: *mut u8, body_size: u64, pos: u64) -> u8 {
    let idx = (pos % body_size) as usize;
    unsafe { std::ptr::read_volatile(body.add(idx)) }
}

fn write_u8_at(body: *mut u8, body_size: u64, pos: u64, value: u8) {
    let idx = (pos % body_size) as usize;
    unsafe { std::ptr::write_volatile(body.add(idx), value) };
}

pub(crate) fn read_u16_at(body: *mut u8, body_size: u64, pos: u64) -> u16 {
    let lo = read_u8_at(body, body_size, pos);
    let hi = read_u8_at(body, body_size, pos + 1);
    u16::from_le_bytes([lo, hi])
}

/// CRC-8 over `len` bytes starting at `start`, wrapping as needed, without
/// allocating.
pub(crate) fn crc8_region(body: *mut u8, body_size: u64, start: u64, len: u64) -> u8 {
    let mut crc = 0u8;
    for i in 0..len {
        crc = crc8_update(crc, read_u8_at(body, body_size, start + i));
    }
    crc
}

fn copy_in(body: *mut u8, body_size: u64, dst_pos: u64, src: &[u8]) {
    for (i, &b) in src.iter().enumerate() {
        write_u8_at(body, body_size, dst_pos + i as u64, b);
    }
}

fn copy_out(body: *mut u8, body_size: u64, dst: &mut [u8], src_pos: u64) {
    for (i, slot) in dst.iter_mut().enumerate() {
        *slot = read_u8_at(body, body_size, src_pos + i as u64);
    }
}

fn advance_next_free(header: &RingBufferHeader, body_size: u64, by: u64) {
    let before = header.next_free.load(Ordering::Relaxed);
    let after = (before + by) % body_size;
    if after < before || by >= body_size {
        saturating_add(&header.wrapped, 1);
    }
    header.next_free.store(after, Ordering::Release);
}

/// One step of the `SEARCH_MAGIC -> VALIDATE_HEAD_CRC -> VALIDATE_BODY_CRC
/// -> ACCEPT` state machine, applying whichever tie-break the spec assigns
/// to what it finds.
fn scan_step(header: &RingBufferHeader, body: *mut u8, body_size: u64) -> ScanStep {
    let last_valid = header.last_valid.load(Ordering::Acquire);
    let next_free = header.next_free.load(Ordering::Acquire);
    if last_valid == next_free {
        return ScanStep::Empty;
    }
    let occupied = (next_free + body_size - last_valid) % body_size;

    let magic = read_u8_at(body, body_size, last_valid);
    if magic != RECORD_MAGIC {
        header
            .last_valid
            .store((last_valid + 1) % body_size, Ordering::Release);
        return ScanStep::Resynced;
    }

    if occupied < RECORD_FRAME_OVERHEAD as u64 {
        header
            .last_valid
            .store((last_valid + 1) % body_size, Ordering::Release);
        return ScanStep::Resynced;
    }

    let body_len = read_u16_at(body, body_size, last_valid + 1) as u64;
    let head_crc_stored = read_u8_at(body, body_size, last_valid + 3);
    let head_crc_computed = crc8_region(body, body_size, last_valid, 3);
    if head_crc_stored != head_crc_computed {
        header
            .last_valid
            .store((last_valid + 1) % body_size, Ordering::Release);
        return ScanStep::Resynced;
    }

    let frame_len = RECORD_FRAME_OVERHEAD as u64 + body_len;
    if frame_len > occupied {
        header
            .last_valid
            .store((last_valid + 1) % body_size, Ordering::Release);
        return ScanStep::Resynced;
    }

    let body_crc_stored = read_u8_at(body, body_size, last_valid + 4 + body_len);
    let body_crc_computed = crc8_region(body, body_size, last_valid + 4, body_len);
    if body_crc_stored != body_crc_computed {
        saturating_add(&header.dropped, 1);
        header
            .last_valid
            .store((last_valid + 4) % body_size, Ordering::Release);
        return ScanStep::DroppedBadHead;
    }

    ScanStep::Valid { body_len, frame_len }
}

fn saturating_add(counter: &std::sync::atomic::AtomicU64, by: u64) {
    let mut current = counter.load(Ordering::Relaxed);
    loop {
        let next = current.saturating_add(by);
        match counter.compare_exchange_weak(
            current,
            next,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}
