//! Append-only, content-addressed blob store living in the same file as
//! the ring buffer (spec §4.2): every distinct payload is stored at most
//! once, and `add` returns a stable offset into the body region.
//!
//! The on-disk truth is the linear sequence of entries; a process-local
//! `md5 -> offset` cache (guarded by the same mutex as the on-disk scan,
//! mirroring `easternanemone-rust-daq`'s pattern of caching what its ring
//! buffer otherwise derives from the mapped header) turns repeat lookups
//! from O(n) into O(1) without creating a second source of truth.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};

use tracekit_common::{
    UniqueStackHeader, UNIQUE_STACK_ENTRY_HEADER_SIZE, UNIQUE_STACK_HEADER_SIZE,
    UNIQUE_STACK_VERSION,
};

use crate::crc8::crc8_chained;
use crate::error::{TraceError, TraceResult};
use crate::mapping::MappedRegion;
use crate::mutex;
use crate::os::OsAdapter;

/// Minimum usable region: header only: a fresh stack starts with zero body.
pub const MIN_REGION_SIZE: u64 = UNIQUE_STACK_HEADER_SIZE as u64;

pub struct UniqueStack {
    region: Arc<MappedRegion>,
    header_offset: u64,
    os: Arc<dyn OsAdapter>,
    /// `md5 digest -> body offset` cache. Never the only copy of the
    /// truth: always backed by the on-disk linear scan.
    cache: Mutex<HashMap<[u8; 16], u64>>,
}

impl UniqueStack {
    fn with_header<R>(&self, f: impl FnOnce(&UniqueStackHeader, *mut u8, u64) -> R) -> R {
        self.region.with_ptr(|base, len| {
            let header_ptr =
                unsafe { base.add(self.header_offset as usize) } as *const UniqueStackHeader;
            let header = unsafe { &*header_ptr };
            let body = unsafe { base.add(self.header_offset as usize + UNIQUE_STACK_HEADER_SIZE) };
            f(header, body, len)
        })
    }

    /// `init(file, offset)`: writes a zeroed header at `header_offset`,
    /// `body_size = 0`.
    pub fn init(region: Arc<MappedRegion>, header_offset: u64, os: Arc<dyn OsAdapter>) -> TraceResult<Self> {
        if region.len() < header_offset + MIN_REGION_SIZE {
            return Err(TraceError::RegionTooSmall(region.len()));
        }
        region.with_ptr(|base, _len| unsafe {
            std::ptr::write_bytes(base.add(header_offset as usize), 0, UNIQUE_STACK_HEADER_SIZE);
        });
        let stack = Self {
            region,
            header_offset,
            os,
            cache: Mutex::new(HashMap::new()),
        };
        stack.with_header(|header, _body, _len| {
            header.version.store(UNIQUE_STACK_VERSION, Ordering::Relaxed);
            header.body_size.store(0, Ordering::Release);
        });
        Ok(stack)
    }

    /// `open(file, offset)`: reopens a pre-initialised region, validating
    /// version.
    pub fn open(region: Arc<MappedRegion>, header_offset: u64, os: Arc<dyn OsAdapter>) -> TraceResult<Self> {
        if region.len() < header_offset + MIN_REGION_SIZE {
            return Err(TraceError::RegionTooSmall(region.len()));
        }
        let stack = Self {
            region,
            header_offset,
            os,
            cache: Mutex::new(HashMap::new()),
        };
        stack.with_header(|header, _body, _len| -> TraceResult<()> {
            let version = header.version.load(Ordering::Acquire);
            if version != UNIQUE_STACK_VERSION {
                return Err(TraceError::InvalidTracebuffer(format!(
                    "unique stack version {version}, expected {UNIQUE_STACK_VERSION}"
                )));
            }
            Ok(())
        })?;
        Ok(stack)
    }

    pub fn body_size(&self) -> u64 {
        self.with_header(|header, _body, _len| header.body_size.load(Ordering::Acquire))
    }

    /// `add(body, size) -> entry_offset`: returns the file offset of the
    /// body of a (possibly preexisting) entry with identical bytes.
    ///
    /// Growing the shared mapping requires the exclusive half of the same
    /// `RwLock` `with_header`'s read half is holding, so a single call
    /// never does both: [`Self::try_add`] either resolves the request
    /// entirely under one held lock, or (if the current mapping has no
    /// room for a new entry) releases it and reports `None`, at which
    /// point `add` grows the mapping and re-scans from scratch — another
    /// writer may have appended the same body while this one was
    /// unlocked, which the dedup invariant tolerates by construction.
    pub fn add(&self, body: &[u8]) -> TraceResult<u64> {
        let mut hasher = Md5::new();
        hasher.update(body);
        let digest: [u8; 16] = hasher.finalize().into();

        if let Some(&offset) = self.cache.lock().unwrap().get(&digest) {
            return Ok(offset);
        }

        loop {
            if let Some(offset) = self.try_add(digest, body)? {
                return Ok(offset);
            }
            let required = self.header_offset
                + UNIQUE_STACK_HEADER_SIZE as u64
                + self.body_size()
                + UNIQUE_STACK_ENTRY_HEADER_SIZE as u64
                + body.len() as u64;
            self.region.grow_to(self.os.page_align(required))?;
        }
    }

    /// One attempt at scan-then-append, holding the stack's cross-process
    /// mutex for its whole duration. Returns `Ok(None)` when the entry
    /// would not fit in the currently mapped length, without mutating
    /// anything, so the caller can grow the mapping and retry.
    ///
    /// The scan itself is bounded by `mapped_len`, not just the header's
    /// shared `body_size`: another process can grow the backing file and
    /// publish a larger `body_size` while this process is still holding an
    /// older, smaller mapping of the same file. Reading past `mapped_len`
    /// would walk off the end of this process's own address space. When an
    /// entry's header is visible but its payload isn't, the scan stops and
    /// reports a miss so the caller grows its own mapping and retries,
    /// exactly as it already does on a genuine append-doesn't-fit miss.
    fn try_add(&self, digest: [u8; 16], body: &[u8]) -> TraceResult<Option<u64>> {
        self.with_header(|header, stack_body, mapped_len| {
            let _guard = mutex::lock(&header.mutex, &self.os);

            let body_size = header.body_size.load(Ordering::Acquire);
            let usable_body_len =
                mapped_len.saturating_sub(self.header_offset + UNIQUE_STACK_HEADER_SIZE as u64);
            let scan_limit = body_size.min(usable_body_len);
            let mut cursor = 0u64;
            while cursor + UNIQUE_STACK_ENTRY_HEADER_SIZE as u64 <= scan_limit {
                let entry_md5 = unsafe {
                    let ptr = stack_body.add(cursor as usize) as *const [u8; 16];
                    std::ptr::read_unaligned(ptr)
                };
                let entry_body_size = unsafe {
                    let ptr = stack_body.add(cursor as usize + 24) as *const u32;
                    u32::from_le(std::ptr::read_unaligned(ptr))
                } as u64;
                let payload_offset = cursor + UNIQUE_STACK_ENTRY_HEADER_SIZE as u64;
                if payload_offset + entry_body_size > scan_limit {
                    // This entry's header is visible but its body isn't
                    // fully mapped here yet; stop rather than trust it.
                    break;
                }
                if entry_md5 == digest && entry_body_size == body.len() as u64 {
                    let abs_offset =
                        self.header_offset + UNIQUE_STACK_HEADER_SIZE as u64 + payload_offset;
                    self.cache.lock().unwrap().insert(digest, abs_offset);
                    return Ok(Some(abs_offset));
                }
                cursor = payload_offset + entry_body_size;
            }

            // Miss: append, but only if it already fits in what's mapped.
            let entry_total = UNIQUE_STACK_ENTRY_HEADER_SIZE as u64 + body.len() as u64;
            let abs_start = self.header_offset + UNIQUE_STACK_HEADER_SIZE as u64 + body_size;
            if abs_start + entry_total > mapped_len {
                return Ok(None);
            }

            let entry_ptr = unsafe { stack_body.add(body_size as usize) };
            unsafe {
                std::ptr::copy_nonoverlapping(digest.as_ptr(), entry_ptr, 16);
                std::ptr::write_bytes(entry_ptr.add(16), 0, 8);
                let size_le = (body.len() as u32).to_le_bytes();
                std::ptr::copy_nonoverlapping(size_le.as_ptr(), entry_ptr.add(24), 4);
                let header_crc = crc8_chained(&[&digest, &[0u8; 8], &size_le]);
                *entry_ptr.add(28) = header_crc;
                std::ptr::copy_nonoverlapping(
                    body.as_ptr(),
                    entry_ptr.add(UNIQUE_STACK_ENTRY_HEADER_SIZE),
                    body.len(),
                );
            }

            header
                .body_size
                .store(body_size + entry_total, Ordering::Release);

            let payload_offset = abs_start + UNIQUE_STACK_ENTRY_HEADER_SIZE as u64;
            self.cache.lock().unwrap().insert(digest, payload_offset);
            Ok(Some(payload_offset))
        })
    }

    /// Reads `len` bytes at absolute file offset `offset`, as returned by
    /// `add`. Used by readers treating the stack as untrusted to verify
    /// MD5/CRC before trusting a body.
    pub fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        self.region.with_ptr(|base, _mapped_len| {
            let mut out = vec![0u8; len];
            unsafe {
                std::ptr::copy_nonoverlapping(base.add(offset as usize), out.as_mut_ptr(), len);
            }
            out
        })
    }

    /// Reads the entry whose body starts at absolute file `offset`,
    /// verifying its header CRC and the body's MD5 before trusting it
    /// (spec §4.2 point 4: "a reader treating the stack as untrusted must
    /// verify MD5 matches the body and CRC matches the header"). `None` on
    /// any structural or integrity failure.
    pub fn read_verified(&self, offset: u64) -> Option<Vec<u8>> {
        self.region.with_ptr(|base, mapped_len| {
            let header_start = offset.checked_sub(UNIQUE_STACK_ENTRY_HEADER_SIZE as u64)?;
            if header_start + UNIQUE_STACK_ENTRY_HEADER_SIZE as u64 > mapped_len {
                return None;
            }
            let (md5, reserved, size_le, stored_crc) = unsafe {
                let hp = base.add(header_start as usize);
                let md5: [u8; 16] = std::ptr::read_unaligned(hp as *const [u8; 16]);
                let reserved: [u8; 8] = std::ptr::read_unaligned(hp.add(16) as *const [u8; 8]);
                let size_le: [u8; 4] = std::ptr::read_unaligned(hp.add(24) as *const [u8; 4]);
                let stored_crc = *hp.add(28);
                (md5, reserved, size_le, stored_crc)
            };
            if crc8_chained(&[&md5, &reserved, &size_le]) != stored_crc {
                return None;
            }
            let body_size = u32::from_le_bytes(size_le) as u64;
            if offset + body_size > mapped_len {
                return None;
            }
            let body = unsafe {
                let mut out = vec![0u8; body_size as usize];
                std::ptr::copy_nonoverlapping(base.add(offset as usize), out.as_mut_ptr(), out.len());
                out
            };
            let mut hasher = Md5::new();
            hasher.update(&body);
            let digest: [u8; 16] = hasher.finalize().into();
            if digest != md5 {
                return None;
            }
            Some(body)
        })
    }

    /// Converts an absolute body offset (as returned by [`Self::add`]) to
    /// one relative to the start of this stack's body region, for
    /// embedding in a record's 32-bit `catalog_offset` field.
    pub fn relative_offset(&self, absolute: u64) -> u32 {
        (absolute - self.header_offset - UNIQUE_STACK_HEADER_SIZE as u64) as u32
    }

    /// Inverse of [`Self::relative_offset`].
    pub fn absolute_offset(&self, relative: u32) -> u64 {
        self.header_offset + UNIQUE_STACK_HEADER_SIZE as u64 + relative as u64
    }
}
