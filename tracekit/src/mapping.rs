//! One shared, growable file mapping backing both regions of a
//! tracebuffer (spec §6's "page-granular shared RW mapping").
//!
//! The ring buffer and unique stack live in the *same* file and therefore
//! the same `memmap2::MmapMut`; growing the unique stack's body (spec
//! §4.2 "grow the file... before writing") invalidates every pointer into
//! that mapping, including the ring buffer's. An `RwLock` makes that
//! explicit: ordinary reads/writes take a shared lock for the duration of
//! one operation (coordination of the bytes themselves is the embedded
//! cross-process ticket lock's job, not this one), while growth takes an
//! exclusive lock so no other operation can be mid-dereference when the
//! mapping is replaced.

use std::fs::File;
use std::sync::RwLock;

use memmap2::{MmapMut, MmapOptions};

use crate::error::TraceResult;
use crate::os::OsAdapter;

pub struct MappedRegion {
    file: File,
    mmap: RwLock<MmapMut>,
}

impl MappedRegion {
    pub fn new(file: File, mmap: MmapMut) -> Self {
        Self {
            file,
            mmap: RwLock::new(mmap),
        }
    }

    pub fn len(&self) -> u64 {
        self.mmap.read().unwrap().len() as u64
    }

    /// Runs `f` with the current mapping's base pointer and length,
    /// holding a shared lock for the whole call so a concurrent `grow_to`
    /// cannot swap the mapping out from under it.
    ///
    /// `f` must not call `grow_to` or re-enter `with_ptr` itself: `RwLock`
    /// does not support recursive acquisition, and a nested `grow_to`
    /// would deadlock against the read guard this call already holds.
    /// Callers that may need to grow the mapping should have `f` return a
    /// sentinel (e.g. `Ok(None)`) and grow *after* this call returns.
    pub fn with_ptr<R>(&self, f: impl FnOnce(*mut u8, u64) -> R) -> R {
        let guard = self.mmap.read().unwrap();
        // SAFETY: `MmapMut` is backed by writable shared memory; callers
        // coordinate actual byte-level access through the cross-process
        // ticket locks embedded in the region headers, not through Rust's
        // aliasing rules, which is the entire point of a concurrent
        // mmap-backed data structure (mirrors how the grounding ring
        // buffers in this codebase hold a raw header pointer).
        let base = guard.as_ptr() as *mut u8;
        let len = guard.len() as u64;
        f(base, len)
    }

    /// Extends the backing file to `new_size` (caller page-aligns) and
    /// remaps it, invalidating every previously observed base pointer.
    pub fn grow_to(&self, new_size: u64) -> TraceResult<()> {
        let mut guard = self.mmap.write().unwrap();
        if (guard.len() as u64) >= new_size {
            return Ok(());
        }
        self.file.set_len(new_size)?;
        let new_mmap = unsafe { MmapOptions::new().map_mut(&self.file)? };
        *guard = new_mmap;
        Ok(())
    }
}

/// Opens an existing tracebuffer file for the decoder. Unlike
/// [`open_or_create`], this never creates or resizes the file: a decoder
/// reading a file nobody has bound yet is a user error, not a fresh
/// tracebuffer (spec §6 decoder side only ever reads what an emitter
/// already laid out).
pub fn open_existing(path: &std::path::Path) -> TraceResult<MappedRegion> {
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(MappedRegion::new(file, mmap))
}

/// Opens or creates the backing file for a tracebuffer at `path`, sized
/// to at least `size` bytes (page-aligned), and maps it.
pub fn open_or_create(
    path: &std::path::Path,
    size: u64,
    os: &dyn OsAdapter,
) -> TraceResult<(MappedRegion, bool)> {
    let aligned = os.page_align(size);
    let existed = path.exists();
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    let created_fresh = !existed || file.metadata()?.len() == 0;
    if created_fresh {
        file.set_len(aligned)?;
    }
    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok((MappedRegion::new(file, mmap), created_fresh))
}
