//! Binds a name to a concrete file hosting one ring buffer and one unique
//! stack (spec §4.3), and keeps the process-wide name→handle registry that
//! deduplicates handles within a process (spec §9 "Global registry of
//! tracebuffers").

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracekit_common::{
    is_valid_tracebuffer_name, RING_BUFFER_HEADER_SIZE, UNIQUE_STACK_HEADER_SIZE, USER_TRACE_EXT,
};

use crate::config::Config;
use crate::error::{TraceError, TraceResult};
use crate::mapping::{self, MappedRegion};
use crate::os::{OsAdapter, UnixOsAdapter};
use crate::ring_buffer::RingBuffer;
use crate::unique_stack::UniqueStack;

/// Process-wide `name -> handle` map, guarded by a single mutex (spec §9:
/// "initialise lazily on first bind"), mirroring the
/// `once_cell::sync::Lazy` static already used for the teacher's
/// hostname cache.
static REGISTRY: Lazy<Mutex<HashMap<String, Arc<Tracebuffer>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub struct Tracebuffer {
    name: String,
    ring: RingBuffer,
    stack: UniqueStack,
    os: Arc<dyn OsAdapter>,
    /// Offsets for dynamic catalog entries already synthesised at this
    /// call site, keyed by `(source_file, source_line, format)`; cleared
    /// by `reset()` (spec §4.3: "drops any cached catalog offsets").
    dynamic_cache: Mutex<HashMap<(String, u32, String), u32>>,
}

impl Tracebuffer {
    /// `bind(name, ring_space_size) -> handle` (spec §4.3).
    ///
    /// `ring_space_size` is the ring buffer's declared space (header +
    /// body); the unique stack is appended immediately after it and starts
    /// with an empty body, growing on demand.
    pub fn bind(name: &str, ring_space_size: u64) -> TraceResult<Arc<Tracebuffer>> {
        Self::bind_with(name, ring_space_size, &Config::load(), Arc::new(UnixOsAdapter))
    }

    /// Same as [`Self::bind`] but with an explicit config and OS adapter,
    /// for tests and embedders that don't want process-global defaults.
    pub fn bind_with(
        name: &str,
        ring_space_size: u64,
        config: &Config,
        os: Arc<dyn OsAdapter>,
    ) -> TraceResult<Arc<Tracebuffer>> {
        if !is_valid_tracebuffer_name(name) {
            return Err(TraceError::InvalidName(name.to_string()));
        }

        let mut registry = REGISTRY.lock().unwrap();
        if let Some(existing) = registry.get(name) {
            if existing.ring.capacity() + RING_BUFFER_HEADER_SIZE as u64 != ring_space_size {
                return Err(TraceError::SizeMismatch {
                    name: name.to_string(),
                    existing: existing.ring.capacity() + RING_BUFFER_HEADER_SIZE as u64,
                    requested: ring_space_size,
                });
            }
            return Ok(Arc::clone(existing));
        }

        if ring_space_size < RING_BUFFER_HEADER_SIZE as u64 {
            return Err(TraceError::RegionTooSmall(ring_space_size));
        }

        let path = Self::path_for(config, name);
        let unique_header_offset = ring_space_size;
        let initial_len = os.page_align(unique_header_offset + UNIQUE_STACK_HEADER_SIZE as u64);
        let (region, created_fresh) = mapping::open_or_create(&path, initial_len, os.as_ref())?;
        let region = Arc::new(region);

        if !created_fresh {
            let declared = peek_ring_body_size(&region, os.as_ref())?;
            let requested_body = ring_space_size - RING_BUFFER_HEADER_SIZE as u64;
            if declared != requested_body {
                return Err(TraceError::SizeMismatch {
                    name: name.to_string(),
                    existing: declared + RING_BUFFER_HEADER_SIZE as u64,
                    requested: ring_space_size,
                });
            }
        }

        let ring = if created_fresh {
            RingBuffer::init(Arc::clone(&region), 0, ring_space_size, Arc::clone(&os))?
        } else {
            RingBuffer::open(Arc::clone(&region), 0, ring_space_size, Arc::clone(&os))?
        };

        let stack = if created_fresh {
            UniqueStack::init(Arc::clone(&region), unique_header_offset, Arc::clone(&os))?
        } else {
            UniqueStack::open(Arc::clone(&region), unique_header_offset, Arc::clone(&os))?
        };

        let tb = Arc::new(Tracebuffer {
            name: name.to_string(),
            ring,
            stack,
            os,
            dynamic_cache: Mutex::new(HashMap::new()),
        });
        registry.insert(name.to_string(), Arc::clone(&tb));
        tracing::info!(tracebuffer = %name, path = %path.display(), created = created_fresh, "tracebuffer bound");
        Ok(tb)
    }

    /// Looks up an already-bound tracebuffer by name, without creating one
    /// (used by `emit_dynamic`, which "no-ops if absent" per spec §4.5).
    pub fn lookup(name: &str) -> Option<Arc<Tracebuffer>> {
        REGISTRY.lock().unwrap().get(name).cloned()
    }

    fn path_for(config: &Config, name: &str) -> PathBuf {
        config.tracing_path.join(format!("{name}.{USER_TRACE_EXT}"))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn stack(&self) -> &UniqueStack {
        &self.stack
    }

    pub fn os(&self) -> &Arc<dyn OsAdapter> {
        &self.os
    }

    /// Returns the cached dynamic catalog offset for this call site, if
    /// one was already synthesised, without touching the unique stack.
    pub(crate) fn dynamic_offset(&self, file: &str, line: u32, format: &str) -> Option<u32> {
        self.dynamic_cache
            .lock()
            .unwrap()
            .get(&(file.to_string(), line, format.to_string()))
            .copied()
    }

    pub(crate) fn cache_dynamic_offset(&self, file: &str, line: u32, format: &str, offset: u32) {
        self.dynamic_cache
            .lock()
            .unwrap()
            .insert((file.to_string(), line, format.to_string()), offset);
    }

    /// `reset()` (spec §4.3): clears the ring buffer and drops cached
    /// dynamic catalog offsets; the unique stack is left intact so format
    /// strings already stored remain addressable.
    pub fn reset(&self) {
        self.ring.clear();
        self.dynamic_cache.lock().unwrap().clear();
    }
}

/// Peeks at an existing file's declared ring-buffer body size without
/// constructing a full `RingBuffer`, so a size mismatch can be reported
/// before `RingBuffer::open`'s own (coarser) validation runs.
fn peek_ring_body_size(region: &Arc<MappedRegion>, _os: &dyn OsAdapter) -> TraceResult<u64> {
    use std::sync::atomic::Ordering;
    use tracekit_common::RingBufferHeader;

    if region.len() < RING_BUFFER_HEADER_SIZE as u64 {
        return Err(TraceError::RegionTooSmall(region.len()));
    }
    Ok(region.with_ptr(|base, _len| {
        let header = unsafe { &*(base as *const RingBufferHeader) };
        header.body_size.load(Ordering::Acquire)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        let os = UnixOsAdapter;
        format!("{prefix}{}", os.pid())
    }

    #[test]
    fn bind_twice_in_same_process_returns_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            tracing_path: dir.path().to_path_buf(),
            verbosity: Default::default(),
        };
        let name = unique_name("bindtwice");
        let a = Tracebuffer::bind_with(&name, 1024, &config, Arc::new(UnixOsAdapter)).unwrap();
        let b = Tracebuffer::bind_with(&name, 1024, &config, Arc::new(UnixOsAdapter)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn bind_rejects_invalid_name() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            tracing_path: dir.path().to_path_buf(),
            verbosity: Default::default(),
        };
        let err =
            Tracebuffer::bind_with("1bad", 1024, &config, Arc::new(UnixOsAdapter)).unwrap_err();
        assert!(matches!(err, TraceError::InvalidName(_)));
    }

    #[test]
    fn reopen_with_different_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            tracing_path: dir.path().to_path_buf(),
            verbosity: Default::default(),
        };
        let name = unique_name("resizemismatch");
        {
            let tb =
                Tracebuffer::bind_with(&name, 1024, &config, Arc::new(UnixOsAdapter)).unwrap();
            assert_eq!(tb.name(), name);
        }
        // Different process would reopen the file on disk; simulate that
        // here by clearing the in-process registry entry first.
        REGISTRY.lock().unwrap().remove(&name);
        let err = Tracebuffer::bind_with(&name, 2048, &config, Arc::new(UnixOsAdapter))
            .unwrap_err();
        assert!(matches!(err, TraceError::SizeMismatch { .. }));
    }

    #[test]
    fn reset_clears_ring_but_keeps_unique_stack() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            tracing_path: dir.path().to_path_buf(),
            verbosity: Default::default(),
        };
        let name = unique_name("resetkeeps");
        let tb = Tracebuffer::bind_with(&name, 1024, &config, Arc::new(UnixOsAdapter)).unwrap();
        tb.ring().put(b"hello");
        let offset = tb.stack().add(b"format string").unwrap();
        tb.reset();
        assert_eq!(tb.ring().occupied(), 0);
        assert_eq!(tb.stack().read_at(offset, 13), b"format string");
    }
}
