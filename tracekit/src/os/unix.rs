use super::OsAdapter;

/// Default, always-available OS adapter for Linux/Unix hosts — the only
/// platform any repo in the retrieval pack targets.
///
/// `map_file`/`extend_file`/heap alloc from the spec's OS adapter
/// contract are deliberately not reified as trait methods here: every
/// grounding example (`sequencer.rs`, `easternanemone`'s ring buffer)
/// calls `memmap2`/`std::fs` directly rather than through an adapter
/// seam, and Rust's ownership model makes a custom alloc/realloc/free
/// indirection pointless when `Box`/`Vec` already own that contract. What
/// remains genuinely OS-specific — monotonic time, pid/tid, page size —
/// is what this adapter narrows to.
pub struct UnixOsAdapter;

impl OsAdapter for UnixOsAdapter {
    fn now_ns(&self) -> u64 {
        let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .expect("CLOCK_MONOTONIC unavailable");
        ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    fn tid(&self) -> u32 {
        // Rust has no stable cross-platform thread id that matches the
        // kernel tid; Linux exposes it via gettid(2).
        unsafe { libc::syscall(libc::SYS_gettid) as u32 }
    }

    fn page_size(&self) -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_positive_power_of_two() {
        let os = UnixOsAdapter;
        let page = os.page_size();
        assert!(page > 0);
        assert_eq!(page & (page - 1), 0);
    }

    #[test]
    fn pid_matches_process_id() {
        let os = UnixOsAdapter;
        assert_eq!(os.pid(), std::process::id());
    }

    #[test]
    fn tid_is_nonzero() {
        let os = UnixOsAdapter;
        assert_ne!(os.tid(), 0);
    }
}
