//! Cross-process mutex embedded in the mapped file header (spec §5, §9
//! design note, strategy (b)): a ticket lock with an owner pid and
//! heartbeat so a waiter can recover from a holder that died mid-critical-
//! section, rather than depending on a platform `PTHREAD_MUTEX_ROBUST`
//! primitive no crate in the retrieval pack exposes portably.
//!
//! Record integrity never depends on this lock surviving a crash — it
//! only serialises writers; a torn write is still caught by per-record
//! CRC (spec §5).

use std::sync::atomic::Ordering;

use tracekit_common::CrossProcessMutex;

use crate::os::OsAdapter;

/// If the ticket currently being served hasn't refreshed its heartbeat
/// within this window, a waiter assumes the holder died and steals the
/// lock.
const HEARTBEAT_TIMEOUT_NS: u64 = 200_000_000; // 200ms

pub struct MutexGuard<'a> {
    mutex: &'a CrossProcessMutex,
    ticket: u64,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.owner_alive.store(0, Ordering::Release);
        self.mutex
            .ticket_serving
            .store(self.ticket.wrapping_add(1), Ordering::Release);
    }
}

pub fn lock<'a>(mutex: &'a CrossProcessMutex, os: &dyn OsAdapter) -> MutexGuard<'a> {
    let ticket = mutex.ticket_next.fetch_add(1, Ordering::AcqRel);

    loop {
        let serving = mutex.ticket_serving.load(Ordering::Acquire);
        if serving == ticket {
            break;
        }

        if mutex.owner_alive.load(Ordering::Acquire) != 0 {
            let heartbeat = mutex.owner_heartbeat_ns.load(Ordering::Acquire);
            let now = os.now_ns();
            if now.saturating_sub(heartbeat) > HEARTBEAT_TIMEOUT_NS {
                // Holder appears dead: force the ticket forward to ours.
                // A losing racer's compare_exchange simply fails and it
                // re-reads `serving` on the next loop iteration.
                let _ = mutex.ticket_serving.compare_exchange(
                    serving,
                    ticket,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                mutex.owner_alive.store(0, Ordering::Release);
                continue;
            }
        }

        std::thread::yield_now();
    }

    mutex.owner_pid.store(os.pid(), Ordering::Relaxed);
    mutex.owner_heartbeat_ns.store(os.now_ns(), Ordering::Relaxed);
    mutex.owner_alive.store(1, Ordering::Release);

    MutexGuard { mutex, ticket }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::UnixOsAdapter;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn single_threaded_lock_unlock() {
        let os = UnixOsAdapter;
        let mu = CrossProcessMutex::zeroed();
        {
            let _g = lock(&mu, &os);
            assert_eq!(mu.owner_alive.load(Ordering::Acquire), 1);
        }
        assert_eq!(mu.owner_alive.load(Ordering::Acquire), 0);
        assert_eq!(mu.ticket_serving.load(Ordering::Acquire), 1);
    }

    #[test]
    fn serialises_concurrent_increments() {
        let mu = Arc::new(CrossProcessMutex::zeroed());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let mu = Arc::clone(&mu);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                let os = UnixOsAdapter;
                for _ in 0..1000 {
                    let _g = lock(&mu, &os);
                    let before = counter.load(Ordering::Relaxed);
                    counter.store(before + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8000);
    }

    #[test]
    fn recovers_from_stale_heartbeat() {
        let os = UnixOsAdapter;
        let mu = CrossProcessMutex::zeroed();
        // Simulate a holder that acquired ticket 0 and died without
        // releasing: ticket_next already advanced, owner marked alive,
        // heartbeat far in the past.
        mu.ticket_next.store(1, Ordering::Relaxed);
        mu.owner_alive.store(1, Ordering::Relaxed);
        mu.owner_heartbeat_ns.store(0, Ordering::Relaxed);

        let _g = lock(&mu, &os);
        assert_eq!(mu.owner_alive.load(Ordering::Acquire), 1);
    }
}
