//! A FIFO-fair spinlock over two atomic counters.

use std::sync::atomic::{AtomicU32, Ordering};

/// Ticket lock: acquire takes a ticket, release advances the serving
/// counter. Waiters are served strictly in arrival order, and because both
/// atomics live wherever the struct is placed, the lock works across
/// processes when embedded in shared memory. Not re-entrant.
#[repr(C)]
pub struct TicketMutex {
    ticket: AtomicU32,
    serving: AtomicU32,
}

impl TicketMutex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ticket: AtomicU32::new(0),
            serving: AtomicU32::new(0),
        }
    }

    /// Reset both counters. Only valid while no other process holds or
    /// waits on the lock, i.e. during segment initialization.
    pub fn reset(&self) {
        self.ticket.store(0, Ordering::SeqCst);
        self.serving.store(0, Ordering::SeqCst);
    }

    /// Acquire the lock, spinning until our ticket is served.
    pub fn lock(&self) -> TicketGuard<'_> {
        let ticket = self.ticket.fetch_add(1, Ordering::AcqRel);
        while self.serving.load(Ordering::Acquire) != ticket {
            std::hint::spin_loop();
        }
        TicketGuard { mutex: self }
    }
}

impl Default for TicketMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the lock when dropped.
pub struct TicketGuard<'a> {
    mutex: &'a TicketMutex,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.mutex.serving.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;

    struct Shared {
        mutex: TicketMutex,
        counter: UnsafeCell<u64>,
    }

    unsafe impl Sync for Shared {}

    #[test]
    fn test_mutual_exclusion() {
        const THREADS: usize = 8;
        const ITERS: u64 = 10_000;

        let shared = Shared {
            mutex: TicketMutex::new(),
            counter: UnsafeCell::new(0),
        };

        let shared_ref: &Shared = &shared;
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(move || {
                    let shared = shared_ref;
                    for _ in 0..ITERS {
                        let _guard = shared.mutex.lock();
                        // The unsynchronized increment is only sound if the
                        // lock actually excludes.
                        unsafe { *shared.counter.get() += 1 };
                    }
                });
            }
        });

        assert_eq!(unsafe { *shared.counter.get() }, THREADS as u64 * ITERS);
    }

    #[test]
    fn test_sequential_reacquire() {
        let mutex = TicketMutex::new();
        for _ in 0..100 {
            let guard = mutex.lock();
            drop(guard);
        }
    }
}
