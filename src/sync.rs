//! Word-sized synchronization primitives used by the runtime.
//!
//! Both primitives park contended threads on the address of their state
//! word instead of spinning: the uncontended paths are a single CAS and
//! everything slower goes through [parking_lot_core].

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::Backoff;
use parking_lot_core::{self, ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

const LOCKED: u32 = 1;
/// Waiters are counted in the bits above the lock bit.
const WAITER: u32 = 2;

/// Unfair mutex: bit 0 is the lock, bits 1..32 count parked waiters.
///
/// This is a raw lock in the C tradition: `lock`/`unlock` pairs are the
/// caller's responsibility and there is no guard type. The collector uses
/// this to take another thread's lock and drain its buffers on its behalf,
/// which a scoped guard cannot express.
pub struct Mutex {
    state: AtomicU32,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange_weak(0, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }
    }

    #[cold]
    fn lock_slow(&self) {
        let mut backoff = Backoff::new();
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state & LOCKED == 0 {
                if self
                    .state
                    .compare_exchange_weak(
                        state,
                        state | LOCKED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return;
                }
                backoff.spin();
                continue;
            }
            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }
            self.state.fetch_add(WAITER, Ordering::Relaxed);
            let addr = &self.state as *const _ as usize;
            unsafe {
                // The validate closure runs under the bucket lock, so it
                // cannot miss an unlock that happened before we parked.
                let _ = parking_lot_core::park(
                    addr,
                    || self.state.load(Ordering::Relaxed) & LOCKED != 0,
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    None,
                );
            }
            self.state.fetch_sub(WAITER, Ordering::Relaxed);
            backoff = Backoff::new();
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state & LOCKED != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                state,
                state | LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }

    #[inline(always)]
    pub fn unlock(&self) {
        let prev = self.state.fetch_and(!LOCKED, Ordering::Release);
        debug_assert!(prev & LOCKED != 0, "unlock of an unlocked mutex");
        if prev >= WAITER {
            self.unlock_slow();
        }
    }

    #[cold]
    fn unlock_slow(&self) {
        let addr = &self.state as *const _ as usize;
        unsafe {
            parking_lot_core::unpark_one(addr, |_| DEFAULT_UNPARK_TOKEN);
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & LOCKED != 0
    }
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

const OPEN: u32 = 0;
const CLOSED: u32 = 1;

/// One-bit gate all threads can wait on. `close`/`open` flip the bit,
/// `wait` parks until it reads open. No fairness guarantees.
pub struct Fence {
    gate: AtomicU32,
}

impl Fence {
    pub const fn new() -> Self {
        Self {
            gate: AtomicU32::new(OPEN),
        }
    }

    #[inline]
    pub fn close(&self) {
        self.gate.store(CLOSED, Ordering::Release);
    }

    #[inline]
    pub fn open(&self) {
        self.gate.store(OPEN, Ordering::Release);
        let addr = &self.gate as *const _ as usize;
        unsafe {
            parking_lot_core::unpark_all(addr, DEFAULT_UNPARK_TOKEN);
        }
    }

    pub fn wait(&self) {
        while self.gate.load(Ordering::Acquire) == CLOSED {
            let addr = &self.gate as *const _ as usize;
            let result = unsafe {
                parking_lot_core::park(
                    addr,
                    || self.gate.load(Ordering::Relaxed) == CLOSED,
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    None,
                )
            };
            if let ParkResult::Invalid = result {
                // Gate opened between the load and the park.
                return;
            }
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.gate.load(Ordering::Acquire) == CLOSED
    }
}

unsafe impl Send for Fence {}
unsafe impl Sync for Fence {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn mutex_counts() {
        let mutex = Arc::new(Mutex::new());
        let value = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mutex = mutex.clone();
            let value = value.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    mutex.lock();
                    let v = value.load(Ordering::Relaxed);
                    value.store(v + 1, Ordering::Relaxed);
                    mutex.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(value.load(Ordering::Relaxed), 40_000);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn try_lock_excludes() {
        let mutex = Mutex::new();
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn fence_releases_waiters() {
        let fence = Arc::new(Fence::new());
        fence.close();
        let woke = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let fence = fence.clone();
            let woke = woke.clone();
            handles.push(std::thread::spawn(move || {
                fence.wait();
                woke.fetch_add(1, Ordering::SeqCst);
            }));
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(woke.load(Ordering::SeqCst), 0);
        fence.open();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woke.load(Ordering::SeqCst), 4);
    }
}
