//! Process-shared spinlock with dead-owner reclamation
//!
//! The lock word is the owner's process id, so the state can live in a
//! shared mapping and be contended by several processes. The owning thread
//! is recorded next to it: only that thread re-enters, and sibling threads
//! of the same process wait like any other contender.
//!
//! If the recorded owner no longer exists, a contender takes the lock over
//! and bumps `generation`, letting others notice that ownership changed
//! while they were waiting.

use crate::process::{current_process_id, current_thread_id, Liveness, SystemLiveness};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Spins before the backoff starts yielding
const SPIN_ROUNDS: u32 = 6;

/// Upper bound for a single backoff sleep
const MAX_BACKOFF: Duration = Duration::from_millis(1);

/// Lock state as laid out in shared memory
///
/// All-zero bytes are a valid unlocked state.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SpinLockState {
    /// Owning process id, 0 when unlocked
    owner_pid: AtomicU64,
    /// Thread within `owner_pid` holding the lock
    owner_tid: AtomicU64,
    recursion_count: AtomicU32,
    _pad: u32,
    /// Bumped on every release and every forced reclaim
    generation: AtomicU64,
}

impl SpinLockState {
    pub const fn new() -> Self {
        Self {
            owner_pid: AtomicU64::new(0),
            owner_tid: AtomicU64::new(0),
            recursion_count: AtomicU32::new(0),
            _pad: 0,
            generation: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn owner(&self) -> u64 {
        self.owner_pid.load(Ordering::Acquire)
    }

    #[inline]
    pub fn recursion_count(&self) -> u32 {
        self.recursion_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owner() != 0
    }
}

/// A view of a [`SpinLockState`] on behalf of one process
pub struct SpinLock<'a, L: Liveness = SystemLiveness> {
    state: &'a SpinLockState,
    pid: u64,
    liveness: L,
}

impl<'a> SpinLock<'a, SystemLiveness> {
    /// Lock view for the calling process
    pub fn new(state: &'a SpinLockState) -> Self {
        Self::for_pid(state, current_process_id(), SystemLiveness)
    }
}

impl<'a, L: Liveness> SpinLock<'a, L> {
    /// Lock view acting as `pid`, with an explicit liveness oracle
    pub fn for_pid(state: &'a SpinLockState, pid: u64, liveness: L) -> Self {
        assert_ne!(pid, 0, "pid 0 is reserved for the unlocked state");
        Self {
            state,
            pid,
            liveness,
        }
    }

    #[inline]
    pub fn pid(&self) -> u64 {
        self.pid
    }

    #[inline]
    pub fn state(&self) -> &SpinLockState {
        self.state
    }

    /// Try to acquire the lock until `timeout` elapses
    ///
    /// Always makes at least one attempt, so a zero timeout is a try-lock.
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let tid = current_thread_id();
        let mut backoff = Backoff::default();

        loop {
            let owner = self.state.owner_pid.load(Ordering::Acquire);

            if owner == self.pid {
                // Cleared before owner_pid on release, so a match means this
                // thread still holds the lock
                if self.state.owner_tid.load(Ordering::Acquire) == tid {
                    self.state.recursion_count.fetch_add(1, Ordering::AcqRel);
                    return true;
                }
            } else if owner == 0 {
                if self
                    .state
                    .owner_pid
                    .compare_exchange(0, self.pid, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.take_ownership(tid);
                    return true;
                }
            } else if !self.liveness.is_process_alive(owner) && self.reclaim_from(owner, tid) {
                return true;
            }

            if Instant::now() >= deadline {
                return false;
            }
            backoff.snooze(deadline);
        }
    }

    fn take_ownership(&self, tid: u64) {
        self.state.owner_tid.store(tid, Ordering::Release);
        self.state.recursion_count.store(1, Ordering::Release);
    }

    /// Take the lock over from a dead owner
    fn reclaim_from(&self, dead_owner: u64, tid: u64) -> bool {
        // Only one contender may win the takeover
        if self
            .state
            .owner_pid
            .compare_exchange(dead_owner, self.pid, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.take_ownership(tid);
        let generation = self.state.generation.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            dead_owner,
            pid = self.pid,
            generation,
            "Reclaimed spinlock from dead owner"
        );
        true
    }

    /// Release one level of ownership
    ///
    /// # Panics
    /// If the calling thread does not own the lock. That is a pairing bug
    /// and continuing would corrupt the shared state.
    pub fn unlock(&self) {
        let owner = self.state.owner_pid.load(Ordering::Acquire);
        let owner_tid = self.state.owner_tid.load(Ordering::Acquire);
        let tid = current_thread_id();
        if owner != self.pid || owner_tid != tid {
            panic!(
                "spinlock unlocked by pid {} (tid {}) but owned by pid {} (tid {})",
                self.pid, tid, owner, owner_tid
            );
        }

        let prev = self.state.recursion_count.fetch_sub(1, Ordering::AcqRel);
        if prev <= 1 {
            self.state.recursion_count.store(0, Ordering::Release);
            self.state.owner_tid.store(0, Ordering::Release);
            // Generation moves before the lock becomes visible as free
            self.state.generation.fetch_add(1, Ordering::AcqRel);
            self.state.owner_pid.store(0, Ordering::Release);
        }
    }

    /// Acquire with a guard that unlocks on drop
    pub fn lock_for(&self, timeout: Duration) -> Option<SpinLockGuard<'_, 'a, L>> {
        self.try_lock_for(timeout)
            .then(|| SpinLockGuard { lock: self })
    }
}

/// Releases one level of a [`SpinLock`] when dropped
pub struct SpinLockGuard<'g, 'a, L: Liveness> {
    lock: &'g SpinLock<'a, L>,
}

impl<L: Liveness> Drop for SpinLockGuard<'_, '_, L> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Exponential backoff: spin, then yield, then sleep
#[derive(Default)]
struct Backoff {
    step: u32,
}

impl Backoff {
    fn snooze(&mut self, deadline: Instant) {
        if self.step < SPIN_ROUNDS {
            for _ in 0..(1u32 << self.step) {
                core::hint::spin_loop();
            }
        } else if self.step == SPIN_ROUNDS {
            thread::yield_now();
        } else {
            let exp = (self.step - SPIN_ROUNDS).min(10);
            let nap = Duration::from_micros(1 << exp).min(MAX_BACKOFF);
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(nap.min(remaining));
        }
        self.step = self.step.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Reports every pid alive except the ones marked dead
    #[derive(Default)]
    struct FakeLiveness {
        dead: Mutex<HashSet<u64>>,
    }

    impl FakeLiveness {
        fn kill(&self, pid: u64) {
            self.dead.lock().insert(pid);
        }
    }

    impl Liveness for FakeLiveness {
        fn is_process_alive(&self, pid: u64) -> bool {
            !self.dead.lock().contains(&pid)
        }
    }

    #[test]
    fn test_lock_unlock_bumps_generation() {
        let state = SpinLockState::new();
        let lock = SpinLock::new(&state);

        assert!(lock.try_lock_for(Duration::ZERO));
        assert_eq!(state.owner(), current_process_id());
        assert_eq!(state.recursion_count(), 1);

        lock.unlock();
        assert!(!state.is_locked());
        assert_eq!(state.recursion_count(), 0);
        assert_eq!(state.generation(), 1);
    }

    #[test]
    fn test_owner_thread_reentry() {
        let state = SpinLockState::new();
        let oracle = FakeLiveness::default();
        let lock = SpinLock::for_pid(&state, 100, &oracle);

        assert!(lock.try_lock_for(Duration::ZERO));
        assert!(lock.try_lock_for(Duration::ZERO));
        assert_eq!(state.recursion_count(), 2);

        lock.unlock();
        assert_eq!(state.owner(), 100);
        assert_eq!(state.generation(), 0);

        lock.unlock();
        assert!(!state.is_locked());
        assert_eq!(state.generation(), 1);
    }

    #[test]
    fn test_live_owner_blocks_until_timeout() {
        let state = SpinLockState::new();
        let oracle = FakeLiveness::default();
        let holder = SpinLock::for_pid(&state, 100, &oracle);
        let contender = SpinLock::for_pid(&state, 200, &oracle);

        assert!(holder.try_lock_for(Duration::ZERO));

        let start = Instant::now();
        assert!(!contender.try_lock_for(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(state.owner(), 100);
    }

    #[test]
    fn test_dead_owner_is_reclaimed() {
        let state = SpinLockState::new();
        let oracle = FakeLiveness::default();
        let crashed = SpinLock::for_pid(&state, 100, &oracle);
        let survivor = SpinLock::for_pid(&state, 200, &oracle);

        assert!(crashed.try_lock_for(Duration::ZERO));
        assert!(crashed.try_lock_for(Duration::ZERO));
        let before = state.generation();

        oracle.kill(100);
        let start = Instant::now();
        assert!(survivor.try_lock_for(Duration::from_secs(1)));
        assert!(start.elapsed() < Duration::from_secs(1));

        assert_eq!(state.owner(), 200);
        assert_eq!(state.recursion_count(), 1);
        assert!(state.generation() > before);
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let state = Arc::new(SpinLockState::new());
        let oracle = Arc::new(FakeLiveness::default());

        let holder = SpinLock::for_pid(&state, 100, &*oracle);
        assert!(holder.try_lock_for(Duration::ZERO));

        let waiter = {
            let state = Arc::clone(&state);
            let oracle = Arc::clone(&oracle);
            thread::spawn(move || {
                let lock = SpinLock::for_pid(&state, 200, &*oracle);
                let acquired = lock.try_lock_for(Duration::from_secs(5));
                if acquired {
                    lock.unlock();
                }
                acquired
            })
        };

        thread::sleep(Duration::from_millis(20));
        holder.unlock();
        assert!(waiter.join().unwrap());
        assert_eq!(state.generation(), 2);
    }

    #[test]
    fn test_mutual_exclusion_across_pids() {
        let state = Arc::new(SpinLockState::new());
        let counter = Arc::new(AtomicU64::new(0));
        let inside = Arc::new(AtomicU32::new(0));
        let oracle = Arc::new(FakeLiveness::default());

        let workers: Vec<_> = (1..=4u64)
            .map(|pid| {
                let state = Arc::clone(&state);
                let oracle = Arc::clone(&oracle);
                let counter = Arc::clone(&counter);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    let lock = SpinLock::for_pid(&state, pid, &*oracle);
                    for _ in 0..500 {
                        let _guard = lock.lock_for(Duration::from_secs(10)).unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        counter.fetch_add(1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
        assert!(!state.is_locked());
    }

    #[test]
    fn test_threads_of_one_process_exclude_each_other() {
        let state = Arc::new(SpinLockState::new());
        let inside = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(AtomicU64::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                let inside = Arc::clone(&inside);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    let lock = SpinLock::new(&state);
                    for _ in 0..20_000 {
                        assert!(lock.try_lock_for(Duration::from_secs(10)));
                        // Nested acquire by the holder
                        assert!(lock.try_lock_for(Duration::ZERO));
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        counter.fetch_add(1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.unlock();
                        lock.unlock();
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 80_000);
        assert!(!state.is_locked());
        assert_eq!(state.recursion_count(), 0);
    }

    #[test]
    fn test_sibling_thread_waits_for_holder() {
        let state = Arc::new(SpinLockState::new());
        let lock = SpinLock::new(&state);
        assert!(lock.try_lock_for(Duration::ZERO));

        let sibling = {
            let state = Arc::clone(&state);
            thread::spawn(move || SpinLock::new(&state).try_lock_for(Duration::from_millis(50)))
        };
        assert!(!sibling.join().unwrap());
        assert_eq!(state.recursion_count(), 1);

        lock.unlock();
        assert!(!state.is_locked());
    }

    #[test]
    #[should_panic(expected = "spinlock unlocked by pid 200")]
    fn test_unlock_by_non_owner_panics() {
        let state = SpinLockState::new();
        let oracle = FakeLiveness::default();
        let owner = SpinLock::for_pid(&state, 100, &oracle);
        let intruder = SpinLock::for_pid(&state, 200, &oracle);

        assert!(owner.try_lock_for(Duration::ZERO));
        intruder.unlock();
    }
}
