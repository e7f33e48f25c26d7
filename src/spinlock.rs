//! Persistent spin-lock embedded in a container's `part` user-data.
//!
//! Unlike an in-process mutex, this lock lives inside memory that is
//! shared across processes mapping the same container (the partition
//! metadata list must be mutated under mutual exclusion regardless of
//! which process is driving it). It is modelled on the latch-and-spin
//! technique of a conventional reader/writer spinlock, simplified to
//! single-owner mutual exclusion plus an owner/deadline pair so that a
//! lock abandoned by a crashed holder can be reclaimed.
//!
//! Layout of the packed word:
//! * bits [0-31]  owning pid (0 == unlocked)
//! * bits [32-63] monotonic epoch, bumped every successful acquire

use std::{
    sync::atomic::{AtomicU64, Ordering::SeqCst},
    thread, time,
};

/// No deadline: spin until the lock is acquired.
pub const INFINITE: i64 = -1;

/// A process can hold this lock for at most this long before a
/// contending acquirer is permitted to treat it as abandoned and steal
/// it. This bounds the damage a crashed holder can do to liveness.
const ABANDON_AFTER: time::Duration = time::Duration::from_secs(30);

/// Persistent, cross-process spin-lock.
///
/// `PartLock` wraps a raw `AtomicU64` so that it can be embedded
/// directly inside a memory-mapped or file-backed user-data region; it
/// carries no heap allocation of its own.
#[repr(transparent)]
pub struct PartLock {
    word: AtomicU64,
}

impl PartLock {
    pub const fn new() -> PartLock {
        PartLock {
            word: AtomicU64::new(0),
        }
    }

    /// Construct a view over an already-initialized word, e.g. one
    /// just read back from disk.
    pub fn from_raw(raw: u64) -> PartLock {
        PartLock {
            word: AtomicU64::new(raw),
        }
    }

    pub fn to_raw(&self) -> u64 {
        self.word.load(SeqCst)
    }

    fn owner_of(word: u64) -> u32 {
        (word & 0xFFFF_FFFF) as u32
    }

    /// Acquire the lock, spinning until either the lock becomes free
    /// or `deadline_ms` elapses (`INFINITE` spins forever). Returns a
    /// guard that releases the lock on drop.
    ///
    /// A lock held longer than [`ABANDON_AFTER`] is treated as
    /// abandoned by a crashed holder and is stolen unconditionally;
    /// this is the only escape hatch from an unbounded wait.
    pub fn acquire(&self, deadline_ms: i64) -> Option<PartLockGuard<'_>> {
        let pid = std::process::id();
        let start = time::Instant::now();
        let held_since = time::Instant::now();
        loop {
            let cur = self.word.load(SeqCst);
            if Self::owner_of(cur) == 0 {
                let epoch = (cur >> 32).wrapping_add(1);
                let next = (epoch << 32) | (pid as u64);
                if self
                    .word
                    .compare_exchange(cur, next, SeqCst, SeqCst)
                    .is_ok()
                {
                    return Some(PartLockGuard { lock: self });
                }
            } else if held_since.elapsed() >= ABANDON_AFTER {
                // Abandoned by a crashed holder: steal the lock.
                let epoch = (cur >> 32).wrapping_add(1);
                let next = (epoch << 32) | (pid as u64);
                if self
                    .word
                    .compare_exchange(cur, next, SeqCst, SeqCst)
                    .is_ok()
                {
                    return Some(PartLockGuard { lock: self });
                }
            }
            if deadline_ms != INFINITE && start.elapsed().as_millis() as i64 >= deadline_ms {
                return None;
            }
            thread::yield_now();
        }
    }
}

impl Default for PartLock {
    fn default() -> PartLock {
        PartLock::new()
    }
}

/// RAII guard releasing [`PartLock`] on drop.
pub struct PartLockGuard<'a> {
    lock: &'a PartLock,
}

impl<'a> Drop for PartLockGuard<'a> {
    fn drop(&mut self) {
        let cur = self.lock.word.load(SeqCst);
        let epoch = cur & !0xFFFF_FFFFu64;
        self.lock.word.store(epoch, SeqCst);
    }
}
