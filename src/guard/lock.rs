//! Segment lock
//!
//! A spin lock whose word lives in the segment header and holds the owner
//! id of the holder (0 = free), plus a few reader slots next to it.
//!
//! An owner id packs the pid in the low half and the holding handle's token
//! in the high half, so two handles of one process never mistake each other
//! for a dead holder.
//!
//! ## Acquisition
//! 1. CAS 0 → own id
//! 2. On contention, back off: busy spin, then yield, then short sleeps
//! 3. Between rounds, check the recorded holder; if it is abandoned CAS
//!    holder → own id and report the lock as stolen
//! 4. Give up with `LockTimeout` once the retry budget is spent
//!
//! ## Readers
//! A reader takes the word, claims a free slot with its id and hands the
//! word back. A writer keeps the word and waits for every slot to empty,
//! clearing slots whose owner is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

use crate::error::{CacheError, Result};

use super::liveness::{process_alive, token_is_live};

/// Longest single sleep between attempts once spinning is exhausted
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// Bounded retry budget for one acquisition
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub spin_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            spin_limit: 64,
        }
    }
}

/// How the lock was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The word was free
    Clean,
    /// The word named a holder that no longer exists
    Stolen { from: u32 },
}

// =============================================================================
// Owner Ids
// =============================================================================

pub fn owner_id(pid: u32, token: u32) -> u64 {
    (u64::from(token) << 32) | u64::from(pid)
}

pub fn owner_pid(id: u64) -> u32 {
    id as u32
}

fn owner_token(id: u64) -> u32 {
    (id >> 32) as u32
}

/// Whether `holder` can no longer release what it holds
///
/// Same pid as `me`: abandoned once the token belongs to no open handle
/// (a handle that leaked its hold, or an earlier process with our pid).
fn abandoned(holder: u64, me: u64) -> bool {
    let pid = owner_pid(holder);
    if pid == owner_pid(me) {
        !token_is_live(owner_token(holder))
    } else {
        !process_alive(pid)
    }
}

// =============================================================================
// Exclusive Word
// =============================================================================

/// Take the lock word for `me`
pub fn acquire(word: &AtomicU64, me: u64, policy: &RetryPolicy) -> Result<Acquired> {
    let start = Instant::now();
    let mut wait = Wait::new(policy);

    loop {
        let holder = match word.compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return Ok(Acquired::Clean),
            Err(holder) => holder,
        };

        if wait.spinning() {
            continue;
        }

        if abandoned(holder, me) {
            if word
                .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(Acquired::Stolen {
                    from: owner_pid(holder),
                });
            }
            continue;
        }

        wait.pause(start, owner_pid(holder))?;
    }
}

/// Hand the lock back; a no-op if the word no longer names `me`
pub fn release(word: &AtomicU64, me: u64) {
    let _ = word.compare_exchange(me, 0, Ordering::Release, Ordering::Relaxed);
}

// =============================================================================
// Reader Slots
// =============================================================================

/// Claim a free slot for `me`; `None` when all are taken
///
/// Only called while holding the word, so no writer can be draining.
pub fn claim_slot(slots: &[AtomicU64], me: u64) -> Option<usize> {
    slots.iter().position(|slot| {
        slot.compare_exchange(0, me, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    })
}

pub fn release_slot(slot: &AtomicU64, me: u64) {
    let _ = slot.compare_exchange(me, 0, Ordering::Release, Ordering::Relaxed);
}

/// Wait until no live reader holds a slot
///
/// Called with the word held, so no new reader can arrive. Slots of dead
/// readers are cleared; the number cleared is returned.
pub fn drain_readers(slots: &[AtomicU64], me: u64, policy: &RetryPolicy) -> Result<u32> {
    let start = Instant::now();
    let mut wait = Wait::new(policy);
    let mut cleared = 0;

    loop {
        let mut busy = None;
        for slot in slots {
            let owner = slot.load(Ordering::Acquire);
            if owner == 0 {
                continue;
            }
            if wait.spent_spinning() && abandoned(owner, me) {
                if slot
                    .compare_exchange(owner, 0, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    cleared += 1;
                }
                continue;
            }
            busy = Some(owner);
        }

        match busy {
            None => return Ok(cleared),
            Some(_) if wait.spinning() => {}
            Some(owner) => wait.pause(start, owner_pid(owner))?,
        }
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Spin, then snooze, then sleep, all inside the policy's budget
struct Wait<'a> {
    policy: &'a RetryPolicy,
    backoff: Backoff,
    spins: u32,
    sleep: Duration,
}

impl<'a> Wait<'a> {
    fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            backoff: Backoff::new(),
            spins: 0,
            sleep: Duration::from_micros(20),
        }
    }

    /// Busy-spin once if the spin budget allows
    fn spinning(&mut self) -> bool {
        if self.spins < self.policy.spin_limit {
            self.spins += 1;
            self.backoff.spin();
            true
        } else {
            false
        }
    }

    fn spent_spinning(&self) -> bool {
        self.spins >= self.policy.spin_limit
    }

    /// Back off once, or fail with `LockTimeout` naming `holder`
    fn pause(&mut self, start: Instant, holder: u32) -> Result<()> {
        let waited = start.elapsed();
        if waited >= self.policy.timeout {
            return Err(CacheError::LockTimeout {
                holder,
                waited_ms: waited.as_millis() as u64,
            });
        }

        if !self.backoff.is_completed() {
            self.backoff.snooze();
        } else {
            thread::sleep(self.sleep.min(self.policy.timeout.saturating_sub(waited)));
            self.sleep = (self.sleep * 2).min(MAX_SLEEP);
        }
        Ok(())
    }
}
