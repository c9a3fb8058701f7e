//! Concurrency Guard Module
//!
//! Segment-wide reader/writer exclusion across threads and processes.
//!
//! ## Responsibilities
//! - Serialize threads of this process on the handle (parking_lot rwlock,
//!   timed so a wedged thread cannot block forever)
//! - Serialize processes on the lock word in the segment header, letting
//!   readers overlap through the reader slots
//! - Reclaim the word and reader slots from holders that died without
//!   releasing them
//!
//! ## Lock Order
//! ```text
//! in-process rwlock ──▶ segment lock word ──▶ drain reader slots ──▶ (mutation)
//!                                         └─▶ claim reader slot, drop word ──▶ (read)
//! ```

mod liveness;
mod lock;

use std::sync::atomic::AtomicU64;
use std::time::Instant;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{CacheError, Result};

use liveness::{current_pid, HandleToken};
use lock::{acquire, claim_slot, drain_readers, owner_id, release, release_slot};

pub use lock::{Acquired, RetryPolicy};

/// The header words the guard works on
#[derive(Clone, Copy)]
pub struct Words<'a> {
    pub lock: &'a AtomicU64,
    pub readers: &'a [AtomicU64],
}

/// Per-handle guard state
pub struct Guard {
    local: RwLock<()>,
    policy: RetryPolicy,
    token: HandleToken,
    pid: u32,
}

impl Guard {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            local: RwLock::new(()),
            policy,
            token: HandleToken::new(),
            pid: current_pid(),
        }
    }

    /// Owner id this handle writes into the lock word and reader slots
    pub fn id(&self) -> u64 {
        owner_id(self.pid, self.token.get())
    }

    /// Take the word for a writer
    ///
    /// Readers of other handles may still be in their slots; call
    /// [`Held::drain`] before writing anything.
    pub fn lock<'a>(&'a self, words: Words<'a>) -> Result<Held<'a>> {
        let start = Instant::now();
        let local = self
            .local
            .try_write_for(self.policy.timeout)
            .ok_or_else(|| self.local_timeout(start))?;
        self.take_word(Local::Exclusive(local), words, start)
    }

    /// Take the word on the way to a shared hold
    ///
    /// Threads of this handle may share it; [`Held::into_shared`] lets
    /// readers of other handles in as well.
    pub fn lock_shared<'a>(&'a self, words: Words<'a>) -> Result<Held<'a>> {
        let start = Instant::now();
        let local = self
            .local
            .try_read_for(self.policy.timeout)
            .ok_or_else(|| self.local_timeout(start))?;
        self.take_word(Local::Shared(local), words, start)
    }

    fn take_word<'a>(
        &'a self,
        local: Local<'a>,
        words: Words<'a>,
        start: Instant,
    ) -> Result<Held<'a>> {
        // Whatever is left of the budget goes to the cross-process word
        let policy = self.remaining(start);
        let me = self.id();
        let acquired = acquire(words.lock, me, &policy)?;

        Ok(Held {
            local,
            word: WordHold {
                word: words.lock,
                me,
            },
            readers: words.readers,
            acquired,
            guard: self,
            start,
        })
    }

    fn remaining(&self, start: Instant) -> RetryPolicy {
        RetryPolicy {
            timeout: self.policy.timeout.saturating_sub(start.elapsed()),
            ..self.policy
        }
    }

    fn local_timeout(&self, start: Instant) -> CacheError {
        CacheError::LockTimeout {
            holder: self.pid,
            waited_ms: start.elapsed().as_millis() as u64,
        }
    }
}

// Variants are held only for their drop
#[allow(dead_code)]
enum Local<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

/// The lock word, released on drop (including on unwind)
struct WordHold<'a> {
    word: &'a AtomicU64,
    me: u64,
}

impl Drop for WordHold<'_> {
    fn drop(&mut self) {
        release(self.word, self.me);
    }
}

/// A reader slot, released on drop
struct SlotHold<'a> {
    slot: &'a AtomicU64,
    me: u64,
}

impl Drop for SlotHold<'_> {
    fn drop(&mut self) {
        release_slot(self.slot, self.me);
    }
}

/// The segment lock word, held
pub struct Held<'a> {
    // Field order is drop order: the word goes back before the local lock
    word: WordHold<'a>,
    local: Local<'a>,
    readers: &'a [AtomicU64],
    acquired: Acquired,
    guard: &'a Guard,
    start: Instant,
}

impl<'a> Held<'a> {
    pub fn acquired(&self) -> Acquired {
        self.acquired
    }

    /// Wait for readers of other handles to leave; returns how many dead
    /// readers' slots were cleared
    pub fn drain(&self) -> Result<u32> {
        drain_readers(self.readers, self.word.me, &self.guard.remaining(self.start))
    }

    /// Trade the word for a reader slot so other readers can enter
    ///
    /// With every slot taken the word itself is kept for the read.
    pub fn into_shared(self) -> Shared<'a> {
        let Held {
            word,
            local,
            readers,
            ..
        } = self;
        let hold = match claim_slot(readers, word.me) {
            Some(i) => {
                let slot = SlotHold {
                    slot: &readers[i],
                    me: word.me,
                };
                drop(word);
                Hold::Slot(slot)
            }
            None => Hold::Word(word),
        };
        Shared {
            _hold: hold,
            _local: local,
        }
    }
}

#[allow(dead_code)]
enum Hold<'a> {
    Word(WordHold<'a>),
    Slot(SlotHold<'a>),
}

/// A shared hold: readers only, released on drop
pub struct Shared<'a> {
    _hold: Hold<'a>,
    _local: Local<'a>,
}
