//! Liveness checks
//!
//! Used by the segment lock to tell an abandoned lock (holder killed) from a
//! busy one. Other processes are checked by pid; within this process every
//! open handle carries a token, and a lock word naming our own pid is live
//! only while its token is.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

static NEXT_TOKEN: AtomicU32 = AtomicU32::new(1);

fn live_tokens() -> &'static Mutex<HashSet<u32>> {
    static LIVE: OnceLock<Mutex<HashSet<u32>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Pid of the calling process, as recorded in the lock word
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Token of one open handle; live until dropped
#[derive(Debug)]
pub struct HandleToken(u32);

impl HandleToken {
    pub fn new() -> Self {
        let mut tokens = live_tokens().lock();
        loop {
            let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
            // 0 is what a bare pid in the word decodes to
            if token != 0 && tokens.insert(token) {
                return Self(token);
            }
        }
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for HandleToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HandleToken {
    fn drop(&mut self) {
        live_tokens().lock().remove(&self.0);
    }
}

/// Whether a handle of this process still owns `token`
pub fn token_is_live(token: u32) -> bool {
    token != 0 && live_tokens().lock().contains(&token)
}

/// Whether a process with this pid currently exists
///
/// `kill(pid, 0)` delivers no signal; it only reports whether the target
/// exists. EPERM means it exists but belongs to someone else. A reaped
/// process is gone; a zombie still counts as alive until its parent waits.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission checks
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        true
    } else {
        std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    // No portable check; never reclaim a lock from another process
    pid != 0
}
