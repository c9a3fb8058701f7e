//! Segment Manager
//!
//! Owns one mapped segment and runs operations against it under the guard.
//!
//! ## Open Protocol
//! 1. Validate name and geometry
//! 2. Reuse the process's existing mapping of the object the path names
//!    now, if any (matched by device and inode, not by path spelling)
//! 3. Create the backing file, or open the existing one
//! 4. Under an advisory file lock, the first opener to find the object
//!    unsized records its block size and sizes it; a creator that died
//!    before sizing leaves this to the next opener
//! 5. Map the file, take the segment lock, and format the header with the
//!    recorded block size unless a valid one is already there

use std::collections::HashMap;
use std::fs::{File, Metadata, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use memmap2::MmapOptions;
use parking_lot::Mutex;

use crate::config::{BlockSize, Config};
use crate::error::{CacheError, Result};
use crate::guard::{Acquired, Guard, Held, RetryPolicy, Words};

use super::layout::{
    header, Layout, FORMAT_VERSION, HEADER_SIZE, MAGIC, READER_SLOTS, STATE_FRESH, STATE_READY,
};
use super::{Region, View};

/// Identity of a backing object, the same under every path that reaches it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FileId {
    dev: u64,
    ino: u64,
}

/// Segments attached by this process, by backing object
///
/// A live mapping keeps its inode allocated, so an id found here can only
/// name the object that mapping was made from.
fn registry() -> &'static Mutex<HashMap<FileId, Weak<Segment>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<FileId, Weak<Segment>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A mapped, initialized segment
///
/// ## Concurrency
/// - `guard`: in-process rwlock + cross-process lock word and reader slots,
///   bounded waits
/// - `poisoned`: set once corruption is seen; every later call fails
pub struct Segment {
    name: String,
    path: PathBuf,
    id: FileId,
    region: Region,
    layout: Layout,
    guard: Guard,
    poisoned: AtomicBool,
}

impl Segment {
    /// Open or create the segment described by `config`
    ///
    /// Geometry arguments are validated even when an existing segment is
    /// reused, and otherwise ignored in that case.
    pub fn open(config: &Config) -> Result<Arc<Self>> {
        validate_name(&config.name)?;
        let requested = Layout::compute(config.total_size, config.block_size)?;
        let path = config.segment_path();

        let mut attached = registry().lock();
        attached.retain(|_, weak| weak.strong_count() > 0);

        // An unlinked or replaced object no longer matches what the path names
        if let Some(id) = current_id(&path)? {
            if let Some(existing) = attached.get(&id).and_then(Weak::upgrade) {
                tracing::debug!(name = %config.name, "reusing attached segment");
                return Ok(existing);
            }
        }

        let segment = Arc::new(Self::attach(config, &path, &requested)?);
        if let Some(existing) = attached.get(&segment.id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        attached.insert(segment.id, Arc::downgrade(&segment));
        Ok(segment)
    }

    fn attach(config: &Config, path: &Path, requested: &Layout) -> Result<Self> {
        let policy = RetryPolicy {
            timeout: config.lock_timeout(),
            spin_limit: config.lock_spin_limit,
        };

        let (file, created) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => (file, true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => (
                OpenOptions::new().read(true).write(true).open(path)?,
                false,
            ),
            Err(e) => return Err(e.into()),
        };
        match size_once(&file, config.block_size, requested.total_size, policy.timeout) {
            Ok(true) if !created => {
                tracing::warn!(name = %config.name, "sized a segment object another process created");
            }
            Ok(_) => {}
            Err(e) => {
                if created {
                    let _ = std::fs::remove_file(path);
                }
                return Err(e);
            }
        }

        let metadata = file.metadata()?;
        let id = file_id(path, &metadata)?;
        let len = metadata.len();
        // SAFETY: the file is a shared segment object; every access to the
        // mapping goes through the bounds-checked `Region`
        let mmap = unsafe { MmapOptions::new().len(len as usize).map_mut(&file)? };
        let region = Region::new(mmap)?;

        let guard = Guard::new(policy);
        let (layout, formatted) = {
            let held = guard.lock(words(&region)?)?;
            held.drain()?;
            let ready = region.atomic_u32(header::INIT_STATE)?.load(Ordering::Acquire);
            if ready == STATE_READY {
                (read_layout(&region)?, false)
            } else {
                // First to lock a sized object formats it with the recorded
                // block size, whichever process that is
                let block_size = BlockSize::from_bytes(region.u32_at(header::BLOCK_SIZE)?)
                    .unwrap_or(config.block_size);
                let layout = Layout::compute(len, block_size)?;
                format(&region, &layout)?;
                (layout, true)
            }
        };

        if formatted {
            tracing::info!(
                name = %config.name,
                total_size = layout.total_size,
                block_size = %layout.block_size,
                blocks = layout.block_count,
                "created segment"
            );
        } else {
            tracing::info!(name = %config.name, blocks = layout.block_count, "attached to segment");
        }

        Ok(Self {
            name: config.name.clone(),
            path: path.to_path_buf(),
            id,
            region,
            layout,
            guard,
            poisoned: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Locked Execution
    // =========================================================================

    /// Run a read-only operation in a shared hold
    ///
    /// Readers of this and other processes overlap; writers wait for them.
    pub fn with_read<T>(&self, op: impl FnOnce(View<'_>) -> Result<T>) -> Result<T> {
        self.run(|| self.run_shared(op))
    }

    /// Run a structural mutation with the segment held exclusively
    ///
    /// The dirty flag is raised for the duration; a holder killed in between
    /// leaves it raised and the next process to lock reformats the segment.
    pub fn with_write<T>(&self, op: impl FnOnce(View<'_>) -> Result<T>) -> Result<T> {
        self.run(|| self.run_exclusive(op))
    }

    fn run<T>(&self, locked: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(CacheError::corruption(format!(
                "segment {} handle was poisoned by earlier corruption",
                self.name
            )));
        }

        let result = locked();
        if let Err(e) = &result {
            self.poison_on(e);
        }
        result
    }

    fn run_exclusive<T>(&self, op: impl FnOnce(View<'_>) -> Result<T>) -> Result<T> {
        let view = View::new(&self.region, &self.layout);
        let held = self.guard.lock(words(&self.region)?)?;
        self.settle(view, &held)?;

        let dirty = self.region.atomic_u32(header::DIRTY)?;
        dirty.store(1, Ordering::Release);
        let result = op(view);
        // Corruption leaves the flag raised so the next holder starts clean
        if !matches!(&result, Err(e) if e.is_fatal()) {
            dirty.store(0, Ordering::Release);
        }
        drop(held);
        result
    }

    fn run_shared<T>(&self, op: impl FnOnce(View<'_>) -> Result<T>) -> Result<T> {
        let view = View::new(&self.region, &self.layout);
        let held = self.guard.lock_shared(words(&self.region)?)?;
        let dirty = self.region.atomic_u32(header::DIRTY)?.load(Ordering::Acquire) != 0;
        if dirty || held.acquired() != Acquired::Clean {
            self.settle(view, &held)?;
        }

        let _shared = held.into_shared();
        op(view)
    }

    /// With the word held: wait out readers, account for a steal, and
    /// reformat if the previous holder died mid-mutation
    fn settle(&self, view: View<'_>, held: &Held<'_>) -> Result<()> {
        let cleared = held.drain()?;
        if cleared > 0 {
            tracing::warn!(name = %self.name, slots = cleared, "cleared reader slots of dead holders");
        }

        if let Acquired::Stolen { from } = held.acquired() {
            tracing::warn!(name = %self.name, dead_pid = from, "reclaimed lock from dead holder");
            view.bump_header(header::LOCK_STEALS)?;
        }

        let dirty = self.region.atomic_u32(header::DIRTY)?;
        if dirty.load(Ordering::Acquire) != 0 {
            tracing::warn!(name = %self.name, "previous holder died mid-mutation, reformatting segment");
            view.reset_contents()?;
            view.bump_header(header::RECOVERIES)?;
            dirty.store(0, Ordering::Release);
        }
        Ok(())
    }

    /// Poison the handle if `error` is fatal
    pub fn poison_on(&self, error: &CacheError) {
        if error.is_fatal() && !self.poisoned.swap(true, Ordering::AcqRel) {
            tracing::error!(name = %self.name, error = %error, "poisoning segment handle");
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Unlink this segment's backing object; the mapping stays usable
    ///
    /// `false` if the name no longer refers to this object.
    pub fn unlink(&self) -> Result<bool> {
        if current_id(&self.path)? != Some(self.id) {
            registry().lock().remove(&self.id);
            return Ok(false);
        }
        unlink(&self.name, &self.path)
    }
}

/// Unlink the named segment; live mappings keep working
///
/// Returns whether a segment object existed.
pub fn release(config: &Config) -> Result<bool> {
    validate_name(&config.name)?;
    unlink(&config.name, &config.segment_path())
}

// =============================================================================
// Private Helpers
// =============================================================================

fn words(region: &Region) -> Result<Words<'_>> {
    Ok(Words {
        lock: region.atomic_u64(header::LOCK_OWNER)?,
        readers: region.atomic_u64s(header::READERS, READER_SLOTS)?,
    })
}

fn unlink(name: &str, path: &Path) -> Result<bool> {
    if let Some(id) = current_id(path)? {
        registry().lock().remove(&id);
    }
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(name = %name, "released segment");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(CacheError::invalid(format!("invalid segment name {:?}", name)));
    }
    Ok(())
}

/// Identity of the object `path` names right now, if any
fn current_id(path: &Path) -> Result<Option<FileId>> {
    match std::fs::metadata(path) {
        Ok(metadata) => file_id(path, &metadata).map(Some),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn file_id(_path: &Path, metadata: &Metadata) -> Result<FileId> {
    use std::os::unix::fs::MetadataExt;
    Ok(FileId {
        dev: metadata.dev(),
        ino: metadata.ino(),
    })
}

#[cfg(not(unix))]
fn file_id(path: &Path, _metadata: &Metadata) -> Result<FileId> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::fs::canonicalize(path)?.hash(&mut hasher);
    Ok(FileId {
        dev: 0,
        ino: hasher.finish(),
    })
}

/// Size the backing object unless someone already has
///
/// Runs under an exclusive advisory lock on the file, which the kernel
/// drops if its holder dies. Returns whether this call did the sizing.
fn size_once(
    file: &File,
    block_size: BlockSize,
    total_size: u64,
    timeout: Duration,
) -> Result<bool> {
    lock_file(file, timeout)?;
    let result = record_and_size(file, block_size, total_size);
    let _ = FileExt::unlock(file);
    result
}

fn record_and_size(mut file: &File, block_size: BlockSize, total_size: u64) -> Result<bool> {
    if file.metadata()?.len() >= HEADER_SIZE as u64 {
        return Ok(false);
    }

    // Still shorter than a header, so nobody maps it before `set_len`
    file.seek(SeekFrom::Start(header::BLOCK_SIZE as u64))?;
    file.write_all(&block_size.bytes().to_le_bytes())?;
    file.set_len(total_size).map_err(|e| {
        CacheError::invalid(format!(
            "cannot allocate {} bytes of shared memory: {}",
            total_size, e
        ))
    })?;
    Ok(true)
}

fn lock_file(file: &File, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        match FileExt::try_lock_exclusive(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
            Err(e) => return Err(e.into()),
        }
        if start.elapsed() >= timeout {
            return Err(CacheError::LockTimeout {
                holder: 0,
                waited_ms: start.elapsed().as_millis() as u64,
            });
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Write a fresh header and empty contents
fn format(region: &Region, layout: &Layout) -> Result<()> {
    let view = View::new(region, layout);
    region
        .atomic_u32(header::INIT_STATE)?
        .store(STATE_FRESH, Ordering::Release);

    region.set_u64(header::MAGIC, MAGIC)?;
    region.set_u32(header::VERSION, FORMAT_VERSION)?;
    region.set_u64(header::TOTAL_SIZE, layout.total_size)?;
    region.set_u32(header::BLOCK_SIZE, layout.block_size.bytes())?;
    region.set_u32(header::BLOCK_COUNT, layout.block_count)?;
    region.set_u32(header::BUCKET_COUNT, layout.bucket_count)?;
    view.set_counter(header::EVICTIONS, 0)?;
    region.set_u32(header::LOCK_STEALS, 0)?;
    region.set_u32(header::RECOVERIES, 0)?;
    view.reset_contents()?;
    region.atomic_u32(header::DIRTY)?.store(0, Ordering::Release);

    region
        .atomic_u32(header::INIT_STATE)?
        .store(STATE_READY, Ordering::Release);
    Ok(())
}

/// Rebuild the layout from a ready header and check it against the mapping
fn read_layout(region: &Region) -> Result<Layout> {
    let magic = region.u64_at(header::MAGIC)?;
    if magic != MAGIC {
        return Err(CacheError::corruption(format!("bad segment magic {:#x}", magic)));
    }
    let version = region.u32_at(header::VERSION)?;
    if version != FORMAT_VERSION {
        return Err(CacheError::corruption(format!(
            "segment format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }

    let total_size = region.u64_at(header::TOTAL_SIZE)?;
    let block_size = BlockSize::from_bytes(region.u32_at(header::BLOCK_SIZE)?)
        .map_err(|e| CacheError::corruption(e.to_string()))?;
    if total_size != region.len() as u64 {
        return Err(CacheError::corruption(format!(
            "header says {} bytes but the mapping has {}",
            total_size,
            region.len()
        )));
    }

    let layout = Layout::compute(total_size, block_size)
        .map_err(|e| CacheError::corruption(e.to_string()))?;
    if layout.block_count != region.u32_at(header::BLOCK_COUNT)?
        || layout.bucket_count != region.u32_at(header::BUCKET_COUNT)?
    {
        return Err(CacheError::corruption("header geometry does not match its size"));
    }
    Ok(layout)
}
