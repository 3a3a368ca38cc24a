use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::error;

use crate::buffer::TailBuffer;
use crate::compactor::Tombstone;
use crate::config::{Config, SyncPolicy};
use crate::error::HybridLogError;
use crate::guard::FileGuard;
use crate::sync::{spawn_sync_ticker, Ticker};

/// Append-only byte log backed by a single file, with the most recent bytes
/// mirrored in a fixed-capacity in-memory tail buffer.
///
/// Every append is written to the file and to the buffer, so the file always
/// holds the full history while reads of the hot tail never touch disk.
/// When the buffer fills past the high-water mark the split point advances:
/// the buffered range is declared file-resident and the buffer is cleared,
/// with no data movement.
///
/// All operations take `&self` and the log is safe to share across threads.
#[derive(Debug)]
pub struct HybridLog {
    shared: Arc<Shared>,
    sync_ticker: Mutex<Option<Ticker>>,
}

/// State shared with the scheduled-sync ticker.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) path: PathBuf,
    pub(crate) state: RwLock<TailState>,
    pub(crate) dirty: AtomicBool,
    cursor: Mutex<WriteCursor>,
    guard: Mutex<Option<FileGuard>>,
    closed: AtomicBool,
    sync_policy: SyncPolicy,
    high_water_mark: u32,
}

/// Write half: the end-of-file position appends go to. Holding the cursor
/// lock totally orders appends and excludes the compaction swap.
#[derive(Debug)]
struct WriteCursor {
    file: Arc<File>,
    offset: u64,
}

/// Read half: the coherent triple readers snapshot, plus the buffer itself.
/// `buf_base + buf.len() == len` at every quiescent point.
#[derive(Debug)]
pub(crate) struct TailState {
    pub(crate) file: Arc<File>,
    pub(crate) len: u64,
    buf: TailBuffer,
    buf_base: u64,
}

/// Result of a compaction rewrite, for the caller's accounting.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RewriteOutcome {
    pub(crate) previous_len: u64,
    pub(crate) new_len: u64,
}

impl HybridLog {
    /// Opens or creates the log at `config.path`, acquiring exclusive
    /// ownership of the path within `config.open_timeout`.
    pub fn open(config: Config) -> Result<Self, HybridLogError> {
        config.validate()?;
        let guard = FileGuard::acquire(&config.path, config.open_timeout)?;
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| HybridLogError::Open {
                    path: config.path.clone(),
                    source,
                })?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&config.path)
            .map_err(|source| HybridLogError::Open {
                path: config.path.clone(),
                source,
            })?;
        let len = file
            .seek(SeekFrom::End(0))
            .map_err(|source| HybridLogError::Open {
                path: config.path.clone(),
                source,
            })?;
        let file = Arc::new(file);

        let shared = Arc::new(Shared {
            path: config.path,
            state: RwLock::new(TailState {
                file: file.clone(),
                len,
                buf: TailBuffer::with_capacity(config.buffer_size),
                buf_base: len,
            }),
            dirty: AtomicBool::new(false),
            cursor: Mutex::new(WriteCursor { file, offset: len }),
            guard: Mutex::new(Some(guard)),
            closed: AtomicBool::new(false),
            sync_policy: config.sync_policy,
            high_water_mark: config.high_water_mark,
        });
        let sync_ticker = match config.sync_policy {
            SyncPolicy::SyncEverySecond => Some(spawn_sync_ticker(shared.clone())),
            SyncPolicy::NoSync | SyncPolicy::AlwaysSync => None,
        };
        Ok(Self {
            shared,
            sync_ticker: Mutex::new(sync_ticker),
        })
    }

    /// Appends `payload` at the end of the log, returning the byte count
    /// written. Partial counts are carried inside the error when the
    /// underlying write or sync fails.
    pub fn append(&self, payload: &[u8]) -> Result<usize, HybridLogError> {
        self.ensure_open()?;
        let mut cursor = self
            .shared
            .cursor
            .lock()
            .expect("hybrid log write cursor poisoned");
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(HybridLogError::Closed);
        }
        let file = cursor.file.clone();
        let (written, io_err) = write_full_at(&file, payload, cursor.offset);
        cursor.offset += written as u64;
        if written > 0 {
            let mut state = self
                .shared
                .state
                .write()
                .expect("hybrid log state poisoned");
            state.push(&payload[..written]);
        }
        if let Some(source) = io_err {
            return Err(HybridLogError::Io {
                completed: written,
                source,
            });
        }
        match self.shared.sync_policy {
            SyncPolicy::AlwaysSync => {
                file.sync_data().map_err(|source| HybridLogError::Io {
                    completed: written,
                    source,
                })?;
            }
            SyncPolicy::SyncEverySecond => {
                self.shared.dirty.store(true, Ordering::Release);
            }
            SyncPolicy::NoSync => {}
        }
        let over = {
            let state = self
                .shared
                .state
                .read()
                .expect("hybrid log state poisoned");
            state.buf.over_high_water_mark(self.shared.high_water_mark)
        };
        if over {
            self.remap();
        }
        Ok(written)
    }

    /// Fills `buf` from absolute offset `offset`.
    ///
    /// Returns the number of bytes produced, which is short of `buf.len()`
    /// when the requested range extends past the end of the log. A read
    /// starting at or past the end fails with [`HybridLogError::EndOfData`].
    /// The produced bytes are a coherent snapshot: a single call never
    /// observes a half-published append.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, HybridLogError> {
        self.ensure_open()?;
        offset
            .checked_add(buf.len() as u64)
            .ok_or(HybridLogError::InvalidRange {
                offset,
                len: buf.len() as u64,
            })?;
        let state = self
            .shared
            .state
            .read()
            .expect("hybrid log state poisoned");
        if offset >= state.len {
            return Err(HybridLogError::EndOfData {
                offset,
                size: state.len,
            });
        }
        let n = (state.len - offset).min(buf.len() as u64) as usize;
        if offset >= state.buf_base {
            let start = (offset - state.buf_base) as usize;
            buf[..n].copy_from_slice(&state.buf.as_slice()[start..start + n]);
            return Ok(n);
        }
        // The range starts below the split point; copy any buffered suffix
        // under the read lock, then release it before touching disk. The
        // file prefix is immutable, and compaction swaps the handle rather
        // than rewriting it, so the snapshot stays coherent.
        let file_n = ((state.buf_base - offset) as usize).min(n);
        let buffered_n = n - file_n;
        if buffered_n > 0 {
            buf[file_n..n].copy_from_slice(&state.buf.as_slice()[..buffered_n]);
        }
        let file = state.file.clone();
        drop(state);
        let (read, io_err) = read_full_at(&file, &mut buf[..file_n], offset);
        if let Some(source) = io_err {
            return Err(HybridLogError::Io {
                completed: read,
                source,
            });
        }
        if read < file_n {
            return Err(HybridLogError::Io {
                completed: read,
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "backing file shorter than the published length",
                ),
            });
        }
        Ok(n)
    }

    /// Total appended bytes. Remains callable after close.
    pub fn size(&self) -> u64 {
        self.shared
            .state
            .read()
            .expect("hybrid log state poisoned")
            .len
    }

    /// Drains in-flight operations, performs a final data sync unless the
    /// policy is `NoSync`, and releases the path. A second close is a no-op.
    pub fn close(&self) -> Result<(), HybridLogError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(mut ticker) = self
            .sync_ticker
            .lock()
            .expect("hybrid log ticker slot poisoned")
            .take()
        {
            ticker.shutdown();
        }
        let cursor = self
            .shared
            .cursor
            .lock()
            .expect("hybrid log write cursor poisoned");
        let state = self
            .shared
            .state
            .write()
            .expect("hybrid log state poisoned");
        let synced = match self.shared.sync_policy {
            SyncPolicy::NoSync => Ok(()),
            SyncPolicy::AlwaysSync | SyncPolicy::SyncEverySecond => state.file.sync_data(),
        };
        drop(state);
        drop(cursor);
        if let Some(guard) = self
            .shared
            .guard
            .lock()
            .expect("hybrid log guard slot poisoned")
            .take()
        {
            guard.release();
        }
        synced.map_err(|source| {
            error!(
                "event=close_sync_failed path={} error={}",
                self.shared.path.display(),
                source
            );
            HybridLogError::Io {
                completed: 0,
                source,
            }
        })
    }

    /// Advances the split point: the buffered bytes are already present in
    /// the file, so the buffer is cleared and subsequent reads of that range
    /// go to disk. The publish is a single linearization point under the
    /// state write lock.
    fn remap(&self) {
        let mut state = self
            .shared
            .state
            .write()
            .expect("hybrid log state poisoned");
        state.buf.clear();
        state.buf_base = state.len;
    }

    /// Rewrites the backing file keeping only the ranges not covered by
    /// `dead`, in copy steps of at most `chunk_size` bytes. Appends continue
    /// while the bulk of the copy runs; late-arriving bytes are merged under
    /// the write locks before the scratch file is renamed over the original.
    /// On success both the file length and the logical offset space reset to
    /// the compacted length. On failure the scratch file is removed and the
    /// log is untouched.
    pub(crate) fn rewrite(
        &self,
        dead: &[Tombstone],
        chunk_size: usize,
    ) -> Result<RewriteOutcome, HybridLogError> {
        self.ensure_open()?;
        let (src, snapshot_len) = {
            let state = self
                .shared
                .state
                .read()
                .expect("hybrid log state poisoned");
            (state.file.clone(), state.len)
        };
        let scratch = Scratch::create(self.shared.path.with_extension("compact"))?;
        let mut dst = scratch.file()?;
        let mut chunk = vec![0u8; chunk_size];
        let mut new_len = 0u64;
        for range in live_ranges(snapshot_len, dead) {
            new_len += copy_range(&src, &mut dst, range, &mut chunk)?;
        }

        let mut cursor = self
            .shared
            .cursor
            .lock()
            .expect("hybrid log write cursor poisoned");
        let mut state = self
            .shared
            .state
            .write()
            .expect("hybrid log state poisoned");
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(HybridLogError::Closed);
        }
        if state.len > snapshot_len {
            new_len += copy_range(&src, &mut dst, snapshot_len..state.len, &mut chunk)?;
        }
        dst.sync_data()?;
        drop(dst);
        let previous_len = state.len;
        let file = scratch.commit(&self.shared.path)?;
        let file = Arc::new(file);
        cursor.file = file.clone();
        cursor.offset = new_len;
        state.file = file;
        state.len = new_len;
        state.buf.clear();
        state.buf_base = new_len;
        Ok(RewriteOutcome {
            previous_len,
            new_len,
        })
    }

    pub(crate) fn shared_path(&self) -> &std::path::Path {
        &self.shared.path
    }

    /// Forces a data sync immediately, regardless of the configured policy.
    pub(crate) fn sync_now(&self) -> io::Result<()> {
        let file = self
            .shared
            .state
            .read()
            .expect("hybrid log state poisoned")
            .file
            .clone();
        file.sync_data()
    }

    fn ensure_open(&self) -> Result<(), HybridLogError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(HybridLogError::Closed);
        }
        Ok(())
    }

    #[cfg(test)]
    fn tail_layout(&self) -> (u64, u64, usize) {
        let state = self.shared.state.read().unwrap();
        (state.len, state.buf_base, state.buf.len())
    }
}

impl Drop for HybridLog {
    fn drop(&mut self) {
        if !self.shared.closed.load(Ordering::SeqCst) {
            let _ = self.close();
        }
    }
}

/// `write` appends and `flush` forces a data sync, so the log can stand in
/// wherever a writer is expected.
impl io::Write for &HybridLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync_now()
    }
}

impl TailState {
    /// Publishes appended bytes: extends the total, mirrors the payload into
    /// the buffer, and re-derives the split point.
    fn push(&mut self, payload: &[u8]) {
        self.len += payload.len() as u64;
        self.buf.extend(payload);
        self.buf_base = self.len - self.buf.len() as u64;
    }
}

/// Scratch destination for a compaction rewrite; removed on drop unless the
/// rename committed it.
struct Scratch {
    path: PathBuf,
    committed: bool,
}

impl Scratch {
    fn create(path: PathBuf) -> Result<Self, HybridLogError> {
        match File::create(&path) {
            Ok(_) => Ok(Self {
                path,
                committed: false,
            }),
            Err(source) => Err(HybridLogError::Open { path, source }),
        }
    }

    fn file(&self) -> Result<File, HybridLogError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| HybridLogError::Open {
                path: self.path.clone(),
                source,
            })
    }

    fn commit(mut self, target: &std::path::Path) -> Result<File, HybridLogError> {
        fs::rename(&self.path, target).map_err(HybridLogError::from)?;
        self.committed = true;
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(target)
            .map_err(|source| HybridLogError::Open {
                path: target.to_path_buf(),
                source,
            })
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Complement of the merged `dead` ranges within `[0, len)`.
fn live_ranges(len: u64, dead: &[Tombstone]) -> Vec<Range<u64>> {
    let mut clipped: Vec<(u64, u64)> = dead
        .iter()
        .map(|t| (t.offset.min(len), t.offset.saturating_add(t.len).min(len)))
        .filter(|(start, end)| start < end)
        .collect();
    clipped.sort_unstable();
    let mut live = Vec::new();
    let mut position = 0u64;
    for (start, end) in clipped {
        if start > position {
            live.push(position..start);
        }
        position = position.max(end);
    }
    if position < len {
        live.push(position..len);
    }
    live
}

fn copy_range(
    src: &File,
    dst: &mut File,
    range: Range<u64>,
    chunk: &mut [u8],
) -> Result<u64, HybridLogError> {
    let mut offset = range.start;
    while offset < range.end {
        let want = chunk.len().min((range.end - offset) as usize);
        let (read, io_err) = read_full_at(src, &mut chunk[..want], offset);
        if let Some(source) = io_err {
            return Err(HybridLogError::Io {
                completed: read,
                source,
            });
        }
        if read < want {
            return Err(HybridLogError::Io {
                completed: read,
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source file shorter than the published length",
                ),
            });
        }
        dst.write_all(&chunk[..want])?;
        offset += want as u64;
    }
    Ok(range.end - range.start)
}

#[cfg(unix)]
fn pwrite(file: &File, payload: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(payload, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, payload: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(payload, offset)
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// Writes all of `payload` at `offset`, retrying interrupts. Returns the
/// bytes written and the error that stopped a partial write, if any.
fn write_full_at(file: &File, payload: &[u8], offset: u64) -> (usize, Option<io::Error>) {
    let mut written = 0;
    while written < payload.len() {
        match pwrite(file, &payload[written..], offset + written as u64) {
            Ok(0) => {
                return (
                    written,
                    Some(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "file accepted no further bytes",
                    )),
                );
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return (written, Some(err)),
        }
    }
    (written, None)
}

/// Reads up to `buf.len()` bytes at `offset`, retrying interrupts. A short
/// count without an error means end of file.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> (usize, Option<io::Error>) {
    let mut read = 0;
    while read < buf.len() {
        match pread(file, &mut buf[read..], offset + read as u64) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return (read, Some(err)),
        }
    }
    (read, None)
}
