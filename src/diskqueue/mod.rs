//! Backing segment store: a durable FIFO of byte records.
//!
//! Records are appended to numbered segment files that roll once they reach
//! `max_bytes_per_file`. A JSON checkpoint holds the read and write cursors
//! (segment number + offset) and the depth. It is rewritten on every sync,
//! after the active segment has been fsync'd, so it never points past data
//! that is on disk.
//!
//! Syncs happen every `sync_every` operations, or on the first operation (or
//! [`DiskQueue::flush_if_stale`] call) once `sync_timeout` has passed since
//! the last sync.
//!
//! On open, the active segment is scanned forward from the checkpointed
//! write offset. Complete records found there were written but not yet
//! checkpointed and are kept. A torn or corrupt tail is cut off.

mod record;

use crate::config::Options;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use record::ReadOutcome;

/// Room for the message header around a payload once it is encoded.
const ENCODING_OVERHEAD: usize = 128;

/// Settings for one backing store.
#[derive(Debug, Clone)]
pub struct DiskQueueOptions {
    pub max_bytes_per_file: u64,
    /// Largest record accepted on write or trusted on read
    pub max_record_size: usize,
    pub sync_every: u64,
    pub sync_timeout: Duration,
}

impl DiskQueueOptions {
    pub fn from_options(opts: &Options) -> Self {
        Self {
            max_bytes_per_file: opts.max_bytes_per_file,
            max_record_size: opts.max_msg_size + ENCODING_OVERHEAD,
            sync_every: opts.sync_every,
            sync_timeout: opts.sync_timeout,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Checkpoint {
    depth: u64,
    read_file_num: u64,
    read_pos: u64,
    write_file_num: u64,
    write_pos: u64,
}

struct Inner {
    cursor: Checkpoint,
    write_file: Option<File>,
    read_file: Option<BufReader<File>>,
    /// Length of the segment being read, once it is no longer written to
    read_file_len: Option<u64>,
    ops_since_sync: u64,
    last_sync: Instant,
    dirty: bool,
    closed: bool,
}

pub struct DiskQueue {
    name: String,
    dir: PathBuf,
    opts: DiskQueueOptions,
    depth: AtomicU64,
    inner: Mutex<Inner>,
}

impl DiskQueue {
    /// Open (or create) the store `name` under `dir`, recovering any state a
    /// previous process left behind.
    pub fn open(name: &str, dir: &Path, opts: DiskQueueOptions) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut queue = Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            opts,
            depth: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                cursor: Checkpoint::default(),
                write_file: None,
                read_file: None,
                read_file_len: None,
                ops_since_sync: 0,
                last_sync: Instant::now(),
                dirty: false,
                closed: false,
            }),
        };

        let cursor = queue.recover()?;
        queue.depth.store(cursor.depth, Ordering::Release);
        let inner = queue.inner.get_mut();
        inner.cursor = cursor;
        queue.sync(&mut queue.inner.lock())?;

        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of records written but not yet read.
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Acquire)
    }

    /// Append one record.
    pub fn put(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.opts.max_record_size {
            return Err(Error::SizeExceeded {
                size: data.len(),
                max: self.opts.max_record_size,
            });
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Exiting);
        }

        let framed = record::framed_len(data.len());
        if inner.cursor.write_pos > 0
            && inner.cursor.write_pos + framed > self.opts.max_bytes_per_file
        {
            self.roll(&mut inner)?;
        }

        if inner.write_file.is_none() {
            let path = self.segment_path(inner.cursor.write_file_num);
            let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
            file.seek(SeekFrom::Start(inner.cursor.write_pos))?;
            debug!(queue = %self.name, path = ?path, "opened segment for writing");
            inner.write_file = Some(file);
        }

        if let Some(file) = inner.write_file.as_mut() {
            if let Err(e) = record::write_record(file, data) {
                // reopen and overwrite the partial record on the next put
                inner.write_file = None;
                error!(queue = %self.name, error = %e, "segment write failed");
                return Err(e.into());
            }
        }

        inner.cursor.write_pos += framed;
        inner.cursor.depth += 1;
        self.depth.store(inner.cursor.depth, Ordering::Release);
        self.after_op(&mut inner)
    }

    /// Read the oldest unread record, or `None` when caught up.
    pub fn read_one(&self) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Exiting);
        }

        loop {
            let cursor = &inner.cursor;
            if cursor.read_file_num == cursor.write_file_num && cursor.read_pos >= cursor.write_pos {
                if cursor.depth != 0 {
                    warn!(queue = %self.name, depth = cursor.depth, "depth drifted, resetting to 0");
                    inner.cursor.depth = 0;
                    self.depth.store(0, Ordering::Release);
                }
                return Ok(None);
            }

            if inner.read_file.is_none() {
                let num = inner.cursor.read_file_num;
                let path = self.segment_path(num);
                let mut file = match File::open(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == io::ErrorKind::NotFound && num < inner.cursor.write_file_num => {
                        warn!(queue = %self.name, path = ?path, "segment missing, skipping");
                        self.advance_read_file(&mut inner);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                file.seek(SeekFrom::Start(inner.cursor.read_pos))?;
                inner.read_file_len = if num < inner.cursor.write_file_num {
                    Some(file.metadata()?.len())
                } else {
                    None
                };
                inner.read_file = Some(BufReader::new(file));
            }

            // the segment may have been the write segment when it was opened
            if inner.read_file_len.is_none() && inner.cursor.read_file_num < inner.cursor.write_file_num {
                let len = match inner.read_file.as_ref() {
                    Some(reader) => reader.get_ref().metadata()?.len(),
                    None => continue,
                };
                inner.read_file_len = Some(len);
            }

            if let Some(len) = inner.read_file_len {
                if inner.cursor.read_pos >= len {
                    self.advance_read_file(&mut inner);
                    continue;
                }
            }

            let outcome = match inner.read_file.as_mut() {
                Some(reader) => record::read_record(reader, self.opts.max_record_size)?,
                None => continue,
            };

            match outcome {
                ReadOutcome::Record(data) => {
                    inner.cursor.read_pos += record::framed_len(data.len());
                    inner.cursor.depth = inner.cursor.depth.saturating_sub(1);
                    self.depth.store(inner.cursor.depth, Ordering::Release);
                    self.after_op(&mut inner)?;
                    return Ok(Some(data));
                }
                ReadOutcome::End if inner.cursor.read_file_num < inner.cursor.write_file_num => {
                    self.advance_read_file(&mut inner);
                }
                ReadOutcome::End | ReadOutcome::Torn | ReadOutcome::Corrupt => {
                    self.skip_bad_segment(&mut inner)?;
                }
            }
        }
    }

    /// Sync if there are unsynced operations older than `sync_timeout`.
    /// Returns whether a sync happened.
    pub fn flush_if_stale(&self) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.closed || !inner.dirty || inner.last_sync.elapsed() < self.opts.sync_timeout {
            return Ok(false);
        }
        self.sync(&mut inner)?;
        Ok(true)
    }

    /// Sync everything and stop accepting operations.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        self.sync(&mut inner)?;
        inner.closed = true;
        inner.write_file = None;
        inner.read_file = None;
        info!(queue = %self.name, depth = inner.cursor.depth, "closed backing store");
        Ok(())
    }

    /// Stop accepting operations and remove every file this store owns.
    pub fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.write_file = None;
        inner.read_file = None;
        self.remove_segments(&inner.cursor);
        match fs::remove_file(self.checkpoint_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        inner.cursor = Checkpoint::default();
        self.depth.store(0, Ordering::Release);
        info!(queue = %self.name, "deleted backing store");
        Ok(())
    }

    /// Drop every unread record: both cursors move to a fresh segment and all
    /// existing segments are removed.
    pub fn empty(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Exiting);
        }
        inner.write_file = None;
        inner.read_file = None;
        inner.read_file_len = None;
        self.remove_segments(&inner.cursor);

        let next = inner.cursor.write_file_num + 1;
        inner.cursor = Checkpoint {
            depth: 0,
            read_file_num: next,
            read_pos: 0,
            write_file_num: next,
            write_pos: 0,
        };
        self.depth.store(0, Ordering::Release);
        self.sync(&mut inner)
    }

    fn after_op(&self, inner: &mut Inner) -> Result<()> {
        inner.ops_since_sync += 1;
        inner.dirty = true;
        if inner.ops_since_sync >= self.opts.sync_every
            || inner.last_sync.elapsed() >= self.opts.sync_timeout
        {
            self.sync(inner)?;
        }
        Ok(())
    }

    fn sync(&self, inner: &mut Inner) -> Result<()> {
        if let Some(file) = inner.write_file.as_mut() {
            file.sync_data()?;
        }
        self.persist_checkpoint(&inner.cursor)?;
        inner.ops_since_sync = 0;
        inner.last_sync = Instant::now();
        inner.dirty = false;
        Ok(())
    }

    fn roll(&self, inner: &mut Inner) -> Result<()> {
        if let Some(file) = inner.write_file.as_mut() {
            file.sync_data()?;
        }
        inner.write_file = None;
        inner.cursor.write_file_num += 1;
        inner.cursor.write_pos = 0;
        info!(
            queue = %self.name,
            segment = inner.cursor.write_file_num,
            "rolling to new segment"
        );
        self.sync(inner)
    }

    fn advance_read_file(&self, inner: &mut Inner) {
        let finished = inner.cursor.read_file_num;
        inner.read_file = None;
        inner.read_file_len = None;
        inner.cursor.read_file_num += 1;
        inner.cursor.read_pos = 0;
        inner.dirty = true;

        let path = self.segment_path(finished);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!(queue = %self.name, path = ?path, error = %e, "failed to remove segment");
            }
        }
    }

    /// Set a damaged segment aside as `*.bad` and continue with the next one.
    fn skip_bad_segment(&self, inner: &mut Inner) -> Result<()> {
        let num = inner.cursor.read_file_num;
        let path = self.segment_path(num);
        let bad = path.with_extension("bad");
        warn!(
            queue = %self.name,
            path = ?path,
            offset = inner.cursor.read_pos,
            "corrupt record, moving segment aside"
        );
        if let Err(e) = fs::rename(&path, &bad) {
            error!(queue = %self.name, path = ?path, error = %e, "failed to rename bad segment");
        }

        if num == inner.cursor.write_file_num {
            inner.write_file = None;
            inner.cursor.write_file_num += 1;
            inner.cursor.write_pos = 0;
        }
        inner.read_file = None;
        inner.read_file_len = None;
        inner.cursor.read_file_num += 1;
        inner.cursor.read_pos = 0;
        self.sync(inner)
    }

    fn remove_segments(&self, cursor: &Checkpoint) {
        for num in cursor.read_file_num..=cursor.write_file_num {
            let path = self.segment_path(num);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    error!(queue = %self.name, path = ?path, error = %e, "failed to remove segment");
                }
            }
        }
    }

    fn recover(&self) -> Result<Checkpoint> {
        let mut cursor = match fs::read(self.checkpoint_path()) {
            Ok(buf) => serde_json::from_slice::<Checkpoint>(&buf)
                .map_err(|e| Error::Metadata(format!("{}: {}", self.name, e)))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Checkpoint::default(),
            Err(e) => return Err(e.into()),
        };

        let path = self.segment_path(cursor.write_file_num);
        if path.exists() {
            let len = fs::metadata(&path)?.len();
            if len < cursor.write_pos {
                warn!(
                    queue = %self.name,
                    len,
                    write_pos = cursor.write_pos,
                    "segment shorter than checkpoint"
                );
                cursor.write_pos = len;
            }

            let (found, end) = self.scan_tail(&path, cursor.write_pos)?;
            if len > end {
                warn!(
                    queue = %self.name,
                    discarded = len - end,
                    "truncating torn tail of active segment"
                );
                OpenOptions::new().write(true).open(&path)?.set_len(end)?;
            }
            cursor.write_pos = end;
            cursor.depth += found;
        }

        let read_ahead = cursor.read_file_num > cursor.write_file_num
            || (cursor.read_file_num == cursor.write_file_num && cursor.read_pos > cursor.write_pos);
        if read_ahead {
            warn!(queue = %self.name, "read cursor past write cursor, resetting");
            cursor.read_file_num = cursor.write_file_num;
            cursor.read_pos = cursor.write_pos;
            cursor.depth = 0;
        }

        info!(
            queue = %self.name,
            depth = cursor.depth,
            read_file = cursor.read_file_num,
            write_file = cursor.write_file_num,
            write_pos = cursor.write_pos,
            "recovered backing store"
        );
        Ok(cursor)
    }

    /// Count complete records from `from` onward; returns (count, end offset).
    fn scan_tail(&self, path: &Path, from: u64) -> Result<(u64, u64)> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(from))?;
        let mut reader = BufReader::new(file);
        let mut found = 0;
        let mut end = from;
        while let ReadOutcome::Record(data) =
            record::read_record(&mut reader, self.opts.max_record_size)?
        {
            found += 1;
            end += record::framed_len(data.len());
        }
        Ok((found, end))
    }

    fn persist_checkpoint(&self, cursor: &Checkpoint) -> Result<()> {
        let path = self.checkpoint_path();
        let tmp = path.with_extension("json.tmp");
        let buf = serde_json::to_vec(cursor).map_err(|e| Error::Metadata(e.to_string()))?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn segment_path(&self, num: u64) -> PathBuf {
        self.dir
            .join(format!("{}.diskqueue.{:06}.dat", self.name, num))
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(format!("{}.diskqueue.meta.json", self.name))
    }
}

/// Overflow target behind a memory ring.
pub(crate) enum BackendQueue {
    Disk(DiskQueue),
    /// Ephemeral queues keep nothing beyond their memory ring
    Discard,
}

impl BackendQueue {
    pub(crate) fn put(&self, data: &[u8]) -> Result<()> {
        match self {
            BackendQueue::Disk(queue) => queue.put(data),
            BackendQueue::Discard => Err(Error::QueueFull(
                "memory ring is full and the queue has no backing store".into(),
            )),
        }
    }

    pub(crate) fn read_one(&self) -> Result<Option<Vec<u8>>> {
        match self {
            BackendQueue::Disk(queue) => queue.read_one(),
            BackendQueue::Discard => Ok(None),
        }
    }

    pub(crate) fn depth(&self) -> u64 {
        match self {
            BackendQueue::Disk(queue) => queue.depth(),
            BackendQueue::Discard => 0,
        }
    }

    pub(crate) fn flush_if_stale(&self) -> Result<bool> {
        match self {
            BackendQueue::Disk(queue) => queue.flush_if_stale(),
            BackendQueue::Discard => Ok(false),
        }
    }

    pub(crate) fn close(&self) -> Result<()> {
        match self {
            BackendQueue::Disk(queue) => queue.close(),
            BackendQueue::Discard => Ok(()),
        }
    }

    pub(crate) fn delete(&self) -> Result<()> {
        match self {
            BackendQueue::Disk(queue) => queue.delete(),
            BackendQueue::Discard => Ok(()),
        }
    }

    pub(crate) fn empty(&self) -> Result<()> {
        match self {
            BackendQueue::Disk(queue) => queue.empty(),
            BackendQueue::Discard => Ok(()),
        }
    }
}
