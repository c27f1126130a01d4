//! File-backed store: an append-only JSON lines log with compaction.
//!
//! Every write appends one record to `<path>`; a missing `value` marks a
//! deletion. Loading replays the log. Once the log holds twice as many
//! records as live keys it is rewritten through a temporary file and an
//! atomic rename. An advisory lock on the sibling `<path>.lock` keeps a
//! second process (or a second `open`) out; the kernel drops it when the
//! holder dies.

use std::collections::BTreeMap;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::Store;
use crate::core::SchedulerError;

/// The single bucket of the store.
pub const DEFAULT_BUCKET: &str = "default";

const COMPACTION_FLOOR: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    bucket: String,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl Record {
    fn put(key: &[u8], value: &[u8]) -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            key: STANDARD.encode(key),
            value: Some(STANDARD.encode(value)),
        }
    }

    fn delete(key: &[u8]) -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            key: STANDARD.encode(key),
            value: None,
        }
    }
}

fn decode(text: &str) -> Result<Vec<u8>, SchedulerError> {
    STANDARD
        .decode(text)
        .map_err(|e| SchedulerError::Internal(format!("corrupted store record: {e}")))
}

struct State {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    log: File,
    records: usize,
}

/// Durable single-bucket store.
pub struct FileStore {
    path: PathBuf,
    lock: File,
    state: Mutex<State>,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore").field("path", &self.path).finish_non_exhaustive()
    }
}

impl FileStore {
    /// Open or create the store at `path`.
    ///
    /// Fails with [`SchedulerError::InUse`] while another handle is open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let mut lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path_of(&path))?;
        if let Err(e) = lock.try_lock_exclusive() {
            if is_contended(&e) {
                return Err(SchedulerError::InUse(path));
            }
            return Err(e.into());
        }
        lock.set_len(0)?;
        writeln!(lock, "{}", std::process::id())?;

        let (entries, records) = Self::load(&path)?;
        let log = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!(path = %path.display(), keys = entries.len(), records, "store opened");
        Ok(Self {
            path,
            lock,
            state: Mutex::new(State {
                entries,
                log,
                records,
            }),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<(BTreeMap<Vec<u8>, Vec<u8>>, usize), SchedulerError> {
        let mut entries = BTreeMap::new();
        let mut records = 0;
        if !path.exists() {
            return Ok((entries, records));
        }
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line)?;
            records += 1;
            if record.bucket != DEFAULT_BUCKET {
                continue;
            }
            let key = decode(&record.key)?;
            match record.value {
                Some(value) => {
                    entries.insert(key, decode(&value)?);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok((entries, records))
    }

    fn append(&self, state: &mut State, record: &Record) -> Result<(), SchedulerError> {
        let line = serde_json::to_string(record)?;
        writeln!(state.log, "{line}")?;
        state.records += 1;
        if state.records >= COMPACTION_FLOOR && state.records > state.entries.len() * 2 {
            self.rewrite(state)?;
        }
        Ok(())
    }

    fn rewrite(&self, state: &mut State) -> Result<(), SchedulerError> {
        let tmp = self.path.with_extension("compact");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            for (key, value) in &state.entries {
                let line = serde_json::to_string(&Record::put(key, value))?;
                writeln!(file, "{line}")?;
            }
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        state.log = OpenOptions::new().append(true).open(&self.path)?;
        tracing::debug!(path = %self.path.display(), from = state.records, to = state.entries.len(), "store compacted");
        state.records = state.entries.len();
        Ok(())
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn lock_path_of(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    path.with_file_name(name)
}

impl Store for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SchedulerError> {
        Ok(self.state.lock().entries.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        state.entries.insert(key.to_vec(), value.to_vec());
        self.append(&mut state, &Record::put(key, value))
    }

    fn delete(&self, key: &[u8]) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if state.entries.remove(key).is_some() {
            self.append(&mut state, &Record::delete(key))?;
        }
        Ok(())
    }

    fn length(&self) -> Result<usize, SchedulerError> {
        Ok(self.state.lock().entries.len())
    }

    fn for_each(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), SchedulerError>,
    ) -> Result<(), SchedulerError> {
        let snapshot = self.state.lock().entries.clone();
        for (key, value) in &snapshot {
            visit(key, value)?;
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), SchedulerError> {
        let state = self.state.lock();
        state.log.sync_data()?;
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock) {
            tracing::warn!(path = %self.path.display(), error = %e, "store unlock failed");
        }
    }
}
