use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};

use rocksdb::{DB, Direction, IteratorMode, Options};
use thetaflow_error::{ErrorKind, FlowError, OptionExt, Result, ResultExt};
use tracing::{debug, warn};
use uuid::Uuid;

/// An ordered map from physical integer keys to string values.
///
/// Implementations are exclusively owned by a single store, so all methods
/// take `&mut self`.
pub trait OrderedKv: Debug + Send {
    fn get(&mut self, key: i128) -> Result<Option<String>>;

    /// Insert or overwrite the value for a key.
    fn put(&mut self, key: i128, value: String) -> Result<()>;

    /// Values for all keys in `[low, high)`, ordered by key.
    fn scan(&mut self, low: i128, high: i128) -> Result<Vec<String>>;

    /// Make pending writes durable.
    fn flush(&mut self) -> Result<()>;

    /// Number of distinct physical keys.
    fn num_entries(&self) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: BTreeMap<i128, String>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderedKv for MemoryKv {
    fn get(&mut self, key: i128) -> Result<Option<String>> {
        Ok(self.entries.get(&key).cloned())
    }

    fn put(&mut self, key: i128, value: String) -> Result<()> {
        self.entries.insert(key, value);
        Ok(())
    }

    fn scan(&mut self, low: i128, high: i128) -> Result<Vec<String>> {
        if low >= high {
            return Ok(Vec::new());
        }
        Ok(self.entries.range(low..high).map(|(_, v)| v.clone()).collect())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn num_entries(&self) -> usize {
        self.entries.len()
    }
}

/// Creates the ordered map backing one spilled cell side.
pub trait KvFactory: Debug + Send + Sync {
    /// `name` is unique within a join.
    fn create(&self, name: &str) -> Result<Box<dyn OrderedKv>>;
}

/// Spill store backed by a RocksDB instance of its own.
///
/// Keys are encoded so that byte order matches numeric order. The database
/// is destroyed when the kv is dropped.
pub struct RocksKv {
    path: PathBuf,
    db: Option<DB>,
    entries: usize,
}

impl RocksKv {
    /// Create a new database at `path`. Errors if the path already exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(FlowError::storage("Spill store already exists")
                .with_field("path", path.display()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context_fn(|| format!("Failed to create spill directory {}", parent.display()))?;
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_error_if_exists(true);
        let db = DB::open(&opts, &path).map_err(rocks_error)?;

        debug!(path = %path.display(), "opened spill store");

        Ok(RocksKv {
            path,
            db: Some(db),
            entries: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn db(&self) -> Result<&DB> {
        self.db.as_ref().required("open spill database")
    }
}

impl fmt::Debug for RocksKv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksKv")
            .field("path", &self.path)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

/// Flip the sign bit so negative keys sort before positive ones.
fn encode_key(key: i128) -> [u8; 16] {
    ((key as u128) ^ (1 << 127)).to_be_bytes()
}

fn decode_value(value: &[u8]) -> Result<String> {
    std::str::from_utf8(value)
        .map(|s| s.to_string())
        .map_err(|e| FlowError::storage("Corrupt spill record").with_field("error", e))
}

fn rocks_error(e: rocksdb::Error) -> FlowError {
    FlowError::with_source("RocksDB error", Box::new(e)).kind_of(ErrorKind::Storage)
}

impl OrderedKv for RocksKv {
    fn get(&mut self, key: i128) -> Result<Option<String>> {
        match self.db()?.get_pinned(encode_key(key)).map_err(rocks_error)? {
            Some(value) => Ok(Some(decode_value(&value)?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: i128, value: String) -> Result<()> {
        let key = encode_key(key);
        let db = self.db()?;
        let is_new = db.get_pinned(key).map_err(rocks_error)?.is_none();
        db.put(key, value.as_bytes()).map_err(rocks_error)?;
        if is_new {
            self.entries += 1;
        }
        Ok(())
    }

    fn scan(&mut self, low: i128, high: i128) -> Result<Vec<String>> {
        if low >= high {
            return Ok(Vec::new());
        }
        let (low, high) = (encode_key(low), encode_key(high));

        let mut values = Vec::new();
        let iter = self
            .db()?
            .iterator(IteratorMode::From(low.as_slice(), Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(rocks_error)?;
            if key.as_ref() >= high.as_slice() {
                break;
            }
            values.push(decode_value(&value)?);
        }

        Ok(values)
    }

    fn flush(&mut self) -> Result<()> {
        self.db()?.flush().map_err(rocks_error)
    }

    fn num_entries(&self) -> usize {
        self.entries
    }
}

impl Drop for RocksKv {
    fn drop(&mut self) {
        // Close before destroying.
        drop(self.db.take());
        if let Err(e) = DB::destroy(&Options::default(), &self.path) {
            warn!(path = %self.path.display(), %e, "failed to destroy spill store");
        }
        if self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(path = %self.path.display(), %e, "failed to remove spill store");
            }
        }
    }
}

/// Opens a [`RocksKv`] per spilled cell side under a directory.
#[derive(Debug, Clone)]
pub struct RocksKvFactory {
    dir: PathBuf,
}

impl RocksKvFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        RocksKvFactory { dir: dir.into() }
    }
}

impl KvFactory for RocksKvFactory {
    fn create(&self, name: &str) -> Result<Box<dyn OrderedKv>> {
        let path = self.dir.join(format!("thetaflow-{}-{name}.spill", Uuid::new_v4()));
        Ok(Box::new(RocksKv::create(path)?))
    }
}
