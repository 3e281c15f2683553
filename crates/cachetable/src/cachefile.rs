//! Cachefiles
//!
//! A cachefile is one open file whose blocks live in the cache. It carries
//! the callback bundle for its blocks and a background job counter: every
//! asynchronous piece of work touching the file's pairs (prefetch, eviction
//! writes, background fetches) registers with the counter, and closing the
//! file first refuses new jobs, then waits for the counter to drain.

use crate::callbacks::{CacheValue, PairCallbacks};
use cachetable_common::{CachetableError, FileNum, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct JobState {
    jobs: usize,
    closing: bool,
}

/// Counts background jobs of one cachefile
#[derive(Debug, Default)]
pub(crate) struct BackgroundJobManager {
    state: Mutex<JobState>,
    drained: Condvar,
}

impl BackgroundJobManager {
    /// Register a job; `None` once the cachefile is closing
    pub(crate) fn add_job(self: &Arc<Self>) -> Option<BackgroundJob> {
        let mut state = self.state.lock();
        if state.closing {
            return None;
        }
        state.jobs += 1;
        Some(BackgroundJob {
            manager: Arc::clone(self),
        })
    }

    /// Refuse new jobs and wait for outstanding ones
    pub(crate) fn wait_for_jobs_to_finish(&self) {
        let mut state = self.state.lock();
        state.closing = true;
        while state.jobs > 0 {
            self.drained.wait(&mut state);
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.state.lock().jobs
    }
}

/// Registration of one background job, released on drop
pub(crate) struct BackgroundJob {
    manager: Arc<BackgroundJobManager>,
}

impl Drop for BackgroundJob {
    fn drop(&mut self) {
        let mut state = self.manager.state.lock();
        state.jobs -= 1;
        if state.jobs == 0 {
            self.manager.drained.notify_all();
        }
    }
}

/// Shared state of an open cachefile
pub(crate) struct CachefileInner<V> {
    filenum: FileNum,
    fname: PathBuf,
    file: File,
    callbacks: Arc<dyn PairCallbacks<V>>,
    jobs: Arc<BackgroundJobManager>,
}

impl<V: CacheValue> CachefileInner<V> {
    pub(crate) fn open(
        filenum: FileNum,
        fname: &Path,
        callbacks: Arc<dyn PairCallbacks<V>>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(fname)?;
        Ok(Self {
            filenum,
            fname: fname.to_path_buf(),
            file,
            callbacks,
            jobs: Arc::new(BackgroundJobManager::default()),
        })
    }

    pub(crate) fn filenum(&self) -> FileNum {
        self.filenum
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    pub(crate) fn callbacks(&self) -> &dyn PairCallbacks<V> {
        self.callbacks.as_ref()
    }

    pub(crate) fn jobs(&self) -> &Arc<BackgroundJobManager> {
        &self.jobs
    }

    pub(crate) fn add_job(&self) -> Option<BackgroundJob> {
        self.jobs.add_job()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.jobs.is_closing()
    }
}

/// Handle to an open cachefile
pub struct Cachefile<V> {
    pub(crate) inner: Arc<CachefileInner<V>>,
}

impl<V> Clone for Cachefile<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: CacheValue> Cachefile<V> {
    /// File number assigned at open
    pub fn filenum(&self) -> FileNum {
        self.inner.filenum
    }

    /// Path the cachefile was opened with
    pub fn fname(&self) -> &Path {
        &self.inner.fname
    }

    /// Underlying file
    pub fn file(&self) -> &File {
        &self.inner.file
    }

    /// Whether the cachefile is being closed
    pub fn is_closing(&self) -> bool {
        self.inner.is_closing()
    }
}

impl<V> fmt::Debug for Cachefile<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cachefile")
            .field("filenum", &self.inner.filenum)
            .field("fname", &self.inner.fname)
            .finish_non_exhaustive()
    }
}

struct OpenEntry<V> {
    cachefile: Arc<CachefileInner<V>>,
    handles: usize,
}

struct ListState<V> {
    open: BTreeMap<FileNum, OpenEntry<V>>,
    by_name: HashMap<PathBuf, FileNum>,
    next_filenum: u32,
}

impl<V> ListState<V> {
    fn reserve_filenum(&mut self) -> FileNum {
        loop {
            let candidate = FileNum::new(self.next_filenum);
            self.next_filenum = self.next_filenum.wrapping_add(1);
            if !self.open.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// Registry of open cachefiles
pub(crate) struct CachefileList<V> {
    state: Mutex<ListState<V>>,
}

impl<V: CacheValue> CachefileList<V> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ListState {
                open: BTreeMap::new(),
                by_name: HashMap::new(),
                next_filenum: 0,
            }),
        }
    }

    /// Open `fname`, sharing the cachefile if it is already open
    pub(crate) fn open(
        &self,
        fname: &Path,
        callbacks: Arc<dyn PairCallbacks<V>>,
    ) -> Result<Arc<CachefileInner<V>>> {
        let mut state = self.state.lock();
        if let Some(filenum) = state.by_name.get(fname).copied() {
            let entry = state
                .open
                .get_mut(&filenum)
                .ok_or_else(|| CachetableError::internal("named cachefile missing"))?;
            entry.handles += 1;
            debug!(
                "Reopened cachefile {} ({}), {} handles",
                filenum,
                fname.display(),
                entry.handles
            );
            return Ok(Arc::clone(&entry.cachefile));
        }

        let filenum = state.reserve_filenum();
        let cachefile = Arc::new(CachefileInner::open(filenum, fname, callbacks)?);
        state.open.insert(
            filenum,
            OpenEntry {
                cachefile: Arc::clone(&cachefile),
                handles: 1,
            },
        );
        state.by_name.insert(fname.to_path_buf(), filenum);
        info!("Opened cachefile {} ({})", filenum, fname.display());
        Ok(cachefile)
    }

    /// Drop one handle; true if it was the last one
    ///
    /// After the last handle is gone the name can be opened again as a
    /// new cachefile, while the old one stays reachable by number until
    /// [`CachefileList::remove`].
    pub(crate) fn release(&self, filenum: FileNum) -> Result<bool> {
        let mut state = self.state.lock();
        let entry = state
            .open
            .get_mut(&filenum)
            .ok_or(CachetableError::UnknownCachefile(filenum))?;
        if entry.handles == 0 {
            return Err(CachetableError::CachefileClosing(filenum));
        }
        entry.handles -= 1;
        if entry.handles > 0 {
            return Ok(false);
        }
        let fname = entry.cachefile.fname.clone();
        if state.by_name.get(&fname) == Some(&filenum) {
            state.by_name.remove(&fname);
        }
        Ok(true)
    }

    /// Drop every handle of every cachefile; returns the ones that had any
    pub(crate) fn release_all(&self) -> Vec<Arc<CachefileInner<V>>> {
        let mut state = self.state.lock();
        state.by_name.clear();
        state
            .open
            .values_mut()
            .filter(|entry| entry.handles > 0)
            .map(|entry| {
                entry.handles = 0;
                Arc::clone(&entry.cachefile)
            })
            .collect()
    }

    pub(crate) fn remove(&self, filenum: FileNum) {
        if self.state.lock().open.remove(&filenum).is_some() {
            debug!("Removed cachefile {}", filenum);
        }
    }

    pub(crate) fn get(&self, filenum: FileNum) -> Option<Arc<CachefileInner<V>>> {
        self.state
            .lock()
            .open
            .get(&filenum)
            .map(|entry| Arc::clone(&entry.cachefile))
    }

    /// Cachefiles that still have open handles
    pub(crate) fn snapshot(&self) -> Vec<Arc<CachefileInner<V>>> {
        self.state
            .lock()
            .open
            .values()
            .filter(|entry| entry.handles > 0)
            .map(|entry| Arc::clone(&entry.cachefile))
            .collect()
    }
}
