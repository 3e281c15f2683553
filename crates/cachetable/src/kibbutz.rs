//! Kibbutz: a fixed pool of worker threads fed by a bounded queue
//!
//! The cachetable runs three of them, one each for client work (prefetch,
//! background fetches), eviction writes and checkpoint clone writes, so a
//! backlog in one never delays the others.

use crossbeam_channel::{Sender, TrySendError, bounded};
use parking_lot::Mutex;
use serde::Serialize;
use std::cell::Cell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info};

type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// Identity of the pool the current thread works for, if any
    static WORKER_OF: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Default)]
struct KibbutzCounters {
    queued: AtomicU64,
    max_queued: AtomicU64,
    active: AtomicU64,
    processed: AtomicU64,
    run_inline: AtomicU64,
    exec_time_us: AtomicU64,
}

impl KibbutzCounters {
    fn run(&self, job: Job, pool: &str) {
        self.active.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Job in kibbutz {} panicked", pool);
        }
        let elapsed = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.exec_time_us.fetch_add(elapsed, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of one pool's counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct KibbutzStatus {
    /// Worker threads
    pub threads: u64,
    /// Jobs currently running
    pub active: u64,
    /// Jobs waiting in the queue
    pub queued: u64,
    /// Largest queue length observed
    pub max_queued: u64,
    /// Jobs completed
    pub processed: u64,
    /// Jobs run by the enqueuing worker because the queue was full
    pub run_inline: u64,
    /// Total job execution time (microseconds)
    pub exec_time_us: u64,
}

/// Worker pool
pub struct Kibbutz {
    name: &'static str,
    threads: usize,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<KibbutzCounters>,
}

impl Kibbutz {
    /// Start `threads` workers sharing a queue of `queue_depth` jobs
    pub fn new(name: &'static str, threads: usize, queue_depth: usize) -> std::io::Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue_depth);
        let counters = Arc::new(KibbutzCounters::default());
        let id = Arc::as_ptr(&counters) as usize;

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let counters = Arc::clone(&counters);
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    WORKER_OF.with(|pool| pool.set(id));
                    for job in receiver.iter() {
                        counters.queued.fetch_sub(1, Ordering::Relaxed);
                        counters.run(job, name);
                    }
                })?;
            workers.push(handle);
        }

        debug!("Kibbutz {} started with {} workers", name, threads);
        Ok(Self {
            name,
            threads,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
        })
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.counters) as usize
    }

    fn on_own_worker(&self) -> bool {
        WORKER_OF.with(Cell::get) == self.id()
    }

    /// Queue a job
    ///
    /// A worker of this pool that finds the queue full runs the job itself
    /// instead of waiting on its own pool. After shutdown jobs run inline.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) {
        let job: Job = Box::new(job);
        let Some(sender) = self.sender.lock().clone() else {
            self.counters.run_inline.fetch_add(1, Ordering::Relaxed);
            self.counters.run(job, self.name);
            return;
        };

        let queued = self.counters.queued.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.max_queued.fetch_max(queued, Ordering::Relaxed);

        let job = match sender.try_send(job) {
            Ok(()) => return,
            Err(TrySendError::Full(job)) if !self.on_own_worker() => match sender.send(job) {
                Ok(()) => return,
                Err(e) => e.into_inner(),
            },
            Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => job,
        };
        self.counters.queued.fetch_sub(1, Ordering::Relaxed);
        self.counters.run_inline.fetch_add(1, Ordering::Relaxed);
        self.counters.run(job, self.name);
    }

    /// Stop accepting jobs, finish the queued ones and join the workers
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                error!("Kibbutz {} worker exited abnormally", self.name);
            }
        }
        info!("Kibbutz {} stopped", self.name);
    }

    /// Current counters
    pub fn status(&self) -> KibbutzStatus {
        let c = &self.counters;
        KibbutzStatus {
            threads: self.threads as u64,
            active: c.active.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            max_queued: c.max_queued.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            run_inline: c.run_inline.load(Ordering::Relaxed),
            exec_time_us: c.exec_time_us.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Kibbutz {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_runs_every_job() {
        let pool = Kibbutz::new("test", 3, 16).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let done = Arc::clone(&done);
            pool.enqueue(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 100);
        let status = pool.status();
        assert_eq!(status.processed, 100);
        assert_eq!(status.queued, 0);
        assert_eq!(status.threads, 3);
    }

    #[test]
    fn test_worker_runs_inline_when_queue_full() {
        let pool = Arc::new(Kibbutz::new("inline", 1, 1).unwrap());
        let (tx, rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();

        // Park the only worker, fill the queue, then have the worker enqueue
        let inner = Arc::clone(&pool);
        pool.enqueue(move || {
            release_rx.recv().unwrap();
            let tx2 = tx.clone();
            inner.enqueue(move || tx2.send("nested").unwrap());
            tx.send("outer").unwrap();
        });
        pool.enqueue(|| {});
        release_tx.send(()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "nested");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "outer");
        assert_eq!(pool.status().run_inline, 1);
        pool.shutdown();
    }

    #[test]
    fn test_enqueue_after_shutdown_runs_inline() {
        let pool = Kibbutz::new("closed", 1, 4).unwrap();
        pool.shutdown();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        pool.enqueue(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_job_keeps_worker_alive() {
        let pool = Kibbutz::new("panicky", 1, 4).unwrap();
        pool.enqueue(|| panic!("boom"));
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        pool.enqueue(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
