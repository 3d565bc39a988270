use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[allow(unused_imports)]
use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::cache::ManagedCache;
use crate::manager::Manager;
use crate::metadata::Metadata;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Dispatches background work for the manager.
///
/// The manager never blocks on the executor; tasks it submits are one-shot,
/// idempotent and free to run in any order or concurrently with each other.
pub trait Executor: Send + Sync {
    fn spawn(&self, task: Job);
}

/// A small fixed-size thread pool backing [`Executor`].
pub struct ThreadPoolExecutor {
    shared:  Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

struct PoolShared {
    queue:     Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown:  AtomicBool,
}

impl ThreadPoolExecutor {
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(PoolShared {
            queue:     Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown:  AtomicBool::new(false),
        });

        let workers = (0..threads.max(1))
            .map(|n| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("cachepool-worker-{}", n))
                    .spawn(move || loop {
                        let job = {
                            let mut queue = shared.queue.lock();
                            loop {
                                if let Some(job) = queue.pop_front() {
                                    break Some(job);
                                }
                                if shared.shutdown.load(Ordering::Acquire) {
                                    break None;
                                }
                                shared.available.wait(&mut queue);
                            }
                        };
                        match job {
                            Some(job) => job(),
                            None => return,
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        ThreadPoolExecutor { shared, workers }
    }
}

impl Executor for ThreadPoolExecutor {
    fn spawn(&self, task: Job) {
        self.shared.queue.lock().push_back(task);
        self.shared.available.notify_one();
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        {
            // taking the queue lock here closes the gap between a worker's
            // shutdown check and its wait
            let _queue = self.shared.queue.lock();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Reclaims memory from a cache until it fits its soft limit again, then
/// finalizes the shrink by pinning the hard limit onto the soft limit.
///
/// Holds a strong handle to the cache so the manager cannot drop it while the
/// task is in flight.
pub(crate) struct FreeMemoryTask {
    manager:  Arc<Manager>,
    cache:    Arc<dyn ManagedCache>,
    metadata: Arc<Metadata>,
}

impl FreeMemoryTask {
    pub(crate) fn new(
        manager: Arc<Manager>,
        cache: Arc<dyn ManagedCache>,
        metadata: Arc<Metadata>,
    ) -> Self {
        FreeMemoryTask {
            manager,
            cache,
            metadata,
        }
    }

    pub(crate) fn run(self) {
        #[cfg(feature = "logging")]
        debug!("free memory task running for cache {}", self.metadata.id());
        self.cache.free_memory();
        self.manager.finish_shrink(&self.metadata);
    }
}

/// Rehashes a cache into its granted auxiliary table, then returns the old
/// table to the manager's pool.
pub(crate) struct MigrateTask {
    manager:  Arc<Manager>,
    cache:    Arc<dyn ManagedCache>,
    metadata: Arc<Metadata>,
}

impl MigrateTask {
    pub(crate) fn new(
        manager: Arc<Manager>,
        cache: Arc<dyn ManagedCache>,
        metadata: Arc<Metadata>,
    ) -> Self {
        MigrateTask {
            manager,
            cache,
            metadata,
        }
    }

    pub(crate) fn run(self) {
        #[cfg(feature = "logging")]
        debug!("migrate task running for cache {}", self.metadata.id());
        self.cache.migrate();
        self.manager.reclaim_auxiliary(&self.metadata);
    }
}
