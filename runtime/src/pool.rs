//! Worker pool: runs dispatches across a fixed set of threads
//!
//! # Architecture
//!
//! - **Workers**: one thread per configured worker, each owning a
//!   [`ThreadContext`] for its whole life. Workers pull work items
//!   (`(dispatch context, worker index)`) from a shared queue.
//! - **Coordinator**: receives jobs in submission order. A dispatch job takes
//!   a free [`DispatchContext`] (allocating one if none is free), prepares it
//!   and posts one work item per worker index. A barrier job waits until every
//!   outstanding work item has completed and returns the contexts to the free
//!   list.
//!
//! Dispatches submitted without a barrier in between may run concurrently.
//! Bindings referenced by a descriptor set must stay alive until a barrier
//! covering the dispatch has completed (see [`WorkerPool::wait`]). Dropping
//! the pool runs every queued dispatch to completion before it returns.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::context::{DispatchContext, ThreadContext};
use crate::error::RuntimeError;
use crate::program::Program;

enum Job {
    Dispatch {
        program: Program,
        descriptor_set: Vec<u8>,
        groups: [u32; 3],
    },
    Barrier,
    // Replies with the number of panicked work items since the last sync.
    Sync(SyncSender<usize>),
}

struct Work {
    ctx: Arc<DispatchContext>,
    index: usize,
}

pub struct WorkerPool {
    jobs: Option<SyncSender<Job>>,
    coordinator: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let nworkers = config.workers;

        let (work_tx, work_rx) = mpsc::sync_channel::<Work>(nworkers);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (done_tx, done_rx) = mpsc::channel::<bool>();

        let mut workers = Vec::with_capacity(nworkers);
        for index in 0..nworkers {
            let work = Arc::clone(&work_rx);
            let done = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || worker_loop(&work, &done))
                .map_err(|e| RuntimeError::Spawn(e.to_string()))?;
            workers.push(handle);
        }
        drop(done_tx);

        let (jobs_tx, jobs_rx) = mpsc::sync_channel(config.queue_depth);
        let coordinator = thread::Builder::new()
            .name(format!("{}-coordinator", config.thread_name))
            .spawn(move || coordinate(nworkers, jobs_rx, work_tx, done_rx))
            .map_err(|e| RuntimeError::Spawn(e.to_string()))?;

        log::debug!("worker pool started with {} worker(s)", nworkers);
        Ok(WorkerPool {
            jobs: Some(jobs_tx),
            coordinator: Some(coordinator),
            workers,
            config,
        })
    }

    pub fn workers(&self) -> usize {
        self.config.workers
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Queue a dispatch of `program` over `groups`. The descriptor set is
    /// copied; blocks only when `queue_depth` jobs are already pending.
    ///
    /// # Safety
    ///
    /// Same contract as [`DispatchContext::prepare`]: `descriptor_set` must
    /// encode live bindings matching the program's layout. The bindings must
    /// stay valid until a barrier covering this dispatch has completed, or
    /// until the pool has been dropped.
    ///
    /// ```compile_fail
    /// use kernrun_runtime::{Program, WorkerPool};
    /// fn run(pool: &WorkerPool, program: &Program, bytes: &[u8]) {
    ///     pool.dispatch(program, bytes, [1, 1, 1]).unwrap();
    /// }
    /// ```
    pub unsafe fn dispatch(
        &self,
        program: &Program,
        descriptor_set: &[u8],
        groups: [u32; 3],
    ) -> Result<(), RuntimeError> {
        self.submit(Job::Dispatch {
            program: program.clone(),
            descriptor_set: descriptor_set.to_vec(),
            groups,
        })
    }

    /// Queue a barrier: later jobs are not started until every earlier
    /// dispatch has finished.
    pub fn barrier(&self) -> Result<(), RuntimeError> {
        self.submit(Job::Barrier)
    }

    /// Block until the coordinator has processed every earlier job.
    pub fn sync(&self) -> Result<(), RuntimeError> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.submit(Job::Sync(reply_tx))?;
        match reply_rx.recv() {
            Ok(0) => Ok(()),
            Ok(panicked) => Err(RuntimeError::WorkerPanicked(panicked)),
            Err(_) => Err(RuntimeError::PoolStopped),
        }
    }

    /// Block until every dispatch submitted so far has completed.
    pub fn wait(&self) -> Result<(), RuntimeError> {
        self.barrier()?;
        self.sync()
    }

    fn submit(&self, job: Job) -> Result<(), RuntimeError> {
        let jobs = self.jobs.as_ref().ok_or(RuntimeError::PoolStopped)?;
        jobs.send(job).map_err(|_| RuntimeError::PoolStopped)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the job queue makes the coordinator wait for the work it has
        // handed out, then close the work queue so the workers exit.
        self.jobs.take();
        if let Some(coordinator) = self.coordinator.take() {
            if coordinator.join().is_err() {
                log::error!("pool coordinator panicked");
            }
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("pool worker panicked");
            }
        }
        log::debug!("worker pool stopped");
    }
}

fn worker_loop(work: &Mutex<Receiver<Work>>, done: &Sender<bool>) {
    let mut thread = ThreadContext::new();
    loop {
        let item = work.lock().recv();
        let Ok(item) = item else {
            break;
        };

        let ok = panic::catch_unwind(AssertUnwindSafe(|| {
            item.ctx.dispatch_thread(item.index, &mut thread)
        }))
        .is_ok();
        if !ok {
            let name = item.ctx.program().map_or("<unprepared>", Program::name);
            log::error!("kernel '{}' panicked on worker index {}", name, item.index);
            thread.reset();
        }

        // Release the context before reporting so a barrier can reclaim it.
        drop(item);
        // The coordinator may be gone; keep serving until the work queue closes.
        let _ = done.send(ok);
    }
}

fn coordinate(
    nworkers: usize,
    jobs: Receiver<Job>,
    work: SyncSender<Work>,
    done: Receiver<bool>,
) {
    let mut free: Vec<DispatchContext> = Vec::new();
    let mut used: Vec<Arc<DispatchContext>> = Vec::new();
    let mut panicked = 0usize;

    for job in &jobs {
        match job {
            Job::Dispatch {
                program,
                descriptor_set,
                groups,
            } => {
                let mut ctx = free.pop().unwrap_or_default();
                // Submitters of `Job::Dispatch` went through `WorkerPool::dispatch`.
                unsafe { ctx.prepare(nworkers, &program, &descriptor_set, groups) };
                let ctx = Arc::new(ctx);
                for index in 0..nworkers {
                    let item = Work {
                        ctx: Arc::clone(&ctx),
                        index,
                    };
                    if work.send(item).is_err() {
                        return;
                    }
                }
                used.push(ctx);
            }
            Job::Barrier => {
                if !barrier(nworkers, &mut used, &mut free, &done, &mut panicked) {
                    return;
                }
            }
            Job::Sync(reply) => {
                let _ = reply.send(std::mem::take(&mut panicked));
            }
        }
    }

    // Job queue closed: finish what was handed out before closing the work queue.
    barrier(nworkers, &mut used, &mut free, &done, &mut panicked);
    if panicked > 0 {
        log::warn!("{} work item(s) panicked after the last sync", panicked);
    }
}

/// Wait for every outstanding work item and recycle the contexts. Returns
/// false if the workers are gone.
fn barrier(
    nworkers: usize,
    used: &mut Vec<Arc<DispatchContext>>,
    free: &mut Vec<DispatchContext>,
    done: &Receiver<bool>,
    panicked: &mut usize,
) -> bool {
    for _ in 0..used.len() * nworkers {
        match done.recv() {
            Ok(true) => {}
            Ok(false) => *panicked += 1,
            Err(_) => return false,
        }
    }
    for ctx in used.drain(..) {
        match Arc::try_unwrap(ctx) {
            Ok(ctx) => free.push(ctx),
            Err(_) => log::warn!("dispatch context still shared after barrier"),
        }
    }
    true
}
