//! # Job Dispatcher
//!
//! Runs jobs on worker threads with a bound on how many run at once.
//!
//! ## Architecture
//!
//! - **Job queue**: bounded crossbeam channel; [`Dispatcher::submit`] blocks
//!   while it is full
//! - **Coordinator**: one thread takes jobs off the queue and spawns a worker
//!   thread per job
//! - **Slots**: a bounded channel of capacity `max_workers` used as a
//!   counting semaphore; a slot is taken before a worker thread is spawned
//!   and given back when the thread ends, panics included
//!
//! ## Stopping
//!
//! The coordinator stops when the queue is closed and drained, or when the
//! [`Cancellation`] fires. Either way it joins the workers already running
//! before [`Dispatcher::wait`] returns. Jobs still queued at cancellation are
//! dropped without being run.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};

use crate::error::{Error, Result};

/// Something that runs jobs. Called concurrently from several threads.
pub trait Work: Send + Sync + 'static {
    type Job: Send + 'static;

    fn work(&self, job: Self::Job);
}

/// Cooperative cancellation signal.
///
/// Fires when the matching [`CancelHandle`] is cancelled. The signal is the
/// disconnection of a channel no one ever sends on, so every clone observes
/// it and a `select!` can wait on it.
#[derive(Clone)]
pub struct Cancellation {
    signal: Receiver<()>,
    // Keeps the sender alive until the handle takes it
    _trigger: Arc<Mutex<Option<Sender<()>>>>,
}

/// Fires a [`Cancellation`].
#[derive(Clone)]
pub struct CancelHandle {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
}

/// Create a linked cancel handle and cancellation signal.
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (sender, signal) = bounded(0);
    let trigger = Arc::new(Mutex::new(Some(sender)));
    (
        CancelHandle {
            trigger: Arc::clone(&trigger),
        },
        Cancellation {
            signal,
            _trigger: trigger,
        },
    )
}

impl CancelHandle {
    /// Fire the signal. Later calls do nothing.
    pub fn cancel(&self) {
        let sender = self.trigger.lock().unwrap_or_else(|e| e.into_inner()).take();
        if sender.is_some() {
            info!("Cancellation requested");
        }
    }
}

impl Cancellation {
    /// A signal that never fires.
    pub fn never() -> Cancellation {
        Cancellation {
            signal: crossbeam_channel::never(),
            _trigger: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.signal.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Receiver that becomes ready once cancelled, for use in `select!`.
    pub fn signal(&self) -> &Receiver<()> {
        &self.signal
    }
}

/// Bounded-concurrency job dispatcher.
pub struct Dispatcher<W: Work> {
    worker: Arc<W>,
    max_workers: usize,
    jobs_tx: Option<Sender<W::Job>>,
    jobs_rx: Option<Receiver<W::Job>>,
    cancel: Cancellation,
    coordinator: Option<JoinHandle<()>>,
}

impl<W: Work> Dispatcher<W> {
    /// Create a dispatcher.
    ///
    /// # Arguments
    ///
    /// * `worker` - Runs the jobs.
    /// * `max_workers` - Maximum number of jobs running at once.
    /// * `buffers` - Capacity of the job queue.
    ///
    pub fn new(worker: Arc<W>, max_workers: usize, buffers: usize) -> Result<Dispatcher<W>> {
        if max_workers == 0 {
            return Err(Error::Validity("max workers must be at least 1".into()));
        }

        let (jobs_tx, jobs_rx) = bounded(buffers);

        Ok(Dispatcher {
            worker,
            max_workers,
            jobs_tx: Some(jobs_tx),
            jobs_rx: Some(jobs_rx),
            cancel: Cancellation::never(),
            coordinator: None,
        })
    }

    /// Queue a job, blocking while the queue is full.
    ///
    /// Fails with [`Error::Cancelled`] once cancellation has fired, and with
    /// [`Error::Validity`] after [`Dispatcher::close`].
    pub fn submit(&self, job: W::Job) -> Result<()> {
        let jobs = self
            .jobs_tx
            .as_ref()
            .ok_or_else(|| Error::Validity("dispatcher is closed".into()))?;

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        select! {
            send(jobs, job) -> res => res.map_err(|_| Error::Cancelled),
            recv(self.cancel.signal()) -> _ => Err(Error::Cancelled),
        }
    }

    /// Start the coordinator thread.
    pub fn start(&mut self, cancel: Cancellation) -> Result<()> {
        let jobs = self
            .jobs_rx
            .take()
            .ok_or_else(|| Error::Validity("dispatcher already started".into()))?;

        self.cancel = cancel.clone();
        let worker = Arc::clone(&self.worker);
        let max_workers = self.max_workers;

        debug!("Starting dispatcher with {} workers", max_workers);
        self.coordinator = Some(thread::spawn(move || {
            dispatch_loop(worker, jobs, max_workers, cancel)
        }));

        Ok(())
    }

    /// Declare that no more jobs will be submitted.
    pub fn close(&mut self) {
        self.jobs_tx = None;
    }

    /// Block until the coordinator has stopped and every started job ended.
    ///
    /// Closes the queue first, since nothing can be submitted afterwards.
    pub fn wait(mut self) {
        self.close();
        if let Some(coordinator) = self.coordinator.take() {
            if coordinator.join().is_err() {
                error!("Dispatcher thread panicked");
            }
        }
    }
}

/// Slot held by a running job; released on drop.
struct SlotGuard {
    slots: Receiver<()>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = self.slots.try_recv();
    }
}

fn dispatch_loop<W: Work>(
    worker: Arc<W>,
    jobs: Receiver<W::Job>,
    max_workers: usize,
    cancel: Cancellation,
) {
    let (acquire, release) = bounded::<()>(max_workers);
    let mut running: Vec<JoinHandle<()>> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            debug!("Dispatcher cancelled");
            break;
        }

        let job = select! {
            recv(jobs) -> job => job.ok(),
            recv(cancel.signal()) -> _ => None,
        };
        let Some(job) = job else {
            if cancel.is_cancelled() {
                debug!("Dispatcher cancelled");
            } else {
                debug!("Job queue closed and drained");
            }
            break;
        };

        // Blocks while every slot is taken
        let acquired = select! {
            send(acquire, ()) -> res => res.is_ok(),
            recv(cancel.signal()) -> _ => false,
        };
        if !acquired {
            debug!("Dispatcher cancelled while waiting for a worker slot");
            break;
        }

        let guard = SlotGuard {
            slots: release.clone(),
        };
        let worker = Arc::clone(&worker);
        running.push(thread::spawn(move || {
            let _guard = guard;
            worker.work(job);
        }));

        let (finished, pending): (Vec<_>, Vec<_>) =
            running.into_iter().partition(|handle| handle.is_finished());
        join_all(finished);
        running = pending;
    }

    debug!("Waiting for {} running jobs", running.len());
    join_all(running);
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            error!("Worker thread panicked");
        }
    }
}
