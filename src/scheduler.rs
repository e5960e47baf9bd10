//! Per-connection cooperative scheduler (component D).
//!
//! Grounded on `watched_tasks.rs`'s pattern of driving work through
//! `async-std` channels consumed by a single logical task. A `Connection`
//! needs something narrower than `WatchedTasks`: a single-threaded queue of
//! closures it can post to immediately or after a delay, with the ability
//! to cancel everything pending (used by `hard_reset`) and to wait until
//! the queue has drained (used by tests and graceful shutdown).

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_std::channel::{unbounded, Receiver, Sender};
use async_std::task;
use log::trace;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

enum Event {
    Job(Job),
    CancelAll,
    Quiesce(Sender<()>),
}

/// A handle used to post work onto a [`Scheduler`]'s run loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: Sender<Event>,
}

impl SchedulerHandle {
    /// Post a job to run as soon as the scheduler is free.
    pub fn post<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.tx.try_send(Event::Job(Box::pin(job)));
    }

    /// Post a job to run after `delay`, unless cancelled first by
    /// [`SchedulerHandle::cancel_all`].
    pub fn post_after<F>(&self, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.tx.clone();
        task::spawn(async move {
            task::sleep(delay).await;
            let _ = tx.try_send(Event::Job(Box::pin(job)));
        });
    }

    /// Drop every job not yet started. Running jobs finish normally.
    /// Mirrors the original's behavior of discarding pending scheduler
    /// work on a hard reset.
    pub fn cancel_all(&self) {
        let _ = self.tx.try_send(Event::CancelAll);
    }

    /// Resolve once every job posted before this call has run.
    pub async fn wait_quiescent(&self) {
        let (tx, rx) = unbounded();
        if self.tx.send(Event::Quiesce(tx)).await.is_ok() {
            let _ = rx.recv().await;
        }
    }
}

/// Owns the run loop; dropping it stops processing further events once the
/// current job completes.
pub struct Scheduler {
    rx: Receiver<Event>,
}

impl Scheduler {
    pub fn new() -> (Self, SchedulerHandle) {
        let (tx, rx) = unbounded();
        (Self { rx }, SchedulerHandle { tx })
    }

    /// Drive the scheduler until its handle (and all clones) are dropped.
    pub async fn run(self) {
        let mut pending: Vec<Job> = Vec::new();
        let mut rx = self.rx;

        loop {
            match rx.recv().await {
                Ok(Event::Job(job)) => {
                    pending.push(job);
                    while let Some(job) = pending.pop() {
                        job.await;
                    }
                }
                Ok(Event::CancelAll) => {
                    trace!("scheduler: cancelling {} pending jobs", pending.len());
                    pending.clear();
                }
                Ok(Event::Quiesce(done)) => {
                    let _ = done.send(()).await;
                }
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn post_runs_jobs_in_order() {
        task::block_on(async {
            let (scheduler, handle) = Scheduler::new();
            let counter = Arc::new(AtomicUsize::new(0));

            let c1 = counter.clone();
            handle.post(async move {
                c1.fetch_add(1, Ordering::SeqCst);
            });

            drop(handle);
            scheduler.run().await;

            assert_eq!(counter.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn cancel_all_drops_pending_jobs() {
        task::block_on(async {
            let (scheduler, handle) = Scheduler::new();
            let counter = Arc::new(AtomicUsize::new(0));

            let c1 = counter.clone();
            handle.post_after(Duration::from_secs(3600), async move {
                c1.fetch_add(1, Ordering::SeqCst);
            });
            handle.cancel_all();

            handle.post(async {});
            drop(handle);

            let run = scheduler.run();
            let _ = async_std::future::timeout(Duration::from_millis(50), run).await;

            assert_eq!(counter.load(Ordering::SeqCst), 0);
        });
    }
}
