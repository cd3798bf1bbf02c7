//! A bounded worker pool with a coordinator callback queue.
//!
//! Tasks are submitted from the coordinator thread, executed FIFO by the
//! first available worker, and their results are forwarded back over a
//! single event channel that only the coordinator consumes. Stopping the
//! pool enqueues one exit sentinel per worker — behind any tasks already
//! queued, so queued work finishes first — joins the workers, and finally
//! posts [`PoolEvent::Stopped`] to unblock the coordinator's receive loop.
//!
//! Aborting flips a flag that makes workers drop remaining tasks on the
//! floor before stopping; used when a run is cut short by a failure.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

type Work<R> = Box<dyn FnOnce() -> R + Send + 'static>;

enum PoolTask<R> {
    Run(Work<R>),
    Exit,
}

/// An event delivered to the coordinator.
pub enum PoolEvent<R> {
    /// A task finished and produced this result.
    Completed(R),
    /// The pool has stopped; no further events will arrive.
    Stopped,
}

pub struct WorkerPool<R: Send + 'static> {
    task_tx: Sender<PoolTask<R>>,
    event_tx: Sender<PoolEvent<R>>,
    event_rx: Receiver<PoolEvent<R>>,
    workers: Vec<JoinHandle<()>>,
    aborted: Arc<AtomicBool>,
    stopped: bool,
}

impl<R: Send + 'static> WorkerPool<R> {
    /// Spawn a pool with the given number of worker threads (at least one).
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (task_tx, task_rx) = unbounded::<PoolTask<R>>();
        let (event_tx, event_rx) = unbounded::<PoolEvent<R>>();
        let aborted = Arc::new(AtomicBool::new(false));

        let workers = (0..threads)
            .map(|index| {
                let task_rx = task_rx.clone();
                let event_tx = event_tx.clone();
                let aborted = aborted.clone();
                std::thread::Builder::new()
                    .name(format!("csbuild-worker-{index}"))
                    .spawn(move || {
                        while let Ok(task) = task_rx.recv() {
                            match task {
                                PoolTask::Exit => return,
                                PoolTask::Run(work) => {
                                    if aborted.load(Ordering::Acquire) {
                                        continue;
                                    }
                                    let result = work();
                                    if event_tx.send(PoolEvent::Completed(result)).is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { task_tx, event_tx, event_rx, workers, aborted, stopped: false }
    }

    /// Queue a task for the first available worker. Safe to call from the
    /// coordinator at any time, including while draining events.
    pub fn submit(&self, work: impl FnOnce() -> R + Send + 'static) {
        let _ = self.task_tx.send(PoolTask::Run(Box::new(work)));
    }

    /// The coordinator's event channel.
    pub fn events(&self) -> &Receiver<PoolEvent<R>> {
        &self.event_rx
    }

    /// Stop the pool. Tasks already queued run to completion first; the
    /// final event delivered is [`PoolEvent::Stopped`].
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for _ in 0..self.workers.len() {
            let _ = self.task_tx.send(PoolTask::Exit);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        let _ = self.event_tx.send(PoolEvent::Stopped);
    }

    /// Stop the pool without running tasks still in the queue.
    pub fn abort(&mut self) {
        self.aborted.store(true, Ordering::Release);
        self.stop();
    }
}

impl<R: Send + 'static> Drop for WorkerPool<R> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn results_arrive_on_the_event_channel() {
        let mut pool: WorkerPool<usize> = WorkerPool::new(4);
        for i in 0..200 {
            pool.submit(move || i * 2);
        }

        let mut total = 0;
        let mut seen = 0;
        loop {
            match pool.events().recv().unwrap() {
                PoolEvent::Completed(value) => {
                    total += value;
                    seen += 1;
                    if seen == 200 {
                        pool.stop();
                    }
                }
                PoolEvent::Stopped => break,
            }
        }
        assert_eq!(seen, 200);
        assert_eq!(total, (0..200).map(|i| i * 2).sum::<usize>());
    }

    #[test]
    fn tasks_can_submit_more_tasks_indirectly() {
        // The scheduler's pattern: a completion event causes the coordinator
        // to enqueue follow-up work until everything drains.
        let mut pool: WorkerPool<u32> = WorkerPool::new(2);
        pool.submit(|| 0);
        let mut outstanding = 1;
        let mut completed = 0;
        loop {
            match pool.events().recv().unwrap() {
                PoolEvent::Completed(depth) => {
                    outstanding -= 1;
                    completed += 1;
                    if depth < 5 {
                        for _ in 0..2 {
                            pool.submit(move || depth + 1);
                            outstanding += 1;
                        }
                    }
                    if outstanding == 0 {
                        pool.stop();
                    }
                }
                PoolEvent::Stopped => break,
            }
        }
        // 1 + 2 + 4 + ... + 32 tasks at depths 0..=5.
        assert_eq!(completed, 63);
    }

    #[test]
    fn queued_tasks_finish_before_stop() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        let mut pool: WorkerPool<()> = WorkerPool::new(1);
        for _ in 0..10 {
            pool.submit(|| {
                RAN.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.stop();
        assert_eq!(RAN.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn abort_drops_queued_tasks() {
        let ran = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(AtomicBool::new(false));
        let mut pool: WorkerPool<()> = WorkerPool::new(1);
        {
            let ran = ran.clone();
            let gate = gate.clone();
            pool.submit(move || {
                while !gate.load(Ordering::Acquire) {
                    std::thread::yield_now();
                }
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        for _ in 0..10 {
            let ran = ran.clone();
            pool.submit(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Release the gate only after the abort flag is set, so the worker
        // deterministically sees the abort before draining the queue.
        let release = std::thread::spawn({
            let gate = gate.clone();
            move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                gate.store(true, Ordering::Release);
            }
        });
        pool.abort();
        release.join().unwrap();
        // Only the in-flight task ran; everything queued was dropped.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
