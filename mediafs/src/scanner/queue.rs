//! A bounded work queue drained by a fixed number of workers.
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Instrument, Span};

/// Counts tasks queued or being handled.
#[derive(Default)]
struct Outstanding {
    count: AtomicUsize,
    peak: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    fn add(&self) {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(count, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

type Handler<T> = Arc<dyn Fn(T, Spawner<T>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handed to the task handler, to enqueue follow-up tasks.
///
/// If the queue is full, the follow-up is handled right away by the worker
/// spawning it, before it continues with its own task. Workers therefore
/// never wait for room in their own queue.
pub struct Spawner<T> {
    sender: mpsc::Sender<T>,
    handler: Handler<T>,
    outstanding: Arc<Outstanding>,
}

impl<T> Clone for Spawner<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            handler: self.handler.clone(),
            outstanding: self.outstanding.clone(),
        }
    }
}

impl<T: Send + 'static> Spawner<T> {
    pub async fn spawn(&self, task: T) {
        match self.sender.try_reserve() {
            Ok(permit) => {
                self.outstanding.add();
                permit.send(task);
            }
            Err(_) => (self.handler)(task, self.clone()).await,
        }
    }
}

/// A fixed pool of workers consuming tasks from a bounded queue.
///
/// [WorkerPool::submit] waits while the queue is full, and follow-ups that
/// don't fit are handled inline, so with `W` workers and capacity `Q`, no
/// more than `Q + W` tasks are queued or being handled.
pub struct WorkerPool<T> {
    sender: mpsc::Sender<T>,
    outstanding: Arc<Outstanding>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Starts `workers` workers (at least one) on a queue holding up to
    /// `capacity` tasks (at least one). Each task is passed to `handler`,
    /// along with a [Spawner] to enqueue follow-ups.
    pub fn start<F, Fut>(workers: usize, capacity: usize, handler: F) -> Self
    where
        F: Fn(T, Spawner<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let outstanding = Arc::new(Outstanding::default());
        let cancel = CancellationToken::new();
        let handler: Handler<T> = Arc::new(move |task, spawner| handler(task, spawner).boxed());

        let spawner = Spawner {
            sender: sender.clone(),
            handler,
            outstanding: outstanding.clone(),
        };

        let workers = (0..workers.max(1))
            .map(|_| {
                let spawner = spawner.clone();
                let receiver = receiver.clone();
                let cancel = cancel.clone();

                tokio::spawn(
                    async move {
                        loop {
                            let next = {
                                let mut receiver = receiver.lock().await;
                                tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => None,
                                    task = receiver.recv() => task,
                                }
                            };
                            let Some(task) = next else {
                                break;
                            };

                            (spawner.handler)(task, spawner.clone()).await;
                            spawner.outstanding.done();
                        }
                    }
                    .instrument(Span::current()),
                )
            })
            .collect();

        Self {
            sender,
            outstanding,
            cancel,
            workers,
        }
    }

    /// Enqueues a task, waiting for room in the queue.
    pub async fn submit(&self, task: T) {
        match self.sender.reserve().await {
            Ok(permit) => {
                self.outstanding.add();
                permit.send(task);
            }
            // only after shutdown, which takes self.
            Err(_) => warn!("worker pool is shut down, dropping task"),
        }
    }

    /// Waits until every submitted and spawned task has been handled, then
    /// stops the workers. Returns the highest number of tasks that were
    /// queued or being handled at once.
    pub async fn finish(self) -> usize {
        self.outstanding.wait_idle().await;
        self.cancel.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(err = %e, "scan worker failed");
            }
        }
        self.outstanding.peak.load(Ordering::SeqCst)
    }
}
