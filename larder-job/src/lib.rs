//! Per-queue serial job scheduling.
//!
//! Work is serialized per logical queue, one repository say, while a
//! global semaphore bounds how many jobs run at once across all queues.
//! Within one queue, jobs run in submission order and never overlap; across
//! queues there is no ordering at all. Job errors are logged, never
//! propagated: a job that matters arranges its own signalling.

#![cfg_attr(not(test), warn(clippy::unwrap_used))]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Error a job may fail with. Only ever logged.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

type JobFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;
type JobFn = Box<dyn FnOnce(CancellationToken) -> JobFuture + Send>;

#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Maximum jobs running at once, across all queues.
    pub concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

struct Job {
    id: String,
    run: JobFn,
}

struct Inner {
    /// Pending jobs per queue. A map entry exists exactly while a worker for
    /// that queue is alive.
    queues: Mutex<HashMap<String, VecDeque<Job>>>,
    slots: Arc<Semaphore>,
    root: CancellationToken,
}

/// Handle to the scheduler. Clones share one set of queues and one
/// concurrency budget; [`Scheduler::with_queue_prefix`] derives handles that
/// namespace their queue ids.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    prefix: String,
}

impl Scheduler {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                slots: Arc::new(Semaphore::new(config.concurrency.max(1))),
                root: CancellationToken::new(),
            }),
            prefix: String::new(),
        }
    }

    /// A child scheduler whose queue ids are prefixed with `{prefix}/`,
    /// sharing this scheduler's concurrency budget.
    pub fn with_queue_prefix(&self, prefix: &str) -> Self {
        Self {
            inner: self.inner.clone(),
            prefix: format!("{}{prefix}/", self.prefix),
        }
    }

    /// Append a job to `queue`. The job runs once every job submitted to the
    /// queue before it has finished, with a context cancelled when the
    /// scheduler shuts down.
    pub fn submit<F, Fut>(&self, queue: &str, id: &str, job: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        if self.inner.root.is_cancelled() {
            tracing::debug!(queue = %queue, job = %id, "scheduler is shut down, dropping job");
            return;
        }
        let queue = format!("{}{queue}", self.prefix);
        let job = Job {
            id: id.to_owned(),
            run: Box::new(move |token| Box::pin(job(token))),
        };

        let start = {
            let mut queues = self.inner.queues.lock().expect("scheduler lock is not poisoned");
            match queues.get_mut(&queue) {
                Some(jobs) => {
                    jobs.push_back(job);
                    false
                }
                None => {
                    queues.insert(queue.clone(), VecDeque::from([job]));
                    true
                }
            }
        };
        if start {
            tokio::spawn(worker(self.inner.clone(), queue));
        }
    }

    /// Submit `job` to `queue` every `period` until the scheduler shuts
    /// down. Errors do not stop the loop.
    pub fn submit_periodic<F, Fut>(&self, queue: &str, id: &str, period: Duration, job: F)
    where
        F: Fn(CancellationToken) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let scheduler = self.clone();
        let queue = queue.to_owned();
        let id = id.to_owned();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.reset();

            loop {
                tokio::select! {
                    _ = scheduler.inner.root.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let job = job.clone();
                scheduler.submit(&queue, &id, move |token| job(token));
            }
            tracing::debug!(queue = %queue, job = %id, "periodic job stopped");
        });
    }

    /// Cancel every in-flight job and drop everything still queued. Further
    /// submissions are ignored.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
    }

    /// The scheduler's root cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.root
    }
}

/// Drains one queue, job by job, holding a global slot while each runs. The
/// worker exits, and its queue entry disappears, once the queue is empty.
async fn worker(inner: Arc<Inner>, queue: String) {
    loop {
        let job = {
            let mut queues = inner.queues.lock().expect("scheduler lock is not poisoned");
            let Some(jobs) = queues.get_mut(&queue) else {
                break;
            };
            match jobs.pop_front() {
                Some(job) => job,
                None => {
                    queues.remove(&queue);
                    break;
                }
            }
        };

        let permit = tokio::select! {
            _ = inner.root.cancelled() => None,
            permit = inner.slots.clone().acquire_owned() => permit.ok(),
        };
        if permit.is_none() || inner.root.is_cancelled() {
            tracing::debug!(queue = %queue, job = %job.id, "scheduler is shut down, dropping job");
            continue;
        }

        tracing::debug!(queue = %queue, job = %job.id, "job started");
        match (job.run)(inner.root.child_token()).await {
            Ok(()) => tracing::debug!(queue = %queue, job = %job.id, "job finished"),
            Err(err) => {
                tracing::error!(queue = %queue, job = %job.id, error = %err, "job failed")
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Tracks how many jobs run at once, and the highest that has been.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_within_queue() {
        let scheduler = Scheduler::new(Config { concurrency: 4 });
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..8u64 {
            let order = order.clone();
            scheduler.submit("repo", &format!("job-{i}"), move |_| async move {
                // The later jobs finish faster; order must hold regardless.
                tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(i * 5))).await;
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_overlap_within_queue() {
        let scheduler = Scheduler::new(Config { concurrency: 8 });
        let gauge = Arc::new(Gauge::default());

        for i in 0..6 {
            let gauge = gauge.clone();
            scheduler.submit("serial", &format!("job-{i}"), move |_| async move {
                gauge.enter();
                tokio::time::sleep(Duration::from_millis(30)).await;
                gauge.exit();
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(gauge.peak(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_global_concurrency_bound() {
        let scheduler = Scheduler::new(Config { concurrency: 2 });
        let gauge = Arc::new(Gauge::default());
        let done = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let gauge = gauge.clone();
            let done = done.clone();
            scheduler.submit(&format!("queue-{i}"), "job", move |_| async move {
                gauge.enter();
                tokio::time::sleep(Duration::from_millis(50)).await;
                gauge.exit();
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(gauge.peak() <= 2);
        assert!(gauge.peak() >= 2, "parallelism across queues expected");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_queue_prefix_namespacing() {
        let scheduler = Scheduler::new(Config { concurrency: 8 });
        let go = scheduler.with_queue_prefix("go");
        let hermit = scheduler.with_queue_prefix("hermit");
        let gauge = Arc::new(Gauge::default());

        // Same queue name through different prefixes: distinct queues, so
        // the jobs may overlap.
        for child in [go, hermit] {
            let gauge = gauge.clone();
            child.submit("github.com/a/b", "fetch", move |_| async move {
                gauge.enter();
                tokio::time::sleep(Duration::from_millis(60)).await;
                gauge.exit();
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(gauge.peak(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nested_prefixes_compose() {
        let scheduler = Scheduler::new(Config { concurrency: 8 });
        let child = scheduler.with_queue_prefix("go").with_queue_prefix("mod");
        let gauge = Arc::new(Gauge::default());

        // One fully-qualified queue id: strictly serial.
        for i in 0..3 {
            let gauge = gauge.clone();
            child.submit("example.com/x", &format!("job-{i}"), move |_| async move {
                gauge.enter();
                tokio::time::sleep(Duration::from_millis(20)).await;
                gauge.exit();
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(gauge.peak(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_errors_are_swallowed_and_queue_continues() {
        let scheduler = Scheduler::new(Config::default());
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let ran = ran.clone();
            scheduler.submit("q", "fails", move |_| async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Err("broken".into())
            });
        }
        {
            let ran = ran.clone();
            scheduler.submit("q", "succeeds", move |_| async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_periodic_survives_errors() {
        let scheduler = Scheduler::new(Config::default());
        let fired = Arc::new(AtomicUsize::new(0));

        {
            let fired = fired.clone();
            scheduler.submit_periodic("tick", "refresh", Duration::from_millis(50), move |_| {
                let fired = fired.clone();
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Err("always fails".into())
                }
            });
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        // floor(400 / 50) - 1, with slack for scheduling noise.
        assert!(fired.load(Ordering::SeqCst) >= 5);

        scheduler.shutdown();
        let stopped_at = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst) <= stopped_at + 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_cancels_in_flight_and_drops_queued() {
        let scheduler = Scheduler::new(Config::default());
        let cancelled = Arc::new(AtomicUsize::new(0));
        let second_ran = Arc::new(AtomicUsize::new(0));

        {
            let cancelled = cancelled.clone();
            scheduler.submit("q", "long", move |token| async move {
                token.cancelled().await;
                cancelled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        {
            let second_ran = second_ran.clone();
            scheduler.submit("q", "queued", move |_| async move {
                second_ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(second_ran.load(Ordering::SeqCst), 0);

        // Submissions after shutdown are ignored.
        scheduler.submit("q", "late", |_| async { Ok(()) });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(second_ran.load(Ordering::SeqCst), 0);
    }
}
