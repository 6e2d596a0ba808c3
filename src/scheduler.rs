use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::{sync::Notify, task::JoinHandle};

pub type ScheduledWork = Arc<dyn Fn() -> BoxFuture<'static, eyre::Result<()>> + Send + Sync>;

#[derive(Default)]
struct Cancellation {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration`, returns true if cancelled in the meantime.
    async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_cancelled(),
            _ = self.notify.notified() => true,
        }
    }
}

struct Timer {
    cancellation: Arc<Cancellation>,
    handle: JoinHandle<()>,
}

/// Runs a unit of async work repeatedly.
///
/// The next invocation is scheduled only once the previous one has completed: `period` after a
/// success, `retry_period` after a failure. Must be armed from within a tokio runtime.
pub struct TaskScheduler {
    name: String,
    work: ScheduledWork,
    period: Duration,
    retry_period: Duration,
    timer: Mutex<Option<Timer>>,
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("retry_period", &self.retry_period)
            .finish_non_exhaustive()
    }
}

impl TaskScheduler {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        work: F,
        period: Duration,
        retry_period: Duration,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = eyre::Result<()>> + Send + 'static,
    {
        let work: ScheduledWork = Arc::new(move || Box::pin(work()));
        Self {
            name: name.into(),
            work,
            period,
            retry_period,
            timer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arms the timer, replacing any previously armed one. The first invocation happens after
    /// `initial_delay`.
    pub fn set_timer(&self, initial_delay: Duration) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = timer.take() {
            previous.cancellation.cancel();
            previous.handle.abort();
        }

        let cancellation = Arc::new(Cancellation::default());
        let handle = tokio::spawn(run(
            self.name.clone(),
            self.work.clone(),
            self.period,
            self.retry_period,
            initial_delay,
            cancellation.clone(),
        ));

        *timer = Some(Timer {
            cancellation,
            handle,
        });
    }

    /// Stops scheduling. An invocation already in flight runs to completion, none starts after
    /// this returns.
    pub fn release_resources(&self) {
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.cancellation.cancel();
            tracing::debug!(target = "amms_sync::scheduler", name = %self.name, "Released");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.release_resources();
    }
}

async fn run(
    name: String,
    work: ScheduledWork,
    period: Duration,
    retry_period: Duration,
    initial_delay: Duration,
    cancellation: Arc<Cancellation>,
) {
    let mut delay = initial_delay;

    loop {
        if cancellation.sleep(delay).await {
            break;
        }

        delay = match work().await {
            Ok(()) => period,
            Err(err) => {
                tracing::error!(
                    target = "amms_sync::scheduler",
                    name = %name,
                    ?err,
                    retry_in = ?retry_period,
                    "Scheduled task failed"
                );
                retry_period
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use tokio::time::{sleep, Duration, Instant};

    use super::TaskScheduler;

    #[tokio::test(start_paused = true)]
    async fn test_retry_timing() {
        let start = Instant::now();
        let invocations = Arc::new(Mutex::new(vec![]));

        let recorded = invocations.clone();
        let scheduler = TaskScheduler::new(
            "retry",
            move || {
                let recorded = recorded.clone();
                async move {
                    let mut recorded = recorded.lock().unwrap();
                    recorded.push(start.elapsed().as_secs());
                    if recorded.len() == 1 {
                        eyre::bail!("first call fails");
                    }
                    Ok(())
                }
            },
            Duration::from_secs(60),
            Duration::from_secs(2),
        );

        scheduler.set_timer(Duration::ZERO);
        sleep(Duration::from_secs(150)).await;

        assert_eq!(*invocations.lock().unwrap(), vec![0, 2, 62, 122]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay() {
        let start = Instant::now();
        let first = Arc::new(Mutex::new(None));

        let recorded = first.clone();
        let scheduler = TaskScheduler::new(
            "delayed",
            move || {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().get_or_insert(start.elapsed());
                    Ok(())
                }
            },
            Duration::from_secs(60),
            Duration::from_secs(2),
        );

        scheduler.set_timer(Duration::from_secs(30));
        sleep(Duration::from_secs(45)).await;

        assert_eq!(first.lock().unwrap().unwrap().as_secs(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_stops_invocations() {
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let scheduler = TaskScheduler::new(
            "release",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Duration::from_secs(10),
            Duration::from_secs(1),
        );

        scheduler.set_timer(Duration::ZERO);
        sleep(Duration::from_secs(25)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.release_resources();
        assert!(!scheduler.is_armed());
        sleep(Duration::from_secs(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_invocation_completes_after_release() {
        let completed = Arc::new(AtomicUsize::new(0));

        let counter = completed.clone();
        let scheduler = TaskScheduler::new(
            "in-flight",
            move || {
                let counter = counter.clone();
                async move {
                    sleep(Duration::from_secs(5)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        scheduler.set_timer(Duration::ZERO);
        sleep(Duration::from_secs(2)).await;
        scheduler.release_resources();

        sleep(Duration::from_secs(30)).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_replaces_timer() {
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let scheduler = TaskScheduler::new(
            "rearm",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Duration::from_secs(60),
            Duration::from_secs(1),
        );

        scheduler.set_timer(Duration::from_secs(5));
        scheduler.set_timer(Duration::from_secs(5));
        sleep(Duration::from_secs(30)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases() {
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let scheduler = TaskScheduler::new(
            "drop",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            Duration::from_secs(10),
            Duration::from_secs(1),
        );

        scheduler.set_timer(Duration::from_secs(10));
        drop(scheduler);
        sleep(Duration::from_secs(100)).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
