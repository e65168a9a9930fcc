use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Engine-wide stop signal. Cloning shares the same signal.
#[derive(Clone, Debug, Default)]
pub struct GracefulShutdown {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    notify: Notify,
    is_shutting_down: AtomicBool,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initiate_shutdown(&self) {
        self.inner.is_shutting_down.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down.load(Ordering::Acquire)
    }

    /// Resolves once shutdown was initiated, including before this call.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }
}

/// Runs `sweep` every `period` until shutdown. The first tick fires after one
/// full period.
pub async fn sweep_loop<F>(shutdown: GracefulShutdown, period: Duration, mut sweep: F)
where
    F: FnMut() + Send,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            _ = ticker.tick() => sweep(),
        }
    }
    debug!("Idle sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_wait_returns_after_earlier_signal() {
        let shutdown = GracefulShutdown::new();
        shutdown.initiate_shutdown();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait_for_shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_all_waiters_woken() {
        let shutdown = GracefulShutdown::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let s = shutdown.clone();
                tokio::spawn(async move { s.wait_for_shutdown().await })
            })
            .collect();
        tokio::task::yield_now().await;

        shutdown.initiate_shutdown();
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w).await.unwrap().unwrap();
        }
        assert!(shutdown.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_loop_ticks_until_shutdown() {
        let shutdown = GracefulShutdown::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let task = tokio::spawn(sweep_loop(shutdown.clone(), Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(35)).await;
        shutdown.initiate_shutdown();
        task.await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
