//! Deployment Watcher
//! Timer loop driving reconciliation cycles, one at a time

use crate::domain::use_cases::{ApplicationUpdateManager, UpdateReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct DeploymentWatcher {
    update_manager: Arc<dyn ApplicationUpdateManager>,
    check_interval: Duration,
    busy: Arc<AtomicBool>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl DeploymentWatcher {
    pub fn new(update_manager: Arc<dyn ApplicationUpdateManager>, check_interval: Duration) -> Self {
        Self {
            update_manager,
            check_interval,
            busy: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        }
    }

    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Run a cycle now unless one is already in flight
    pub async fn check_now(&self) -> Option<UpdateReport> {
        run_guarded(&self.busy, self.update_manager.as_ref()).await
    }

    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!("Deployment watcher already started");
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(watch(
            self.update_manager.clone(),
            self.check_interval,
            self.busy.clone(),
            token.clone(),
        ));
        *running = Some((token, handle));
        info!(interval_sec = self.check_interval.as_secs(), "Deployment watcher started");
    }

    /// Stop the timer and wait for an in-flight cycle. No tick fires afterwards.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.running.lock().await.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Deployment watcher task ended abnormally");
        }
        info!("Deployment watcher stopped");
    }
}

/// Clears the busy flag when the cycle ends, including by panic
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn run_guarded(
    busy: &AtomicBool,
    update_manager: &dyn ApplicationUpdateManager,
) -> Option<UpdateReport> {
    if busy
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        debug!("Reconciliation cycle still running, skipping tick");
        return None;
    }
    let _guard = BusyGuard(busy);
    Some(update_manager.check_for_updates().await)
}

async fn watch(
    update_manager: Arc<dyn ApplicationUpdateManager>,
    check_interval: Duration,
    busy: Arc<AtomicBool>,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycle: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if busy.load(Ordering::Acquire) {
            debug!("Reconciliation cycle still running, skipping tick");
            continue;
        }
        if let Some(previous) = cycle.take_if(|previous| previous.is_finished()) {
            if let Err(e) = previous.await {
                warn!(error = %e, "Reconciliation cycle ended abnormally");
            }
        }
        let update_manager = update_manager.clone();
        let busy = busy.clone();
        cycle = Some(tokio::spawn(async move {
            run_guarded(&busy, update_manager.as_ref()).await;
        }));
    }

    if let Some(cycle) = cycle {
        let _ = cycle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct SlowUpdateManager {
        cycle: Duration,
        calls: AtomicU32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
    }

    impl SlowUpdateManager {
        fn new(cycle: Duration) -> Arc<Self> {
            Arc::new(Self {
                cycle,
                calls: AtomicU32::new(0),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ApplicationUpdateManager for SlowUpdateManager {
        async fn check_for_updates(&self) -> UpdateReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.cycle).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            UpdateReport::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_during_a_cycle_are_skipped() {
        let manager = SlowUpdateManager::new(Duration::from_secs(25));
        let watcher = DeploymentWatcher::new(manager.clone(), Duration::from_secs(10));

        watcher.start().await;
        tokio::time::sleep(Duration::from_secs(65)).await;
        watcher.stop().await;

        assert_eq!(manager.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(manager.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ticks_after_stop() {
        let manager = SlowUpdateManager::new(Duration::from_millis(10));
        let watcher = DeploymentWatcher::new(manager.clone(), Duration::from_secs(10));

        watcher.start().await;
        tokio::time::sleep(Duration::from_secs(15)).await;
        watcher.stop().await;
        let calls = manager.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(100)).await;

        assert_eq!(calls, 2);
        assert_eq!(manager.calls.load(Ordering::SeqCst), calls);
        assert!(!watcher.is_started().await);
    }

    struct PanicOnFirstCall {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ApplicationUpdateManager for PanicOnFirstCall {
        async fn check_for_updates(&self) -> UpdateReport {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("reconciliation blew up");
            }
            UpdateReport::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_cycle_does_not_stall_later_ticks() {
        let manager = Arc::new(PanicOnFirstCall {
            calls: AtomicU32::new(0),
        });
        let watcher = DeploymentWatcher::new(manager.clone(), Duration::from_secs(1));

        watcher.start().await;
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        watcher.stop().await;

        assert!(manager.calls.load(Ordering::SeqCst) >= 10);
        assert!(watcher.check_now().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_now_skips_while_busy() {
        let manager = SlowUpdateManager::new(Duration::from_secs(5));
        let watcher = Arc::new(DeploymentWatcher::new(manager.clone(), Duration::from_secs(60)));

        let background = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.check_now().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(watcher.check_now().await.is_none());
        assert!(background.await.unwrap().is_some());
        assert!(watcher.check_now().await.is_some());
    }
}
