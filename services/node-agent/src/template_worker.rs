//! Keeps the ML index templates installed.
//!
//! Runs a bootstrap pass at startup, whenever the cluster state changes and
//! on a fixed interval, and publishes whether all templates are current.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mlnode_templates::{TemplateBootstrapper, UpgradeReport};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Shortest period between interval passes.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct TemplateUpgradeWorker {
    bootstrapper: Arc<TemplateBootstrapper>,
    interval: Duration,
    ready: watch::Sender<bool>,
    passes: AtomicU64,
}

impl TemplateUpgradeWorker {
    /// `interval` is raised to [`MIN_CHECK_INTERVAL`] if shorter.
    pub fn new(bootstrapper: Arc<TemplateBootstrapper>, interval: Duration) -> Self {
        Self {
            bootstrapper,
            interval: interval.max(MIN_CHECK_INTERVAL),
            ready: watch::channel(false).0,
            passes: AtomicU64::new(0),
        }
    }

    /// Flips to true once all templates are installed and current.
    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Run one bootstrap pass off the async runtime and publish readiness.
    pub async fn run_pass(&self) -> Option<UpgradeReport> {
        let bootstrapper = Arc::clone(&self.bootstrapper);
        let pass = tokio::task::spawn_blocking(move || {
            let report = bootstrapper.run_upgrade_pass();
            let ready = bootstrapper.all_templates_installed();
            (report, ready)
        })
        .await;
        self.passes.fetch_add(1, Ordering::Relaxed);

        let (report, ready) = match pass {
            Ok(pass) => pass,
            Err(e) => {
                warn!(error = %e, "Template upgrade pass did not complete");
                return None;
            }
        };

        let changed = self.ready.send_if_modified(|current| {
            let changed = *current != ready;
            *current = ready;
            changed
        });
        if changed && ready {
            info!("All ML index templates installed");
        } else if changed {
            warn!("ML index templates are no longer current");
        }
        debug!(
            installed = report.installed_count(),
            failed = report.failed_count(),
            ready,
            "Template upgrade pass finished"
        );
        Some(report)
    }

    /// Run passes until shutdown. `cluster_state` carries the cluster state
    /// version; each change triggers a pass.
    #[instrument(skip_all, fields(interval_secs = self.interval.as_secs()))]
    pub async fn run(
        self: Arc<Self>,
        mut cluster_state: watch::Receiver<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting template upgrade worker");
        self.run_pass().await;

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await;
        let mut watching_cluster_state = true;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.run_pass().await;
                }
                changed = cluster_state.changed(), if watching_cluster_state => {
                    match changed {
                        Ok(()) => {
                            let version = *cluster_state.borrow_and_update();
                            debug!(cluster_state_version = version, "Cluster state changed");
                            self.run_pass().await;
                        }
                        Err(_) => {
                            debug!("Cluster state source closed, continuing on interval only");
                            watching_cluster_state = false;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Template upgrade worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlnode_templates::{
        InMemoryTemplateStore, IndexTemplateSpec, InstalledTemplate, StoreError, TemplateContext,
        TemplateStore,
    };
    use std::sync::atomic::AtomicBool;

    /// Store that fails every read while `down` is set.
    struct OutageStore {
        inner: InMemoryTemplateStore,
        down: AtomicBool,
    }

    impl TemplateStore for OutageStore {
        fn installed(&self, name: &str) -> Result<InstalledTemplate, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("cluster blocked".to_string()));
            }
            self.inner.installed(name)
        }

        fn compare_and_put(
            &self,
            template: &IndexTemplateSpec,
            expected: InstalledTemplate,
        ) -> Result<bool, StoreError> {
            self.inner.compare_and_put(template, expected)
        }
    }

    fn worker(store: Arc<dyn TemplateStore>, interval: Duration) -> Arc<TemplateUpgradeWorker> {
        let bootstrapper = Arc::new(TemplateBootstrapper::new(
            TemplateContext::new(true, Duration::from_secs(60)),
            store,
        ));
        Arc::new(TemplateUpgradeWorker::new(bootstrapper, interval))
    }

    #[tokio::test]
    async fn test_single_pass_sets_ready() {
        let store = Arc::new(InMemoryTemplateStore::new());
        let worker = worker(store.clone(), Duration::from_secs(60));
        assert!(!worker.is_ready());

        let report = worker.run_pass().await.unwrap();
        assert_eq!(report.installed_count(), 4);
        assert!(worker.is_ready());

        worker.run_pass().await.unwrap();
        assert_eq!(store.write_count(), 4);
    }

    #[tokio::test]
    async fn test_cluster_state_change_retries_after_outage() {
        let store = Arc::new(OutageStore {
            inner: InMemoryTemplateStore::new(),
            down: AtomicBool::new(true),
        });
        let worker = worker(store.clone(), Duration::from_secs(3600));
        let mut ready = worker.readiness();
        let (state_tx, state_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&worker).run(state_rx, shutdown_rx));

        while worker.pass_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!*ready.borrow());

        store.down.store(false, Ordering::SeqCst);
        state_tx.send_replace(1);
        ready.wait_for(|r| *r).await.unwrap();

        shutdown_tx.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_interval_raised_to_minimum() {
        let worker = worker(Arc::new(InMemoryTemplateStore::new()), Duration::ZERO);
        assert_eq!(worker.interval, MIN_CHECK_INTERVAL);

        let mut ready = worker.readiness();
        let (_state_tx, state_rx) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&worker).run(state_rx, shutdown_rx));

        ready.wait_for(|r| *r).await.unwrap();
        shutdown_tx.send_replace(true);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_pass_runs_without_cluster_state() {
        let store = Arc::new(OutageStore {
            inner: InMemoryTemplateStore::new(),
            down: AtomicBool::new(true),
        });
        let worker = worker(store.clone(), Duration::from_secs(30));
        let mut ready = worker.readiness();
        let (state_tx, state_rx) = watch::channel(0u64);
        drop(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(Arc::clone(&worker).run(state_rx, shutdown_rx));
        while worker.pass_count() == 0 {
            tokio::task::yield_now().await;
        }

        store.down.store(false, Ordering::SeqCst);
        ready.wait_for(|r| *r).await.unwrap();
        assert!(worker.pass_count() >= 2);

        shutdown_tx.send_replace(true);
        handle.await.unwrap();
    }
}
