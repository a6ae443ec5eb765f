//! In-process recurring job runner
use crate::error::{StoreError, StoreResult};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct MaintenanceScheduler {
    jobs: Mutex<Vec<(String, JoinHandle<()>)>>,
    shutdown: watch::Sender<bool>,
}

impl Default for MaintenanceScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MaintenanceScheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    fn runtime(&self) -> StoreResult<tokio::runtime::Handle> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StoreError::Capability(format!("maintenance scheduler unavailable: {}", e)))?;
        if *self.shutdown.borrow() {
            return Err(StoreError::Capability("maintenance scheduler is shut down".into()));
        }
        Ok(runtime)
    }

    fn register(&self, name: &str, handle: JoinHandle<()>) {
        self.jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((name.to_string(), handle));
    }

    /// Runs `job` every `period`, first after one full period. Fails without a Tokio runtime.
    pub fn every<F, Fut>(&self, name: &str, period: Duration, job: F) -> StoreResult<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = self.runtime()?;
        let mut shutdown = self.shutdown.subscribe();
        let job_name = name.to_string();
        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        debug!("Running maintenance job {}", job_name);
                        job().await;
                    }
                }
            }
            debug!("Maintenance job {} stopped", job_name);
        });

        self.register(name, handle);
        info!("Scheduled maintenance job {} every {:?}", name, period);
        Ok(())
    }

    /// Runs `job` each time `signal` changes after registration, until the sender is dropped.
    pub fn on_change<T, F, Fut>(&self, name: &str, mut signal: watch::Receiver<T>, job: F) -> StoreResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = self.runtime()?;
        signal.borrow_and_update();
        let mut shutdown = self.shutdown.subscribe();
        let job_name = name.to_string();
        let handle = runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    changed = signal.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        debug!("Running triggered job {}", job_name);
                        job().await;
                    }
                }
            }
            debug!("Triggered job {} stopped", job_name);
        });

        self.register(name, handle);
        info!("Scheduled job {} on signal", name);
        Ok(())
    }

    pub fn job_names(&self) -> Vec<String> {
        let jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        jobs.iter().map(|(name, _)| name.clone()).collect()
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let jobs: Vec<_> = self.jobs.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        for (name, handle) in jobs {
            if let Err(e) = handle.await {
                warn!("Maintenance job {} ended abnormally: {}", name, e);
            }
        }
    }
}
