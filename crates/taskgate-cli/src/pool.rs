//! Background dispatcher pool.
//!
//! Each dispatcher is a blocking loop on the tokio blocking pool that calls
//! [`Kernel::run_next_task`] until shutdown, sleeping for the poll interval
//! whenever the queue is empty.  A maintenance task reaps stale claims and
//! runs the health check on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use taskgate_kernel::Kernel;
use taskgate_types::DispatchOutcome;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub dispatchers: usize,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub verify_limit: usize,
    pub maintenance_interval: Duration,
}

/// Dropping the pool without [`stop`](Self::stop) still ends every loop:
/// the shutdown sender is dropped before the runtime.
pub struct DispatcherPool {
    shutdown: watch::Sender<bool>,
    runtime: Runtime,
    dispatchers: Vec<JoinHandle<usize>>,
    maintenance: JoinHandle<()>,
}

impl DispatcherPool {
    pub fn start(kernel: Arc<Kernel>, settings: PoolSettings) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("taskgate-pool")
            .build()?;
        let (shutdown, stop_rx) = watch::channel(false);

        let dispatchers = (0..settings.dispatchers.max(1))
            .map(|worker| {
                let kernel = kernel.clone();
                let stop_rx = stop_rx.clone();
                runtime.spawn_blocking(move || {
                    dispatch_loop(worker, &kernel, &stop_rx, settings.poll_interval)
                })
            })
            .collect();
        let maintenance = runtime.spawn(maintenance_loop(kernel, stop_rx, settings));

        info!(dispatchers = settings.dispatchers, "dispatcher pool started");
        Ok(Self {
            shutdown,
            runtime,
            dispatchers,
            maintenance,
        })
    }

    /// Signal shutdown, wait for every loop to finish its current pass and
    /// return the number of tasks resolved.
    pub fn stop(self) -> usize {
        let Self {
            shutdown,
            runtime,
            dispatchers,
            maintenance,
        } = self;
        // Receivers outlive the send; an error only means every loop is gone.
        let _ = shutdown.send(true);

        let resolved = runtime.block_on(async move {
            let mut resolved = 0;
            for handle in dispatchers {
                match handle.await {
                    Ok(n) => resolved += n,
                    Err(e) => error!(error = %e, "dispatcher loop terminated abnormally"),
                }
            }
            if let Err(e) = maintenance.await {
                error!(error = %e, "maintenance loop terminated abnormally");
            }
            resolved
        });
        info!(resolved, "dispatcher pool stopped");
        resolved
    }
}

fn dispatch_loop(
    worker: usize,
    kernel: &Kernel,
    stop: &watch::Receiver<bool>,
    poll_interval: Duration,
) -> usize {
    let mut resolved = 0;
    // `has_changed` errs once the sender is gone.
    while !*stop.borrow() && stop.has_changed().is_ok() {
        match kernel.run_next_task() {
            Ok(DispatchOutcome::Resolved { task_id, outcome }) => {
                resolved += 1;
                debug!(worker, %task_id, ?outcome, "dispatch pass resolved task");
            }
            Ok(DispatchOutcome::Idle) => std::thread::sleep(poll_interval),
            Err(e) => {
                error!(worker, error = %e, "dispatch pass failed");
                std::thread::sleep(poll_interval);
            }
        }
    }
    resolved
}

async fn maintenance_loop(
    kernel: Arc<Kernel>,
    mut stop: watch::Receiver<bool>,
    settings: PoolSettings,
) {
    let mut ticker = tokio::time::interval(settings.maintenance_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }
        let kernel = kernel.clone();
        let pass = tokio::task::spawn_blocking(move || run_maintenance(&kernel, &settings));
        if let Err(e) = pass.await {
            error!(error = %e, "maintenance pass panicked");
        }
    }
}

/// Reap stale claims, then verify every chain.
pub fn run_maintenance(kernel: &Kernel, settings: &PoolSettings) {
    match kernel.reap_stale_claims(settings.stale_after) {
        Ok(0) => {}
        Ok(reaped) => warn!(reaped, "stale claims returned to the retry path"),
        Err(e) => error!(error = %e, "stale-claim reaper failed"),
    }
    match kernel
        .health_monitor(settings.verify_limit, settings.stale_after)
        .check()
    {
        Ok(report) if report.healthy => {
            debug!(pending = report.pending, chains = report.chains.len(), "health check passed");
        }
        Ok(report) => {
            let broken: Vec<&str> = report
                .chains
                .iter()
                .filter(|chain| !chain.valid)
                .map(|chain| chain.client_id.as_str())
                .collect();
            warn!(?broken, "health check found broken receipt chains");
        }
        Err(e) => error!(error = %e, "health check failed"),
    }
}
