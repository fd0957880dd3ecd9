//! Periodic housekeeping on independent intervals: the queue's retry sweep,
//! queue and active execution gauge refresh, and monitor cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{MonitorConfig, QueueConfig};
use crate::monitor::ActiveExecutionMonitor;
use crate::queue::WorkQueue;
use crate::telemetry::metrics::QueueStateGauges;
use crate::worker::Shutdown;

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub retry_sweep_interval: Duration,
    pub gauge_registration_interval: Duration,
    pub cleanup_interval: Duration,
}

impl MaintenanceConfig {
    pub fn from_settings(queue: &QueueConfig, monitor: &MonitorConfig) -> Self {
        Self {
            retry_sweep_interval: queue.retry_sweep_interval,
            gauge_registration_interval: monitor.gauge_registration_interval,
            cleanup_interval: monitor.cleanup_interval,
        }
    }
}

pub struct Maintenance {
    queue: WorkQueue,
    monitor: Option<Arc<ActiveExecutionMonitor>>,
    queue_gauges: QueueStateGauges,
    config: MaintenanceConfig,
    shutdown: Arc<Shutdown>,
}

impl Maintenance {
    pub fn new(queue: WorkQueue, config: MaintenanceConfig, shutdown: Arc<Shutdown>) -> Self {
        let queue_gauges = QueueStateGauges::register(queue.name());
        Self {
            queue,
            monitor: None,
            queue_gauges,
            config,
            shutdown,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<ActiveExecutionMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn queue_gauges(&self) -> &QueueStateGauges {
        &self.queue_gauges
    }

    /// Run until shutdown. A failed tick is logged; the next tick retries.
    pub async fn run(&self) {
        let mut retry = interval(self.config.retry_sweep_interval);
        let mut gauges = interval(self.config.gauge_registration_interval);
        let mut cleanup = interval(self.config.cleanup_interval);
        let has_monitor = self.monitor.is_some();

        info!(queue = %self.queue.name(), has_monitor, "maintenance started");

        loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    info!(queue = %self.queue.name(), "maintenance stopped");
                    return;
                }
                _ = retry.tick() => self.sweep_queue().await,
                _ = gauges.tick() => self.refresh_gauges().await,
                _ = cleanup.tick(), if has_monitor => self.cleanup_monitor().await,
            }
        }
    }

    async fn sweep_queue(&self) {
        match self.queue.retry().await {
            Ok(summary) if summary.requeued + summary.dead_lettered + summary.purged > 0 => {
                info!(
                    queue = %self.queue.name(),
                    requeued = summary.requeued,
                    dead_lettered = summary.dead_lettered,
                    purged = summary.purged,
                    "retry sweep"
                );
            }
            Ok(_) => debug!(queue = %self.queue.name(), "retry sweep found nothing"),
            Err(e) => error!(queue = %self.queue.name(), "retry sweep failed: {e}"),
        }
    }

    async fn refresh_gauges(&self) {
        match self.queue.read_state().await {
            Ok(state) => {
                if state.orphaned > 0 {
                    warn!(queue = %self.queue.name(), orphaned = state.orphaned, "orphaned message bodies");
                }
                self.queue_gauges.update(state);
            }
            Err(e) => error!(queue = %self.queue.name(), "queue gauge refresh failed: {e}"),
        }
        if let Some(monitor) = &self.monitor
            && let Err(e) = monitor.register_gauges().await
        {
            error!("active execution gauge refresh failed: {e}");
        }
    }

    async fn cleanup_monitor(&self) {
        let Some(monitor) = &self.monitor else {
            return;
        };
        match monitor.cleanup().await {
            Ok(summary) => debug!(
                checked = summary.checked,
                removed = summary.removed,
                "active execution cleanup"
            ),
            Err(e) => error!("active execution cleanup failed: {e}"),
        }
    }
}

/// Ticker that never panics on a zero period; anything below 1ms runs at 1ms.
fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
