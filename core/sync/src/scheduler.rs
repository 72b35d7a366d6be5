//! Sync scheduling: periodic cycles, retries, connectivity triggers and
//! manual requests.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info};

use wayfarer_common::{Error, Result};

use crate::engine::{CycleOutcome, SkipReason, SyncEngine};
use crate::network::NetworkStatusProvider;
use crate::state::NetworkStatus;

/// Requests accepted by the scheduler loop.
#[derive(Debug)]
enum Command {
    /// Run a cycle now and report its outcome.
    Sync(oneshot::Sender<CycleOutcome>),
    /// Stop periodic cycles.
    Pause,
    /// Restart periodic cycles.
    Resume,
    Shutdown,
}

/// Handle to the background sync loop.
///
/// The loop owns two timers: the periodic one and the retry one. A cycle is
/// started when either fires, when the network comes back online, or on
/// request. Pausing only stops the periodic timer. While offline both are
/// disarmed and any pending retry is dropped.
pub struct SyncScheduler {
    command_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start the scheduler loop on the current runtime.
    ///
    /// The first periodic cycle runs one `sync_interval` after start.
    pub fn spawn(engine: Arc<SyncEngine>, network: Arc<dyn NetworkStatusProvider>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let network_rx = network.subscribe();

        let initial = *network_rx.borrow();
        engine.set_network_status(initial);

        let periodic_at = (initial == NetworkStatus::Online)
            .then(|| Instant::now() + engine.config().sync_interval);

        let worker = SchedulerLoop {
            engine,
            commands: command_rx,
            network: network_rx,
            network_open: true,
            paused: false,
            periodic_at,
            retry_at: None,
            in_flight: None,
        };
        let task = tokio::spawn(worker.run());

        info!("Sync scheduler started");
        Self { command_tx, task }
    }

    /// Run a cycle now and wait for its outcome.
    ///
    /// A request that arrives while a cycle is running returns
    /// `Skipped(AlreadySyncing)` without waiting.
    pub async fn start_sync(&self) -> Result<CycleOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Sync(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| Error::Scheduler("Sync request dropped before completion".to_string()))
    }

    /// Stop periodic cycles. A running cycle finishes; manual requests and a
    /// pending retry still run.
    pub async fn pause_sync(&self) -> Result<()> {
        self.send(Command::Pause).await
    }

    /// Re-arm the periodic timer.
    pub async fn resume_sync(&self) -> Result<()> {
        self.send(Command::Resume).await
    }

    /// Stop the loop, letting a running cycle finish first.
    pub async fn shutdown(self) -> Result<()> {
        // The loop may already be gone; joining below still reports that.
        let _ = self.command_tx.send(Command::Shutdown).await;
        self.task
            .await
            .map_err(|e| Error::Scheduler(format!("Scheduler task failed: {}", e)))
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))
    }
}

struct InFlight {
    handle: JoinHandle<CycleOutcome>,
    reply: Option<oneshot::Sender<CycleOutcome>>,
}

struct SchedulerLoop {
    engine: Arc<SyncEngine>,
    commands: mpsc::Receiver<Command>,
    network: watch::Receiver<NetworkStatus>,
    /// False once the network provider is gone.
    network_open: bool,
    paused: bool,
    /// Next periodic cycle. Unset while paused.
    periodic_at: Option<Instant>,
    /// Next retry of a failed cycle.
    retry_at: Option<Instant>,
    in_flight: Option<InFlight>,
}

impl SchedulerLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },

                changed = self.network.changed(), if self.network_open => {
                    if changed.is_err() {
                        debug!("Network status provider closed");
                        self.network_open = false;
                        continue;
                    }
                    let status = *self.network.borrow_and_update();
                    self.handle_network(status);
                }

                _ = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    if self.in_flight.is_none() {
                        debug!("Retry timer fired");
                        self.start_cycle(None);
                    }
                }

                _ = wait_until(self.periodic_at) => {
                    self.periodic_at = None;
                    if self.in_flight.is_none() {
                        debug!("Sync timer fired");
                        self.start_cycle(None);
                    }
                }

                joined = join_cycle(&mut self.in_flight) => {
                    let reply = self.in_flight.take().and_then(|cycle| cycle.reply);
                    self.finish_cycle(joined, reply);
                }
            }
        }

        if let Some(cycle) = self.in_flight.take() {
            if let Ok(outcome) = cycle.handle.await {
                if let Some(reply) = cycle.reply {
                    let _ = reply.send(outcome);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Sync(reply) => {
                if self.in_flight.is_some() {
                    debug!("Manual sync requested while a cycle is running");
                    let _ = reply.send(CycleOutcome::Skipped(SkipReason::AlreadySyncing));
                } else {
                    debug!("Manual sync requested");
                    self.start_cycle(Some(reply));
                }
            }
            Command::Pause => {
                info!("Periodic sync paused");
                self.paused = true;
                self.periodic_at = None;
            }
            Command::Resume => {
                info!("Periodic sync resumed");
                self.paused = false;
                if self.in_flight.is_none() && self.retry_at.is_none() {
                    self.arm_periodic();
                }
            }
            Command::Shutdown => {}
        }
    }

    fn handle_network(&mut self, status: NetworkStatus) {
        self.engine.set_network_status(status);
        match status {
            NetworkStatus::Online => {
                info!("Network online, starting sync");
                if self.in_flight.is_none() {
                    self.start_cycle(None);
                }
            }
            NetworkStatus::Offline => {
                info!("Network offline, sync suspended");
                self.periodic_at = None;
                self.retry_at = None;
            }
        }
    }

    fn start_cycle(&mut self, reply: Option<oneshot::Sender<CycleOutcome>>) {
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move { engine.sync_now().await });
        self.in_flight = Some(InFlight { handle, reply });
    }

    fn finish_cycle(
        &mut self,
        joined: std::result::Result<CycleOutcome, JoinError>,
        reply: Option<oneshot::Sender<CycleOutcome>>,
    ) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Sync cycle task failed: {}", e);
                self.arm_periodic();
                return;
            }
        };

        match &outcome {
            CycleOutcome::RetryScheduled { delay, .. } => {
                self.retry_at = Some(Instant::now() + *delay);
                self.periodic_at = None;
            }
            CycleOutcome::Aborted { .. } | CycleOutcome::Skipped(SkipReason::Offline) => {
                self.retry_at = None;
                self.periodic_at = None;
            }
            CycleOutcome::Completed(_)
            | CycleOutcome::GaveUp { .. }
            | CycleOutcome::Failed { .. }
            | CycleOutcome::Skipped(SkipReason::AlreadySyncing) => {
                self.retry_at = None;
                self.arm_periodic();
            }
        }

        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    fn arm_periodic(&mut self) {
        self.periodic_at = if self.paused || self.engine.status().network_status == NetworkStatus::Offline {
            None
        } else {
            Some(Instant::now() + self.engine.config().sync_interval)
        };
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn join_cycle(in_flight: &mut Option<InFlight>) -> std::result::Result<CycleOutcome, JoinError> {
    match in_flight {
        Some(cycle) => (&mut cycle.handle).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::MemoryApplier;
    use crate::change::{Change, NewChange};
    use crate::conflict::{Conflict, Resolution};
    use crate::engine::SyncConfig;
    use crate::gateway::{MemoryGateway, PushOutcome, SyncGateway};
    use crate::network::NetworkMonitor;
    use crate::queue::OfflineStore;
    use crate::state::SyncPhase;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;
    use wayfarer_common::DeviceId;
    use wayfarer_storage::MemoryRecordStore;

    fn engine_with(gateway: Arc<dyn SyncGateway>, config: SyncConfig) -> Arc<SyncEngine> {
        let store = OfflineStore::open(
            Arc::new(MemoryRecordStore::new()),
            Some(DeviceId::new("phone").unwrap()),
        )
        .unwrap();
        Arc::new(SyncEngine::new(
            store,
            gateway,
            Arc::new(MemoryApplier::new()),
            config,
        ))
    }

    fn setup(config: SyncConfig) -> (Arc<SyncEngine>, Arc<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        (engine_with(gateway.clone(), config), gateway)
    }

    /// Gateway whose pushes hold until released.
    #[derive(Default)]
    struct HeldGateway {
        inner: MemoryGateway,
        release: Notify,
    }

    #[async_trait]
    impl SyncGateway for HeldGateway {
        fn name(&self) -> &str {
            "held"
        }

        async fn push_changes(&self, batch: &[Change]) -> Result<PushOutcome> {
            self.release.notified().await;
            self.inner.push_changes(batch).await
        }

        async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Change>> {
            self.inner.pull_changes(since).await
        }

        async fn resolve_conflict(&self, id: &str, resolution: Resolution, resolved: &Change) -> Result<()> {
            self.inner.resolve_conflict(id, resolution, resolved).await
        }

        async fn list_conflicts(&self) -> Result<Vec<Conflict>> {
            self.inner.list_conflicts().await
        }

        async fn cleanup_resolved(&self) -> Result<()> {
            self.inner.cleanup_resolved().await
        }

        async fn health_check(&self) -> bool {
            self.inner.health_check().await
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_manual_sync() {
        let (engine, gateway) = setup(SyncConfig::default());
        engine
            .queue_change(NewChange::create("trip", "t1", json!({"title": "Lima"})))
            .await
            .unwrap();

        let scheduler = SyncScheduler::spawn(engine.clone(), Arc::new(NetworkMonitor::default()));
        let outcome = scheduler.start_sync().await.unwrap();

        assert_eq!(outcome.report().unwrap().applied, 1);
        assert_eq!(gateway.push_calls(), 1);
        assert_eq!(engine.status().pending_changes, 0);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_sync() {
        let (engine, gateway) = setup(SyncConfig {
            sync_interval: Duration::from_millis(30),
            ..Default::default()
        });

        let scheduler = SyncScheduler::spawn(engine, Arc::new(NetworkMonitor::default()));
        wait_for(|| gateway.health_calls() >= 2).await;

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_then_gives_up() {
        let (engine, gateway) = setup(SyncConfig {
            max_retries: 3,
            retry_delay: Duration::from_millis(20),
            sync_interval: Duration::from_secs(60),
            ..Default::default()
        });
        engine
            .queue_change(NewChange::update("budget", "b1", json!({"limit": 50})))
            .await
            .unwrap();
        gateway.fail_pushes(10);

        let scheduler = SyncScheduler::spawn(engine.clone(), Arc::new(NetworkMonitor::default()));
        let first = scheduler.start_sync().await.unwrap();
        assert!(matches!(first, CycleOutcome::RetryScheduled { attempt: 1, .. }));

        wait_for(|| gateway.push_calls() == 3 && engine.status().phase == SyncPhase::Idle).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(gateway.push_calls(), 3);
        let status = engine.status();
        assert!(status.error.unwrap().contains("3 attempts"));
        assert_eq!(status.pending_changes, 1);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_coming_online_triggers_sync() {
        let (engine, gateway) = setup(SyncConfig::default());
        engine
            .queue_change(NewChange::update("trip", "t1", json!({})))
            .await
            .unwrap();
        let monitor = Arc::new(NetworkMonitor::new(NetworkStatus::Offline));

        let scheduler = SyncScheduler::spawn(engine.clone(), monitor.clone());
        assert!(matches!(
            scheduler.start_sync().await.unwrap(),
            CycleOutcome::Skipped(SkipReason::Offline)
        ));
        assert_eq!(gateway.push_calls(), 0);

        monitor.go_online();
        wait_for(|| gateway.push_calls() == 1).await;
        wait_for(|| engine.status().pending_changes == 0).await;

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_going_offline_drops_retry() {
        let (engine, gateway) = setup(SyncConfig {
            retry_delay: Duration::from_millis(60),
            ..Default::default()
        });
        engine
            .queue_change(NewChange::update("trip", "t1", json!({})))
            .await
            .unwrap();
        gateway.fail_pushes(10);
        let monitor = Arc::new(NetworkMonitor::default());

        let scheduler = SyncScheduler::spawn(engine.clone(), monitor.clone());
        assert!(matches!(
            scheduler.start_sync().await.unwrap(),
            CycleOutcome::RetryScheduled { .. }
        ));

        monitor.go_offline();
        wait_for(|| engine.status().network_status == NetworkStatus::Offline).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(gateway.push_calls(), 1);
        assert_eq!(engine.status().phase, SyncPhase::Idle);

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (engine, gateway) = setup(SyncConfig {
            sync_interval: Duration::from_millis(30),
            ..Default::default()
        });

        let scheduler = SyncScheduler::spawn(engine, Arc::new(NetworkMonitor::default()));
        scheduler.pause_sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(gateway.health_calls(), 0);

        scheduler.resume_sync().await.unwrap();
        wait_for(|| gateway.health_calls() >= 1).await;

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_runs_while_paused() {
        let (engine, gateway) = setup(SyncConfig {
            retry_delay: Duration::from_millis(40),
            sync_interval: Duration::from_secs(60),
            ..Default::default()
        });
        engine
            .queue_change(NewChange::update("trip", "t1", json!({"title": "Quito"})))
            .await
            .unwrap();
        gateway.fail_pushes(1);

        let scheduler = SyncScheduler::spawn(engine.clone(), Arc::new(NetworkMonitor::default()));
        scheduler.pause_sync().await.unwrap();
        assert!(matches!(
            scheduler.start_sync().await.unwrap(),
            CycleOutcome::RetryScheduled { attempt: 1, .. }
        ));

        wait_for(|| gateway.push_calls() == 2 && engine.status().pending_changes == 0).await;
        assert!(engine.status().error.is_none());

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_keeps_scheduled_retry() {
        let (engine, gateway) = setup(SyncConfig {
            retry_delay: Duration::from_millis(80),
            sync_interval: Duration::from_secs(60),
            ..Default::default()
        });
        engine
            .queue_change(NewChange::update("trip", "t1", json!({})))
            .await
            .unwrap();
        gateway.fail_pushes(1);

        let scheduler = SyncScheduler::spawn(engine.clone(), Arc::new(NetworkMonitor::default()));
        assert!(matches!(
            scheduler.start_sync().await.unwrap(),
            CycleOutcome::RetryScheduled { .. }
        ));
        scheduler.pause_sync().await.unwrap();

        wait_for(|| gateway.push_calls() == 2 && engine.status().pending_changes == 0).await;

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_during_cycle_is_answered_at_once() {
        let gateway = Arc::new(HeldGateway::default());
        let engine = engine_with(gateway.clone(), SyncConfig::default());
        engine
            .queue_change(NewChange::create("trip", "t1", json!({})))
            .await
            .unwrap();

        let scheduler = Arc::new(SyncScheduler::spawn(
            engine.clone(),
            Arc::new(NetworkMonitor::default()),
        ));
        let first = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.start_sync().await }
        });
        wait_for(|| engine.status().is_syncing).await;

        let second = tokio::time::timeout(Duration::from_secs(1), scheduler.start_sync())
            .await
            .expect("request answered while the cycle runs")
            .unwrap();
        assert!(matches!(second, CycleOutcome::Skipped(SkipReason::AlreadySyncing)));
        scheduler.pause_sync().await.unwrap();

        gateway.release.notify_one();
        assert!(first.await.unwrap().unwrap().is_completed());
        assert_eq!(engine.status().pending_changes, 0);
    }
}
