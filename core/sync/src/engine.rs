//! Core sync engine that orchestrates push, pull and conflict handling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use wayfarer_common::{EntityKey, Error, Result};

use crate::applier::ChangeApplier;
use crate::change::{Change, NewChange};
use crate::conflict::{Conflict, ConflictResolver, ConflictStrategy, PriorityPolicy, Resolution};
use crate::gateway::{PushOutcome, SyncGateway};
use crate::queue::{OfflineStore, ValidationReport};
use crate::retry::{RetryConfig, RetryDecision, RetryTracker};
use crate::state::{NetworkStatus, StatusCell, SyncPhase, SyncStatus};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Consecutive failed cycles before automatic retry stops.
    pub max_retries: u32,
    /// Time between periodic cycles while idle.
    pub sync_interval: Duration,
    /// Fixed delay before retrying a failed cycle.
    pub retry_delay: Duration,
    /// Upper bound for a single gateway call.
    pub gateway_timeout: Duration,
    /// Strategy used when conflicts are auto-resolved.
    pub conflict_strategy: ConflictStrategy,
    /// Whether to apply `conflict_strategy` as soon as a conflict appears.
    pub auto_resolve_conflicts: bool,
    /// Conflict ranking weights.
    pub priority: PriorityPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sync_interval: Duration::from_secs(30),
            retry_delay: Duration::from_secs(30),
            gateway_timeout: Duration::from_secs(30),
            conflict_strategy: ConflictStrategy::Manual,
            auto_resolve_conflicts: false,
            priority: PriorityPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON configuration. Missing fields use defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid sync configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.sync_interval.is_zero() {
            return Err(Error::Config("sync_interval must be greater than zero".to_string()));
        }
        if self.gateway_timeout.is_zero() {
            return Err(Error::Config("gateway_timeout must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Retry settings derived from this configuration.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(self.max_retries).with_retry_delay(self.retry_delay)
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// Cycle start; becomes the new last sync time.
    pub started_at: DateTime<Utc>,
    /// Changes submitted to the gateway.
    pub pushed: usize,
    /// Changes the gateway accepted.
    pub applied: usize,
    /// New conflicts recorded.
    pub conflicts: usize,
    /// Changes the gateway rejected; still queued.
    pub failed: usize,
    /// Remote changes applied locally.
    pub pulled: usize,
    /// Remote changes held back because their entity is in conflict.
    pub deferred: usize,
    /// Malformed queued changes left out of the batch.
    pub skipped_invalid: usize,
    /// Superseded changes dropped by de-duplication.
    pub compacted: usize,
    pub duration: Duration,
}

impl SyncReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            pushed: 0,
            applied: 0,
            conflicts: 0,
            failed: 0,
            pulled: 0,
            deferred: 0,
            skipped_invalid: 0,
            compacted: 0,
            duration: Duration::ZERO,
        }
    }
}

/// Why a trigger did not start a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
}

/// What a sync trigger led to.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No cycle was started.
    Skipped(SkipReason),
    /// The cycle finished.
    Completed(SyncReport),
    /// The cycle failed; another attempt is due after `delay`.
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    /// The cycle failed and the retry budget is spent.
    GaveUp { attempts: u32, error: String },
    /// The cycle failed while the network was going away; nothing is scheduled.
    Aborted { error: String },
    /// The cycle failed with an error another attempt would not fix.
    Failed { error: String },
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed(_))
    }

    /// Report of a completed cycle.
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            CycleOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Offline-first sync orchestrator.
///
/// Owns the offline queue (pending changes and conflicts) and the status.
/// At most one cycle runs at a time; a trigger that arrives during a cycle is
/// a no-op.
pub struct SyncEngine {
    /// Remote authority.
    gateway: Arc<dyn SyncGateway>,
    /// Local state that pulled changes are written to.
    applier: Arc<dyn ChangeApplier>,
    /// Offline queue, including conflicts waiting for a decision.
    store: Mutex<OfflineStore>,
    resolver: ConflictResolver,
    retry: RetryTracker,
    status: StatusCell,
    /// Held by the running cycle.
    syncing: AtomicBool,
    config: SyncConfig,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(
        store: OfflineStore,
        gateway: Arc<dyn SyncGateway>,
        applier: Arc<dyn ChangeApplier>,
        config: SyncConfig,
    ) -> Self {
        let status = SyncStatus {
            pending_changes: store.len(),
            last_sync_time: store.last_sync_time(),
            conflicts: store.conflicts().len(),
            ..Default::default()
        };

        Self {
            gateway,
            applier,
            store: Mutex::new(store),
            resolver: ConflictResolver::new(config.priority.clone()),
            retry: RetryTracker::new(config.retry_config()),
            status: StatusCell::new(status),
            syncing: AtomicBool::new(false),
            config,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Get the conflict resolver.
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    /// Observe status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Conflicts waiting for a decision, in detection order.
    pub async fn conflicts(&self) -> Vec<Conflict> {
        self.store.lock().await.conflicts().to_vec()
    }

    /// Conflicts with their priority, most urgent first.
    pub async fn ranked_conflicts(&self) -> Vec<(u32, Conflict)> {
        let store = self.store.lock().await;
        self.resolver.rank(store.conflicts())
    }

    /// Copy of the offline queue.
    pub async fn pending_changes(&self) -> Vec<Change> {
        self.store.lock().await.pending().cloned().collect()
    }

    /// Check the offline queue for defects.
    pub async fn validate_queue(&self) -> ValidationReport {
        self.store.lock().await.validate()
    }

    /// Device the offline queue belongs to.
    pub async fn device_id(&self) -> String {
        self.store.lock().await.device_id().to_string()
    }

    /// Record a local mutation in the offline queue.
    pub async fn queue_change(&self, change: NewChange) -> Result<String> {
        let (id, pending) = {
            let mut store = self.store.lock().await;
            let id = store.enqueue(change)?;
            (id, store.len())
        };
        self.status.update(|s| s.pending_changes = pending);
        Ok(id)
    }

    /// Record a connectivity change.
    ///
    /// Going offline drops a pending retry back to `Idle` and forgets earlier
    /// failures. A cycle already in flight is left to finish.
    pub fn set_network_status(&self, network: NetworkStatus) {
        self.status.update(|s| {
            s.network_status = network;
            if network == NetworkStatus::Offline && s.phase == SyncPhase::AwaitingRetry {
                s.enter(SyncPhase::Idle);
                s.retry_attempts = 0;
            }
        });
        if network == NetworkStatus::Offline {
            self.retry.reset();
        }
    }

    /// Run one sync cycle now.
    ///
    /// Never returns an error: failures are reported through the outcome and
    /// `SyncStatus::error`.
    pub async fn sync_now(&self) -> CycleOutcome {
        if self.status.snapshot().network_status == NetworkStatus::Offline {
            debug!("Sync skipped: offline");
            return CycleOutcome::Skipped(SkipReason::Offline);
        }

        let Some(_guard) = SyncGuard::acquire(&self.syncing) else {
            debug!("Sync skipped: a cycle is already running");
            return CycleOutcome::Skipped(SkipReason::AlreadySyncing);
        };

        let started_at = Utc::now();
        let clock = Instant::now();
        self.status.update(|s| s.enter(SyncPhase::Syncing));
        info!("Starting sync cycle");

        let outcome = match self.run_cycle(started_at).await {
            Ok(mut report) => {
                report.duration = clock.elapsed();
                self.finish_success(&report);
                CycleOutcome::Completed(report)
            }
            Err(e) => self.finish_failure(e),
        };

        self.refresh_counts().await;
        outcome
    }

    /// Settle a pending conflict.
    ///
    /// Builds the resolved change, submits it to the gateway and drops the
    /// conflict once acknowledged. Does not start a sync cycle.
    ///
    /// # Errors
    /// - Unknown conflict id
    /// - `Merge` on a conflict that is not update/update
    /// - Gateway failure (the conflict stays pending)
    ///
    /// A failure to apply the resolved change locally after the gateway
    /// accepted it is reported through `SyncStatus::error` only.
    pub async fn resolve_conflict(&self, conflict_id: &str, choice: Resolution) -> Result<Change> {
        let conflict = self
            .store
            .lock()
            .await
            .conflict(conflict_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Conflict not found: {}", conflict_id)))?;

        let resolved = self.resolver.resolve(&conflict, choice)?;

        if let Err(e) = self
            .call(
                "resolve conflict",
                self.gateway.resolve_conflict(conflict_id, choice, &resolved),
            )
            .await
        {
            warn!("Resolving conflict {} failed: {}", conflict_id, e);
            self.status
                .update(|s| s.error = Some(format!("Resolving conflict {} failed: {}", conflict_id, e)));
            return Err(e);
        }

        let remaining = {
            let mut store = self.store.lock().await;
            store.remove_conflict(conflict_id)?;
            store.conflicts().len()
        };
        self.status.update(|s| s.conflicts = remaining);
        info!("Resolved conflict {} on {} with {:?}", conflict_id, conflict.key(), choice);

        // The local side already reflects the local change.
        if choice != Resolution::Local {
            if let Err(e) = self.applier.apply(&resolved) {
                warn!("Applying resolution of conflict {} failed: {}", conflict_id, e);
                self.status.update(|s| {
                    s.error = Some(format!("Failed to apply resolution {}: {}", resolved.id, e))
                });
            }
        }

        Ok(resolved)
    }

    /// Merge the gateway's open conflicts into the pending list.
    /// Returns how many were new.
    pub async fn refresh_conflicts(&self) -> Result<usize> {
        let remote = self
            .call("list conflicts", self.gateway.list_conflicts())
            .await?;
        let open: Vec<Conflict> = remote.into_iter().filter(|c| !c.resolved).collect();
        let added = self.record_conflicts(&[], open).await?;
        self.refresh_counts().await;
        Ok(added)
    }

    /// Ask the gateway to drop conflicts that were already resolved.
    pub async fn cleanup_resolved(&self) -> Result<()> {
        self.call("cleanup resolved", self.gateway.cleanup_resolved())
            .await
    }

    /// Whether the gateway answers its health check in time.
    pub async fn check_health(&self) -> bool {
        let gateway = &self.gateway;
        self.call("health check", async { Ok(gateway.health_check().await) })
            .await
            .unwrap_or(false)
    }

    async fn run_cycle(&self, started_at: DateTime<Utc>) -> Result<SyncReport> {
        let mut report = SyncReport::new(started_at);

        if !self.check_health().await {
            return Err(Error::Network(format!(
                "Sync gateway '{}' is unreachable",
                self.gateway.name()
            )));
        }

        // 1. Collapse the queue and build the batch
        let (batch, since, device_id) = {
            let mut store = self.store.lock().await;
            let dropped = store.compact()?;
            if !dropped.is_empty() {
                debug!("Dropped {} superseded changes", dropped.len());
            }
            report.compacted = dropped.len();

            let mut batch = Vec::new();
            for change in store.pending() {
                if change.is_complete() {
                    batch.push(change.clone());
                } else {
                    warn!(
                        "Leaving malformed change {:?} out of the batch: missing {}",
                        change.id,
                        change.missing_fields().join(", ")
                    );
                    report.skipped_invalid += 1;
                }
            }
            (batch, store.last_sync_time(), store.device_id().to_string())
        };

        // 2. Push
        let outcome = if batch.is_empty() {
            PushOutcome::default()
        } else {
            self.call("push", self.gateway.push_changes(&batch)).await?
        };
        report.pushed = batch.len();
        report.applied = outcome.applied.len();
        report.failed = outcome.failed.len();

        let PushOutcome {
            applied,
            conflicts,
            failed,
        } = outcome;

        for change in &failed {
            warn!(
                "Sync gateway rejected change {} on {}; leaving it queued",
                change.id,
                change.key()
            );
        }

        // 3. Clear applied changes; conflicted ones move into their conflict
        let applied: Vec<String> = applied.into_iter().map(|c| c.id).collect();
        report.conflicts = self.record_conflicts(&applied, conflicts).await?;

        // 4. Pull and apply
        let remote = self.call("pull", self.gateway.pull_changes(since)).await?;
        let blocked: HashSet<EntityKey> = self
            .store
            .lock()
            .await
            .conflicts()
            .iter()
            .filter(|c| !c.resolved)
            .map(Conflict::key)
            .collect();

        for change in remote {
            if change.origin_device == device_id {
                continue;
            }
            if blocked.contains(&change.key()) {
                debug!("Holding back remote change {} on conflicted {}", change.id, change.key());
                report.deferred += 1;
                continue;
            }
            self.applier.apply(&change)?;
            report.pulled += 1;
        }

        // 5. Only now may the pull cursor move
        self.store.lock().await.mark_synced(started_at)?;

        Ok(report)
    }

    fn finish_success(&self, report: &SyncReport) {
        self.retry.reset();
        let rejected = (report.failed > 0)
            .then(|| format!("{} change(s) rejected by the sync gateway", report.failed));

        self.status.update(|s| {
            s.enter(SyncPhase::Idle);
            s.last_sync_time = Some(report.started_at);
            s.error = rejected;
            s.retry_attempts = 0;
        });

        info!(
            "Sync completed in {:?}: {} pushed, {} applied, {} conflicts, {} failed, {} pulled",
            report.duration, report.pushed, report.applied, report.conflicts, report.failed, report.pulled
        );
    }

    fn finish_failure(&self, err: Error) -> CycleOutcome {
        let message = err.to_string();
        let offline = self.status.snapshot().network_status == NetworkStatus::Offline;

        if offline {
            warn!("Sync failed after going offline: {}", message);
            self.retry.reset();
            self.status.update(|s| {
                s.enter(SyncPhase::Idle);
                s.error = Some(message.clone());
                s.retry_attempts = 0;
            });
            return CycleOutcome::Aborted { error: message };
        }

        if !err.is_transient() {
            error!("Sync failed: {}", message);
            self.retry.reset();
            self.status.update(|s| {
                s.enter(SyncPhase::Idle);
                s.error = Some(message.clone());
                s.retry_attempts = 0;
            });
            return CycleOutcome::Failed { error: message };
        }

        let (attempt, decision) = self.retry.record_failure();
        match decision {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    "Sync attempt {} failed: {}. Retrying in {:?}...",
                    attempt, message, delay
                );
                self.status.update(|s| {
                    s.enter(SyncPhase::AwaitingRetry);
                    s.error = Some(message.clone());
                    s.retry_attempts = attempt;
                });
                CycleOutcome::RetryScheduled {
                    attempt,
                    delay,
                    error: message,
                }
            }
            RetryDecision::GiveUp => {
                error!("Sync failed after {} attempts: {}", attempt, message);
                self.status.update(|s| {
                    s.enter(SyncPhase::Idle);
                    s.error = Some(format!("Sync failed after {} attempts: {}", attempt, message));
                    s.retry_attempts = 0;
                });
                CycleOutcome::GaveUp {
                    attempts: attempt,
                    error: message,
                }
            }
        }
    }

    /// Persist a push result: drop `applied` ids, park new conflicts with
    /// their local changes, and auto-resolve if configured. Returns how many
    /// conflicts were new.
    async fn record_conflicts(&self, applied: &[String], incoming: Vec<Conflict>) -> Result<usize> {
        let (added, pending) = {
            let mut store = self.store.lock().await;
            let added = store.acknowledge(applied, incoming)?;
            (added, store.conflicts().len())
        };
        self.status.update(|s| s.conflicts = pending);

        for conflict in &added {
            info!(
                "Conflict {} on {} ({} vs {}, mergeable: {})",
                conflict.id,
                conflict.key(),
                conflict.local_change.kind,
                conflict.remote_change.kind,
                self.resolver.detect(&conflict.local_change, &conflict.remote_change)
            );
        }
        let count = added.len();

        if !self.config.auto_resolve_conflicts {
            return Ok(count);
        }
        let Some(choice) = self.config.conflict_strategy.choice() else {
            return Ok(count);
        };

        for conflict in &added {
            if !self.resolver.validate_choice(conflict, choice) {
                debug!("Conflict {} needs a manual decision", conflict.id);
                continue;
            }
            if let Err(e) = self.resolve_conflict(&conflict.id, choice).await {
                warn!("Auto-resolving conflict {} failed: {}", conflict.id, e);
            }
        }

        Ok(count)
    }

    async fn refresh_counts(&self) {
        let (pending, conflicts) = {
            let store = self.store.lock().await;
            (store.len(), store.conflicts().len())
        };
        self.status.update(|s| {
            s.pending_changes = pending;
            s.conflicts = conflicts;
        });
    }

    /// Run a gateway call under the configured timeout.
    async fn call<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.gateway_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} did not finish within {:?}",
                op, self.config.gateway_timeout
            ))),
        }
    }
}

/// Holds the single-cycle flag and releases it on drop.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
