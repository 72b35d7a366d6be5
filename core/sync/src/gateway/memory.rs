//! In-memory sync gateway for testing and local tooling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use wayfarer_common::{EntityKey, Error, Result};

use super::{PushOutcome, SyncGateway};
use crate::change::{Change, ChangeKind};
use crate::conflict::{Conflict, ConflictResolver, Resolution};

#[derive(Default)]
struct Authority {
    /// Latest accepted change per entity.
    entities: HashMap<EntityKey, Change>,
    /// Accepted changes with the time the authority received them.
    log: Vec<(DateTime<Utc>, Change)>,
    conflicts: Vec<Conflict>,
    rejected_types: HashSet<String>,
}

impl Authority {
    fn accept(&mut self, change: Change) {
        self.entities.insert(change.key(), change.clone());
        self.log.push((Utc::now(), change));
    }
}

/// Call counts per gateway operation.
#[derive(Debug, Default)]
struct Calls {
    push: AtomicUsize,
    pull: AtomicUsize,
    resolve: AtomicUsize,
    list: AtomicUsize,
    cleanup: AtomicUsize,
    health: AtomicUsize,
}

/// In-memory remote authority.
///
/// Accepts changes last-writer-wins per entity. A pushed change whose
/// entity was last written by another device at a later time is reported
/// as a conflict instead. Entity types can be marked as rejected, and
/// outages can be injected, to exercise the engine's failure paths.
#[derive(Default)]
pub struct MemoryGateway {
    authority: Mutex<Authority>,
    resolver: ConflictResolver,
    calls: Calls,
    failing_pushes: AtomicU32,
    failing_pulls: AtomicU32,
    unreachable: AtomicBool,
}

impl MemoryGateway {
    /// Create an empty, reachable gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change as if another device had pushed it.
    pub fn seed_remote(&self, change: Change) {
        if let Ok(mut authority) = self.authority.lock() {
            authority.accept(change);
        }
    }

    /// Permanently reject pushes for an entity type.
    pub fn reject_entity_type(&self, entity_type: impl Into<String>) {
        if let Ok(mut authority) = self.authority.lock() {
            authority.rejected_types.insert(entity_type.into());
        }
    }

    /// Make the next `count` pushes fail with a network error.
    pub fn fail_pushes(&self, count: u32) {
        self.failing_pushes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` pulls fail with a network error.
    pub fn fail_pulls(&self, count: u32) {
        self.failing_pulls.store(count, Ordering::SeqCst);
    }

    /// Simulate the authority going away (or coming back).
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Latest accepted change for an entity.
    pub fn entity(&self, key: &EntityKey) -> Option<Change> {
        self.authority.lock().ok()?.entities.get(key).cloned()
    }

    /// Every accepted change, in order of receipt.
    pub fn accepted(&self) -> Vec<Change> {
        self.authority
            .lock()
            .map(|a| a.log.iter().map(|(_, c)| c.clone()).collect())
            .unwrap_or_default()
    }

    pub fn push_calls(&self) -> usize {
        self.calls.push.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.calls.pull.load(Ordering::SeqCst)
    }

    pub fn resolve_calls(&self) -> usize {
        self.calls.resolve.load(Ordering::SeqCst)
    }

    pub fn health_calls(&self) -> usize {
        self.calls.health.load(Ordering::SeqCst)
    }

    /// Whether `incoming` collides with the entity's latest accepted change.
    /// Only a later write from another device can collide. Two updates go
    /// through the resolver; any pairing involving a create or delete always
    /// collides.
    fn collides(&self, incoming: &Change, current: &Change) -> bool {
        if current.origin_device == incoming.origin_device || current.timestamp <= incoming.timestamp {
            return false;
        }
        match (incoming.kind, current.kind) {
            (ChangeKind::Update, ChangeKind::Update) => self.resolver.detect(incoming, current),
            _ => true,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Authority>> {
        self.authority
            .lock()
            .map_err(|_| Error::Gateway("Authority state lock poisoned".to_string()))
    }

    fn check_reachable(&self, op: &str) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("{}: authority unreachable", op)));
        }
        Ok(())
    }

    fn take_failure(counter: &AtomicU32, op: &str) -> Result<()> {
        let injected = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Network(format!("{}: connection reset", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncGateway for MemoryGateway {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push_changes(&self, batch: &[Change]) -> Result<PushOutcome> {
        self.calls.push.fetch_add(1, Ordering::SeqCst);
        self.check_reachable("push")?;
        Self::take_failure(&self.failing_pushes, "push")?;

        let mut authority = self.lock()?;
        let mut outcome = PushOutcome::default();

        for change in batch {
            if authority.rejected_types.contains(&change.entity_type) {
                outcome.failed.push(change.clone());
                continue;
            }

            let newer_elsewhere = authority
                .entities
                .get(&change.key())
                .filter(|current| self.collides(change, current))
                .cloned();

            if let Some(current) = newer_elsewhere {
                let conflict = Conflict::new(change.clone(), current);
                authority.conflicts.push(conflict.clone());
                outcome.conflicts.push(conflict);
            } else {
                authority.accept(change.clone());
                outcome.applied.push(change.clone());
            }
        }

        debug!(
            "Push of {} changes: {} applied, {} conflicts, {} failed",
            batch.len(),
            outcome.applied.len(),
            outcome.conflicts.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }

    async fn pull_changes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Change>> {
        self.calls.pull.fetch_add(1, Ordering::SeqCst);
        self.check_reachable("pull")?;
        Self::take_failure(&self.failing_pulls, "pull")?;

        let authority = self.lock()?;
        Ok(authority
            .log
            .iter()
            .filter(|(received, _)| since.map_or(true, |since| *received > since))
            .map(|(_, change)| change.clone())
            .collect())
    }

    async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        resolved: &Change,
    ) -> Result<()> {
        self.calls.resolve.fetch_add(1, Ordering::SeqCst);
        self.check_reachable("resolve")?;

        let mut authority = self.lock()?;
        let conflict = authority
            .conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id && !c.resolved)
            .ok_or_else(|| Error::NotFound(format!("Open conflict not found: {}", conflict_id)))?;

        conflict.resolved = true;
        conflict.resolution = Some(resolution);

        if resolution != Resolution::Remote {
            authority.accept(resolved.clone());
        }
        Ok(())
    }

    async fn list_conflicts(&self) -> Result<Vec<Conflict>> {
        self.calls.list.fetch_add(1, Ordering::SeqCst);
        self.check_reachable("list conflicts")?;

        let authority = self.lock()?;
        Ok(authority
            .conflicts
            .iter()
            .filter(|c| !c.resolved)
            .cloned()
            .collect())
    }

    async fn cleanup_resolved(&self) -> Result<()> {
        self.calls.cleanup.fetch_add(1, Ordering::SeqCst);
        self.check_reachable("cleanup")?;

        let mut authority = self.lock()?;
        authority.conflicts.retain(|c| !c.resolved);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.calls.health.fetch_add(1, Ordering::SeqCst);
        !self.unreachable.load(Ordering::SeqCst)
    }
}
