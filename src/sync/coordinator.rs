//! Request-facing sync orchestration
//!
//! Upload processing per action:
//! 1. Record the action under its client id (replays stop here)
//! 2. Claim it, so concurrent resubmissions never process it twice
//! 3. Detect conflicts against the current entity version
//! 4. Apply, or hand the conflict to the resolver
//!
//! Actions are grouped per entity and applied in client timestamp order
//! within a group; groups run concurrently up to the configured limit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use sqlx::SqlitePool;

use super::action::{check_client_id, ActionPayload, GroupKey, ValidatedAction};
use super::action_log::{ActionLog, Recorded};
use super::applier::{write_for, ActionApplier, ApplyOutcome, EntityWrite};
use super::conflict::{ConflictDetector, ConflictLog, Verdict};
use super::delta::DeltaProducer;
use super::resolver::{AutoResolution, ConflictResolver};
use super::state_store::SyncStateStore;
use super::types::{
    ActionResult, ConflictStatus, DownloadQuery, DownloadResponse, ResolveConflictRequest,
    ResolveConflictResponse, StatusResponse, SyncConflict, SyncHealth, UploadAction,
    UploadRequest, UploadResponse,
};
use crate::config::SyncConfig;
use crate::entities::{Actor, EntityStore};
use crate::error::{AppError, SyncError};

/// Detection/apply rounds before a contended action is left for a retry
const MAX_APPLY_ATTEMPTS: usize = 3;

type Indexed<T> = (usize, T);

pub struct SyncCoordinator {
    config: SyncConfig,
    entities: Arc<dyn EntityStore>,
    states: SyncStateStore,
    actions: ActionLog,
    conflicts: ConflictLog,
    detector: ConflictDetector,
    applier: ActionApplier,
    resolver: ConflictResolver,
    delta: DeltaProducer,
}

impl SyncCoordinator {
    pub fn new(pool: SqlitePool, entities: Arc<dyn EntityStore>, config: SyncConfig) -> Self {
        let actions = ActionLog::new(pool.clone());
        let conflicts = ConflictLog::new(pool.clone());
        let applier = ActionApplier::new(pool.clone(), entities.clone());
        let resolver = ConflictResolver::new(
            pool.clone(),
            entities.clone(),
            applier.clone(),
            conflicts.clone(),
            actions.clone(),
        );

        Self {
            config,
            states: SyncStateStore::new(pool),
            delta: DeltaProducer::new(entities.clone()),
            detector: ConflictDetector::new(entities.clone()),
            entities,
            actions,
            conflicts,
            applier,
            resolver,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Process a batch of queued client actions
    ///
    /// Every submitted action gets exactly one result, in submission order.
    /// Only failures that happen before any action is looked at (unknown
    /// device, storage down) fail the request as a whole.
    pub async fn upload(
        &self,
        user_id: &str,
        request: UploadRequest,
    ) -> Result<UploadResponse, SyncError> {
        check_device_id(&request.device_id)?;
        self.states
            .get_or_create(user_id, &request.device_id, request.device_info.as_ref())
            .await?;

        let actor = Actor::new(user_id, &request.device_id);
        let total = request.actions.len();
        let mut results: Vec<Option<ActionResult>> = vec![None; total];
        let mut groups: HashMap<GroupKey, Vec<Indexed<ValidatedAction>>> = HashMap::new();

        for (index, raw) in request.actions.into_iter().enumerate() {
            match self.admit(&actor, raw).await {
                Ok(action) => groups
                    .entry(action.group_key())
                    .or_default()
                    .push((index, action)),
                Err(result) => results[index] = Some(result),
            }
        }

        for group in groups.values_mut() {
            group.sort_by(|(ia, a), (ib, b)| {
                a.client_timestamp.cmp(&b.client_timestamp).then(ia.cmp(ib))
            });
        }

        let processed: Vec<Vec<Indexed<ActionResult>>> = stream::iter(groups.into_values())
            .map(|group| self.process_group(group, &actor))
            .buffer_unordered(self.config.apply_concurrency.max(1))
            .collect()
            .await;

        for (index, result) in processed.into_iter().flatten() {
            results[index] = Some(result);
        }

        let mut results: Vec<ActionResult> = results.into_iter().flatten().collect();
        let conflicts = self.attach_conflicts(&mut results).await;

        if total > 0 {
            self.states
                .update_upload_cursor(user_id, &actor.device_id, Utc::now())
                .await?;
        }

        tracing::info!(
            user_id = %user_id,
            device_id = %actor.device_id,
            actions = total,
            conflicts = conflicts.len(),
            "Processed upload batch"
        );

        Ok(UploadResponse {
            success: true,
            results,
            conflicts,
            sync_timestamp: Utc::now(),
        })
    }

    /// Record one raw action and decide whether it still needs processing
    ///
    /// Returns the final result directly for malformed actions and replays.
    async fn admit(
        &self,
        actor: &Actor,
        raw: serde_json::Value,
    ) -> Result<ValidatedAction, ActionResult> {
        let wire: UploadAction = match serde_json::from_value(raw.clone()) {
            Ok(wire) => wire,
            Err(e) => {
                let client_id = raw
                    .get("client_id")
                    .and_then(|id| id.as_str())
                    .unwrap_or_default();
                return Err(ActionResult::failed(
                    client_id,
                    false,
                    format!("malformed action: {}", e),
                ));
            }
        };

        if let Err(e) = check_client_id(&wire.client_id) {
            return Err(ActionResult::failed(&wire.client_id, false, e.to_string()));
        }

        let recorded = self
            .actions
            .record_pending(&actor.user_id, &actor.device_id, &wire)
            .await
            .map_err(|e| ActionResult::failed(&wire.client_id, e.is_retryable(), e.to_string()))?;

        let stored = recorded.action();
        if stored.user_id != actor.user_id {
            tracing::warn!(
                client_action_id = %wire.client_id,
                "Client id already used by another user"
            );
            return Err(ActionResult::failed(
                &wire.client_id,
                false,
                "client_id already used by another user",
            ));
        }

        if let Recorded::Existing(existing) = &recorded {
            if existing.status.is_settled() {
                tracing::debug!(
                    client_action_id = %existing.client_action_id,
                    status = existing.status.as_str(),
                    "Replaying stored result"
                );
                return Err(ActionResult::from_stored(existing));
            }
        }

        match ValidatedAction::from_stored(stored) {
            Ok(action) => Ok(action),
            Err(e) => {
                let message = e.to_string();
                if let Err(e) = self
                    .actions
                    .mark_failed(&stored.client_action_id, false, &message)
                    .await
                {
                    tracing::error!(
                        client_action_id = %stored.client_action_id,
                        "Failed to record validation failure: {}",
                        e
                    );
                }
                Err(ActionResult::failed(&stored.client_action_id, false, message))
            }
        }
    }

    async fn process_group(
        &self,
        group: Vec<Indexed<ValidatedAction>>,
        actor: &Actor,
    ) -> Vec<Indexed<ActionResult>> {
        let mut results = Vec::with_capacity(group.len());
        for (index, action) in group {
            results.push((index, self.process(&action, actor).await));
        }
        results
    }

    /// Claim, execute and report one action; never fails the batch
    async fn process(&self, action: &ValidatedAction, actor: &Actor) -> ActionResult {
        let id = action.client_action_id.as_str();
        let lease = Duration::seconds(self.config.applying_lease_secs);

        match self.actions.claim(id, lease).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(client_action_id = %id, "Action claimed elsewhere");
                return self.stored_result(id).await;
            }
            Err(e) => return ActionResult::failed(id, true, e.to_string()),
        }

        if let Err(e) = self.execute(action, actor).await {
            if e.is_retryable() {
                self.fail_transient(id, &e.to_string()).await;
            } else {
                tracing::warn!(client_action_id = %id, "Action failed: {}", e);
                if let Err(log_err) = self.actions.mark_failed(id, false, &e.to_string()).await {
                    tracing::error!(client_action_id = %id, "Failed to record failure: {}", log_err);
                }
            }
        }

        self.stored_result(id).await
    }

    async fn execute(&self, action: &ValidatedAction, actor: &Actor) -> Result<(), SyncError> {
        for attempt in 1..=MAX_APPLY_ATTEMPTS {
            if self.execute_once(action, actor).await? {
                return Ok(());
            }
            tracing::debug!(
                client_action_id = %action.client_action_id,
                attempt,
                "Entity moved during apply, detecting again"
            );
        }

        Err(SyncError::Contention(format!(
            "{} kept changing; retry later",
            action.entity_type
        )))
    }

    /// One detection and apply round; `false` when a concurrent write won
    async fn execute_once(&self, action: &ValidatedAction, actor: &Actor) -> Result<bool, SyncError> {
        let message = format!("{} applied", action.action_type.as_str());

        let (entity_id, base_version) = match &action.payload {
            ActionPayload::Create(patch) => {
                let fields = patch.clone().into_fields()?;
                let outcome = self
                    .applier
                    .apply(
                        &action.client_action_id,
                        action.entity_type,
                        actor,
                        EntityWrite::Create(fields),
                        None,
                        &message,
                    )
                    .await?;
                return Ok(settled(&outcome));
            }
            ActionPayload::Update {
                entity_id,
                base_version,
                ..
            }
            | ActionPayload::UpdateStatus {
                entity_id,
                base_version,
                ..
            }
            | ActionPayload::Delete {
                entity_id,
                base_version,
            } => (*entity_id, *base_version),
        };

        let current = self
            .entities
            .fetch(action.entity_type, entity_id)
            .await?
            .ok_or_else(|| {
                SyncError::Rejected(format!("{} {} not found", action.entity_type, entity_id))
            })?;

        if current.deleted && matches!(action.payload, ActionPayload::Delete { .. }) {
            let outcome = self
                .applier
                .apply(
                    &action.client_action_id,
                    action.entity_type,
                    actor,
                    EntityWrite::Noop(current),
                    None,
                    "already deleted",
                )
                .await?;
            return Ok(settled(&outcome));
        }

        match self.detector.check(base_version, &current, actor).await? {
            Verdict::Current | Verdict::OwnChange => {
                if current.deleted {
                    return Err(SyncError::Rejected(format!(
                        "{} {} has been deleted",
                        action.entity_type, entity_id
                    )));
                }
                let write = write_for(action, &current)?;
                let outcome = self
                    .applier
                    .apply(
                        &action.client_action_id,
                        action.entity_type,
                        actor,
                        write,
                        None,
                        &message,
                    )
                    .await?;
                Ok(settled(&outcome))
            }
            Verdict::Conflict => {
                let strategy = self.config.strategy_for(action.entity_type);
                let policy = self.config.merge_policy_for(action.entity_type);
                let resolution = self
                    .resolver
                    .resolve(action, actor, &current, strategy, &policy)
                    .await?;
                Ok(!matches!(resolution, AutoResolution::VersionMoved))
            }
        }
    }

    /// Count a transient failure, escalating once retries are used up
    async fn fail_transient(&self, client_action_id: &str, message: &str) {
        let retries = match self.actions.increment_retry(client_action_id).await {
            Ok(retries) => retries,
            Err(e) => {
                tracing::error!(client_action_id = %client_action_id, "Failed to count retry: {}", e);
                0
            }
        };

        let outcome = if retries > self.config.max_retries {
            tracing::error!(
                client_action_id = %client_action_id,
                retries,
                "Retries exhausted, action needs manual intervention"
            );
            self.actions
                .mark_failed(
                    client_action_id,
                    false,
                    &format!("{} (gave up after {} attempts)", message, retries),
                )
                .await
        } else {
            tracing::warn!(
                client_action_id = %client_action_id,
                retries,
                "Transient failure: {}",
                message
            );
            self.actions.mark_failed(client_action_id, true, message).await
        };

        if let Err(e) = outcome {
            tracing::error!(client_action_id = %client_action_id, "Failed to record failure: {}", e);
        }
    }

    async fn stored_result(&self, client_action_id: &str) -> ActionResult {
        match self.actions.get(client_action_id).await {
            Ok(Some(stored)) => ActionResult::from_stored(&stored),
            Ok(None) => ActionResult::failed(client_action_id, true, "action was not recorded"),
            Err(e) => ActionResult::failed(client_action_id, true, e.to_string()),
        }
    }

    /// Load the conflicts the results refer to and note their resolution
    async fn attach_conflicts(&self, results: &mut [ActionResult]) -> Vec<SyncConflict> {
        let mut seen = HashSet::new();
        let mut conflicts = Vec::new();

        for result in results.iter_mut() {
            let Some(conflict_id) = result.conflict_id.clone() else {
                continue;
            };

            match self.conflicts.get(&conflict_id).await {
                Ok(Some(conflict)) => {
                    if conflict.status == ConflictStatus::Resolved {
                        result.resolution = Some(conflict.resolution_strategy);
                    }
                    if seen.insert(conflict_id) {
                        conflicts.push(conflict);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(conflict_id = %conflict_id, "Failed to load conflict: {}", e);
                }
            }
        }

        conflicts
    }

    /// Serve one page of changes visible to the caller
    pub async fn download(
        &self,
        user_id: &str,
        query: DownloadQuery,
    ) -> Result<DownloadResponse, SyncError> {
        check_device_id(&query.device_id)?;
        self.states.get_or_create(user_id, &query.device_id, None).await?;

        let page_size = self.config.page_size(query.page_size);
        let page = self
            .delta
            .query(user_id, query.since, query.cursor.as_deref(), page_size)
            .await?;

        // The device is only caught up once the last page is served
        if !page.has_more {
            self.states
                .update_download_cursor(user_id, &query.device_id, Utc::now())
                .await?;
        }

        Ok(DownloadResponse {
            success: true,
            data: page.entities,
            // Never later than what the caller has actually seen
            sync_timestamp: page.high_water.or(query.since).unwrap_or_default(),
            has_more: page.has_more,
            next_cursor: page.next_cursor,
        })
    }

    pub async fn status(&self, user_id: &str, device_id: &str) -> Result<StatusResponse, SyncError> {
        check_device_id(device_id)?;
        let state = self.states.get_or_create(user_id, device_id, None).await?;
        let pending_uploads = self.actions.pending_count(user_id, device_id).await?;
        let conflicts = self.conflicts.count_unresolved(user_id).await?;

        let last_sync = state.last_sync();
        let sync_health = sync_health(
            last_sync,
            conflicts,
            Duration::hours(self.config.stale_after_hours),
            Utc::now(),
        );

        Ok(StatusResponse {
            device_id: state.device_id,
            last_sync,
            last_upload: state.last_upload_at,
            last_download: state.last_download_at,
            pending_uploads,
            conflicts,
            sync_health,
        })
    }

    pub async fn list_conflicts(&self, user_id: &str) -> Result<Vec<SyncConflict>, SyncError> {
        self.conflicts.list_unresolved(user_id).await
    }

    pub async fn get_conflict(&self, conflict_id: &str) -> Result<SyncConflict, AppError> {
        self.conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Conflict {} not found", conflict_id)))
    }

    /// Manual resolution entry point for reviewers
    pub async fn resolve_conflict(
        &self,
        reviewer_id: &str,
        request: ResolveConflictRequest,
    ) -> Result<ResolveConflictResponse, AppError> {
        let conflict = self.get_conflict(&request.conflict_id).await?;
        let policy = self.config.merge_policy_for(conflict.entity_type);

        let (conflict, entity) = self
            .resolver
            .resolve_manual(
                &request.conflict_id,
                request.resolution_strategy,
                request.resolved_payload.as_ref(),
                reviewer_id,
                &policy,
            )
            .await?;

        Ok(ResolveConflictResponse {
            success: true,
            conflict,
            entity: entity.to_wire(),
        })
    }
}

fn settled(outcome: &ApplyOutcome) -> bool {
    !matches!(outcome, ApplyOutcome::VersionMoved { .. })
}

fn check_device_id(device_id: &str) -> Result<(), SyncError> {
    if device_id.trim().is_empty() {
        return Err(SyncError::Validation("device_id must not be empty".to_string()));
    }
    Ok(())
}

/// Informational health of a device's sync state
pub fn sync_health(
    last_sync: Option<DateTime<Utc>>,
    unresolved_conflicts: i64,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> SyncHealth {
    if unresolved_conflicts > 0 {
        return SyncHealth::NeedsAttention;
    }
    match last_sync {
        None => SyncHealth::NeverSynced,
        Some(at) if now - at > stale_after => SyncHealth::Stale,
        Some(_) => SyncHealth::Good,
    }
}
