//! The offline-first mutation queue and its flush engine.
//!
//! Records captured in the field are persisted locally first and pushed to
//! the remote store later. Delivery is at-least-once on top of idempotent
//! remote upserts: a retried mutation lands on the same remote row, never a
//! duplicate. At most one flush runs at a time; overlapping triggers
//! (startup, online transition, timer, manual) coalesce on the flush lock.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::SyncError;
use crate::model::{EntityType, PendingMutation, SkipReason, SyncReport};
use crate::payload::MutationPayload;
use crate::remote::RemoteStore;

pub struct OfflineSyncStore {
    pool: Pool,
    remote: Arc<dyn RemoteStore>,
    cfg: Config,
    online: watch::Receiver<bool>,
    flush_lock: Mutex<()>,
}

impl OfflineSyncStore {
    pub fn new(
        pool: Pool,
        remote: Arc<dyn RemoteStore>,
        cfg: Config,
        online: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            remote,
            cfg,
            online,
            flush_lock: Mutex::new(()),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Persist a captured record locally and queue it for sync. Never touches
    /// the network; safe to call while offline. Returns the stable record id
    /// the remote row will be keyed by.
    #[instrument(skip_all, fields(entity = payload.entity().as_str()))]
    pub async fn save(&self, payload: &MutationPayload) -> Result<String, SyncError> {
        let record_id = Uuid::new_v4().to_string();
        let value = serde_json::to_value(payload)
            .map_err(|e| SyncError::DataFormat {
                source_name: payload.entity().as_str().to_string(),
                reason: format!("payload encode: {}", e),
            })?;
        db::enqueue_mutation(&self.pool, &record_id, payload.entity(), &value).await?;
        info!(record_id, "record queued for sync");
        Ok(record_id)
    }

    /// Count of mutations in {Pending, Failed}, what the UI badge shows.
    pub async fn pending_count(&self) -> Result<i64, SyncError> {
        Ok(db::pending_count(&self.pool).await?)
    }

    /// Mutations that exhausted their retry budget and need manual action.
    pub async fn exhausted(&self) -> Result<Vec<PendingMutation>, SyncError> {
        Ok(db::exhausted_mutations(&self.pool, self.cfg.app.max_attempts).await?)
    }

    /// Requeue mutations left in `syncing` by a killed process. Call once on
    /// startup, before the first flush.
    pub async fn recover_on_start(&self) -> Result<(), SyncError> {
        let requeued = db::requeue_stuck_syncing(&self.pool).await?;
        if requeued > 0 {
            info!(requeued, "requeued mutations left in-flight by previous run");
        }
        Ok(())
    }

    /// Push all due mutations to the remote store.
    ///
    /// No-op when offline or when another flush is already running. Per
    /// entity, mutations go out strictly in creation order so a later edit
    /// never lands before an earlier one; different entities proceed
    /// concurrently up to `app.flush_concurrency`.
    #[instrument(skip_all)]
    pub async fn flush(&self) -> Result<SyncReport, SyncError> {
        if !self.is_online() {
            return Ok(SyncReport::skipped(SkipReason::Offline));
        }
        let Ok(_guard) = self.flush_lock.try_lock() else {
            return Ok(SyncReport::skipped(SkipReason::AlreadyRunning));
        };

        let due = db::due_mutations(&self.pool, self.cfg.app.max_attempts).await?;
        let mut report = SyncReport {
            started_at: Some(chrono::Utc::now()),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        info!(due = due.len(), "flush started");

        let groups = group_by_entity(due);
        let results: Vec<Result<GroupStats, SyncError>> = stream::iter(groups)
            .map(|(_, items)| self.flush_group(items))
            .buffer_unordered(self.cfg.app.flush_concurrency)
            .collect()
            .await;

        for result in results {
            let stats = result?;
            report.attempted += stats.attempted;
            report.succeeded += stats.succeeded;
            report.failed += stats.failed;
        }
        info!(%report, "flush finished");
        Ok(report)
    }

    /// Destructively clear all local state (queue and reference cache).
    /// Waits for any in-flight flush; the remote store is untouched. Callers
    /// are responsible for confirming this with the user first.
    pub async fn reset_local(&self) -> Result<(), SyncError> {
        let _guard = self.flush_lock.lock().await;
        db::reset_local(&self.pool).await?;
        warn!("local state reset: queue and reference cache cleared");
        Ok(())
    }

    async fn flush_group(&self, items: Vec<PendingMutation>) -> Result<GroupStats, SyncError> {
        let mut stats = GroupStats::default();
        for mutation in items {
            stats.attempted += 1;
            db::mark_syncing(&self.pool, mutation.id).await?;
            match self.push_one(&mutation).await {
                Ok(()) => {
                    db::purge_synced(&self.pool, mutation.id).await?;
                    stats.succeeded += 1;
                }
                Err(SyncError::Conflict { record_id }) => {
                    warn!(record_id, "conflicting remote write; holding for manual reconciliation");
                    db::mark_conflict(
                        &self.pool,
                        mutation.id,
                        self.cfg.app.max_attempts,
                        "remote conflict: edited concurrently from another device",
                    )
                    .await?;
                    stats.failed += 1;
                }
                Err(SyncError::DataFormat { reason, .. }) => {
                    // Corrupt local payload; retrying cannot fix it.
                    warn!(record_id = mutation.record_id, reason, "unreadable payload held");
                    db::mark_conflict(&self.pool, mutation.id, self.cfg.app.max_attempts, &reason)
                        .await?;
                    stats.failed += 1;
                }
                Err(SyncError::Network(reason)) => {
                    warn!(
                        record_id = mutation.record_id,
                        attempt = mutation.attempt,
                        reason,
                        "sync attempt failed; backing off"
                    );
                    db::mark_failed(
                        &self.pool,
                        mutation.id,
                        mutation.attempt,
                        self.cfg.app.max_backoff_seconds as i64,
                        &reason,
                    )
                    .await?;
                    stats.failed += 1;
                }
                Err(err @ SyncError::Storage(_)) => return Err(err),
            }
        }
        Ok(stats)
    }

    /// Upload the mutation's attachments, then upsert its row referencing
    /// the final URLs.
    async fn push_one(&self, mutation: &PendingMutation) -> Result<(), SyncError> {
        let mut payload: MutationPayload = serde_json::from_value(mutation.payload.clone())
            .map_err(|e| SyncError::DataFormat {
                source_name: mutation.entity.as_str().to_string(),
                reason: format!("stored payload no longer decodes: {}", e),
            })?;

        let bucket = mutation.entity.bucket(&self.cfg).to_string();
        for foto in payload.attachments_mut() {
            if !foto.is_data_url() {
                continue;
            }
            let Some((bytes, content_type)) = foto.decode_data_url() else {
                // Keep the embedded blob rather than lose the photo.
                warn!(
                    record_id = mutation.record_id,
                    foto = foto.id,
                    "attachment data URL is malformed; sending as-is"
                );
                continue;
            };
            let object_path = format!("{}/{}.{}", mutation.record_id, foto.id, foto.extension());
            let url = self
                .remote
                .upload_attachment(&bucket, &object_path, bytes, &content_type)
                .await?;
            foto.data = url;
        }

        let row = payload.to_remote_row(&mutation.record_id);
        self.remote
            .upsert_record(
                mutation.entity.table(&self.cfg),
                mutation.entity.remote_key(),
                &row,
            )
            .await
    }
}

#[derive(Debug, Default)]
struct GroupStats {
    attempted: usize,
    succeeded: usize,
    failed: usize,
}

/// Partition due mutations by entity, preserving creation order inside each
/// group and first-seen order across groups.
fn group_by_entity(due: Vec<PendingMutation>) -> Vec<(EntityType, Vec<PendingMutation>)> {
    let mut groups: Vec<(EntityType, Vec<PendingMutation>)> = Vec::new();
    for mutation in due {
        match groups.iter_mut().find(|(e, _)| *e == mutation.entity) {
            Some((_, items)) => items.push(mutation),
            None => groups.push((mutation.entity, vec![mutation])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn mutation(id: i64, entity: EntityType) -> PendingMutation {
        PendingMutation {
            id,
            record_id: format!("r-{}", id),
            entity,
            payload: json!({}),
            status: crate::model::SyncStatus::Pending,
            attempt: 0,
            last_error: None,
            created_at: Utc::now(),
            last_attempt_at: None,
            due_at: Utc::now(),
        }
    }

    #[test]
    fn grouping_preserves_order() {
        let due = vec![
            mutation(1, EntityType::Vistoria),
            mutation(2, EntityType::Interdicao),
            mutation(3, EntityType::Vistoria),
            mutation(4, EntityType::Contrato),
            mutation(5, EntityType::Interdicao),
        ];
        let groups = group_by_entity(due);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].0, EntityType::Vistoria);
        assert_eq!(
            groups[0].1.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(
            groups[1].1.iter().map(|m| m.id).collect::<Vec<_>>(),
            vec![2, 5]
        );
        assert_eq!(groups[2].1[0].id, 4);
    }
}
