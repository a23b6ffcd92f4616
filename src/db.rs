//! SQLite-backed local durable storage: the mutation outbox queue and the
//! offline reference cache share one database file under `app.data_dir`.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::model::{EntityType, PendingMutation, SyncStatus};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool, sqlx::Error> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // WAL plus full sync: a kill mid-write must never leave a torn mutation row.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(stripped) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), stripped)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn map_mutation(row: &SqliteRow) -> Result<PendingMutation, sqlx::Error> {
    let entity: String = row.get("entity");
    let status: String = row.get("status");
    let payload: String = row.get("payload");
    Ok(PendingMutation {
        id: row.get("id"),
        record_id: row.get("record_id"),
        entity: EntityType::parse(&entity)
            .ok_or_else(|| decode_err(format!("unknown entity type {:?}", entity)))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| decode_err(format!("invalid payload JSON: {}", e)))?,
        status: SyncStatus::parse(&status)
            .ok_or_else(|| decode_err(format!("unknown sync status {:?}", status)))?,
        attempt: row.get("attempt"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        last_attempt_at: row.get("last_attempt_at"),
        due_at: row.get("due_at"),
    })
}

#[instrument(skip_all)]
pub async fn enqueue_mutation(
    pool: &Pool,
    record_id: &str,
    entity: EntityType,
    payload: &serde_json::Value,
) -> Result<i64, sqlx::Error> {
    let payload_text =
        serde_json::to_string(payload).map_err(|e| decode_err(format!("payload encode: {}", e)))?;
    let now = Utc::now();
    let rec = sqlx::query(
        "INSERT INTO mutations (record_id, entity, payload, status, attempt, created_at, due_at) \
         VALUES (?, ?, ?, 'pending', 0, ?, ?) RETURNING id",
    )
    .bind(record_id)
    .bind(entity.as_str())
    .bind(payload_text)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// Queue size as the UI badge sees it: everything not yet confirmed remote,
/// including mutations held after exhausting their retry budget.
#[instrument(skip_all)]
pub async fn pending_count(pool: &Pool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM mutations WHERE status IN ('pending', 'failed')")
        .fetch_one(pool)
        .await
}

/// Mutations eligible for the next flush pass, in creation order.
/// Excludes rows still inside their backoff window and rows past the
/// retry budget.
#[instrument(skip_all)]
pub async fn due_mutations(
    pool: &Pool,
    max_attempts: i32,
) -> Result<Vec<PendingMutation>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, record_id, entity, payload, status, attempt, last_error, created_at, last_attempt_at, due_at \
         FROM mutations \
         WHERE status IN ('pending', 'failed') AND attempt < ? AND datetime(due_at) <= datetime('now') \
         ORDER BY datetime(created_at) ASC, id ASC",
    )
    .bind(max_attempts)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_mutation).collect()
}

#[instrument(skip_all)]
pub async fn mark_syncing(pool: &Pool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE mutations SET status = 'syncing', last_attempt_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Synced is terminal: the local row is purged.
#[instrument(skip_all)]
pub async fn purge_synced(pool: &Pool, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM mutations WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Transient failure: bump the attempt counter and push `due_at` out by
/// 5s * 2^attempt, capped.
#[instrument(skip_all)]
pub async fn mark_failed(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_backoff_secs: i64,
    error: &str,
) -> Result<(), sqlx::Error> {
    let secs = (5_i64) * (1_i64 << attempt.min(10));
    let secs = if max_backoff_secs > 0 {
        secs.min(max_backoff_secs)
    } else {
        secs
    };
    sqlx::query(
        "UPDATE mutations SET status = 'failed', attempt = ?, last_error = ?, \
         due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(error)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// A remote conflict is not transient; pin the attempt counter to the budget
/// so the row is held for manual reconciliation instead of retried.
#[instrument(skip_all)]
pub async fn mark_conflict(
    pool: &Pool,
    id: i64,
    max_attempts: i32,
    error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE mutations SET status = 'failed', attempt = ?, last_error = ? WHERE id = ?")
        .bind(max_attempts)
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mutations past the retry budget, for the actionable user notification.
#[instrument(skip_all)]
pub async fn exhausted_mutations(
    pool: &Pool,
    max_attempts: i32,
) -> Result<Vec<PendingMutation>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, record_id, entity, payload, status, attempt, last_error, created_at, last_attempt_at, due_at \
         FROM mutations \
         WHERE status = 'failed' AND attempt >= ? \
         ORDER BY datetime(created_at) ASC, id ASC",
    )
    .bind(max_attempts)
    .fetch_all(pool)
    .await?;
    rows.iter().map(map_mutation).collect()
}

/// App-start crash recovery: a row left in `syncing` by a killed process
/// goes back to `pending` so the next flush picks it up. The remote upsert
/// is idempotent, so re-sending a possibly-delivered row is safe.
#[instrument(skip_all)]
pub async fn requeue_stuck_syncing(pool: &Pool) -> Result<u64, sqlx::Error> {
    let res = sqlx::query("UPDATE mutations SET status = 'pending' WHERE status = 'syncing'")
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Emergency recovery: clears the queue and the reference cache in one
/// transaction. Never touches the remote store.
#[instrument(skip_all)]
pub async fn reset_local(pool: &Pool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM mutations").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM installations").execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn enqueue_and_count() {
        let pool = setup_pool().await;
        assert_eq!(pending_count(&pool).await.unwrap(), 0);

        enqueue_mutation(&pool, "v-1", EntityType::Vistoria, &json!({"bairro": "Centro"}))
            .await
            .unwrap();
        enqueue_mutation(&pool, "i-1", EntityType::Interdicao, &json!({}))
            .await
            .unwrap();
        assert_eq!(pending_count(&pool).await.unwrap(), 2);

        let due = due_mutations(&pool, 8).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].record_id, "v-1");
        assert_eq!(due[0].entity, EntityType::Vistoria);
        assert_eq!(due[0].status, SyncStatus::Pending);
        assert_eq!(due[0].payload["bairro"], "Centro");
    }

    #[tokio::test]
    async fn duplicate_record_id_rejected() {
        let pool = setup_pool().await;
        enqueue_mutation(&pool, "v-1", EntityType::Vistoria, &json!({}))
            .await
            .unwrap();
        let err = enqueue_mutation(&pool, "v-1", EntityType::Vistoria, &json!({})).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn failed_mutation_backs_off_and_keeps_counting() {
        let pool = setup_pool().await;
        let id = enqueue_mutation(&pool, "v-1", EntityType::Vistoria, &json!({}))
            .await
            .unwrap();

        mark_syncing(&pool, id).await.unwrap();
        // In-flight mutations are excluded from the badge count.
        assert_eq!(pending_count(&pool).await.unwrap(), 0);

        mark_failed(&pool, id, 0, 3600, "connection refused").await.unwrap();
        assert_eq!(pending_count(&pool).await.unwrap(), 1);

        // Inside the backoff window it is not due.
        let due = due_mutations(&pool, 8).await.unwrap();
        assert!(due.is_empty());

        sqlx::query("UPDATE mutations SET due_at = datetime('now', '-1 seconds')")
            .execute(&pool)
            .await
            .unwrap();
        let due = due_mutations(&pool, 8).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt, 1);
        assert_eq!(due[0].last_error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn exhausted_not_due_but_listed() {
        let pool = setup_pool().await;
        let id = enqueue_mutation(&pool, "v-1", EntityType::Vistoria, &json!({}))
            .await
            .unwrap();
        mark_conflict(&pool, id, 8, "409 conflict").await.unwrap();

        assert!(due_mutations(&pool, 8).await.unwrap().is_empty());
        assert_eq!(pending_count(&pool).await.unwrap(), 1);

        let exhausted = exhausted_mutations(&pool, 8).await.unwrap();
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].attempt, 8);
    }

    #[tokio::test]
    async fn stuck_syncing_requeued() {
        let pool = setup_pool().await;
        let id = enqueue_mutation(&pool, "v-1", EntityType::Vistoria, &json!({}))
            .await
            .unwrap();
        mark_syncing(&pool, id).await.unwrap();

        let requeued = requeue_stuck_syncing(&pool).await.unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(due_mutations(&pool, 8).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purge_and_reset() {
        let pool = setup_pool().await;
        let id = enqueue_mutation(&pool, "v-1", EntityType::Vistoria, &json!({}))
            .await
            .unwrap();
        purge_synced(&pool, id).await.unwrap();
        assert_eq!(pending_count(&pool).await.unwrap(), 0);

        enqueue_mutation(&pool, "v-2", EntityType::Vistoria, &json!({}))
            .await
            .unwrap();
        enqueue_mutation(&pool, "c-1", EntityType::Contrato, &json!({}))
            .await
            .unwrap();
        reset_local(&pool).await.unwrap();
        assert_eq!(pending_count(&pool).await.unwrap(), 0);
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://x/y"),
            "postgres://x/y"
        );
        let url = prepare_sqlite_url("sqlite://relative/dir/app.db");
        assert_eq!(url, "sqlite://relative/dir/app.db");
        assert!(std::path::Path::new("relative/dir").exists());
        std::fs::remove_dir_all("relative").ok();
    }
}
