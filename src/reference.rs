//! Offline reference cache of electrical installations.
//!
//! Rescue teams look up a consumer installation by its number or by holder
//! and address fragments while the network is down. The dataset (~20k rows,
//! re-imported from utility reports) lives in the same SQLite file as the
//! queue and is cleared by a local reset.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use tracing::{info, instrument};

use crate::db::Pool;

const SEARCH_LIMIT: i64 = 50;

/// Source column aliases carrying the installation number, in the order the
/// utility exports have used them.
const NUMBER_KEYS: [&str; 3] = ["installation_number", "numero_instalacao", "instalacao"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Installation {
    pub installation_number: String,
    pub holder: Option<String>,
    pub address: Option<String>,
    pub district: Option<String>,
    /// Full source row, kept verbatim for display.
    pub raw: Value,
}

impl Installation {
    /// Build from a loose imported row; None when no alias column carries an
    /// installation number.
    pub fn from_row(raw: Value) -> Option<Self> {
        let obj = raw.as_object()?;
        let number = NUMBER_KEYS
            .iter()
            .find_map(|k| obj.get(*k))
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())?
            .trim()
            .to_string();
        let text = |k: &str| {
            obj.get(k)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Some(Installation {
            installation_number: number,
            holder: text("holder").or_else(|| text("titular")),
            address: text("address").or_else(|| text("endereco")),
            district: text("district").or_else(|| text("bairro")),
            raw,
        })
    }
}

/// Replace the cached dataset with a fresh import. Rows without an
/// installation number are dropped, matching the PWA importer.
#[instrument(skip_all)]
pub async fn import_installations(pool: &Pool, rows: Vec<Value>) -> Result<usize, sqlx::Error> {
    let mut tx = pool.begin().await?;
    // Clear existing to avoid duplicates on re-import.
    sqlx::query("DELETE FROM installations").execute(&mut *tx).await?;

    let mut imported = 0usize;
    for raw in rows {
        let Some(inst) = Installation::from_row(raw) else {
            continue;
        };
        let raw_text = inst.raw.to_string();
        sqlx::query(
            "INSERT INTO installations (installation_number, holder, address, district, raw) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&inst.installation_number)
        .bind(&inst.holder)
        .bind(&inst.address)
        .bind(&inst.district)
        .bind(raw_text)
        .execute(&mut *tx)
        .await?;
        imported += 1;
    }
    tx.commit().await?;
    info!(imported, "installations dataset imported");
    Ok(imported)
}

/// Exact installation-number hit first; otherwise a capped substring search
/// over number, holder, address and district.
#[instrument(skip_all)]
pub async fn search_installations(
    pool: &Pool,
    query: &str,
) -> Result<Vec<Installation>, sqlx::Error> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let exact = sqlx::query("SELECT raw FROM installations WHERE installation_number = ? LIMIT 1")
        .bind(query)
        .fetch_optional(pool)
        .await?;
    if let Some(row) = exact {
        return Ok(decode_rows(vec![row]));
    }

    let pattern = format!("%{}%", query.to_lowercase());
    let rows = sqlx::query(
        "SELECT raw FROM installations \
         WHERE lower(installation_number) LIKE ?1 \
            OR lower(coalesce(holder, '')) LIKE ?1 \
            OR lower(coalesce(address, '')) LIKE ?1 \
            OR lower(coalesce(district, '')) LIKE ?1 \
         LIMIT ?2",
    )
    .bind(pattern)
    .bind(SEARCH_LIMIT)
    .fetch_all(pool)
    .await?;
    Ok(decode_rows(rows))
}

pub async fn installations_count(pool: &Pool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM installations")
        .fetch_one(pool)
        .await
}

fn decode_rows(rows: Vec<sqlx::sqlite::SqliteRow>) -> Vec<Installation> {
    rows.into_iter()
        .filter_map(|row| {
            let raw: String = row.get("raw");
            serde_json::from_str(&raw).ok().and_then(Installation::from_row)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::SqlitePool;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn import_keeps_only_numbered_rows() {
        let pool = setup_pool().await;
        let imported = import_installations(
            &pool,
            vec![
                json!({ "numero_instalacao": "123456", "titular": "Maria", "bairro": "Centro" }),
                json!({ "instalacao": "789", "endereco": "Rua A, 10" }),
                json!({ "titular": "sem numero" }),
            ],
        )
        .await
        .unwrap();
        assert_eq!(imported, 2);
        assert_eq!(installations_count(&pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reimport_replaces_dataset() {
        let pool = setup_pool().await;
        import_installations(&pool, vec![json!({ "installation_number": "1" })])
            .await
            .unwrap();
        import_installations(&pool, vec![json!({ "installation_number": "2" })])
            .await
            .unwrap();
        assert_eq!(installations_count(&pool).await.unwrap(), 1);
        assert!(search_installations(&pool, "1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exact_match_wins_over_substring() {
        let pool = setup_pool().await;
        import_installations(
            &pool,
            vec![
                json!({ "installation_number": "100" }),
                json!({ "installation_number": "1001" }),
            ],
        )
        .await
        .unwrap();

        let hits = search_installations(&pool, "100").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].installation_number, "100");
    }

    #[tokio::test]
    async fn substring_search_over_text_fields() {
        let pool = setup_pool().await;
        import_installations(
            &pool,
            vec![
                json!({ "numero_instalacao": "555", "titular": "João Pereira", "bairro": "Vila Nova" }),
                json!({ "numero_instalacao": "556", "endereco": "Rua das Flores" }),
            ],
        )
        .await
        .unwrap();

        let hits = search_installations(&pool, "flores").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].installation_number, "556");

        let hits = search_installations(&pool, "vila").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].holder.as_deref(), Some("João Pereira"));

        assert!(search_installations(&pool, "").await.unwrap().is_empty());
    }
}
