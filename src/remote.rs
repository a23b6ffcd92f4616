//! Remote store contract and its Supabase implementation.
//!
//! The queue only needs two capabilities from the remote: an idempotent
//! row upsert keyed by the stable record id, and a blob upload that returns
//! a retrievable URL. Both sit behind [`RemoteStore`] so tests substitute a
//! recording fake.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use crate::error::SyncError;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upsert one row into `table`. The row JSON carries the stable key
    /// column named in `on_conflict`; retries must not create duplicates.
    async fn upsert_record(
        &self,
        table: &str,
        on_conflict: &str,
        row: &Value,
    ) -> Result<(), SyncError>;

    /// Upload a binary attachment into `bucket` at `object_path`, replacing
    /// any previous object, and return its public URL.
    async fn upload_attachment(
        &self,
        bucket: &str,
        object_path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, SyncError>;
}

#[derive(Clone)]
pub struct SupabaseClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for SupabaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupabaseClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SupabaseClient {
    pub fn new(base_url: &str, api_key: String) -> Result<Self, SyncError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| SyncError::Network(format!("invalid Supabase URL: {}", e)))?;
        Ok(Self::with_base_url(base_url, api_key))
    }

    pub fn with_base_url(base_url: Url, api_key: String) -> Self {
        let http = Client::builder()
            .user_agent("sigerd-sync/0.1")
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            api_key,
        }
    }

    fn join(&self, path: &str) -> Result<Url, SyncError> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::Network(format!("invalid endpoint {}: {}", path, e)))
    }

    pub fn public_url(&self, bucket: &str, object_path: &str) -> String {
        format!(
            "{}storage/v1/object/public/{}/{}",
            self.base_url, bucket, object_path
        )
    }
}

#[async_trait]
impl RemoteStore for SupabaseClient {
    async fn upsert_record(
        &self,
        table: &str,
        on_conflict: &str,
        row: &Value,
    ) -> Result<(), SyncError> {
        let mut url = self.join(&format!("rest/v1/{}", table))?;
        url.query_pairs_mut().append_pair("on_conflict", on_conflict);

        debug!(table, on_conflict, "upserting row");
        let res = self
            .http
            .post(url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("upsert request failed: {}", e)))?;

        let status = res.status();
        if status == StatusCode::CONFLICT {
            let body = res.text().await.unwrap_or_default();
            warn!(table, %status, body, "remote rejected upsert with conflict");
            let record_id = row
                .get(on_conflict)
                .and_then(Value::as_str)
                .unwrap_or("<unknown>")
                .to_string();
            return Err(SyncError::Conflict { record_id });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(table, %status, body, "remote upsert error");
            return Err(SyncError::Network(format!("upsert {}: {}", status, body)));
        }
        Ok(())
    }

    async fn upload_attachment(
        &self,
        bucket: &str,
        object_path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, SyncError> {
        let url = self.join(&format!("storage/v1/object/{}/{}", bucket, object_path))?;

        debug!(bucket, object_path, size = bytes.len(), "uploading attachment");
        let res = self
            .http
            .post(url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", content_type)
            // Overwrite on retry; the object path is derived from stable ids.
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("upload request failed: {}", e)))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(bucket, object_path, %status, body, "attachment upload error");
            return Err(SyncError::Network(format!("upload {}: {}", status, body)));
        }
        Ok(self.public_url(bucket, object_path))
    }
}
