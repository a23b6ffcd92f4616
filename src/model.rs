use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{Config, EntityNames};

/// The three record kinds captured in the field and synced to the remote.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityType {
    Vistoria,
    Interdicao,
    Contrato,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Vistoria => "vistoria",
            EntityType::Interdicao => "interdicao",
            EntityType::Contrato => "contrato",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vistoria" => Some(EntityType::Vistoria),
            "interdicao" => Some(EntityType::Interdicao),
            "contrato" => Some(EntityType::Contrato),
            _ => None,
        }
    }

    /// Column name of the stable upsert key in the remote table.
    pub fn remote_key(&self) -> &'static str {
        match self {
            EntityType::Vistoria => "vistoria_id",
            EntityType::Interdicao => "interdicao_id",
            EntityType::Contrato => "contrato_id",
        }
    }

    fn pick<'a>(&self, names: &'a EntityNames) -> &'a str {
        match self {
            EntityType::Vistoria => &names.vistorias,
            EntityType::Interdicao => &names.interdicoes,
            EntityType::Contrato => &names.contratos,
        }
    }

    pub fn table<'a>(&self, cfg: &'a Config) -> &'a str {
        self.pick(&cfg.supabase.tables)
    }

    pub fn bucket<'a>(&self, cfg: &'a Config) -> &'a str {
        self.pick(&cfg.supabase.buckets)
    }
}

/// Lifecycle of one queued mutation. `Synced` is terminal and the row is
/// purged, so it never appears in query results; it exists for completeness
/// of the transition log messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "syncing" => Some(SyncStatus::Syncing),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// One locally captured record waiting for (or exhausted from) remote sync.
/// Owned exclusively by the queue; UI layers only see counts and summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: i64,
    /// Stable across retries; doubles as the remote upsert key.
    pub record_id: String,
    pub entity: EntityType,
    pub payload: serde_json::Value,
    pub status: SyncStatus,
    pub attempt: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub due_at: DateTime<Utc>,
}

/// Outcome summary of a single flush pass. Ephemeral; built fresh on every
/// `flush()` call and handed to the caller for display.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub started_at: Option<DateTime<Utc>>,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: Option<SkipReason>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
}

impl SyncReport {
    pub fn skipped(reason: SkipReason) -> Self {
        SyncReport {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.skipped {
            Some(SkipReason::Offline) => write!(f, "sync skipped: device offline"),
            Some(SkipReason::AlreadyRunning) => write!(f, "sync skipped: already in progress"),
            None => write!(
                f,
                "sync finished: {} attempted, {} succeeded, {} failed",
                self.attempted, self.succeeded, self.failed
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_round_trip() {
        for e in [
            EntityType::Vistoria,
            EntityType::Interdicao,
            EntityType::Contrato,
        ] {
            assert_eq!(EntityType::parse(e.as_str()), Some(e));
        }
        assert_eq!(EntityType::parse("ocorrencia"), None);
    }

    #[test]
    fn status_round_trip() {
        for s in [
            SyncStatus::Pending,
            SyncStatus::Syncing,
            SyncStatus::Synced,
            SyncStatus::Failed,
        ] {
            assert_eq!(SyncStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn report_display() {
        let r = SyncReport {
            attempted: 3,
            succeeded: 2,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(r.to_string(), "sync finished: 3 attempted, 2 succeeded, 1 failed");
        assert_eq!(
            SyncReport::skipped(SkipReason::Offline).to_string(),
            "sync skipped: device offline"
        );
    }
}
