//! Configuration loader and validator for the SIGERD field-sync agent.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub supabase: Supabase,
    #[serde(default)]
    pub risk_datasets: Vec<RiskDatasetRef>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_flush_concurrency")]
    pub flush_concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_seconds: u64,
}

/// Remote store endpoint and per-entity table/bucket mappings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Supabase {
    pub url: String,
    pub api_key: String,
    pub tables: EntityNames,
    pub buckets: EntityNames,
}

/// Remote names for each of the three synced entities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityNames {
    pub vistorias: String,
    pub interdicoes: String,
    pub contratos: String,
}

/// One static risk-area dataset. List order in the config is the query
/// priority order (municipal surveys are listed before federal ones).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskDatasetRef {
    pub name: String,
    pub path: String,
}

fn default_flush_interval_secs() -> u64 {
    300
}

fn default_flush_concurrency() -> usize {
    4
}

fn default_max_attempts() -> i32 {
    8
}

fn default_max_backoff_seconds() -> u64 {
    3600
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.flush_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.flush_interval_secs must be > 0"));
    }
    if cfg.app.flush_concurrency == 0 {
        return Err(ConfigError::Invalid("app.flush_concurrency must be > 0"));
    }
    if cfg.app.max_attempts <= 0 {
        return Err(ConfigError::Invalid("app.max_attempts must be > 0"));
    }

    if cfg.supabase.url.trim().is_empty() {
        return Err(ConfigError::Invalid("supabase.url must be non-empty"));
    }
    if cfg.supabase.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("supabase.api_key must be non-empty"));
    }

    let t = &cfg.supabase.tables;
    if t.vistorias.trim().is_empty()
        || t.interdicoes.trim().is_empty()
        || t.contratos.trim().is_empty()
    {
        return Err(ConfigError::Invalid(
            "supabase.tables entries must be non-empty",
        ));
    }
    let b = &cfg.supabase.buckets;
    if b.vistorias.trim().is_empty()
        || b.interdicoes.trim().is_empty()
        || b.contratos.trim().is_empty()
    {
        return Err(ConfigError::Invalid(
            "supabase.buckets entries must be non-empty",
        ));
    }

    for ds in &cfg.risk_datasets {
        if ds.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "risk_datasets[].name must be non-empty",
            ));
        }
        if ds.path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "risk_datasets[].path must be non-empty",
            ));
        }
    }

    Ok(())
}

/// Example YAML document, kept in sync with the schema above.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  flush_interval_secs: 300
  flush_concurrency: 4
  max_attempts: 8
  max_backoff_seconds: 3600

supabase:
  url: "https://YOUR_PROJECT.supabase.co"
  api_key: "YOUR_SUPABASE_ANON_KEY"
  tables:
    vistorias: "vistorias"
    interdicoes: "interdicoes"
    contratos: "emergency_contracts"
  buckets:
    vistorias: "vistorias"
    interdicoes: "interdicoes"
    contratos: "contratos"

risk_datasets:
  - name: "SEDURB (Municipal)"
    path: "./data/risk_sedurb.json"
  - name: "CPRM (Federal)"
    path: "./data/risk_cprm.json"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.flush_interval_secs, 300);
        assert_eq!(cfg.risk_datasets[0].name, "SEDURB (Municipal)");
    }

    #[test]
    fn defaults_applied_when_omitted() {
        let cfg: Config = serde_yaml::from_str(
            r#"app:
  data_dir: "./data"
supabase:
  url: "https://x.supabase.co"
  api_key: "key"
  tables: { vistorias: "v", interdicoes: "i", contratos: "c" }
  buckets: { vistorias: "v", interdicoes: "i", contratos: "c" }
"#,
        )
        .unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.flush_interval_secs, 300);
        assert_eq!(cfg.app.flush_concurrency, 4);
        assert_eq!(cfg.app.max_attempts, 8);
        assert!(cfg.risk_datasets.is_empty());
    }

    #[test]
    fn invalid_api_key() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.supabase.api_key = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("api_key")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_table_and_bucket_names() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.supabase.tables.interdicoes = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.supabase.buckets.vistorias = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_dataset_entries() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.risk_datasets[0].path = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("risk_datasets")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn zero_flush_interval_rejected() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.flush_interval_secs = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        let mut f = fs::File::create(&p).unwrap();
        f.write_all(example().as_bytes()).unwrap();
        let cfg = load(Some(p.as_path())).unwrap();
        assert_eq!(cfg.supabase.tables.contratos, "emergency_contracts");
    }
}
