use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use sigerd_sync::config;
use sigerd_sync::db;
use sigerd_sync::model::EntityType;
use sigerd_sync::payload::MutationPayload;
use sigerd_sync::reference;
use sigerd_sync::remote::SupabaseClient;
use sigerd_sync::risk::RiskAreaIndex;
use sigerd_sync::sync::OfflineSyncStore;
use sigerd_sync::trigger::{self, Connectivity};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the background sync agent (periodic + online-transition flushes).
    Run,
    /// Show pending and held queue counts.
    Status,
    /// Run one flush pass now.
    Flush,
    /// Queue a record from a payload JSON file, geotagging it against the
    /// configured risk datasets.
    Enqueue {
        #[arg(long, value_parser = parse_entity)]
        entity: EntityType,
        #[arg(long)]
        file: PathBuf,
    },
    /// Query the risk index for one coordinate.
    CheckRisk {
        #[arg(long)]
        lat: f64,
        #[arg(long)]
        lon: f64,
    },
    /// Replace the offline installations cache from a JSON array file.
    ImportInstallations {
        #[arg(long)]
        file: PathBuf,
    },
    /// Destructively clear all local state. Remote data is untouched.
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

fn parse_entity(s: &str) -> Result<EntityType, String> {
    EntityType::parse(s).ok_or_else(|| format!("unknown entity {:?} (vistoria|interdicao|contrato)", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(args.config.as_path()))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/sigerd.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let remote = Arc::new(SupabaseClient::new(
        &cfg.supabase.url,
        cfg.supabase.api_key.clone(),
    )?);
    let connectivity = Connectivity::new(true);
    let store = Arc::new(OfflineSyncStore::new(
        pool.clone(),
        remote,
        cfg.clone(),
        connectivity.subscribe(),
    ));

    match args.command {
        Command::Run => {
            let index = RiskAreaIndex::load_from_files(&cfg.risk_datasets)?;
            info!(
                datasets = ?index.dataset_names(),
                features = index.feature_count(),
                "risk index ready"
            );
            store.recover_on_start().await?;

            let interval = Duration::from_secs(cfg.app.flush_interval_secs);
            let (loop_handle, _flush_handle) =
                trigger::spawn(store.clone(), &connectivity, interval);
            info!("sync agent running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            loop_handle.shutdown().await;
        }
        Command::Status => {
            let pending = store.pending_count().await?;
            let held = store.exhausted().await?;
            println!("pending: {}", pending);
            println!("held (retry budget exhausted): {}", held.len());
            for m in held {
                println!(
                    "  {} {} attempt={} error={}",
                    m.entity.as_str(),
                    m.record_id,
                    m.attempt,
                    m.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Flush => {
            store.recover_on_start().await?;
            let report = store.flush().await?;
            println!("{}", report);
        }
        Command::Enqueue { entity, file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mut payload: MutationPayload = serde_json::from_str(&content)
                .with_context(|| format!("parsing payload from {}", file.display()))?;
            if payload.entity() != entity {
                bail!(
                    "payload is tagged {:?} but --entity is {:?}",
                    payload.entity().as_str(),
                    entity.as_str()
                );
            }

            let index = RiskAreaIndex::load_from_files(&cfg.risk_datasets)?;
            if let Some((lat, lon)) = payload.coordinates() {
                let tag = index.tag(lat, lon);
                if let Some(t) = &tag {
                    println!("risk area: {} ({}) [{}]", t.name, t.risk_level, t.source);
                }
                payload.set_risk_tag(tag);
            }

            let record_id = store.save(&payload).await?;
            println!("queued {} as {}", entity.as_str(), record_id);
            println!("pending: {}", store.pending_count().await?);
        }
        Command::CheckRisk { lat, lon } => {
            let index = RiskAreaIndex::load_from_files(&cfg.risk_datasets)?;
            match index.query(lat, lon) {
                Some(f) => println!(
                    "{} | {} | {} | {}",
                    f.source, f.name, f.risk_level, f.description
                ),
                None => println!("no mapped risk area"),
            }
        }
        Command::ImportInstallations { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let rows: Vec<serde_json::Value> = serde_json::from_str(&content)
                .with_context(|| format!("parsing JSON array from {}", file.display()))?;
            let imported = reference::import_installations(&pool, rows).await?;
            println!(
                "imported {} installations (cache now {})",
                imported,
                reference::installations_count(&pool).await?
            );
        }
        Command::Reset { yes } => {
            if !yes {
                bail!("reset clears the local queue and caches; pass --yes to confirm");
            }
            store.reset_local().await?;
            println!("local state cleared");
        }
    }

    Ok(())
}
