use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use release_registry::audit::{self, AuditSink};
use release_registry::config::ReleaseConfig;
use release_registry::db::Database;
use release_registry::pipeline::StateMachine;
use release_registry::registry::{spawn_scheduled_sync, FileRegistryStore, RegistrySync};
use release_registry::service::{Collaborators, ReleaseService};
use release_registry::{api, rollout};

#[derive(Parser)]
#[command(name = "relreg")]
#[command(about = "Release pipeline and public registry for versioned game builds")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API
    Serve {
        /// Port for HTTP API
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
    /// Rebuild the public registry from the database once
    Sync,
    /// Delete audit entries older than the retention window
    PurgeAudit,
    /// Print the persisted registry, optionally as one consumer sees it
    ShowRegistry {
        /// Apply rollout filtering for this consumer id
        #[arg(long)]
        consumer: Option<String>,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "release_registry=debug,tower_http=debug".into()),
    );

    // stdout is reserved for command output
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn open_database(config: &ReleaseConfig) -> anyhow::Result<Database> {
    let db = Database::open(config.database_path()?)?;
    db.migrate()?;
    Ok(db)
}

fn open_registry(db: &Database, config: &ReleaseConfig) -> anyhow::Result<RegistrySync> {
    let store = Arc::new(FileRegistryStore::new(config.snapshot_path()?));
    Ok(RegistrySync::new(db.clone(), store, config))
}

async fn serve(config: ReleaseConfig, port: u16) -> anyhow::Result<()> {
    tracing::info!("Starting release registry on port {}", port);

    let db = open_database(&config)?;
    let registry = Arc::new(open_registry(&db, &config)?);
    let (audit, _audit_worker) = AuditSink::spawn(db.clone(), config.audit_retention);
    let _scheduled_sync = spawn_scheduled_sync(Arc::clone(&registry), config.sync_interval);

    let service = ReleaseService::new(
        db,
        StateMachine::standard(),
        registry,
        audit,
        Collaborators::from_config(&config),
        &config,
    );
    let app = api::create_router(Arc::new(service));

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Release registry listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = ReleaseConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: 3000 }) {
        Commands::Serve { port } => serve(config, port).await?,
        Commands::Sync => {
            let db = open_database(&config)?;
            let snapshot = open_registry(&db, &config)?.sync()?;
            println!("Registry synced: {} entries", snapshot.entries.len());
        }
        Commands::PurgeAudit => {
            let db = open_database(&config)?;
            let removed = audit::purge_expired(&db, config.audit_retention)?;
            println!("Purged {} audit entries", removed);
        }
        Commands::ShowRegistry { consumer } => {
            let db = open_database(&config)?;
            let snapshot = open_registry(&db, &config)?.snapshot();
            match consumer {
                Some(consumer_id) => {
                    let visible = rollout::get_for_consumer(&snapshot, &consumer_id);
                    println!("{}", serde_json::to_string_pretty(&visible)?);
                }
                None => println!("{}", serde_json::to_string_pretty(&snapshot)?),
            }
        }
    }

    Ok(())
}
