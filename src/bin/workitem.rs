//! workitem CLI: operator interface to the workitem stores.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use uuid::Uuid;

use workitem_rs::codec::{self, APPLICATION_JSON};
use workitem_rs::config::Config;
use workitem_rs::db::Db;
use workitem_rs::engine::{WorkitemOrchestrator, WorkitemService};
use workitem_rs::model::{WorkitemDocument, WorkitemState};
use workitem_rs::query_tags::QueryTagService;
use workitem_rs::response::{BaseUrlResolver, Outcome};
use workitem_rs::store::{FsBlobStore, QueryTagSource, TomlQueryTagSource};
use workitem_rs::telemetry::{TelemetryConfig, init_telemetry};
use workitem_rs::versioning::IndexOperation;

#[derive(Parser)]
#[command(name = "workitem", about = "Manage UPS workitems")]
struct Cli {
    /// Data partition to operate on
    #[arg(long, global = true, default_value_t = 1)]
    partition: i32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations
    Migrate,
    /// Show the deployed schema version and the operations resolved for it
    Schema,
    /// List the indexed query tags
    Tags,
    /// Create workitems from a JSON file (an array of documents)
    Add {
        file: PathBuf,
        #[arg(long, default_value = APPLICATION_JSON)]
        content_type: String,
    },
    /// Print a workitem document
    Show { uid: String },
    /// Update a workitem's attributes from a JSON file holding one document
    Update {
        uid: String,
        file: PathBuf,
        /// Required while the workitem is in progress
        #[arg(long)]
        transaction_uid: Option<String>,
    },
    /// Cancel a workitem
    Cancel {
        uid: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Claim, complete or cancel an in-progress workitem
    State {
        uid: String,
        /// Target state: in-progress, completed or canceled
        target: String,
        /// Generated when claiming without one
        #[arg(long)]
        transaction_uid: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workitem".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    let partition = cli.partition;

    match cli.command {
        Command::Migrate => {
            db.migrate().await?;
            println!("migrations applied");
            Ok(())
        }
        Command::Schema => cmd_schema(&db).await,
        Command::Tags => cmd_tags(&db, &config).await,
        Command::Add { file, content_type } => {
            let service = build_service(&db, &config).await?;
            cmd_add(&service, partition, file, &content_type).await
        }
        Command::Show { uid } => {
            let service = build_service(&db, &config).await?;
            let document = service.retrieve(partition, &uid).await?;
            println!("{}", serde_json::to_string_pretty(&document)?);
            Ok(())
        }
        Command::Update {
            uid,
            file,
            transaction_uid,
        } => {
            let service = build_service(&db, &config).await?;
            let body = tokio::fs::read(&file).await?;
            let document = codec::from_slice(&body)?;
            let outcome = service
                .process_update(partition, document, &uid, transaction_uid.as_deref())
                .await?;
            print_outcome(&outcome)
        }
        Command::Cancel { uid, reason } => {
            let service = build_service(&db, &config).await?;
            let outcome = service
                .process_cancel(partition, &uid, reason.as_deref())
                .await?;
            print_outcome(&outcome)
        }
        Command::State {
            uid,
            target,
            transaction_uid,
        } => {
            let target: WorkitemState = target.replace('-', "_").parse()?;
            let transaction_uid = match transaction_uid {
                Some(uid) => uid,
                None if target == WorkitemState::InProgress => {
                    let generated = new_transaction_uid();
                    println!("transaction UID: {generated}");
                    generated
                }
                None => anyhow::bail!("--transaction-uid is required for {target}"),
            };
            let service = build_service(&db, &config).await?;
            let outcome = service
                .process_change_state(partition, &uid, &transaction_uid, target)
                .await?;
            print_outcome(&outcome)
        }
    }
}

async fn build_service(db: &Db, config: &Config) -> anyhow::Result<WorkitemService> {
    let index = Arc::new(db.index_store().await?);
    let tag_source: Arc<dyn QueryTagSource> = match &config.query_tag_catalog {
        Some(path) => Arc::new(TomlQueryTagSource::new(path)),
        None => index.clone(),
    };
    let orchestrator = WorkitemOrchestrator::new(
        index,
        Arc::new(FsBlobStore::new(&config.blob_root)),
        Arc::new(QueryTagService::new(tag_source)),
    );
    Ok(WorkitemService::new(
        Arc::new(orchestrator),
        Arc::new(BaseUrlResolver::new(&config.base_url)),
    ))
}

async fn cmd_schema(db: &Db) -> anyhow::Result<()> {
    use workitem_rs::store::SchemaVersionProbe;

    let reported = db.current_version().await?;
    let store = db.index_store().await?;
    let operations = store.operations();
    println!("deployed schema: {reported}");
    println!("resolved to:     {}", operations.version());
    for operation in IndexOperation::ALL {
        println!("  {:<16} {}", operation.to_string(), operations.source_of(operation));
    }
    Ok(())
}

async fn cmd_tags(db: &Db, config: &Config) -> anyhow::Result<()> {
    let tags = match &config.query_tag_catalog {
        Some(path) => TomlQueryTagSource::new(path).get_query_tags().await?,
        None => db.index_store().await?.get_query_tags().await?,
    };
    if tags.is_empty() {
        println!("No query tags.");
        return Ok(());
    }
    println!("{:<12} {:<4} KIND", "TAG", "VR");
    for tag in tags {
        println!("{:<12} {:<4} {:?}", tag.tag.to_string(), tag.vr.to_string(), tag.kind);
    }
    Ok(())
}

async fn cmd_add(
    service: &WorkitemService,
    partition: i32,
    file: PathBuf,
    content_type: &str,
) -> anyhow::Result<()> {
    let body = tokio::fs::read(&file).await?;
    let documents: Vec<WorkitemDocument> = codec::deserialize_documents(&body, content_type)?;
    for document in documents {
        let uid = document.workitem_uid().unwrap_or("<missing>").to_string();
        let outcome = service.process_add(partition, document).await?;
        print!("{uid}: ");
        print_outcome(&outcome)?;
    }
    Ok(())
}

fn print_outcome(outcome: &Outcome) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

/// A fresh UID under the `2.25` root, derived from a random UUID.
fn new_transaction_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}
