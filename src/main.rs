//! `resilient-store` binary.
//!
//! ```bash
//! resilient-store --seed records.json list
//! resilient-store --seed records.json --fallback fallback.json --offline get web-01
//! resilient-store create web-03 --data '{"ip": "10.0.0.3"}'
//! ```

use clap::Parser;
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error};

use resilient_store::cli::{Cli, Command};
use resilient_store::{
    logging, DataError, DataResult, DataService, MemoryStore, NewRecord, Record, RecordPatch,
    ResilientService, ServiceConfig, StaticFallback,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = ServiceConfig::from_env();
    logging::init(&config.logging);

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: ServiceConfig) -> DataResult<()> {
    let store = match &cli.seed {
        Some(path) => {
            let records: Vec<Record> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            debug!(count = records.len(), "seeding store");
            MemoryStore::with_records(records)
        }
        None => MemoryStore::new(),
    };

    let mut builder = ResilientService::builder(store.clone()).config(config);
    if let Some(path) = &cli.fallback {
        builder = builder.fallback(Arc::new(StaticFallback::from_path(path)?));
    }
    let service = builder.build();

    if cli.warm {
        service.warm_up().await?;
    }
    if cli.offline {
        store.set_available(false);
    }

    let result = execute(&service, cli.command).await;
    service.shutdown().await;
    result
}

async fn execute(service: &ResilientService<MemoryStore>, command: Command) -> DataResult<()> {
    match command {
        Command::Get { key } => print(&service.lookup(&key).await?),
        Command::GetId { id } => print(&service.get_by_id(&id).await?),
        Command::List => print(&service.get_all().await?),
        Command::Create { key, data } => print(&service.create(NewRecord::new(key, data)).await?),
        Command::Update { id, key, data } => {
            let patch = RecordPatch { key, data };
            print(&service.update(&id, patch).await?)
        }
        Command::Delete { id } => {
            service.delete(&id).await?;
            print(&serde_json::json!({ "deleted": id }))
        }
        Command::CheckKey { key } => {
            let unique = service.validate_unique_key(&key).await?;
            print(&serde_json::json!({ "key": key, "unique": unique }))
        }
        Command::Health => {
            let snapshot = service.health_snapshot().await;
            print(&serde_json::json!({ "status": snapshot.status(), "snapshot": snapshot }))
        }
    }
}

fn print<T: Serialize>(value: &T) -> DataResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(DataError::from)?;
    println!("{}", json);
    Ok(())
}
