//! Catalog Sync operator binary
//!
//! Validates a JSON-lines record file through the streaming processor and the
//! batch engine, then prints the run summary as JSON.
//!
//! Usage: catalog-sync <records.jsonl> [--config <file>] [--required sku,title,price]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::{error, info};

use catalog_sync::application::{CatalogRecord, RequiredFieldsValidator, SyncEngine};
use catalog_sync::domain::FieldMap;
use catalog_sync::infrastructure::logging::log_system_info;
use catalog_sync::infrastructure::{AppConfig, InMemoryPlatform, init_logging_with_config};

/// Validate a JSON-lines catalog file through the sync batch engine
#[derive(Parser, Debug)]
#[command(name = "catalog-sync", version)]
struct Args {
    /// JSON-lines file with one catalog record per line
    records: PathBuf,

    /// Configuration file layered over the defaults
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Required fields (defaults to sku,title,price)
    #[arg(long, value_name = "FIELDS", value_delimiter = ',')]
    required: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let required: Vec<String> = args
        .required
        .iter()
        .map(|field| field.trim())
        .filter(|field| !field.is_empty())
        .map(str::to_string)
        .collect();
    let config = AppConfig::load(args.config.as_deref())?;
    let _log_guard = init_logging_with_config(&config.logging)?;
    log_system_info();

    // 원격 플랫폼 없이 검증만 수행하므로 메모리 내 전송 계층을 사용합니다
    let engine = SyncEngine::connect(config, InMemoryPlatform::new()).await?;
    engine.start();

    let file = tokio::fs::File::open(&args.records)
        .await
        .with_context(|| format!("cannot open {}", args.records.display()))?;
    info!("📂 Validating records from {}", args.records.display());

    let records = LinesStream::new(BufReader::new(file).lines())
        .enumerate()
        .filter_map(|(index, line)| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(CatalogRecord::parse_line(index + 1, &line)),
                Err(e) => Some(CatalogRecord {
                    line: index + 1,
                    fields: FieldMap::new(),
                    parse_error: Some(e.to_string()),
                }),
            }
        });

    let validator = if required.is_empty() {
        RequiredFieldsValidator::for_products()
    } else {
        RequiredFieldsValidator::new(required)
    };

    let result = engine.validate_records(records, validator).await;
    engine.shutdown().await;

    match result {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            info!(
                "🏁 Finished with status {} (error rate {:.1}%)",
                summary.status(),
                summary.error_rate() * 100.0
            );
            Ok(())
        }
        Err(e) => {
            error!("❌ Validation run failed: {}", e);
            Err(e.into())
        }
    }
}
