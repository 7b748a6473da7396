//! Cassandra Backup/Restore Tool
//!
//! Provides CLI interface for node-level and cluster-wide backup and restore

// cassandratool/src/main.rs
use anyhow::{Context, Result};
use cassandratool::cassandra::Nodetool;
use cassandratool::config::{AppConfig, load_request_from_json, parse_request};
use cassandratool::coordinator::{CommandDispatcher, Coordinator};
use cassandratool::request::{
    EnvironmentSecretResolver, OperationRequest, ValidatedOperation, ValidationEnvironment,
};
use cassandratool::storage::create_client;
use cassandratool::{backup, restore};
use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_REQUEST_FILE: &str = "request.json";

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = PathBuf::from("config.json");
    let app_config = AppConfig::load_from_json(&config_path)
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };
    let operation = match choice.as_str() {
        "1" | "backup" => "backup",
        "2" | "restore" => "restore",
        _ => {
            println!("❌ Invalid choice. Please enter '1' (backup) or '2' (restore).");
            anyhow::bail!("Invalid operation choice");
        }
    };

    let request_arg = args.get(2).map(String::as_str).unwrap_or(DEFAULT_REQUEST_FILE);
    let request = read_request(operation, request_arg)?;

    let secrets = EnvironmentSecretResolver;
    let validated = request
        .validate(&ValidationEnvironment {
            supported_providers: &app_config.supported_providers,
            secrets: &secrets,
        })
        .context("Request validation failed")?;

    let storage = create_client(
        &validated.base().storage_location,
        &app_config.s3,
        validated.base().insecure,
    )
    .await
    .context("Failed to create storage client")?;

    if validated.is_global() {
        println!("🌐 Coordinating global {} across the cluster...", operation);
        let topology = app_config.load_topology()?;
        let command = app_config
            .dispatch_command
            .clone()
            .context("dispatch_command must be set in config.json for global requests")?;
        let coordinator = Coordinator::new(Arc::new(CommandDispatcher::new(command)), storage, topology);
        let result = coordinator
            .execute(&validated)
            .await
            .context("Global operation failed")?;
        println!("Operation {} finished on {} nodes", result.operation_id, result.nodes.len());
        return Ok(());
    }

    let node = Nodetool::locate(app_config.nodetool_path.as_deref(), app_config.cqlsh_path.as_deref())?;
    match validated.split() {
        ValidatedOperation::Backup(mut request) => {
            println!("🚀 Starting Backup Process...");
            // Only needed when a single node is asked to publish the topology itself.
            let topology = if request.upload_cluster_topology {
                Some(app_config.load_topology()?)
            } else {
                None
            };
            let summary = backup::run_backup_flow(&mut request, storage.as_ref(), &node, topology.as_ref())
                .await
                .context("Backup process failed")?;
            println!(
                "Backup '{}' of node {}: {} files, {} bytes",
                summary.snapshot_tag, summary.node_id, summary.files, summary.bytes
            );
        }
        ValidatedOperation::Restore(request) => {
            println!("🔄 Starting Restore Process...");
            let summary = restore::run_restore_flow(&request, storage.as_ref(), &node)
                .await
                .context("Restore process failed")?;
            println!(
                "Restore '{}' via {}: {} files, {} bytes",
                summary.snapshot_tag, summary.strategy, summary.files, summary.bytes
            );
        }
    }
    Ok(())
}

/// Reads the request from a file, or from stdin when the path is `-`.
fn read_request(operation: &str, request_arg: &str) -> Result<OperationRequest> {
    if request_arg == "-" {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .context("Failed to read request from stdin")?;
        return parse_request(operation, &content);
    }
    load_request_from_json(operation, Path::new(request_arg))
}

/// Prompts user to select backup or restore operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
