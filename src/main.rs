use std::sync::Arc;

use crawl_fleet::browser::{HttpBrowser, HttpBrowserConfig};
use crawl_fleet::cli::{Cli, Commands};
use crawl_fleet::config::Settings;
use crawl_fleet::coordinator::{reset_namespace, Kv, RedisKv};
use crawl_fleet::general::GeneralWorker;
use crawl_fleet::keys::Keyspace;
use crawl_fleet::logging::init_logging;
use crawl_fleet::manager::Manager;
use crawl_fleet::product::ProductWorker;
use crawl_fleet::shutdown::spawn_ctrl_c_handler;
use crawl_fleet::storage::SqliteStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse_args();
    let settings = Settings::from_env();

    match cli.command {
        Commands::Manager => {
            init_logging("logs", "manager")?;
            run_manager(settings).await
        }
        Commands::General { id } => {
            init_logging("logs", &format!("general-{}", id))?;
            run_general(settings, id).await
        }
        Commands::Product { id } => {
            init_logging("logs", &format!("product-{}", id))?;
            run_product(settings, id).await
        }
        Commands::Reset => run_reset(settings).await,
        Commands::Status => run_status(settings).await,
    }
}

async fn connect(settings: &Settings) -> Result<Arc<RedisKv>, Box<dyn std::error::Error>> {
    Ok(Arc::new(RedisKv::connect(&settings.coordinator_url).await?))
}

async fn run_manager(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let kv = connect(&settings).await?;
    let manager = Manager::new(kv, settings);

    if let Err(e) = manager.start().await {
        tracing::error!(error = %e, "manager startup failed");
        std::process::exit(1);
    }

    let shutdown = spawn_ctrl_c_handler();
    manager.run(shutdown).await?;
    Ok(())
}

async fn run_general(settings: Settings, id: u32) -> Result<(), Box<dyn std::error::Error>> {
    let kv = connect(&settings).await?;
    let browser = Arc::new(HttpBrowser::new(HttpBrowserConfig::from_settings(&settings))?);
    let worker = GeneralWorker::new(kv, browser, settings, id);

    if let Err(e) = worker.start().await {
        tracing::error!(id, error = %e, "general worker startup failed");
        std::process::exit(1);
    }

    let shutdown = spawn_ctrl_c_handler();
    worker.run(shutdown).await?;
    Ok(())
}

async fn run_product(settings: Settings, id: u32) -> Result<(), Box<dyn std::error::Error>> {
    let kv = connect(&settings).await?;
    let browser = Arc::new(HttpBrowser::new(HttpBrowserConfig::from_settings(&settings))?);
    let store = Arc::new(SqliteStore::connect(&settings.database_url).await?);
    let worker = ProductWorker::new(kv, browser, store, settings, id);

    if let Err(e) = worker.start().await {
        tracing::error!(id, error = %e, "product worker startup failed");
        std::process::exit(1);
    }

    let shutdown = spawn_ctrl_c_handler();
    worker.run(shutdown).await?;
    Ok(())
}

async fn run_reset(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let kv = connect(&settings).await?;
    let keys = Keyspace::new(&settings.namespace);
    let removed = reset_namespace(kv.as_ref(), &keys.prefix()).await?;
    println!("Removed {} keys under {}", removed, keys.prefix());
    Ok(())
}

async fn run_status(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let kv = connect(&settings).await?;
    let keys = Keyspace::new(&settings.namespace);

    let mut names = kv.scan_prefix(&keys.prefix()).await?;
    names.sort();
    if names.is_empty() {
        println!("Namespace {} is empty", keys.prefix());
        return Ok(());
    }
    for name in names {
        let value = kv.get(&name).await?.unwrap_or_default();
        println!("{} = {}", name, value);
    }
    Ok(())
}
