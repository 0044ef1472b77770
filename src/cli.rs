use clap::{Parser, Subcommand};

/// crawl-fleet cli
#[derive(Parser)]
#[command(name = "crawl-fleet")]
#[command(about = "Distributed control plane for crawling paginated commerce listings")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the manager: partitions the page range across general workers
    Manager,

    /// Run a general worker: opens tab batches over its assigned range
    General {
        /// worker id, unique per general instance
        #[arg(short, long, env = "WORKER_ID", help = "Instance id in 1..=20")]
        id: u32,
    },

    /// Run a product worker: extracts records from open listing tabs
    Product {
        /// worker id, unique per product instance
        #[arg(short, long, env = "WORKER_ID", help = "Instance id in 1..=20")]
        id: u32,
    },

    /// Delete every coordinator key under the configured namespace
    Reset,

    /// Print the coordinator namespace as key = value lines
    Status,
}

impl Cli {
    /// parse args
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
