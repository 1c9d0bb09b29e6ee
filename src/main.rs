mod config;
mod db;
mod indexer;
mod models;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;

use config::Config;
use db::LedgerStore;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// SQLite DB path
    #[arg(short, long, default_value = "staking_events.db")]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to the staking contract and ingest its events
    Index {
        /// Chain node WebSocket URL (ws://...). Falls back to ETH_NODE_WS.
        #[arg(short, long)]
        rpc: Option<String>,

        /// Staking contract address. Falls back to STAKING_CONTRACT_ADDRESS.
        #[arg(short, long)]
        contract: Option<String>,
    },
    /// Print the current total value locked as a decimal string
    Tvl,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Index { rpc, contract } => {
            let rpc_url = rpc
                .or_else(|| std::env::var("ETH_NODE_WS").ok())
                .context("provide the node URL via --rpc or ETH_NODE_WS")?;
            let contract_address = contract
                .or_else(|| std::env::var("STAKING_CONTRACT_ADDRESS").ok())
                .context("provide the contract via --contract or STAKING_CONTRACT_ADDRESS")?;
            let config = Config {
                rpc_url,
                contract_address,
                db_path: cli.db_path,
            };

            let mut store = LedgerStore::open(&config.db_path)?;
            indexer::run(&config, &mut store).await
        }

        Commands::Tvl => {
            // Opening the store recomputes the aggregate from the stored rows.
            let store = LedgerStore::open(&cli.db_path)?;
            println!("{}", store.total_value_locked());
            Ok(())
        }
    }
}
