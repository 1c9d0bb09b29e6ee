/// Everything the indexer needs, resolved once at startup and passed through
/// construction instead of read ambiently.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket endpoint of the chain node (ws:// or wss://).
    pub rpc_url: String,
    /// Staking contract whose logs are ingested.
    pub contract_address: String,
    /// SQLite database path.
    pub db_path: String,
}
